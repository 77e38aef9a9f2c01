//! Core domain types for fabric-deploy.
//!
//! This crate holds the item model shared by the endpoint client and the
//! publish orchestration: item kinds and their descriptor table, feature
//! flags, the [`Item`] record itself, and the [`Reporter`] logging seam.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Type discriminator for a deployable item.
///
/// Variants are declared in publish order; [`PUBLISH_ORDER`] is indexed by
/// the discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    VariableLibrary,
    Warehouse,
    MirroredDatabase,
    Lakehouse,
    #[serde(rename = "SQLDatabase")]
    SqlDatabase,
    Environment,
    UserDataFunction,
    Eventhouse,
    SparkJobDefinition,
    Notebook,
    SemanticModel,
    Report,
    CopyJob,
    #[serde(rename = "KQLDatabase")]
    KqlDatabase,
    #[serde(rename = "KQLQueryset")]
    KqlQueryset,
    Reflex,
    Eventstream,
    #[serde(rename = "KQLDashboard")]
    KqlDashboard,
    Dataflow,
    DataPipeline,
    #[serde(rename = "GraphQLApi")]
    GraphQlApi,
    ApacheAirflowJob,
    MountedDataFactory,
    DataAgent,
    #[serde(rename = "MLExperiment")]
    MlExperiment,
}

impl ItemKind {
    /// Name used by the REST API and in `.platform` metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::VariableLibrary => "VariableLibrary",
            ItemKind::Warehouse => "Warehouse",
            ItemKind::MirroredDatabase => "MirroredDatabase",
            ItemKind::Lakehouse => "Lakehouse",
            ItemKind::SqlDatabase => "SQLDatabase",
            ItemKind::Environment => "Environment",
            ItemKind::UserDataFunction => "UserDataFunction",
            ItemKind::Eventhouse => "Eventhouse",
            ItemKind::SparkJobDefinition => "SparkJobDefinition",
            ItemKind::Notebook => "Notebook",
            ItemKind::SemanticModel => "SemanticModel",
            ItemKind::Report => "Report",
            ItemKind::CopyJob => "CopyJob",
            ItemKind::KqlDatabase => "KQLDatabase",
            ItemKind::KqlQueryset => "KQLQueryset",
            ItemKind::Reflex => "Reflex",
            ItemKind::Eventstream => "Eventstream",
            ItemKind::KqlDashboard => "KQLDashboard",
            ItemKind::Dataflow => "Dataflow",
            ItemKind::DataPipeline => "DataPipeline",
            ItemKind::GraphQlApi => "GraphQLApi",
            ItemKind::ApacheAirflowJob => "ApacheAirflowJob",
            ItemKind::MountedDataFactory => "MountedDataFactory",
            ItemKind::DataAgent => "DataAgent",
            ItemKind::MlExperiment => "MLExperiment",
        }
    }

    /// Plural label used in section headers.
    pub fn plural_label(&self) -> &'static str {
        match self {
            ItemKind::VariableLibrary => "Variable Libraries",
            ItemKind::Warehouse => "Warehouses",
            ItemKind::MirroredDatabase => "Mirrored Databases",
            ItemKind::Lakehouse => "Lakehouses",
            ItemKind::SqlDatabase => "SQL Databases",
            ItemKind::Environment => "Environments",
            ItemKind::UserDataFunction => "User Data Functions",
            ItemKind::Eventhouse => "Eventhouses",
            ItemKind::SparkJobDefinition => "Spark Job Definitions",
            ItemKind::Notebook => "Notebooks",
            ItemKind::SemanticModel => "Semantic Models",
            ItemKind::Report => "Reports",
            ItemKind::CopyJob => "Copy Jobs",
            ItemKind::KqlDatabase => "KQL Databases",
            ItemKind::KqlQueryset => "KQL Querysets",
            ItemKind::Reflex => "Activators",
            ItemKind::Eventstream => "Eventstreams",
            ItemKind::KqlDashboard => "KQL Dashboards",
            ItemKind::Dataflow => "Dataflows",
            ItemKind::DataPipeline => "Data Pipelines",
            ItemKind::GraphQlApi => "GraphQL APIs",
            ItemKind::ApacheAirflowJob => "Apache Airflow Jobs",
            ItemKind::MountedDataFactory => "Mounted Data Factories",
            ItemKind::DataAgent => "Data Agents",
            ItemKind::MlExperiment => "ML Experiments",
        }
    }

    pub fn descriptor(&self) -> &'static KindDescriptor {
        &PUBLISH_ORDER[*self as usize]
    }

    /// All kinds in publish order.
    pub fn all() -> impl DoubleEndedIterator<Item = ItemKind> {
        PUBLISH_ORDER.iter().map(|d| d.kind)
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown item kind '{0}'")]
pub struct UnknownItemKind(pub String);

impl FromStr for ItemKind {
    type Err = UnknownItemKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemKind::all()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownItemKind(s.to_string()))
    }
}

/// Per-kind metadata that drives orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindDescriptor {
    pub kind: ItemKind,
    /// Opt-in flag required before orphans of this kind may be deleted.
    pub unpublish_flag: Option<FeatureFlag>,
    /// Remote completion is checked after every item of the kind is dispatched.
    pub async_publish_check: bool,
    /// Definition file scanned for same-kind references.
    pub dependency_file: Option<&'static str>,
    /// Only metadata is sent; the definition is managed separately.
    pub shell_only: bool,
    /// Publishing requires an assigned capacity on the workspace.
    pub requires_capacity: bool,
}

impl KindDescriptor {
    const fn plain(kind: ItemKind) -> Self {
        Self {
            kind,
            unpublish_flag: None,
            async_publish_check: false,
            dependency_file: None,
            shell_only: false,
            requires_capacity: true,
        }
    }

    const fn gated(mut self, flag: FeatureFlag) -> Self {
        self.unpublish_flag = Some(flag);
        self
    }

    const fn shell_only(mut self) -> Self {
        self.shell_only = true;
        self
    }

    const fn async_check(mut self) -> Self {
        self.async_publish_check = true;
        self
    }

    const fn tracks(mut self, file: &'static str) -> Self {
        self.dependency_file = Some(file);
        self
    }

    const fn capacity_free(mut self) -> Self {
        self.requires_capacity = false;
        self
    }

    pub fn is_destructive(&self) -> bool {
        self.unpublish_flag.is_some()
    }

    pub fn has_dependency_tracking(&self) -> bool {
        self.dependency_file.is_some()
    }
}

/// Fixed publish order. Kinds referenced by other kinds come first; unpublish
/// walks this table in reverse.
pub static PUBLISH_ORDER: [KindDescriptor; 25] = [
    KindDescriptor::plain(ItemKind::VariableLibrary),
    KindDescriptor::plain(ItemKind::Warehouse)
        .shell_only()
        .gated(FeatureFlag::EnableWarehouseUnpublish),
    KindDescriptor::plain(ItemKind::MirroredDatabase),
    KindDescriptor::plain(ItemKind::Lakehouse)
        .shell_only()
        .gated(FeatureFlag::EnableLakehouseUnpublish),
    KindDescriptor::plain(ItemKind::SqlDatabase)
        .shell_only()
        .gated(FeatureFlag::EnableSqldatabaseUnpublish),
    KindDescriptor::plain(ItemKind::Environment)
        .shell_only()
        .async_check(),
    KindDescriptor::plain(ItemKind::UserDataFunction),
    KindDescriptor::plain(ItemKind::Eventhouse).gated(FeatureFlag::EnableEventhouseUnpublish),
    KindDescriptor::plain(ItemKind::SparkJobDefinition),
    KindDescriptor::plain(ItemKind::Notebook),
    KindDescriptor::plain(ItemKind::SemanticModel).capacity_free(),
    KindDescriptor::plain(ItemKind::Report).capacity_free(),
    KindDescriptor::plain(ItemKind::CopyJob),
    KindDescriptor::plain(ItemKind::KqlDatabase),
    KindDescriptor::plain(ItemKind::KqlQueryset),
    KindDescriptor::plain(ItemKind::Reflex),
    KindDescriptor::plain(ItemKind::Eventstream),
    KindDescriptor::plain(ItemKind::KqlDashboard),
    KindDescriptor::plain(ItemKind::Dataflow).tracks("mashup.pq"),
    KindDescriptor::plain(ItemKind::DataPipeline).tracks("pipeline-content.json"),
    KindDescriptor::plain(ItemKind::GraphQlApi),
    KindDescriptor::plain(ItemKind::ApacheAirflowJob),
    KindDescriptor::plain(ItemKind::MountedDataFactory),
    KindDescriptor::plain(ItemKind::DataAgent),
    KindDescriptor::plain(ItemKind::MlExperiment),
];

/// Opt-in behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureFlag {
    EnableLakehouseUnpublish,
    EnableWarehouseUnpublish,
    EnableSqldatabaseUnpublish,
    EnableEventhouseUnpublish,
    EnableExperimentalFeatures,
    EnableItemsToInclude,
    EnableExcludeFolder,
    EnableResponseCollection,
    DisableWorkspaceFolderPublish,
    DisablePrintIdentity,
}

impl FeatureFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureFlag::EnableLakehouseUnpublish => "enable_lakehouse_unpublish",
            FeatureFlag::EnableWarehouseUnpublish => "enable_warehouse_unpublish",
            FeatureFlag::EnableSqldatabaseUnpublish => "enable_sqldatabase_unpublish",
            FeatureFlag::EnableEventhouseUnpublish => "enable_eventhouse_unpublish",
            FeatureFlag::EnableExperimentalFeatures => "enable_experimental_features",
            FeatureFlag::EnableItemsToInclude => "enable_items_to_include",
            FeatureFlag::EnableExcludeFolder => "enable_exclude_folder",
            FeatureFlag::EnableResponseCollection => "enable_response_collection",
            FeatureFlag::DisableWorkspaceFolderPublish => "disable_workspace_folder_publish",
            FeatureFlag::DisablePrintIdentity => "disable_print_identity",
        }
    }

    const ALL: [FeatureFlag; 10] = [
        FeatureFlag::EnableLakehouseUnpublish,
        FeatureFlag::EnableWarehouseUnpublish,
        FeatureFlag::EnableSqldatabaseUnpublish,
        FeatureFlag::EnableEventhouseUnpublish,
        FeatureFlag::EnableExperimentalFeatures,
        FeatureFlag::EnableItemsToInclude,
        FeatureFlag::EnableExcludeFolder,
        FeatureFlag::EnableResponseCollection,
        FeatureFlag::DisableWorkspaceFolderPublish,
        FeatureFlag::DisablePrintIdentity,
    ];
}

impl fmt::Display for FeatureFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feature flag '{0}'")]
pub struct UnknownFeatureFlag(pub String);

impl FromStr for FeatureFlag {
    type Err = UnknownFeatureFlag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureFlag::ALL
            .into_iter()
            .find(|flag| flag.as_str() == s)
            .ok_or_else(|| UnknownFeatureFlag(s.to_string()))
    }
}

/// Immutable set of enabled flags, threaded through constructors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureFlags(BTreeSet<FeatureFlag>);

impl FeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, flag: FeatureFlag) -> bool {
        self.0.contains(&flag)
    }

    pub fn insert(&mut self, flag: FeatureFlag) -> bool {
        self.0.insert(flag)
    }

    pub fn with(mut self, flag: FeatureFlag) -> Self {
        self.0.insert(flag);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = FeatureFlag> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<FeatureFlag> for FeatureFlags {
    fn from_iter<I: IntoIterator<Item = FeatureFlag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A deployable content artifact.
///
/// Kind, name and description are fixed at construction. The remote id is
/// assigned at most once, the first time the item is created remotely, so
/// concurrent workers publishing distinct items never contend on it.
#[derive(Debug)]
pub struct Item {
    kind: ItemKind,
    name: String,
    description: String,
    logical_id: String,
    path: PathBuf,
    folder_id: String,
    remote_id: OnceLock<String>,
    skipped: AtomicBool,
}

impl Item {
    pub fn new(kind: ItemKind, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            description: description.into(),
            logical_id: String::new(),
            path: PathBuf::new(),
            folder_id: String::new(),
            remote_id: OnceLock::new(),
            skipped: AtomicBool::new(false),
        }
    }

    pub fn with_logical_id(mut self, logical_id: impl Into<String>) -> Self {
        self.logical_id = logical_id.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_folder_id(mut self, folder_id: impl Into<String>) -> Self {
        self.folder_id = folder_id.into();
        self
    }

    pub fn with_remote_id(self, remote_id: impl Into<String>) -> Self {
        let remote_id = remote_id.into();
        if !remote_id.is_empty() {
            let _ = self.remote_id.set(remote_id);
        }
        self
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn folder_id(&self) -> &str {
        &self.folder_id
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.get().map(String::as_str)
    }

    pub fn is_deployed(&self) -> bool {
        self.remote_id.get().is_some()
    }

    /// Record the id returned by the create call. Returns `false` if an id was already set.
    pub fn assign_remote_id(&self, remote_id: impl Into<String>) -> bool {
        self.remote_id.set(remote_id.into()).is_ok()
    }

    pub fn mark_skipped(&self) {
        self.skipped.store(true, Ordering::Relaxed);
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.load(Ordering::Relaxed)
    }

    /// `name.Kind`, the form used by include lists.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.name, self.kind)
    }
}

impl Clone for Item {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            name: self.name.clone(),
            description: self.description.clone(),
            logical_id: self.logical_id.clone(),
            path: self.path.clone(),
            folder_id: self.folder_id.clone(),
            remote_id: self.remote_id.clone(),
            skipped: AtomicBool::new(self.is_skipped()),
        }
    }
}

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter shared across worker threads.
pub type SharedReporter = Arc<Mutex<dyn Reporter + Send>>;

/// Wrap a reporter for sharing.
pub fn shared<R: Reporter + Send + 'static>(reporter: R) -> SharedReporter {
    Arc::new(Mutex::new(reporter))
}

/// Lock-and-forward helpers for [`SharedReporter`]. A poisoned lock still reports.
pub trait ReporterHandle {
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
}

impl ReporterHandle for SharedReporter {
    fn info(&self, msg: &str) {
        self.lock().unwrap_or_else(|p| p.into_inner()).info(msg);
    }

    fn warn(&self, msg: &str) {
        self.lock().unwrap_or_else(|p| p.into_inner()).warn(msg);
    }

    fn error(&self, msg: &str) {
        self.lock().unwrap_or_else(|p| p.into_inner()).error(msg);
    }
}

/// Writes `[level] message` lines to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_order_is_indexed_by_discriminant() {
        for (index, descriptor) in PUBLISH_ORDER.iter().enumerate() {
            assert_eq!(descriptor.kind as usize, index, "{}", descriptor.kind);
            assert_eq!(descriptor.kind.descriptor(), descriptor);
        }
    }

    #[test]
    fn kind_names_roundtrip_through_from_str() {
        for kind in ItemKind::all() {
            assert_eq!(kind.as_str().parse::<ItemKind>(), Ok(kind));
        }
        assert!("Dashboard".parse::<ItemKind>().is_err());
    }

    #[test]
    fn kind_serde_matches_api_names() {
        let json = serde_json::to_string(&ItemKind::SqlDatabase).expect("serialize");
        assert_eq!(json, "\"SQLDatabase\"");
        let parsed: ItemKind = serde_json::from_str("\"KQLQueryset\"").expect("parse");
        assert_eq!(parsed, ItemKind::KqlQueryset);
        for kind in ItemKind::all() {
            let json = serde_json::to_string(&kind).expect("serialize");
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn destructive_kinds_are_gated() {
        let gated: Vec<(ItemKind, FeatureFlag)> = PUBLISH_ORDER
            .iter()
            .filter_map(|d| d.unpublish_flag.map(|f| (d.kind, f)))
            .collect();
        assert_eq!(
            gated,
            vec![
                (ItemKind::Warehouse, FeatureFlag::EnableWarehouseUnpublish),
                (ItemKind::Lakehouse, FeatureFlag::EnableLakehouseUnpublish),
                (ItemKind::SqlDatabase, FeatureFlag::EnableSqldatabaseUnpublish),
                (ItemKind::Eventhouse, FeatureFlag::EnableEventhouseUnpublish),
            ]
        );
    }

    #[test]
    fn descriptor_metadata() {
        assert!(ItemKind::Environment.descriptor().async_publish_check);
        assert!(ItemKind::Environment.descriptor().shell_only);
        assert_eq!(
            ItemKind::DataPipeline.descriptor().dependency_file,
            Some("pipeline-content.json")
        );
        assert!(ItemKind::Dataflow.descriptor().has_dependency_tracking());
        assert!(!ItemKind::Notebook.descriptor().has_dependency_tracking());
        assert!(!ItemKind::Report.descriptor().requires_capacity);
        assert!(ItemKind::Notebook.descriptor().requires_capacity);
    }

    #[test]
    fn lakehouse_precedes_notebook() {
        let order: Vec<ItemKind> = ItemKind::all().collect();
        let lakehouse = order.iter().position(|k| *k == ItemKind::Lakehouse);
        let notebook = order.iter().position(|k| *k == ItemKind::Notebook);
        assert!(lakehouse < notebook);
    }

    #[test]
    fn feature_flags_parse_and_serialize() {
        assert_eq!(
            "enable_sqldatabase_unpublish".parse::<FeatureFlag>(),
            Ok(FeatureFlag::EnableSqldatabaseUnpublish)
        );
        let flags: FeatureFlags =
            serde_json::from_str(r#"["disable_print_identity","enable_items_to_include"]"#)
                .expect("parse");
        assert!(flags.contains(FeatureFlag::DisablePrintIdentity));
        assert!(!flags.contains(FeatureFlag::EnableLakehouseUnpublish));
        for flag in FeatureFlag::ALL {
            let json = serde_json::to_string(&flag).expect("serialize");
            assert_eq!(json, format!("\"{}\"", flag.as_str()));
        }
    }

    #[test]
    fn remote_id_is_assigned_once() {
        let item = Item::new(ItemKind::Notebook, "Hello", "");
        assert!(!item.is_deployed());
        assert!(item.assign_remote_id("first"));
        assert!(!item.assign_remote_id("second"));
        assert_eq!(item.remote_id(), Some("first"));
    }

    #[test]
    fn empty_remote_id_means_not_deployed() {
        let item = Item::new(ItemKind::Notebook, "Hello", "").with_remote_id("");
        assert!(!item.is_deployed());
    }

    #[test]
    fn clone_keeps_remote_id_and_skip_state() {
        let item = Item::new(ItemKind::Report, "Sales", "desc")
            .with_logical_id("abc")
            .with_remote_id("guid");
        item.mark_skipped();
        let copy = item.clone();
        assert_eq!(copy.remote_id(), Some("guid"));
        assert_eq!(copy.logical_id(), "abc");
        assert!(copy.is_skipped());
        assert_eq!(copy.qualified_name(), "Sales.Report");
    }

    #[derive(Default)]
    struct CollectingReporter {
        infos: Vec<String>,
        warns: Vec<String>,
        errors: Vec<String>,
    }

    impl Reporter for CollectingReporter {
        fn info(&mut self, msg: &str) {
            self.infos.push(msg.to_string());
        }

        fn warn(&mut self, msg: &str) {
            self.warns.push(msg.to_string());
        }

        fn error(&mut self, msg: &str) {
            self.errors.push(msg.to_string());
        }
    }

    #[test]
    fn shared_reporter_forwards_messages() {
        let collecting = Arc::new(Mutex::new(CollectingReporter::default()));
        let reporter: SharedReporter = collecting.clone();
        reporter.info("a");
        reporter.warn("b");
        reporter.error("c");

        let seen = collecting.lock().expect("lock");
        assert_eq!(seen.infos, vec!["a"]);
        assert_eq!(seen.warns, vec!["b"]);
        assert_eq!(seen.errors, vec!["c"]);
    }
}
