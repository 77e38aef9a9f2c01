//! Whole-workspace publish and orphan cleanup.
//!
//! Kinds are published in the fixed [`PUBLISH_ORDER`] and unpublished in its
//! reverse, so items are created after what they depend on and deleted before
//! it. A kind is visited only when it is in scope and has items on the side
//! being processed.
//!
//! Unless `disable_workspace_folder_publish` is set, repository folders are
//! created before any item and empty deployed folders are removed after the
//! orphan pass.

use fabric_deploy_types::{FeatureFlag, ItemKind, PUBLISH_ORDER, ReporterHandle};
use regex::Regex;

use crate::error::{AggregateFailure, DeployError, ItemFailure, Operation};
use crate::items::publisher_for;
use crate::publisher::{PublishSummary, publish_all};
use crate::workspace::{ItemFilter, ResponseMap, Workspace};

/// Exclusion pattern that matches nothing.
pub const MATCH_NOTHING: &str = "^$";

const INCLUDE_FLAGS_MESSAGE: &str =
    "Feature flags 'enable_experimental_features' and 'enable_items_to_include' must be set.";

const FOLDER_EXCLUDE_FLAGS_MESSAGE: &str =
    "Feature flags 'enable_experimental_features' and 'enable_exclude_folder' must be set.";

/// Filters for [`publish_all_items`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Items whose name matches at the start are skipped.
    pub item_name_exclude_regex: Option<String>,
    /// `name.Kind` entries; when set only these items publish.
    pub items_to_include: Option<Vec<String>>,
    /// Items whose repository-relative directory matches anywhere are skipped.
    pub folder_path_exclude_regex: Option<String>,
}

/// Result of [`publish_all_items`].
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    /// Published kinds in publish order.
    pub kinds: Vec<(ItemKind, PublishSummary)>,
    /// Final service responses, when `enable_response_collection` is set and
    /// anything was recorded.
    pub responses: Option<ResponseMap>,
}

/// Filters for [`unpublish_all_orphan_items`].
#[derive(Debug, Clone)]
pub struct UnpublishOptions {
    pub item_name_exclude_regex: String,
    pub items_to_include: Option<Vec<String>>,
}

impl Default for UnpublishOptions {
    fn default() -> Self {
        Self {
            item_name_exclude_regex: MATCH_NOTHING.to_string(),
            items_to_include: None,
        }
    }
}

/// Kinds to publish, in publish order.
pub fn kinds_to_publish(workspace: &Workspace) -> Vec<ItemKind> {
    PUBLISH_ORDER
        .iter()
        .map(|d| d.kind)
        .filter(|kind| {
            workspace.kinds_in_scope().contains(kind) && workspace.has_repository_items(*kind)
        })
        .collect()
}

/// Kinds with deployed items to consider for cleanup, in unpublish order.
pub fn kinds_to_unpublish(workspace: &Workspace) -> Vec<ItemKind> {
    PUBLISH_ORDER
        .iter()
        .rev()
        .map(|d| d.kind)
        .filter(|kind| {
            workspace.kinds_in_scope().contains(kind)
                && workspace.deployed_items(*kind).next().is_some()
        })
        .collect()
}

/// Deployed `kind` items with no repository counterpart that `filter` lets through.
pub fn orphaned_items(workspace: &Workspace, kind: ItemKind, filter: &ItemFilter) -> Vec<String> {
    workspace
        .deployed_items(kind)
        .filter(|item| workspace.repository_item(kind, item.name()).is_none())
        .filter(|item| match filter.include {
            Some(_) => filter.includes(item),
            None => !filter.excludes(item.name()),
        })
        .map(|item| item.name().to_string())
        .collect()
}

fn compile(pattern: &str) -> Result<Regex, DeployError> {
    Regex::new(pattern)
        .map_err(|e| DeployError::InvalidInput(format!("Invalid regex pattern '{pattern}': {e}")))
}

fn check_experimental_flag(
    workspace: &Workspace,
    flag: FeatureFlag,
    message: &str,
) -> Result<(), DeployError> {
    let flags = workspace.flags();
    if flags.contains(FeatureFlag::EnableExperimentalFeatures) && flags.contains(flag) {
        Ok(())
    } else {
        Err(DeployError::InvalidInput(message.to_string()))
    }
}

fn check_include_flags(workspace: &Workspace) -> Result<(), DeployError> {
    check_experimental_flag(workspace, FeatureFlag::EnableItemsToInclude, INCLUDE_FLAGS_MESSAGE)
}

fn print_header(workspace: &Workspace, title: &str) {
    let rule = "#".repeat(title.len() + 8);
    let reporter = workspace.reporter();
    reporter.info(&rule);
    reporter.info(&format!("### {title} ###"));
    reporter.info(&rule);
}

/// Whether any kind in scope needs a capacity to publish.
fn requires_capacity(workspace: &Workspace) -> bool {
    workspace
        .kinds_in_scope()
        .iter()
        .any(|kind| kind.descriptor().requires_capacity)
}

/// Publish every in-scope repository item, kind by kind.
///
/// The first kind that fails aborts the run with its error; items of later
/// kinds are not attempted.
pub fn publish_all_items(
    workspace: &mut Workspace,
    options: &PublishOptions,
) -> Result<PublishReport, DeployError> {
    let mut filter = ItemFilter::default();
    if let Some(pattern) = &options.item_name_exclude_regex {
        filter.exclude = Some(compile(pattern)?);
        workspace.reporter().warn(
            "Using item_name_exclude_regex is risky as it can prevent needed dependencies from being deployed.  Use at your own risk.",
        );
    }
    if let Some(include) = &options.items_to_include {
        check_include_flags(workspace)?;
        workspace.reporter().warn("Selective deployment is enabled.");
        workspace.reporter().warn(
            "Using items_to_include is risky as it can prevent needed dependencies from being deployed.  Use at your own risk.",
        );
        filter.include = Some(include.clone());
    }
    if let Some(pattern) = &options.folder_path_exclude_regex {
        check_experimental_flag(
            workspace,
            FeatureFlag::EnableExcludeFolder,
            FOLDER_EXCLUDE_FLAGS_MESSAGE,
        )?;
        filter.folder_exclude = Some(compile(pattern)?);
        workspace.reporter().warn("Folder path exclusion is enabled.");
        workspace.reporter().warn(
            "Using folder_path_exclude_regex is risky as it can prevent needed dependencies from being deployed.  Use at your own risk.",
        );
    }

    if workspace
        .flags()
        .contains(FeatureFlag::EnableResponseCollection)
    {
        workspace.start_response_collection();
    }

    if requires_capacity(workspace) && !workspace.has_capacity()? {
        return Err(DeployError::CapacityMissing(
            workspace.workspace_id().to_string(),
        ));
    }

    if workspace.folders_enabled() {
        workspace.refresh_deployed_folders()?;
        workspace.refresh_repository_folders()?;
        print_header(workspace, "Publishing Workspace Folders");
        workspace.publish_folders()?;
    }

    workspace.refresh_deployed_items()?;
    workspace.refresh_repository_items()?;
    workspace.set_publish_filter(filter);

    let kinds = kinds_to_publish(workspace);
    let mut summaries = Vec::with_capacity(kinds.len());
    for kind in &kinds {
        print_header(workspace, &format!("Publishing {}", kind.plural_label()));
        let summary = publish_all(publisher_for(*kind).as_ref(), workspace)?;
        summaries.push((*kind, summary));
    }

    for kind in kinds
        .iter()
        .filter(|kind| kind.descriptor().async_publish_check)
    {
        print_header(workspace, &format!("Checking {kind} Publish State"));
        publisher_for(*kind).post_publish_all_check(workspace)?;
    }

    let responses = workspace.take_responses().filter(|map| !map.is_empty());
    Ok(PublishReport {
        kinds: summaries,
        responses,
    })
}

/// Delete deployed in-scope items that are no longer in the repository.
///
/// Every kind is attempted. Per-item failures are collected and returned
/// together once the pass has finished.
pub fn unpublish_all_orphan_items(
    workspace: &mut Workspace,
    options: &UnpublishOptions,
) -> Result<Vec<(ItemKind, Vec<String>)>, DeployError> {
    let mut filter = ItemFilter {
        exclude: Some(compile(&options.item_name_exclude_regex)?),
        include: None,
        folder_exclude: None,
    };

    workspace.refresh_deployed_items()?;
    workspace.refresh_repository_items()?;
    print_header(workspace, "Unpublishing Orphaned Items");

    if let Some(include) = &options.items_to_include {
        check_include_flags(workspace)?;
        workspace.reporter().warn("Selective unpublish is enabled.");
        workspace.reporter().warn(
            "Using items_to_include is risky as it can prevent needed dependencies from being unpublished.  Use at your own risk.",
        );
        filter.include = Some(include.clone());
    }
    workspace.set_unpublish_filter(filter.clone());

    let mut removed = Vec::new();
    let mut failed = Vec::new();
    for kind in kinds_to_unpublish(workspace) {
        if let Some(flag) = kind.descriptor().unpublish_flag
            && !workspace.flags().contains(flag)
        {
            workspace.reporter().warn(&format!(
                "Skipping unpublish for {kind} items because the '{flag}' feature flag is not enabled."
            ));
            continue;
        }

        let candidates = orphaned_items(workspace, kind, &filter);
        if candidates.is_empty() {
            continue;
        }
        let order = if kind.descriptor().has_dependency_tracking() {
            match publisher_for(kind).unpublish_order(workspace, candidates.clone()) {
                Ok(order) => order,
                Err(error) => {
                    workspace.reporter().error(&format!(
                        "Failed to determine unpublish order for {kind} items: {error}"
                    ));
                    failed.push(AggregateFailure {
                        operation: Operation::Unpublish,
                        kind,
                        attempted: Vec::new(),
                        failures: vec![ItemFailure {
                            name: kind.to_string(),
                            error,
                        }],
                    });
                    continue;
                }
            }
        } else {
            candidates
        };

        let (deleted, failure) = unpublish_kind(workspace, kind, &order);
        if !deleted.is_empty() {
            removed.push((kind, deleted));
        }
        failed.extend(failure);
    }

    workspace.refresh_deployed_items()?;
    if workspace.folders_enabled() {
        workspace.refresh_deployed_folders()?;
        workspace.unpublish_folders();
    }

    if failed.is_empty() {
        Ok(removed)
    } else {
        Err(DeployError::Unpublish(failed))
    }
}

/// Delete `order` one by one; failures do not stop later items.
fn unpublish_kind(
    workspace: &Workspace,
    kind: ItemKind,
    order: &[String],
) -> (Vec<String>, Option<AggregateFailure>) {
    let mut deleted = Vec::new();
    let mut failures = Vec::new();
    for name in order {
        let Some(item) = workspace.deployed_item(kind, name) else {
            continue;
        };
        match workspace.unpublish_item(item) {
            Ok(true) => deleted.push(name.clone()),
            Ok(false) => {}
            Err(error) => {
                workspace
                    .reporter()
                    .error(&format!("Failed to unpublish {kind} '{name}': {error}"));
                failures.push(ItemFailure {
                    name: name.clone(),
                    error,
                });
            }
        }
    }

    let failure = (!failures.is_empty()).then(|| AggregateFailure {
        operation: Operation::Unpublish,
        kind,
        attempted: order.to_vec(),
        failures,
    });
    (deleted, failure)
}
