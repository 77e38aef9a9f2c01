//! Repository and deployed item state for one target workspace.
//!
//! Also holds the create-or-update and delete primitives every per-kind
//! publisher builds on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use fabric_deploy_endpoint::EndpointClient;
use fabric_deploy_retry::INDENT;
use fabric_deploy_types::{
    FeatureFlag, FeatureFlags, Item, ItemKind, ReporterHandle, SharedReporter,
};
use regex::Regex;
use serde_json::{Map, Value, json};

use crate::error::DeployError;
use crate::{folders, references};

pub const DEFAULT_API_ROOT_URL: &str = "https://api.powerbi.com";

/// Metadata file that marks a directory as an item.
pub const PLATFORM_FILE: &str = ".platform";

type ItemMap = BTreeMap<ItemKind, BTreeMap<String, Item>>;

/// Final service answer per kind and item name.
pub type ResponseMap = BTreeMap<ItemKind, BTreeMap<String, Value>>;

/// Rewrites a text file of an item before upload.
///
/// Runs after logical ids are resolved and before the placeholder workspace
/// id is replaced.
pub trait ContentProcessor: Send + Sync {
    fn process(&self, item: &Item, file: &Path, content: String) -> Result<String, DeployError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl ContentProcessor for PassThrough {
    fn process(&self, _item: &Item, _file: &Path, content: String) -> Result<String, DeployError> {
        Ok(content)
    }
}

/// Name-exclusion regex, folder-exclusion regex and `name.Kind` include list.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub exclude: Option<Regex>,
    pub include: Option<Vec<String>>,
    /// Searched anywhere in the item directory's repository-relative path.
    pub folder_exclude: Option<Regex>,
}

impl ItemFilter {
    /// Whether the exclusion regex matches at the start of `name`.
    pub fn excludes(&self, name: &str) -> bool {
        self.exclude
            .as_ref()
            .and_then(|re| re.find(name))
            .is_some_and(|m| m.start() == 0)
    }

    /// Whether the folder-exclusion regex matches `relative_path`, e.g.
    /// `legacy/Old.Notebook`.
    pub fn excludes_folder(&self, relative_path: &str) -> bool {
        self.folder_exclude
            .as_ref()
            .is_some_and(|re| re.is_match(relative_path))
    }

    /// Whether `item` is on the include list. Without a list everything is.
    pub fn includes(&self, item: &Item) -> bool {
        match &self.include {
            None => true,
            Some(list) => {
                let qualified = item.qualified_name().to_lowercase();
                list.iter().any(|entry| entry.to_lowercase() == qualified)
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.exclude.is_some() || self.include.is_some() || self.folder_exclude.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Created,
    Updated,
    Skipped,
}

/// Where an embedded identifier is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Match logical ids of repository items.
    Repository,
    /// Match remote ids of deployed items.
    Deployed,
}

pub struct Workspace {
    workspace_id: String,
    api_root_url: String,
    repository_directory: PathBuf,
    kinds_in_scope: BTreeSet<ItemKind>,
    flags: FeatureFlags,
    endpoint: EndpointClient,
    reporter: SharedReporter,
    processor: Arc<dyn ContentProcessor>,
    publish_filter: ItemFilter,
    unpublish_filter: ItemFilter,
    repository: ItemMap,
    deployed: ItemMap,
    /// Folder path to id; ids stay empty until the folder is published.
    repository_folders: BTreeMap<String, String>,
    deployed_folders: BTreeMap<String, String>,
    responses: Option<Mutex<ResponseMap>>,
}

impl Workspace {
    pub fn new(
        workspace_id: impl Into<String>,
        repository_directory: impl Into<PathBuf>,
        endpoint: EndpointClient,
    ) -> Self {
        let reporter = endpoint.reporter().clone();
        Self {
            workspace_id: workspace_id.into(),
            api_root_url: DEFAULT_API_ROOT_URL.to_string(),
            repository_directory: repository_directory.into(),
            kinds_in_scope: ItemKind::all().collect(),
            flags: FeatureFlags::default(),
            endpoint,
            reporter,
            processor: Arc::new(PassThrough),
            publish_filter: ItemFilter::default(),
            unpublish_filter: ItemFilter::default(),
            repository: BTreeMap::new(),
            deployed: BTreeMap::new(),
            repository_folders: BTreeMap::new(),
            deployed_folders: BTreeMap::new(),
            responses: None,
        }
    }

    pub fn with_api_root_url(mut self, url: impl Into<String>) -> Self {
        self.api_root_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_kinds_in_scope(mut self, kinds: impl IntoIterator<Item = ItemKind>) -> Self {
        self.kinds_in_scope = kinds.into_iter().collect();
        self
    }

    pub fn with_flags(mut self, flags: FeatureFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn ContentProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// `{root}/v1/workspaces/{id}`
    pub fn base_api_url(&self) -> String {
        format!("{}/v1/workspaces/{}", self.api_root_url, self.workspace_id)
    }

    pub fn repository_directory(&self) -> &Path {
        &self.repository_directory
    }

    pub fn kinds_in_scope(&self) -> &BTreeSet<ItemKind> {
        &self.kinds_in_scope
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    pub fn endpoint(&self) -> &EndpointClient {
        &self.endpoint
    }

    pub fn reporter(&self) -> &SharedReporter {
        &self.reporter
    }

    pub fn publish_filter(&self) -> &ItemFilter {
        &self.publish_filter
    }

    pub fn set_publish_filter(&mut self, filter: ItemFilter) {
        self.publish_filter = filter;
    }

    pub fn unpublish_filter(&self) -> &ItemFilter {
        &self.unpublish_filter
    }

    pub fn set_unpublish_filter(&mut self, filter: ItemFilter) {
        self.unpublish_filter = filter;
    }

    /// Whether items are placed into workspace folders.
    pub fn folders_enabled(&self) -> bool {
        !self.flags.contains(FeatureFlag::DisableWorkspaceFolderPublish)
    }

    pub fn repository_folders(&self) -> &BTreeMap<String, String> {
        &self.repository_folders
    }

    pub fn deployed_folders(&self) -> &BTreeMap<String, String> {
        &self.deployed_folders
    }

    /// Record the final response of every published item from now on.
    pub fn start_response_collection(&mut self) {
        self.responses = Some(Mutex::new(ResponseMap::new()));
    }

    /// Responses recorded since [`Self::start_response_collection`].
    pub fn take_responses(&mut self) -> Option<ResponseMap> {
        self.responses
            .take()
            .map(|map| map.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    fn record_response(&self, item: &Item, response: Value) {
        if let Some(responses) = &self.responses {
            responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(item.kind())
                .or_default()
                .insert(item.name().to_string(), response);
        }
    }

    pub fn repository_items(&self, kind: ItemKind) -> impl Iterator<Item = &Item> {
        self.repository.get(&kind).into_iter().flat_map(BTreeMap::values)
    }

    pub fn deployed_items(&self, kind: ItemKind) -> impl Iterator<Item = &Item> {
        self.deployed.get(&kind).into_iter().flat_map(BTreeMap::values)
    }

    pub fn repository_item(&self, kind: ItemKind, name: &str) -> Option<&Item> {
        self.repository.get(&kind).and_then(|items| items.get(name))
    }

    pub fn deployed_item(&self, kind: ItemKind, name: &str) -> Option<&Item> {
        self.deployed.get(&kind).and_then(|items| items.get(name))
    }

    pub fn has_repository_items(&self, kind: ItemKind) -> bool {
        self.repository.get(&kind).is_some_and(|items| !items.is_empty())
    }

    /// Register a repository item directly, bypassing the directory scan.
    pub fn insert_repository_item(&mut self, item: Item) {
        self.repository
            .entry(item.kind())
            .or_default()
            .insert(item.name().to_string(), item);
    }

    /// Register a deployed item directly, bypassing the items listing.
    pub fn insert_deployed_item(&mut self, item: Item) {
        self.deployed
            .entry(item.kind())
            .or_default()
            .insert(item.name().to_string(), item);
    }

    /// Name of the `kind` item that `id` identifies.
    pub fn resolve_name(&self, kind: ItemKind, id: &str, mode: LookupMode) -> Option<&str> {
        match mode {
            LookupMode::Repository => self
                .repository_items(kind)
                .find(|item| item.logical_id() == id)
                .map(Item::name),
            LookupMode::Deployed => self
                .deployed_items(kind)
                .find(|item| item.remote_id() == Some(id))
                .map(Item::name),
        }
    }

    /// Reload the deployed item listing, following continuation pages.
    pub fn refresh_deployed_items(&mut self) -> Result<(), DeployError> {
        let mut deployed: ItemMap = BTreeMap::new();
        let mut url = format!("{}/items", self.base_api_url());

        loop {
            let response = self.endpoint.get(&url)?;
            let values = response.body.get("value").and_then(Value::as_array);
            for value in values.into_iter().flatten() {
                let Ok(kind) = str_field(value, "type").parse::<ItemKind>() else {
                    continue;
                };
                let name = str_field(value, "displayName");
                let item = Item::new(kind, name, str_field(value, "description"))
                    .with_folder_id(str_field(value, "folderId"))
                    .with_remote_id(str_field(value, "id"));
                deployed
                    .entry(kind)
                    .or_default()
                    .insert(name.to_string(), item);
            }

            match response.str_at("/continuationUri") {
                Some(next) if !next.is_empty() => url = next.to_string(),
                _ => break,
            }
        }

        for (kind, items) in &self.repository {
            for (name, item) in items {
                if let Some(id) = deployed
                    .get(kind)
                    .and_then(|found| found.get(name))
                    .and_then(Item::remote_id)
                {
                    item.assign_remote_id(id);
                }
            }
        }

        self.deployed = deployed;
        Ok(())
    }

    /// Reload the deployed folder listing as full path to id.
    pub fn refresh_deployed_folders(&mut self) -> Result<(), DeployError> {
        let mut listing = Vec::new();
        let mut url = format!("{}/folders", self.base_api_url());
        loop {
            let response = self.endpoint.get(&url)?;
            if let Some(values) = response.body.get("value").and_then(Value::as_array) {
                listing.extend(values.iter().cloned());
            }
            match response.str_at("/continuationUri") {
                Some(next) if !next.is_empty() => url = next.to_string(),
                _ => break,
            }
        }
        self.deployed_folders = folders::folder_paths(&listing);
        Ok(())
    }

    /// Collect the repository directories that hold items as folder paths.
    pub fn refresh_repository_folders(&mut self) -> Result<(), DeployError> {
        let mut platform_files = Vec::new();
        find_platform_files(&self.repository_directory, &mut platform_files)?;
        let item_dirs: Vec<PathBuf> = platform_files
            .iter()
            .filter_map(|file| file.parent().map(Path::to_path_buf))
            .collect();
        self.repository_folders =
            folders::repository_folder_paths(&self.repository_directory, &item_dirs)
                .into_iter()
                .map(|path| (path, String::new()))
                .collect();
        Ok(())
    }

    /// Create missing repository folders, parents before children.
    ///
    /// Folders that already exist take their deployed id.
    pub fn publish_folders(&mut self) -> Result<(), DeployError> {
        let mut paths: Vec<String> = self.repository_folders.keys().cloned().collect();
        paths.sort_by_key(|path| folders::depth(path));

        for path in paths {
            if let Some(id) = self.deployed_folders.get(&path) {
                self.repository_folders.insert(path, id.clone());
                continue;
            }

            let name = folders::folder_name(&path);
            folders::check_folder_name(name)?;
            let mut body = json!({ "displayName": name });
            if let Some(parent) = self
                .repository_folders
                .get(folders::parent_path(&path))
                .filter(|id| !id.is_empty())
            {
                body["parentFolderId"] = json!(parent);
            }

            let response = self
                .endpoint
                .post(&format!("{}/folders", self.base_api_url()), Some(body))?;
            let Some(id) = response.str_at("/id") else {
                return Err(DeployError::InvalidInput(format!(
                    "Create response for folder '{path}' did not include an id"
                )));
            };
            let id = id.to_string();
            self.reporter.info(&format!("{INDENT}Published folder '{path}'"));
            self.repository_folders.insert(path, id);
        }

        self.reporter.info(&format!("{INDENT}Published"));
        Ok(())
    }

    /// Delete deployed folders that hold no items, deepest first.
    ///
    /// Ancestors of a folder that still holds items are kept. A failed
    /// delete is reported and the pass continues.
    pub fn unpublish_folders(&self) {
        let used: BTreeSet<String> = self
            .deployed
            .values()
            .flat_map(BTreeMap::values)
            .map(Item::folder_id)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        let orphans = folders::orphaned_folders(&self.deployed_folders, &used);
        if orphans.is_empty() {
            return;
        }

        self.reporter.info("Unpublishing Workspace Folders");
        for id in orphans {
            if let Err(e) = self
                .endpoint
                .delete(&format!("{}/folders/{id}", self.base_api_url()))
            {
                self.reporter
                    .warn(&format!("Failed to unpublish folder {id}: {e}"));
            }
        }
        self.reporter.info(&format!("{INDENT}Unpublished"));
    }

    /// Rescan the repository directory for items.
    ///
    /// Items below a published folder take its id unless folder publishing
    /// is disabled.
    pub fn refresh_repository_items(&mut self) -> Result<(), DeployError> {
        let mut platform_files = Vec::new();
        find_platform_files(&self.repository_directory, &mut platform_files)?;

        let mut repository: ItemMap = BTreeMap::new();
        let mut seen_logical_ids = BTreeSet::new();
        let mut empty_logical_ids = Vec::new();

        for platform in platform_files {
            let text = fs::read_to_string(&platform).map_err(|e| {
                DeployError::io(format!("Failed to read {}", platform.display()), e)
            })?;
            let metadata: Value = serde_json::from_str(&text).map_err(|e| {
                DeployError::json(format!("Failed to parse {}", platform.display()), e)
            })?;

            let kind_name = metadata.pointer("/metadata/type").and_then(Value::as_str);
            let name = metadata
                .pointer("/metadata/displayName")
                .and_then(Value::as_str);
            let (Some(kind_name), Some(name)) = (kind_name, name) else {
                return Err(DeployError::repository(
                    &platform,
                    format!("displayName & type are required in {}", platform.display()),
                ));
            };

            let logical_id = metadata
                .pointer("/config/logicalId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim();
            if logical_id.is_empty() {
                empty_logical_ids.push(platform);
                continue;
            }
            if !seen_logical_ids.insert(logical_id.to_string()) {
                return Err(DeployError::repository(
                    &platform,
                    format!(
                        "Duplicate logicalId '{logical_id}' found in {}",
                        platform.display()
                    ),
                ));
            }

            let Ok(kind) = kind_name.parse::<ItemKind>() else {
                self.reporter.warn(&format!(
                    "Skipping unknown item type '{kind_name}' in {}",
                    platform.display()
                ));
                continue;
            };

            let description = metadata
                .pointer("/metadata/description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let directory = platform
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.repository_directory.clone());
            let folder_id = if self.folders_enabled() {
                let relative = folders::relative_folder_path(&self.repository_directory, &directory);
                self.repository_folders
                    .get(folders::parent_path(&relative))
                    .cloned()
                    .unwrap_or_default()
            } else {
                String::new()
            };
            let mut item = Item::new(kind, name, description)
                .with_logical_id(logical_id)
                .with_folder_id(folder_id)
                .with_path(directory);
            if let Some(id) = self.deployed_item(kind, name).and_then(Item::remote_id) {
                item = item.with_remote_id(id);
            }
            repository
                .entry(kind)
                .or_default()
                .insert(name.to_string(), item);
        }

        match empty_logical_ids.as_slice() {
            [] => {}
            [only] => {
                return Err(DeployError::repository(
                    only,
                    format!("logicalId cannot be empty in {}", only.display()),
                ));
            }
            many => {
                let list = many
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join("\n  - ");
                return Err(DeployError::repository(
                    &self.repository_directory,
                    format!("logicalId cannot be empty in the following files:\n  - {list}"),
                ));
            }
        }

        self.repository = repository;
        Ok(())
    }

    /// Replace repository logical ids in `content` with the remote ids of
    /// the items they name.
    pub fn replace_logical_ids(&self, content: &str) -> Result<String, DeployError> {
        let mut content = content.to_string();
        for item in self.repository.values().flat_map(BTreeMap::values) {
            let logical_id = item.logical_id();
            if logical_id.is_empty() || !content.contains(logical_id) {
                continue;
            }
            let Some(remote_id) = item.remote_id() else {
                return Err(DeployError::UnresolvedLogicalId(logical_id.to_string()));
            };
            content = content.replace(logical_id, remote_id);
        }
        Ok(content)
    }

    /// One `{path, payload, payloadType}` part per file under the item directory.
    pub fn definition_parts(&self, item: &Item) -> Result<Vec<Value>, DeployError> {
        let mut files = Vec::new();
        collect_files(item.path(), &mut files)?;

        let mut parts = Vec::with_capacity(files.len());
        for file in files {
            let relative = file.strip_prefix(item.path()).unwrap_or(&file);
            let bytes = fs::read(&file)
                .map_err(|e| DeployError::io(format!("Failed to read {}", file.display()), e))?;
            let payload = match String::from_utf8(bytes) {
                Ok(text) if relative != Path::new(PLATFORM_FILE) => {
                    STANDARD.encode(self.process_text(item, relative, text)?)
                }
                Ok(text) => STANDARD.encode(text),
                Err(binary) => STANDARD.encode(binary.into_bytes()),
            };
            parts.push(json!({
                "path": part_path(relative),
                "payload": payload,
                "payloadType": "InlineBase64",
            }));
        }
        Ok(parts)
    }

    fn process_text(&self, item: &Item, file: &Path, text: String) -> Result<String, DeployError> {
        let text = self.replace_logical_ids(&text)?;
        let text = self.processor.process(item, file, text)?;
        Ok(references::replace_default_workspace_ids(
            &text,
            &self.workspace_id,
        ))
    }

    /// Create `item` remotely, or update it when it already exists.
    pub fn publish_item(&self, item: &Item) -> Result<PublishOutcome, DeployError> {
        let kind = item.kind();
        let name = item.name();

        if self.publish_filter.excludes(name) {
            item.mark_skipped();
            self.reporter.info(&format!(
                "Skipping publishing of {kind} '{name}' due to exclusion regex."
            ));
            return Ok(PublishOutcome::Skipped);
        }
        if self.publish_filter.folder_exclude.is_some() {
            let relative = item
                .path()
                .strip_prefix(&self.repository_directory)
                .unwrap_or(item.path());
            if self.publish_filter.excludes_folder(&part_path(relative)) {
                item.mark_skipped();
                self.reporter.info(&format!(
                    "Skipping publishing of {kind} '{name}' due to folder path exclusion regex."
                ));
                return Ok(PublishOutcome::Skipped);
            }
        }
        if !self.publish_filter.includes(item) {
            item.mark_skipped();
            self.reporter.info(&format!(
                "Skipping publishing of {kind} '{name}' as it is not in the include list."
            ));
            return Ok(PublishOutcome::Skipped);
        }

        self.reporter
            .info(&format!("Publishing {kind} '{name}'"));

        let shell_only = kind.descriptor().shell_only;
        let mut body = Map::new();
        body.insert("displayName".into(), json!(name));
        body.insert("type".into(), json!(kind.as_str()));
        if !shell_only {
            body.insert(
                "definition".into(),
                json!({ "parts": self.definition_parts(item)? }),
            );
        }

        let (outcome, mut response) = match item.remote_id() {
            None => {
                if !item.description().is_empty() {
                    body.insert("description".into(), json!(item.description()));
                }
                if !item.folder_id().is_empty() {
                    body.insert("folderId".into(), json!(item.folder_id()));
                }
                let response = self
                    .endpoint
                    .post(&format!("{}/items", self.base_api_url()), Some(Value::Object(body)))?;
                let Some(id) = response.str_at("/id") else {
                    return Err(DeployError::InvalidInput(format!(
                        "Create response for {kind} '{name}' did not include an id"
                    )));
                };
                item.assign_remote_id(id);
                (PublishOutcome::Created, response.body)
            }
            Some(id) if !shell_only => {
                body.remove("type");
                let response = self.endpoint.post(
                    &format!(
                        "{}/items/{id}/updateDefinition?updateMetadata=True",
                        self.base_api_url()
                    ),
                    Some(Value::Object(body)),
                )?;
                (PublishOutcome::Updated, response.body)
            }
            Some(id) => {
                let mut patch = json!({ "displayName": name });
                if !item.description().is_empty() {
                    patch["description"] = json!(item.description());
                }
                let response = self
                    .endpoint
                    .patch(&format!("{}/items/{id}", self.base_api_url()), patch)?;
                (PublishOutcome::Updated, response.body)
            }
        };

        if outcome == PublishOutcome::Updated
            && let Some(moved) = self.move_to_folder(item)?
        {
            response = json!({ "publish_response": response, "move_response": moved });
        }
        self.record_response(item, response);

        self.reporter.info(&format!("{INDENT}Published"));
        Ok(outcome)
    }

    /// Move a deployed item whose repository folder changed.
    ///
    /// Returns the move response, or `None` when nothing moved.
    fn move_to_folder(&self, item: &Item) -> Result<Option<Value>, DeployError> {
        if !self.folders_enabled() {
            return Ok(None);
        }
        let (Some(id), Some(deployed)) = (
            item.remote_id(),
            self.deployed_item(item.kind(), item.name()),
        ) else {
            return Ok(None);
        };
        if deployed.folder_id() == item.folder_id() {
            return Ok(None);
        }

        let body = if item.folder_id().is_empty() {
            json!({})
        } else {
            json!({ "targetFolderId": item.folder_id() })
        };
        let response = self
            .endpoint
            .post(&format!("{}/items/{id}/move", self.base_api_url()), Some(body))?;
        Ok(Some(response.body))
    }

    /// Delete a deployed item. Returns `false` when the include list skips it.
    pub fn unpublish_item(&self, item: &Item) -> Result<bool, DeployError> {
        let kind = item.kind();
        let name = item.name();

        if !self.unpublish_filter.includes(item) {
            self.reporter.info(&format!(
                "Skipping unpublishing of {kind} '{name}' as it is not in the include list."
            ));
            return Ok(false);
        }
        let Some(id) = item.remote_id() else {
            return Err(DeployError::InvalidInput(format!(
                "{kind} '{name}' has no remote id to unpublish"
            )));
        };

        self.reporter
            .info(&format!("Unpublishing {kind} '{name}'"));
        self.endpoint
            .delete(&format!("{}/items/{id}", self.base_api_url()))?;
        self.reporter.info(&format!("{INDENT}Unpublished"));
        Ok(true)
    }

    /// Whether the workspace has an assigned capacity.
    pub fn has_capacity(&self) -> Result<bool, DeployError> {
        let response = self.endpoint.get(&format!(
            "{}/v1/workspaces/{}",
            self.api_root_url, self.workspace_id
        ))?;
        Ok(response
            .str_at("/capacityId")
            .is_some_and(|id| !id.is_empty()))
    }

    /// Decoded content of one part of a deployed item's definition.
    pub fn deployed_definition_part(
        &self,
        item: &Item,
        part: &str,
    ) -> Result<Option<String>, DeployError> {
        let Some(id) = item.remote_id() else {
            return Ok(None);
        };
        let response = self.endpoint.post(
            &format!("{}/items/{id}/getDefinition", self.base_api_url()),
            None,
        )?;
        let parts = response
            .body
            .pointer("/definition/parts")
            .and_then(Value::as_array);
        let Some(found) = parts
            .into_iter()
            .flatten()
            .find(|p| p.get("path").and_then(Value::as_str) == Some(part))
        else {
            return Ok(None);
        };

        let payload = str_field(found, "payload");
        let bytes = STANDARD.decode(payload).map_err(|e| {
            DeployError::InvalidInput(format!(
                "Invalid payload in '{part}' of {} '{}': {e}",
                item.kind(),
                item.name()
            ))
        })?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Read a file of a repository item, relative to its directory.
    pub fn read_item_file(&self, item: &Item, file: &str) -> Result<String, DeployError> {
        let path = item.path().join(file);
        fs::read_to_string(&path)
            .map_err(|e| DeployError::io(format!("Failed to read {}", path.display()), e))
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("workspace_id", &self.workspace_id)
            .field("api_root_url", &self.api_root_url)
            .field("repository_directory", &self.repository_directory)
            .field("kinds_in_scope", &self.kinds_in_scope)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

fn str_field<'a>(value: &'a Value, name: &str) -> &'a str {
    value.get(name).and_then(Value::as_str).unwrap_or_default()
}

fn part_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, DeployError> {
    let entries = fs::read_dir(dir)
        .map_err(|e| DeployError::io(format!("Failed to read directory {}", dir.display()), e))?;
    let mut paths = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DeployError::io(format!("Failed to read directory {}", dir.display()), e))?;
    paths.sort();
    Ok(paths)
}

fn find_platform_files(dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), DeployError> {
    let platform = dir.join(PLATFORM_FILE);
    if platform.is_file() {
        found.push(platform);
    }
    for path in sorted_entries(dir)? {
        if path.is_dir() {
            find_platform_files(&path, found)?;
        }
    }
    Ok(())
}

/// Every file below `dir`, sorted.
pub(crate) fn collect_files(dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), DeployError> {
    for path in sorted_entries(dir)? {
        if path.is_dir() {
            collect_files(&path, found)?;
        } else {
            found.push(path);
        }
    }
    Ok(())
}
