//! TOML run configuration with environment overrides.
//!
//! ```toml
//! workspace_id = "12345678-1234-1234-1234-123456789abc"
//! repository_directory = "./workspace"
//! item_types_in_scope = ["Notebook", "DataPipeline"]
//! feature_flags = ["enable_lakehouse_unpublish"]
//!
//! [endpoint]
//! initial_poll_delay = "1s"
//!
//! [endpoint.throttle]
//! base_delay = "10s"
//! max_attempts = 5
//!
//! [unpublish]
//! item_name_exclude_regex = "^keep_"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use fabric_deploy_auth::TokenCredential;
use fabric_deploy_endpoint::{EndpointClient, EndpointSettings};
use fabric_deploy_types::{FeatureFlag, FeatureFlags, ItemKind, SharedReporter};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::orchestrator::{MATCH_NOTHING, PublishOptions, UnpublishOptions};
use crate::references::is_guid;
use crate::workspace::{DEFAULT_API_ROOT_URL, Workspace};

pub const ENV_API_ROOT_URL: &str = "FABRIC_DEPLOY_API_ROOT_URL";
pub const ENV_THROTTLE_BASE_DELAY: &str = "FABRIC_DEPLOY_THROTTLE_BASE_DELAY";
pub const ENV_NAME_RESERVED_BASE_DELAY: &str = "FABRIC_DEPLOY_NAME_RESERVED_BASE_DELAY";
pub const ENV_POLL_BASE_DELAY: &str = "FABRIC_DEPLOY_POLL_BASE_DELAY";
pub const ENV_INITIAL_POLL_DELAY: &str = "FABRIC_DEPLOY_INITIAL_POLL_DELAY";
pub const ENV_DEFAULT_RETRY_AFTER: &str = "FABRIC_DEPLOY_DEFAULT_RETRY_AFTER";
pub const ENV_MAX_RETRIES: &str = "FABRIC_DEPLOY_MAX_RETRIES";
pub const ENV_FEATURE_FLAGS: &str = "FABRIC_DEPLOY_FEATURE_FLAGS";

/// Name filters for one direction of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub item_name_exclude_regex: Option<String>,
    #[serde(default)]
    pub items_to_include: Option<Vec<String>>,
    /// Publish only.
    #[serde(default)]
    pub folder_path_exclude_regex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    pub workspace_id: String,
    pub repository_directory: PathBuf,
    /// Empty means every kind.
    #[serde(default)]
    pub item_types_in_scope: Vec<ItemKind>,
    #[serde(default)]
    pub feature_flags: FeatureFlags,
    #[serde(default = "default_api_root_url")]
    pub api_root_url: String,
    #[serde(default)]
    pub endpoint: EndpointSettings,
    #[serde(default)]
    pub publish: FilterConfig,
    #[serde(default)]
    pub unpublish: FilterConfig,
}

fn default_api_root_url() -> String {
    DEFAULT_API_ROOT_URL.to_string()
}

impl DeployConfig {
    pub fn new(workspace_id: impl Into<String>, repository_directory: impl Into<PathBuf>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            repository_directory: repository_directory.into(),
            item_types_in_scope: Vec::new(),
            feature_flags: FeatureFlags::default(),
            api_root_url: default_api_root_url(),
            endpoint: EndpointSettings::default(),
            publish: FilterConfig::default(),
            unpublish: FilterConfig::default(),
        }
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: DeployConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply `FABRIC_DEPLOY_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(url) = env_value(ENV_API_ROOT_URL) {
            self.api_root_url = url;
        }
        if let Some(delay) = env_duration(ENV_THROTTLE_BASE_DELAY)? {
            self.endpoint.throttle.base_delay = delay;
        }
        if let Some(delay) = env_duration(ENV_NAME_RESERVED_BASE_DELAY)? {
            self.endpoint.name_reserved.base_delay = delay;
        }
        if let Some(delay) = env_duration(ENV_POLL_BASE_DELAY)? {
            self.endpoint.operation_poll.base_delay = delay;
        }
        if let Some(delay) = env_duration(ENV_INITIAL_POLL_DELAY)? {
            self.endpoint.initial_poll_delay = delay;
        }
        if let Some(delay) = env_duration(ENV_DEFAULT_RETRY_AFTER)? {
            self.endpoint.default_retry_after = delay;
        }
        if let Some(raw) = env_value(ENV_MAX_RETRIES) {
            let max: u32 = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid {ENV_MAX_RETRIES}: {raw}"))?;
            self.endpoint.throttle.max_attempts = Some(max);
            self.endpoint.name_reserved.max_attempts = Some(max);
        }
        if let Some(raw) = env_value(ENV_FEATURE_FLAGS) {
            for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let flag: FeatureFlag = name
                    .parse()
                    .map_err(|e| anyhow!("Invalid {ENV_FEATURE_FLAGS}: {e}"))?;
                self.feature_flags.insert(flag);
            }
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.workspace_id.trim().is_empty() {
            bail!("workspace_id cannot be empty");
        }
        if !is_guid(&self.workspace_id) {
            bail!("workspace_id must be a GUID, got '{}'", self.workspace_id);
        }
        for (name, policy) in [
            ("throttle", &self.endpoint.throttle),
            ("name_reserved", &self.endpoint.name_reserved),
            ("operation_poll", &self.endpoint.operation_poll),
        ] {
            if policy.max_attempts == Some(0) {
                bail!("endpoint.{name}.max_attempts must be greater than 0");
            }
        }

        for (section, filter) in [("publish", &self.publish), ("unpublish", &self.unpublish)] {
            if let Some(pattern) = &filter.item_name_exclude_regex {
                Regex::new(pattern).with_context(|| {
                    format!("{section}.item_name_exclude_regex is not a valid regex: {pattern}")
                })?;
            }
            if filter.items_to_include.is_some()
                && !(self
                    .feature_flags
                    .contains(FeatureFlag::EnableExperimentalFeatures)
                    && self.feature_flags.contains(FeatureFlag::EnableItemsToInclude))
            {
                bail!(
                    "{section}.items_to_include requires feature flags 'enable_experimental_features' and 'enable_items_to_include'"
                );
            }
        }

        if let Some(pattern) = &self.publish.folder_path_exclude_regex {
            Regex::new(pattern).with_context(|| {
                format!("publish.folder_path_exclude_regex is not a valid regex: {pattern}")
            })?;
            if !(self
                .feature_flags
                .contains(FeatureFlag::EnableExperimentalFeatures)
                && self.feature_flags.contains(FeatureFlag::EnableExcludeFolder))
            {
                bail!(
                    "publish.folder_path_exclude_regex requires feature flags 'enable_experimental_features' and 'enable_exclude_folder'"
                );
            }
        }
        if self.unpublish.folder_path_exclude_regex.is_some() {
            bail!("unpublish.folder_path_exclude_regex is not supported");
        }
        Ok(())
    }

    /// Kinds the run covers.
    pub fn kinds_in_scope(&self) -> Vec<ItemKind> {
        if self.item_types_in_scope.is_empty() {
            ItemKind::all().collect()
        } else {
            self.item_types_in_scope.clone()
        }
    }

    pub fn publish_options(&self) -> PublishOptions {
        PublishOptions {
            item_name_exclude_regex: self.publish.item_name_exclude_regex.clone(),
            items_to_include: self.publish.items_to_include.clone(),
            folder_path_exclude_regex: self.publish.folder_path_exclude_regex.clone(),
        }
    }

    pub fn unpublish_options(&self) -> UnpublishOptions {
        UnpublishOptions {
            item_name_exclude_regex: self
                .unpublish
                .item_name_exclude_regex
                .clone()
                .unwrap_or_else(|| MATCH_NOTHING.to_string()),
            items_to_include: self.unpublish.items_to_include.clone(),
        }
    }

    /// Build the target workspace around an existing client.
    pub fn workspace(&self, endpoint: EndpointClient) -> Workspace {
        Workspace::new(&self.workspace_id, &self.repository_directory, endpoint)
            .with_api_root_url(&self.api_root_url)
            .with_kinds_in_scope(self.kinds_in_scope())
            .with_flags(self.feature_flags.clone())
    }

    /// Authenticate with `credential` and build the target workspace.
    pub fn connect(
        &self,
        credential: Arc<dyn TokenCredential>,
        reporter: SharedReporter,
    ) -> Result<Workspace> {
        let endpoint = EndpointClient::connect(
            credential,
            self.endpoint.clone(),
            &self.feature_flags,
            reporter,
        )
        .context("Failed to connect to the deployment service")?;
        Ok(self.workspace(endpoint))
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_duration(name: &str) -> Result<Option<Duration>> {
    env_value(name)
        .map(|raw| {
            humantime::parse_duration(raw.trim())
                .with_context(|| format!("Invalid {name}: {raw}"))
        })
        .transpose()
}
