//! # fabric-deploy
//!
//! Publishes the items of a source-controlled repository into a remote
//! workspace and removes deployed items that no longer exist in the
//! repository.
//!
//! ## Pipeline
//!
//! 1. [`config::DeployConfig`] loads the run settings and builds a
//!    [`workspace::Workspace`] around an authenticated
//!    [`fabric_deploy_endpoint::EndpointClient`].
//! 2. [`orchestrator::publish_all_items`] checks capacity, creates workspace
//!    folders, refreshes repository and deployed state and publishes kind by
//!    kind in a fixed order.
//! 3. Each kind runs through [`publisher::publish_all`]: sequential, in a
//!    bounded worker pool, or in dependency order computed by
//!    [`graph::DependencyGraph`].
//! 4. [`orchestrator::unpublish_all_orphan_items`] deletes orphans in reverse
//!    kind order, skipping destructive kinds unless their feature flag is set,
//!    then removes folders left empty.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use fabric_deploy::config::DeployConfig;
//! use fabric_deploy::orchestrator::{publish_all_items, unpublish_all_orphan_items};
//! use fabric_deploy_auth::EnvTokenCredential;
//! use fabric_deploy_types::{ConsoleReporter, shared};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut config = DeployConfig::load_from_file(Path::new("deploy.toml"))?;
//! config.apply_env_overrides()?;
//! config.validate()?;
//!
//! let mut workspace = config.connect(
//!     Arc::new(EnvTokenCredential::default()),
//!     shared(ConsoleReporter),
//! )?;
//! publish_all_items(&mut workspace, &config.publish_options())?;
//! unpublish_all_orphan_items(&mut workspace, &config.unpublish_options())?;
//! # Ok(())
//! # }
//! ```

/// TOML configuration and `FABRIC_DEPLOY_*` environment overrides.
pub mod config;

/// Error taxonomy and per-kind failure aggregation.
pub mod error;

/// Workspace folder paths, repository and deployed.
pub mod folders;

/// Kahn topological ordering of same-kind references.
pub mod graph;

/// Per-kind publishers.
pub mod items;

/// Kind-ordered publish and orphan cleanup.
pub mod orchestrator;

/// Per-kind publish lifecycle and execution modes.
pub mod publisher;

/// Identifier scanners for item content.
pub mod references;

/// Repository and deployed item state plus remote primitives.
pub mod workspace;


#[cfg(test)]
mod test_support;

pub use config::DeployConfig;
pub use error::{AggregateFailure, DeployError, ItemFailure, Operation};
pub use graph::{CycleError, DependencyGraph};
pub use orchestrator::{
    PublishOptions, PublishReport, UnpublishOptions, publish_all_items,
    unpublish_all_orphan_items,
};
pub use publisher::{ItemPublisher, ParallelConfig, PublishSummary, publish_all};
pub use workspace::{ContentProcessor, ItemFilter, PublishOutcome, ResponseMap, Workspace};
