//! Per-kind publishers.
//!
//! Most kinds use [`GenericPublisher`]. Kinds whose items reference each
//! other publish in dependency order, and environments stage libraries after
//! their shell is published.

mod dataflow;
mod datapipeline;
mod dependencies;
mod environment;
mod generic;

use fabric_deploy_types::ItemKind;

use crate::publisher::ItemPublisher;

pub use dataflow::{DataflowPublisher, find_referenced_dataflows};
pub use datapipeline::{DataPipelinePublisher, find_referenced_pipelines};
pub use dependencies::{FindReferences, deployed_unpublish_order, repository_publish_order};
pub use environment::{ENVIRONMENT_RETRY_AFTER, EnvironmentPublisher, LIBRARIES_DIR};
pub use generic::GenericPublisher;

/// The publisher that handles `kind`.
pub fn publisher_for(kind: ItemKind) -> Box<dyn ItemPublisher> {
    match kind {
        ItemKind::DataPipeline => Box::new(DataPipelinePublisher),
        ItemKind::Dataflow => Box::new(DataflowPublisher),
        ItemKind::Environment => Box::new(EnvironmentPublisher),
        other => Box::new(GenericPublisher::new(other)),
    }
}
