use fabric_deploy_types::ItemKind;

use crate::error::DeployError;
use crate::items::dependencies::{deployed_unpublish_order, repository_publish_order};
use crate::publisher::{ItemPublisher, ParallelConfig};
use crate::references;
use crate::workspace::{LookupMode, Workspace};

/// Dataflows that read from another dataflow publish after their source.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataflowPublisher;

fn dataflow_publish_order(workspace: &Workspace) -> Result<Vec<String>, DeployError> {
    repository_publish_order(workspace, ItemKind::Dataflow, find_referenced_dataflows)
}

impl ItemPublisher for DataflowPublisher {
    fn kind(&self) -> ItemKind {
        ItemKind::Dataflow
    }

    fn parallel_config(&self) -> ParallelConfig {
        ParallelConfig::ordered(dataflow_publish_order)
    }

    fn unpublish_order(
        &self,
        workspace: &Workspace,
        names: Vec<String>,
    ) -> Result<Vec<String>, DeployError> {
        deployed_unpublish_order(workspace, ItemKind::Dataflow, &names, find_referenced_dataflows)
    }
}

/// The source dataflow named by a `PowerPlatform.Dataflows` reference, if it
/// resolves to a dataflow known in `mode`.
pub fn find_referenced_dataflows(
    workspace: &Workspace,
    content: &str,
    item_name: &str,
    mode: LookupMode,
) -> Result<Vec<String>, DeployError> {
    let Some(source) = references::dataflow_source(content, item_name)? else {
        return Ok(Vec::new());
    };
    Ok(workspace
        .resolve_name(ItemKind::Dataflow, &source.dataflow_id, mode)
        .map(|name| vec![name.to_string()])
        .unwrap_or_default())
}
