use fabric_deploy_types::ItemKind;
use serde_json::Value;

use crate::error::DeployError;
use crate::items::dependencies::{deployed_unpublish_order, repository_publish_order};
use crate::publisher::{ItemPublisher, ParallelConfig};
use crate::references;
use crate::workspace::{LookupMode, Workspace};

/// Pipelines invoke other pipelines by id, so they publish in dependency order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataPipelinePublisher;

fn pipeline_publish_order(workspace: &Workspace) -> Result<Vec<String>, DeployError> {
    repository_publish_order(workspace, ItemKind::DataPipeline, find_referenced_pipelines)
}

impl ItemPublisher for DataPipelinePublisher {
    fn kind(&self) -> ItemKind {
        ItemKind::DataPipeline
    }

    fn parallel_config(&self) -> ParallelConfig {
        ParallelConfig::ordered(pipeline_publish_order)
    }

    /// Pipelines may reference items created earlier in the run.
    fn pre_publish_all(&self, workspace: &mut Workspace) -> Result<(), DeployError> {
        workspace.refresh_deployed_items()
    }

    fn unpublish_order(
        &self,
        workspace: &Workspace,
        names: Vec<String>,
    ) -> Result<Vec<String>, DeployError> {
        deployed_unpublish_order(
            workspace,
            ItemKind::DataPipeline,
            &names,
            find_referenced_pipelines,
        )
    }
}

/// Pipelines named by GUID string values anywhere in `content`.
pub fn find_referenced_pipelines(
    workspace: &Workspace,
    content: &str,
    item_name: &str,
    mode: LookupMode,
) -> Result<Vec<String>, DeployError> {
    let parsed: Value = serde_json::from_str(content).map_err(|e| {
        DeployError::json(
            format!("Failed to parse pipeline content of '{item_name}'"),
            e,
        )
    })?;

    let mut referenced = Vec::new();
    for id in references::guid_strings(&parsed) {
        if let Some(name) = workspace.resolve_name(ItemKind::DataPipeline, &id, mode)
            && !referenced.iter().any(|r| r == name)
        {
            referenced.push(name.to_string());
        }
    }
    Ok(referenced)
}
