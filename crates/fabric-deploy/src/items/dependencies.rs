//! Graph building shared by kinds whose items reference each other.

use std::collections::BTreeSet;

use fabric_deploy_types::{ItemKind, ReporterHandle};

use crate::error::DeployError;
use crate::graph::DependencyGraph;
use crate::workspace::{LookupMode, Workspace};

/// Names of same-kind items referenced by one item's dependency file.
///
/// Arguments are the workspace, the raw file content, the referencing item's
/// name and where embedded ids are resolved.
pub type FindReferences =
    fn(&Workspace, &str, &str, LookupMode) -> Result<Vec<String>, DeployError>;

fn dependency_file(kind: ItemKind) -> Result<&'static str, DeployError> {
    kind.descriptor().dependency_file.ok_or_else(|| {
        DeployError::InvalidInput(format!("{kind} items do not track dependencies"))
    })
}

/// Publish order of every repository item of `kind`.
pub fn repository_publish_order(
    workspace: &Workspace,
    kind: ItemKind,
    find: FindReferences,
) -> Result<Vec<String>, DeployError> {
    let file = dependency_file(kind)?;
    let mut references = Vec::new();
    for item in workspace.repository_items(kind) {
        let content = workspace.read_item_file(item, file)?;
        let referenced = find(workspace, &content, item.name(), LookupMode::Repository)?;
        references.push((item.name().to_string(), referenced));
    }
    Ok(DependencyGraph::from_references(references).publish_order()?)
}

/// Deletion order of the deployed `kind` items in `names`.
///
/// Definitions are fetched from the service. An item whose definition has no
/// dependency file is left out of the order, so it is not deleted.
pub fn deployed_unpublish_order(
    workspace: &Workspace,
    kind: ItemKind,
    names: &[String],
    find: FindReferences,
) -> Result<Vec<String>, DeployError> {
    let file = dependency_file(kind)?;
    let mut references = Vec::new();
    for name in names {
        let Some(item) = workspace.deployed_item(kind, name) else {
            continue;
        };
        let Some(content) = workspace.deployed_definition_part(item, file)? else {
            workspace.reporter().warn(&format!(
                "Skipping unpublish of {kind} '{name}': deployed definition has no '{file}' part."
            ));
            continue;
        };
        let referenced = find(workspace, &content, name, LookupMode::Deployed)?;
        references.push((name.clone(), referenced));
    }
    let to_remove: BTreeSet<String> = references.iter().map(|(name, _)| name.clone()).collect();
    Ok(DependencyGraph::from_references(references).unpublish_order(&to_remove)?)
}
