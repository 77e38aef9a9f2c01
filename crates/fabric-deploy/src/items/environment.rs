//! Environments publish as a shell, then stage and publish their libraries.
//!
//! Library publishing is asynchronous on the service side: each environment
//! first waits out any publish already in flight, and once the whole kind has
//! been dispatched the orchestrator runs [`EnvironmentPublisher::post_publish_all_check`]
//! to wait for every staged publish to finish.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fabric_deploy_endpoint::{ERROR_CODE_HEADER, FileAttachment, InvokeRequest};
use fabric_deploy_retry::{BackoffProfile, Poll, RetryError, RetryExecutor};
use fabric_deploy_types::{Item, ItemKind, ReporterHandle};
use serde_json::Value;

use crate::error::DeployError;
use crate::publisher::ItemPublisher;
use crate::workspace::{PublishOutcome, Workspace, collect_files};

/// Directory of an environment item holding its custom libraries.
pub const LIBRARIES_DIR: &str = "Libraries";

/// Upper bound on a single publish-state wait.
pub const ENVIRONMENT_RETRY_AFTER: Duration = Duration::from_secs(120);

const ENVIRONMENT_YML: &str = "environment.yml";
const LIBRARIES_NOT_FOUND: &str = "EnvironmentLibrariesNotFound";

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentPublisher;

/// Which publish-state poll is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateWait {
    /// Before staging: any terminal state ends the wait.
    InFlight,
    /// After staging: only success passes.
    Completion,
}

impl StateWait {
    fn prefix(self) -> &'static str {
        match self {
            StateWait::InFlight => "Existing Environment publish is in progress.",
            StateWait::Completion => "Operation in progress.",
        }
    }
}

impl ItemPublisher for EnvironmentPublisher {
    fn kind(&self) -> ItemKind {
        ItemKind::Environment
    }

    fn publish_one(&self, workspace: &Workspace, item: &Item) -> Result<(), DeployError> {
        if workspace.publish_item(item)? == PublishOutcome::Skipped {
            return Ok(());
        }
        let Some(id) = item.remote_id() else {
            return Ok(());
        };

        wait_for_publish_state(workspace, id, StateWait::InFlight)?;

        let libraries = repository_libraries(item.path())?;
        upload_libraries(workspace, id, &libraries)?;
        remove_stale_libraries(workspace, id, &libraries)?;

        workspace.reporter().info("Publishing Libraries");
        workspace.endpoint().post(
            &format!("{}/environments/{id}/staging/publish", workspace.base_api_url()),
            None,
        )?;
        Ok(())
    }

    fn post_publish_all_check(&self, workspace: &Workspace) -> Result<(), DeployError> {
        for item in workspace.repository_items(ItemKind::Environment) {
            if item.is_skipped() {
                continue;
            }
            if let Some(id) = item.remote_id() {
                wait_for_publish_state(workspace, id, StateWait::Completion)?;
            }
        }
        Ok(())
    }
}

fn wait_for_publish_state(
    workspace: &Workspace,
    id: &str,
    mode: StateWait,
) -> Result<(), DeployError> {
    let url = format!("{}/environments/{id}/", workspace.base_api_url());
    let executor = RetryExecutor::new(
        BackoffProfile::EnvironmentPublish.to_policy(),
        ENVIRONMENT_RETRY_AFTER,
        workspace.endpoint().sleeper(),
    );
    let reporter = workspace.reporter();

    let result = executor.run(
        |_attempt| -> Result<Poll<()>, DeployError> {
            let response = workspace.endpoint().get(&url)?;
            let state = response
                .str_at("/properties/publishDetails/state")
                .unwrap_or_default()
                .to_lowercase();
            match (mode, state.as_str()) {
                (_, "success") => Ok(Poll::Ready(())),
                (StateWait::InFlight, "failed" | "cancelled") => Ok(Poll::Ready(())),
                (StateWait::Completion, "failed" | "cancelled") => {
                    Err(DeployError::EnvironmentPublish(state))
                }
                _ => Ok(Poll::Pending),
            }
        },
        |wait| reporter.info(&wait.describe(mode.prefix())),
    );

    match result {
        Ok(()) => Ok(()),
        Err(RetryError::Exhausted(exhausted)) => Err(exhausted.into()),
        Err(RetryError::Operation(err)) => Err(err),
    }
}

/// Files under the item's libraries directory, keyed by file name.
fn repository_libraries(item_path: &Path) -> Result<BTreeMap<String, PathBuf>, DeployError> {
    let dir = item_path.join(LIBRARIES_DIR);
    let mut files = Vec::new();
    if dir.is_dir() {
        collect_files(&dir, &mut files)?;
    }
    Ok(files
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            Some((name, path))
        })
        .collect())
}

fn upload_libraries(
    workspace: &Workspace,
    id: &str,
    libraries: &BTreeMap<String, PathBuf>,
) -> Result<(), DeployError> {
    let url = format!("{}/environments/{id}/staging/libraries", workspace.base_api_url());
    for (name, path) in libraries {
        workspace
            .endpoint()
            .invoke(InvokeRequest::post(&url).file(FileAttachment::from_path(path)))?;
        workspace.reporter().info(&format!("Updated Library {name}"));
    }
    Ok(())
}

/// Delete staged libraries that no longer exist in the repository.
fn remove_stale_libraries(
    workspace: &Workspace,
    id: &str,
    libraries: &BTreeMap<String, PathBuf>,
) -> Result<(), DeployError> {
    let url = format!("{}/environments/{id}/staging/libraries", workspace.base_api_url());
    let staged = workspace.endpoint().get(&url)?;

    let error_code = staged
        .headers
        .get(ERROR_CODE_HEADER)
        .map(String::as_str)
        .or_else(|| staged.str_at("/errorCode"));
    if error_code == Some(LIBRARIES_NOT_FOUND) {
        return Ok(());
    }

    let mut stale = Vec::new();
    if staged
        .str_at("/environmentYml")
        .is_some_and(|yml| !yml.is_empty())
        && !libraries.contains_key(ENVIRONMENT_YML)
    {
        stale.push(ENVIRONMENT_YML.to_string());
    }
    if let Some(custom) = staged.body.get("customLibraries").and_then(Value::as_object) {
        for file in custom
            .values()
            .filter_map(Value::as_array)
            .flatten()
            .filter_map(Value::as_str)
        {
            if !libraries.contains_key(file) {
                stale.push(file.to_string());
            }
        }
    }

    for file in stale {
        workspace
            .endpoint()
            .delete(&format!("{url}?libraryToDelete={file}"))?;
        workspace.reporter().info(&format!("Removed {file}"));
    }
    Ok(())
}
