//! Content scanners for identifiers embedded in item definitions.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::DeployError;

/// Placeholder workspace id that is rewritten to the target workspace.
pub const DEFAULT_WORKSPACE_ID: &str = "00000000-0000-0000-0000-000000000000";

static GUID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-fA-F0-9]{8}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{12}$")
        .expect("valid GUID regex")
});

static WORKSPACE_ID_REFERENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""?(default_lakehouse_workspace_id|workspaceId|workspace)"?\s*[:=]\s*"(.*?)""#)
        .expect("valid workspace id reference regex")
});

static DATAFLOW_SOURCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(PowerPlatform\.Dataflows)(?:\(\[\]\))?[\s\S]*?workspaceId\s*=\s*"(.*?)"[\s\S]*?dataflowId\s*=\s*"(.*?)""#,
    )
    .expect("valid dataflow source regex")
});

pub fn is_guid(value: &str) -> bool {
    GUID_REGEX.is_match(value)
}

/// Every string value in `content` that is exactly a GUID, first occurrence first.
pub fn guid_strings(content: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect_guids(content, &mut found);
    found
}

fn collect_guids(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            if is_guid(text) && !found.contains(text) {
                found.push(text.clone());
            }
        }
        Value::Array(values) => values.iter().for_each(|v| collect_guids(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_guids(v, found)),
        _ => {}
    }
}

/// The upstream dataflow a dataflow's `mashup.pq` reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataflowSource {
    pub workspace_id: String,
    pub dataflow_id: String,
}

/// Find the dataflow source in `content`, validating both ids.
pub fn dataflow_source(content: &str, item_name: &str) -> Result<Option<DataflowSource>, DeployError> {
    let Some(caps) = DATAFLOW_SOURCE_REGEX.captures(content) else {
        return Ok(None);
    };
    let workspace_id = caps.get(2).map_or("", |m| m.as_str());
    let dataflow_id = caps.get(3).map_or("", |m| m.as_str());

    if !is_guid(workspace_id) {
        return Err(DeployError::InvalidInput(format!(
            "Invalid workspace ID: {workspace_id} in '{item_name}' file content"
        )));
    }
    if !is_guid(dataflow_id) {
        return Err(DeployError::InvalidInput(format!(
            "Invalid dataflow ID: {dataflow_id} in '{item_name}' file content"
        )));
    }

    Ok(Some(DataflowSource {
        workspace_id: workspace_id.to_string(),
        dataflow_id: dataflow_id.to_string(),
    }))
}

/// Point `workspaceId`-style references at the all-zero id to `workspace_id`.
pub fn replace_default_workspace_ids(content: &str, workspace_id: &str) -> String {
    WORKSPACE_ID_REFERENCE_REGEX
        .replace_all(content, |caps: &Captures<'_>| {
            let whole = &caps[0];
            if &caps[2] == DEFAULT_WORKSPACE_ID {
                whole.replace(DEFAULT_WORKSPACE_ID, workspace_id)
            } else {
                whole.to_string()
            }
        })
        .into_owned()
}
