//! Workspace folder hierarchy.
//!
//! Folders are keyed by their full path, e.g. `/Team/Sub`. The repository
//! side derives paths from the directories that hold items; the deployed
//! side rebuilds them from the flat folder listing's parent links.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::DeployError;

/// Characters the service rejects in a folder display name.
pub const INVALID_FOLDER_CHARS: &[char] = &[
    '~', '"', '#', '.', '%', '&', '*', ':', '<', '>', '?', '/', '\\', '{', '|', '}',
];

/// Directory name that never maps to a workspace folder.
const CHILDREN_DIR: &str = ".children";

pub fn check_folder_name(name: &str) -> Result<(), DeployError> {
    if name.contains(INVALID_FOLDER_CHARS) {
        return Err(DeployError::InvalidInput(format!(
            "Folder name '{name}' contains invalid characters."
        )));
    }
    Ok(())
}

/// Number of path segments; `/a/b` is 2.
pub fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// `/a/b` -> `/a`, `/a` -> empty.
pub fn parent_path(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}

/// Last segment of a folder path.
pub fn folder_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `/a/b` for `root/a/b`. Empty when `dir` is not below `root`.
pub fn relative_folder_path(root: &Path, dir: &Path) -> String {
    let Ok(relative) = dir.strip_prefix(root) else {
        return String::new();
    };
    relative
        .components()
        .map(|c| format!("/{}", c.as_os_str().to_string_lossy()))
        .collect()
}

/// Folders that hold items at any depth.
///
/// Item directories themselves, `.children` directories and the root are
/// not folders; directories that hold no items are skipped.
pub fn repository_folder_paths(root: &Path, item_dirs: &[PathBuf]) -> BTreeSet<String> {
    let items: BTreeSet<&Path> = item_dirs.iter().map(PathBuf::as_path).collect();
    let mut folders = BTreeSet::new();
    for dir in item_dirs {
        for ancestor in dir.ancestors().skip(1) {
            if ancestor == root || !ancestor.starts_with(root) {
                break;
            }
            let is_children = ancestor
                .file_name()
                .is_some_and(|name| name == CHILDREN_DIR);
            if items.contains(ancestor) || is_children {
                continue;
            }
            folders.insert(relative_folder_path(root, ancestor));
        }
    }
    folders
}

/// Full path to id for every entry of a folder listing.
///
/// Parent links are followed through the listing; a missing parent ends
/// the path at that folder, a cyclic one after every folder was visited.
pub fn folder_paths(listing: &[Value]) -> BTreeMap<String, String> {
    let field = |value: &Value, name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let by_id: BTreeMap<String, (String, String)> = listing
        .iter()
        .map(|folder| {
            (
                field(folder, "id"),
                (field(folder, "displayName"), field(folder, "parentFolderId")),
            )
        })
        .collect();

    let mut paths = BTreeMap::new();
    for (id, (name, parent)) in &by_id {
        let mut path = format!("/{name}");
        let mut next = parent.as_str();
        for _ in 0..by_id.len() {
            let Some((parent_name, grandparent)) = by_id.get(next) else {
                break;
            };
            path = format!("/{parent_name}{path}");
            next = grandparent;
        }
        paths.insert(path, id.clone());
    }
    paths
}

/// Deployed folders that hold no items and are no ancestor of one, deepest
/// first.
pub fn orphaned_folders(
    deployed: &BTreeMap<String, String>,
    used_ids: &BTreeSet<String>,
) -> Vec<String> {
    let mut keep = BTreeSet::new();
    for (path, id) in deployed {
        if !used_ids.contains(id) {
            continue;
        }
        let mut current = path.as_str();
        while !current.is_empty() {
            if let Some(ancestor_id) = deployed.get(current) {
                keep.insert(ancestor_id.as_str());
            }
            current = parent_path(current);
        }
    }

    let mut orphans: Vec<(&String, &String)> = deployed
        .iter()
        .filter(|(_, id)| !keep.contains(id.as_str()))
        .collect();
    orphans.sort_by(|(a, _), (b, _)| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));
    orphans.into_iter().map(|(_, id)| id.clone()).collect()
}
