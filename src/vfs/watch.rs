//! Directory watching for hot-reload.
//!
//! Local mounts can install a recursive watch. Creation and modification
//! events are translated to alias-rooted virtual paths, handed to locally
//! registered callbacks right away, and (when the tool server is enabled)
//! deduplicated into a buffer that the client side drains with the
//! monitor-changes command.

use std::path::{Path, PathBuf};
use std::sync::Weak;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::VfsState;

/// Install a recursive watch over `root`, reporting events under `alias`.
pub(super) fn install(
    state: Weak<VfsState>,
    root: &str,
    alias: &str,
) -> Option<RecommendedWatcher> {
    let root_path = PathBuf::from(root);
    let event_root = root_path.clone();
    let alias = alias.to_string();
    let alias_for_closure = alias.clone();

    let mut watcher = match notify::recommended_watcher(move |result: notify::Result<Event>| {
        let alias = &alias_for_closure;
        let Ok(event) = result else { return };
        // Some editors delete and re-create on save, so creation counts as a
        // modification too.
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        let Some(state) = state.upgrade() else { return };
        for path in &event.paths {
            if let Some(virtual_path) = to_virtual_path(&event_root, &alias, path) {
                state.on_file_changed(&virtual_path);
            }
        }
    }) {
        Ok(watcher) => watcher,
        Err(err) => {
            log::error!("creating watcher for '{}' failed: {}", root, err);
            return None;
        }
    };

    if let Err(err) = watcher.watch(&root_path, RecursiveMode::Recursive) {
        log::error!("watching '{}' failed: {}", root, err);
        return None;
    }
    log::debug!("watching '{}' as '/{}'", root, alias);
    Some(watcher)
}

/// Map an absolute changed path back to `/alias/relative`, filtering out
/// directories and empty files.
fn to_virtual_path(root: &Path, alias: &str, changed: &Path) -> Option<String> {
    let meta = std::fs::metadata(changed).ok()?;
    if !meta.is_file() || meta.len() == 0 {
        return None;
    }
    let relative = changed.strip_prefix(root).ok()?;
    let relative = relative.to_string_lossy().replace('\\', "/");
    Some(format!("/{}/{}", alias, relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_path_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("textures");
        std::fs::create_dir(&sub).unwrap();
        let file = sub.join("stone.png");
        std::fs::write(&file, b"pixels").unwrap();

        let mapped = to_virtual_path(dir.path(), "data", &file).unwrap();
        assert_eq!(mapped, "/data/textures/stone.png");
    }

    #[test]
    fn test_directories_and_empty_files_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        assert!(to_virtual_path(dir.path(), "data", &sub).is_none());

        let empty = dir.path().join("empty.bin");
        std::fs::write(&empty, b"").unwrap();
        assert!(to_virtual_path(dir.path(), "data", &empty).is_none());
    }
}
