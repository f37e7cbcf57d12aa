//! Mount table and path resolution.
//!
//! Consumers address files by alias-rooted virtual paths (`/data/x/y`). The
//! first path segment selects a mount; the remainder is remapped under the
//! mount's root. Paths that match no mount fall through to the raw host
//! filesystem, which is documented behaviour rather than an error.

use std::path::Path;

use super::{MountKind, VfsError};

/// One entry of the mount table.
pub(super) struct MountPoint {
    pub kind: MountKind,
    /// Absolute unix-style root for local mounts; peer URL for remote mounts.
    pub root: String,
    /// First path segment consumers address, stored without slashes.
    pub alias: String,
    /// Non-zero when a directory watch (or remote poller) is attached.
    pub watched: bool,
}

/// Normalise a virtual path: backslashes become slashes.
pub(super) fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

/// Build a mount record for a local directory.
pub(super) fn local_mount(root_dir: &str, alias: &str, watched: bool) -> Result<MountPoint, VfsError> {
    let root_path = Path::new(root_dir);
    if !root_path.is_dir() {
        log::error!("'{}' is not a valid directory", root_dir);
        return Err(VfsError::NotADirectory(root_dir.to_string()));
    }
    let absolute = root_path
        .canonicalize()
        .map_err(VfsError::Io)?
        .to_string_lossy()
        .into_owned();
    let mut root = normalize(&absolute);
    while root.len() > 1 && root.ends_with('/') {
        root.pop();
    }
    Ok(MountPoint {
        kind: MountKind::Local,
        root,
        alias: alias.trim_matches('/').to_string(),
        watched,
    })
}

/// Find the mount whose alias matches the first segment of `path`.
/// Overlapping prefixes only match across a `/` boundary.
pub(super) fn find_mount(mounts: &[MountPoint], path: &str) -> Option<usize> {
    let path = path.strip_prefix('/').unwrap_or(path);
    mounts.iter().position(|mount| {
        path.len() > mount.alias.len()
            && path.starts_with(&mount.alias)
            && path.as_bytes()[mount.alias.len()] == b'/'
    })
}

/// Remap `path` through the mount table. Returns the mount index (if any)
/// and the path to hand to the host filesystem.
pub(super) fn resolve(mounts: &[MountPoint], path: &str) -> (Option<usize>, String) {
    let normalized = normalize(path);
    match find_mount(mounts, &normalized) {
        Some(index) => {
            let stripped = normalized.strip_prefix('/').unwrap_or(&normalized);
            let rest = &stripped[mounts[index].alias.len()..];
            (Some(index), format!("{}{}", mounts[index].root, rest))
        }
        None => (None, normalized),
    }
}

/// The alias-relative remainder of `path`, if it hits a mount.
pub(super) fn strip_mount(mounts: &[MountPoint], path: &str) -> Option<String> {
    let normalized = normalize(path);
    let index = find_mount(mounts, &normalized)?;
    let stripped = normalized.strip_prefix('/').unwrap_or(&normalized);
    Some(stripped[mounts[index].alias.len()..].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(alias: &str, root: &str) -> MountPoint {
        MountPoint {
            kind: MountKind::Local,
            root: root.to_string(),
            alias: alias.to_string(),
            watched: false,
        }
    }

    #[test]
    fn test_resolution_remaps_alias() {
        let mounts = vec![mount("assets", "/home/data")];
        let (idx, resolved) = resolve(&mounts, "/assets/x/y");
        assert_eq!(idx, Some(0));
        assert_eq!(resolved, "/home/data/x/y");
    }

    #[test]
    fn test_unmatched_path_falls_through() {
        let mounts = vec![mount("assets", "/home/data")];
        let (idx, resolved) = resolve(&mounts, "/other/x");
        assert_eq!(idx, None);
        assert_eq!(resolved, "/other/x");
    }

    #[test]
    fn test_prefix_does_not_match_across_segments() {
        let mounts = vec![mount("assets", "/home/data")];
        // "assetsextra" shares a prefix but is a different first segment.
        let (idx, _) = resolve(&mounts, "/assetsextra/x");
        assert_eq!(idx, None);
        // The bare alias with no trailing segment does not match either.
        let (idx, _) = resolve(&mounts, "/assets");
        assert_eq!(idx, None);
    }

    #[test]
    fn test_backslashes_normalised() {
        let mounts = vec![mount("assets", "/home/data")];
        let (idx, resolved) = resolve(&mounts, "\\assets\\tex\\a.png");
        assert_eq!(idx, Some(0));
        assert_eq!(resolved, "/home/data/tex/a.png");
    }

    #[test]
    fn test_first_matching_mount_wins() {
        let mounts = vec![mount("data", "/one"), mount("data", "/two")];
        let (idx, resolved) = resolve(&mounts, "/data/f");
        assert_eq!(idx, Some(0));
        assert_eq!(resolved, "/one/f");
    }

    #[test]
    fn test_strip_mount() {
        let mounts = vec![mount("data", "/one")];
        assert_eq!(strip_mount(&mounts, "/data/a/b").unwrap(), "/a/b");
        assert!(strip_mount(&mounts, "/nope/a").is_none());
    }
}
