//! Idempotent creation of nested directory trees.

use anyhow::{Context, Result};
use std::fs::{DirBuilder, Permissions};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use crate::child::{resolve_gid, resolve_uid};
use crate::config::TreeSpec;

/// Walk the spec depth-first, creating each directory with mode 0755 (an
/// existing directory is not an error), then applying owner/group and
/// permissions in that order. Children are created under the parent path;
/// an absolute entry name restarts from the filesystem root.
pub fn ensure(base: &Path, spec: &TreeSpec) -> Result<()> {
    for (name, node) in spec {
        let path = base.join(name);
        match DirBuilder::new().mode(0o755).create(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err).with_context(|| format!("create directory {}", path.display()));
            }
        }
        apply_owner(&path, node.owner.as_deref(), node.group.as_deref())?;
        if let Some(permissions) = &node.permissions {
            apply_permissions(&path, permissions)?;
        }
        if let Some(children) = &node.tree {
            ensure(&path, children)?;
        }
    }
    Ok(())
}

/// Change ownership, but only when both owner and group are specified.
pub fn apply_owner(path: &Path, owner: Option<&str>, group: Option<&str>) -> Result<()> {
    let (Some(owner), Some(group)) = (owner, group) else {
        return Ok(());
    };
    let uid = resolve_uid(owner)?;
    let gid = resolve_gid(group)?;
    std::os::unix::fs::chown(path, Some(uid), Some(gid))
        .with_context(|| format!("chown {} to {owner}:{group}", path.display()))
}

/// Apply a mode given as an octal string, e.g. "0750".
pub fn apply_permissions(path: &Path, permissions: &str) -> Result<()> {
    let mode = u32::from_str_radix(permissions, 8)
        .with_context(|| format!("invalid permissions '{permissions}'"))?;
    std::fs::set_permissions(path, Permissions::from_mode(mode))
        .with_context(|| format!("chmod {} to {permissions}", path.display()))
}
