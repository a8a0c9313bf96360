//! Filesystem Assembler: stacks an image's layers as an
//! overlay union mount under the container's private directory tree.

use std::fs;
use std::path::Path;

use nix::mount::{mount, umount, MsFlags};

use crate::error::{GockerError, Result};
use crate::image::{self, StoredManifest};
use crate::paths::{
    container_dir, container_mnt_dir, container_upper_dir, container_work_dir,
    image_layer_fs_path,
};

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> GockerError {
    let context = context.into();
    move |source| GockerError::Io { context, source }
}

/// Creates `<containers>/<id>/fs/{mnt,upperdir,workdir}`.
pub fn create_container_dirs(container_id: &str) -> Result<()> {
    for dir in [
        container_mnt_dir(container_id),
        container_upper_dir(container_id),
        container_work_dir(container_id),
    ] {
        fs::create_dir_all(&dir).map_err(io_err(format!("create {}", dir.display())))?;
    }
    Ok(())
}

/// Builds the `lowerdir=` string in manifest (base-first) order:
/// colon-separated, no trailing colon.
pub fn lowerdir_option(manifest: &StoredManifest, image_id: &str) -> String {
    manifest
        .layers
        .iter()
        .map(|layer_id| image_layer_fs_path(image_id, layer_id).display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

/// Mounts the overlay root for `container_id` using `image_id`'s layers.
pub fn mount_overlay(container_id: &str, image_id: &str) -> Result<()> {
    let manifest = image::load_manifest(image_id)?;
    let lowerdir = lowerdir_option(&manifest, image_id);
    let upperdir = container_upper_dir(container_id);
    let workdir = container_work_dir(container_id);
    let mnt = container_mnt_dir(container_id);

    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lowerdir,
        upperdir.display(),
        workdir.display()
    );

    mount(
        None::<&Path>,
        &mnt,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|source| GockerError::Kernel {
        context: format!("mount overlay at {}", mnt.display()),
        source,
    })
}

/// Unmounts the overlay root. Teardown failures are surfaced to the caller
/// (the Supervisor logs and continues) rather than swallowed here.
pub fn umount_overlay(container_id: &str) -> Result<()> {
    let mnt = container_mnt_dir(container_id);
    umount(&mnt).map_err(|source| GockerError::Kernel {
        context: format!("unmount overlay at {}", mnt.display()),
        source,
    })
}

/// Removes the whole per-container directory tree.
pub fn remove_container_dirs(container_id: &str) -> Result<()> {
    let dir = container_dir(container_id);
    if dir.is_dir() {
        fs::remove_dir_all(&dir).map_err(io_err(format!("remove {}", dir.display())))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowerdir_option_is_base_first_colon_separated() {
        let manifest = StoredManifest {
            config: "id.json".to_string(),
            repo_tags: vec![],
            layers: vec!["aaa111222333".to_string(), "bbb444555666".to_string()],
        };
        let s = lowerdir_option(&manifest, "imgid");
        assert_eq!(
            s,
            "/var/lib/gocker/images/imgid/aaa111222333/fs:/var/lib/gocker/images/imgid/bbb444555666/fs"
        );
        assert!(!s.ends_with(':'));
    }
}
