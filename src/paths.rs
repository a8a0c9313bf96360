//! On-disk and kernel-interface paths, fixed and bit-exact so other tooling
//! can rely on them.

use std::fs;
use std::path::PathBuf;

use crate::error::{GockerError, Result};

pub const GOCKER_HOME: &str = "/var/lib/gocker";
pub const GOCKER_IMAGES_PATH: &str = "/var/lib/gocker/images";
pub const GOCKER_TMP_PATH: &str = "/var/lib/gocker/tmp";
pub const GOCKER_CONTAINERS_PATH: &str = "/var/run/gocker/containers";
pub const GOCKER_NETNS_PATH: &str = "/var/run/gocker/net-ns";

pub const GOCKER_BRIDGE_NAME: &str = "gocker0";
pub const GOCKER_BRIDGE_ADDRESS: &str = "172.29.0.1";
pub const GOCKER_NETWORK_ADDRESS: &str = "172.29.0.0/16";

pub const CGROUP_CONTROLLERS: [&str; 3] = ["cpu", "memory", "pids"];
pub const CGROUP_PREFIX: &str = "gocker";

pub fn images_index_path() -> PathBuf {
    PathBuf::from(GOCKER_IMAGES_PATH).join("images.json")
}

pub fn image_dir(image_id: &str) -> PathBuf {
    PathBuf::from(GOCKER_IMAGES_PATH).join(image_id)
}

pub fn image_manifest_path(image_id: &str) -> PathBuf {
    image_dir(image_id).join("manifest.json")
}

pub fn image_config_path(image_id: &str) -> PathBuf {
    image_dir(image_id).join(format!("{image_id}.json"))
}

pub fn image_layer_fs_path(image_id: &str, layer_id: &str) -> PathBuf {
    image_dir(image_id).join(layer_id).join("fs")
}

pub fn tmp_dir(image_id: &str) -> PathBuf {
    PathBuf::from(GOCKER_TMP_PATH).join(image_id)
}

pub fn container_dir(container_id: &str) -> PathBuf {
    PathBuf::from(GOCKER_CONTAINERS_PATH).join(container_id)
}

pub fn container_fs_dir(container_id: &str) -> PathBuf {
    container_dir(container_id).join("fs")
}

pub fn container_mnt_dir(container_id: &str) -> PathBuf {
    container_fs_dir(container_id).join("mnt")
}

pub fn container_upper_dir(container_id: &str) -> PathBuf {
    container_fs_dir(container_id).join("upperdir")
}

pub fn container_work_dir(container_id: &str) -> PathBuf {
    container_fs_dir(container_id).join("workdir")
}

pub fn netns_file(container_id: &str) -> PathBuf {
    PathBuf::from(GOCKER_NETNS_PATH).join(container_id)
}

pub fn cgroup_dir(controller: &str, container_id: &str) -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
        .join(controller)
        .join(CGROUP_PREFIX)
        .join(container_id)
}

pub fn cgroup_root(controller: &str) -> PathBuf {
    PathBuf::from("/sys/fs/cgroup").join(controller).join(CGROUP_PREFIX)
}

/// Creates the directory skeleton the Driver guarantees exists before dispatch.
pub fn init_dirs() -> Result<()> {
    for dir in [
        GOCKER_HOME,
        GOCKER_TMP_PATH,
        GOCKER_IMAGES_PATH,
        GOCKER_CONTAINERS_PATH,
    ] {
        fs::create_dir_all(dir).map_err(|source| GockerError::Io {
            context: format!("create directory {dir}"),
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_fs_path_follows_fixed_layout() {
        let p = image_layer_fs_path("abc123456789", "def987654321");
        assert_eq!(
            p,
            PathBuf::from("/var/lib/gocker/images/abc123456789/def987654321/fs")
        );
    }

    #[test]
    fn container_tree_follows_fixed_layout() {
        assert_eq!(
            container_mnt_dir("c1"),
            PathBuf::from("/var/run/gocker/containers/c1/fs/mnt")
        );
        assert_eq!(
            container_upper_dir("c1"),
            PathBuf::from("/var/run/gocker/containers/c1/fs/upperdir")
        );
    }

    #[test]
    fn cgroup_dir_nests_under_fixed_prefix() {
        assert_eq!(
            cgroup_dir("memory", "c1"),
            PathBuf::from("/sys/fs/cgroup/memory/gocker/c1")
        );
    }
}
