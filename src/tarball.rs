//! Layer tarball extraction. Hardlinks must be
//! created after their target regular file exists; this walks the archive
//! in two passes, recording hardlink entries on the first pass and linking
//! them on a final pass.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::{GockerError, Result};

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> GockerError {
    let context = context.into();
    move |source| GockerError::Io { context, source }
}

/// Extracts a gzip-compressed layer tarball into `target`, base-first
/// ordering being the caller's responsibility (this only unpacks one
/// layer's contents under its own `fs/` directory).
pub fn extract_layer(tarball: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target).map_err(io_err(format!(
        "create layer extraction dir {}",
        target.display()
    )))?;
    let file = fs::File::open(tarball).map_err(io_err(format!(
        "open layer tarball {}",
        tarball.display()
    )))?;
    extract_from(GzDecoder::new(file), target)
}

/// Extracts a plain (non-gzip) tarball, used for the scratch-directory
/// unpack of the full image package before per-layer tarballs are found
/// inside it.
pub fn extract_plain(tarball: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target).map_err(io_err(format!(
        "create extraction dir {}",
        target.display()
    )))?;
    let file = fs::File::open(tarball).map_err(io_err(format!(
        "open tarball {}",
        tarball.display()
    )))?;
    extract_from(file, target)
}

fn extract_from(reader: impl Read, target: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    let mut hardlinks: Vec<(PathBuf, PathBuf)> = Vec::new();

    for entry in archive
        .entries()
        .map_err(io_err("read tar entries".to_string()))?
    {
        let mut entry = entry.map_err(io_err("read tar entry".to_string()))?;
        let header = entry.header().clone();
        let name = entry
            .path()
            .map_err(io_err("read tar entry path".to_string()))?
            .into_owned();
        let path = target.join(&name);

        match header.entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&path)
                    .map_err(io_err(format!("create dir {}", path.display())))?;
            }
            tar::EntryType::Link => {
                if let Ok(Some(link_name)) = entry.link_name() {
                    hardlinks.push((target.join(link_name), path));
                }
            }
            tar::EntryType::Symlink => {
                if let Ok(Some(link_name)) = entry.link_name() {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).ok();
                    }
                    match std::os::unix::fs::symlink(&link_name, &path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                        Err(source) => {
                            return Err(GockerError::Io {
                                context: format!("symlink {}", path.display()),
                                source,
                            })
                        }
                    }
                }
            }
            tar::EntryType::Regular | tar::EntryType::GNUSparse => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .map_err(io_err(format!("create dir {}", parent.display())))?;
                }
                let mode = header.mode().unwrap_or(0o644);
                match fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                {
                    Ok(mut out) => {
                        std::io::copy(&mut entry, &mut out)
                            .map_err(io_err(format!("write {}", path.display())))?;
                        #[cfg(unix)]
                        {
                            use std::os::unix::fs::PermissionsExt;
                            let _ = fs::set_permissions(
                                &path,
                                fs::Permissions::from_mode(mode),
                            );
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(source) => {
                        return Err(GockerError::Io {
                            context: format!("create {}", path.display()),
                            source,
                        })
                    }
                }
            }
            other => {
                tracing::debug!(?other, path = %path.display(), "skipping unsupported tar entry type");
            }
        }
    }

    for (target_path, link_path) in hardlinks {
        if let Some(parent) = link_path.parent() {
            fs::create_dir_all(parent).ok();
        }
        fs::hard_link(&target_path, &link_path).or_else(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Ok(())
            } else {
                Err(GockerError::Io {
                    context: format!(
                        "hardlink {} -> {}",
                        link_path.display(),
                        target_path.display()
                    ),
                    source: e,
                })
            }
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_test_tarball() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"hello layer";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "etc/motd", &data[..]).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn extracts_regular_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("layer.tar");
        let mut f = fs::File::create(&tar_path).unwrap();
        f.write_all(&build_test_tarball()).unwrap();
        drop(f);

        let out_dir = dir.path().join("out");
        extract_plain(&tar_path, &out_dir).unwrap();
        let contents = fs::read_to_string(out_dir.join("etc/motd")).unwrap();
        assert_eq!(contents, "hello layer");
    }
}
