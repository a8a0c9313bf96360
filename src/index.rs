//! Image Index: the two-level `name -> (tag -> image-id)` mapping described
//! persisted as a single JSON document. Access is
//! wrapped in an advisory file lock spanning read-mutate-write, per the
//! "Index concurrency" design note.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{GockerError, Result};
use crate::paths::images_index_path;

/// `{name: {tag: id}}`, all strings.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageIndex(pub HashMap<String, HashMap<String, String>>);

impl ImageIndex {
    pub fn resolve(&self, name: &str, tag: &str) -> Option<&str> {
        self.0.get(name)?.get(tag).map(String::as_str)
    }

    /// Returns the first `(name, tag)` pair whose value equals `image_id`.
    pub fn find_by_id(&self, image_id: &str) -> Option<(String, String)> {
        for (name, tags) in &self.0 {
            for (tag, id) in tags {
                if id == image_id {
                    return Some((name.clone(), tag.clone()));
                }
            }
        }
        None
    }

    pub fn insert(&mut self, name: &str, tag: &str, image_id: &str) {
        self.0
            .entry(name.to_string())
            .or_default()
            .insert(tag.to_string(), image_id.to_string());
    }

    /// Removes every entry whose value equals `image_id`. An image name
    /// whose tag map becomes empty is dropped entirely ("empty tag map
    /// implies the image name is deleted").
    pub fn remove_by_id(&mut self, image_id: &str) {
        self.0.retain(|_, tags| {
            tags.retain(|_, id| id != image_id);
            !tags.is_empty()
        });
    }

    pub fn list(&self) -> Vec<(String, String, String)> {
        let mut out = Vec::new();
        for (name, tags) in &self.0 {
            for (tag, id) in tags {
                out.push((name.clone(), tag.clone(), id.clone()));
            }
        }
        out.sort();
        out
    }
}

/// Opens the index file, locks it exclusively, and hands the parsed
/// document plus the open (locked) file to `f`. The lock is released when
/// the file is dropped at the end of this call, after any write `f`
/// performed via [`write_locked`].
fn with_index_file<T>(f: impl FnOnce(&mut File, &mut ImageIndex) -> Result<T>) -> Result<T> {
    let path = images_index_path();
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|source| GockerError::Io {
            context: format!("open image index {}", path.display()),
            source,
        })?;
    file.lock_exclusive().map_err(|source| GockerError::Io {
        context: "lock image index".to_string(),
        source,
    })?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|source| GockerError::Io {
            context: "read image index".to_string(),
            source,
        })?;

    let mut index: ImageIndex = if contents.trim().is_empty() {
        ImageIndex::default()
    } else {
        serde_json::from_str(&contents)?
    };

    let result = f(&mut file, &mut index);
    let _ = FileExt::unlock(&file);
    result
}

fn write_locked(file: &mut File, index: &ImageIndex) -> Result<()> {
    let serialized = serde_json::to_vec(&index.0)?;
    file.set_len(0).map_err(|source| GockerError::Io {
        context: "truncate image index".to_string(),
        source,
    })?;
    file.seek(SeekFrom::Start(0))
        .map_err(|source| GockerError::Io {
            context: "seek image index".to_string(),
            source,
        })?;
    file.write_all(&serialized)
        .map_err(|source| GockerError::Io {
            context: "write image index".to_string(),
            source,
        })
}

pub fn load() -> Result<ImageIndex> {
    with_index_file(|_file, index| Ok(index.clone()))
}

/// Read-modify-write under the exclusive lock: `mutate` receives the
/// current index and returns the updated one, which is persisted before
/// the lock is released.
pub fn update(mutate: impl FnOnce(ImageIndex) -> ImageIndex) -> Result<ImageIndex> {
    with_index_file(|file, index| {
        let updated = mutate(index.clone());
        write_locked(file, &updated)?;
        *index = updated.clone();
        Ok(updated)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_hits_and_misses() {
        let mut idx = ImageIndex::default();
        idx.insert("library/alpine", "latest", "aaaaaaaaaaaa");
        assert_eq!(idx.resolve("library/alpine", "latest"), Some("aaaaaaaaaaaa"));
        assert_eq!(idx.resolve("library/alpine", "3.19"), None);
        assert_eq!(idx.resolve("library/busybox", "latest"), None);
    }

    #[test]
    fn alias_sharing_keeps_a_single_id_under_two_names() {
        let mut idx = ImageIndex::default();
        idx.insert("library/alpine", "latest", "dddddddddddd");
        idx.insert("myrepo/mirror", "v1", "dddddddddddd");
        assert_eq!(idx.resolve("library/alpine", "latest"), Some("dddddddddddd"));
        assert_eq!(idx.resolve("myrepo/mirror", "v1"), Some("dddddddddddd"));
        assert_eq!(idx.list().len(), 2);
    }

    #[test]
    fn remove_by_id_drops_name_when_tag_map_empties() {
        let mut idx = ImageIndex::default();
        idx.insert("library/alpine", "latest", "dddddddddddd");
        idx.insert("library/alpine", "3.19", "eeeeeeeeeeee");
        idx.remove_by_id("dddddddddddd");
        assert_eq!(idx.resolve("library/alpine", "latest"), None);
        assert_eq!(idx.resolve("library/alpine", "3.19"), Some("eeeeeeeeeeee"));

        idx.remove_by_id("eeeeeeeeeeee");
        assert!(idx.0.get("library/alpine").is_none());
    }

    #[test]
    fn find_by_id_returns_first_matching_alias() {
        let mut idx = ImageIndex::default();
        idx.insert("library/alpine", "latest", "ffffffffffff");
        let (name, tag) = idx.find_by_id("ffffffffffff").unwrap();
        assert_eq!(name, "library/alpine");
        assert_eq!(tag, "latest");
        assert!(idx.find_by_id("000000000000").is_none());
    }
}
