//! Image Store: resolves `name[:tag]` references to a
//! 12-hex image ID, pulling and extracting image layers on first use.
//!
//! The registry round trip (manifest + blob fetch) is delegated to
//! `oci-client`/`oci-spec`, treating the registry client as an external
//! collaborator, and these are the published crates this retrieval pack's
//! closest sibling (`boxlite`) already depends on for the same role.

use std::fs;

use oci_client::manifest::OciManifest;
use oci_client::secrets::RegistryAuth;
use oci_client::{client::ClientConfig, Client, Reference};
use oci_spec::image::ImageConfiguration;
use serde::{Deserialize, Serialize};

use crate::error::{GockerError, Result};
use crate::index::{self, ImageIndex};
use crate::paths::{image_config_path, image_dir, image_layer_fs_path, image_manifest_path, tmp_dir};
use crate::tarball;

/// On-disk manifest.json: the standard OCI legacy manifest
/// shape, authored by this store rather than replayed byte-for-byte from
/// the registry (the registry gives us an OCI manifest; this is the
/// locally-persisted record of what we extracted from it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredManifest {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

pub struct ImageConfig {
    pub env: Vec<String>,
    pub cmd: Vec<String>,
}

/// Splits `name[:tag]` into `(name, tag)`, defaulting the tag to `latest`
/// and qualifying an unqualified name under `library/`, matching Docker
/// Hub's implicit official-image namespace.
pub fn parse_image_ref(src: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = src.split(':').collect();
    let (name, tag) = match parts.len() {
        1 => (parts[0].to_string(), "latest".to_string()),
        2 => (parts[0].to_string(), parts[1].to_string()),
        _ => {
            return Err(GockerError::Precondition(format!(
                "invalid image reference: {src}"
            )))
        }
    };
    let name = if name.contains('/') {
        name
    } else {
        format!("library/{name}")
    };
    Ok((name, tag))
}

fn short_digest(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    hex.chars().take(12).collect()
}

/// `resolve(ref) -> image-id`, downloading the image if it is not already
/// present locally.
pub async fn resolve(image_ref: &str) -> Result<String> {
    let (name, tag) = parse_image_ref(image_ref)?;

    if let Some(id) = index::load()?.resolve(&name, &tag) {
        tracing::info!(image = %name, tag = %tag, id = %id, "image already resolved");
        return Ok(id.to_string());
    }

    tracing::info!(image = %name, tag = %tag, "downloading metadata, please wait");
    let client = Client::new(ClientConfig::default());
    let reference: Reference = format!("{name}:{tag}")
        .parse()
        .map_err(|e| GockerError::Registry(format!("invalid reference {name}:{tag}: {e}")))?;
    let auth = RegistryAuth::Anonymous;

    let (manifest, _digest) = client
        .pull_manifest(&reference, &auth)
        .await
        .map_err(|e| GockerError::Registry(format!("pull manifest failed: {e}")))?;

    let manifest = match manifest {
        OciManifest::Image(m) => m,
        OciManifest::ImageIndex(_) => {
            return Err(GockerError::MalformedImage {
                image_id: format!("{name}:{tag}"),
                reason: "multi-platform image indexes are not supported; single-platform only"
                    .to_string(),
            })
        }
    };

    let image_id = short_digest(&manifest.config.digest);

    // Alias sharing: if this digest is already on disk
    // under a different name, just point the index at it.
    if image_dir(&image_id).is_dir() {
        let existing = index::load()?
            .find_by_id(&image_id)
            .map(|(n, t)| format!("{n}:{t}"))
            .unwrap_or_else(|| image_id.clone());
        tracing::info!(existing = %existing, "the image you want already exists under another name");
        index::update(|mut idx| {
            idx.insert(&name, &tag, &image_id);
            idx
        })?;
        return Ok(image_id);
    }

    download_and_extract(&client, &reference, &manifest, &image_id).await?;

    index::update(|mut idx| {
        idx.insert(&name, &tag, &image_id);
        idx
    })?;

    Ok(image_id)
}

async fn download_and_extract(
    client: &Client,
    reference: &Reference,
    manifest: &oci_client::manifest::OciImageManifest,
    image_id: &str,
) -> Result<()> {
    let scratch = tmp_dir(image_id);
    fs::create_dir_all(&scratch).map_err(|source| GockerError::Io {
        context: format!("create scratch dir {}", scratch.display()),
        source,
    })?;

    fs::create_dir_all(image_dir(image_id)).map_err(|source| GockerError::Io {
        context: format!("create image dir for {image_id}"),
        source,
    })?;

    let mut layer_ids = Vec::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        let layer_id = short_digest(&layer.digest);
        tracing::info!(layer = %layer_id, "pulling layer");
        let mut bytes = Vec::new();
        client
            .pull_blob(reference, layer, &mut bytes)
            .await
            .map_err(|e| GockerError::Registry(format!("pull layer {layer_id} failed: {e}")))?;

        let blob_path = scratch.join(format!("{layer_id}.tar.gz"));
        fs::write(&blob_path, &bytes).map_err(|source| GockerError::Io {
            context: format!("write layer blob {}", blob_path.display()),
            source,
        })?;

        let dst = image_layer_fs_path(image_id, &layer_id);
        tarball::extract_layer(&blob_path, &dst)?;
        tracing::info!(layer = %layer_id, "pull complete");
        layer_ids.push(layer_id);
    }

    let mut config_bytes = Vec::new();
    client
        .pull_blob(reference, &manifest.config, &mut config_bytes)
        .await
        .map_err(|e| GockerError::Registry(format!("pull config blob failed: {e}")))?;
    fs::write(image_config_path(image_id), &config_bytes).map_err(|source| GockerError::Io {
        context: "write image config blob".to_string(),
        source,
    })?;

    // Validate it parses; an unreadable config blob is fatal.
    ImageConfiguration::from_reader(config_bytes.as_slice()).map_err(|e| {
        GockerError::MalformedImage {
            image_id: image_id.to_string(),
            reason: format!("config blob did not parse: {e}"),
        }
    })?;

    let stored = StoredManifest {
        config: format!("{image_id}.json"),
        repo_tags: vec![reference.to_string()],
        layers: layer_ids,
    };
    fs::write(
        image_manifest_path(image_id),
        serde_json::to_vec(&stored)?,
    )
    .map_err(|source| GockerError::Io {
        context: "write image manifest".to_string(),
        source,
    })?;

    fs::remove_dir_all(&scratch).map_err(|source| GockerError::Io {
        context: format!("clean up scratch dir {}", scratch.display()),
        source,
    })?;

    Ok(())
}

pub fn load_manifest(image_id: &str) -> Result<StoredManifest> {
    let path = image_manifest_path(image_id);
    let data = fs::read(&path).map_err(|source| GockerError::Io {
        context: format!("read manifest for {image_id}"),
        source,
    })?;
    if data.is_empty() {
        return Err(GockerError::MalformedImage {
            image_id: image_id.to_string(),
            reason: "empty manifest".to_string(),
        });
    }
    let manifest: StoredManifest = serde_json::from_slice(&data)?;
    if manifest.layers.is_empty() {
        return Err(GockerError::MalformedImage {
            image_id: image_id.to_string(),
            reason: "manifest has no layers".to_string(),
        });
    }
    Ok(manifest)
}

pub fn config(image_id: &str) -> Result<ImageConfig> {
    let path = image_config_path(image_id);
    let data = fs::read(&path).map_err(|source| GockerError::Io {
        context: format!("read config for {image_id}"),
        source,
    })?;
    let parsed = ImageConfiguration::from_reader(data.as_slice()).map_err(|e| {
        GockerError::MalformedImage {
            image_id: image_id.to_string(),
            reason: format!("could not parse config: {e}"),
        }
    })?;
    let cfg = parsed.config().clone().unwrap_or_default();
    Ok(ImageConfig {
        env: cfg.env().clone().unwrap_or_default(),
        cmd: cfg.cmd().clone().unwrap_or_default(),
    })
}

/// `delete(image-id)`: refuses if any live container is running this
/// image, checking every `name:tag` alias the digest is known under, not
/// just one of them.
pub fn delete(image_id: &str, running_images: &[String]) -> Result<()> {
    let idx = index::load()?;
    let aliases: Vec<String> = idx
        .list()
        .into_iter()
        .filter(|(_, _, id)| id == image_id)
        .map(|(name, tag, _)| format!("{name}:{tag}"))
        .collect();
    if aliases.is_empty() {
        return Err(GockerError::NoSuchImage(image_id.to_string()));
    }
    if let Some(qualified) = aliases.into_iter().find(|a| running_images.contains(a)) {
        return Err(GockerError::ImageInUse(qualified));
    }

    let dir = image_dir(image_id);
    if dir.is_dir() {
        fs::remove_dir_all(&dir).map_err(|source| GockerError::Io {
            context: format!("remove image dir {}", dir.display()),
            source,
        })?;
    }

    index::update(|mut idx| {
        idx.remove_by_id(image_id);
        idx
    })?;
    Ok(())
}

pub fn list() -> Result<Vec<(String, String, String)>> {
    let idx = index::load()?;
    Ok(idx.list())
}

pub fn print_available_images() -> Result<()> {
    println!("REPOSITORY\tTAG\tIMAGE ID");
    for (name, tag, id) in list()? {
        println!("{name}\t{tag}\t{id}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_name_with_implicit_tag_and_library_namespace() {
        let (name, tag) = parse_image_ref("alpine").unwrap();
        assert_eq!(name, "library/alpine");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn parses_namespaced_name_with_explicit_tag() {
        let (name, tag) = parse_image_ref("myorg/app:1.2").unwrap();
        assert_eq!(name, "myorg/app");
        assert_eq!(tag, "1.2");
    }

    #[test]
    fn rejects_multiple_colons() {
        assert!(parse_image_ref("a:b:c").is_err());
    }

    #[test]
    fn short_digest_strips_algorithm_prefix() {
        let d = "sha256:abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789";
        assert_eq!(short_digest(d), "abcdef012345");
    }

    #[test]
    fn stored_manifest_round_trips_through_json() {
        let m = StoredManifest {
            config: "abcd.json".to_string(),
            repo_tags: vec!["library/alpine:latest".to_string()],
            layers: vec!["layer1".to_string(), "layer2".to_string()],
        };
        let bytes = serde_json::to_vec(&m).unwrap();
        let parsed: StoredManifest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.layers, vec!["layer1", "layer2"]);
    }
}
