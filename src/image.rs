//! # Image References and Metadata
//!
//! The local repository stores every image as a pair of files named after
//! the reference's unique key:
//!
//! ```text
//! <images>/<server>/<namespace>/<image>/<tag>.squashfs   (root filesystem)
//! <images>/<server>/<namespace>/<image>/<tag>.meta       (OCI config excerpt)
//! ```
//!
//! Both files are produced by the image-manager pipeline; this crate only
//! resolves and reads them.
//!
//! ## Reference Grammar
//!
//! `[server/[namespace/]]image[:tag][@digest]`, where the namespace may be
//! nested (`server/ns0/ns1/image`). Omitted parts default to `docker.io`,
//! `library` and `latest`. A digest reference (`@sha256:…`) identifies the
//! manifest in the registry the image was pulled from; when a digest is
//! present the tag may be empty.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    DEFAULT_IMAGE_TAG, DEFAULT_REGISTRY_SERVER, DEFAULT_REPOSITORY_NAMESPACE, IMAGE_FILE_SUFFIX,
    METADATA_FILE_SUFFIX,
};
use crate::error::{Context, Error, ErrorKind, Result};

// =============================================================================
// ImageReference
// =============================================================================

/// Parsed image reference: `(server, namespace, image, tag, digest)`.
///
/// Invariant: after a successful parse at least one of `tag` and `digest` is
/// non-empty; when the input carries neither, `tag` is `latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub server: String,
    pub namespace: String,
    pub image: String,
    pub tag: String,
    pub digest: String,
}

impl ImageReference {
    /// Parses a CLI image reference.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidRequest`] on an empty reference, an empty
    /// component, a `..` component, or an empty tag/digest after `:`/`@`.
    pub fn parse(input: &str) -> Result<Self> {
        debug!("parsing image reference '{}'", input);

        if input.is_empty() {
            return Err(Error::new(ErrorKind::InvalidRequest(
                "image reference must not be empty".to_string(),
            )));
        }

        // A ".." component would escape the repository directory once the
        // reference is turned into a path.
        if input.split('/').any(|part| part == "..") {
            return Err(Error::new(ErrorKind::InvalidRequest(format!(
                "invalid image reference '{input}': '..' is not allowed"
            ))));
        }

        let (name, digest) = match input.rsplit_once('@') {
            Some((name, digest)) => {
                if digest.is_empty() {
                    return Err(Error::new(ErrorKind::InvalidRequest(format!(
                        "invalid image reference '{input}': empty digest"
                    ))));
                }
                (name, digest.to_string())
            }
            None => (input, String::new()),
        };

        let parts: Vec<&str> = name.split('/').collect();
        if parts.iter().any(|part| part.is_empty()) {
            return Err(Error::new(ErrorKind::InvalidRequest(format!(
                "invalid image reference '{input}': empty component"
            ))));
        }

        let (server, namespace, image_part) = match parts.len() {
            1 => (
                DEFAULT_REGISTRY_SERVER.to_string(),
                DEFAULT_REPOSITORY_NAMESPACE.to_string(),
                parts[0],
            ),
            2 => (
                DEFAULT_REGISTRY_SERVER.to_string(),
                parts[0].to_string(),
                parts[1],
            ),
            n => (
                parts[0].to_string(),
                parts[1..n - 1].join("/"),
                parts[n - 1],
            ),
        };

        let (image, tag) = match image_part.split_once(':') {
            Some((image, tag)) => {
                if tag.is_empty() {
                    return Err(Error::new(ErrorKind::InvalidRequest(format!(
                        "invalid image reference '{input}': empty tag"
                    ))));
                }
                (image.to_string(), tag.to_string())
            }
            // Without an explicit tag the digest alone may identify the
            // image; only default the tag when there is no digest either.
            None if digest.is_empty() => (image_part.to_string(), DEFAULT_IMAGE_TAG.to_string()),
            None => (image_part.to_string(), String::new()),
        };

        if image.is_empty() {
            return Err(Error::new(ErrorKind::InvalidRequest(format!(
                "invalid image reference '{input}': empty image name"
            ))));
        }

        Ok(Self {
            server,
            namespace,
            image,
            tag,
            digest,
        })
    }

    /// Filesystem-safe key locating this image inside the repository.
    ///
    /// Tagged references key on the tag; digest-only references key on the
    /// digest with `:` flattened so the key stays a valid path component.
    pub fn unique_key(&self) -> String {
        let last = if !self.tag.is_empty() {
            self.tag.clone()
        } else {
            self.digest.replace(':', "-")
        };
        format!("{}/{}/{}/{}", self.server, self.namespace, self.image, last)
    }

    /// Path of the squashfs image inside `images_dir`.
    pub fn image_file(&self, images_dir: &Path) -> PathBuf {
        images_dir.join(format!("{}{}", self.unique_key(), IMAGE_FILE_SUFFIX))
    }

    /// Path of the metadata document inside `images_dir`.
    pub fn metadata_file(&self, images_dir: &Path) -> PathBuf {
        images_dir.join(format!("{}{}", self.unique_key(), METADATA_FILE_SUFFIX))
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.server, self.namespace, self.image)?;
        if !self.tag.is_empty() {
            write!(f, ":{}", self.tag)?;
        }
        if !self.digest.is_empty() {
            write!(f, "@{}", self.digest)?;
        }
        Ok(())
    }
}

// =============================================================================
// ImageMetadata
// =============================================================================

/// Excerpt of the image's OCI config recorded by the image-manager pipeline.
///
/// Every field is optional: a scratch-like image may define none of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImageMetadata {
    /// Default working directory (`Config.WorkingDir`).
    pub workdir: Option<PathBuf>,
    /// Default environment (`Config.Env`), already split into pairs.
    pub env: HashMap<String, String>,
    /// Entrypoint argv (`Config.Entrypoint`).
    pub entry: Option<Vec<String>>,
    /// Default command argv (`Config.Cmd`).
    pub cmd: Option<Vec<String>>,
}

impl ImageMetadata {
    /// Reads the metadata document of an image.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read image metadata {}", path.display()))?;
        let metadata = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse image metadata {}", path.display()))?;
        Ok(metadata)
    }
}
