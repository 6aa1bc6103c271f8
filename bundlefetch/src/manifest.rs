//! Content manifests.
//!
//! A manifest lists the downloadable content packages: one `core` module the
//! application needs, plus optional named `modules`.
//!
//! ```json
//! {
//!   "version": "2024.1",
//!   "core": {
//!     "url": "https://cdn.example.com/core.zim",
//!     "size": 262144000,
//!     "sha256": "…",
//!     "filename": "core.zim"
//!   },
//!   "modules": {
//!     "medical": {
//!       "chunk_urls": ["https://cdn.example.com/medical.000", "…"],
//!       "chunk_size": 4194304,
//!       "chunk_sha256": ["…", "…"],
//!       "size": 7340032
//!     }
//!   }
//! }
//! ```
//!
//! Field names of older manifests (`zim_url`, `zim_sha256`, `zim_filename`)
//! are accepted as aliases.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, DownloadResult};
use crate::model::{ContentType, DownloadRequest, Priority};

/// Name under which the core module is addressed.
pub const CORE_MODULE: &str = "core";

/// A parsed manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub core: Option<ManifestModule>,
    #[serde(default)]
    pub modules: BTreeMap<String, ManifestModule>,
}

/// One downloadable artifact in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestModule {
    /// Range-capable URL of the whole artifact.
    #[serde(default, alias = "zim_url")]
    pub url: Option<String>,
    /// One URL per chunk, in order. Takes precedence over `url`.
    #[serde(default)]
    pub chunk_urls: Option<Vec<String>>,
    /// Artifact size in bytes. Probed by the caller when absent.
    #[serde(default)]
    pub size: Option<u64>,
    /// SHA-256 of the whole artifact.
    #[serde(default, alias = "zim_sha256")]
    pub sha256: Option<String>,
    /// Chunk size the per-chunk URLs and digests refer to.
    #[serde(default)]
    pub chunk_size: Option<u64>,
    /// SHA-256 of each chunk, in order.
    #[serde(default)]
    pub chunk_sha256: Option<Vec<String>>,
    /// File name of the installed artifact.
    #[serde(default, alias = "zim_filename")]
    pub filename: Option<String>,
}

impl Manifest {
    /// Parse a manifest from JSON text.
    pub fn from_json(text: &str) -> DownloadResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| DownloadError::InvalidRequest(format!("invalid manifest: {}", e)))
    }

    /// Read and parse a manifest file.
    pub fn from_file(path: &Path) -> DownloadResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| DownloadError::io(path, e))?;
        Self::from_json(&text)
    }

    /// Look up a module by name; `"core"` addresses the core module.
    pub fn module(&self, name: &str) -> Option<&ManifestModule> {
        if name == CORE_MODULE {
            self.core.as_ref()
        } else {
            self.modules.get(name)
        }
    }

    /// Names of the optional modules.
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }

    /// Modules selected for download: the named one, or the core module.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` naming the available modules when the selection does
    /// not exist.
    pub fn select<'a>(
        &'a self,
        name: Option<&'a str>,
    ) -> DownloadResult<(&'a str, &'a ManifestModule)> {
        let name = name.unwrap_or(CORE_MODULE);
        match self.module(name) {
            Some(module) => Ok((name, module)),
            None if name == CORE_MODULE => Err(DownloadError::InvalidRequest(
                "manifest has no core module".to_string(),
            )),
            None => Err(DownloadError::InvalidRequest(format!(
                "module '{}' not found in manifest (available: {})",
                name,
                self.module_names().join(", ")
            ))),
        }
    }
}

impl ManifestModule {
    /// Content type and priority a module gets unless the caller overrides
    /// them: core content is essential and critical, the rest optional.
    pub fn defaults_for(name: &str) -> (ContentType, Priority) {
        if name == CORE_MODULE {
            (ContentType::EssentialBundle, Priority::Critical)
        } else {
            (ContentType::OptionalModule, Priority::Medium)
        }
    }

    /// Installed file name: `filename`, else the last URL path segment.
    pub fn file_name(&self, module_name: &str) -> String {
        if let Some(name) = &self.filename {
            return name.clone();
        }
        self.url
            .as_deref()
            .and_then(|url| url.split(['?', '#']).next())
            .and_then(|url| url.rsplit('/').next())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.bin", module_name))
    }

    /// Build the download request for this module.
    ///
    /// The artifact is placed at `<dest_dir>/<module name>/<file name>`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` when the module has no size or no source URL, or
    /// lists per-chunk URLs without a chunk size.
    pub fn to_request(
        &self,
        module_name: &str,
        dest_dir: &Path,
        content_type: ContentType,
        priority: Priority,
    ) -> DownloadResult<DownloadRequest> {
        let size = self.size.ok_or_else(|| {
            DownloadError::InvalidRequest(format!("module '{}' has no size", module_name))
        })?;

        let mut request = match (&self.chunk_urls, &self.url) {
            (Some(urls), _) => {
                let chunk_size = self.chunk_size.ok_or_else(|| {
                    DownloadError::InvalidRequest(format!(
                        "module '{}' lists chunk URLs without a chunk size",
                        module_name
                    ))
                })?;
                DownloadRequest::per_chunk(urls.clone(), chunk_size, size)
            }
            (None, Some(url)) => {
                let request = DownloadRequest::ranged(url.clone(), size);
                match self.chunk_size {
                    Some(chunk_size) => request.with_chunk_size(chunk_size),
                    None => request,
                }
            }
            (None, None) => {
                return Err(DownloadError::InvalidRequest(format!(
                    "module '{}' has no download URL",
                    module_name
                )))
            }
        };

        if let Some(digests) = &self.chunk_sha256 {
            request = request.with_chunk_digests(digests.clone());
        }
        if let Some(digest) = &self.sha256 {
            request = request.with_artifact_digest(digest.clone());
        }

        Ok(request
            .with_content_type(content_type)
            .with_priority(priority)
            .with_destination(self.destination(module_name, dest_dir))
            .with_label(module_name))
    }

    /// Build the request with the default content type and priority.
    pub fn to_default_request(
        &self,
        module_name: &str,
        dest_dir: &Path,
    ) -> DownloadResult<DownloadRequest> {
        let (content_type, priority) = Self::defaults_for(module_name);
        self.to_request(module_name, dest_dir, content_type, priority)
    }

    fn destination(&self, module_name: &str, dest_dir: &Path) -> PathBuf {
        dest_dir.join(module_name).join(self.file_name(module_name))
    }
}
