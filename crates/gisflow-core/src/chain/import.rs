// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Import source resolution.
//!
//! The compiler never talks to satellite archives itself. It asks an
//! [`ImportResolver`] for concrete download URLs and local file names, then
//! generates download and import processes from the answer.

use async_trait::async_trait;
use url::Url;

use super::model::ImportType;

/// A file to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    /// Source URL.
    pub url: String,
    /// Local file name (no directories).
    pub file_name: String,
}

/// One file of a satellite scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneFile {
    /// Band name (e.g. `B04`, `B1`, `MTL`).
    pub band: String,
    /// Where to fetch it.
    pub target: DownloadTarget,
}

/// Resolves import sources to downloadable files.
#[async_trait]
pub trait ImportResolver: Send + Sync {
    /// Resolve a generic URL.
    async fn resolve_url(&self, source: &str) -> Result<DownloadTarget, String>;

    /// Resolve the requested bands of a Sentinel-2 or Landsat scene.
    async fn resolve_scene(
        &self,
        kind: ImportType,
        scene_id: &str,
        bands: &[String],
    ) -> Result<Vec<SceneFile>, String>;
}

/// Resolver that downloads URLs as given and knows no scene archives.
#[derive(Debug, Clone, Default)]
pub struct DirectUrlResolver;

/// File name of a URL's last path segment.
pub fn file_name_of(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(sanitize_file_name)
        .unwrap_or_else(|| "download".to_string())
}

/// Keep only characters safe in a file name.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl ImportResolver for DirectUrlResolver {
    async fn resolve_url(&self, source: &str) -> Result<DownloadTarget, String> {
        let url = Url::parse(source).map_err(|e| format!("invalid URL '{source}': {e}"))?;
        match url.scheme() {
            "http" | "https" | "ftp" => {}
            other => return Err(format!("unsupported URL scheme '{other}'")),
        }
        Ok(DownloadTarget {
            file_name: file_name_of(&url),
            url: url.to_string(),
        })
    }

    async fn resolve_scene(
        &self,
        kind: ImportType,
        scene_id: &str,
        _bands: &[String],
    ) -> Result<Vec<SceneFile>, String> {
        Err(format!(
            "no scene archive configured for {kind:?} scene '{scene_id}'"
        ))
    }
}
