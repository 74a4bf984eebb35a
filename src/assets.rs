//! Read-only index of the frontend bundle
//!
//! The bundle is either preloaded into memory at startup or read from its directory
//! on each request. Both backings resolve names the same way: the requested path is
//! cleaned lexically against `/`, so `..` can never climb out of the bundle root,
//! and only regular files are ever returned.

use hyper::body::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Errors opening an asset
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("asset not found")]
    NotFound,
    #[error("permission denied")]
    Permission,
    #[error("failed to read asset: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for AssetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => AssetError::NotFound,
            io::ErrorKind::PermissionDenied => AssetError::Permission,
            _ => AssetError::Io(err),
        }
    }
}

/// A single file of the bundle
#[derive(Debug, Clone)]
pub struct Asset {
    name: String,
    content: Bytes,
    etag: String,
}

impl Asset {
    pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        let digest = Sha256::digest(&content);

        Self {
            name: name.into(),
            etag: format!("\"{}\"", &hex::encode(digest)[..16]),
            content,
        }
    }

    /// Cleaned path of the asset, always starting with `/`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    /// Strong entity tag, a quoted SHA-256 prefix of the content
    pub fn etag(&self) -> &str {
        &self.etag
    }
}

enum Source {
    Memory(HashMap<String, Asset>),
    Directory(PathBuf),
}

/// Frontend bundle index
pub struct AssetStore {
    source: Source,
}

impl AssetStore {
    /// Build an in-memory store from `(path, content)` pairs
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Bytes>,
    {
        let files = entries
            .into_iter()
            .map(|(name, content)| {
                let name = clean_path(name.as_ref());
                (name.clone(), Asset::new(name, content))
            })
            .collect();

        Self {
            source: Source::Memory(files),
        }
    }

    /// Preload every regular file under `dir` into memory
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, AssetError> {
        let dir = dir.as_ref();
        let mut files = HashMap::new();
        collect_files(dir, dir, &mut files)?;

        debug!(dir = %dir.display(), files = files.len(), "Frontend bundle loaded");

        Ok(Self {
            source: Source::Memory(files),
        })
    }

    /// Serve files straight from `dir`, reading them on every request
    pub fn directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::Directory(dir.into()),
        }
    }

    /// Number of preloaded files (0 for directory-backed stores)
    pub fn len(&self) -> usize {
        match &self.source {
            Source::Memory(files) => files.len(),
            Source::Directory(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open the asset at `path`
    ///
    /// Directories and other non-regular entries are reported as [`AssetError::NotFound`].
    pub async fn open(&self, path: &str) -> Result<Asset, AssetError> {
        let name = clean_path(path);

        match &self.source {
            Source::Memory(files) => files.get(&name).cloned().ok_or(AssetError::NotFound),
            Source::Directory(root) => {
                let relative = name.trim_start_matches('/');
                if relative.is_empty() || relative.contains('\0') {
                    return Err(AssetError::NotFound);
                }

                let full_path = root.join(relative);
                let metadata = tokio::fs::metadata(&full_path).await?;
                if !metadata.is_file() {
                    return Err(AssetError::NotFound);
                }

                let content = tokio::fs::read(&full_path).await?;
                Ok(Asset::new(name, content))
            }
        }
    }
}

fn collect_files(
    root: &Path,
    dir: &Path,
    files: &mut HashMap<String, Asset>,
) -> Result<(), AssetError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = std::fs::metadata(&path)?;

        if metadata.is_dir() {
            collect_files(root, &path, files)?;
        } else if metadata.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| AssetError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let name = clean_path(&name);
            let asset = Asset::new(name.clone(), std::fs::read(&path)?);
            files.insert(name, asset);
        }
    }

    Ok(())
}

/// Lexically clean `path` against the root: the result starts with `/`, has no
/// `.`/`..` or empty segments, and never climbs above `/`
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    format!("/{}", segments.join("/"))
}
