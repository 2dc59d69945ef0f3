//! # Manifest Builder
//!
//! A [`Manifest`] maps every regular file under a sync root to its content
//! digest. Keys are POSIX-style relative paths (`dir/file.txt`) so both sides
//! compare equal regardless of platform. Directories are not represented, so
//! an empty directory is never synchronized on its own.
//!
//! [`build_manifest`] either walks the whole tree or fails; it never hands
//! back a partial manifest.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result, SyncError};
use crate::hash::{digest_file, Digest};

/// Suffix of in-flight download artifacts. Never part of a manifest.
pub const TEMP_SUFFIX: &str = ".tsync-part";

/// What to do with symbolic links found while walking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SymlinkPolicy {
    #[default]
    Skip,
    Follow,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub symlinks: SymlinkPolicy,
}

/// Relative path → content digest for one side of the sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, Digest>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, digest: Digest) -> Option<Digest> {
        self.entries.insert(path.into(), digest)
    }

    pub fn remove(&mut self, path: &str) -> Option<Digest> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&Digest> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Digest)> {
        self.entries.iter().map(|(path, digest)| (path.as_str(), digest))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Paths under `dir` (exclusive), e.g. every file of a removed directory.
    pub fn paths_under<'a>(&'a self, dir: &str) -> impl Iterator<Item = &'a str> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.entries
            .range(prefix.clone()..)
            .take_while(move |(path, _)| path.starts_with(&prefix))
            .map(|(path, _)| path.as_str())
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a peer's manifest, rejecting any path that could escape the root.
    pub fn from_json(data: &[u8]) -> std::result::Result<Self, ProtocolError> {
        let manifest: Manifest =
            serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed {
                command: "MANIFEST",
                reason: e.to_string(),
            })?;
        for path in manifest.paths() {
            validate_relative_path(path)?;
        }
        Ok(manifest)
    }
}

impl FromIterator<(String, Digest)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (String, Digest)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Check that `rel` is a plain forward-slash path that stays inside the root.
pub fn validate_relative_path(rel: &str) -> std::result::Result<&str, ProtocolError> {
    let invalid = rel.is_empty()
        || rel.starts_with('/')
        || rel.contains('\\')
        || rel.contains('\0')
        || rel
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");

    if invalid {
        return Err(ProtocolError::InvalidPath(rel.to_string()));
    }
    Ok(rel)
}

/// Map a validated relative path onto the local filesystem under `root`.
pub fn resolve(root: &Path, rel: &str) -> std::result::Result<PathBuf, ProtocolError> {
    validate_relative_path(rel)?;
    let mut path = root.to_path_buf();
    for segment in rel.split('/') {
        path.push(segment);
    }
    Ok(path)
}

/// Forward-slash form of `path` relative to `root`, if it lies under it.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

pub fn is_temp_artifact(path: &str) -> bool {
    path.ends_with(TEMP_SUFFIX)
}

/// Walk `root` and hash every regular file under it.
pub async fn build_manifest(root: &Path, options: &ScanOptions) -> Result<Manifest> {
    let metadata = tokio::fs::metadata(root)
        .await
        .map_err(|e| SyncError::io(root, e))?;
    if !metadata.is_dir() {
        return Err(SyncError::io(
            root,
            io::Error::new(io::ErrorKind::InvalidInput, "sync root is not a directory"),
        ));
    }

    let mut manifest = Manifest::new();
    let mut visited = HashSet::new();
    if options.symlinks == SymlinkPolicy::Follow {
        let canonical = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| SyncError::io(root, e))?;
        visited.insert(canonical);
    }

    walk(root, root, options, &mut visited, &mut manifest).await?;
    debug!("Built manifest for {} ({} files)", root.display(), manifest.len());
    Ok(manifest)
}

fn walk<'a>(
    root: &'a Path,
    dir: &'a Path,
    options: &'a ScanOptions,
    visited: &'a mut HashSet<PathBuf>,
    manifest: &'a mut Manifest,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| SyncError::io(dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::io(dir, e))?
        {
            let path = entry.path();
            let mut file_type = entry
                .file_type()
                .await
                .map_err(|e| SyncError::io(&path, e))?;

            if file_type.is_symlink() {
                if options.symlinks == SymlinkPolicy::Skip {
                    debug!("Skipping symlink {}", path.display());
                    continue;
                }
                match tokio::fs::metadata(&path).await {
                    Ok(target) => file_type = target.file_type(),
                    Err(e) => {
                        warn!("Skipping dangling symlink {}: {}", path.display(), e);
                        continue;
                    }
                }
            }

            if file_type.is_dir() {
                if options.symlinks == SymlinkPolicy::Follow {
                    let canonical = tokio::fs::canonicalize(&path)
                        .await
                        .map_err(|e| SyncError::io(&path, e))?;
                    if !visited.insert(canonical) {
                        debug!("Skipping already visited directory {}", path.display());
                        continue;
                    }
                }
                walk(root, &path, options, visited, manifest).await?;
            } else if file_type.is_file() {
                add_file(root, &path, manifest).await?;
            } else {
                debug!("Skipping special file {}", path.display());
            }
        }

        Ok(())
    })
}

async fn add_file(root: &Path, path: &Path, manifest: &mut Manifest) -> Result<()> {
    let Some(relative) = relative_path(root, path) else {
        warn!("Skipping file with a non UTF-8 name: {}", path.display());
        return Ok(());
    };
    if is_temp_artifact(&relative) {
        return Ok(());
    }
    // Names such as `a\b` are legal on Unix but cannot cross the wire.
    if let Err(e) = validate_relative_path(&relative) {
        warn!("Skipping file that cannot be synchronized: {}", e);
        return Ok(());
    }

    match digest_file(path).await {
        Ok(digest) => {
            manifest.insert(relative, digest);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("{} vanished while building the manifest", relative);
            Ok(())
        }
        Err(e) => Err(SyncError::io(path, e)),
    }
}
