//! Sandbox backed by a local directory.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::fs;

use crate::io::sandbox::{DirEntry, EntryKind, SandboxFs};

/// Files live under `root`; processes run with `root` as working directory.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    root: PathBuf,
}

impl LocalSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a sandbox path onto the host, rejecting escapes.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    bail!("path {path:?} escapes the sandbox root")
                }
            }
        }
        Ok(resolved)
    }

    fn resolve_non_root(&self, path: &str) -> Result<PathBuf> {
        let resolved = self.resolve(path)?;
        if resolved == self.root {
            bail!("refusing to operate on the sandbox root");
        }
        Ok(resolved)
    }
}

impl SandboxFs for LocalSandbox {
    async fn mkdir(&self, path: &str, recursive: bool) -> Result<()> {
        let target = self.resolve(path)?;
        let result = if recursive {
            fs::create_dir_all(&target).await
        } else {
            fs::create_dir(&target).await
        };
        result.with_context(|| format!("create directory {}", target.display()))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve_non_root(path)?;
        fs::write(&target, content)
            .await
            .with_context(|| format!("write {}", target.display()))
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let target = self.resolve_non_root(path)?;
        fs::read_to_string(&target)
            .await
            .with_context(|| format!("read {}", target.display()))
    }

    async fn rm(&self, path: &str, recursive: bool) -> Result<()> {
        let target = self.resolve_non_root(path)?;
        let meta = fs::symlink_metadata(&target)
            .await
            .with_context(|| format!("stat {}", target.display()))?;
        let result = match (meta.is_dir(), recursive) {
            (true, true) => fs::remove_dir_all(&target).await,
            (true, false) => fs::remove_dir(&target).await,
            (false, _) => fs::remove_file(&target).await,
        };
        result.with_context(|| format!("remove {}", target.display()))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let target = self.resolve(path)?;
        let mut reader = match fs::read_dir(&target).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == ErrorKind::NotFound && target == self.root => {
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read dir {}", target.display()));
            }
        };
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .with_context(|| format!("read dir entry in {}", target.display()))?
        {
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("file type of {}", entry.path().display()))?;
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
