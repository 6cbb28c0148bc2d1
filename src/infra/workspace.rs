//! On-disk layout of job workspaces under the configured temp root.

use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::fs;
use tracing::info;

use crate::domain::types::JobIdentifier;

/// Directory holding one workspace per admitted identifier.
#[derive(Debug, Clone)]
pub struct WorkspaceRoot {
    root: PathBuf,
}

impl WorkspaceRoot {
    /// Root the workspaces at the provided directory, creating it if necessary.
    pub fn new(root: PathBuf) -> Result<Self, io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, identifier: &JobIdentifier) -> PathBuf {
        self.root.join(identifier.as_str())
    }

    /// Atomically create the workspace directory.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] when another submission of
    /// the same content got there first; that error is the only duplicate
    /// signal in the system.
    pub async fn create_exclusive(&self, identifier: &JobIdentifier) -> io::Result<Workspace> {
        let path = self.path_for(identifier);
        fs::create_dir(&path).await?;
        Ok(Workspace {
            identifier: identifier.clone(),
            path,
        })
    }

    /// Delete workspace directories left behind by an earlier process.
    ///
    /// Only directories named like an identifier are touched; anything else
    /// sharing the temp root is left alone.
    pub async fn sweep_stale(&self) -> io::Result<usize> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let is_workspace = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.parse::<JobIdentifier>().is_ok());
            if is_workspace && entry.file_type().await?.is_dir() {
                info!(
                    target = "infra::workspace",
                    path = %entry.path().display(),
                    "deleting stale workspace"
                );
                fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Open an existing workspace, if one is present.
    pub async fn open(&self, identifier: &JobIdentifier) -> io::Result<Option<Workspace>> {
        let path = self.path_for(identifier);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(Some(Workspace {
                identifier: identifier.clone(),
                path,
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// A single job's directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    identifier: JobIdentifier,
    path: PathBuf,
}

impl Workspace {
    pub fn identifier(&self) -> &JobIdentifier {
        &self.identifier
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    /// Top-level regular files ending in `.{extension}`, in directory-listing order.
    pub async fn files_with_extension(&self, extension: &str) -> io::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut matches = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let has_extension = path
                .extension()
                .and_then(|value| value.to_str())
                .is_some_and(|value| value.eq_ignore_ascii_case(extension));
            if has_extension && entry.file_type().await?.is_file() {
                matches.push(path);
            }
        }
        Ok(matches)
    }

    /// Remove stale `*.pdf` and `*.log` outputs so a render starts from a clean slate.
    pub async fn remove_outputs(&self) -> io::Result<usize> {
        let mut removed = 0;
        for extension in ["pdf", "log"] {
            for path in self.files_with_extension(extension).await? {
                info!(
                    target = "infra::workspace",
                    path = %path.display(),
                    "deleting stale output"
                );
                fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identifier() -> JobIdentifier {
        JobIdentifier::from_bytes(b"workspace test")
    }

    #[tokio::test]
    async fn second_exclusive_create_reports_already_exists() {
        let dir = TempDir::new().expect("temp dir");
        let root = WorkspaceRoot::new(dir.path().to_path_buf()).expect("root");

        let workspace = root
            .create_exclusive(&identifier())
            .await
            .expect("first create");
        assert!(workspace.path().is_dir());

        let err = root
            .create_exclusive(&identifier())
            .await
            .expect_err("second create");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn sweep_removes_only_identifier_directories() {
        let dir = TempDir::new().expect("temp dir");
        let root = WorkspaceRoot::new(dir.path().to_path_buf()).expect("root");
        let workspace = root.create_exclusive(&identifier()).await.expect("create");
        std::fs::write(workspace.join("doc.md"), "x").expect("write");
        std::fs::create_dir(dir.path().join("unrelated")).expect("dir");
        std::fs::write(dir.path().join("a".repeat(64)), "file").expect("file");

        assert_eq!(root.sweep_stale().await.expect("sweep"), 1);
        assert!(!workspace.path().exists());
        assert!(dir.path().join("unrelated").is_dir());
        assert!(dir.path().join("a".repeat(64)).is_file());
    }

    #[tokio::test]
    async fn open_returns_none_for_unknown_identifier() {
        let dir = TempDir::new().expect("temp dir");
        let root = WorkspaceRoot::new(dir.path().to_path_buf()).expect("root");
        assert!(root.open(&identifier()).await.expect("open").is_none());
    }

    #[tokio::test]
    async fn remove_outputs_keeps_inputs() {
        let dir = TempDir::new().expect("temp dir");
        let root = WorkspaceRoot::new(dir.path().to_path_buf()).expect("root");
        let workspace = root.create_exclusive(&identifier()).await.expect("create");

        for name in ["doc.md", "doc.pdf", "doc.log", "gear.eps"] {
            std::fs::write(workspace.join(name), "x").expect("write");
        }
        std::fs::create_dir(workspace.join("nested.pdf")).expect("dir");

        let removed = workspace.remove_outputs().await.expect("remove");
        assert_eq!(removed, 2);
        assert!(workspace.join("doc.md").exists());
        assert!(workspace.join("gear.eps").exists());
        assert!(workspace.join("nested.pdf").is_dir());
        assert!(!workspace.join("doc.pdf").exists());
    }
}
