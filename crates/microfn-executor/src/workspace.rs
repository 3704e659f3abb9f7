//! Ephemeral invocation workspaces.
//!
//! Each cold invocation owns exactly one uniquely-named temp directory
//! holding the materialized user code, the serialized event, and the
//! generated bootstrap. The workspace is destroyed on every exit path;
//! reclamation failures are logged and swallowed, never surfaced.

use std::path::{Path, PathBuf};

use microfn_common::protocol::RESULT_FILE_NAME;
use microfn_common::{Result, SandboxError};
use tempfile::TempDir;
use tracing::{debug, warn};

pub struct EphemeralWorkspace {
    // `None` once explicitly reclaimed. The TempDir drop guard still deletes
    // the directory if an invocation unwinds before reaching `reclaim`.
    dir: Option<TempDir>,
}

impl EphemeralWorkspace {
    pub fn create() -> Result<Self> {
        Self::build(tempfile::Builder::new().prefix("microfn-").tempdir())
    }

    /// Create the workspace under a configured root instead of the system
    /// temp directory (e.g. a tmpfs mount dedicated to invocations).
    pub fn create_in(root: &Path) -> Result<Self> {
        Self::build(tempfile::Builder::new().prefix("microfn-").tempdir_in(root))
    }

    fn build(dir: std::io::Result<TempDir>) -> Result<Self> {
        let dir =
            dir.map_err(|e| SandboxError::Transport(format!("failed to create workspace: {e}")))?;
        debug!(path = %dir.path().display(), "created ephemeral workspace");
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        self.dir
            .as_ref()
            .expect("workspace used after reclamation")
            .path()
    }

    pub fn result_path(&self) -> PathBuf {
        self.path().join(RESULT_FILE_NAME)
    }

    pub async fn write_file(&self, name: &str, contents: impl AsRef<[u8]>) -> Result<PathBuf> {
        let path = self.path().join(name);
        tokio::fs::write(&path, contents.as_ref()).await?;
        Ok(path)
    }

    /// Recursively delete the workspace. Best-effort: a failure here must
    /// never fail the invocation that owned the workspace.
    pub async fn reclaim(mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.into_path();
            if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                warn!(path = %path.display(), error = %err, "failed to reclaim workspace");
            } else {
                debug!(path = %path.display(), "reclaimed workspace");
            }
        }
    }
}
