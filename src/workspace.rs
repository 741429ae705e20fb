//! Per-user persistent workspace directories.
//!
//! A workspace is created on first session and bind-mounted at /workspace;
//! it is never removed when the session ends.

use anyhow::{Context, Result};
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::info;

const SHELL_INIT: &str = r#"# gpu sandbox workspace
export PS1='\[\033[01;32m\]\u@\h\[\033[00m\]:\[\033[01;34m\]\w\[\033[00m\]\$ '
alias ll='ls -alF'
alias la='ls -A'
alias l='ls -CF'

echo "Allocated GPU:"
nvidia-smi -L 2>/dev/null || echo "no GPU visible"
echo "Workspace: /workspace"
echo ""
"#;

/// Creates and seeds per-user workspace directories under a fixed root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure `<root>/<user_id>` exists (mode 0755) and carries the shell
    /// init file. The seed happens once; an existing workspace is returned
    /// untouched.
    pub fn ensure(&self, user_id: &str) -> Result<PathBuf> {
        let dir = self.root.join(user_id);

        if !dir.exists() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(&dir)
                .with_context(|| format!("creating workspace directory {}", dir.display()))?;
            info!(user_id, path = %dir.display(), "created workspace directory");
        }

        let shell_init = dir.join(".bashrc");
        if !shell_init.exists() {
            std::fs::write(&shell_init, SHELL_INIT)
                .with_context(|| format!("seeding shell init file {}", shell_init.display()))?;
        }

        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn creates_and_seeds_once() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());

        let dir = manager.ensure("u1").unwrap();
        assert!(dir.is_dir());
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        let shell_init = dir.join(".bashrc");
        assert!(shell_init.is_file());

        // User content survives a second ensure.
        std::fs::write(&shell_init, "# customized").unwrap();
        std::fs::write(dir.join("notes.txt"), "keep me").unwrap();
        let again = manager.ensure("u1").unwrap();
        assert_eq!(again, dir);
        assert_eq!(
            std::fs::read_to_string(&shell_init).unwrap(),
            "# customized"
        );
        assert!(dir.join("notes.txt").exists());
    }
}
