use std::path::{Path, PathBuf};

use hhj_result::Result;
use tempfile::TempDir;

const SPILL_DIR_PREFIX: &str = "hhj-join-";

/// Scoped working directory holding every spill file of one join.
///
/// Created at join start. Dropping it removes the directory and its contents,
/// which covers the cancellation and failure paths; [`SpillDir::close`]
/// removes it eagerly and reports removal errors.
#[derive(Debug)]
pub struct SpillDir {
    dir: TempDir,
}

impl SpillDir {
    /// Create a fresh directory under `parent`, or under the system temp
    /// directory when no parent is given.
    pub fn create(parent: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SPILL_DIR_PREFIX);
        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        tracing::debug!(path = %dir.path().display(), "created spill directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn file_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Remove the directory now.
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        tracing::debug!(path = %path.display(), "removed spill directory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let path = {
            let dir = SpillDir::create(Some(parent.path())).unwrap();
            std::fs::write(dir.file_path("x.spill"), b"abc").unwrap();
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_close_removes_dir() {
        let dir = SpillDir::create(None).unwrap();
        let path = dir.path().to_path_buf();
        assert!(path.exists());
        dir.close().unwrap();
        assert!(!path.exists());
    }
}
