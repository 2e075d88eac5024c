use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use crate::error::BottleError;

/// A path that was a directory when this value was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExistingDirectory {
    path: PathBuf
}

impl ExistingDirectory {
    /// Open `path`, creating it and any missing parents first.
    pub fn maybe_create(path: PathBuf) -> Result<Self, BottleError> {
        if !path.exists() {
            fs::create_dir_all(&path)?;
        }

        Self::try_from(path)
    }

    /// Iterate the immediate child directories, skipping entries that cannot be read.
    pub fn child_directories(&self) -> Result<impl Iterator<Item = ExistingDirectory>, BottleError> {
        Ok(fs::read_dir(&self.path)?
            .filter_map(|e| Some(e.ok()?.path()))
            .filter_map(|p| ExistingDirectory::try_from(p).ok()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn maybe_create_makes_nested_directories() {
        let tmp = TempDir::new().unwrap();
        let dir = ExistingDirectory::maybe_create(tmp.path().join("a/b/c")).unwrap();
        assert!(dir.path().is_dir());
    }

    #[test]
    fn files_are_not_directories() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("file");
        fs::write(&file, "").unwrap();
        assert!(matches!(ExistingDirectory::try_from(file), Err(BottleError::NotADirectory(_))));
    }

    #[test]
    fn child_directories_skips_files() {
        let tmp = TempDir::new().unwrap();
        let root = ExistingDirectory::maybe_create(tmp.path().to_owned()).unwrap();
        fs::create_dir(tmp.path().join("one")).unwrap();
        fs::write(tmp.path().join("two"), "").unwrap();

        let children = root.child_directories().unwrap().collect::<Vec<_>>();
        assert_eq!(children.len(), 1);
        assert!(children[0].path().ends_with("one"));
    }
}
