use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use log::{error, trace, warn};
use tempfile::NamedTempFile;
use crate::bottle::{Bottle, BottleId};
use crate::error::BottleError;
use crate::existing_directory::ExistingDirectory;

pub(crate) static RECORD_FILE: &str = "bottle.toml";

const CLEANUP_ATTEMPTS: u32 = 3;
const CLEANUP_BACKOFF: Duration = Duration::from_millis(20);

/// Durable bottle records, one `bottle.toml` inside each bottle's directory.
///
/// Writes go to a temporary file in the same directory and are renamed over the record, so a
/// reader sees either the previous record or the new one.
#[derive(Debug, Clone)]
pub struct EnvironmentStore {
    root: ExistingDirectory,
}

impl EnvironmentStore {
    /// Open a store rooted at `root`, creating the directory if needed. A relative `root` is
    /// taken against the current directory.
    pub fn open(root: PathBuf) -> Result<Self, BottleError> {
        let root = std::path::absolute(root)?;
        Ok(Self { root: ExistingDirectory::maybe_create(root)? })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// The directory owned by the bottle with `id`.
    #[must_use]
    pub fn bottle_dir(&self, id: BottleId) -> PathBuf {
        self.root.path().join(id.to_string())
    }

    #[must_use]
    pub fn record_path(&self, id: BottleId) -> PathBuf {
        self.bottle_dir(id).join(RECORD_FILE)
    }

    pub fn read(&self, id: BottleId) -> Result<Bottle, BottleError> {
        let path = self.record_path(id);
        let s = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(BottleError::NotFound(id)),
            Err(e) => return Err(BottleError::IOFailure(e)),
        };

        match toml::from_str::<Bottle>(&s) {
            Ok(mut bottle) if bottle.id() == id => {
                bottle.relocate(self.bottle_dir(id));
                Ok(bottle)
            }
            Ok(bottle) => {
                warn!("record at {} belongs to bottle {}", path.display(), bottle.id());
                Err(BottleError::Corrupt { id, path })
            }
            Err(e) => {
                warn!("failed to parse {}: {e}", path.display());
                Err(BottleError::Corrupt { id, path })
            }
        }
    }

    /// Replace the record for `bottle` in full.
    pub fn write(&self, bottle: &Bottle) -> Result<(), BottleError> {
        let dir = self.bottle_dir(bottle.id());
        fs::create_dir_all(&dir)?;

        let contents = toml::to_string(bottle).map_err(BottleError::invalid_data)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;

        let target = dir.join(RECORD_FILE);
        match tmp.persist(&target) {
            Ok(_) => {
                trace!("wrote {}", target.display());
                Ok(())
            }
            Err(e) => {
                discard(e.file);
                Err(BottleError::IOFailure(e.error))
            }
        }
    }

    /// Remove the record for `id`. Removing an absent record is not an error.
    pub fn delete(&self, id: BottleId) -> Result<(), BottleError> {
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BottleError::IOFailure(e)),
        }
    }

    /// Ids of every directory under the root that holds a record.
    pub fn ids(&self) -> Result<Vec<BottleId>, BottleError> {
        Ok(self.root.child_directories()?
            .filter(|dir| dir.path().join(RECORD_FILE).is_file())
            .filter_map(|dir| dir.path().file_name()?.to_str()?.parse().ok())
            .collect())
    }
}

/// Remove a temporary file left behind by a failed rename, retrying transient failures.
fn discard(tmp: NamedTempFile) {
    let path = match tmp.into_temp_path().keep() {
        Ok(path) => path,
        Err(e) => {
            error!("could not release temporary record: {}", e.error);
            return;
        }
    };

    for attempt in 1..=CLEANUP_ATTEMPTS {
        match fs::remove_file(&path) {
            Ok(()) => return,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) if attempt == CLEANUP_ATTEMPTS => {
                error!("failed to remove temporary record {}: {e}", path.display());
            }
            Err(_) => thread::sleep(CLEANUP_BACKOFF),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bottle::{Dependency, DllOverride};
    use crate::overlay::{Overlay, OverlayPatch};
    use tempfile::TempDir;

    fn store() -> (TempDir, EnvironmentStore) {
        let tmp = TempDir::new().unwrap();
        let store = EnvironmentStore::open(tmp.path().join("bottles")).unwrap();
        (tmp, store)
    }

    fn bottle(store: &EnvironmentStore) -> Bottle {
        let id = BottleId::new();
        let overlay: Overlay = [("DXVK_HUD", "fps")].into_iter().collect();
        Bottle::new(id, "Game1", store.bottle_dir(id), "wine-9.0", overlay)
    }

    #[test]
    fn write_then_read_returns_the_same_record() {
        let (_tmp, store) = store();
        let mut b = bottle(&store);
        b.set_dll_override("d3d9", Some(DllOverride::NativeBuiltin));
        b.record_dependency(Dependency { name: "corefonts".to_owned(), uninstaller: None });
        b.record_dependency(Dependency { name: "dotnet48".to_owned(), uninstaller: Some("NET Framework".to_owned()) });

        store.write(&b).unwrap();
        assert_eq!(store.read(b.id()).unwrap(), b);
    }

    #[test]
    fn write_replaces_the_whole_record() {
        let (_tmp, store) = store();
        let mut b = bottle(&store);
        store.write(&b).unwrap();

        b.apply_patch(&OverlayPatch::new().unset("DXVK_HUD").set("LANG", "C"));
        store.write(&b).unwrap();

        let read = store.read(b.id()).unwrap();
        assert!(!read.overlay().contains_key("DXVK_HUD"));
        assert_eq!(read, b);
    }

    #[test]
    fn write_leaves_no_temporary_files() {
        let (_tmp, store) = store();
        let b = bottle(&store);
        store.write(&b).unwrap();
        store.write(&b).unwrap();

        let entries = fs::read_dir(store.bottle_dir(b.id())).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn reading_a_missing_record_is_not_found() {
        let (_tmp, store) = store();
        let id = BottleId::new();
        assert!(matches!(store.read(id), Err(BottleError::NotFound(missing)) if missing == id));
    }

    #[test]
    fn garbage_records_are_corrupt() {
        let (_tmp, store) = store();
        let id = BottleId::new();
        fs::create_dir_all(store.bottle_dir(id)).unwrap();
        fs::write(store.record_path(id), "this is = not [ a bottle").unwrap();

        assert!(matches!(store.read(id), Err(BottleError::Corrupt { .. })));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_tmp, store) = store();
        let b = bottle(&store);
        store.write(&b).unwrap();

        store.delete(b.id()).unwrap();
        store.delete(b.id()).unwrap();
        store.delete(BottleId::new()).unwrap();
        assert!(matches!(store.read(b.id()), Err(BottleError::NotFound(_))));
    }

    #[test]
    fn records_follow_the_store_when_it_moves() {
        let (tmp, store) = store();
        let b = bottle(&store);
        store.write(&b).unwrap();

        let moved = tmp.path().join("moved");
        fs::rename(store.root(), &moved).unwrap();
        let store = EnvironmentStore::open(moved.clone()).unwrap();

        let read = store.read(b.id()).unwrap();
        assert_eq!(read.root(), store.bottle_dir(b.id()));
        assert!(read.prefix().starts_with(&moved));
    }

    #[test]
    fn stale_roots_in_records_are_ignored() {
        let (_tmp, store) = store();
        let b = bottle(&store);
        store.write(&b).unwrap();

        let record = fs::read_to_string(store.record_path(b.id())).unwrap();
        assert!(!record.contains("root"));
        fs::write(store.record_path(b.id()), format!("root = \"/somewhere/else\"\n{record}")).unwrap();
        assert_eq!(store.read(b.id()).unwrap().root(), store.bottle_dir(b.id()));
    }

    #[test]
    fn relative_roots_are_made_absolute() {
        let relative = PathBuf::from("target").join(format!("store-{}", BottleId::new()));
        let store = EnvironmentStore::open(relative.clone()).unwrap();
        let absolute = store.root().to_owned();
        fs::remove_dir_all(&relative).unwrap();

        assert!(absolute.is_absolute());
        assert!(absolute.ends_with(&relative));
    }

    #[test]
    fn ids_lists_only_directories_with_records() {
        let (_tmp, store) = store();
        let b = bottle(&store);
        store.write(&b).unwrap();
        fs::create_dir_all(store.bottle_dir(BottleId::new())).unwrap();
        fs::create_dir_all(store.root().join("not-a-uuid")).unwrap();

        assert_eq!(store.ids().unwrap(), vec![b.id()]);
    }
}
