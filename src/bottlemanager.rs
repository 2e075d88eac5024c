use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{error, info, warn};
use parking_lot::Mutex;
use crate::bottle::{Bottle, BottleId, Dependency, DllOverride, PREFIX_SUBDIR};
use crate::coordinator::{Contention, MutationGuard, OperationCoordinator};
use crate::error::BottleError;
use crate::overlay::{Overlay, OverlayPatch};
use crate::runner::RunnerRegistry;
use crate::store::{EnvironmentStore, RECORD_FILE};

/// Creates, changes and removes bottles. Owns their store records.
#[derive(Debug)]
pub struct BottleManager {
    store: EnvironmentStore,
    runners: Arc<RunnerRegistry>,
    coordinator: OperationCoordinator,
    unique_names: bool,
    pending_names: Mutex<HashSet<String>>,
    remove_entry: RemoveEntry,
}

/// Removes one entry of a bottle directory during delete.
type RemoveEntry = fn(&Path, fs::FileType) -> io::Result<()>;

/// A snapshot of bottles, most recently used first. Iterate it as often as needed.
#[derive(Debug, Clone, Default)]
pub struct BottleList {
    bottles: Vec<Bottle>,
}

impl BottleList {
    pub fn iter(&self) -> std::slice::Iter<'_, Bottle> {
        self.bottles.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bottles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bottles.is_empty()
    }
}

impl<'a> IntoIterator for &'a BottleList {
    type Item = &'a Bottle;
    type IntoIter = std::slice::Iter<'a, Bottle>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for BottleList {
    type Item = Bottle;
    type IntoIter = std::vec::IntoIter<Bottle>;

    fn into_iter(self) -> Self::IntoIter {
        self.bottles.into_iter()
    }
}

/// Holds a display name while a create is in flight so two creates cannot both claim it.
struct NameReservation<'a> {
    names: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        self.names.lock().remove(&self.name);
    }
}

impl BottleManager {
    pub fn new(store: EnvironmentStore, runners: Arc<RunnerRegistry>, coordinator: OperationCoordinator, unique_names: bool) -> Self {
        BottleManager {
            store,
            runners,
            coordinator,
            unique_names,
            pending_names: Mutex::new(HashSet::new()),
            remove_entry,
        }
    }

    #[cfg(test)]
    fn with_remove_entry(mut self, remove_entry: RemoveEntry) -> Self {
        self.remove_entry = remove_entry;
        self
    }

    #[must_use]
    pub fn store(&self) -> &EnvironmentStore {
        &self.store
    }

    #[must_use]
    pub fn coordinator(&self) -> &OperationCoordinator {
        &self.coordinator
    }

    /// Create a bottle named `name` on runner `runner_id`, starting from `overlay`.
    ///
    /// # Errors
    ///  - `InvalidName` if the name is blank
    ///  - `UnknownRunner` if the runner is not registered; nothing is written to disk
    ///  - `DuplicateName` if names must be unique and one is taken
    pub fn create(&self, name: &str, runner_id: &str, overlay: Overlay) -> Result<Bottle, BottleError> {
        if name.trim().is_empty() {
            return Err(BottleError::InvalidName(name.to_owned()));
        }

        let runner = self.runners.resolve(runner_id)?;

        let _reservation = if self.unique_names {
            Some(self.reserve_name(name)?)
        } else {
            None
        };

        let (id, root, _guard) = self.claim_root()?;
        if let Err(e) = fs::create_dir(root.join(PREFIX_SUBDIR)) {
            remove_quietly(&root);
            return Err(e.into());
        }

        let bottle = Bottle::new(id, name, root, runner.id(), overlay);
        if let Err(e) = self.store.write(&bottle) {
            remove_quietly(bottle.root());
            return Err(e);
        }

        info!("created bottle {name} ({id}) on {}", runner.id());
        Ok(bottle)
    }

    fn reserve_name(&self, name: &str) -> Result<NameReservation<'_>, BottleError> {
        if !self.pending_names.lock().insert(name.to_owned()) {
            return Err(BottleError::DuplicateName(name.to_owned()));
        }
        let reservation = NameReservation { names: &self.pending_names, name: name.to_owned() };

        if self.find_by_name(name)?.is_some() {
            return Err(BottleError::DuplicateName(name.to_owned()));
        }

        Ok(reservation)
    }

    /// Pick a fresh id and create its directory. Creating the directory is what claims the id.
    fn claim_root(&self) -> Result<(BottleId, PathBuf, MutationGuard), BottleError> {
        loop {
            let id = BottleId::new();
            let guard = self.begin_mutation(id)?;
            let root = self.store.bottle_dir(id);
            match fs::create_dir(&root) {
                Ok(()) => return Ok((id, root, guard)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Delete a bottle's files and record.
    ///
    /// The record goes last: if any file cannot be removed the record stays, marked corrupt,
    /// and `Corrupt` is returned.
    ///
    /// # Errors
    ///  - `NotFound` if there is no such bottle
    ///  - `InUse` while programs launched in it are running
    ///  - `Busy` while another change to it is in progress
    pub fn delete(&self, id: BottleId) -> Result<(), BottleError> {
        let _guard = self.coordinator.begin_mutation(id).map_err(|c| match c {
            Contention::Launching(_) => BottleError::InUse(id),
            Contention::Mutating => BottleError::Busy(id),
        })?;

        let bottle = match self.store.read(id) {
            Ok(bottle) => Some(bottle),
            Err(BottleError::Corrupt { .. }) => None,
            Err(e) => return Err(e),
        };

        let dir = self.store.bottle_dir(id);
        if let Err((path, e)) = remove_contents_except(&dir, RECORD_FILE, self.remove_entry) {
            error!("failed to remove {}: {e}", path.display());
            if let Some(mut bottle) = bottle {
                bottle.mark_corrupt();
                if let Err(e) = self.store.write(&bottle) {
                    error!("failed to mark bottle {id} corrupt: {e}");
                }
            }
            warn!("bottle {id} is corrupt");
            return Err(BottleError::Corrupt { id, path });
        }

        self.store.delete(id)?;
        if let Err(e) = fs::remove_dir(&dir) {
            warn!("could not remove {}: {e}", dir.display());
        }

        info!("deleted bottle {id}");
        Ok(())
    }

    /// Merge `patch` into the bottle's overlay and return the updated bottle.
    pub fn configure(&self, id: BottleId, patch: &OverlayPatch) -> Result<Bottle, BottleError> {
        self.mutate(id, |bottle| {
            bottle.apply_patch(patch);
            Ok(())
        })
    }

    /// Move the bottle to another runner.
    pub fn set_runner(&self, id: BottleId, runner_id: &str) -> Result<Bottle, BottleError> {
        let runner = self.runners.resolve(runner_id)?;
        self.mutate(id, |bottle| {
            bottle.set_runner(runner.id());
            Ok(())
        })
    }

    /// Set how wine loads `dll` in this bottle; `None` drops the override.
    pub fn set_dll_override(&self, id: BottleId, dll: &str, mode: Option<DllOverride>) -> Result<Bottle, BottleError> {
        self.mutate(id, |bottle| {
            bottle.set_dll_override(dll, mode);
            Ok(())
        })
    }

    pub fn record_dependency(&self, id: BottleId, dependency: Dependency) -> Result<Bottle, BottleError> {
        self.mutate(id, |bottle| {
            bottle.record_dependency(dependency);
            Ok(())
        })
    }

    pub fn forget_dependency(&self, id: BottleId, name: &str) -> Result<Bottle, BottleError> {
        self.mutate(id, |bottle| {
            if !bottle.forget_dependency(name) {
                info!("{name} was not recorded in bottle {id}");
            }
            Ok(())
        })
    }

    fn mutate<F>(&self, id: BottleId, change: F) -> Result<Bottle, BottleError>
    where
        F: FnOnce(&mut Bottle) -> Result<(), BottleError>,
    {
        let _guard = self.begin_mutation(id)?;
        let mut bottle = self.store.read(id)?;
        if bottle.is_corrupt() {
            return Err(BottleError::Corrupt { id, path: bottle.root().to_owned() });
        }

        change(&mut bottle)?;
        self.store.write(&bottle)?;
        Ok(bottle)
    }

    fn begin_mutation(&self, id: BottleId) -> Result<MutationGuard, BottleError> {
        self.coordinator.begin_mutation(id).map_err(|_| BottleError::Busy(id))
    }

    pub fn get(&self, id: BottleId) -> Result<Bottle, BottleError> {
        self.store.read(id)
    }

    /// Every readable bottle, most recently used first.
    pub fn list(&self) -> Result<BottleList, BottleError> {
        let mut bottles = Vec::new();
        for id in self.store.ids()? {
            match self.store.read(id) {
                Ok(bottle) => bottles.push(bottle),
                Err(BottleError::NotFound(_)) => {}
                Err(e @ BottleError::Corrupt { .. }) => warn!("skipping bottle {id}: {e}"),
                Err(e) => return Err(e),
            }
        }

        bottles.sort_by(|a, b| b.last_used().cmp(&a.last_used()).then_with(|| a.name().cmp(b.name())));
        Ok(BottleList { bottles })
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<Bottle>, BottleError> {
        Ok(self.list()?.into_iter().find(|b| b.name() == name))
    }

    /// Look a bottle up by id, falling back to its display name.
    pub fn lookup(&self, name_or_id: &str) -> Result<Option<Bottle>, BottleError> {
        if let Ok(id) = name_or_id.parse::<BottleId>() {
            return match self.get(id) {
                Ok(bottle) => Ok(Some(bottle)),
                Err(BottleError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            };
        }

        self.find_by_name(name_or_id)
    }

    /// Record that the bottle was just used. Only the launcher calls this, while it holds a
    /// launch permit, so no mutation can race it.
    pub(crate) fn touch(&self, id: BottleId) -> Result<(), BottleError> {
        let mut bottle = self.store.read(id)?;
        bottle.touch();
        self.store.write(&bottle)
    }
}

fn remove_entry(path: &Path, file_type: fs::FileType) -> io::Result<()> {
    if file_type.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn remove_contents_except(dir: &Path, keep: &str, remove: RemoveEntry) -> Result<(), (PathBuf, io::Error)> {
    let entries = fs::read_dir(dir).map_err(|e| (dir.to_owned(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| (dir.to_owned(), e))?;
        if entry.file_name() == keep {
            continue;
        }

        let path = entry.path();
        entry.file_type()
            .and_then(|t| remove(&path, t))
            .map_err(|e| (path, e))?;
    }

    Ok(())
}

fn remove_quietly(root: &Path) {
    if let Err(e) = fs::remove_dir_all(root) {
        error!("failed to clean up {}: {e}", root.display());
    }
}
