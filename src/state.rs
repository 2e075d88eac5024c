use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use log::info;
use crate::applauncher::{AppLauncher, ExitStatus, LaunchSession};
use crate::bottle::{Bottle, BottleId};
use crate::bottlemanager::{BottleList, BottleManager};
use crate::config::Config;
use crate::coordinator::OperationCoordinator;
use crate::error::BottleError;
use crate::overlay::{Overlay, OverlayPatch};
use crate::runner::{Runner, RunnerRegistry};
use crate::store::EnvironmentStore;

/// The engine a host application talks to: every component, wired from one [`Config`].
///
/// Nothing here is global, so several can coexist (one per test, for instance).
pub struct Bottler {
    config: Config,
    runners: Arc<RunnerRegistry>,
    bottles: Arc<BottleManager>,
    launcher: AppLauncher,
}

impl Bottler {
    /// Open the data directory and discover runners.
    pub fn open(config: Config) -> Result<Self, BottleError> {
        let runners = Arc::new(RunnerRegistry::discover(config.runner_dirs.clone(), config.system_wine.clone())?);
        let store = EnvironmentStore::open(config.data_dir.clone())?;
        Ok(Self::with_parts(config, store, runners))
    }

    /// Wire up a store and an already populated registry.
    pub fn with_parts(config: Config, store: EnvironmentStore, runners: Arc<RunnerRegistry>) -> Self {
        let bottles = Arc::new(BottleManager::new(store, Arc::clone(&runners), OperationCoordinator::new(), config.unique_names));
        let launcher = AppLauncher::new(Arc::clone(&bottles), Arc::clone(&runners));
        info!("bottles in {}, {} runner(s)", config.data_dir.display(), runners.list().len());

        Bottler { config, runners, bottles, launcher }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn runners(&self) -> &RunnerRegistry {
        &self.runners
    }

    #[must_use]
    pub fn bottles(&self) -> &BottleManager {
        &self.bottles
    }

    #[must_use]
    pub fn launcher(&self) -> &AppLauncher {
        &self.launcher
    }

    pub fn create(&self, name: &str, runner_id: &str, overlay: Overlay) -> Result<Bottle, BottleError> {
        self.bottles.create(name, runner_id, overlay)
    }

    pub fn delete(&self, id: BottleId) -> Result<(), BottleError> {
        self.bottles.delete(id)
    }

    pub fn configure(&self, id: BottleId, patch: &OverlayPatch) -> Result<Bottle, BottleError> {
        self.bottles.configure(id, patch)
    }

    pub fn list(&self) -> Result<BottleList, BottleError> {
        self.bottles.list()
    }

    pub fn launch<I, S>(&self, id: BottleId, executable: &Path, args: I) -> Result<LaunchSession, BottleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.launcher.launch(id, executable, args)
    }

    pub fn wait(&self, session: &mut LaunchSession) -> Result<ExitStatus, BottleError> {
        self.launcher.wait(session)
    }

    pub fn terminate(&self, session: &mut LaunchSession) -> Result<(), BottleError> {
        self.launcher.terminate(session)
    }

    pub fn register_runner(&self, runner: Runner) -> Result<Arc<Runner>, BottleError> {
        self.runners.register(runner)
    }

    pub fn refresh_runners(&self) -> Result<usize, BottleError> {
        self.runners.refresh()
    }
}
