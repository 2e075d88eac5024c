mod config;
pub use config::Config;
mod error;
pub use error::BottleError as Error;
mod existing_directory;
mod util;
mod overlay;
pub use overlay::{Overlay, OverlayPatch};
mod bottle;
pub use bottle::{Bottle, BottleId, BottleStatus, Dependency, DllOverride};
mod store;
pub use store::EnvironmentStore;
mod runner;
pub use runner::{Runner, RunnerRegistry, FEATURE_ESYNC, FEATURE_FSYNC};
mod coordinator;
pub use coordinator::{Contention, LaunchPermit, MutationGuard, OperationCoordinator};
mod bottlemanager;
pub use bottlemanager::{BottleList, BottleManager};
mod applauncher;
pub use applauncher::{AppLauncher, ExitStatus, LaunchSession};
mod state;

pub use state::Bottler;
