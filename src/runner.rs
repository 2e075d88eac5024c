use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Deserialize;
use walkdir::WalkDir;
use crate::bottle::Bottle;
use crate::error::BottleError;

static MANIFEST_FILE: &str = "runner.toml";
static DEFAULT_EXECUTABLE: &str = "bin/wine";
static SYSTEM_RUNNER: &str = "system";

pub static FEATURE_ESYNC: &str = "esync";
pub static FEATURE_FSYNC: &str = "fsync";

/// A wine build that bottles can run on. Never modified once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runner {
    id: String,
    version: String,
    executable: PathBuf,
    features: BTreeSet<String>,
    env: BTreeMap<String, String>,
}

/// `runner.toml`, optionally shipped inside a runner's install directory.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunnerManifest {
    version: Option<String>,
    executable: Option<PathBuf>,
    features: Vec<String>,
    env: BTreeMap<String, String>,
}

impl Runner {
    pub fn new(id: impl Into<String>, version: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Runner {
            id: id.into(),
            version: version.into(),
            executable: executable.into(),
            features: BTreeSet::new(),
            env: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    #[must_use]
    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }

    #[must_use]
    pub fn supports(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Variables this runner sets for programs started in `bottle`.
    #[must_use]
    pub fn defaults(&self, bottle: &Bottle) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("WINEPREFIX".to_owned(), bottle.prefix().to_string_lossy().to_string());
        env.insert("WINEDEBUG".to_owned(), "-all".to_owned());

        if self.supports(FEATURE_ESYNC) {
            env.insert("WINEESYNC".to_owned(), "1".to_owned());
        }
        if self.supports(FEATURE_FSYNC) {
            env.insert("WINEFSYNC".to_owned(), "1".to_owned());
        }
        if let Some(overrides) = bottle.dll_overrides_env() {
            env.insert("WINEDLLOVERRIDES".to_owned(), overrides);
        }

        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Build a runner from an install directory, or `None` if it does not hold one.
    fn from_dir(dir: &Path) -> Result<Option<Runner>, BottleError> {
        let Some(id) = dir.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return Ok(None);
        };

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = if manifest_path.is_file() {
            let s = fs::read_to_string(&manifest_path)?;
            toml::from_str::<RunnerManifest>(&s).map_err(BottleError::invalid_data)?
        } else {
            RunnerManifest::default()
        };

        let executable = match &manifest.executable {
            Some(exe) => Some(dir.join(exe)).filter(|p| p.is_file()),
            None => find_wine(dir),
        };
        let Some(executable) = executable else {
            return Ok(None);
        };

        let version = manifest.version.unwrap_or_else(|| version_from_name(&id));
        Ok(Some(Runner {
            id,
            version,
            executable,
            features: manifest.features.into_iter().collect(),
            env: manifest.env,
        }))
    }
}

fn find_wine(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .max_depth(3)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file() && entry.path().ends_with(DEFAULT_EXECUTABLE))
        .map(walkdir::DirEntry::into_path)
}

/// `wine-9.0` -> `9.0`. Names without a dash are their own version.
fn version_from_name(name: &str) -> String {
    match name.split_once('-') {
        Some((_, version)) if !version.is_empty() => version.to_owned(),
        _ => name.to_owned(),
    }
}

/// Runners available to this process.
///
/// Populated from install locations once when created; call [`RunnerRegistry::refresh`] to
/// scan again.
#[derive(Debug, Default)]
pub struct RunnerRegistry {
    search_paths: Vec<PathBuf>,
    system_wine: Option<PathBuf>,
    runners: RwLock<BTreeMap<String, Arc<Runner>>>,
    registered: RwLock<BTreeMap<String, Arc<Runner>>>,
}

impl RunnerRegistry {
    /// An empty registry that never scans the filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `search_paths` (and `system_wine`, if given) for runners.
    pub fn discover(search_paths: Vec<PathBuf>, system_wine: Option<PathBuf>) -> Result<Self, BottleError> {
        let registry = RunnerRegistry {
            search_paths,
            system_wine,
            ..Default::default()
        };
        registry.refresh()?;
        Ok(registry)
    }

    /// Rescan the install locations, replacing the discovered set. Returns the runner count.
    pub fn refresh(&self) -> Result<usize, BottleError> {
        let mut found = BTreeMap::new();

        for search_path in &self.search_paths {
            if !search_path.is_dir() {
                debug!("skipping runner location {}", search_path.display());
                continue;
            }

            for entry in fs::read_dir(search_path)?.filter_map(Result::ok) {
                let dir = entry.path();
                if !dir.is_dir() {
                    continue;
                }

                match Runner::from_dir(&dir) {
                    Ok(Some(runner)) => {
                        if found.contains_key(runner.id()) {
                            warn!("runner {} at {} is shadowed by an earlier one", runner.id(), dir.display());
                            continue;
                        }
                        info!("found runner {} ({})", runner.id(), runner.version());
                        found.insert(runner.id().to_owned(), Arc::new(runner));
                    }
                    Ok(None) => debug!("{} does not contain a runner", dir.display()),
                    Err(e) => warn!("skipping runner at {}: {e}", dir.display()),
                }
            }
        }

        if let Some(wine) = self.system_wine.as_ref().filter(|p| p.is_file()) {
            found.entry(SYSTEM_RUNNER.to_owned())
                .or_insert_with(|| Arc::new(Runner::new(SYSTEM_RUNNER, SYSTEM_RUNNER, wine)));
        }

        // Same lock order as `register`, so a runner registered mid-scan is never dropped.
        let mut runners = self.runners.write();
        for (id, runner) in self.registered.read().iter() {
            found.entry(id.clone()).or_insert_with(|| Arc::clone(runner));
        }

        let count = found.len();
        *runners = found;
        Ok(count)
    }

    pub fn register(&self, runner: Runner) -> Result<Arc<Runner>, BottleError> {
        let mut runners = self.runners.write();
        if runners.contains_key(runner.id()) {
            return Err(BottleError::DuplicateRunner(runner.id().to_owned()));
        }

        let runner = Arc::new(runner);
        runners.insert(runner.id().to_owned(), Arc::clone(&runner));
        self.registered.write().insert(runner.id().to_owned(), Arc::clone(&runner));
        Ok(runner)
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<Runner>, BottleError> {
        self.runners.read()
            .get(id)
            .cloned()
            .ok_or_else(|| BottleError::UnknownRunner(id.to_owned()))
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<Runner>> {
        self.runners.read().values().cloned().collect()
    }
}
