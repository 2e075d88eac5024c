use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::error::BottleError;

static APP_NAME: &str = "bottler";
static CONFIG_FILE: &str = "config.toml";
static BOTTLES_SUBDIR: &str = "bottles";
static RUNNERS_SUBDIR: &str = "runners";

/// Overrides `data_dir` when set.
pub static DATA_DIR_ENV: &str = "BOTTLER_DATA_DIR";

/// Where bottles live, where runners are looked for, and the naming policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub runner_dirs: Vec<PathBuf>,
    pub system_wine: Option<PathBuf>,
    pub unique_names: bool,
}

fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: app_data_dir().join(BOTTLES_SUBDIR),
            runner_dirs: vec![app_data_dir().join(RUNNERS_SUBDIR)],
            system_wine: Some(PathBuf::from("/usr/bin/wine")),
            unique_names: true,
        }
    }
}

impl Config {
    /// A config keeping everything below `root`, with no system wine.
    pub fn rooted_at<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Config {
            data_dir: root.join(BOTTLES_SUBDIR),
            runner_dirs: vec![root.join(RUNNERS_SUBDIR)],
            system_wine: None,
            unique_names: true,
        }
    }

    /// The default config file location, `$XDG_CONFIG_HOME/bottler/config.toml` on linux.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        Some(dirs::config_dir()?.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Read `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, BottleError> {
        let mut config = match fs::read_to_string(path) {
            Ok(s) => toml::from_str::<Config>(&s).map_err(BottleError::invalid_data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(BottleError::IOFailure(e)),
        };

        if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Read the config from [`Config::default_path`], or the defaults if there is none.
    pub fn load_default() -> Result<Self, BottleError> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Config::default()),
        }
    }
}
