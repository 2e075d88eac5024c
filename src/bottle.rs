use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::overlay::{Overlay, OverlayPatch};

pub(crate) static PREFIX_SUBDIR: &str = "pfx";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BottleId(Uuid);

impl BottleId {
    #[must_use]
    pub fn new() -> Self {
        BottleId(Uuid::new_v4())
    }
}

impl Default for BottleId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BottleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for BottleId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(BottleId)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BottleStatus {
    #[default]
    Ready,
    /// The record survived a delete that could not finish removing the bottle's files.
    Corrupt,
}

/// How wine should load a given dll, as written into `WINEDLLOVERRIDES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DllOverride {
    #[serde(rename = "n")]
    Native,
    #[serde(rename = "b")]
    Builtin,
    #[serde(rename = "n,b")]
    NativeBuiltin,
    #[serde(rename = "b,n")]
    BuiltinNative,
    #[serde(rename = "disabled")]
    Disabled,
}

impl DllOverride {
    #[must_use]
    pub fn as_wine_str(self) -> &'static str {
        match self {
            DllOverride::Native => "n",
            DllOverride::Builtin => "b",
            DllOverride::NativeBuiltin => "n,b",
            DllOverride::BuiltinNative => "b,n",
            DllOverride::Disabled => "",
        }
    }
}

impl FromStr for DllOverride {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "n" | "native" => DllOverride::Native,
            "b" | "builtin" => DllOverride::Builtin,
            "n,b" => DllOverride::NativeBuiltin,
            "b,n" => DllOverride::BuiltinNative,
            "" | "disabled" => DllOverride::Disabled,
            _ => return Err(anyhow!("unknown dll override mode \"{s}\"")),
        })
    }
}

/// A dependency installed into the bottle, with the uninstaller to run when removing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstaller: Option<String>,
}

/// A bottle's persisted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottle {
    id: BottleId,
    name: String,
    /// Where the bottle lives depends on the store it is read from, so it is never persisted.
    #[serde(skip)]
    root: PathBuf,
    runner: String,
    #[serde(default)]
    status: BottleStatus,
    created: DateTime<Utc>,
    last_used: DateTime<Utc>,
    #[serde(default)]
    dependencies: Vec<Dependency>,
    #[serde(default)]
    overlay: Overlay,
    #[serde(default)]
    dll_overrides: BTreeMap<String, DllOverride>,
}

impl Bottle {
    pub(crate) fn new(id: BottleId, name: &str, root: PathBuf, runner: &str, overlay: Overlay) -> Bottle {
        let now = Utc::now();
        Bottle {
            id,
            name: name.to_owned(),
            root,
            runner: runner.to_owned(),
            status: BottleStatus::Ready,
            created: now,
            last_used: now,
            dependencies: Vec::new(),
            overlay,
            dll_overrides: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> BottleId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The wine prefix inside the bottle root.
    #[must_use]
    pub fn prefix(&self) -> PathBuf {
        self.root.join(PREFIX_SUBDIR)
    }

    #[must_use]
    pub fn runner(&self) -> &str {
        &self.runner
    }

    #[must_use]
    pub fn status(&self) -> BottleStatus {
        self.status
    }

    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        self.status == BottleStatus::Corrupt
    }

    #[must_use]
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    #[must_use]
    pub fn last_used(&self) -> DateTime<Utc> {
        self.last_used
    }

    #[must_use]
    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    #[must_use]
    pub fn dll_overrides(&self) -> &BTreeMap<String, DllOverride> {
        &self.dll_overrides
    }

    #[must_use]
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Render the dll overrides in `WINEDLLOVERRIDES` syntax, or `None` if there are none.
    #[must_use]
    pub fn dll_overrides_env(&self) -> Option<String> {
        if self.dll_overrides.is_empty() {
            return None;
        }

        Some(self.dll_overrides.iter()
            .map(|(dll, mode)| format!("{dll}={}", mode.as_wine_str()))
            .collect::<Vec<_>>()
            .join(";"))
    }

    pub(crate) fn relocate(&mut self, root: PathBuf) {
        self.root = root;
    }

    pub(crate) fn apply_patch(&mut self, patch: &OverlayPatch) {
        self.overlay.apply(patch);
    }

    pub(crate) fn set_runner(&mut self, runner: &str) {
        runner.clone_into(&mut self.runner);
    }

    pub(crate) fn set_dll_override(&mut self, dll: &str, mode: Option<DllOverride>) {
        match mode {
            Some(mode) => {
                self.dll_overrides.insert(dll.to_owned(), mode);
            }
            None => {
                self.dll_overrides.remove(dll);
            }
        }
    }

    pub(crate) fn record_dependency(&mut self, dependency: Dependency) {
        if let Some(existing) = self.dependencies.iter_mut().find(|d| d.name == dependency.name) {
            *existing = dependency;
        } else {
            self.dependencies.push(dependency);
        }
    }

    pub(crate) fn forget_dependency(&mut self, name: &str) -> bool {
        let before = self.dependencies.len();
        self.dependencies.retain(|d| d.name != name);
        self.dependencies.len() != before
    }

    pub(crate) fn mark_corrupt(&mut self) {
        self.status = BottleStatus::Corrupt;
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Utc::now();
    }

    #[cfg(test)]
    pub(crate) fn set_last_used(&mut self, when: DateTime<Utc>) {
        self.last_used = when;
    }
}
