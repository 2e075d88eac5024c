use std::collections::BTreeMap;
use std::ops::Deref;
use serde::{Deserialize, Serialize};

/// Environment variables a bottle layers over the process and runner defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Overlay(BTreeMap<String, String>);

/// A set of edits to an [`Overlay`]. A `None` value removes the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayPatch(BTreeMap<String, Option<String>>);

impl Overlay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `patch`: keys in the patch win, absent keys are untouched, `None` removes.
    pub fn apply(&mut self, patch: &OverlayPatch) {
        for (key, value) in &patch.0 {
            match value {
                Some(value) => {
                    self.0.insert(key.clone(), value.clone());
                }
                None => {
                    self.0.remove(key);
                }
            }
        }
    }

    /// Lay this overlay on top of `env`, replacing colliding keys.
    pub fn layer_onto(&self, env: &mut BTreeMap<String, String>) {
        env.extend(self.0.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

impl Deref for Overlay {
    type Target = BTreeMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Overlay {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Overlay(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl OverlayPatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), Some(value.into()));
        self
    }

    #[must_use]
    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.0.insert(key.into(), None);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Option<String>)> for OverlayPatch {
    fn from_iter<I: IntoIterator<Item = (K, Option<String>)>>(iter: I) -> Self {
        OverlayPatch(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}
