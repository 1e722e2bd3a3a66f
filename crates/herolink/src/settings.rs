//! Persisted client settings.
//!
//! One flat JSON blob stored under a fixed key. Writes replace the whole
//! blob (last write wins) and there is no schema version: unknown fields
//! are ignored and missing ones take their defaults.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SettingsError;

/// Storage key of the settings blob.
pub const SETTINGS_STORAGE_KEY: &str = "herolink-settings";

/// User-adjustable client settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Master volume in `[0, 1]`.
    pub volume: f32,
    pub muted: bool,
    /// Named feature toggles.
    pub features: BTreeMap<String, bool>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            volume: 0.8,
            muted: false,
            features: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Whether `feature` is switched on; unknown features are off.
    pub fn feature(&self, feature: &str) -> bool {
        self.features.get(feature).copied().unwrap_or(false)
    }

    pub fn set_feature(&mut self, feature: impl Into<String>, enabled: bool) {
        self.features.insert(feature.into(), enabled);
    }
}

/// File-backed store for the settings blob.
#[derive(Clone, Debug)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Store the blob as `<dir>/<SETTINGS_STORAGE_KEY>.json`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(format!("{SETTINGS_STORAGE_KEY}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the blob, or defaults when none has been saved.
    pub fn load(&self) -> Result<Settings, SettingsError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Replace the blob with `settings`.
    pub fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(settings)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, bytes)?;
        fs::rename(&staging, &self.path)?;
        debug!(path = %self.path.display(), "Saved settings");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_load_missing_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.load().unwrap(), Settings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());

        let mut settings = Settings::default();
        settings.volume = 0.25;
        settings.muted = true;
        settings.set_feature("battleAnimations", false);
        settings.set_feature("autoBattle", true);
        store.save(&settings).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, settings);
        assert!(loaded.feature("autoBattle"));
        assert!(!loaded.feature("unknown"));
    }

    #[test]
    fn test_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let first = SettingsStore::new(dir.path());
        let second = SettingsStore::new(dir.path());

        let mut a = Settings::default();
        a.volume = 0.1;
        let mut b = Settings::default();
        b.muted = true;

        first.save(&a).unwrap();
        second.save(&b).unwrap();
        assert_eq!(first.load().unwrap(), b);
    }

    #[test]
    fn test_partial_blob_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());
        fs::write(store.path(), r#"{"muted":true,"legacyField":3}"#).unwrap();

        let loaded = store.load().unwrap();
        assert!(loaded.muted);
        assert_eq!(loaded.volume, 0.8);
    }

    #[test]
    fn test_corrupt_blob_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());
        fs::write(store.path(), "not json").unwrap();

        assert!(matches!(
            store.load(),
            Err(SettingsError::Serialization(_))
        ));
    }
}
