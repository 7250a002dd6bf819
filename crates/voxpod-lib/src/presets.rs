//! Voice preset discovery and the process-lifetime prefilled-state cache.
//!
//! Discovery runs once at startup and fixes the set of known voices. Each
//! preset file is read and moved onto the device the first time its voice
//! is requested; afterwards the same [`PrefilledState`] is handed out.
//! Nothing is ever evicted.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use voxpod_core::types::PRESET_EXTENSION;

use crate::backend::{PrefilledState, SpeechModel};
use crate::error::ServiceError;

pub struct VoicePresetCache {
    presets: BTreeMap<String, PathBuf>,
    default_key: String,
    loaded: Mutex<HashMap<String, Arc<PrefilledState>>>,
}

impl VoicePresetCache {
    /// Scan `dir` for `*.pt` files, keyed by file stem.
    ///
    /// Fails if the directory is missing or holds no presets. If
    /// `default_key` is not among them, the first key in sorted order
    /// becomes the default.
    pub fn discover(dir: &Path, default_key: &str) -> Result<Self, ServiceError> {
        if !dir.is_dir() {
            return Err(ServiceError::Startup(format!(
                "Voices directory not found: {}",
                dir.display()
            )));
        }

        let entries = std::fs::read_dir(dir).map_err(|e| {
            ServiceError::Startup(format!("cannot read voices directory {}: {e}", dir.display()))
        })?;

        let mut presets = BTreeMap::new();
        for entry in entries {
            let path = match entry {
                Ok(e) => e.path(),
                Err(e) => {
                    warn!("skipping unreadable entry in {}: {e}", dir.display());
                    continue;
                }
            };
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(PRESET_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                presets.insert(stem.to_string(), path.clone());
            }
        }

        let Some(first) = presets.keys().next().cloned() else {
            return Err(ServiceError::Startup(format!(
                "No voice preset (.{PRESET_EXTENSION}) files found in {}",
                dir.display()
            )));
        };
        info!("found {} voice presets in {}", presets.len(), dir.display());

        let default_key = if presets.contains_key(default_key) {
            default_key.to_string()
        } else {
            warn!("default voice {default_key:?} not found, using {first:?}");
            first
        };

        Ok(Self {
            presets,
            default_key,
            loaded: Mutex::new(HashMap::new()),
        })
    }

    pub fn default_key(&self) -> &str {
        &self.default_key
    }

    pub fn contains(&self, key: &str) -> bool {
        self.presets.contains_key(key)
    }

    /// All discovered voice keys, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(String::as_str)
    }

    /// Number of presets currently resident.
    pub fn loaded_count(&self) -> usize {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Map a requested voice to a known one, falling back to the default.
    pub fn resolve<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        match requested {
            Some(key) if self.contains(key) => key,
            Some(key) => {
                debug!("voice {key:?} not found, using default {:?}", self.default_key);
                &self.default_key
            }
            None => &self.default_key,
        }
    }

    /// Return the prefilled state for `key`, loading it through `model` on
    /// first use.
    pub fn ensure_cached(
        &self,
        key: &str,
        model: &dyn SpeechModel,
    ) -> Result<Arc<PrefilledState>, ServiceError> {
        let path = self
            .presets
            .get(key)
            .ok_or_else(|| ServiceError::VoiceNotFound(key.to_string()))?;

        // Held across the load so concurrent first requests for one voice
        // read the file once.
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = loaded.get(key) {
            return Ok(state.clone());
        }

        info!("loading voice preset {key} from {}", path.display());
        let bytes = std::fs::read(path).map_err(|source| ServiceError::PresetRead {
            key: key.to_string(),
            path: path.clone(),
            source,
        })?;
        let state = Arc::new(model.load_prefilled(key, bytes)?);
        debug!(
            "voice preset {key} resident ({} bytes, handle {})",
            state.size_bytes, state.handle
        );
        loaded.insert(key.to_string(), state.clone());
        Ok(state)
    }
}
