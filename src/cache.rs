//! Content-addressed cache of compiled graph files and their model-file
//! dependencies.
//!
//! The cache maps basenames to hex digests. Model dependency files are keyed
//! by a hash of their bytes; compiled graph files are keyed by the cache's
//! `dependencies_hash` at the time the graph was produced, since a graph's
//! own filename is already a hash of its text source. The index is persisted
//! as a single JSON object.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::error::{GrammarError, Result};

/// Cache format version; graphs compiled by other crate versions are
/// discarded.
const CACHE_VERSION: &str = env!("CARGO_PKG_VERSION");

const KEY_VERSION: &str = "version";
const KEY_DEPENDENCIES_LIST: &str = "dependencies_list";
const KEY_DEPENDENCIES_HASH: &str = "dependencies_hash";

/// Persistent index of compiled graphs and model-file dependency digests.
pub struct FstFileCache {
    cache_path: PathBuf,
    /// Dependency name → path on disk, as given at open time.
    dependencies: BTreeMap<String, PathBuf>,
    /// Basename → hex digest (content hash for dependency files,
    /// `dependencies_hash` for graph files).
    entries: BTreeMap<String, String>,
    dependencies_list: Vec<String>,
    dependencies_hash: String,
    stored_version: Option<String>,
    cache_is_new: bool,
    dirty: bool,
}

impl FstFileCache {
    /// Open (or reset) the cache at `cache_path` for the given dependency
    /// files.
    ///
    /// The on-disk index is discarded and rebuilt whenever it cannot be
    /// loaded, was written by a different crate version, covers a different
    /// dependency set, or any dependency file's current content hash
    /// disagrees with the stored one.
    pub fn open(
        cache_path: &Path,
        dependencies: BTreeMap<String, PathBuf>,
        invalidate: bool,
    ) -> Self {
        let mut cache = Self {
            cache_path: cache_path.to_owned(),
            dependencies,
            entries: BTreeMap::new(),
            dependencies_list: Vec::new(),
            dependencies_hash: String::new(),
            stored_version: None,
            cache_is_new: true,
            dirty: false,
        };

        let loaded = cache.load();
        let must_reset = if invalidate {
            debug!("cache: forced invalidate");
            true
        } else if !loaded {
            debug!("cache: could not load {}", cache_path.display());
            true
        } else if cache.stored_version() != Some(CACHE_VERSION) {
            debug!("cache: version changed");
            true
        } else if cache.dependencies_list != sorted_names(&cache.dependencies) {
            debug!("cache: list of dependencies has changed");
            true
        } else if cache.any_dependency_stale() {
            debug!("cache: a dependency file's contents have changed");
            true
        } else {
            false
        };

        if must_reset {
            info!(
                "cache: initializing empty cache at {}",
                cache_path.display()
            );
            cache.entries.clear();
            cache.cache_is_new = true;
            cache.update_dependencies();
            if let Err(err) = cache.save() {
                // Leave the cache usable in memory even if the index cannot
                // be persisted.
                info!("cache: failed to save fresh index: {err}");
            }
        }
        cache
    }

    fn load(&mut self) -> bool {
        let Ok(bytes) = std::fs::read(&self.cache_path) else {
            return false;
        };
        let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(&bytes) else {
            return false;
        };
        self.entries.clear();
        for (key, value) in &map {
            match key.as_str() {
                KEY_VERSION | KEY_DEPENDENCIES_LIST | KEY_DEPENDENCIES_HASH => {}
                _ => {
                    if let Value::String(digest) = value {
                        self.entries.insert(key.clone(), digest.clone());
                    }
                    // Unknown non-string keys are tolerated and dropped.
                }
            }
        }
        self.dependencies_list = map
            .get(KEY_DEPENDENCIES_LIST)
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        self.dependencies_hash = map
            .get(KEY_DEPENDENCIES_HASH)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        self.stored_version = map
            .get(KEY_VERSION)
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        self.cache_is_new = false;
        self.dirty = false;
        true
    }

    /// Persist the index as a single JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Cache`] when the index cannot be serialized
    /// or written.
    pub fn save(&mut self) -> Result<()> {
        let mut map = Map::new();
        map.insert(KEY_VERSION.to_owned(), Value::from(CACHE_VERSION));
        map.insert(
            KEY_DEPENDENCIES_LIST.to_owned(),
            Value::from(self.dependencies_list.clone()),
        );
        map.insert(
            KEY_DEPENDENCIES_HASH.to_owned(),
            Value::from(self.dependencies_hash.clone()),
        );
        for (name, digest) in &self.entries {
            map.insert(name.clone(), Value::from(digest.clone()));
        }
        let json = serde_json::to_string(&Value::Object(map))
            .map_err(|err| GrammarError::Cache(format!("serialize cache index: {err}")))?;
        std::fs::write(&self.cache_path, json).map_err(|err| {
            GrammarError::Cache(format!(
                "write cache index {}: {err}",
                self.cache_path.display()
            ))
        })?;
        self.dirty = false;
        Ok(())
    }

    /// Re-hash every dependency file present on disk and recompute the
    /// aggregate `dependencies_hash`.
    pub fn update_dependencies(&mut self) {
        let paths: Vec<PathBuf> = self.dependencies.values().cloned().collect();
        for path in paths {
            if path.is_file() {
                let _ = self.add_file(&path, None);
            }
        }
        self.dependencies_list = sorted_names(&self.dependencies);
        let digests: Vec<&str> = self
            .dependencies
            .values()
            .map(|path| {
                basename(path)
                    .and_then(|name| self.entries.get(name))
                    .map_or("-", String::as_str)
            })
            .collect();
        self.dependencies_hash = hash_data(digests.join(" ").as_bytes());
        self.dirty = true;
    }

    /// Drop one entry, or every non-dependency entry when `filename` is
    /// `None`.
    pub fn invalidate(&mut self, filename: Option<&str>) {
        match filename {
            None => {
                info!("cache: invalidating all graph entries");
                let deps: Vec<String> = self
                    .dependencies
                    .values()
                    .filter_map(|p| basename(p).map(str::to_owned))
                    .collect();
                self.entries.retain(|name, _| deps.contains(name));
                self.dirty = true;
            }
            Some(name) => {
                if self.entries.remove(name).is_some() {
                    info!("cache: invalidating entry for {name:?}");
                    self.dirty = true;
                }
            }
        }
    }

    /// Store the content hash of `path` (or of `data` when given) under the
    /// file's basename.
    pub fn add_file(&mut self, path: &Path, data: Option<&[u8]>) -> Result<()> {
        let digest = match data {
            Some(bytes) => hash_data(bytes),
            None => hash_data(&std::fs::read(path)?),
        };
        let name = basename(path)
            .ok_or_else(|| GrammarError::Cache(format!("no basename in {}", path.display())))?;
        self.entries.insert(name.to_owned(), digest);
        self.dirty = true;
        Ok(())
    }

    /// Record a freshly compiled graph: its basename maps to the current
    /// `dependencies_hash`.
    pub fn add_graph(&mut self, path: &Path) {
        if let Some(name) = basename(path) {
            self.entries
                .insert(name.to_owned(), self.dependencies_hash.clone());
            self.dirty = true;
        }
    }

    /// Whether the cache holds `filename` with exactly this data's hash.
    pub fn contains(&self, filename: &str, data: &[u8]) -> bool {
        self.entries.get(filename) == Some(&hash_data(data))
    }

    /// Whether a generic file exists on disk and its stored hash matches its
    /// current contents (or `data` when given).
    pub fn file_is_current(&self, path: &Path, data: Option<&[u8]>) -> bool {
        let Some(name) = basename(path) else {
            return false;
        };
        if self.cache_is_new && self.dependencies_list.iter().any(|dep| dep == name) {
            return false;
        }
        if !path.is_file() {
            return false;
        }
        match data {
            Some(bytes) => self.contains(name, bytes),
            None => match std::fs::read(path) {
                Ok(bytes) => self.contains(name, &bytes),
                Err(_) => false,
            },
        }
    }

    /// Whether a compiled graph exists on disk and was produced under the
    /// current dependency set.
    pub fn graph_is_current(&self, path: &Path) -> bool {
        let Some(name) = basename(path) else {
            return false;
        };
        self.entries.get(name) == Some(&self.dependencies_hash) && path.is_file()
    }

    /// Artifact filename for an FST text: `sha1(text) + ".fst"`.
    pub fn graph_filename(text: &str) -> String {
        format!("{}.fst", hash_data(text.as_bytes()))
    }

    pub fn dependencies_hash(&self) -> &str {
        &self.dependencies_hash
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the index was freshly initialized rather than loaded.
    pub fn is_new(&self) -> bool {
        self.cache_is_new
    }

    fn stored_version(&self) -> Option<&str> {
        self.stored_version.as_deref()
    }

    fn any_dependency_stale(&self) -> bool {
        self.dependencies
            .values()
            .filter(|path| path.is_file())
            .any(|path| !self.file_is_current(path, None))
    }
}

/// SHA-1 hex digest. The cache is advisory, not adversarial; SHA-1 is
/// sufficient and stable across platforms.
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn basename(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn sorted_names(dependencies: &BTreeMap<String, PathBuf>) -> Vec<String> {
    dependencies.keys().cloned().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
