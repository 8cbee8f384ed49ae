use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::vector::Metric;

pub const DEFAULT_RESULTS: usize = 5;
pub const MAX_RESULTS: usize = 50;
pub const PREFERENCE_RESULTS: usize = 2;

const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;

/// Settings for one deployment root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub metric: Metric,
    /// fsync every frame before acknowledging the write.
    pub strict_durability: bool,
    pub default_results: usize,
    pub max_results: usize,
    /// Per-source count bound of a context bundle.
    pub context_results: usize,
    pub preference_results: usize,
    /// Background compaction period for the server; `None` disables it.
    pub compact_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./recall_db"),
            metric: Metric::Cosine,
            strict_durability: true,
            default_results: DEFAULT_RESULTS,
            max_results: MAX_RESULTS,
            context_results: DEFAULT_RESULTS,
            preference_results: PREFERENCE_RESULTS,
            compact_interval: None,
        }
    }
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_strict_durability(mut self, strict: bool) -> Self {
        self.strict_durability = strict;
        self
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = max.max(1);
        self.default_results = self.default_results.min(self.max_results);
        self.context_results = self.context_results.min(self.max_results);
        self
    }

    pub fn with_context_results(mut self, n: usize) -> Self {
        self.context_results = n.clamp(1, self.max_results);
        self
    }

    pub fn with_compact_interval(mut self, every: Duration) -> Self {
        self.compact_interval = Some(every);
        self
    }
}

/// Pins what must not change across restarts of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub metric: Metric,
    #[serde(default)]
    pub dimension: Option<usize>,
}

impl Manifest {
    pub fn path(root: &Path) -> PathBuf {
        root.join(MANIFEST_FILE)
    }

    /// Loads the manifest, creating it for a fresh root. A configured metric
    /// that disagrees with the persisted one is an error.
    pub fn load_or_init(root: &Path, metric: Metric) -> Result<Self, StorageError> {
        let path = Self::path(root);
        if !path.exists() {
            let manifest = Self {
                version: MANIFEST_VERSION,
                metric,
                dimension: None,
            };
            manifest.store(root)?;
            return Ok(manifest);
        }

        let manifest: Manifest = serde_json::from_slice(&fs::read(&path)?)?;
        if manifest.metric != metric {
            return Err(StorageError::MetricMismatch {
                persisted: manifest.metric.to_string(),
                configured: metric.to_string(),
            });
        }
        Ok(manifest)
    }

    /// Write-then-rename so a crash never leaves a half-written manifest.
    pub fn store(&self, root: &Path) -> Result<(), StorageError> {
        let path = Self::path(root);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
