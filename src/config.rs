use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding `metadata.db`, `embeddings.db` and downloaded models.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,

    #[serde(default)]
    pub models: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub include_folders: Vec<PathBuf>,

    #[serde(default)]
    pub exclude_folders: Vec<PathBuf>,

    /// Comma-separated glob list, e.g. `*.tmp, .thumbnails, /mnt/photos/raw*`
    #[serde(default)]
    pub wildcard_exclusions: String,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Photos detected before their metadata is committed as one transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Yield CPU while the UI is in the background.
    #[serde(default = "default_dynamic_throttle")]
    pub dynamic_throttle: bool,

    /// Sleep this many times the last processing duration when throttled.
    #[serde(default = "default_throttle_factor")]
    pub throttle_factor: u32,

    /// Upper bound on a single throttle sleep.
    #[serde(default = "default_max_throttle_ms")]
    pub max_throttle_ms: u64,
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "bmp", "gif", "webp", "tif", "tiff"]
        .iter()
        .map(|e| e.to_string())
        .collect()
}

fn default_batch_size() -> usize {
    8
}

fn default_dynamic_throttle() -> bool {
    true
}

fn default_throttle_factor() -> u32 {
    19
}

fn default_max_throttle_ms() -> u64 {
    10_000
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            include_folders: Vec::new(),
            exclude_folders: Vec::new(),
            wildcard_exclusions: String::new(),
            image_extensions: default_image_extensions(),
            batch_size: default_batch_size(),
            dynamic_throttle: default_dynamic_throttle(),
            throttle_factor: default_throttle_factor(),
            max_throttle_ms: default_max_throttle_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Membership threshold as a 0-100 cosine similarity percentage.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: u32,

    /// Added to the threshold (in percent) for graph edge admission.
    #[serde(default = "default_edge_margin")]
    pub edge_margin: u32,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Propagation stops once label changes per pass drop below this share of nodes.
    #[serde(default = "default_convergence_fraction")]
    pub convergence_fraction: f64,

    /// Rows per similarity block.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Fixed propagation seed; a fresh one is drawn per run when unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_similarity_threshold() -> u32 {
    50
}

fn default_edge_margin() -> u32 {
    5
}

fn default_max_iterations() -> usize {
    25
}

fn default_convergence_fraction() -> f64 {
    0.001
}

fn default_block_size() -> usize {
    1000
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            edge_margin: default_edge_margin(),
            max_iterations: default_max_iterations(),
            convergence_fraction: default_convergence_fraction(),
            block_size: default_block_size(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model directory; defaults to `<data_dir>/models`.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default = "default_detection_url")]
    pub detection_url: String,

    #[serde(default = "default_embedding_url")]
    pub embedding_url: String,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f32,
}

fn default_detection_url() -> String {
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx"
        .to_string()
}

fn default_embedding_url() -> String {
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx"
        .to_string()
}

fn default_intra_threads() -> usize {
    4
}

fn default_detection_confidence() -> f32 {
    0.7
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dir: None,
            detection_url: default_detection_url(),
            embedding_url: default_embedding_url(),
            intra_threads: default_intra_threads(),
            detection_confidence: default_detection_confidence(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facegroup")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            scanner: ScannerConfig::default(),
            clustering: ClusteringConfig::default(),
            models: ModelConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path`, `$FACEGROUP_CONFIG`, or the default location.
    /// A missing file is created with defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::config_path);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| anyhow!("Invalid config {}: {}", config_path.display(), e))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("FACEGROUP_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facegroup")
            .join("config.toml")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("metadata.db")
    }

    pub fn embeddings_path(&self) -> PathBuf {
        self.data_dir.join("embeddings.db")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.models
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }
}

/// Settings the scan and cluster workers read while running.
///
/// Values are read on every call so that changes made by the UI (threshold,
/// folder lists, window focus) are picked up by the next unit of work.
pub trait ConfigProvider: Send + Sync {
    fn include_folders(&self) -> Vec<PathBuf>;
    fn exclude_folders(&self) -> Vec<PathBuf>;
    fn wildcard_exclusions(&self) -> String;
    /// 0-100 percentage.
    fn similarity_threshold(&self) -> u32;
    fn dynamic_throttle_enabled(&self) -> bool;
    fn is_foreground(&self) -> bool;

    /// Full snapshot for the tuning knobs not covered above.
    fn snapshot(&self) -> Config;

    /// Store a new threshold chosen by the user.
    fn set_similarity_threshold(&self, percent: u32) -> Result<()>;
}

/// `ConfigProvider` backed by an in-memory `Config` and an optional file.
pub struct LiveConfig {
    config: RwLock<Config>,
    path: Option<PathBuf>,
    foreground: AtomicBool,
}

impl LiveConfig {
    pub fn new(config: Config, path: Option<PathBuf>) -> Self {
        Self {
            config: RwLock::new(config),
            path,
            foreground: AtomicBool::new(true),
        }
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::SeqCst);
    }

    /// Update the similarity threshold, persisting it when file-backed.
    pub fn set_threshold(&self, percent: u32) -> Result<()> {
        self.update(|c| c.clustering.similarity_threshold = percent.min(100))
    }

    pub fn update(&self, f: impl FnOnce(&mut Config)) -> Result<()> {
        let snapshot = {
            let mut config = self
                .config
                .write()
                .map_err(|_| anyhow!("Config lock poisoned"))?;
            f(&mut config);
            config.clone()
        };

        if let Some(ref path) = self.path {
            snapshot.save_to(path)?;
        }
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Config) -> T) -> T {
        match self.config.read() {
            Ok(config) => f(&config),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

impl ConfigProvider for LiveConfig {
    fn include_folders(&self) -> Vec<PathBuf> {
        self.read(|c| c.scanner.include_folders.clone())
    }

    fn exclude_folders(&self) -> Vec<PathBuf> {
        self.read(|c| c.scanner.exclude_folders.clone())
    }

    fn wildcard_exclusions(&self) -> String {
        self.read(|c| c.scanner.wildcard_exclusions.clone())
    }

    fn similarity_threshold(&self) -> u32 {
        self.read(|c| c.clustering.similarity_threshold)
    }

    fn dynamic_throttle_enabled(&self) -> bool {
        self.read(|c| c.scanner.dynamic_throttle)
    }

    fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Config {
        self.read(Config::clone)
    }

    fn set_similarity_threshold(&self, percent: u32) -> Result<()> {
        self.set_threshold(percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [scanner]
            include_folders = ["/photos"]

            [clustering]
            similarity_threshold = 65
            "#,
        )
        .unwrap();

        assert_eq!(config.scanner.include_folders, vec![PathBuf::from("/photos")]);
        assert_eq!(config.scanner.throttle_factor, 19);
        assert_eq!(config.clustering.similarity_threshold, 65);
        assert_eq!(config.clustering.max_iterations, 25);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load(Some(path.as_path())).unwrap();
        assert!(path.exists());
        assert_eq!(config.clustering.similarity_threshold, 50);
    }

    #[test]
    fn test_set_threshold_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let live = LiveConfig::new(Config::default(), Some(path.clone()));

        live.set_threshold(72).unwrap();
        assert_eq!(live.similarity_threshold(), 72);

        let reloaded = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(reloaded.clustering.similarity_threshold, 72);
    }

    #[test]
    fn test_foreground_flag() {
        let live = LiveConfig::new(Config::default(), None);
        assert!(live.is_foreground());
        live.set_foreground(false);
        assert!(!live.is_foreground());
    }
}
