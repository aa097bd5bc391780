use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub explorer: ExplorerConfig,
    pub analyzer: AnalyzerConfig,
    pub database: DatabaseConfig,
    pub run: RunConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExplorerConfig {
    /// How many (caller, contract, signature) triples are flagged per run.
    pub top_signatures: usize,
    pub window_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Size of the known-bot seed set.
    pub seed_size: usize,
    pub reuse_min_confidence: f64,
    pub similarity_threshold: f64,
    pub caller_volume_threshold: u64,
    pub burst_min_calls: usize,
    pub burst_window_seconds: i64,
    pub window_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunConfig {
    pub timeout_seconds: u64,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            top_signatures: 10,
            window_days: 7,
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            seed_size: 10,
            reuse_min_confidence: 0.9,
            similarity_threshold: 0.6,
            caller_volume_threshold: 200,
            burst_min_calls: 5,
            burst_window_seconds: 60,
            window_days: 7,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/botradar.db".into(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 600,
        }
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse {}: {e}, using defaults", path.display());
                Self::default()
            }),
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        let config: Self = toml::from_str(contents)?;
        tracing::info!("Config loaded");
        Ok(config.sanitized())
    }

    /// Replace out-of-range values with their defaults.
    fn sanitized(mut self) -> Self {
        let explorer = ExplorerConfig::default();
        let analyzer = AnalyzerConfig::default();
        let run = RunConfig::default();

        if self.explorer.window_days <= 0 {
            tracing::warn!("explorer.window_days must be positive, using {}", explorer.window_days);
            self.explorer.window_days = explorer.window_days;
        }
        if self.analyzer.window_days <= 0 {
            tracing::warn!("analyzer.window_days must be positive, using {}", analyzer.window_days);
            self.analyzer.window_days = analyzer.window_days;
        }
        if self.analyzer.burst_window_seconds <= 0 {
            tracing::warn!(
                "analyzer.burst_window_seconds must be positive, using {}",
                analyzer.burst_window_seconds
            );
            self.analyzer.burst_window_seconds = analyzer.burst_window_seconds;
        }
        if !(0.0..=1.0).contains(&self.analyzer.reuse_min_confidence) {
            tracing::warn!(
                "analyzer.reuse_min_confidence must be within [0, 1], using {}",
                analyzer.reuse_min_confidence
            );
            self.analyzer.reuse_min_confidence = analyzer.reuse_min_confidence;
        }
        if !(0.0..=1.0).contains(&self.analyzer.similarity_threshold) {
            tracing::warn!(
                "analyzer.similarity_threshold must be within [0, 1], using {}",
                analyzer.similarity_threshold
            );
            self.analyzer.similarity_threshold = analyzer.similarity_threshold;
        }
        if self.run.timeout_seconds == 0 {
            tracing::warn!("run.timeout_seconds must be positive, using {}", run.timeout_seconds);
            self.run.timeout_seconds = run.timeout_seconds;
        }
        self
    }
}
