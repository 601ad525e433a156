use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:5000";

/// Sampling knobs sent with every generate request.
///
/// The ranges noted on each field are what the server accepts. The client
/// does not enforce them; [`GenerationConfig::validate`] reports violations
/// for callers that want to warn early.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Use the story from the KoboldAI GUI.
    pub use_story: bool,
    /// Use the author's note. No effect unless `use_story` is set.
    pub use_authors_note: bool,
    pub use_world_info: bool,
    pub use_memory: bool,
    /// Tokens sent to the model. min 1
    pub max_context_length: u32,
    /// Tokens to generate. 1..=512
    pub max_length: u32,
    /// Base repetition penalty. min 1
    pub rep_pen: f64,
    pub rep_pen_range: u32,
    /// min 0
    pub rep_pen_slope: f64,
    /// exclusive min 0
    pub temperature: f64,
    /// Tail free sampling. 0..=1
    pub tfs: f64,
    /// min 0
    pub top_a: f64,
    /// 0..=1
    pub top_p: f64,
    pub top_k: u32,
    /// Typical sampling. 0..=1
    pub typical: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            use_story: false,
            use_authors_note: false,
            use_world_info: false,
            use_memory: false,
            max_context_length: 1600,
            max_length: 80,
            rep_pen: 1.12,
            rep_pen_range: 1024,
            rep_pen_slope: 0.9,
            temperature: 0.6,
            tfs: 0.9,
            top_a: 0.9,
            top_p: 0.95,
            top_k: 0,
            typical: 0.5,
        }
    }
}

impl GenerationConfig {
    /// Lists every field outside the range the server documents.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.max_context_length < 1 {
            issues.push(format!("max_context_length={} (min 1)", self.max_context_length));
        }
        if !(1..=512).contains(&self.max_length) {
            issues.push(format!("max_length={} (expected 1..=512)", self.max_length));
        }
        if self.rep_pen < 1.0 {
            issues.push(format!("rep_pen={} (min 1)", self.rep_pen));
        }
        if self.rep_pen_slope < 0.0 {
            issues.push(format!("rep_pen_slope={} (min 0)", self.rep_pen_slope));
        }
        if self.temperature <= 0.0 {
            issues.push(format!("temperature={} (must be > 0)", self.temperature));
        }
        if self.top_a < 0.0 {
            issues.push(format!("top_a={} (min 0)", self.top_a));
        }
        for (name, v) in [("tfs", self.tfs), ("top_p", self.top_p), ("typical", self.typical)] {
            if !(0.0..=1.0).contains(&v) {
                issues.push(format!("{}={} (expected 0..=1)", name, v));
            }
        }
        issues
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct KoboldFileConfig {
    pub endpoint: Option<String>,
    pub timeout_ms: Option<u64>,
    pub generation: Option<GenerationConfig>,
}

impl KoboldFileConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

#[derive(Clone, Debug)]
pub struct KoboldConfig {
    pub endpoint: String,
    pub generation: GenerationConfig,
    /// `None` leaves the HTTP client's own default in place.
    pub timeout: Option<Duration>,
    pub proxy: Option<String>,
}

impl Default for KoboldConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

impl KoboldConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            generation: GenerationConfig::default(),
            timeout: None,
            proxy: None,
        }
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn from_env_and_file() -> anyhow::Result<Self> {
        let env_endpoint = env::var("KOBOLD_ENDPOINT").ok();

        let mut file_cfg = None;
        if let Some(path) = Self::config_path() {
            if path.exists() {
                let text = fs::read_to_string(&path)?;
                match KoboldFileConfig::from_toml_str(&text) {
                    Ok(c) => file_cfg = Some(c),
                    Err(e) => {
                        tracing::warn!(target: "providers::kobold", "ignoring {}: {}", path.display(), e)
                    }
                }
            }
        }

        let proxy = env::var("HTTPS_PROXY")
            .ok()
            .or_else(|| env::var("HTTP_PROXY").ok());

        Ok(Self::resolve(env_endpoint, file_cfg, proxy))
    }

    /// Merges the sources; the environment wins over the file for the endpoint.
    pub fn resolve(
        env_endpoint: Option<String>,
        file_cfg: Option<KoboldFileConfig>,
        proxy: Option<String>,
    ) -> Self {
        let file_cfg = file_cfg.unwrap_or_default();
        let endpoint = env_endpoint
            .filter(|e| !e.trim().is_empty())
            .or(file_cfg.endpoint)
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        KoboldConfig {
            endpoint,
            generation: file_cfg.generation.unwrap_or_default(),
            timeout: file_cfg.timeout_ms.map(Duration::from_millis),
            proxy,
        }
    }

    pub fn config_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        let p = if cfg!(target_os = "windows") {
            base.home_dir().join(".kobold").join("config.toml")
        } else {
            base.config_dir().join("kobold").join("config.toml")
        };
        Some(p)
    }
}
