use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::checkers::Metric;
use crate::instantiators::ConsequenceFlavour;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub system: SystemConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub instantiation: InstantiationConfig,
    #[serde(default)]
    pub checks: ChecksConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    pub tuple_dir: String,
    pub output_dir: String,
    #[serde(default = "default_stats_file")]
    pub stats_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_concurrency: default_concurrency(),
            temperature: 0.0,
            max_tokens: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    None,
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,
    #[serde(default = "default_cache_path")]
    pub path: String,
    /// Misses become errors instead of generator calls.
    #[serde(default)]
    pub read_only: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            path: default_cache_path(),
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstantiationConfig {
    #[serde(default = "default_verification_threshold")]
    pub verification_threshold: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_concurrency")]
    pub batch_concurrency: usize,
    #[serde(default = "default_consequence_flavours")]
    pub consequence_flavours: Vec<ConsequenceFlavour>,
}

impl Default for InstantiationConfig {
    fn default() -> Self {
        Self {
            verification_threshold: default_verification_threshold(),
            max_attempts: default_max_attempts(),
            batch_concurrency: default_concurrency(),
            consequence_flavours: default_consequence_flavours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChecksConfig {
    #[serde(default = "default_checkers")]
    pub checkers: Vec<String>,
    #[serde(default = "default_metrics")]
    pub metrics: Vec<Metric>,
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: f64,
    #[serde(default = "default_clip_epsilon")]
    pub clip_epsilon: f64,
    #[serde(default = "default_feasibility_tolerance")]
    pub feasibility_tolerance: f64,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            checkers: default_checkers(),
            metrics: default_metrics(),
            violation_threshold: default_violation_threshold(),
            clip_epsilon: default_clip_epsilon(),
            feasibility_tolerance: default_feasibility_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverMethod {
    DifferentialEvolution,
    Annealing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_solver_method")]
    pub method: SolverMethod,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_population_per_dim")]
    pub population_per_dim: usize,
    /// Spread of population objective values below which the search has converged.
    #[serde(default = "default_solver_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            method: default_solver_method(),
            max_iterations: default_max_iterations(),
            population_per_dim: default_population_per_dim(),
            tolerance: default_solver_tolerance(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecasterKind {
    Llm,
    Consistent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_forecaster_kind")]
    pub forecaster: ForecasterKind,
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_consistent_checkers")]
    pub consistent_checkers: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub num_lines: Option<usize>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            forecaster: default_forecaster_kind(),
            depth: default_depth(),
            consistent_checkers: default_consistent_checkers(),
            concurrency: default_concurrency(),
            resume: false,
            num_lines: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub csv_logging: bool,
    #[serde(default = "default_csv_log_path")]
    pub csv_log_path: String,
}

fn default_stats_file() -> String { "stats_summary.json".to_string() }
fn default_model() -> String { "gpt-4o-mini".to_string() }
fn default_concurrency() -> usize { 100 }
fn default_timeout_secs() -> u64 { 120 }
fn default_cache_backend() -> CacheBackend { CacheBackend::File }
fn default_cache_path() -> String { ".llm_cache".to_string() }
fn default_verification_threshold() -> f64 { 0.7 }
fn default_max_attempts() -> u32 { 3 }
fn default_consequence_flavours() -> Vec<ConsequenceFlavour> {
    vec![ConsequenceFlavour::Quantity, ConsequenceFlavour::Time, ConsequenceFlavour::Misc]
}
fn default_checkers() -> Vec<String> {
    crate::checkers::CheckerKind::all()
        .iter()
        .map(|kind| kind.name().to_string())
        .collect()
}
fn default_metrics() -> Vec<Metric> { vec![Metric::Default, Metric::Frequentist] }
fn default_violation_threshold() -> f64 { 1e-3 }
fn default_clip_epsilon() -> f64 { 1e-6 }
fn default_feasibility_tolerance() -> f64 { 1e-4 }
fn default_solver_method() -> SolverMethod { SolverMethod::DifferentialEvolution }
fn default_max_iterations() -> usize { 1000 }
fn default_population_per_dim() -> usize { 15 }
fn default_solver_tolerance() -> f64 { 1e-10 }
fn default_seed() -> u64 { 42 }
fn default_forecaster_kind() -> ForecasterKind { ForecasterKind::Llm }
fn default_depth() -> usize { 1 }
fn default_consistent_checkers() -> Vec<String> {
    vec!["NegChecker".to_string(), "ParaphraseChecker".to_string()]
}
fn default_csv_log_path() -> String { "violations.csv".to_string() }

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub llm_api_key: String,
    pub llm_base_url: String,
    pub cache_disabled: bool,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Called after loading and again after command-line overrides.
    pub fn validate(&self) -> Result<()> {
        if self.llm.max_concurrency == 0 || self.evaluation.concurrency == 0 {
            anyhow::bail!("concurrency limits must be positive");
        }
        // Log scores need clipped probabilities strictly inside (0, 1)
        let eps = self.checks.clip_epsilon;
        if !(eps > 0.0 && eps < 0.5) {
            anyhow::bail!("clip_epsilon must lie in (0, 0.5), got {}", eps);
        }
        if self.evaluation.forecaster == ForecasterKind::Consistent && self.evaluation.depth == 0 {
            anyhow::bail!("consistent forecaster needs depth >= 1");
        }
        if self.solver.population_per_dim < 4 {
            anyhow::bail!("population_per_dim must be at least 4");
        }
        Ok(())
    }
}

impl EnvConfig {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            llm_api_key: std::env::var("LLM_API_KEY")
                .context("LLM_API_KEY not set")?,
            llm_base_url: std::env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            cache_disabled: std::env::var("CACHE_DISABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
        })
    }
}
