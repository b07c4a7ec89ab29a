use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use forecast_consistency::checkers::{CheckSettings, CheckerKind};
use forecast_consistency::config::{Config, EnvConfig, ForecasterKind};
use forecast_consistency::data::cache::open_cache;
use forecast_consistency::evaluation::driver::log_skip_tally;
use forecast_consistency::evaluation::{stats, Driver, DriverOptions};
use forecast_consistency::forecasters::{ConsistentForecaster, Forecaster, LlmForecaster};
use forecast_consistency::instantiators::driver::generate_tuples;
use forecast_consistency::instantiators::Instantiator;
use forecast_consistency::llm::client::HttpTextGenerator;
use forecast_consistency::llm::{CachedGenerator, RateLimitedGenerator, TextGenerator};
use forecast_consistency::monitoring::metrics;

#[derive(Parser)]
#[command(name = "forecast-consistency")]
#[command(about = "Logical-consistency checks for probabilistic forecasters")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration
    #[arg(long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Elicit the forecaster on stored tuples and write stats
    Evaluate(EvaluateArgs),

    /// Build tuple files for the configured checkers
    Instantiate {
        /// Base questions, one JSON object per line
        base: PathBuf,

        /// Maximum tuples per checker
        #[arg(long)]
        limit: Option<usize>,

        /// Checkers to build tuples for (overrides [checks].checkers)
        #[arg(long, value_delimiter = ',')]
        checkers: Option<Vec<String>>,

        /// Output directory for tuple files (overrides [system].tuple_dir)
        #[arg(long)]
        tuple_dir: Option<String>,
    },
}

/// Run parameters that override the `[system]`, `[checks]` and
/// `[evaluation]` sections.
#[derive(Args, Debug, Default)]
struct EvaluateArgs {
    /// Forecaster to evaluate: llm | consistent
    #[arg(long, value_parser = ["llm", "consistent"])]
    forecaster: Option<String>,

    /// Nesting depth of the consistent forecaster
    #[arg(long)]
    depth: Option<usize>,

    /// Checkers the consistent forecaster applies
    #[arg(long, value_delimiter = ',')]
    consistent_checkers: Option<Vec<String>>,

    /// Checkers to evaluate
    #[arg(long, value_delimiter = ',')]
    checkers: Option<Vec<String>>,

    #[arg(long)]
    tuple_dir: Option<String>,

    #[arg(long)]
    output_dir: Option<String>,

    /// Tuples evaluated concurrently
    #[arg(long)]
    concurrency: Option<usize>,

    /// Append to existing output files, skipping records already written
    #[arg(long)]
    resume: bool,

    /// Evaluate at most this many tuples per checker
    #[arg(long)]
    num_lines: Option<usize>,
}

impl EvaluateArgs {
    fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(forecaster) = &self.forecaster {
            config.evaluation.forecaster = match forecaster.as_str() {
                "consistent" => ForecasterKind::Consistent,
                _ => ForecasterKind::Llm,
            };
        }
        if let Some(depth) = self.depth {
            config.evaluation.depth = depth;
        }
        if let Some(checks) = &self.consistent_checkers {
            config.evaluation.consistent_checkers = checks.clone();
        }
        if let Some(checkers) = &self.checkers {
            config.checks.checkers = checkers.clone();
        }
        if let Some(dir) = &self.tuple_dir {
            config.system.tuple_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.system.output_dir = dir.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.evaluation.concurrency = concurrency;
        }
        if self.resume {
            config.evaluation.resume = true;
        }
        if self.num_lines.is_some() {
            config.evaluation.num_lines = self.num_lines;
        }
        config.validate().context("invalid command-line overrides")
    }
}

/// HTTP client, rate limited, behind the response cache. Cache hits never
/// take a permit.
fn build_generator(config: &Config, env: &EnvConfig) -> Result<Arc<dyn TextGenerator>> {
    let http = HttpTextGenerator::new(
        env.llm_base_url.clone(),
        env.llm_api_key.clone(),
        config.llm.model.clone(),
        config.llm.timeout_secs,
    )?
    .with_defaults(config.llm.temperature, config.llm.max_tokens);

    let limited: Arc<dyn TextGenerator> =
        Arc::new(RateLimitedGenerator::new(Arc::new(http), config.llm.max_concurrency));

    match open_cache(&config.cache, env.cache_disabled)? {
        Some(cache) => {
            tracing::info!("Response cache: {:?} at {}", config.cache.backend, config.cache.path);
            Ok(Arc::new(CachedGenerator::new(limited, cache, config.cache.read_only)))
        }
        None => {
            tracing::info!("Response cache disabled");
            Ok(limited)
        }
    }
}

fn build_forecaster(
    config: &Config,
    generator: Arc<dyn TextGenerator>,
    instantiator: Arc<Instantiator>,
) -> Result<Arc<dyn Forecaster>> {
    let llm: Arc<dyn Forecaster> = Arc::new(LlmForecaster::new(generator));
    match config.evaluation.forecaster {
        ForecasterKind::Llm => Ok(llm),
        ForecasterKind::Consistent => {
            let checks = CheckerKind::parse_list(&config.evaluation.consistent_checkers)?;
            let settings = CheckSettings::from_config(&config.checks, &config.solver);
            Ok(ConsistentForecaster::recursive(
                config.evaluation.depth,
                &checks,
                llm,
                instantiator,
                settings,
            )?)
        }
    }
}

async fn instantiate(config: &Config, instantiator: &Instantiator, base: &Path, limit: Option<usize>) -> Result<()> {
    let tuple_dir = PathBuf::from(&config.system.tuple_dir);
    for kind in CheckerKind::parse_list(&config.checks.checkers)? {
        let report = generate_tuples(kind.checker(), base, &tuple_dir, instantiator, limit).await?;
        if !report.skipped.is_empty() {
            tracing::warn!("{}: discarded bundles {:?}", kind.name(), report.skipped);
        }
    }
    Ok(())
}

async fn evaluate(config: &Config, forecaster: Arc<dyn Forecaster>) -> Result<()> {
    let options = DriverOptions::from_config(config)?;
    let driver = Driver::new(forecaster, options)?;
    let report = driver.run().await?;

    let stats_path = Path::new(&config.system.output_dir).join(&config.system.stats_file);
    stats::write_summary(&stats_path, &report.summary)?;
    tracing::info!("Stats written to {}", stats_path.display());

    log_skip_tally(&report.skipped);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    tracing::info!("Loading configuration from {}", cli.config);
    let mut config = Config::load(&cli.config)?;
    let env_config = EnvConfig::load()?;

    metrics::init().context("Failed to register metrics")?;

    match cli.command {
        Command::Instantiate {
            base,
            limit,
            checkers,
            tuple_dir,
        } => {
            if let Some(checkers) = checkers {
                config.checks.checkers = checkers;
            }
            if let Some(dir) = tuple_dir {
                config.system.tuple_dir = dir;
            }
            let generator = build_generator(&config, &env_config)?;
            let instantiator = Instantiator::new(generator, config.instantiation.clone());
            instantiate(&config, &instantiator, &base, limit).await?;
        }
        Command::Evaluate(args) => {
            args.apply(&mut config)?;
            let generator = build_generator(&config, &env_config)?;
            let instantiator = Arc::new(Instantiator::new(generator.clone(), config.instantiation.clone()));
            let forecaster = build_forecaster(&config, generator, instantiator)?;
            tracing::info!("Forecaster: {}", forecaster.name());
            evaluate(&config, forecaster).await?;
        }
    }

    let rendered = metrics::render();
    if !rendered.is_empty() {
        tracing::debug!("Metrics:\n{}", rendered);
    }

    tracing::info!("Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::from_toml(
            r#"
            [system]
            tuple_dir = "tuples"
            output_dir = "out"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_evaluate_flags_override_config() {
        let cli = Cli::try_parse_from([
            "forecast-consistency",
            "--config",
            "run.toml",
            "evaluate",
            "--forecaster",
            "consistent",
            "--depth",
            "2",
            "--checkers",
            "NegChecker,AndChecker",
            "--output-dir",
            "runs/a",
            "--concurrency",
            "8",
            "--resume",
            "--num-lines",
            "25",
        ])
        .unwrap();
        assert_eq!(cli.config, "run.toml");

        let Command::Evaluate(args) = cli.command else {
            panic!("expected evaluate");
        };
        let mut config = config();
        args.apply(&mut config).unwrap();
        assert_eq!(config.evaluation.forecaster, ForecasterKind::Consistent);
        assert_eq!(config.evaluation.depth, 2);
        assert_eq!(config.checks.checkers, vec!["NegChecker", "AndChecker"]);
        assert_eq!(config.system.tuple_dir, "tuples");
        assert_eq!(config.system.output_dir, "runs/a");
        assert_eq!(config.evaluation.concurrency, 8);
        assert!(config.evaluation.resume);
        assert_eq!(config.evaluation.num_lines, Some(25));
    }

    #[test]
    fn test_no_flags_keep_config() {
        let mut config = config();
        EvaluateArgs::default().apply(&mut config).unwrap();
        assert_eq!(config.evaluation.forecaster, ForecasterKind::Llm);
        assert!(!config.evaluation.resume);
        assert_eq!(config.evaluation.num_lines, None);
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let cli = Cli::try_parse_from(["forecast-consistency", "evaluate", "--concurrency", "0"]).unwrap();
        let Command::Evaluate(args) = cli.command else {
            panic!("expected evaluate");
        };
        assert!(args.apply(&mut config()).is_err());

        assert!(Cli::try_parse_from(["forecast-consistency", "evaluate", "--forecaster", "oracle"]).is_err());
    }

    #[test]
    fn test_instantiate_args() {
        let cli = Cli::try_parse_from([
            "forecast-consistency",
            "instantiate",
            "base.jsonl",
            "--limit",
            "10",
            "--checkers",
            "NegChecker",
        ])
        .unwrap();
        match cli.command {
            Command::Instantiate { base, limit, checkers, tuple_dir } => {
                assert_eq!(base, PathBuf::from("base.jsonl"));
                assert_eq!(limit, Some(10));
                assert_eq!(checkers, Some(vec!["NegChecker".to_string()]));
                assert_eq!(tuple_dir, None);
            }
            Command::Evaluate(_) => panic!("expected instantiate"),
        }
    }
}
