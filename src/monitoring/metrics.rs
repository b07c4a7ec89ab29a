//! Prometheus counters, compiled in with the `metrics` feature. Without it
//! every recorder is a no-op. Recorders also do nothing until `init` has
//! registered the counters.

#[cfg(feature = "metrics")]
mod imp {
    use prometheus::{CounterVec, Encoder, IntCounter, Opts, Registry, TextEncoder};
    use std::sync::OnceLock;

    use crate::error::{ConsistencyError, Result};

    struct Metrics {
        registry: Registry,
        generator_calls: IntCounter,
        cache_hits: IntCounter,
        cache_misses: IntCounter,
        elicitations: CounterVec,
        violations: CounterVec,
    }

    static METRICS: OnceLock<Metrics> = OnceLock::new();

    fn registration(e: prometheus::Error) -> ConsistencyError {
        ConsistencyError::Config(format!("metric registration failed: {}", e))
    }

    impl Metrics {
        fn register() -> std::result::Result<Self, prometheus::Error> {
            let registry = Registry::new();
            let generator_calls = IntCounter::new("generator_calls_total", "Text generator calls")?;
            let cache_hits = IntCounter::new("cache_hits_total", "Response cache hits")?;
            let cache_misses = IntCounter::new("cache_misses_total", "Response cache misses")?;
            let elicitations = CounterVec::new(
                Opts::new("elicitations_total", "Forecaster elicitations by outcome"),
                &["outcome"],
            )?;
            let violations = CounterVec::new(
                Opts::new("violations_total", "Tuples above the violation threshold"),
                &["checker", "metric"],
            )?;

            registry.register(Box::new(generator_calls.clone()))?;
            registry.register(Box::new(cache_hits.clone()))?;
            registry.register(Box::new(cache_misses.clone()))?;
            registry.register(Box::new(elicitations.clone()))?;
            registry.register(Box::new(violations.clone()))?;

            Ok(Self {
                registry,
                generator_calls,
                cache_hits,
                cache_misses,
                elicitations,
                violations,
            })
        }
    }

    /// Register the counters. Later calls are no-ops.
    pub fn init() -> Result<()> {
        if METRICS.get().is_some() {
            return Ok(());
        }
        let metrics = Metrics::register().map_err(registration)?;
        // A concurrent init may have won; either registry is fine
        let _ = METRICS.set(metrics);
        Ok(())
    }

    pub fn record_generator_call() {
        if let Some(m) = METRICS.get() {
            m.generator_calls.inc();
        }
    }

    pub fn record_cache_hit() {
        if let Some(m) = METRICS.get() {
            m.cache_hits.inc();
        }
    }

    pub fn record_cache_miss() {
        if let Some(m) = METRICS.get() {
            m.cache_misses.inc();
        }
    }

    pub fn record_elicitation(ok: bool) {
        let outcome = if ok { "ok" } else { "failed" };
        if let Some(m) = METRICS.get() {
            m.elicitations.with_label_values(&[outcome]).inc();
        }
    }

    pub fn record_violation(checker: &str, metric: &str) {
        if let Some(m) = METRICS.get() {
            m.violations.with_label_values(&[checker, metric]).inc();
        }
    }

    pub fn render() -> String {
        let Some(m) = METRICS.get() else {
            return String::new();
        };
        let mut buffer = Vec::new();
        if TextEncoder::new().encode(&m.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(not(feature = "metrics"))]
mod imp {
    use crate::error::Result;

    pub fn init() -> Result<()> {
        Ok(())
    }
    pub fn record_generator_call() {}
    pub fn record_cache_hit() {}
    pub fn record_cache_miss() {}
    pub fn record_elicitation(_ok: bool) {}
    pub fn record_violation(_checker: &str, _metric: &str) {}
    pub fn render() -> String {
        String::new()
    }
}

pub use imp::*;
