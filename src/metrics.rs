//! Prometheus metrics for the script manager.

use prometheus::{Counter, Histogram, HistogramOpts, Registry};

/// Configuration for script metrics collection.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric prefix for all script metrics.
    pub prefix: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "script_runtime".to_string(),
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Script lifecycle metrics.
pub struct ScriptMetrics {
    config: MetricsConfig,
    registry: Registry,
    scripts_added: Counter,
    scripts_removed: Counter,
    scripts_enabled: Counter,
    script_failures: Counter,
    load_duration: Histogram,
}

impl ScriptMetrics {
    /// Create and register the collectors.
    pub fn new(config: MetricsConfig) -> prometheus::Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> prometheus::Result<Counter> {
            let counter = Counter::new(format!("{}_{}", config.prefix, name), help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let scripts_added = counter("scripts_added_total", "Scripts added to the manager")?;
        let scripts_removed = counter("scripts_removed_total", "Scripts removed from the manager")?;
        let scripts_enabled = counter("scripts_enabled_total", "Script enable transitions")?;
        let script_failures = counter("script_failures_total", "Failed script loads and enables")?;

        let load_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{}_load_duration_seconds", config.prefix),
                "Time to read and evaluate a script",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(load_duration.clone()))?;

        Ok(Self {
            config,
            registry,
            scripts_added,
            scripts_removed,
            scripts_enabled,
            script_failures,
            load_duration,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a successful add and how long its load took.
    pub fn record_added(&self, duration_secs: f64) {
        self.scripts_added.inc();
        self.load_duration.observe(duration_secs);
    }

    /// Record a removal.
    pub fn record_removed(&self) {
        self.scripts_removed.inc();
    }

    /// Record an enable transition.
    pub fn record_enabled(&self) {
        self.scripts_enabled.inc();
    }

    /// Record a failed load or enable.
    pub fn record_failure(&self) {
        self.script_failures.inc();
    }

    /// Total scripts added.
    pub fn scripts_added_total(&self) -> u64 {
        self.scripts_added.get() as u64
    }

    /// Total scripts removed.
    pub fn scripts_removed_total(&self) -> u64 {
        self.scripts_removed.get() as u64
    }

    /// Total enable transitions.
    pub fn scripts_enabled_total(&self) -> u64 {
        self.scripts_enabled.get() as u64
    }

    /// Total failures.
    pub fn script_failures_total(&self) -> u64 {
        self.script_failures.get() as u64
    }
}

impl std::fmt::Debug for ScriptMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptMetrics")
            .field("config", &self.config)
            .field("scripts_added", &self.scripts_added_total())
            .field("scripts_removed", &self.scripts_removed_total())
            .field("script_failures", &self.script_failures_total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = ScriptMetrics::new(MetricsConfig::new().with_prefix("test")).unwrap();

        metrics.record_added(0.01);
        metrics.record_added(0.02);
        metrics.record_enabled();
        metrics.record_removed();
        metrics.record_failure();

        assert_eq!(metrics.scripts_added_total(), 2);
        assert_eq!(metrics.scripts_enabled_total(), 1);
        assert_eq!(metrics.scripts_removed_total(), 1);
        assert_eq!(metrics.script_failures_total(), 1);
        assert_eq!(metrics.registry().gather().len(), 5);
    }
}
