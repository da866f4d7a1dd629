//! Prometheus metrics for the orchestrator and HTTP layer.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::protocol::{EngineState, ErrorKind};

const NAMESPACE: &str = "cortex_stem";

/// All metrics, registered on a private registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// Successful model loads.
    pub loads: IntCounter,

    /// Failed model loads (asset or engine).
    pub load_failures: IntCounter,

    /// Commands accepted, by command name.
    pub commands: IntCounterVec,

    /// Inference and embedding calls started.
    pub inferences: IntCounter,

    /// Wall time of inference and embedding calls.
    pub inference_seconds: Histogram,

    /// Idle unloads triggered by the hibernation timer.
    pub hibernations: IntCounter,

    /// Requests cancelled before their natural end.
    pub cancellations: IntCounter,

    /// Error events emitted, by kind.
    pub errors: IntCounterVec,

    /// Current engine state (0 unloaded, 1 loading, 2 loaded, 3 inferring).
    pub engine_state: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let loads =
            IntCounter::with_opts(Opts::new("model_loads_total", "Successful model loads"))?;
        let load_failures = IntCounter::with_opts(Opts::new(
            "model_load_failures_total",
            "Model loads that failed",
        ))?;
        let commands = IntCounterVec::new(
            Opts::new("commands_total", "Commands processed"),
            &["command"],
        )?;
        let inferences = IntCounter::with_opts(Opts::new(
            "inferences_total",
            "Inference and embedding calls started",
        ))?;
        let inference_seconds = Histogram::with_opts(
            HistogramOpts::new("inference_duration_seconds", "Inference wall time")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let hibernations = IntCounter::with_opts(Opts::new(
            "hibernations_total",
            "Idle unloads after the hibernation window",
        ))?;
        let cancellations = IntCounter::with_opts(Opts::new(
            "cancellations_total",
            "Requests cancelled before completion",
        ))?;
        let errors = IntCounterVec::new(Opts::new("errors_total", "Error events"), &["kind"])?;
        let engine_state =
            IntGauge::with_opts(Opts::new("engine_state", "Engine lifecycle state"))?;

        registry.register(Box::new(loads.clone()))?;
        registry.register(Box::new(load_failures.clone()))?;
        registry.register(Box::new(commands.clone()))?;
        registry.register(Box::new(inferences.clone()))?;
        registry.register(Box::new(inference_seconds.clone()))?;
        registry.register(Box::new(hibernations.clone()))?;
        registry.register(Box::new(cancellations.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(engine_state.clone()))?;

        Ok(Self {
            registry,
            loads,
            load_failures,
            commands,
            inferences,
            inference_seconds,
            hibernations,
            cancellations,
            errors,
            engine_state,
        })
    }

    pub fn set_state(&self, state: EngineState) {
        self.engine_state.set(state.as_gauge());
    }

    pub fn record_error(&self, kind: ErrorKind) {
        let label = match kind {
            ErrorKind::Asset => "asset",
            ErrorKind::Engine => "engine",
            ErrorKind::Protocol => "protocol",
        };
        self.errors.with_label_values(&[label]).inc();
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.loads.inc();
        metrics.commands.with_label_values(&["infer"]).inc();
        metrics.record_error(ErrorKind::Asset);
        metrics.set_state(EngineState::Loaded);

        let text = metrics.render().unwrap();
        assert!(text.contains("cortex_stem_model_loads_total 1"));
        assert!(text.contains("cortex_stem_commands_total{command=\"infer\"} 1"));
        assert!(text.contains("cortex_stem_errors_total{kind=\"asset\"} 1"));
        assert!(text.contains("cortex_stem_engine_state 2"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.hibernations.inc();
        assert_eq!(a.hibernations.get(), 1);
        assert_eq!(b.hibernations.get(), 0);
    }
}
