//! Prometheus metrics
//!
//! One registry per process, shared by the coordinators and exposed on
//! the admin API at `GET /metrics`.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};

/// Latency buckets tuned for sub-second voice turnarounds
const LATENCY_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.2, 0.3, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 10.0,
];

/// All engine metrics, registered once at startup
pub struct Metrics {
    registry: Registry,
    /// End of caller utterance to first agent frame on the wire
    pub turn_latency: Histogram,
    /// Utterance end to final transcript (modular pipelines)
    pub stt_latency: Histogram,
    /// LLM request to first text chunk
    pub llm_latency: Histogram,
    /// First text chunk to first synthesized audio chunk
    pub tts_latency: Histogram,
    /// Calls currently owned by a coordinator
    pub active_calls: IntGauge,
    /// Calls accepted since start
    pub calls_total: IntCounter,
    /// Outbound frames dropped by the playback path
    pub frames_dropped: IntCounter,
    /// Confirmed barge-ins
    pub barge_ins: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let histogram = |name: &str, help: &str| {
            let h = Histogram::with_opts(
                HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec()),
            )
            .expect("histogram opts are static");
            registry
                .register(Box::new(h.clone()))
                .expect("metric name is unique");
            h
        };
        let gauge = |name: &str, help: &str| {
            let g = IntGauge::new(name, help).expect("gauge opts are static");
            registry
                .register(Box::new(g.clone()))
                .expect("metric name is unique");
            g
        };
        let counter = |name: &str, help: &str| {
            let c = IntCounter::new(name, help).expect("counter opts are static");
            registry
                .register(Box::new(c.clone()))
                .expect("metric name is unique");
            c
        };

        Self {
            turn_latency: histogram(
                "turn_latency_seconds",
                "Caller utterance end to first agent audio frame on the wire",
            ),
            stt_latency: histogram(
                "stt_latency_seconds",
                "Caller utterance end to final transcript",
            ),
            llm_latency: histogram(
                "llm_latency_seconds",
                "LLM request submission to first streamed token",
            ),
            tts_latency: histogram(
                "tts_latency_seconds",
                "First text chunk to first synthesized audio chunk",
            ),
            active_calls: gauge("active_calls", "Calls currently in progress"),
            calls_total: counter("calls_total", "Calls accepted since process start"),
            frames_dropped: counter(
                "transport_frames_dropped_total",
                "Outbound audio frames dropped before transmission",
            ),
            barge_ins: counter("barge_ins_total", "Confirmed caller barge-ins"),
            registry,
        }
    }

    /// Render the Prometheus text exposition
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_metrics_register_and_render() {
        let metrics = Metrics::new();
        metrics.calls_total.inc();
        metrics.active_calls.set(2);
        metrics.turn_latency.observe(0.85);
        metrics.frames_dropped.inc_by(3);

        let text = metrics.render();
        assert!(text.contains("turn_latency_seconds_bucket"));
        assert!(text.contains("active_calls 2"));
        assert!(text.contains("calls_total 1"));
        assert!(text.contains("transport_frames_dropped_total 3"));
    }
}
