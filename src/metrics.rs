use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing search and generation activity.
#[derive(Default)]
pub struct PipelineMetrics {
    searches_served: AtomicU64,
    generation_requests: AtomicU64,
    sections_streamed: AtomicU64,
    sections_failed: AtomicU64,
    documents_emitted: AtomicU64,
    deltas_relayed: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed search request.
    pub fn record_search(&self) {
        self.searches_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Merge the counters buffered by one streamed response.
    pub fn absorb(&self, telemetry: &RequestTelemetry) {
        self.generation_requests.fetch_add(1, Ordering::Relaxed);
        self.sections_streamed
            .fetch_add(telemetry.sections_streamed, Ordering::Relaxed);
        self.sections_failed
            .fetch_add(telemetry.sections_failed, Ordering::Relaxed);
        self.documents_emitted
            .fetch_add(telemetry.documents_emitted, Ordering::Relaxed);
        self.deltas_relayed
            .fetch_add(telemetry.deltas_relayed, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            searches_served: self.searches_served.load(Ordering::Relaxed),
            generation_requests: self.generation_requests.load(Ordering::Relaxed),
            sections_streamed: self.sections_streamed.load(Ordering::Relaxed),
            sections_failed: self.sections_failed.load(Ordering::Relaxed),
            documents_emitted: self.documents_emitted.load(Ordering::Relaxed),
            deltas_relayed: self.deltas_relayed.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Search requests answered since startup.
    pub searches_served: u64,
    /// Streamed generation responses completed since startup.
    pub generation_requests: u64,
    /// Sections that reached the terminal success state.
    pub sections_streamed: u64,
    /// Sections that ended with an in-band error event.
    pub sections_failed: u64,
    /// Documents events emitted across all sections.
    pub documents_emitted: u64,
    /// Text deltas relayed to clients across all sections.
    pub deltas_relayed: u64,
}

/// Per-request counters buffered until the outbound stream closes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RequestTelemetry {
    /// Sections that completed successfully.
    pub sections_streamed: u64,
    /// Sections that failed with an error event.
    pub sections_failed: u64,
    /// Documents events emitted for this request.
    pub documents_emitted: u64,
    /// Text deltas relayed for this request.
    pub deltas_relayed: u64,
}

impl RequestTelemetry {
    /// Push the buffered counters into the shared registry and log a summary line.
    pub fn flush(self, metrics: &PipelineMetrics) {
        metrics.absorb(&self);
        tracing::info!(
            sections_streamed = self.sections_streamed,
            sections_failed = self.sections_failed,
            documents_emitted = self.documents_emitted,
            deltas_relayed = self.deltas_relayed,
            "Generation stream closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_accumulates_request_counters() {
        let metrics = PipelineMetrics::new();
        RequestTelemetry {
            sections_streamed: 2,
            sections_failed: 1,
            documents_emitted: 3,
            deltas_relayed: 10,
        }
        .flush(&metrics);
        RequestTelemetry {
            sections_streamed: 1,
            ..Default::default()
        }
        .flush(&metrics);
        metrics.record_search();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.generation_requests, 2);
        assert_eq!(snapshot.sections_streamed, 3);
        assert_eq!(snapshot.sections_failed, 1);
        assert_eq!(snapshot.documents_emitted, 3);
        assert_eq!(snapshot.deltas_relayed, 10);
        assert_eq!(snapshot.searches_served, 1);
    }

    #[test]
    fn snapshot_starts_empty() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.snapshot().generation_requests, 0);
        assert_eq!(metrics.snapshot().documents_emitted, 0);
        assert_eq!(metrics.snapshot().deltas_relayed, 0);
    }

    #[test]
    fn snapshot_serializes_delta_count() {
        let metrics = PipelineMetrics::new();
        RequestTelemetry {
            deltas_relayed: 4,
            ..Default::default()
        }
        .flush(&metrics);

        let json = serde_json::to_value(metrics.snapshot()).expect("json");
        assert_eq!(json["deltasRelayed"], 4);
    }
}
