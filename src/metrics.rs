use once_cell::sync::Lazy;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

pub(crate) static SOURCE_METRICS: Lazy<SourceMetrics> = Lazy::new(Default::default);

pub(crate) struct SourceMetrics {
    /// Time to open the source object stream, per backend and outcome.
    get_object_seconds: HistogramVec,
    /// Bytes streamed from the source object into local files, per target.
    pub(crate) transferred_bytes: IntCounterVec,
}

impl SourceMetrics {
    pub(crate) fn observe_get_object(
        &self,
        backend: &str,
        ok: bool,
        started_at: std::time::Instant,
    ) {
        let result = if ok { "ok" } else { "err" };
        self.get_object_seconds
            .with_label_values(&[backend, result])
            .observe(started_at.elapsed().as_secs_f64());
    }
}

impl Default for SourceMetrics {
    fn default() -> Self {
        let get_object_seconds = register_histogram_vec!(
            "image_import_get_object_seconds",
            "Seconds to open the source object stream",
            &["backend", "result"],
            vec![0.01, 0.10, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0],
        )
        .expect("failed to define a metric");

        let transferred_bytes = register_int_counter_vec!(
            "image_import_transferred_bytes_total",
            "Bytes streamed from the source object into local files",
            &["target"],
        )
        .expect("failed to define a metric");

        Self {
            get_object_seconds,
            transferred_bytes,
        }
    }
}
