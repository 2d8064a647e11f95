use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::warn;
use tracing_subscriber::EnvFilter;

static PROMETHEUS: OnceCell<Option<PrometheusHandle>> = OnceCell::new();

/// Structured logging, INFO unless `RUST_LOG` says otherwise.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Installs the global Prometheus recorder once; later calls return the same handle.
pub fn prometheus() -> Option<&'static PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "metrics recorder not installed");
                None
            }
        })
        .as_ref()
}

pub fn message_sent() {
    counter!("convo_messages_sent_total").increment(1);
}

pub fn thread_created(thread_type: &'static str) {
    counter!("convo_threads_created_total", "thread_type" => thread_type).increment(1);
}

pub fn notification_failed() {
    counter!("convo_notifications_failed_total").increment(1);
}

pub fn fanout_dropped(count: u64) {
    counter!("convo_fanout_dropped_total").increment(count);
}

pub fn side_effect_failed(effect: &'static str) {
    counter!("convo_side_effect_failures_total", "effect" => effect).increment(1);
}
