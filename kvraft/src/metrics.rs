//! Metrics collection module for the kv raft service
//!
//! Served RPCs are counted and timed per method; the raft core's term and
//! commit index are sampled into gauges.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry};
use std::time::Instant;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Counter for tracking request counts by method
    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("request_counter", "request counter"), &["method"]).unwrap();

    /// Histogram for tracking method execution times
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("method_cost", "method cost"),
        &["method"]
    )
    .unwrap();

    pub static ref RAFT_TERM: IntGauge =
        IntGauge::new("raft_term", "current raft term").unwrap();

    pub static ref RAFT_COMMIT_INDEX: IntGauge =
        IntGauge::new("raft_commit_index", "highest committed log index").unwrap();

    /// 1 while this node believes it is the leader
    pub static ref RAFT_IS_LEADER: IntGauge =
        IntGauge::new("raft_is_leader", "whether this node leads").unwrap();
}

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_TERM.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_COMMIT_INDEX.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_IS_LEADER.clone()));
}

/// Records metrics for an async operation
///
/// Counts the call under `method_name` and observes how long `handler` took.
pub async fn record_metrics<F, Fut, T>(
    method_name: &'static str,
    handler: F,
) -> Result<T, tonic::Status>
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = Result<T, tonic::Status>> + Send,
{
    let start = Instant::now();
    REQ_COUNTER_VEC.with_label_values(&[method_name]).inc();
    let result = handler().await;

    let elapsed = start.elapsed();
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(elapsed.as_secs_f64());

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_metrics_counts_calls() {
        init_registry();
        let before = REQ_COUNTER_VEC.with_label_values(&["test_method"]).get();
        let value = record_metrics("test_method", || async { Ok::<_, tonic::Status>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(
            REQ_COUNTER_VEC.with_label_values(&["test_method"]).get(),
            before + 1.0
        );

        let err = record_metrics("test_method", || async {
            Err::<u32, _>(tonic::Status::internal("boom"))
        })
        .await;
        assert!(err.is_err());
        assert_eq!(
            REQ_COUNTER_VEC.with_label_values(&["test_method"]).get(),
            before + 2.0
        );
    }
}
