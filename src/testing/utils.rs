use crate::partitioning::segment_of;
use crate::types::SegmentId;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;

/// Poll `action` until `predicate` accepts its result or `timeout` elapses.
/// Uses the Tokio clock, so it also works with a paused runtime.
pub async fn wait_for_result<F, Fut, T, P>(mut action: F, predicate: P, timeout: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let interval = Duration::from_millis(10);

    while tokio::time::Instant::now() < deadline {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// Wait until `condition` holds. Returns false on timeout.
pub async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    wait_for_result(|| std::future::ready(condition()), |ok| *ok, timeout)
        .await
        .is_some()
}

/// The `index`-th key of the form `seg{segment}-{n}` that hashes to
/// `segment`.
pub fn key_in_segment(segment: SegmentId, num_segments: u32, index: usize) -> Bytes {
    (0u64..)
        .map(|n| Bytes::from(format!("seg{}-{}", segment, n)))
        .filter(|k| segment_of(k, num_segments) == segment)
        .nth(index)
        .unwrap_or_default()
}

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
#[cfg(test)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
