use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use super::error::AutomationResult;

/// Repeatedly run `probe` until it yields a value or `timeout` elapses.
/// The first probe fires immediately; probe errors propagate unchanged
/// so session loss surfaces from inside any wait point.
///
/// Every bounded wait in the driver goes through here so the interval
/// and bound live next to each other at the call site instead of being
/// scattered as inline sleeps.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    timeout: Duration,
    mut probe: F,
) -> AutomationResult<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AutomationResult<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = probe().await? {
            return Ok(Some(value));
        }
        if Instant::now() + interval > deadline {
            return Ok(None);
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::error::AutomationError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn resolves_when_the_probe_succeeds() {
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let result = poll_until(Duration::from_secs(1), Duration::from_secs(10), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(if n >= 2 { Some(n) } else { None })
        })
        .await
        .unwrap();
        assert_eq!(result, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_none_once_the_bound_elapses() {
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let result: Option<()> =
            poll_until(Duration::from_secs(1), Duration::from_secs(5), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();
        assert!(result.is_none());
        // Immediate probe plus one per elapsed interval inside the bound.
        assert!(calls.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_propagate() {
        let result: AutomationResult<Option<()>> =
            poll_until(Duration::from_secs(1), Duration::from_secs(5), || async move {
                Err(AutomationError::SessionLost("gone".into()))
            })
            .await;
        assert!(matches!(result, Err(AutomationError::SessionLost(_))));
    }
}
