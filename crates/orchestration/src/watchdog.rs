use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Time left before the deadline.
    Remaining(Duration),
    /// Deadline already passed by this much.
    Overdue(Duration),
}

/// Timeout budget measured from the process's own start time, so a
/// supervisor restart does not extend the deadline.
pub fn remaining_budget(started_at: DateTime<Utc>, timeout: Duration, now: DateTime<Utc>) -> Budget {
    let elapsed = (now - started_at).to_std().unwrap_or(Duration::ZERO);
    match timeout.checked_sub(elapsed) {
        Some(left) if !left.is_zero() => Budget::Remaining(left),
        _ => Budget::Overdue(elapsed.saturating_sub(timeout)),
    }
}

/// Sleep for `after`, then run `expire` on its own task.
///
/// The returned handle is aborted when the run ends naturally. `expire`
/// runs detached so that aborting the watchdog while the stop is in
/// progress cannot cut the stop short.
pub fn arm<F, Fut>(task_id: String, pid: u32, after: Duration, expire: F) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        info!(%task_id, pid, "timeout reached, stopping task");
        tokio::spawn(expire());
    })
}
