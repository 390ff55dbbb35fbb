use async_trait::async_trait;
use fleet_common::{
    AssociateOutcome, DeviceInfo, DeviceKind, KillOutcome, RelatedProcess, StartOutcome,
    StopOutcome, Task, TaskStatus,
};

use crate::types::LaunchSpec;

/// One machine able to run tasks: this host, or a peer reached over HTTP.
///
/// Failures are reported inside the returned outcome values so that a
/// fleet-wide operation can keep going when one device misbehaves.
#[async_trait]
pub trait Device: Send + Sync {
    fn id(&self) -> &str;

    fn info(&self) -> DeviceInfo;

    fn kind(&self) -> DeviceKind {
        self.info().kind
    }

    /// Start a run unless a process for the task is already alive.
    async fn start_task(&self, spec: &LaunchSpec) -> StartOutcome;

    /// Terminate, wait for the grace period, then kill. Unknown tasks are a no-op.
    async fn stop_task(&self, task_id: &str) -> StopOutcome;

    async fn task_status(&self, task_id: &str) -> TaskStatus;

    /// Reconcile the device's view of `tasks` with the live process table.
    async fn scan(&self, tasks: &[Task]);

    /// Last `lines` lines of the task's current log.
    async fn logs(&self, task_id: &str, lines: usize) -> Vec<String>;

    async fn find_related(&self, task_id: &str, command: &str) -> Vec<RelatedProcess>;

    async fn kill_process(&self, pid: u32) -> KillOutcome;

    /// Bind an existing process to a task.
    async fn associate(&self, task_id: &str, pid: u32) -> AssociateOutcome;
}
