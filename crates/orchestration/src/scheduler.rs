use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Local;
use croner::Cron;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ScheduleError;

/// Parse a standard 5-field crontab expression.
pub fn parse_cron(expr: &str) -> Result<Cron, ScheduleError> {
    Cron::new(expr.trim())
        .parse()
        .map_err(|err| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason: err.to_string(),
        })
}

/// Empty or whitespace-only expressions mean "no schedule" and are valid.
pub fn validate(expr: Option<&str>) -> Result<(), ScheduleError> {
    match expr.map(str::trim).filter(|expr| !expr.is_empty()) {
        Some(expr) => parse_cron(expr).map(|_| ()),
        None => Ok(()),
    }
}

struct Trigger {
    expr: String,
    handle: JoinHandle<()>,
}

/// One standing cron trigger per task id. A firing trigger sends the task
/// id on the channel given at construction; it never starts anything itself.
pub struct CronScheduler {
    triggers: Mutex<HashMap<String, Trigger>>,
    fire: mpsc::UnboundedSender<String>,
}

impl CronScheduler {
    pub fn new(fire: mpsc::UnboundedSender<String>) -> Self {
        Self {
            triggers: Mutex::new(HashMap::new()),
            fire,
        }
    }

    fn triggers(&self) -> MutexGuard<'_, HashMap<String, Trigger>> {
        self.triggers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install, replace or (for `None`/empty) clear the trigger of a task.
    /// An invalid expression leaves the existing trigger untouched.
    pub fn set(&self, task_id: &str, expr: Option<&str>) -> Result<(), ScheduleError> {
        let Some(expr) = expr.map(str::trim).filter(|expr| !expr.is_empty()) else {
            self.remove(task_id);
            return Ok(());
        };
        if self.expression(task_id).as_deref() == Some(expr) {
            return Ok(());
        }
        let cron = parse_cron(expr)?;
        let handle = tokio::spawn(run_trigger(task_id.to_string(), cron, self.fire.clone()));
        let previous = self.triggers().insert(
            task_id.to_string(),
            Trigger {
                expr: expr.to_string(),
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        info!(%task_id, cron = %expr, "schedule installed");
        Ok(())
    }

    pub fn remove(&self, task_id: &str) {
        if let Some(trigger) = self.triggers().remove(task_id) {
            trigger.handle.abort();
            info!(%task_id, "schedule removed");
        }
    }

    pub fn expression(&self, task_id: &str) -> Option<String> {
        self.triggers().get(task_id).map(|trigger| trigger.expr.clone())
    }

    pub fn len(&self) -> usize {
        self.triggers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        for (_, trigger) in self.triggers().drain() {
            trigger.handle.abort();
        }
    }
}

async fn run_trigger(task_id: String, cron: Cron, fire: mpsc::UnboundedSender<String>) {
    loop {
        let now = Local::now();
        let next = match cron.find_next_occurrence(&now, false) {
            Ok(next) => next,
            Err(err) => {
                warn!(%task_id, error = %err, "no further cron occurrence");
                return;
            }
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        debug!(%task_id, next = %next, "cron trigger sleeping");
        tokio::time::sleep(wait).await;
        if fire.send(task_id.clone()).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_accepts_standard_and_empty_expressions() {
        assert!(validate(Some("*/5 * * * *")).is_ok());
        assert!(validate(Some("0 18 * * 1-5")).is_ok());
        assert!(validate(Some("   ")).is_ok());
        assert!(validate(None).is_ok());
        assert!(validate(Some("every tuesday")).is_err());
        assert!(validate(Some("61 * * * *")).is_err());
    }

    #[tokio::test]
    async fn one_trigger_per_task_and_invalid_keeps_previous() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let scheduler = CronScheduler::new(tx);

        scheduler.set("a", Some("*/5 * * * *")).unwrap();
        scheduler.set("a", Some("0 * * * *")).unwrap();
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.expression("a").as_deref(), Some("0 * * * *"));

        assert!(scheduler.set("a", Some("nope")).is_err());
        assert_eq!(scheduler.expression("a").as_deref(), Some("0 * * * *"));

        scheduler.set("a", Some("")).unwrap();
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_sends_task_id_when_due() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = CronScheduler::new(tx);
        scheduler.set("tick", Some("* * * * *")).unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(61), rx.recv())
            .await
            .unwrap();
        assert_eq!(fired.as_deref(), Some("tick"));
    }
}
