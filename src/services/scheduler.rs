//! Poll loop supervision.
//!
//! One long-lived task per active account, all owned by a supervisor
//! started at boot. The supervisor reconciles the running set against
//! the accounts table every few seconds (and immediately when the API
//! nudges it after an account mutation); each loop re-reads its account
//! at every wake, so deactivation and deletion are observed within one
//! iteration. Shutdown drains in-flight polls with a bounded grace
//! period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::sqlite;
use crate::config::MIN_POLL_INTERVAL_SECS;
use crate::services::fetcher::{FetchOutcome, Pipeline};

const RECONCILE_TICK: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Cheap handle the API layer uses to poke the supervisor after
/// creating/activating accounts, so new loops spawn without waiting for
/// the next reconcile tick.
#[derive(Clone)]
pub struct SchedulerHandle {
    nudge: Arc<Notify>,
}

impl SchedulerHandle {
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }
}

/// Sleep duration for one account loop iteration.
fn effective_interval(account_interval: Option<u32>, global_seconds: u64) -> Duration {
    let seconds = account_interval
        .map(u64::from)
        .unwrap_or(global_seconds)
        .max(MIN_POLL_INTERVAL_SECS);
    Duration::from_secs(seconds)
}

/// Start the supervisor. Returns the nudge handle and the supervisor's
/// join handle; flip `shutdown` to true to stop everything.
pub fn start(
    pipeline: Arc<Pipeline>,
    shutdown: watch::Receiver<bool>,
) -> (SchedulerHandle, JoinHandle<()>) {
    let nudge = Arc::new(Notify::new());
    let handle = SchedulerHandle {
        nudge: nudge.clone(),
    };
    let join = tokio::spawn(supervise(pipeline, nudge, shutdown));
    (handle, join)
}

async fn supervise(
    pipeline: Arc<Pipeline>,
    nudge: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Scheduler started");
    let mut loops: HashMap<i64, JoinHandle<()>> = HashMap::new();

    loop {
        loops.retain(|_, handle| !handle.is_finished());

        match sqlite::accounts::list_accounts(&pipeline.pool, true) {
            Ok(accounts) => {
                for account in accounts {
                    loops.entry(account.id).or_insert_with(|| {
                        info!(account_id = account.id, email = %account.email, "Spawning poll loop");
                        tokio::spawn(account_loop(
                            pipeline.clone(),
                            account.id,
                            shutdown.clone(),
                        ))
                    });
                }
            }
            Err(e) => error!(error = %e, "Scheduler could not list accounts"),
        }

        tokio::select! {
            _ = tokio::time::sleep(RECONCILE_TICK) => {}
            _ = nudge.notified() => {
                debug!("Scheduler nudged");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }
    }

    info!(loops = loops.len(), "Scheduler stopping; draining poll loops");
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    for (account_id, mut handle) in loops {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            warn!(account_id, "Poll loop exceeded shutdown grace; aborting");
            handle.abort();
        }
    }
    info!("Scheduler stopped");
}

/// One account's poll loop: sleep the effective interval, wake, fetch,
/// repeat. Exits when the account disappears or deactivates.
async fn account_loop(pipeline: Arc<Pipeline>, account_id: i64, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        // Re-read both the account and the global interval each
        // iteration so interval changes and deactivation are picked up
        // at the next wake.
        let account = match sqlite::accounts::get_account(&pipeline.pool, account_id) {
            Ok(Some(account)) if account.is_active => account,
            Ok(_) => {
                info!(account_id, "Account gone or deactivated; poll loop exiting");
                break;
            }
            Err(e) => {
                error!(account_id, error = %e, "Poll loop could not load account");
                break;
            }
        };
        let global = pipeline.settings.current().await.poll_interval_seconds;
        let interval = effective_interval(account.poll_interval_seconds, global);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        match pipeline.run(account_id).await {
            Ok(FetchOutcome::Completed { fetched, inserted }) => {
                debug!(account_id, fetched, inserted, "Scheduled poll completed");
            }
            Ok(FetchOutcome::Skipped) => {
                debug!(account_id, "Scheduled poll skipped");
            }
            Ok(FetchOutcome::Failed { error }) => {
                // Already recorded in poll status; the interval is the
                // back-off.
                debug!(account_id, error = %error, "Scheduled poll failed");
            }
            Err(e) => {
                error!(account_id, error = %e, "Poll loop error");
                if matches!(e, crate::error::Error::NotFound(_)) {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_prefers_account_override() {
        assert_eq!(effective_interval(Some(60), 300), Duration::from_secs(60));
        assert_eq!(effective_interval(None, 300), Duration::from_secs(300));
    }

    #[test]
    fn interval_is_clamped_to_minimum() {
        assert_eq!(effective_interval(Some(1), 300), Duration::from_secs(5));
        assert_eq!(effective_interval(None, 2), Duration::from_secs(5));
    }
}
