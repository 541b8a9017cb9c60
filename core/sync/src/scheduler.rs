//! Sync scheduling - named triggers and periodic drain/reconcile ticks.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use fieldsync_common::{Error, Result};

/// Events that may start a drain pass or change orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// The application returned to the foreground.
    BecameVisible,
    /// Network connectivity came back.
    ConnectivityRestored,
    /// Network connectivity went away.
    ConnectivityLost,
    /// The coarse drain timer fired.
    Periodic,
    /// The authorization/reconcile timer fired.
    Reconcile,
    /// The user asked to sync now.
    Manual,
}

/// Requests accepted by the scheduler loop.
#[derive(Debug)]
pub enum SyncRequest {
    Trigger(SyncTrigger),
    Shutdown,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Records acknowledged under their own reference.
    pub delivered: usize,
    /// Records acknowledged under a backend-supplied reference.
    pub superseded: usize,
    /// Records whose delivery failed this pass.
    pub failed: usize,
    /// Records held back to keep per-type order.
    pub deferred: usize,
    /// Failed records still waiting out their backoff.
    pub skipped: usize,
    pub duration: Duration,
}

/// Periodic timer settings. `None` disables a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub drain_interval: Option<Duration>,
    pub reconcile_interval: Option<Duration>,
}

type TriggerOutcome = Result<Option<PassReport>>;
type Envelope = (SyncRequest, Option<oneshot::Sender<TriggerOutcome>>);

/// Front end for submitting triggers to the scheduler loop.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<Envelope>,
    shutdown: Arc<RwLock<bool>>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs its loop.
    pub fn new(schedule: Schedule) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let shutdown = Arc::new(RwLock::new(false));

        let scheduler = Self {
            request_tx,
            shutdown: shutdown.clone(),
        };

        let handle = SyncSchedulerHandle {
            schedule,
            request_rx,
            shutdown,
        };

        (scheduler, handle)
    }

    /// Submit a trigger and wait for the loop to process it.
    pub async fn trigger(&self, trigger: SyncTrigger) -> TriggerOutcome {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::Trigger(trigger), Some(response_tx)))
            .await
            .map_err(|_| Error::SchedulerStopped)?;

        response_rx.await.map_err(|_| Error::SchedulerStopped)?
    }

    /// Submit a trigger without waiting for its outcome.
    pub async fn notify(&self, trigger: SyncTrigger) -> Result<()> {
        self.request_tx
            .send((SyncRequest::Trigger(trigger), None))
            .await
            .map_err(|_| Error::SchedulerStopped)
    }

    /// Stop the loop after the request in progress.
    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
        let _ = self.request_tx.send((SyncRequest::Shutdown, None)).await;
    }
}

/// The scheduler loop. Triggers are handled one at a time, so at most one
/// pass runs through a given scheduler.
pub struct SyncSchedulerHandle {
    schedule: Schedule,
    request_rx: mpsc::Receiver<Envelope>,
    shutdown: Arc<RwLock<bool>>,
}

impl SyncSchedulerHandle {
    /// Run the loop until shutdown. Spawn this in a tokio task; `sync_fn`
    /// is called for every trigger, timer ticks included.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncTrigger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TriggerOutcome> + Send,
    {
        let mut drain_timer = Self::timer(self.schedule.drain_interval);
        let mut reconcile_timer = Self::timer(self.schedule.reconcile_interval);

        info!("Sync scheduler started with {:?}", self.schedule);

        loop {
            if *self.shutdown.read().await {
                info!("Sync scheduler shutting down");
                break;
            }

            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some((request, response_tx)) = request else {
                        debug!("All scheduler senders dropped");
                        break;
                    };
                    match request {
                        SyncRequest::Shutdown => {
                            info!("Received shutdown request");
                            break;
                        }
                        SyncRequest::Trigger(trigger) => {
                            debug!("Processing trigger: {:?}", trigger);
                            let outcome = sync_fn(trigger).await;
                            if let Some(tx) = response_tx {
                                let _ = tx.send(outcome);
                            } else {
                                Self::log_outcome(trigger, &outcome);
                            }
                        }
                    }
                }

                _ = Self::wait_for_tick(&mut drain_timer) => {
                    let outcome = sync_fn(SyncTrigger::Periodic).await;
                    Self::log_outcome(SyncTrigger::Periodic, &outcome);
                }

                _ = Self::wait_for_tick(&mut reconcile_timer) => {
                    let outcome = sync_fn(SyncTrigger::Reconcile).await;
                    Self::log_outcome(SyncTrigger::Reconcile, &outcome);
                }
            }
        }
    }

    fn timer(period: Option<Duration>) -> Option<Interval> {
        period.map(|period| {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        })
    }

    async fn wait_for_tick(timer: &mut Option<Interval>) {
        match timer {
            Some(timer) => {
                timer.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    fn log_outcome(trigger: SyncTrigger, outcome: &TriggerOutcome) {
        match outcome {
            Ok(Some(report)) => info!(
                "{:?} pass completed: {} delivered, {} superseded, {} failed, {} deferred",
                trigger, report.delivered, report.superseded, report.failed, report.deferred
            ),
            Ok(None) => debug!("{:?} handled without a drain pass", trigger),
            Err(e) => error!("{:?} failed: {}", trigger, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Triggers only, no timers.
    const MANUAL: Schedule = Schedule {
        drain_interval: None,
        reconcile_interval: None,
    };

    fn report(delivered: usize) -> PassReport {
        PassReport {
            delivered,
            ..PassReport::default()
        }
    }

    #[tokio::test]
    async fn test_trigger_round_trip() {
        let (scheduler, handle) = SyncScheduler::new(MANUAL);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let task = tokio::spawn(async move {
            handle
                .run(move |trigger| {
                    let seen = seen_clone.clone();
                    async move {
                        seen.lock().unwrap().push(trigger);
                        if trigger == SyncTrigger::ConnectivityLost {
                            Ok(None)
                        } else {
                            Ok(Some(report(2)))
                        }
                    }
                })
                .await;
        });

        let outcome = scheduler.trigger(SyncTrigger::Manual).await.unwrap();
        assert_eq!(outcome.unwrap().delivered, 2);
        let outcome = scheduler
            .trigger(SyncTrigger::ConnectivityLost)
            .await
            .unwrap();
        assert!(outcome.is_none());

        scheduler.shutdown().await;
        task.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![SyncTrigger::Manual, SyncTrigger::ConnectivityLost]
        );
        assert!(matches!(
            scheduler.trigger(SyncTrigger::Manual).await,
            Err(Error::SchedulerStopped)
        ));
    }

    #[tokio::test]
    async fn test_notify_is_processed() {
        let (scheduler, handle) = SyncScheduler::new(MANUAL);
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();

        let task = tokio::spawn(async move {
            handle
                .run(move |_trigger| {
                    let count = count_clone.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    }
                })
                .await;
        });

        scheduler.notify(SyncTrigger::BecameVisible).await.unwrap();
        scheduler.notify(SyncTrigger::ConnectivityRestored).await.unwrap();
        // Requests are handled in order, so this returns after both notifies.
        scheduler.trigger(SyncTrigger::Manual).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks() {
        let schedule = Schedule {
            drain_interval: Some(Duration::from_secs(3600)),
            reconcile_interval: Some(Duration::from_secs(30)),
        };
        let (scheduler, handle) = SyncScheduler::new(schedule);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let task = tokio::spawn(async move {
            handle
                .run(move |trigger| {
                    let seen = seen_clone.clone();
                    async move {
                        seen.lock().unwrap().push(trigger);
                        Ok(None)
                    }
                })
                .await;
        });

        tokio::time::sleep(Duration::from_secs(3601)).await;
        scheduler.shutdown().await;
        task.await.unwrap();

        let seen = seen.lock().unwrap();
        let drains = seen.iter().filter(|t| **t == SyncTrigger::Periodic).count();
        let reconciles = seen.iter().filter(|t| **t == SyncTrigger::Reconcile).count();
        assert_eq!(drains, 1);
        assert!((119..=120).contains(&reconciles));
    }
}
