//! Background Sync Scheduler
//!
//! Turns host signals into orchestrator calls on a single Tokio task:
//! - LocalChange: debounced push (Active only)
//! - Poll timer: metadata check while Mirroring, slower when the view is hidden
//! - Visibility / Interaction: arm or cancel the Standby deadline
//! - Online / foreground: leave Standby with an immediate poll
//!
//! Pushes and polls run one at a time inside the loop; signals that arrive
//! meanwhile queue in the channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::orchestrator::{PullOutcome, SyncOrchestrator, SyncRole};

/// Host event delivered to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerSignal {
    /// The local dataset changed
    LocalChange,

    /// View became visible (`true`) or hidden (`false`)
    Visibility(bool),

    /// User interacted with the view
    Interaction,

    /// Network connectivity came back
    Online,

    Shutdown,
}

/// Sending side used by the host to feed signals
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerSignal>,
}

impl SchedulerHandle {
    pub fn send(&self, signal: SchedulerSignal) {
        if self.tx.send(signal).is_err() {
            log::debug!("Scheduler stopped, dropping signal {:?}", signal);
        }
    }

    pub fn local_change(&self) {
        self.send(SchedulerSignal::LocalChange);
    }

    pub fn visibility(&self, visible: bool) {
        self.send(SchedulerSignal::Visibility(visible));
    }

    pub fn interaction(&self) {
        self.send(SchedulerSignal::Interaction);
    }

    pub fn online(&self) {
        self.send(SchedulerSignal::Online);
    }

    pub fn shutdown(&self) {
        self.send(SchedulerSignal::Shutdown);
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,
}

/// Background scheduler driving one orchestrator
#[derive(Clone)]
pub struct SyncScheduler {
    orchestrator: SyncOrchestrator,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl SyncScheduler {
    pub fn new(orchestrator: SyncOrchestrator) -> Self {
        Self {
            orchestrator,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Start the background task and return the handle feeding it
    pub fn start(&self) -> Result<SchedulerHandle, SchedulerError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let running = self.running.clone();
        let orchestrator = self.orchestrator.clone();

        let handle = tokio::spawn(async move {
            Self::scheduler_loop(orchestrator, running.clone(), rx).await;
            running.store(false, Ordering::Release);
        });
        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        log::info!(
            "Sync scheduler started (debounce {} ms, throttle {} ms)",
            self.orchestrator.config().debounce_ms,
            self.orchestrator.config().throttle_ms
        );
        Ok(SchedulerHandle { tx })
    }

    /// Abort the background task
    pub fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(SchedulerError::NotRunning);
        }
        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        log::info!("Sync scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Wait for the background task to exit (after a Shutdown signal)
    pub async fn join(&self) {
        let handle = self
            .task_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    log::error!("Scheduler task failed: {}", e);
                }
            }
        }
    }

    async fn scheduler_loop(
        orchestrator: SyncOrchestrator,
        running: Arc<AtomicBool>,
        mut rx: mpsc::UnboundedReceiver<SchedulerSignal>,
    ) {
        let config = orchestrator.config().clone();
        let mut visible = true;
        let mut debounce: Option<Instant> = None;
        let mut poll: Option<Instant> = None;
        let mut standby: Option<Instant> = None;

        log::info!("Scheduler loop started");

        while running.load(Ordering::Acquire) {
            // Polling has a deadline only while mirroring
            let role = orchestrator.role().await;
            if role == SyncRole::Mirroring {
                if poll.is_none() {
                    poll = Some(Instant::now() + config.poll_interval(visible));
                }
            } else {
                poll = None;
            }

            tokio::select! {
                signal = rx.recv() => {
                    let now = Instant::now();
                    match signal {
                        None | Some(SchedulerSignal::Shutdown) => break,
                        Some(SchedulerSignal::LocalChange) => {
                            if role == SyncRole::Active {
                                // A newer change restarts the quiet period
                                debounce = Some(now + config.debounce());
                            }
                            if !visible {
                                standby = Some(now + config.standby_idle());
                            }
                        }
                        Some(SchedulerSignal::Interaction) => {
                            if !visible {
                                standby = Some(now + config.standby_idle());
                            }
                        }
                        Some(SchedulerSignal::Visibility(is_visible)) => {
                            visible = is_visible;
                            if is_visible {
                                standby = None;
                                poll = if orchestrator.resume().await { Some(now) } else { None };
                            } else {
                                standby = Some(now + config.standby_idle());
                                // Re-armed with the hidden cadence
                                poll = None;
                            }
                        }
                        Some(SchedulerSignal::Online) => {
                            if orchestrator.resume().await || role == SyncRole::Mirroring {
                                poll = Some(now);
                            }
                        }
                    }
                }
                _ = sleep_until_opt(debounce) => {
                    debounce = None;
                    match orchestrator.push_now().await {
                        Ok(Some(report)) => log::debug!(
                            "Scheduled push: {} written, {} failed, {} conflicted",
                            report.written.len(),
                            report.failed.len(),
                            report.conflicted.len()
                        ),
                        Ok(None) => {}
                        Err(e) => log::warn!("Scheduled push failed: {}", e),
                    }
                }
                _ = sleep_until_opt(poll) => {
                    poll = None;
                    match orchestrator.poll_tick().await {
                        Ok(PullOutcome::Applied { provider, .. }) => {
                            log::info!("Poll applied remote changes from {}", provider);
                        }
                        Ok(_) => {}
                        Err(e) => log::warn!("Poll failed: {}", e),
                    }
                }
                _ = sleep_until_opt(standby) => {
                    standby = None;
                    if !visible {
                        orchestrator.enter_standby().await;
                    }
                }
            }
        }

        log::info!("Scheduler loop exited");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

// ============================================================================
// Tests
// ============================================================================
