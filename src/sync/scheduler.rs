//! Background Sync Scheduler
//!
//! Runs the periodic queue drain and device heartbeat on Tokio tasks.
//! The scheduler knows nothing about the engine; it calls back into a
//! `BackgroundWork` implementation on every tick.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Shortest interval either loop accepts
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Work performed on each scheduler tick.
///
/// Each method returns `false` once the owner is gone, which ends the loop.
#[async_trait]
pub trait BackgroundWork: Send + Sync + 'static {
    async fn drain_tick(&self) -> bool;
    async fn heartbeat_tick(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub drain_interval: Duration,
    pub heartbeat_interval: Duration,
}

/// Background scheduler for the drain and heartbeat loops
#[derive(Clone, Default)]
pub struct BackgroundScheduler {
    running: Arc<AtomicBool>,
    task_handles: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

impl BackgroundScheduler {
    /// Create new scheduler instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Start both loops
    pub fn start(
        &self,
        work: Arc<dyn BackgroundWork>,
        config: SchedulerConfig,
    ) -> Result<(), SchedulerError> {
        for (name, interval) in [
            ("drain", config.drain_interval),
            ("heartbeat", config.heartbeat_interval),
        ] {
            if interval < MIN_INTERVAL {
                return Err(SchedulerError::InvalidInterval(format!(
                    "{} interval must be at least {:?}, got {:?}",
                    name, MIN_INTERVAL, interval
                )));
            }
        }

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let drain = tokio::spawn(Self::drain_loop(
            self.running.clone(),
            work.clone(),
            config.drain_interval,
        ));
        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            self.running.clone(),
            work,
            config.heartbeat_interval,
        ));

        let mut handles = self.task_handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.push(drain);
        handles.push(heartbeat);

        log::info!(
            "Background scheduler started (drain every {:?}, heartbeat every {:?})",
            config.drain_interval,
            config.heartbeat_interval
        );
        Ok(())
    }

    /// Stop both loops
    pub fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        let handles: Vec<_> = self
            .task_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    /// Check if scheduler is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn drain_loop(running: Arc<AtomicBool>, work: Arc<dyn BackgroundWork>, period: Duration) {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if !running.load(Ordering::SeqCst) {
                break;
            }

            log::debug!("Scheduled queue drain");
            if !work.drain_tick().await {
                log::info!("Drain loop: owner dropped, exiting");
                break;
            }
        }
    }

    async fn heartbeat_loop(
        running: Arc<AtomicBool>,
        work: Arc<dyn BackgroundWork>,
        period: Duration,
    ) {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if !running.load(Ordering::SeqCst) {
                break;
            }

            if !work.heartbeat_tick().await {
                log::info!("Heartbeat loop: owner dropped, exiting");
                break;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
