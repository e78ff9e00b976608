//! Network Monitor - connectivity tracking
//!
//! Keeps the single current `NetworkStatus`, replaced wholesale on every
//! probe, and notifies subscribers only when the new status differs from
//! the previous one.
//!
//! Features:
//! - Pluggable reachability probe (`HttpProbe` for production)
//! - Latency-derived signal strength and bandwidth estimates
//! - Periodic background checks (minimum interval 5 seconds)
//! - `wait_for_online` driven by change notifications, never by polling

use super::observers::{ObserverRegistry, SubscriptionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// Constants
// ============================================================================

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Data Types
// ============================================================================

/// Physical connection class, when the platform can tell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionClass {
    None,
    Wifi,
    Cellular,
    Ethernet,
    Unknown,
}

/// Coarse connection quality derived from latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Offline,
}

/// Snapshot of connectivity. `reachable == Some(true)` implies `online`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub online: bool,
    pub connection_class: ConnectionClass,
    /// `None` until a probe has run
    pub reachable: Option<bool>,
    pub latency_ms: Option<u64>,
    pub signal_strength: Option<u8>,
    /// Kbit/s
    pub bandwidth_estimate: Option<u64>,
}

impl NetworkStatus {
    /// Status before the first probe
    pub fn unknown() -> Self {
        Self {
            online: false,
            connection_class: ConnectionClass::Unknown,
            reachable: None,
            latency_ms: None,
            signal_strength: None,
            bandwidth_estimate: None,
        }
    }

    /// Status after a failed probe
    pub fn offline() -> Self {
        Self {
            online: false,
            connection_class: ConnectionClass::None,
            reachable: Some(false),
            latency_ms: None,
            signal_strength: None,
            bandwidth_estimate: None,
        }
    }

    /// Status after a successful probe
    pub fn from_probe(report: &ProbeReport) -> Self {
        let latency_ms = report.latency.as_millis() as u64;
        Self {
            online: true,
            connection_class: report.connection_class,
            reachable: Some(true),
            latency_ms: Some(latency_ms),
            signal_strength: Some(signal_strength_for(latency_ms)),
            bandwidth_estimate: Some(bandwidth_estimate_for(latency_ms)),
        }
    }

    pub fn quality(&self) -> ConnectionQuality {
        if !self.online {
            return ConnectionQuality::Offline;
        }
        match self.latency_ms {
            None => ConnectionQuality::Good,
            Some(ms) if ms < 100 => ConnectionQuality::Excellent,
            Some(ms) if ms < 300 => ConnectionQuality::Good,
            Some(ms) if ms < 1000 => ConnectionQuality::Fair,
            Some(_) => ConnectionQuality::Poor,
        }
    }
}

/// Signal strength (0..=100) for a measured round trip
pub fn signal_strength_for(latency_ms: u64) -> u8 {
    match latency_ms {
        0..=49 => 100,
        50..=99 => 90,
        100..=199 => 80,
        200..=499 => 60,
        500..=999 => 40,
        1000..=1999 => 20,
        _ => 10,
    }
}

/// Bandwidth estimate in Kbit/s for a measured round trip
pub fn bandwidth_estimate_for(latency_ms: u64) -> u64 {
    match latency_ms {
        0..=49 => 100_000,
        50..=99 => 50_000,
        100..=199 => 20_000,
        200..=499 => 10_000,
        500..=999 => 5_000,
        1000..=1999 => 1_000,
        _ => 500,
    }
}

// ============================================================================
// Probes
// ============================================================================

/// Result of a successful reachability probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub latency: Duration,
    pub connection_class: ConnectionClass,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("HTTP probe failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid probe endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),
}

/// Reachability check against a well-known endpoint
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> Result<ProbeReport, ProbeError>;
}

/// Probe that issues a `HEAD` request and times the round trip.
///
/// Any HTTP response, including error statuses, counts as reachable.
pub struct HttpProbe {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpProbe {
    pub fn new(endpoint: &str) -> Result<Self, ProbeError> {
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| ProbeError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;

        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> Result<ProbeReport, ProbeError> {
        let started = Instant::now();
        let response = self.client.head(self.endpoint.clone()).send().await?;
        let latency = started.elapsed();

        log::debug!("Probe {} answered {} in {:?}", self.endpoint, response.status(), latency);

        Ok(ProbeReport {
            latency,
            connection_class: ConnectionClass::Unknown,
        })
    }
}

// ============================================================================
// Network Monitor
// ============================================================================

/// Maintains the current network status and fans out changes
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    probe: Arc<dyn Probe>,
    status: watch::Sender<NetworkStatus>,
    listeners: ObserverRegistry<NetworkStatus>,
    task_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        let (status, _) = watch::channel(NetworkStatus::unknown());
        Self {
            inner: Arc::new(MonitorInner {
                probe,
                status,
                listeners: ObserverRegistry::new("network"),
                task_handle: StdMutex::new(None),
            }),
        }
    }

    /// Current status snapshot
    pub fn status(&self) -> NetworkStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.status.borrow().online
    }

    pub fn connection_quality(&self) -> ConnectionQuality {
        self.inner.status.borrow().quality()
    }

    /// Probe once and publish the result
    ///
    /// Failures are not retried here; they produce an offline status that the
    /// next periodic tick re-probes.
    pub async fn check(&self) -> NetworkStatus {
        let status = match self.inner.probe.probe().await {
            Ok(report) => NetworkStatus::from_probe(&report),
            Err(e) => {
                log::warn!("Network probe failed: {}", e);
                NetworkStatus::offline()
            }
        };

        self.apply(status.clone());
        status
    }

    /// Replace the current status; notifies listeners only on change
    pub fn apply(&self, status: NetworkStatus) -> bool {
        let changed = self.inner.status.send_if_modified(|current| {
            if *current != status {
                *current = status.clone();
                true
            } else {
                false
            }
        });

        if changed {
            log::info!(
                "Network status changed: online={}, quality={:?}",
                status.online,
                status.quality()
            );
            self.inner.listeners.notify(&status);
        }

        changed
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&NetworkStatus) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    /// Wait until the status reports online, or the timeout elapses
    pub async fn wait_for_online(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.status.subscribe();
        if rx.borrow_and_update().online {
            return true;
        }

        let outcome = tokio::time::timeout(timeout, rx.wait_for(|status| status.online)).await;
        matches!(outcome, Ok(Ok(_)))
    }

    /// Start probing on a fixed interval, replacing any running checker.
    ///
    /// Intervals under 5 seconds are rejected with a warning.
    pub fn start_periodic_checks(&self, interval: Duration) -> bool {
        if interval < MIN_CHECK_INTERVAL {
            log::warn!(
                "Network check interval {:?} is below the {:?} minimum; not starting",
                interval,
                MIN_CHECK_INTERVAL
            );
            return false;
        }

        self.stop();

        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                NetworkMonitor { inner }.check().await;
            }

            log::debug!("Network check loop exited");
        });

        *self.lock_task() = Some(handle);
        log::info!("Periodic network checks started (interval: {:?})", interval);
        true
    }

    /// Stop periodic checks, if running
    pub fn stop(&self) {
        if let Some(handle) = self.lock_task().take() {
            handle.abort();
            log::info!("Periodic network checks stopped");
        }
    }

    pub fn is_checking(&self) -> bool {
        self.lock_task().is_some()
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.task_handle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe that replays scripted results, then repeats the last one
    pub(crate) struct ScriptedProbe {
        script: StdMutex<VecDeque<Result<Duration, String>>>,
        last: StdMutex<Result<Duration, String>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedProbe {
        pub(crate) fn new(script: Vec<Result<Duration, String>>) -> Self {
            Self {
                script: StdMutex::new(script.into()),
                last: StdMutex::new(Err("no script".to_string())),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn online(latency_ms: u64) -> Self {
            Self::new(vec![Ok(Duration::from_millis(latency_ms))])
        }

        pub(crate) fn offline() -> Self {
            Self::new(vec![Err("unreachable".to_string())])
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self) -> Result<ProbeReport, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            let result = match next {
                Some(result) => {
                    *self.last.lock().unwrap() = result.clone();
                    result
                }
                None => self.last.lock().unwrap().clone(),
            };

            result
                .map(|latency| ProbeReport {
                    latency,
                    connection_class: ConnectionClass::Wifi,
                })
                .map_err(ProbeError::Unreachable)
        }
    }

    fn monitor(probe: ScriptedProbe) -> NetworkMonitor {
        NetworkMonitor::new(Arc::new(probe))
    }

    #[test]
    fn test_signal_strength_buckets() {
        assert_eq!(signal_strength_for(40), 100);
        assert_eq!(signal_strength_for(75), 90);
        assert_eq!(signal_strength_for(150), 80);
        assert_eq!(signal_strength_for(300), 60);
        assert_eq!(signal_strength_for(600), 40);
        assert_eq!(signal_strength_for(1500), 20);
        assert_eq!(signal_strength_for(5000), 10);
    }

    #[test]
    fn test_quality_thresholds() {
        let mut status = NetworkStatus::from_probe(&ProbeReport {
            latency: Duration::from_millis(80),
            connection_class: ConnectionClass::Ethernet,
        });
        assert_eq!(status.quality(), ConnectionQuality::Excellent);

        status.latency_ms = Some(250);
        assert_eq!(status.quality(), ConnectionQuality::Good);

        status.latency_ms = Some(700);
        assert_eq!(status.quality(), ConnectionQuality::Fair);

        status.latency_ms = Some(1500);
        assert_eq!(status.quality(), ConnectionQuality::Poor);

        status.latency_ms = None;
        assert_eq!(status.quality(), ConnectionQuality::Good);

        assert_eq!(NetworkStatus::offline().quality(), ConnectionQuality::Offline);
    }

    #[tokio::test]
    async fn test_check_fast_probe() {
        let monitor = monitor(ScriptedProbe::online(40));

        let status = monitor.check().await;

        assert!(status.online);
        assert_eq!(status.reachable, Some(true));
        assert_eq!(status.signal_strength, Some(100));
        assert_eq!(monitor.status(), status);
    }

    #[tokio::test]
    async fn test_check_slow_probe() {
        let monitor = monitor(ScriptedProbe::online(600));

        let status = monitor.check().await;

        assert_eq!(status.signal_strength, Some(40));
        assert_eq!(status.bandwidth_estimate, Some(5_000));
        assert_eq!(monitor.connection_quality(), ConnectionQuality::Fair);
    }

    #[tokio::test]
    async fn test_probe_failure_reports_offline() {
        let monitor = monitor(ScriptedProbe::offline());

        let status = monitor.check().await;

        assert!(!status.online);
        assert_eq!(status.reachable, Some(false));
        assert_eq!(status.connection_class, ConnectionClass::None);
    }

    #[tokio::test]
    async fn test_notifies_only_on_change() {
        let monitor = monitor(ScriptedProbe::new(vec![
            Ok(Duration::from_millis(40)),
            Ok(Duration::from_millis(40)),
            Err("down".to_string()),
        ]));
        let notified = Arc::new(AtomicUsize::new(0));

        let notified_clone = notified.clone();
        monitor.subscribe(move |_| {
            notified_clone.fetch_add(1, Ordering::SeqCst);
        });

        monitor.check().await;
        monitor.check().await;
        monitor.check().await;

        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_listener_is_contained() {
        let monitor = monitor(ScriptedProbe::online(40));
        let notified = Arc::new(AtomicUsize::new(0));

        monitor.subscribe(|_| panic!("listener bug"));
        let notified_clone = notified.clone();
        monitor.subscribe(move |_| {
            notified_clone.fetch_add(1, Ordering::SeqCst);
        });

        let status = monitor.check().await;
        assert!(status.online);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_online_resolves_on_change() {
        let monitor = monitor(ScriptedProbe::online(40));

        let trigger = monitor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.check().await;
        });

        assert!(monitor.wait_for_online(Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_online_times_out() {
        let monitor = monitor(ScriptedProbe::online(40));

        let trigger = monitor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.check().await;
        });

        assert!(!monitor.wait_for_online(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_wait_for_online_when_already_online() {
        let monitor = monitor(ScriptedProbe::online(40));
        monitor.check().await;

        assert!(monitor.wait_for_online(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_rejects_short_interval() {
        let monitor = monitor(ScriptedProbe::online(40));

        assert!(!monitor.start_periodic_checks(Duration::from_secs(1)));
        assert!(!monitor.is_checking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_checks_tick() {
        let probe = Arc::new(ScriptedProbe::online(40));
        let monitor = NetworkMonitor::new(probe.clone());

        assert!(monitor.start_periodic_checks(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_secs(11)).await;
        monitor.stop();

        // Ticks at 0s, 5s and 10s
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert!(monitor.is_online());
        assert!(!monitor.is_checking());
    }

    #[tokio::test]
    async fn test_http_probe_reachable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("HEAD", "/health").with_status(204).create_async().await;

        let probe = HttpProbe::new(&format!("{}/health", server.url())).unwrap();
        let report = probe.probe().await.unwrap();

        assert_eq!(report.connection_class, ConnectionClass::Unknown);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        let probe = HttpProbe::new("http://127.0.0.1:1/").unwrap();
        assert!(probe.probe().await.is_err());
    }

    #[test]
    fn test_http_probe_invalid_endpoint() {
        assert!(matches!(HttpProbe::new("not a url"), Err(ProbeError::InvalidEndpoint(_))));
    }
}
