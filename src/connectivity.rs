//! Network reachability tracking.
//!
//! The platform (or the polling fallback below) publishes link-state
//! changes; subscribers receive them through a `watch` channel. The sync
//! engine drains the queue on every disconnected -> connected transition.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::HttpExecutor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub is_connected: bool,
    /// Link type as reported by the platform (`wifi`, `cellular`, `probe`, ...).
    #[serde(rename = "type")]
    pub kind: String,
}

impl NetworkStatus {
    pub fn online(kind: &str) -> Self {
        Self {
            is_connected: true,
            kind: kind.to_string(),
        }
    }

    pub fn offline() -> Self {
        Self {
            is_connected: false,
            kind: "none".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Connected,
    Disconnected,
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn status(&self) -> NetworkStatus {
        self.tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.tx.borrow().is_connected
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    /// Record the latest link state. Subscribers are only woken when the
    /// status actually changed.
    pub fn publish(&self, status: NetworkStatus) -> Transition {
        let mut transition = Transition::Unchanged;
        self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            if status.is_connected && !current.is_connected {
                transition = Transition::Connected;
            } else if !status.is_connected && current.is_connected {
                transition = Transition::Disconnected;
            }
            *current = status;
            true
        });

        match transition {
            Transition::Connected => info!("Network restored"),
            Transition::Disconnected => info!("Network lost"),
            Transition::Unchanged => {}
        }
        transition
    }

    /// Polling fallback for platforms without link-state push: probes the
    /// backend health endpoint every `interval` until cancelled.
    pub fn spawn_probe(
        &self,
        probe: Arc<dyn HttpExecutor>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reachable = probe.check_health().await;
                        let status = if reachable {
                            NetworkStatus::online("probe")
                        } else {
                            NetworkStatus::offline()
                        };
                        monitor.publish(status);
                    }
                }
            }
            info!("Connectivity probe stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use async_trait::async_trait;
    use reqwest::Method;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_publish_reports_transitions() {
        let monitor = ConnectivityMonitor::new(NetworkStatus::offline());
        assert!(!monitor.is_connected());

        assert_eq!(
            monitor.publish(NetworkStatus::online("wifi")),
            Transition::Connected
        );
        assert_eq!(
            monitor.publish(NetworkStatus::online("wifi")),
            Transition::Unchanged
        );
        // link type change while staying online is not a transition
        assert_eq!(
            monitor.publish(NetworkStatus::online("cellular")),
            Transition::Unchanged
        );
        assert_eq!(monitor.status().kind, "cellular");
        assert_eq!(
            monitor.publish(NetworkStatus::offline()),
            Transition::Disconnected
        );
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let monitor = ConnectivityMonitor::new(NetworkStatus::offline());
        let mut rx = monitor.subscribe();
        monitor.publish(NetworkStatus::online("wifi"));
        rx.changed().await.expect("changed");
        assert!(rx.borrow_and_update().is_connected);
    }

    struct FlagProbe(AtomicBool);

    #[async_trait]
    impl HttpExecutor for FlagProbe {
        async fn execute(
            &self,
            _method: Method,
            _endpoint: &str,
            _body: Option<&Value>,
            _idempotency_key: Option<&str>,
        ) -> Result<Value, ApiError> {
            Ok(Value::Null)
        }

        async fn check_health(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_probe_publishes_reachability() {
        let monitor = ConnectivityMonitor::new(NetworkStatus::offline());
        let mut rx = monitor.subscribe();
        let probe = Arc::new(FlagProbe(AtomicBool::new(true)));
        let cancel = CancellationToken::new();
        let handle = monitor.spawn_probe(probe, Duration::from_millis(10), cancel.clone());

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("probe published in time")
            .expect("channel open");
        assert!(monitor.is_connected());
        assert_eq!(monitor.status().kind, "probe");

        cancel.cancel();
        handle.await.expect("probe task");
    }
}
