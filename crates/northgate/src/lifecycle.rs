// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connector lifecycle state machine.
//!
//! ```text
//!                  connect()                 handshake ok
//!  Disconnected ─────────────> Connecting ─────────────────> Connected
//!       ^                          │                             │
//!       │ disconnect()             │ transport error             │ on_failure()
//!       │                          v                             v
//!  Disconnecting <──────────── Reconnecting <────────────────────┘
//!                                  │
//!                                  └── retry timer ──> Connecting
//! ```
//!
//! Transport failures are retried forever at the connector's retry
//! interval while it is enabled. Configuration failures disable the
//! connector and are never retried. A `Reconnecting` connector never holds
//! a live session and a `Connected` one never has a pending timer.

use crate::driver::Connectable;
use crate::error::{GatewayError, Result};
use crate::model::ConnectorInfo;
use crate::status::{ConnectorStats, SharedStatusSink, StatusEvent};
use crate::timer::RetryTimer;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Connection state of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

type FailureHook = Box<dyn Fn(GatewayError) + Send + Sync>;

/// Lets a driver report a session failure noticed outside of a call made
/// by the connector (dropped socket, broker disconnect, ...).
///
/// The notifier is handed to the driver factory before the lifecycle exists
/// and gets bound once the lifecycle is built.
#[derive(Clone, Default)]
pub struct FailureNotifier {
    hook: Arc<OnceLock<FailureHook>>,
}

impl FailureNotifier {
    /// Report a failure. Ignored until the notifier is bound.
    pub fn notify(&self, error: GatewayError) {
        match self.hook.get() {
            Some(hook) => hook(error),
            None => debug!("Failure reported before connector was ready: {}", error),
        }
    }

    fn bind(&self, hook: FailureHook) {
        if self.hook.set(hook).is_err() {
            warn!("Failure notifier already bound");
        }
    }
}

impl fmt::Debug for FailureNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureNotifier")
            .field("bound", &self.hook.get().is_some())
            .finish()
    }
}

/// Connection state machine wrapping one driver.
pub struct ConnectorLifecycle<D: ?Sized> {
    info: ConnectorInfo,
    driver: Arc<D>,
    state: Mutex<ConnectionState>,
    enabled: AtomicBool,
    /// Set for the duration of a manual `disconnect()`.
    disconnecting: AtomicBool,
    /// Set by `connect()`, cleared by `disconnect()`; retries need it.
    wanted: AtomicBool,
    retry_interval: Duration,
    timer: RetryTimer,
    retry_tx: mpsc::UnboundedSender<()>,
    /// Serializes handshakes and releases.
    session: tokio::sync::Mutex<()>,
    status: SharedStatusSink,
    stats: Arc<ConnectorStats>,
}

impl<D> ConnectorLifecycle<D>
where
    D: Connectable + ?Sized + 'static,
{
    /// Create a disconnected lifecycle.
    ///
    /// Spawns the retry worker, so it must be called within a Tokio runtime.
    pub fn new(
        info: ConnectorInfo,
        driver: Arc<D>,
        retry_interval: Duration,
        status: SharedStatusSink,
        stats: Arc<ConnectorStats>,
    ) -> Arc<Self> {
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel();
        let lifecycle = Arc::new(Self {
            timer: RetryTimer::new(format!("{info} retry")),
            info,
            driver,
            state: Mutex::new(ConnectionState::Disconnected),
            enabled: AtomicBool::new(true),
            disconnecting: AtomicBool::new(false),
            wanted: AtomicBool::new(false),
            retry_interval,
            retry_tx,
            session: tokio::sync::Mutex::new(()),
            status,
            stats,
        });

        let weak = Arc::downgrade(&lifecycle);
        tokio::spawn(async move {
            while retry_rx.recv().await.is_some() {
                let Some(lifecycle) = weak.upgrade() else {
                    break;
                };
                // Errors are logged and re-armed inside.
                let _ = lifecycle.establish(true).await;
            }
        });

        lifecycle
    }

    /// Route driver-reported failures into [`Self::on_failure`].
    pub fn bind_failures(self: &Arc<Self>, notifier: &FailureNotifier) {
        let weak = Arc::downgrade(self);
        notifier.bind(Box::new(move |error| {
            let Some(lifecycle) = weak.upgrade() else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { lifecycle.on_failure(error).await });
                }
                Err(_) => warn!("{}: failure outside runtime dropped: {}", lifecycle.info, error),
            }
        }));
    }

    pub fn info(&self) -> &ConnectorInfo {
        &self.info
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether a reconnect is scheduled.
    pub fn retry_pending(&self) -> bool {
        self.timer.is_pending()
    }

    /// Open the session. On a transport failure a reconnect is scheduled
    /// and the error is still returned to the caller.
    pub async fn connect(&self) -> Result<()> {
        self.wanted.store(true, Ordering::SeqCst);
        self.establish(false).await
    }

    async fn establish(&self, from_timer: bool) -> Result<()> {
        self.timer.cancel();
        if !self.is_enabled() {
            return Err(GatewayError::Disabled(self.info.id.clone()));
        }

        let _session = self.session.lock().await;
        let abandoned =
            !self.wanted.load(Ordering::SeqCst) || self.disconnecting.load(Ordering::SeqCst);
        if from_timer && abandoned {
            debug!("{}: reconnect skipped, connector was disconnected", self.info);
            return Ok(());
        }
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        debug!("{}: connecting", self.info);
        match self.driver.connect().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!("{}: connected", self.info);
                self.status.publish(StatusEvent::Connected {
                    connector: self.info.id.clone(),
                });
                Ok(())
            }
            Err(err) => {
                self.stats.record_error();
                self.release().await;
                self.handle_error(&err);
                Err(err)
            }
        }
    }

    /// Close the session and cancel any pending reconnect. Safe to call in
    /// any state, any number of times.
    pub async fn disconnect(&self) -> Result<()> {
        self.wanted.store(false, Ordering::SeqCst);
        self.disconnecting.store(true, Ordering::SeqCst);
        self.timer.cancel();

        let _session = self.session.lock().await;
        let previous = self.state();
        if previous != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnecting);
            if matches!(
                previous,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                self.release().await;
            }
            self.set_state(ConnectionState::Disconnected);
            info!("{}: disconnected", self.info);
            self.status.publish(StatusEvent::Disconnected {
                connector: self.info.id.clone(),
            });
        }
        self.disconnecting.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Failure hook for errors raised while connected (delivery errors,
    /// dropped sessions). Cycles the session through a reconnect.
    pub async fn on_failure(&self, err: GatewayError) {
        self.stats.record_error();
        let _session = self.session.lock().await;
        if self.state() != ConnectionState::Connected {
            debug!("{}: failure ignored in state {}: {}", self.info, self.state(), err);
            return;
        }
        self.release().await;
        self.handle_error(&err);
    }

    /// Called with the session lock held, after the session was released.
    fn handle_error(&self, err: &GatewayError) {
        self.status.publish(StatusEvent::Error {
            connector: self.info.id.clone(),
            message: err.to_string(),
        });

        if err.is_configuration() {
            error!("{}: {}; connector disabled", self.info, err);
            self.set_enabled(false);
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        if self.disconnecting.load(Ordering::SeqCst)
            || !self.wanted.load(Ordering::SeqCst)
            || !self.is_enabled()
        {
            warn!("{}: {}", self.info, err);
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        warn!(
            "{}: {}; retrying in {:?}",
            self.info, err, self.retry_interval
        );
        self.set_state(ConnectionState::Reconnecting);
        self.status.publish(StatusEvent::Reconnecting {
            connector: self.info.id.clone(),
            retry_in: self.retry_interval,
        });
        let retry_tx = self.retry_tx.clone();
        self.timer.arm(self.retry_interval, move || async move {
            let _ = retry_tx.send(());
        });
    }

    async fn release(&self) {
        if let Err(err) = self.driver.disconnect().await {
            warn!("{}: error while releasing session: {}", self.info, err);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectorKind;
    use crate::status::ChannelStatusSink;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct ScriptedDriver {
        connect_results: Mutex<VecDeque<Result<()>>>,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl ScriptedDriver {
        fn with_results(results: Vec<Result<()>>) -> Arc<Self> {
            Arc::new(Self {
                connect_results: Mutex::new(results.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl Connectable for ScriptedDriver {
        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connect_results.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn disconnect(&self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn lifecycle(
        driver: Arc<ScriptedDriver>,
        retry: Duration,
    ) -> Arc<ConnectorLifecycle<ScriptedDriver>> {
        let info = ConnectorInfo {
            id: "s1".into(),
            name: "South 1".into(),
            type_name: "scripted".into(),
            kind: ConnectorKind::South,
        };
        let (sink, _rx) = ChannelStatusSink::new();
        let stats = Arc::new(ConnectorStats::new(info.clone()));
        ConnectorLifecycle::new(info, driver, retry, Arc::new(sink), stats)
    }

    #[tokio::test]
    async fn test_connect_success() {
        let driver = ScriptedDriver::with_results(vec![]);
        let lc = lifecycle(driver.clone(), Duration::from_millis(10));
        lc.connect().await.unwrap();
        assert_eq!(lc.state(), ConnectionState::Connected);
        assert!(!lc.retry_pending());
    }

    #[tokio::test]
    async fn test_transport_error_retries_until_connected() {
        let driver = ScriptedDriver::with_results(vec![
            Err(GatewayError::Transport("refused".into())),
            Err(GatewayError::Transport("refused".into())),
        ]);
        let lc = lifecycle(driver.clone(), Duration::from_millis(10));

        assert!(lc.connect().await.is_err());
        assert_eq!(lc.state(), ConnectionState::Reconnecting);
        assert!(lc.retry_pending());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(lc.state(), ConnectionState::Connected);
        assert_eq!(driver.connects.load(Ordering::SeqCst), 3);
        assert!(!lc.retry_pending());
    }

    #[tokio::test]
    async fn test_configuration_error_disables() {
        let driver = ScriptedDriver::with_results(vec![Err(GatewayError::invalid("bad host"))]);
        let lc = lifecycle(driver.clone(), Duration::from_millis(10));

        let err = lc.connect().await.unwrap_err();
        assert!(err.is_configuration());
        assert!(!lc.is_enabled());
        assert!(!lc.retry_pending());
        assert_eq!(lc.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
        assert!(matches!(lc.connect().await, Err(GatewayError::Disabled(_))));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_retry() {
        let driver = ScriptedDriver::with_results(vec![Err(GatewayError::Transport(
            "refused".into(),
        ))]);
        let lc = lifecycle(driver.clone(), Duration::from_millis(30));

        let _ = lc.connect().await;
        assert!(lc.retry_pending());
        lc.disconnect().await.unwrap();
        assert!(!lc.retry_pending());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lc.state(), ConnectionState::Disconnected);
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_double_disconnect_is_idempotent() {
        let driver = ScriptedDriver::with_results(vec![]);
        let lc = lifecycle(driver.clone(), Duration::from_millis(10));
        lc.connect().await.unwrap();

        lc.disconnect().await.unwrap();
        lc.disconnect().await.unwrap();
        assert_eq!(lc.state(), ConnectionState::Disconnected);
        assert_eq!(driver.disconnects.load(Ordering::SeqCst), 1);
        assert!(!lc.retry_pending());
    }

    #[tokio::test]
    async fn test_on_failure_cycles_session() {
        let driver = ScriptedDriver::with_results(vec![]);
        let lc = lifecycle(driver.clone(), Duration::from_millis(10));
        lc.connect().await.unwrap();

        lc.on_failure(GatewayError::Delivery("HTTP 503".into())).await;
        assert_eq!(lc.state(), ConnectionState::Reconnecting);
        assert_eq!(driver.disconnects.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lc.state(), ConnectionState::Connected);
        assert_eq!(driver.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_notifier_reaches_lifecycle() {
        let driver = ScriptedDriver::with_results(vec![]);
        let lc = lifecycle(driver.clone(), Duration::from_secs(60));
        let notifier = FailureNotifier::default();
        lc.bind_failures(&notifier);
        lc.connect().await.unwrap();

        notifier.notify(GatewayError::Transport("socket closed".into()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lc.state(), ConnectionState::Reconnecting);
        assert!(lc.retry_pending());
        lc.disconnect().await.unwrap();
    }
}
