//! BLE connection management.
//!
//! The [`Connector`] owns the only [`Session`] to the catalog device. It opens
//! the link, watches for link drops and reconnects after a fixed backoff.
//! Everything else holds a [`SessionHandle`], a weak reference that stops
//! upgrading the moment the session is torn down.

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ble::transport::{BleLink, BleTransport};
use crate::config::SyncConfig;
use crate::error::{Error, Result};

/// Connection state of the device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No session.
    #[default]
    Disconnected,
    /// Discovery or link establishment in progress.
    Connecting,
    /// Session open.
    Connected,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// An open link to the device. Owned by the [`Connector`].
pub struct Session {
    generation: u64,
    link: Arc<dyn BleLink>,
    live: AtomicBool,
}

impl Session {
    fn new(generation: u64, link: Arc<dyn BleLink>) -> Self {
        Self {
            generation,
            link,
            live: AtomicBool::new(true),
        }
    }

    /// Monotonic connection counter; bumps on every successful connect.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The underlying link.
    pub fn link(&self) -> &Arc<dyn BleLink> {
        &self.link
    }

    /// False once the connector tore the session down.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn invalidate(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn handle(self: &Arc<Self>) -> SessionHandle {
        SessionHandle {
            generation: self.generation,
            inner: Arc::downgrade(self),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("peripheral", &self.link.identifier())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Non-owning reference to a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    generation: u64,
    inner: Weak<Session>,
}

impl SessionHandle {
    /// Generation of the session this handle was issued for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Get the session if it is still open.
    pub fn upgrade(&self) -> Option<Arc<Session>> {
        self.inner.upgrade().filter(|s| s.is_live())
    }

    /// Check if the session is still open.
    pub fn is_live(&self) -> bool {
        self.upgrade().is_some()
    }
}

/// Event emitted by the connector.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// The settle delay elapsed; the catalog can be fetched.
    Ready(SessionHandle),
    /// An established session dropped.
    ConnectionLost {
        /// Generation of the dropped session.
        generation: u64,
    },
    /// An automatic reconnect will run after `delay`.
    ReconnectScheduled {
        /// The backoff delay.
        delay: Duration,
    },
    /// A connect attempt failed.
    ConnectFailed {
        /// Description of the failure.
        reason: String,
    },
}

/// Messages delivered to the connector's supervisor task.
#[derive(Debug)]
enum Signal {
    LinkDropped { generation: u64 },
    ReconnectDue { ticket: u64 },
}

/// Manages the connection to the catalog device.
pub struct Connector {
    shared: Arc<Shared>,
    supervisor: JoinHandle<()>,
}

struct Shared {
    transport: Arc<dyn BleTransport>,
    service: Uuid,
    settle_delay: Duration,
    reconnect_backoff: Duration,
    state: RwLock<ConnectionState>,
    session: RwLock<Option<Arc<Session>>>,
    generation: AtomicU64,
    connect_attempts: AtomicU64,
    /// Bumped on every schedule/cancel so a stale timer cannot fire.
    reconnect_ticket: AtomicU64,
    /// Bumped by `disconnect`, under the session lock, so an attempt that
    /// started earlier does not publish its session.
    disconnect_epoch: AtomicU64,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    watcher_task: Mutex<Option<JoinHandle<()>>>,
    settle_task: Mutex<Option<JoinHandle<()>>>,
    event_tx: broadcast::Sender<ConnectorEvent>,
    signal_tx: mpsc::UnboundedSender<Signal>,
}

impl Connector {
    /// Create a connector over `transport`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn BleTransport>, config: &SyncConfig) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            transport,
            service: config.service_uuid,
            settle_delay: config.settle_delay,
            reconnect_backoff: config.reconnect_backoff,
            state: RwLock::new(ConnectionState::Disconnected),
            session: RwLock::new(None),
            generation: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            reconnect_ticket: AtomicU64::new(0),
            disconnect_epoch: AtomicU64::new(0),
            reconnect_task: Mutex::new(None),
            watcher_task: Mutex::new(None),
            settle_task: Mutex::new(None),
            event_tx,
            signal_tx,
        });

        let supervisor = tokio::spawn(Shared::supervise(shared.clone(), signal_rx));

        Self { shared, supervisor }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Handle to the current session, if any.
    pub fn session(&self) -> Option<SessionHandle> {
        self.shared.session.read().as_ref().map(|s| s.handle())
    }

    /// Subscribe to connector events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Number of connect attempts made so far, manual and automatic.
    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Check if an automatic reconnect is waiting on its backoff.
    pub fn is_reconnect_pending(&self) -> bool {
        self.shared
            .reconnect_task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Discover the device and open a session.
    ///
    /// A pending automatic reconnect is cancelled. Failures are not retried;
    /// call again to retry.
    pub async fn connect(&self) -> Result<SessionHandle> {
        self.shared.cancel_reconnect();
        self.shared.connect_once().await
    }

    /// Close the session without scheduling a reconnect.
    ///
    /// A connect attempt still in progress is cancelled: it closes its link
    /// and fails with `ConnectCancelled` instead of publishing a session.
    pub async fn disconnect(&self) -> Result<()> {
        self.shared.cancel_reconnect();
        self.shared.abort_session_tasks();

        let session = {
            let mut slot = self.shared.session.write();
            self.shared.disconnect_epoch.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };

        let Some(session) = session else {
            if self.state().is_transitioning() {
                info!("Cancelling connection attempt in progress");
            }
            return Ok(());
        };

        session.invalidate();
        self.shared.set_state(ConnectionState::Disconnected);

        if !session.link().is_connected().await {
            debug!("Link already down");
            return Ok(());
        }

        match session.link().disconnect().await {
            Ok(()) => {
                info!("Disconnected from catalog device");
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect: {}", e);
                Err(e)
            }
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.supervisor.abort();
        self.shared.cancel_reconnect();
        self.shared.abort_session_tasks();
    }
}

impl Shared {
    async fn supervise(shared: Arc<Self>, mut signals: mpsc::UnboundedReceiver<Signal>) {
        while let Some(signal) = signals.recv().await {
            match signal {
                Signal::LinkDropped { generation } => shared.handle_link_dropped(generation),
                Signal::ReconnectDue { ticket } => {
                    if ticket != shared.reconnect_ticket.load(Ordering::SeqCst) {
                        debug!("Ignoring superseded reconnect");
                        continue;
                    }
                    shared.reconnect().await;
                }
            }
        }

        debug!("Connector supervisor ended");
    }

    async fn connect_once(&self) -> Result<SessionHandle> {
        let epoch = self.disconnect_epoch.load(Ordering::SeqCst);

        {
            let mut state = self.state.write();
            match *state {
                ConnectionState::Connected => {
                    if let Some(session) = self.session.read().as_ref() {
                        debug!("Already connected");
                        return Ok(session.handle());
                    }
                }
                ConnectionState::Connecting => return Err(Error::ConnectInProgress),
                ConnectionState::Disconnected => {}
            }
            *state = ConnectionState::Connecting;
        }
        self.emit(ConnectorEvent::StateChanged(ConnectionState::Connecting));
        debug!("Connection state changed: Disconnected -> Connecting");

        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Connecting to catalog device (attempt {})", attempt);

        let opened = async {
            let link = self.transport.discover(self.service).await?;
            link.connect().await?;
            match link.disconnections().await {
                Ok(drops) => Ok((link, drops)),
                Err(e) => {
                    if let Err(close) = link.disconnect().await {
                        debug!("Failed to close link after watch error: {}", close);
                    }
                    Err(e)
                }
            }
        }
        .await;

        let (link, mut drops) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                error!("Failed to connect: {}", e);
                self.set_state(ConnectionState::Disconnected);
                self.emit(ConnectorEvent::ConnectFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(Session::new(generation, link.clone()));
        let handle = session.handle();

        let published = {
            let mut slot = self.session.write();
            let current = self.disconnect_epoch.load(Ordering::SeqCst) == epoch;
            if current {
                *slot = Some(session.clone());
                self.set_state(ConnectionState::Connected);
            }
            current
        };

        if !published {
            session.invalidate();
            info!("Connection attempt {} cancelled by disconnect", attempt);
            if let Err(e) = link.disconnect().await {
                debug!("Failed to close cancelled link: {}", e);
            }
            self.set_state(ConnectionState::Disconnected);
            return Err(Error::ConnectCancelled);
        }

        info!(
            "Connected to catalog device {} (session {})",
            session.link().identifier(),
            generation
        );

        let signal_tx = self.signal_tx.clone();
        let watcher = tokio::spawn(async move {
            drops.next().await;
            let _ = signal_tx.send(Signal::LinkDropped { generation });
        });
        if let Some(old) = self.watcher_task.lock().replace(watcher) {
            old.abort();
        }

        let settle_delay = self.settle_delay;
        let event_tx = self.event_tx.clone();
        let ready = handle.clone();
        let settle = tokio::spawn(async move {
            tokio::time::sleep(settle_delay).await;
            if ready.is_live() {
                debug!("Session {} settled", ready.generation());
                let _ = event_tx.send(ConnectorEvent::Ready(ready));
            }
        });
        if let Some(old) = self.settle_task.lock().replace(settle) {
            old.abort();
        }

        Ok(handle)
    }

    fn handle_link_dropped(&self, generation: u64) {
        let session = {
            let mut slot = self.session.write();
            match slot.as_ref() {
                Some(current) if current.generation() == generation => slot.take(),
                _ => None,
            }
        };

        let Some(session) = session else {
            debug!("Ignoring drop of stale session {}", generation);
            return;
        };

        session.invalidate();
        if let Some(settle) = self.settle_task.lock().take() {
            settle.abort();
        }

        warn!("{} (session {})", Error::ConnectionLost, generation);
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectorEvent::ConnectionLost { generation });

        self.schedule_reconnect();
    }

    async fn reconnect(&self) {
        if !matches!(*self.state.read(), ConnectionState::Disconnected) {
            debug!("Skipping reconnect, state is {}", *self.state.read());
            return;
        }

        info!("Connection lost, attempting to reconnect...");

        if let Err(e) = self.connect_once().await {
            error!("Reconnection failed: {}", e);
        }
    }

    fn schedule_reconnect(&self) {
        let ticket = self.reconnect_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.reconnect_backoff;
        let signal_tx = self.signal_tx.clone();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signal_tx.send(Signal::ReconnectDue { ticket });
        });

        if let Some(old) = self.reconnect_task.lock().replace(timer) {
            old.abort();
        }

        info!("Reconnecting in {:?}", delay);
        self.emit(ConnectorEvent::ReconnectScheduled { delay });
    }

    fn cancel_reconnect(&self) {
        self.reconnect_ticket.fetch_add(1, Ordering::SeqCst);
        if let Some(timer) = self.reconnect_task.lock().take() {
            if !timer.is_finished() {
                debug!("Cancelling pending reconnect");
            }
            timer.abort();
        }
    }

    fn abort_session_tasks(&self) {
        if let Some(watcher) = self.watcher_task.lock().take() {
            watcher.abort();
        }
        if let Some(settle) = self.settle_task.lock().take() {
            settle.abort();
        }
    }

    /// Update the connection state and emit an event.
    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new_state)
        };

        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);
            self.emit(ConnectorEvent::StateChanged(new_state));
        }
    }

    fn emit(&self, event: ConnectorEvent) {
        let _ = self.event_tx.send(event);
    }
}
