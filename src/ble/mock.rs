//! In-memory catalog device for tests.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use crate::ble::transport::{BleLink, BleTransport, CharacteristicDescriptor, ServiceDescriptor};
use crate::ble::uuids::{Endpoint, CATALOG_SERVICE_UUID};
use crate::error::{Error, Result};

/// Fake peripheral exposing the catalog service.
pub(crate) struct FakeLink {
    services: RwLock<Vec<ServiceDescriptor>>,
    catalog: RwLock<Vec<u8>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    fail_writes: AtomicBool,
    connected: AtomicBool,
    reads_started: AtomicUsize,
    read_gate: RwLock<Option<Arc<Notify>>>,
    writes_started: AtomicUsize,
    write_gate: RwLock<Option<Arc<Notify>>>,
    drop_tx: broadcast::Sender<()>,
    /// Subscribed in `connect` so drops before `disconnections` are kept.
    pending_drops: Mutex<Option<broadcast::Receiver<()>>>,
    drop_on_connect: AtomicBool,
}

impl FakeLink {
    /// A device exposing all four endpoints with an empty catalog.
    pub(crate) fn catalog_device() -> Self {
        let characteristics = Endpoint::ALL
            .into_iter()
            .map(|endpoint| CharacteristicDescriptor {
                uuid: endpoint.uuid(),
                readable: endpoint.is_read(),
                writable: !endpoint.is_read(),
            })
            .collect();

        Self::with_services(vec![ServiceDescriptor {
            uuid: CATALOG_SERVICE_UUID,
            characteristics,
        }])
    }

    pub(crate) fn with_services(services: Vec<ServiceDescriptor>) -> Self {
        let (drop_tx, _) = broadcast::channel(4);
        Self {
            services: RwLock::new(services),
            catalog: RwLock::new(b"[]".to_vec()),
            writes: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            reads_started: AtomicUsize::new(0),
            read_gate: RwLock::new(None),
            writes_started: AtomicUsize::new(0),
            write_gate: RwLock::new(None),
            drop_tx,
            pending_drops: Mutex::new(None),
            drop_on_connect: AtomicBool::new(false),
        }
    }

    /// Set the payload returned by catalog reads.
    pub(crate) fn set_catalog(&self, payload: &[u8]) {
        *self.catalog.write() = payload.to_vec();
    }

    /// Remove a characteristic from the exposed services.
    pub(crate) fn remove_endpoint(&self, endpoint: Endpoint) {
        for service in self.services.write().iter_mut() {
            service.characteristics.retain(|c| c.uuid != endpoint.uuid());
        }
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make reads block until the returned gate is notified.
    pub(crate) fn hold_reads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.read_gate.write() = Some(gate.clone());
        gate
    }

    pub(crate) fn reads_started(&self) -> usize {
        self.reads_started.load(Ordering::SeqCst)
    }

    /// Make writes block until the returned gate is notified.
    pub(crate) fn hold_writes(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.write_gate.write() = Some(gate.clone());
        gate
    }

    pub(crate) fn writes_started(&self) -> usize {
        self.writes_started.load(Ordering::SeqCst)
    }

    /// Drop the link right after the next `connect` succeeds, before the
    /// caller asks for the disconnect stream.
    pub(crate) fn drop_during_next_connect(&self) {
        self.drop_on_connect.store(true, Ordering::SeqCst);
    }

    /// Payloads written so far, as text, with their characteristic.
    pub(crate) fn writes(&self) -> Vec<(Uuid, String)> {
        self.writes
            .lock()
            .iter()
            .map(|(uuid, data)| (*uuid, String::from_utf8_lossy(data).into_owned()))
            .collect()
    }

    /// Simulate the peripheral going away.
    pub(crate) fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.drop_tx.send(());
    }
}

#[async_trait]
impl BleLink for FakeLink {
    fn identifier(&self) -> String {
        "fake-catalog-device".to_string()
    }

    async fn connect(&self) -> Result<()> {
        *self.pending_drops.lock() = Some(self.drop_tx.subscribe());
        self.connected.store(true, Ordering::SeqCst);
        if self.drop_on_connect.swap(false, Ordering::SeqCst) {
            self.drop_link();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn services(&self) -> Vec<ServiceDescriptor> {
        self.services.read().clone()
    }

    async fn read(&self, _service: Uuid, _characteristic: Uuid) -> Result<Vec<u8>> {
        self.reads_started.fetch_add(1, Ordering::SeqCst);
        let gate = self.read_gate.read().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.catalog.read().clone())
    }

    async fn write(&self, _service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        self.writes_started.fetch_add(1, Ordering::SeqCst);
        let gate = self.write_gate.read().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Internal("GATT write failed".to_string()));
        }
        self.writes.lock().push((characteristic, data.to_vec()));
        Ok(())
    }

    async fn disconnections(&self) -> Result<BoxStream<'static, ()>> {
        let pending = self.pending_drops.lock().take();
        let rx = pending.unwrap_or_else(|| self.drop_tx.subscribe());
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.ok().map(|()| ((), rx))
        })
        .boxed())
    }
}

/// Transport that always discovers the same [`FakeLink`].
pub(crate) struct FakeTransport {
    link: Arc<FakeLink>,
    failures: Mutex<VecDeque<Error>>,
    attempts: AtomicUsize,
    discovery_gate: RwLock<Option<Arc<Notify>>>,
}

impl FakeTransport {
    pub(crate) fn new(link: Arc<FakeLink>) -> Self {
        Self {
            link,
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            discovery_gate: RwLock::new(None),
        }
    }

    /// Fail the next discovery with `error`.
    pub(crate) fn fail_next(&self, error: Error) {
        self.failures.lock().push_back(error);
    }

    /// Make discovery block until the returned gate is notified.
    pub(crate) fn hold_discovery(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.discovery_gate.write() = Some(gate.clone());
        gate
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn discover(&self, _service: Uuid) -> Result<Arc<dyn BleLink>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let gate = self.discovery_gate.read().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        Ok(self.link.clone())
    }
}
