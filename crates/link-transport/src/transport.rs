use crate::{
    ConnectionStatus, DisconnectReason, LineAssembler, LinkConfig, LinkDriver, LinkEvent, LinkPort,
    PortInfo, PortRecord, PortRegistry, Result, TransportError,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns at most one open link to the sensor and reports everything that
/// happens on it as [`LinkEvent`]s.
///
/// Cheap to clone; all clones drive the same link. `connect`, `disconnect`
/// and fault cleanup are serialised, so at most one port is open at a time
/// and no line from a closed link is delivered after its `Disconnected`.
#[derive(Clone)]
pub struct LinkTransport {
    inner: Arc<Inner>,
}

struct Inner {
    driver: Arc<dyn LinkDriver>,
    registry: Arc<dyn PortRegistry>,
    config: LinkConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
    active: tokio::sync::Mutex<Option<ActiveLink>>,
    status: RwLock<ConnectionStatus>,
    generation: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The reader only holds a weak handle; stop it with the last strong one.
        if let Some(link) = self.active.get_mut().as_ref() {
            link.cancel.store(true, Ordering::Release);
        }
    }
}

struct ActiveLink {
    generation: u64,
    path: String,
    writer: Arc<Mutex<Box<dyn LinkPort>>>,
    cancel: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl LinkTransport {
    pub fn new(
        driver: Arc<dyn LinkDriver>,
        registry: Arc<dyn PortRegistry>,
        config: LinkConfig,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                registry,
                config,
                events,
                active: tokio::sync::Mutex::new(None),
                status: RwLock::new(ConnectionStatus::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn driver_name(&self) -> &str {
        self.inner.driver.name()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.read().connected
    }

    /// Enumerate candidate ports. Never fails; errors are logged and yield
    /// an empty list.
    pub async fn list_available_ports(&self) -> Vec<PortInfo> {
        let driver = Arc::clone(&self.inner.driver);
        let timeout = Duration::from_millis(self.inner.config.connect_timeout_ms);
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || driver.list())).await
        {
            Ok(Ok(Ok(ports))) => ports,
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "port enumeration failed");
                Vec::new()
            }
            Ok(Err(e)) => {
                warn!(error = %e, "port enumeration task failed");
                Vec::new()
            }
            Err(_) => {
                warn!("port enumeration timed out");
                Vec::new()
            }
        }
    }

    /// Open `path`, closing any existing link first. Resolves once the port
    /// is open or the connect timeout elapses.
    pub async fn connect(&self, path: &str, baud_rate: Option<u32>) -> Result<()> {
        let baud_rate = baud_rate.unwrap_or(self.inner.config.baud_rate);
        let mut active = self.inner.active.lock().await;
        if let Some(prev) = active.take() {
            self.inner.close_link(prev, DisconnectReason::Replaced).await;
        }

        let port = match self.inner.open_port(path, baud_rate).await {
            Ok(port) => port,
            Err(e) => {
                warn!(path, error = %e, "connect failed");
                self.inner.emit(LinkEvent::Error(format!("connect {path}: {e}")));
                return Err(e);
            }
        };
        let reader_port = match port.try_clone() {
            Ok(p) => p,
            Err(e) => {
                self.inner.emit(LinkEvent::Error(format!("connect {path}: {e}")));
                return Err(e);
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let record = PortRecord::now(path, baud_rate, self.inner.driver.name());
        if let Err(e) = self.inner.registry.set_active(&record) {
            warn!(error = %e, "could not record active port");
        }
        *self.inner.status.write() = ConnectionStatus {
            connected: true,
            path: Some(path.to_string()),
            baud_rate: Some(baud_rate),
        };
        info!(path, baud_rate, generation, "link connected");
        // Connected must precede any line read from this port.
        self.inner.emit(LinkEvent::Connected {
            path: path.to_string(),
        });

        let cancel = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(
            Arc::downgrade(&self.inner),
            reader_port,
            Arc::clone(&cancel),
            generation,
            self.inner.config.max_line_bytes,
        );
        *active = Some(ActiveLink {
            generation,
            path: path.to_string(),
            writer: Arc::new(Mutex::new(port)),
            cancel,
            reader,
        });
        Ok(())
    }

    /// Close the current link if any. Idempotent; closing an already closed
    /// link is not an error.
    pub async fn disconnect(&self) -> Result<()> {
        let mut active = self.inner.active.lock().await;
        match active.take() {
            Some(link) => {
                self.inner
                    .close_link(link, DisconnectReason::Requested)
                    .await
            }
            None => debug!("disconnect with no active link"),
        }
        Ok(())
    }

    /// Write one line to the device. A terminator is appended if missing.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let writer = {
            let active = self.inner.active.lock().await;
            match active.as_ref() {
                Some(link) => Arc::clone(&link.writer),
                None => return Err(TransportError::NotConnected),
            }
        };
        let mut bytes = line.as_bytes().to_vec();
        if bytes.last() != Some(&b'\n') {
            bytes.push(b'\n');
        }
        let timeout = Duration::from_millis(self.inner.config.send_timeout_ms);
        let write = tokio::task::spawn_blocking(move || writer.lock().write_all(&bytes));
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => Err(TransportError::Io(e.to_string())),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

impl Inner {
    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("link event receiver dropped");
        }
    }

    async fn open_port(&self, path: &str, baud_rate: u32) -> Result<Box<dyn LinkPort>> {
        let driver = Arc::clone(&self.driver);
        let owned = path.to_string();
        let read_timeout = Duration::from_millis(self.config.read_timeout_ms.max(1));
        let open = tokio::task::spawn_blocking(move || driver.open(&owned, baud_rate, read_timeout));
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        match tokio::time::timeout(timeout, open).await {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => Err(TransportError::Io(e.to_string())),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Stop the reader, release the port, and report the close. The caller
    /// holds the `active` lock.
    async fn close_link(&self, link: ActiveLink, reason: DisconnectReason) {
        link.cancel.store(true, Ordering::Release);
        // The reader notices the flag within one read timeout.
        let grace = Duration::from_millis(self.config.read_timeout_ms.saturating_mul(2) + 500);
        if tokio::time::timeout(grace, link.reader).await.is_err() {
            warn!(path = %link.path, "reader did not stop in time; detaching");
        }
        drop(link.writer);
        if let Err(e) = self.registry.clear_active() {
            warn!(error = %e, "could not clear active port");
        }
        *self.status.write() = ConnectionStatus::default();
        info!(path = %link.path, %reason, generation = link.generation, "link closed");
        self.emit(LinkEvent::Disconnected {
            path: link.path,
            reason,
        });
    }

    /// Tear down the link that produced a read error, unless it has already
    /// been replaced or closed.
    async fn handle_fault(&self, generation: u64, error: TransportError) {
        let mut active = self.active.lock().await;
        let matches = active
            .as_ref()
            .map(|l| l.generation == generation)
            .unwrap_or(false);
        if !matches {
            debug!(generation, "fault from a link that is already gone");
            return;
        }
        if let Some(link) = active.take() {
            warn!(path = %link.path, error = %error, "link fault");
            self.emit(LinkEvent::Error(error.to_string()));
            self.close_link(link, DisconnectReason::Fault(error.to_string()))
                .await;
        }
    }
}

fn spawn_reader(
    inner: Weak<Inner>,
    port: Box<dyn LinkPort>,
    cancel: Arc<AtomicBool>,
    generation: u64,
    max_line_bytes: usize,
) -> JoinHandle<()> {
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
        let events = match inner.upgrade() {
            Some(i) => i.events.clone(),
            None => return,
        };
        if let Some(err) = read_loop(port, &cancel, &events, max_line_bytes) {
            // Cleanup takes the `active` lock, so it cannot run on this thread
            // while a disconnect awaits us under that lock.
            handle.spawn(async move {
                if let Some(inner) = inner.upgrade() {
                    inner.handle_fault(generation, err).await;
                }
            });
        }
    })
}

/// Returns the error that ended the loop, or `None` when cancelled.
fn read_loop(
    mut port: Box<dyn LinkPort>,
    cancel: &AtomicBool,
    events: &mpsc::UnboundedSender<LinkEvent>,
    max_line_bytes: usize,
) -> Option<TransportError> {
    let mut assembler = LineAssembler::new(max_line_bytes);
    let mut buf = [0u8; 512];
    while !cancel.load(Ordering::Acquire) {
        match port.read(&mut buf) {
            Ok(0) | Err(TransportError::Timeout) => continue,
            Ok(n) => {
                for line in assembler.push(&buf[..n]) {
                    if cancel.load(Ordering::Acquire) {
                        return None;
                    }
                    if events.send(LinkEvent::Line(line)).is_err() {
                        return None;
                    }
                }
            }
            Err(e) => {
                if cancel.load(Ordering::Acquire) {
                    return None;
                }
                return Some(e);
            }
        }
    }
    None
}
