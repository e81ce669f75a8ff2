//! Outbound connection manager.
//!
//! Keeps the outbound peer population at the configured target, retries
//! persistent peers with a growing backoff, and accepts inbound connections
//! on behalf of the caller. A single dispatch task owns the `pending` and
//! `conns` maps; every state transition flows through its request channel.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Successive failed attempts after which network failure is assumed and new
/// connection attempts are delayed by the retry duration.
const MAX_FAILED_ATTEMPTS: u64 = 3;

/// Ceiling for the persistent-peer backoff.
const MAX_RETRY_DURATION: Duration = Duration::from_secs(60 * 60);

const DEFAULT_RETRY_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_TARGET_OUTBOUND: u32 = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnState {
    Pending,
    Failing,
    Canceled,
    Established,
    Disconnected,
}

/// One requested outbound connection. The manager owns the set; callers keep
/// only the id (or this shared handle) to disconnect or remove it later.
pub struct ConnReq {
    id: AtomicU64,
    addr: Mutex<Option<SocketAddr>>,
    pub permanent: bool,
    state: Mutex<ConnState>,
    retry_count: AtomicU32,
}

impl ConnReq {
    pub fn new(addr: Option<SocketAddr>, permanent: bool) -> Self {
        Self {
            id: AtomicU64::new(0),
            addr: Mutex::new(addr),
            permanent,
            state: Mutex::new(ConnState::Pending),
            retry_count: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr.lock().ok().and_then(|guard| *guard)
    }

    pub fn set_addr(&self, addr: SocketAddr) {
        if let Ok(mut guard) = self.addr.lock() {
            *guard = Some(addr);
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(ConnState::Failing)
    }

    fn update_state(&self, state: ConnState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }
}

impl std::fmt::Display for ConnReq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.addr() {
            Some(addr) => write!(f, "{addr} (reqid {})", self.id()),
            None => write!(f, "reqid {}", self.id()),
        }
    }
}

/// How outbound sockets are opened. Injected so the retry machinery can be
/// exercised without a network.
pub trait Dialer: Send + Sync + 'static {
    type Conn: Send + 'static;

    fn dial(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = Result<Self::Conn, String>> + Send;
}

pub struct TcpDialer {
    pub timeout: Duration,
}

impl Dialer for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, addr: SocketAddr) -> Result<TcpStream, String> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("dial {addr} timed out")),
        }
    }
}

pub type OnAccept = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;
pub type OnConnection<C> = Arc<dyn Fn(Arc<ConnReq>, C) + Send + Sync>;
pub type OnDisconnection = Arc<dyn Fn(Arc<ConnReq>) + Send + Sync>;
pub type GetNewAddress = Arc<dyn Fn() -> Result<SocketAddr, String> + Send + Sync>;

pub struct ConnManagerConfig<D: Dialer> {
    /// Listeners the manager takes ownership of. Ignored without `on_accept`.
    pub listeners: Vec<TcpListener>,
    pub on_accept: Option<OnAccept>,
    /// Outbound connections to maintain. Zero selects the default of 8.
    pub target_outbound: u32,
    /// Base delay between retries. Zero selects the default of 5 seconds.
    pub retry_duration: Duration,
    pub on_connection: Option<OnConnection<D::Conn>>,
    pub on_disconnection: Option<OnDisconnection>,
    /// Source of fresh outbound addresses. Without it no connections are
    /// created automatically.
    pub get_new_address: Option<GetNewAddress>,
    pub dialer: D,
}

enum ConnRequest<C> {
    RegisterPending(Arc<ConnReq>, oneshot::Sender<()>),
    Connected(Arc<ConnReq>, C),
    Disconnected { id: u64, retry: bool },
    Failed(Arc<ConnReq>, String),
}

struct Inner<D: Dialer> {
    on_accept: Option<OnAccept>,
    target_outbound: u32,
    retry_duration: Duration,
    on_connection: Option<OnConnection<D::Conn>>,
    on_disconnection: Option<OnDisconnection>,
    get_new_address: Option<GetNewAddress>,
    dialer: D,
    listen_addrs: Vec<SocketAddr>,
    listeners: Mutex<Vec<TcpListener>>,
    conn_req_count: AtomicU64,
    started: AtomicBool,
    stopped: AtomicBool,
    req_tx: mpsc::UnboundedSender<ConnRequest<D::Conn>>,
    req_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnRequest<D::Conn>>>>,
    quit_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

pub struct ConnManager<D: Dialer> {
    inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for ConnManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dialer> ConnManager<D> {
    pub fn new(config: ConnManagerConfig<D>) -> Self {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (quit_tx, _) = watch::channel(false);
        let listen_addrs = config
            .listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect();
        let target_outbound = if config.target_outbound == 0 {
            DEFAULT_TARGET_OUTBOUND
        } else {
            config.target_outbound
        };
        let retry_duration = if config.retry_duration.is_zero() {
            DEFAULT_RETRY_DURATION
        } else {
            config.retry_duration
        };
        Self {
            inner: Arc::new(Inner {
                on_accept: config.on_accept,
                target_outbound,
                retry_duration,
                on_connection: config.on_connection,
                on_disconnection: config.on_disconnection,
                get_new_address: config.get_new_address,
                dialer: config.dialer,
                listen_addrs,
                listeners: Mutex::new(config.listeners),
                conn_req_count: AtomicU64::new(0),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                req_tx,
                req_rx: Mutex::new(Some(req_rx)),
                quit_tx,
                handle: Mutex::new(None),
            }),
        }
    }

    /// Launch the dispatch task, the listeners, and the initial outbound
    /// attempts. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let rx = self
            .inner
            .req_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(rx) = rx {
            let inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(conn_handler(inner, rx));
            if let Ok(mut guard) = self.inner.handle.lock() {
                *guard = Some(handle);
            }
        }
        if self.inner.on_accept.is_some() {
            let listeners = self
                .inner
                .listeners
                .lock()
                .map(|mut guard| guard.drain(..).collect::<Vec<_>>())
                .unwrap_or_default();
            for listener in listeners {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(listen_handler(inner, listener));
            }
        }
        let count = self.inner.conn_req_count.load(Ordering::SeqCst);
        for _ in count..u64::from(self.inner.target_outbound) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                Inner::new_conn_req(&inner).await;
            });
        }
    }

    /// Close the listeners and quit the dispatch loop. In-flight dial results
    /// are dropped. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            debug!("connection manager already stopped");
            return;
        }
        self.inner.quit_tx.send_replace(true);
    }

    /// Block until the dispatch loop has exited.
    pub async fn wait(&self) {
        let handle = self
            .inner
            .handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Register (when new) and dial an outbound connection request.
    pub fn connect(&self, req: Arc<ConnReq>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Inner::connect(&inner, req).await;
        });
    }

    /// Tear down an established connection; it is re-queued for retry when
    /// persistent or when the outbound quota is unmet.
    pub fn disconnect(&self, id: u64) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let _ = self
            .inner
            .req_tx
            .send(ConnRequest::Disconnected { id, retry: true });
    }

    /// Terminal removal; also cancels a pending dial that has not finished.
    pub fn remove(&self, id: u64) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let _ = self
            .inner
            .req_tx
            .send(ConnRequest::Disconnected { id, retry: false });
    }

    /// Ask the address source for a target and dial it.
    pub fn new_conn_req(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Inner::new_conn_req(&inner).await;
        });
    }
}

impl<D: Dialer> Inner<D> {
    async fn register(self: &Arc<Self>, req: &Arc<ConnReq>) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .req_tx
            .send(ConnRequest::RegisterPending(Arc::clone(req), done_tx))
            .is_err()
        {
            return false;
        }
        let mut quit_rx = self.quit_tx.subscribe();
        tokio::select! {
            result = done_rx => result.is_ok(),
            _ = quit_rx.changed() => false,
        }
    }

    async fn connect(self: &Arc<Self>, req: Arc<ConnReq>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Some(addr) = req.addr() else {
            return;
        };
        if self.listen_addrs.contains(&addr) {
            debug!(%addr, "not making outbound connection to our own listener address");
            return;
        }
        if req.id() == 0 {
            req.set_id(self.conn_req_count.fetch_add(1, Ordering::SeqCst) + 1);
            if !self.register(&req).await {
                return;
            }
        }
        let result = self.dialer.dial(addr).await;
        if self.stopped.load(Ordering::SeqCst) {
            // Shutting down; whatever the dial produced is dropped.
            return;
        }
        let request = match result {
            Ok(conn) => ConnRequest::Connected(req, conn),
            Err(err) => {
                trace!(%err, "dial failed");
                ConnRequest::Failed(req, err)
            }
        };
        let _ = self.req_tx.send(request);
    }

    async fn new_conn_req(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Some(source) = self.get_new_address.clone() else {
            return;
        };
        let req = Arc::new(ConnReq::new(None, false));
        // Register before dialing so the attempt can be canceled via Remove.
        req.set_id(self.conn_req_count.fetch_add(1, Ordering::SeqCst) + 1);
        if !self.register(&req).await {
            return;
        }
        match source() {
            Err(err) => {
                let _ = self.req_tx.send(ConnRequest::Failed(req, err));
            }
            Ok(addr) => {
                req.set_addr(addr);
                Inner::connect(self, req).await;
            }
        }
    }

    fn handle_failed_conn(self: &Arc<Self>, req: Arc<ConnReq>, failed_attempts: &mut u64) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if req.permanent {
            let count = req.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = self
                .retry_duration
                .saturating_mul(count)
                .min(MAX_RETRY_DURATION);
            trace!(req = %req, ?delay, "retrying persistent connection");
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                Inner::connect(&inner, req).await;
            });
        } else if self.get_new_address.is_some() {
            *failed_attempts += 1;
            if *failed_attempts >= MAX_FAILED_ATTEMPTS {
                trace!(
                    attempts = *failed_attempts,
                    delay = ?self.retry_duration,
                    "max failed connection attempts reached, delaying next attempt"
                );
                let inner = Arc::clone(self);
                let delay = self.retry_duration;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    Inner::new_conn_req(&inner).await;
                });
            } else {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    Inner::new_conn_req(&inner).await;
                });
            }
        }
    }
}

async fn conn_handler<D: Dialer>(
    inner: Arc<Inner<D>>,
    mut rx: mpsc::UnboundedReceiver<ConnRequest<D::Conn>>,
) {
    let mut pending: HashMap<u64, Arc<ConnReq>> = HashMap::new();
    let mut conns: HashMap<u64, Arc<ConnReq>> =
        HashMap::with_capacity(inner.target_outbound as usize);
    let mut failed_attempts: u64 = 0;
    let mut quit_rx = inner.quit_tx.subscribe();
    loop {
        let request = tokio::select! {
            _ = quit_rx.changed() => break,
            maybe = rx.recv() => match maybe {
                Some(request) => request,
                None => break,
            },
        };
        match request {
            ConnRequest::RegisterPending(req, done) => {
                req.update_state(ConnState::Pending);
                pending.insert(req.id(), req);
                let _ = done.send(());
            }
            ConnRequest::Connected(req, conn) => {
                if !pending.contains_key(&req.id()) {
                    // Canceled mid-dial; the fresh socket is closed on drop.
                    debug!(req = %req, "ignoring connection for canceled request");
                    drop(conn);
                    continue;
                }
                req.update_state(ConnState::Established);
                req.retry_count.store(0, Ordering::SeqCst);
                failed_attempts = 0;
                pending.remove(&req.id());
                conns.insert(req.id(), Arc::clone(&req));
                trace!(req = %req, "connected");
                if let Some(on_connection) = &inner.on_connection {
                    on_connection(req, conn);
                }
            }
            ConnRequest::Disconnected { id, retry } => {
                let Some(req) = conns.remove(&id) else {
                    match pending.remove(&id) {
                        Some(req) => {
                            req.update_state(ConnState::Canceled);
                            debug!(req = %req, "canceling pending connection");
                        }
                        None => error!(id, "unknown connection id"),
                    }
                    continue;
                };
                trace!(req = %req, "disconnected");
                if let Some(on_disconnection) = &inner.on_disconnection {
                    on_disconnection(Arc::clone(&req));
                }
                if !retry {
                    req.update_state(ConnState::Disconnected);
                    continue;
                }
                if (conns.len() as u32) < inner.target_outbound || req.permanent {
                    req.update_state(ConnState::Pending);
                    pending.insert(id, Arc::clone(&req));
                    inner.handle_failed_conn(req, &mut failed_attempts);
                } else {
                    req.update_state(ConnState::Disconnected);
                }
            }
            ConnRequest::Failed(req, err) => {
                if !pending.contains_key(&req.id()) {
                    debug!(req = %req, "ignoring failure for canceled request");
                    continue;
                }
                req.update_state(ConnState::Failing);
                trace!(req = %req, %err, "connection failed");
                inner.handle_failed_conn(req, &mut failed_attempts);
            }
        }
    }
}

async fn listen_handler<D: Dialer>(inner: Arc<Inner<D>>, listener: TcpListener) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "node listening"),
        Err(_) => info!("node listening"),
    }
    let mut quit_rx = inner.quit_tx.subscribe();
    loop {
        tokio::select! {
            _ = quit_rx.changed() => break,
            result = listener.accept() => match result {
                Ok((conn, addr)) => {
                    if let Some(on_accept) = &inner.on_accept {
                        on_accept(conn, addr);
                    }
                }
                Err(err) => {
                    if !inner.stopped.load(Ordering::SeqCst) {
                        warn!(%err, "cannot accept connection");
                    }
                }
            },
        }
    }
    trace!("listener handler done");
}
