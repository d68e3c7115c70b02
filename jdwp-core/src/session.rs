// JDWP session
//
// Owns the connection to one target VM: handshake, packet ids, the table of
// commands waiting for a reply, and the routes that carry composite events to
// armed event requests. Background loops (see eventloop.rs) do all reading
// and writing; callers queue packets and wait for replies.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{decode_exact, encode_to_vec, JdwpDecode, JdwpEncode};
use crate::commands::{command_sets, vm_commands};
use crate::config::SessionConfig;
use crate::eventloop::{self, Outbound};
use crate::eventrequest::EventRequest;
use crate::events::EventResponse;
use crate::protocol::*;
use crate::types::IdSizes;
use crate::vm::{Capabilities, ClassInfo, VmVersion};

type ReplyWaiter = oneshot::Sender<JdwpResult<ReplyPacket>>;
pub(crate) type EventRoute = mpsc::UnboundedSender<EventResponse>;

// Upper bound on events held for requests that are still being armed.
const MAX_PARKED_EVENTS: usize = 256;

#[derive(Default)]
pub(crate) struct Tables {
    replies: HashMap<u32, ReplyWaiter>,
    routes: HashMap<i32, EventRoute>,
    // Set commands in flight. While non-zero, events for unknown request
    // ids are parked: the target may report one before its route exists.
    arming: usize,
    parked: Vec<EventResponse>,
}

pub(crate) struct SessionInner {
    outbound: mpsc::UnboundedSender<Outbound>,
    tables: Mutex<Tables>,
    next_id: AtomicU32,
    id_sizes: OnceLock<IdSizes>,
    shutdown: CancellationToken,
    config: SessionConfig,
    pub(crate) version: OnceCell<VmVersion>,
    pub(crate) capabilities: OnceCell<Capabilities>,
    pub(crate) class_cache: ClassCache,
    pub(crate) event_requests: Arc<Mutex<Vec<EventRequest>>>,
}

/// Handle to an attached target VM. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Non-owning handle, held by event requests, delivery loops and events.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    pub fn upgrade(&self) -> JdwpResult<Session> {
        self.inner
            .upgrade()
            .map(|inner| Session { inner })
            .ok_or(JdwpError::ConnectionClosed)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id_sizes", &self.id_sizes())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Debug for WeakSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSession")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Session {
    /// Connect to a JVM via JDWP
    pub async fn connect(host: &str, port: u16) -> JdwpResult<Self> {
        Self::connect_with_config(host, port, SessionConfig::default()).await
    }

    pub async fn connect_with_config(
        host: &str,
        port: u16,
        config: SessionConfig,
    ) -> JdwpResult<Self> {
        info!("Connecting to JDWP at {}:{}", host, port);

        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Self::open(stream, config).await
    }

    /// Attach over an already-connected stream.
    ///
    /// Performs the handshake, starts the receive loop and negotiates id sizes
    /// before returning, so IDSizes is always the first command on the wire.
    pub async fn open<S>(mut stream: S, config: SessionConfig) -> JdwpResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tokio::time::timeout(config.handshake_timeout, handshake(&mut stream))
            .await
            .map_err(|_| JdwpError::Timeout(config.handshake_timeout))??;

        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let max_packet_size = config.max_packet_size;

        let inner = Arc::new(SessionInner {
            outbound,
            tables: Mutex::new(Tables::default()),
            next_id: AtomicU32::new(1),
            id_sizes: OnceLock::new(),
            shutdown: shutdown.clone(),
            config,
            version: OnceCell::new(),
            capabilities: OnceCell::new(),
            class_cache: ClassCache::default(),
            event_requests: Arc::default(),
        });

        tokio::spawn(eventloop::write_loop(writer, outbound_rx, shutdown.clone()));
        tokio::spawn(eventloop::receive_loop(
            reader,
            Arc::downgrade(&inner),
            shutdown,
            max_packet_size,
        ));

        let session = Session { inner };
        let sizes: IdSizes = match session
            .send_command(command_sets::VIRTUAL_MACHINE, vm_commands::ID_SIZES, &())
            .await
        {
            Ok(sizes) => sizes,
            Err(e) => {
                error!("Failed to negotiate id sizes: {}", e);
                session.shutdown();
                return Err(e);
            }
        };
        // Only this call site ever sets the sizes.
        let _ = session.inner.id_sizes.set(sizes);
        info!("Attached to target, id sizes: {:?}", sizes);

        Ok(session)
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Negotiated id sizes; 8 bytes for every category until IDSizes has been answered.
    pub fn id_sizes(&self) -> IdSizes {
        self.inner.id_sizes.get().copied().unwrap_or_default()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Close the session. Pending commands and delivery loops end with `Cancelled`.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled when the session ends, either explicitly via
    /// [`Session::shutdown`] or because the target closed the connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Send a command and decode its reply. The reply must be consumed exactly.
    pub async fn send_command<Req, Resp>(
        &self,
        command_set: u8,
        command: u8,
        request: &Req,
    ) -> JdwpResult<Resp>
    where
        Req: JdwpEncode + ?Sized,
        Resp: JdwpDecode,
    {
        let sizes = self.id_sizes();
        let data = encode_to_vec(request, sizes)?;
        let reply = self.send_command_raw(command_set, command, data).await?;
        decode_exact(reply.data(), sizes)
    }

    /// Send a command whose reply body is ignored.
    pub async fn exec<Req>(&self, command_set: u8, command: u8, request: &Req) -> JdwpResult<()>
    where
        Req: JdwpEncode + ?Sized,
    {
        let data = encode_to_vec(request, self.id_sizes())?;
        self.send_command_raw(command_set, command, data).await?;
        Ok(())
    }

    /// Send a pre-encoded command and wait for the reply.
    pub async fn send_command_raw(
        &self,
        command_set: u8,
        command: u8,
        data: Vec<u8>,
    ) -> JdwpResult<ReplyPacket> {
        if self.is_closed() {
            return Err(JdwpError::Cancelled);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.lock_tables().replies.insert(id, tx);

        let packet = CommandPacket::new(id, command_set, command).with_data(data);
        debug!(
            "Sending command id={} ({}, {}) len={}",
            id,
            command_set,
            command,
            packet.data.len()
        );

        if let Err(e) = self.inner.queue_packet(packet.encode()).await {
            debug!("Command id={} was not written: {}", id, e);
            self.inner.remove_waiter(id);
            return Err(e);
        }

        let budget = self.inner.config.reply_timeout;
        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.inner.remove_waiter(id);
                return Err(JdwpError::Cancelled);
            }
            res = tokio::time::timeout(budget, rx) => match res {
                Ok(Ok(reply)) => reply?,
                Ok(Err(_closed)) => return Err(JdwpError::ConnectionClosed),
                Err(_elapsed) => {
                    self.inner.remove_waiter(id);
                    warn!("Command id={} ({}, {}) timed out after {:?}", id, command_set, command, budget);
                    return Err(JdwpError::Timeout(budget));
                }
            }
        };

        debug!("Received reply id={} error_code={}", id, reply.error_code);
        reply.check_error()?;
        Ok(reply)
    }

    /// Mark an EventRequest.Set as in flight until the guard is dropped.
    pub(crate) fn begin_arming(&self) -> ArmingGuard<'_> {
        self.inner.lock_tables().arming += 1;
        ArmingGuard { inner: &self.inner }
    }

    /// Route events for `request_id`, first handing over any that arrived
    /// while the request was being armed.
    pub(crate) fn register_route(&self, request_id: i32, route: EventRoute) {
        let mut tables = self.inner.lock_tables();
        let (early, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut tables.parked)
            .into_iter()
            .partition(|event| event.request_id() == request_id);
        tables.parked = rest;
        if !early.is_empty() {
            debug!("Delivering {} early events for request id={}", early.len(), request_id);
        }
        for event in early {
            let _ = route.send(event);
        }
        tables.routes.insert(request_id, route);
    }

    pub(crate) fn unregister_route(&self, request_id: i32) -> bool {
        self.inner.lock_tables().routes.remove(&request_id).is_some()
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.inner.lock_tables().replies.len()
    }

    #[cfg(test)]
    pub(crate) fn route_count(&self) -> usize {
        self.inner.lock_tables().routes.len()
    }

    #[cfg(test)]
    pub(crate) fn parked_count(&self) -> usize {
        self.inner.lock_tables().parked.len()
    }

    pub(crate) fn inner(&self) -> &SessionInner {
        &self.inner
    }

    /// Freeze the class cache until the returned guard is dropped.
    ///
    /// While at least one guard is alive, the class list is fetched from the
    /// target at most once and then served from memory.
    pub fn freeze(&self) -> FreezeGuard {
        self.inner.class_cache.freeze();
        FreezeGuard {
            session: self.downgrade(),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.class_cache.is_frozen()
    }
}

impl SessionInner {
    // Recovers from poisoning; the tables hold no invariants a panic could break.
    pub(crate) fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(err) => {
                error!("session table mutex poisoned; continuing with recovered guard");
                err.into_inner()
            }
        }
    }

    // Hand a packet to the write loop and wait until it is on the wire.
    // Dropping the returned future does not abandon a half-written packet.
    async fn queue_packet(&self, bytes: Vec<u8>) -> JdwpResult<()> {
        let (written, done) = oneshot::channel();
        self.outbound
            .send(Outbound { bytes, written })
            .map_err(|_| JdwpError::Cancelled)?;
        done.await.unwrap_or(Err(JdwpError::Cancelled))
    }

    fn remove_waiter(&self, id: u32) {
        self.lock_tables().replies.remove(&id);
    }

    pub(crate) fn id_sizes(&self) -> IdSizes {
        self.id_sizes.get().copied().unwrap_or_default()
    }

    /// Hand a reply to its waiter. Returns false if nobody is waiting for it.
    pub(crate) fn complete_reply(&self, reply: ReplyPacket) -> bool {
        let waiter = self.lock_tables().replies.remove(&reply.id);
        match waiter {
            Some(tx) => {
                // The waiter may have just timed out; that's fine.
                let _ = tx.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Queue an event on the route of the request that produced it.
    pub(crate) fn route_event(&self, event: EventResponse) -> JdwpResult<()> {
        let request_id = event.request_id();
        let mut tables = self.lock_tables();
        match tables.routes.get(&request_id) {
            Some(route) => {
                if route.send(event).is_err() {
                    // Delivery loop is gone; drop its stale route.
                    tables.routes.remove(&request_id);
                    return Err(JdwpError::UnknownSubscription(request_id));
                }
                Ok(())
            }
            None if request_id != 0
                && tables.arming > 0
                && tables.parked.len() < MAX_PARKED_EVENTS =>
            {
                tables.parked.push(event);
                Ok(())
            }
            None => Err(JdwpError::UnknownSubscription(request_id)),
        }
    }

    /// Fail every waiter and drop every route. Called once the receive loop ends.
    pub(crate) fn close_tables(&self) {
        let (replies, routes) = {
            let mut tables = self.lock_tables();
            tables.parked.clear();
            (
                std::mem::take(&mut tables.replies),
                std::mem::take(&mut tables.routes),
            )
        };
        if !replies.is_empty() {
            debug!("Cancelling {} pending commands", replies.len());
        }
        for (_, tx) in replies {
            let _ = tx.send(Err(JdwpError::Cancelled));
        }
        drop(routes);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Ends an arming window opened by [`Session::begin_arming`]. Events still
/// parked when the last window closes belong to no request and are dropped.
pub(crate) struct ArmingGuard<'a> {
    inner: &'a SessionInner,
}

impl Drop for ArmingGuard<'_> {
    fn drop(&mut self) {
        let mut tables = self.inner.lock_tables();
        tables.arming = tables.arming.saturating_sub(1);
        if tables.arming == 0 && !tables.parked.is_empty() {
            debug!("Dropping {} unrouted events", tables.parked.len());
            tables.parked.clear();
        }
    }
}

/// Perform JDWP handshake
async fn handshake<S>(stream: &mut S) -> JdwpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Performing JDWP handshake");

    stream.write_all(JDWP_HANDSHAKE).await?;
    stream.flush().await?;

    let mut buf = vec![0u8; JDWP_HANDSHAKE.len()];
    stream.read_exact(&mut buf).await?;

    if buf != JDWP_HANDSHAKE {
        warn!("Invalid handshake response: {:?}", String::from_utf8_lossy(&buf));
        return Err(JdwpError::InvalidHandshake);
    }

    info!("JDWP handshake successful");
    Ok(())
}

/// Class list snapshot, held only while some delivery loop has the target frozen.
#[derive(Default)]
pub(crate) struct ClassCache {
    state: Mutex<ClassCacheState>,
}

#[derive(Default)]
struct ClassCacheState {
    freezes: usize,
    classes: Option<Arc<Vec<ClassInfo>>>,
}

impl ClassCache {
    fn lock(&self) -> MutexGuard<'_, ClassCacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }

    fn freeze(&self) {
        self.lock().freezes += 1;
    }

    fn unfreeze(&self) {
        let mut state = self.lock();
        state.freezes = state.freezes.saturating_sub(1);
        if state.freezes == 0 {
            state.classes = None;
        }
    }

    fn is_frozen(&self) -> bool {
        self.lock().freezes > 0
    }

    pub(crate) fn cached(&self) -> Option<Arc<Vec<ClassInfo>>> {
        let state = self.lock();
        if state.freezes > 0 {
            state.classes.clone()
        } else {
            None
        }
    }

    /// Keep a freshly fetched list if the cache is still frozen.
    pub(crate) fn store(&self, classes: Arc<Vec<ClassInfo>>) {
        let mut state = self.lock();
        if state.freezes > 0 {
            state.classes = Some(classes);
        }
    }
}

/// Unfreezes the class cache when dropped.
#[must_use = "the class cache unfreezes as soon as the guard is dropped"]
pub struct FreezeGuard {
    session: WeakSession,
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.session.inner.upgrade() {
            inner.class_cache.unfreeze();
        }
    }
}
