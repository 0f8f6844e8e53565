//! Paired command proxies.
//!
//! One proxy lives at the requestor and one at the processor of every
//! in-flight bus command. The pair is linked by a dedicated endpoint
//! pair (one port each, reserved for the proxy's full lifetime) and
//! exchanges RPC piggyback messages through the `bus_command_proxy`
//! envelope, where the real command rides as the last argument.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use commons::{Properties, StoppableTask};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

use crate::error::BusError;
use crate::port_pool::PortGuard;
use crate::proxy_commands;
use crate::transport::{MessageHandler, StarNode};
use crate::Result;

/// Transport-facing contract every concrete proxy implements.
///
/// Concrete proxies embed a [`ProxyCore`] (abort/finished/error state,
/// parameter bag, endpoint) and add their own piggyback commands on top.
pub trait CommandProxy: Send + Sync {
    fn core(&self) -> &ProxyCore;

    /// Downcast seam for processors recovering their concrete proxy
    /// type from the factory result.
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync>;

    /// Handles one inbound piggyback command. Returns `Ok(true)` when the
    /// command was recognised at this level or below; `Ok(false)` makes
    /// the endpoint raise a hard error on the peer.
    fn from_remote_peer(&self, command: &str, args: Vec<String>) -> Result<bool>;

    /// Appends this proxy's serialisable fields to a token stream.
    fn tokenize(&self, out: &mut Vec<String>);

    /// Rebuilds this proxy's fields from the front of a token stream.
    fn untokenize(&self, tokens: &mut Vec<String>) -> Result<()>;
}

#[derive(Default)]
struct CoreFlags {
    abort: bool,
    finished: bool,
    error: Option<(u32, String)>,
}

/// State shared by every proxy variant: identity, parameter bag,
/// abort/finished/error flags and the dedicated endpoint.
///
/// Fields are touched from both the transport receive task and the
/// owner's task; everything mutable sits behind the per-proxy mutexes.
pub struct ProxyCore {
    command: Mutex<String>,
    args: Mutex<Vec<String>>,
    serial: AtomicU32,
    requestor_id: Mutex<String>,
    parameters: Mutex<Properties>,
    flags: Mutex<CoreFlags>,
    endpoint: OnceLock<Arc<ProxyEndpoint>>,
}

impl ProxyCore {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: Mutex::new(command.into()),
            args: Mutex::new(Vec::new()),
            serial: AtomicU32::new(0),
            requestor_id: Mutex::new(String::new()),
            parameters: Mutex::new(Properties::new()),
            flags: Mutex::new(CoreFlags::default()),
            endpoint: OnceLock::new(),
        }
    }

    pub fn command(&self) -> String {
        self.command.lock().clone()
    }

    pub fn set_command(&self, command: impl Into<String>) {
        *self.command.lock() = command.into();
    }

    pub fn args(&self) -> Vec<String> {
        self.args.lock().clone()
    }

    pub fn set_args(&self, args: Vec<String>) {
        *self.args.lock() = args;
    }

    /// Moves the pending command-line tokens out, for `untokenize`.
    pub fn take_args(&self) -> Vec<String> {
        std::mem::take(&mut *self.args.lock())
    }

    pub fn serial(&self) -> u32 {
        self.serial.load(Ordering::SeqCst)
    }

    pub fn set_serial(&self, serial: u32) {
        self.serial.store(serial, Ordering::SeqCst);
    }

    pub fn requestor_id(&self) -> String {
        self.requestor_id.lock().clone()
    }

    pub fn set_requestor_id(&self, id: impl Into<String>) {
        *self.requestor_id.lock() = id.into();
    }

    /// Locked view of the parameter bag.
    pub fn parameters(&self) -> MutexGuard<'_, Properties> {
        self.parameters.lock()
    }

    pub fn attach_endpoint(&self, endpoint: Arc<ProxyEndpoint>) -> Result<()> {
        self.endpoint
            .set(endpoint)
            .map_err(|_| BusError::Lifecycle("proxy endpoint attached twice".to_string()))
    }

    pub fn endpoint(&self) -> Option<&Arc<ProxyEndpoint>> {
        self.endpoint.get()
    }

    /// Id of this proxy's endpoint, empty before issue.
    pub fn my_id(&self) -> String {
        self.endpoint
            .get()
            .map(|endpoint| endpoint.id().to_string())
            .unwrap_or_default()
    }

    /// Id of the paired proxy's endpoint, empty until the pair is linked.
    pub fn peer_id(&self) -> String {
        self.endpoint
            .get()
            .and_then(|endpoint| endpoint.peer_id())
            .unwrap_or_default()
    }

    /// True once the command finished, aborted or errored.
    pub fn finished(&self) -> bool {
        let flags = self.flags.lock();
        flags.abort || flags.finished || flags.error.is_some()
    }

    pub fn is_aborting(&self) -> bool {
        self.flags.lock().abort
    }

    /// Error raised by the peer, if any.
    pub fn error(&self) -> Option<(u32, String)> {
        self.flags.lock().error.clone()
    }

    /// Requests cancellation. Idempotent: the local flag flips
    /// immediately and `ABORT` is sent to the peer once.
    pub fn abort(&self) {
        let should_send = {
            let mut flags = self.flags.lock();
            if flags.abort {
                false
            } else {
                flags.abort = true;
                !flags.finished
            }
        };
        if should_send {
            if let Err(error) = self.send_to_peer(proxy_commands::ABORT, Vec::new()) {
                tracing::debug!(%error, "abort could not reach the peer");
            }
        }
    }

    /// Flips the local abort flag without telling the peer. Used when a
    /// processor cuts its own work short (answer budget reached) but the
    /// normal `FINISHED` handshake still follows.
    pub fn abort_local(&self) {
        self.flags.lock().abort = true;
    }

    /// Marks the command finished unless an abort is already in flight.
    pub fn command_finished(&self) {
        let mut flags = self.flags.lock();
        if !flags.abort {
            flags.finished = true;
        }
    }

    /// Records a peer error and surfaces it through `finished()`.
    pub fn raise_error(&self, message: impl Into<String>, code: u32) {
        let message = message.into();
        tracing::error!(code, %message, command = %self.command(), "proxy error raised");
        let mut flags = self.flags.lock();
        flags.error = Some((code, message));
        flags.finished = true;
    }

    /// Raises an error on the remote peer and mirrors it locally so the
    /// owning worker stops producing.
    pub fn raise_error_on_peer(&self, message: impl Into<String>, code: u32) {
        let message = message.into();
        if let Err(error) = self.send_to_peer(
            proxy_commands::PEER_ERROR,
            vec![code.to_string(), message.clone()],
        ) {
            tracing::warn!(%error, "peer error could not be delivered");
        }
        self.raise_error(message, code);
    }

    /// Enqueues an RPC for the paired proxy. Per-proxy sends are FIFO.
    pub fn send_to_peer(&self, command: &str, args: Vec<String>) -> Result<()> {
        let endpoint = self.endpoint.get().ok_or_else(|| {
            BusError::Lifecycle(format!(
                "proxy for '{}' has no endpoint attached",
                self.command()
            ))
        })?;
        endpoint.send_to_peer(command, args)
    }

    /// Handles the piggyback commands every proxy understands: `ABORT`,
    /// `FINISHED` and `PEER_ERROR`.
    pub fn handle_base_command(&self, command: &str, args: &[String]) -> Result<bool> {
        match command {
            proxy_commands::ABORT => {
                let echo = {
                    let mut flags = self.flags.lock();
                    let first = !flags.abort;
                    flags.abort = true;
                    first && !flags.finished
                };
                if echo {
                    // Round-trip so the peer also stops producing.
                    if let Err(error) = self.send_to_peer(proxy_commands::ABORT, Vec::new()) {
                        tracing::debug!(%error, "abort echo failed");
                    }
                }
                Ok(true)
            }
            proxy_commands::FINISHED => {
                self.command_finished();
                Ok(true)
            }
            proxy_commands::PEER_ERROR => {
                let code: u32 = args
                    .first()
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or_default();
                let message = args.get(1).cloned().unwrap_or_default();
                self.raise_error(message, code);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Base layer of the token stream: the parameter bag.
    pub fn tokenize_base(&self, out: &mut Vec<String>) {
        self.parameters.lock().to_tokens(out);
    }

    /// Consumes the base layer from the front of the token stream.
    pub fn untokenize_base(&self, stream: &mut Vec<String>) -> Result<()> {
        let decoded = Properties::from_tokens(stream)?;
        *self.parameters.lock() = decoded;
        Ok(())
    }
}

impl Drop for ProxyCore {
    fn drop(&mut self) {
        if self.endpoint.get().is_some() && !self.finished() {
            // Callers must abort before letting a running proxy go.
            tracing::error!(
                command = %self.command(),
                serial = self.serial(),
                "proxy dropped while still running; abort() it first"
            );
        }
        if let Some(endpoint) = self.endpoint.get() {
            endpoint.begin_shutdown();
        }
    }
}

impl std::fmt::Debug for ProxyCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCore")
            .field("command", &self.command())
            .field("serial", &self.serial())
            .field("finished", &self.finished())
            .field("aborting", &self.is_aborting())
            .finish()
    }
}

/// One side of the dedicated endpoint pair a proxy owns.
///
/// Wraps a [`StarNode`] bound to the reserved port. Outbound RPCs are
/// enqueued synchronously and shipped by a single pump task once the
/// peer is known, which preserves emission order and absorbs the window
/// between issue and the peer's join announcement.
pub struct ProxyEndpoint {
    node: Arc<StarNode>,
    _port: PortGuard,
    peer_rx: watch::Receiver<Option<String>>,
    peer_tx: watch::Sender<Option<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<(String, Vec<String>)>>>,
    pump: Mutex<Option<Arc<StoppableTask>>>,
    proxy: OnceLock<Weak<dyn CommandProxy>>,
    self_ref: OnceLock<Weak<ProxyEndpoint>>,
}

impl ProxyEndpoint {
    /// Requestor side: listens on `host:port` and learns its peer from
    /// the processor's join announcement.
    pub async fn listen(
        host: &str,
        port: PortGuard,
        proxy: &Arc<dyn CommandProxy>,
    ) -> Result<Arc<Self>> {
        Self::start(host, port, None, proxy).await
    }

    /// Processor side: dials the requestor-side endpoint.
    pub async fn connect(
        host: &str,
        port: PortGuard,
        server_id: &str,
        proxy: &Arc<dyn CommandProxy>,
    ) -> Result<Arc<Self>> {
        Self::start(host, port, Some(server_id.to_string()), proxy).await
    }

    async fn start(
        host: &str,
        port: PortGuard,
        peer: Option<String>,
        proxy: &Arc<dyn CommandProxy>,
    ) -> Result<Arc<Self>> {
        let id = format!("{}:{}", host, port.port());
        let node = StarNode::new(id, peer.clone());
        let (peer_tx, peer_rx) = watch::channel(peer);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let endpoint = Arc::new(Self {
            node: node.clone(),
            _port: port,
            peer_rx,
            peer_tx,
            outbound: Mutex::new(Some(outbound_tx)),
            pump: Mutex::new(None),
            proxy: OnceLock::new(),
            self_ref: OnceLock::new(),
        });
        let _ = endpoint.self_ref.set(Arc::downgrade(&endpoint));
        // The dispatch back-reference is weak and bound before the
        // transport starts, so no inbound RPC can beat it.
        let _ = endpoint.proxy.set(Arc::downgrade(proxy));

        let pump = endpoint.spawn_pump(outbound_rx);
        *endpoint.pump.lock() = Some(pump);

        node.start(&(endpoint.clone() as Arc<dyn MessageHandler>))
            .await?;
        Ok(endpoint)
    }

    pub fn id(&self) -> &str {
        self.node.id()
    }

    pub fn peer_id(&self) -> Option<String> {
        self.peer_rx.borrow().clone()
    }

    /// Enqueues an envelope-packed RPC for the paired endpoint.
    pub fn send_to_peer(&self, command: &str, args: Vec<String>) -> Result<()> {
        let outbound = self.outbound.lock();
        let sender = outbound
            .as_ref()
            .ok_or_else(|| BusError::Transport("proxy endpoint is shut down".to_string()))?;
        sender
            .send((command.to_string(), args))
            .map_err(|_| BusError::Transport("proxy endpoint pump is gone".to_string()))
    }

    fn spawn_pump(
        &self,
        mut rx: mpsc::UnboundedReceiver<(String, Vec<String>)>,
    ) -> Arc<StoppableTask> {
        let node = self.node.clone();
        let mut peer_rx = self.peer_rx.clone();
        let weak_self = self
            .self_ref
            .get()
            .cloned()
            .expect("pump spawns after the self reference is set");
        StoppableTask::spawn(format!("proxy-pump<{}>", self.node.id()), move |stop| {
            async move {
                let peer = tokio::select! {
                    _ = stop.wait() => return,
                    changed = peer_rx.wait_for(Option::is_some) => match changed {
                        Ok(value) => value.clone().expect("checked by wait_for"),
                        Err(_) => return,
                    }
                };
                loop {
                    let next = tokio::select! {
                        _ = stop.wait() => break,
                        next = rx.recv() => next,
                    };
                    let (command, mut args) = match next {
                        Some(message) => message,
                        None => break,
                    };
                    args.push(command);
                    if let Err(error) = node
                        .send(proxy_commands::PROXY_ENVELOPE, args, &peer)
                        .await
                    {
                        // Transport failures surface to the owning proxy.
                        if let Some(endpoint) = weak_self.upgrade() {
                            if let Some(proxy) =
                                endpoint.proxy.get().and_then(Weak::upgrade)
                            {
                                proxy.core().raise_error(error.to_string(), 0);
                            }
                        }
                        break;
                    }
                }
            }
        })
    }

    /// Stops the pump and the node without waiting.
    pub fn begin_shutdown(&self) {
        self.outbound.lock().take();
        if let Some(pump) = self.pump.lock().as_ref() {
            pump.request_stop();
        }
        self.node.begin_shutdown();
    }

    /// Flushes the outbound queue and tears the endpoint pair down.
    pub async fn shutdown(&self) {
        self.outbound.lock().take();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.join().await;
        }
        self.node.graceful_shutdown().await;
    }
}

impl MessageHandler for ProxyEndpoint {
    fn on_message(&self, sender: &str, command: &str, mut args: Vec<String>) {
        if command != proxy_commands::PROXY_ENVELOPE {
            tracing::warn!(node = %self.node.id(), command, "unexpected transport command");
            return;
        }
        let real_command = match args.pop() {
            Some(command) => command,
            None => {
                self.raise_on_peer("empty proxy envelope".to_string());
                return;
            }
        };
        let proxy = match self.proxy.get().and_then(Weak::upgrade) {
            Some(proxy) => proxy,
            None => {
                tracing::debug!(node = %self.node.id(), command = %real_command,
                    "proxy gone, dropping inbound command");
                return;
            }
        };
        tracing::debug!(
            node = %self.node.id(),
            from = sender,
            command = %real_command,
            "proxy command received"
        );
        match proxy.from_remote_peer(&real_command, args) {
            Ok(true) => {}
            Ok(false) => {
                proxy
                    .core()
                    .raise_error_on_peer(format!("invalid proxy command: {}", real_command), 0);
            }
            Err(error) => {
                proxy.core().raise_error_on_peer(error.to_string(), 0);
            }
        }
    }

    fn on_peer_joined(&self, peer_id: &str) {
        if self.peer_rx.borrow().is_none() {
            let _ = self.peer_tx.send(Some(peer_id.to_string()));
        }
    }
}

impl Drop for ProxyEndpoint {
    fn drop(&mut self) {
        self.begin_shutdown();
    }
}

impl std::fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("id", &self.id())
            .field("peer", &self.peer_id())
            .finish()
    }
}

impl ProxyEndpoint {
    fn raise_on_peer(&self, message: String) {
        if let Some(proxy) = self.proxy.get().and_then(Weak::upgrade) {
            proxy.core().raise_error_on_peer(message, 0);
        }
    }
}
