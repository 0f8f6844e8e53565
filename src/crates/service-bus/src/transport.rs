//! Star-topology transport endpoints.
//!
//! A [`StarNode`] is a peer in the overlay: it listens on the port baked
//! into its id, dials other peers lazily, and delivers `(command,
//! args[])` tuples point-to-point. Delivery is at-most-once and in order
//! per (sender, receiver) pair: each direction rides a single TCP
//! connection drained by a single writer task. A join announcement is
//! the first frame on every fresh link, so receivers always learn about
//! a peer before its first message.

use std::sync::{Arc, OnceLock, Weak};

use commons::StoppableTask;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::BusError;
use crate::Result;

/// Control command announcing a peer on a fresh link.
pub const JOIN_COMMAND: &str = "node_joined";

/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    sender: String,
    command: String,
    args: Vec<String>,
}

/// Callback surface a [`StarNode`] dispatches into.
///
/// Implementations are held behind a weak reference (the node must never
/// own its handler, see the proxy lifecycle notes) and are invoked from
/// the node's reader tasks.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, sender: &str, command: &str, args: Vec<String>);

    fn on_peer_joined(&self, _peer_id: &str) {}
}

struct PeerLink {
    queue: mpsc::UnboundedSender<WireMessage>,
    writer: Arc<StoppableTask>,
}

/// A peer node in the star overlay, identified as `host:port`.
pub struct StarNode {
    id: String,
    known_peer: Option<String>,
    handler: OnceLock<Weak<dyn MessageHandler>>,
    peers: DashMap<String, PeerLink>,
    accept_task: Mutex<Option<Arc<StoppableTask>>>,
    reader_tasks: Mutex<Vec<Arc<StoppableTask>>>,
    self_ref: OnceLock<Weak<StarNode>>,
}

impl StarNode {
    pub fn new(id: impl Into<String>, known_peer: Option<String>) -> Arc<Self> {
        let node = Arc::new(Self {
            id: id.into(),
            known_peer,
            handler: OnceLock::new(),
            peers: DashMap::new(),
            accept_task: Mutex::new(None),
            reader_tasks: Mutex::new(Vec::new()),
            self_ref: OnceLock::new(),
        });
        let _ = node.self_ref.set(Arc::downgrade(&node));
        node
    }

    fn strong_self(&self) -> Arc<StarNode> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("nodes are always built through new()")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Binds the listener, starts the accept loop and joins the overlay
    /// through the known peer when one was given.
    pub async fn start(&self, handler: &Arc<dyn MessageHandler>) -> Result<()> {
        if self.handler.set(Arc::downgrade(handler)).is_err() {
            return Err(BusError::Lifecycle(format!(
                "transport endpoint {} started twice",
                self.id
            )));
        }
        let listener = TcpListener::bind(&self.id)
            .await
            .map_err(|e| BusError::Transport(format!("cannot bind {}: {}", self.id, e)))?;
        tracing::debug!(node = %self.id, "transport endpoint listening");

        let node = self.strong_self();
        let accept_task = StoppableTask::spawn(format!("accept<{}>", self.id), move |stop| {
            async move {
                loop {
                    tokio::select! {
                        _ = stop.wait() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => node.spawn_reader(stream),
                            Err(error) => {
                                tracing::warn!(node = %node.id, %error, "accept failed");
                            }
                        }
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(accept_task);

        if let Some(peer) = self.known_peer.clone() {
            self.ensure_peer(&peer).await?;
        }
        Ok(())
    }

    /// Sends `(command, args)` to the addressed peer, dialing it first if
    /// no link exists yet.
    pub async fn send(&self, command: &str, args: Vec<String>, peer_id: &str) -> Result<()> {
        self.ensure_peer(peer_id).await?;
        let message = WireMessage {
            sender: self.id.clone(),
            command: command.to_string(),
            args,
        };
        let link = self
            .peers
            .get(peer_id)
            .ok_or_else(|| BusError::Transport(format!("no link to peer {}", peer_id)))?;
        link.queue
            .send(message)
            .map_err(|_| BusError::Transport(format!("link to peer {} is closed", peer_id)))
    }

    /// Peer ids with an open outbound link.
    pub fn linked_peers(&self) -> Vec<String> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Stops all tasks and closes all links without waiting. Outbound
    /// queues are still drained by their writer tasks.
    pub fn begin_shutdown(&self) {
        if let Some(task) = self.accept_task.lock().as_ref() {
            task.request_stop();
        }
        for task in self.reader_tasks.lock().iter() {
            task.request_stop();
        }
        // Dropping the senders lets each writer drain and close.
        self.peers.clear();
    }

    /// Flushes outbound queues and joins every task.
    pub async fn graceful_shutdown(&self) {
        let writers: Vec<Arc<StoppableTask>> = self
            .peers
            .iter()
            .map(|entry| entry.value().writer.clone())
            .collect();
        self.begin_shutdown();
        for writer in writers {
            writer.join().await;
        }
        let accept = self.accept_task.lock().take();
        if let Some(task) = accept {
            task.stop_and_join().await;
        }
        let readers: Vec<Arc<StoppableTask>> = self.reader_tasks.lock().drain(..).collect();
        for reader in readers {
            reader.stop_and_join().await;
        }
        tracing::debug!(node = %self.id, "transport endpoint shut down");
    }

    fn spawn_reader(&self, stream: TcpStream) {
        let (read_half, _write_half) = stream.into_split();
        let node = self.strong_self();
        let task = StoppableTask::spawn(format!("reader<{}>", self.id), move |stop| async move {
            let mut read_half = read_half;
            loop {
                tokio::select! {
                    _ = stop.wait() => break,
                    frame = read_frame(&mut read_half) => match frame {
                        Ok(Some(message)) => node.dispatch(message),
                        Ok(None) => break,
                        Err(error) => {
                            tracing::warn!(node = %node.id, %error, "dropping connection");
                            break;
                        }
                    }
                }
            }
        });
        self.reader_tasks.lock().push(task);
    }

    fn dispatch(&self, message: WireMessage) {
        let handler = match self.handler.get().and_then(Weak::upgrade) {
            Some(handler) => handler,
            None => {
                tracing::debug!(node = %self.id, command = %message.command,
                    "handler gone, dropping message");
                return;
            }
        };
        if message.command == JOIN_COMMAND {
            tracing::debug!(node = %self.id, peer = %message.sender, "peer joined");
            handler.on_peer_joined(&message.sender);
        } else {
            handler.on_message(&message.sender, &message.command, message.args);
        }
    }

    async fn ensure_peer(&self, peer_id: &str) -> Result<()> {
        if self.peers.contains_key(peer_id) {
            return Ok(());
        }
        let stream = TcpStream::connect(peer_id)
            .await
            .map_err(|e| BusError::Transport(format!("cannot reach peer {}: {}", peer_id, e)))?;
        let (_read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = self.spawn_writer(peer_id, write_half, rx);
        match self.peers.entry(peer_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // Lost the dial race; the existing link wins and this
                // connection closes when tx/writer go out of scope.
                writer.request_stop();
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(PeerLink { queue: tx, writer });
            }
        }
        Ok(())
    }

    fn spawn_writer(
        &self,
        peer_id: &str,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<WireMessage>,
    ) -> Arc<StoppableTask> {
        let node_id = self.id.clone();
        let peer = peer_id.to_string();
        StoppableTask::spawn(format!("writer<{}->{}>", self.id, peer_id), move |stop| {
            async move {
                let join = WireMessage {
                    sender: node_id.clone(),
                    command: JOIN_COMMAND.to_string(),
                    args: Vec::new(),
                };
                if let Err(error) = write_frame(&mut write_half, &join).await {
                    tracing::warn!(peer = %peer, %error, "join announcement failed");
                    return;
                }
                loop {
                    tokio::select! {
                        _ = stop.wait() => break,
                        message = rx.recv() => match message {
                            Some(message) => {
                                if let Err(error) = write_frame(&mut write_half, &message).await {
                                    tracing::warn!(peer = %peer, %error, "send failed");
                                    return;
                                }
                            }
                            None => break,
                        }
                    }
                }
                // Flush whatever is still queued before closing the link.
                while let Ok(message) = rx.try_recv() {
                    if let Err(error) = write_frame(&mut write_half, &message).await {
                        tracing::warn!(peer = %peer, %error, "flush failed");
                        break;
                    }
                }
                let _ = write_half.shutdown().await;
            }
        })
    }
}

impl std::fmt::Debug for StarNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StarNode")
            .field("id", &self.id)
            .field("peers", &self.peers.len())
            .finish()
    }
}

async fn write_frame(stream: &mut OwnedWriteHalf, message: &WireMessage) -> Result<()> {
    let payload = bincode::serialize(message)?;
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    stream.write_all(&payload).await?;
    Ok(())
}

async fn read_frame(stream: &mut OwnedReadHalf) -> Result<Option<WireMessage>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(BusError::MalformedMessage(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(String, String, Vec<String>)>>,
        joined: Mutex<Vec<String>>,
    }

    impl MessageHandler for Recorder {
        fn on_message(&self, sender: &str, command: &str, args: Vec<String>) {
            self.messages
                .lock()
                .push((sender.to_string(), command.to_string(), args));
        }

        fn on_peer_joined(&self, peer_id: &str) {
            self.joined.lock().push(peer_id.to_string());
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn join_precedes_first_message() {
        let hub = StarNode::new("127.0.0.1:36110", None);
        let leaf = StarNode::new("127.0.0.1:36111", Some("127.0.0.1:36110".to_string()));

        let hub_recorder = Arc::new(Recorder::default());
        let leaf_recorder = Arc::new(Recorder::default());
        hub.start(&(hub_recorder.clone() as Arc<dyn MessageHandler>))
            .await
            .unwrap();
        leaf.start(&(leaf_recorder.clone() as Arc<dyn MessageHandler>))
            .await
            .unwrap();

        leaf.send("ping", vec!["1".to_string()], "127.0.0.1:36110")
            .await
            .unwrap();

        wait_for(|| !hub_recorder.messages.lock().is_empty()).await;
        let joined = hub_recorder.joined.lock().clone();
        assert_eq!(joined, vec!["127.0.0.1:36111".to_string()]);
        let messages = hub_recorder.messages.lock().clone();
        assert_eq!(
            messages,
            vec![(
                "127.0.0.1:36111".to_string(),
                "ping".to_string(),
                vec!["1".to_string()]
            )]
        );

        leaf.graceful_shutdown().await;
        hub.graceful_shutdown().await;
    }

    #[tokio::test]
    async fn per_pair_order_is_preserved() {
        let hub = StarNode::new("127.0.0.1:36120", None);
        let leaf = StarNode::new("127.0.0.1:36121", Some("127.0.0.1:36120".to_string()));

        let hub_recorder = Arc::new(Recorder::default());
        let leaf_recorder = Arc::new(Recorder::default());
        hub.start(&(hub_recorder.clone() as Arc<dyn MessageHandler>))
            .await
            .unwrap();
        leaf.start(&(leaf_recorder.clone() as Arc<dyn MessageHandler>))
            .await
            .unwrap();

        for i in 0..100 {
            leaf.send("seq", vec![i.to_string()], "127.0.0.1:36120")
                .await
                .unwrap();
        }
        wait_for(|| hub_recorder.messages.lock().len() == 100).await;
        let messages = hub_recorder.messages.lock().clone();
        for (i, (_, command, args)) in messages.iter().enumerate() {
            assert_eq!(command, "seq");
            assert_eq!(args[0], i.to_string());
        }

        leaf.graceful_shutdown().await;
        hub.graceful_shutdown().await;
    }

    #[tokio::test]
    async fn send_to_unreachable_peer_is_a_transport_failure() {
        let node = StarNode::new("127.0.0.1:36130", None);
        let recorder = Arc::new(Recorder::default());
        node.start(&(recorder.clone() as Arc<dyn MessageHandler>))
            .await
            .unwrap();
        let result = node.send("ping", vec![], "127.0.0.1:1").await;
        assert!(matches!(result, Err(BusError::Transport(_))));
        node.graceful_shutdown().await;
    }
}
