//! The service bus node: command registry, ownership, issue and
//! dispatch.
//!
//! Elements on the bus are command providers, command issuers, or both.
//! Providers register a [`CommandProcessor`] and take bus-wide ownership
//! of its commands; issuers construct a concrete proxy and hand it to
//! [`ServiceBus::issue_bus_command`]. The command list is fixed and each
//! command has at most one owner.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::error::BusError;
use crate::port_pool::PortPool;
use crate::processor::CommandProcessor;
use crate::proxy::{CommandProxy, ProxyEndpoint};
use crate::transport::{MessageHandler, StarNode};
use crate::Result;

/// Control command: the sender takes ownership of the listed commands.
const TAKE_OWNERSHIP: &str = "bus_take_ownership";
/// Control command: `(command, owner)` pairs replayed to late joiners.
const OWNERSHIP_SYNC: &str = "bus_ownership";

/// Startup parameters of a bus node.
#[derive(Debug, Clone)]
pub struct ServiceBusConfig {
    /// This node's overlay id, `host:port`.
    pub node_id: String,
    /// Known peer to join through; `None` makes this node the hub.
    pub known_peer: Option<String>,
    /// The fixed command list every node on this bus shares.
    pub service_list: HashSet<String>,
}

impl ServiceBusConfig {
    pub fn new(node_id: impl Into<String>, known_peer: Option<String>) -> Self {
        Self {
            node_id: node_id.into(),
            known_peer,
            service_list: crate::commands::service_list(),
        }
    }

    pub fn with_service_list(mut self, service_list: HashSet<String>) -> Self {
        self.service_list = service_list;
        self
    }
}

struct BusInner {
    node: Arc<StarNode>,
    host: String,
    port_pool: Arc<PortPool>,
    service_list: HashSet<String>,
    ownership: Mutex<HashMap<String, String>>,
    /// Bus peers this node has heard from or was configured with.
    known_peers: Mutex<HashSet<String>>,
    processors: Mutex<Vec<Arc<dyn CommandProcessor>>>,
    next_serial: AtomicU32,
    is_hub: bool,
    self_ref: OnceLock<Weak<BusInner>>,
}

/// A node on the service bus.
pub struct ServiceBus {
    inner: Arc<BusInner>,
}

impl ServiceBus {
    /// Joins the overlay and starts dispatching.
    pub async fn start(config: ServiceBusConfig, port_pool: Arc<PortPool>) -> Result<Arc<Self>> {
        let host = config
            .node_id
            .split(':')
            .next()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| {
                BusError::Lifecycle(format!("node id {} is not host:port", config.node_id))
            })?
            .to_string();
        let is_hub = config.known_peer.is_none();
        let node = StarNode::new(config.node_id.clone(), config.known_peer.clone());
        let mut known_peers = HashSet::new();
        if let Some(peer) = &config.known_peer {
            known_peers.insert(peer.clone());
        }
        let inner = Arc::new(BusInner {
            node: node.clone(),
            host,
            port_pool,
            service_list: config.service_list,
            ownership: Mutex::new(HashMap::new()),
            known_peers: Mutex::new(known_peers),
            processors: Mutex::new(Vec::new()),
            next_serial: AtomicU32::new(1),
            is_hub,
            self_ref: OnceLock::new(),
        });
        let _ = inner.self_ref.set(Arc::downgrade(&inner));
        node.start(&(inner.clone() as Arc<dyn MessageHandler>))
            .await?;
        tracing::info!(node = %inner.node.id(), hub = is_hub, "service bus node started");
        Ok(Arc::new(Self { inner }))
    }

    pub fn node_id(&self) -> &str {
        self.inner.node.id()
    }

    pub fn port_pool(&self) -> &Arc<PortPool> {
        &self.inner.port_pool
    }

    /// Current owner of a bus command, if any is known.
    pub fn owner_of(&self, command: &str) -> Option<String> {
        self.inner.ownership.lock().get(command).cloned()
    }

    /// Registers a processor, taking bus-wide ownership of its commands.
    pub async fn register_processor(&self, processor: Arc<dyn CommandProcessor>) -> Result<()> {
        let my_id = self.inner.node.id().to_string();
        let commands: Vec<String> = {
            let mut ownership = self.inner.ownership.lock();
            let mut taken = Vec::new();
            for command in processor.commands() {
                if !self.inner.service_list.contains(command) {
                    return Err(BusError::UnknownCommand(command.clone()));
                }
                match ownership.get(command) {
                    Some(owner) if owner != &my_id => {
                        return Err(BusError::AlreadyOwned {
                            command: command.clone(),
                            owner: owner.clone(),
                        });
                    }
                    _ => {
                        ownership.insert(command.clone(), my_id.clone());
                        taken.push(command.clone());
                    }
                }
            }
            taken
        };
        self.inner.processors.lock().push(processor);
        self.inner.announce_ownership(&commands, None).await;
        Ok(())
    }

    /// Issues a command on the bus: assigns a serial, reserves a port,
    /// brings up the requestor-side endpoint and broadcasts the bus
    /// message to the owning node.
    pub async fn issue_bus_command(&self, proxy: Arc<dyn CommandProxy>) -> Result<()> {
        let command = proxy.core().command();
        if !self.inner.service_list.contains(&command) {
            return Err(BusError::UnknownCommand(command));
        }
        let owner = self
            .owner_of(&command)
            .ok_or_else(|| BusError::UnknownCommand(command.clone()))?;

        let serial = self.inner.next_serial.fetch_add(1, Ordering::SeqCst);
        proxy.core().set_serial(serial);
        proxy.core().set_requestor_id(self.inner.node.id());

        let port = self.inner.port_pool.acquire().await?;
        let endpoint = ProxyEndpoint::listen(&self.inner.host, port, &proxy).await?;
        proxy.core().attach_endpoint(endpoint.clone())?;

        let mut wire_args = vec![
            self.inner.node.id().to_string(),
            serial.to_string(),
            endpoint.id().to_string(),
        ];
        proxy.tokenize(&mut wire_args);

        tracing::debug!(
            command = %proxy.core().command(),
            serial,
            owner = %owner,
            endpoint = %endpoint.id(),
            "issuing bus command"
        );
        self.inner.node.send(&command, wire_args, &owner).await
    }

    /// Leaves the overlay, flushing outbound queues.
    pub async fn graceful_shutdown(&self) {
        self.inner.node.graceful_shutdown().await;
    }
}

impl BusInner {
    fn peers_snapshot(&self) -> Vec<String> {
        self.known_peers.lock().iter().cloned().collect()
    }

    async fn announce_ownership(&self, commands: &[String], exclude: Option<&str>) {
        if commands.is_empty() {
            return;
        }
        for peer in self.peers_snapshot() {
            if Some(peer.as_str()) == exclude {
                continue;
            }
            if let Err(error) = self
                .node
                .send(TAKE_OWNERSHIP, commands.to_vec(), &peer)
                .await
            {
                tracing::warn!(peer = %peer, %error, "ownership announcement failed");
            }
        }
    }

    fn record_ownership(&self, command: &str, owner: &str) {
        let mut ownership = self.ownership.lock();
        match ownership.get(command) {
            Some(existing) if existing != owner => {
                tracing::error!(
                    command,
                    existing = %existing,
                    claimed = %owner,
                    "conflicting command ownership claim ignored"
                );
            }
            _ => {
                ownership.insert(command.to_string(), owner.to_string());
            }
        }
    }

    async fn handle_bus_command(self: Arc<Self>, command: String, args: Vec<String>) {
        let processor = {
            let processors = self.processors.lock();
            processors
                .iter()
                .find(|processor| processor.commands().contains(&command))
                .cloned()
        };
        let processor = match processor {
            Some(processor) => processor,
            None => {
                tracing::error!(command = %command, "no processor registered for command");
                return;
            }
        };
        if args.len() < 3 {
            tracing::error!(command = %command, "invalid bus command syntax");
            return;
        }
        let requestor_id = args[0].clone();
        let serial: u32 = match args[1].parse() {
            Ok(serial) => serial,
            Err(_) => {
                tracing::error!(command = %command, raw = %args[1], "invalid command serial");
                return;
            }
        };
        let caller_endpoint = args[2].clone();

        let proxy = processor.factory_empty_proxy();
        proxy.core().set_command(&command);
        proxy.core().set_requestor_id(&requestor_id);
        proxy.core().set_serial(serial);
        proxy.core().set_args(args[3..].to_vec());

        let port = match self.port_pool.acquire().await {
            Ok(port) => port,
            Err(error) => {
                tracing::error!(command = %command, %error, "cannot start command proxy");
                return;
            }
        };
        let endpoint =
            match ProxyEndpoint::connect(&self.host, port, &caller_endpoint, &proxy).await {
                Ok(endpoint) => endpoint,
                Err(error) => {
                    tracing::error!(command = %command, %error, "cannot reach requestor endpoint");
                    return;
                }
            };
        if let Err(error) = proxy.core().attach_endpoint(endpoint) {
            tracing::error!(command = %command, %error, "endpoint attach failed");
            return;
        }

        tracing::debug!(command = %command, serial, requestor = %requestor_id,
            "running bus command");
        if let Err(error) = processor.run_command(proxy).await {
            tracing::error!(command = %command, %error, "run_command failed");
        }
    }
}

impl MessageHandler for BusInner {
    fn on_message(&self, sender: &str, command: &str, args: Vec<String>) {
        self.known_peers.lock().insert(sender.to_string());
        match command {
            TAKE_OWNERSHIP => {
                for taken in &args {
                    self.record_ownership(taken, sender);
                }
                if self.is_hub {
                    // Relay so every leaf converges on the same registry.
                    if let Some(inner) = self.self_ref.get().and_then(Weak::upgrade) {
                        let sender = sender.to_string();
                        tokio::spawn(async move {
                            inner.announce_claimed(&args, &sender).await;
                        });
                    }
                }
            }
            OWNERSHIP_SYNC => {
                let mut pairs = args.chunks_exact(2);
                for pair in &mut pairs {
                    self.record_ownership(&pair[0], &pair[1]);
                }
            }
            command if self.service_list.contains(command) => {
                if let Some(inner) = self.self_ref.get().and_then(Weak::upgrade) {
                    let command = command.to_string();
                    tokio::spawn(async move {
                        inner.handle_bus_command(command, args).await;
                    });
                }
            }
            other => {
                // Hard error but the connection stays alive.
                tracing::error!(from = sender, command = %other, "unknown bus command");
            }
        }
    }

    fn on_peer_joined(&self, peer_id: &str) {
        tracing::debug!(node = %self.node.id(), peer = %peer_id, "bus peer joined");
        self.known_peers.lock().insert(peer_id.to_string());
        if self.is_hub {
            if let Some(inner) = self.self_ref.get().and_then(Weak::upgrade) {
                let peer = peer_id.to_string();
                tokio::spawn(async move {
                    inner.sync_ownership_to(&peer).await;
                });
            }
        }
    }
}

impl BusInner {
    /// Relays another node's ownership claim to the remaining peers.
    async fn announce_claimed(&self, commands: &[String], claimed_by: &str) {
        let owned: Vec<String> = {
            let ownership = self.ownership.lock();
            commands
                .iter()
                .filter(|command| ownership.get(*command).map(String::as_str) == Some(claimed_by))
                .cloned()
                .collect()
        };
        if owned.is_empty() {
            return;
        }
        let mut pairs = Vec::new();
        for command in &owned {
            pairs.push(command.clone());
            pairs.push(claimed_by.to_string());
        }
        for peer in self.peers_snapshot() {
            if peer == claimed_by {
                continue;
            }
            if let Err(error) = self.node.send(OWNERSHIP_SYNC, pairs.clone(), &peer).await {
                tracing::warn!(peer = %peer, %error, "ownership relay failed");
            }
        }
    }

    async fn sync_ownership_to(&self, peer: &str) {
        let pairs: Vec<String> = {
            let ownership = self.ownership.lock();
            ownership
                .iter()
                .flat_map(|(command, owner)| [command.clone(), owner.clone()])
                .collect()
        };
        // Sent even when empty so the new peer becomes dialable for
        // later relays.
        if let Err(error) = self.node.send(OWNERSHIP_SYNC, pairs, peer).await {
            tracing::warn!(peer = %peer, %error, "ownership sync failed");
        }
    }
}

impl std::fmt::Debug for ServiceBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBus")
            .field("node_id", &self.inner.node.id())
            .field("hub", &self.inner.is_hub)
            .finish()
    }
}
