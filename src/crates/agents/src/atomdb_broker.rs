//! The atom-db broker: a long-lived session for pushing atoms into a
//! remote node's store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use atomspace::{Atom, AtomStore, Handle};
use commons::{tokens, SharedQueue, StopToken};
use parking_lot::Mutex;
use service_bus::{
    commands, proxy_commands, BusError, CommandProcessor, CommandProxy, ProxyCore, WorkerSet,
};

use crate::error::AgentError;
use crate::Result;

/// Piggyback command: tokenized atoms to persist.
pub const ADD_ATOMS: &str = "add_atoms";
/// Piggyback reply: handles of the atoms just persisted.
pub const ADD_ATOMS_FINISHED: &str = "add_atoms_finished";
/// Piggyback command: tear the long-lived session down.
pub const SHUTDOWN: &str = "shutdown";

/// How long a caller waits for an `add_atoms` acknowledgement.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

enum BrokerRequest {
    AddAtoms(Vec<String>),
    Shutdown,
}

/// Caller/processor proxy of the `atomdb` bus command.
///
/// The session stays open until [`AtomDbProxy::shutdown`] or an abort;
/// each `add_atoms` call is one request/acknowledge round trip on the
/// proxy pair.
pub struct AtomDbProxy {
    core: ProxyCore,
    requests: SharedQueue<BrokerRequest>,
    reply: Mutex<Option<Vec<String>>>,
}

impl AtomDbProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            core: ProxyCore::new(commands::ATOMDB),
            requests: SharedQueue::new(),
            reply: Mutex::new(None),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new()
    }

    /// True while the remote session is still serving requests.
    pub fn running(&self) -> bool {
        !self.core.finished()
    }

    /// Ships the atoms to the owning node and waits for their handles.
    pub async fn add_atoms(&self, atoms: &[Atom]) -> Result<Vec<Handle>> {
        let mut payload = vec![atoms.len().to_string()];
        for atom in atoms {
            atom.to_tokens(&mut payload);
        }
        *self.reply.lock() = None;
        self.core.send_to_peer(ADD_ATOMS, payload)?;

        let deadline = Instant::now() + REPLY_TIMEOUT;
        loop {
            if let Some(raw_handles) = self.reply.lock().take() {
                let mut handles = Vec::with_capacity(raw_handles.len());
                for raw in raw_handles {
                    handles.push(
                        raw.parse::<Handle>()
                            .map_err(|e| AgentError::MalformedRequest(e.to_string()))?,
                    );
                }
                return Ok(handles);
            }
            if self.core.finished() {
                return Err(AgentError::Bus(BusError::Transport(
                    "atomdb session closed before acknowledging".to_string(),
                )));
            }
            if Instant::now() >= deadline {
                return Err(AgentError::Bus(BusError::Transport(
                    "timed out waiting for add_atoms acknowledgement".to_string(),
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Ends the remote session; the processor answers with `FINISHED`.
    pub fn shutdown(&self) -> service_bus::Result<()> {
        self.core.send_to_peer(SHUTDOWN, Vec::new())
    }

    pub fn abort(&self) {
        self.core.abort();
    }

    fn pop_request(&self) -> Option<BrokerRequest> {
        self.requests.pop()
    }

    async fn wait_request(&self) {
        self.requests.wait_update().await;
    }
}

impl CommandProxy for AtomDbProxy {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn from_remote_peer(&self, command: &str, args: Vec<String>) -> service_bus::Result<bool> {
        if self.core.handle_base_command(command, &args)? {
            return Ok(true);
        }
        match command {
            ADD_ATOMS => {
                self.requests.push(BrokerRequest::AddAtoms(args));
                Ok(true)
            }
            ADD_ATOMS_FINISHED => {
                *self.reply.lock() = Some(args);
                Ok(true)
            }
            SHUTDOWN => {
                self.requests.push(BrokerRequest::Shutdown);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn tokenize(&self, out: &mut Vec<String>) {
        self.core.tokenize_base(out);
    }

    fn untokenize(&self, stream: &mut Vec<String>) -> service_bus::Result<()> {
        self.core.untokenize_base(stream)
    }
}

/// Bus element responsible for `atomdb` commands.
pub struct AtomDbProcessor {
    commands: HashSet<String>,
    store: Arc<dyn AtomStore>,
    workers: Arc<WorkerSet>,
}

impl AtomDbProcessor {
    pub fn new(store: Arc<dyn AtomStore>) -> Arc<Self> {
        Arc::new(Self {
            commands: [commands::ATOMDB.to_string()].into_iter().collect(),
            store,
            workers: Arc::new(WorkerSet::new()),
        })
    }
}

#[async_trait]
impl CommandProcessor for AtomDbProcessor {
    fn commands(&self) -> &HashSet<String> {
        &self.commands
    }

    fn factory_empty_proxy(&self) -> Arc<dyn CommandProxy> {
        AtomDbProxy::empty()
    }

    async fn run_command(&self, proxy: Arc<dyn CommandProxy>) -> service_bus::Result<()> {
        let proxy = proxy
            .as_any()
            .downcast::<AtomDbProxy>()
            .map_err(|_| BusError::Lifecycle("atomdb broker got a foreign proxy".to_string()))?;
        let key = WorkerSet::worker_key(proxy.core());
        let store = self.store.clone();
        let workers = self.workers.clone();
        let worker_key = key.clone();
        self.workers.spawn(key, move |stop| async move {
            if let Err(error) = serve_session(&store, &proxy, &stop).await {
                proxy.core().raise_error_on_peer(error.to_string(), 0);
            }
            workers.remove(&worker_key);
        })
    }
}

async fn serve_session(
    store: &Arc<dyn AtomStore>,
    proxy: &Arc<AtomDbProxy>,
    stop: &StopToken,
) -> Result<()> {
    let mut session_tokens = proxy.core().take_args();
    proxy.untokenize(&mut session_tokens)?;
    tracing::info!(requestor = %proxy.core().requestor_id(), "atomdb session open");

    while !proxy.core().is_aborting() && !stop.stopped() {
        match proxy.pop_request() {
            Some(BrokerRequest::AddAtoms(payload)) => {
                let handles = persist_atoms(store, payload).await?;
                proxy.core().send_to_peer(
                    ADD_ATOMS_FINISHED,
                    handles.iter().map(Handle::to_string).collect(),
                )?;
            }
            Some(BrokerRequest::Shutdown) => {
                tracing::info!("atomdb session shutting down");
                break;
            }
            None => {
                tokio::select! {
                    _ = stop.wait() => {}
                    _ = proxy.wait_request() => {}
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
        }
    }
    proxy
        .core()
        .send_to_peer(proxy_commands::FINISHED, Vec::new())?;
    Ok(())
}

async fn persist_atoms(store: &Arc<dyn AtomStore>, mut payload: Vec<String>) -> Result<Vec<Handle>> {
    let count: usize = tokens::take_parse(&mut payload)?;
    let mut atoms = Vec::with_capacity(count);
    for _ in 0..count {
        atoms.push(Atom::from_tokens(&mut payload)?);
    }
    if !payload.is_empty() {
        return Err(AgentError::MalformedRequest(
            "trailing tokens after atom batch".to_string(),
        ));
    }
    Ok(store.add_atoms(atoms, true, true).await?)
}
