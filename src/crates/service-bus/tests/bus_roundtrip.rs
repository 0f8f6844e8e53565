//! End-to-end exercises of the service bus: ownership, command
//! dispatch, proxy RPC in both directions, and port reclamation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use service_bus::{
    proxy_commands, BusError, CommandProcessor, CommandProxy, PortPool, ProxyCore, ServiceBus,
    ServiceBusConfig,
};

struct TestProxy {
    core: ProxyCore,
    payload: Mutex<Vec<String>>,
    remote: Mutex<Vec<(String, Vec<String>)>>,
}

impl TestProxy {
    fn new(command: &str, payload: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            core: ProxyCore::new(command),
            payload: Mutex::new(payload),
            remote: Mutex::new(Vec::new()),
        })
    }

    fn payload(&self) -> Vec<String> {
        self.payload.lock().clone()
    }

    fn remote_calls(&self) -> Vec<(String, Vec<String>)> {
        self.remote.lock().clone()
    }
}

impl CommandProxy for TestProxy {
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
        self.remote.lock().push((command.to_string(), args));
        Ok(true)
    }

    fn tokenize(&self, out: &mut Vec<String>) {
        self.core.tokenize_base(out);
        let payload = self.payload.lock();
        out.push(payload.len().to_string());
        out.extend(payload.iter().cloned());
    }

    fn untokenize(&self, tokens: &mut Vec<String>) -> service_bus::Result<()> {
        self.core.untokenize_base(tokens)?;
        let count: usize = commons::tokens::take_parse(tokens)?;
        let mut payload = Vec::with_capacity(count);
        for _ in 0..count {
            payload.push(commons::tokens::take(tokens)?);
        }
        *self.payload.lock() = payload;
        Ok(())
    }
}

struct TestProcessor {
    commands: HashSet<String>,
    received: Mutex<Vec<(String, Vec<String>)>>,
    last_proxy: Mutex<Option<Arc<TestProxy>>>,
}

impl TestProcessor {
    fn new(commands: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            commands: commands.iter().map(|c| c.to_string()).collect(),
            received: Mutex::new(Vec::new()),
            last_proxy: Mutex::new(None),
        })
    }

    fn received(&self) -> Vec<(String, Vec<String>)> {
        self.received.lock().clone()
    }

    fn last_proxy(&self) -> Option<Arc<TestProxy>> {
        self.last_proxy.lock().clone()
    }
}

#[async_trait]
impl CommandProcessor for TestProcessor {
    fn commands(&self) -> &HashSet<String> {
        &self.commands
    }

    fn factory_empty_proxy(&self) -> Arc<dyn CommandProxy> {
        let proxy = TestProxy::new("", Vec::new());
        *self.last_proxy.lock() = Some(proxy.clone());
        proxy
    }

    async fn run_command(&self, proxy: Arc<dyn CommandProxy>) -> service_bus::Result<()> {
        let mut tokens = proxy.core().take_args();
        proxy.untokenize(&mut tokens)?;
        let concrete = self.last_proxy().expect("factory ran first");
        self.received
            .lock()
            .push((proxy.core().command(), concrete.payload()));
        Ok(())
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

fn service_list() -> HashSet<String> {
    ["c1", "c2", "c3"].iter().map(|c| c.to_string()).collect()
}

#[tokio::test]
async fn command_dispatch_and_proxy_rpc() {
    let hub_pool = PortPool::new(36340, 36349).unwrap();
    let leaf_pool = PortPool::new(36350, 36359).unwrap();

    let hub = ServiceBus::start(
        ServiceBusConfig::new("127.0.0.1:36330", None).with_service_list(service_list()),
        hub_pool.clone(),
    )
    .await
    .unwrap();
    let leaf = ServiceBus::start(
        ServiceBusConfig::new("127.0.0.1:36331", Some("127.0.0.1:36330".to_string()))
            .with_service_list(service_list()),
        leaf_pool.clone(),
    )
    .await
    .unwrap();

    let processor = TestProcessor::new(&["c1", "c3"]);
    hub.register_processor(processor.clone()).await.unwrap();
    wait_until("leaf learns the owner of c1", || {
        leaf.owner_of("c1").as_deref() == Some("127.0.0.1:36330")
    })
    .await;

    let caller = TestProxy::new("c1", vec!["c1_arg".to_string()]);
    leaf.issue_bus_command(caller.clone() as Arc<dyn CommandProxy>)
        .await
        .unwrap();

    wait_until("processor receives c1", || !processor.received().is_empty()).await;
    let received = processor.received();
    assert_eq!(received[0].0, "c1");
    assert_eq!(received[0].1, vec!["c1_arg".to_string()]);

    // Caller -> processor RPC piggyback.
    caller
        .core()
        .send_to_peer("ping", vec!["ping_arg".to_string()])
        .unwrap();
    let server_proxy = processor.last_proxy().unwrap();
    wait_until("processor proxy sees the ping", || {
        !server_proxy.remote_calls().is_empty()
    })
    .await;
    assert_eq!(
        server_proxy.remote_calls()[0],
        ("ping".to_string(), vec!["ping_arg".to_string()])
    );

    // Processor -> caller RPC piggyback.
    server_proxy
        .core()
        .send_to_peer("pong", vec!["pong_arg".to_string()])
        .unwrap();
    wait_until("caller proxy sees the pong", || {
        !caller.remote_calls().is_empty()
    })
    .await;
    assert_eq!(
        caller.remote_calls()[0],
        ("pong".to_string(), vec!["pong_arg".to_string()])
    );

    // Completion travels as the sticky FINISHED message.
    server_proxy
        .core()
        .send_to_peer(proxy_commands::FINISHED, Vec::new())
        .unwrap();
    wait_until("caller observes completion", || caller.core().finished()).await;
    server_proxy.core().command_finished();

    // Both sides release their reserved port on drop.
    drop(caller);
    *processor.last_proxy.lock() = None;
    wait_until("leaf port returns to the pool", || {
        leaf_pool.free_count() == 10
    })
    .await;
    wait_until("hub port returns to the pool", || {
        hub_pool.free_count() == 10
    })
    .await;

    leaf.graceful_shutdown().await;
    hub.graceful_shutdown().await;
}

#[tokio::test]
async fn duplicate_ownership_is_rejected() {
    let hub_pool = PortPool::new(36370, 36374).unwrap();
    let leaf_pool = PortPool::new(36375, 36379).unwrap();

    let hub = ServiceBus::start(
        ServiceBusConfig::new("127.0.0.1:36360", None).with_service_list(service_list()),
        hub_pool,
    )
    .await
    .unwrap();
    let leaf = ServiceBus::start(
        ServiceBusConfig::new("127.0.0.1:36361", Some("127.0.0.1:36360".to_string()))
            .with_service_list(service_list()),
        leaf_pool,
    )
    .await
    .unwrap();

    hub.register_processor(TestProcessor::new(&["c2"]))
        .await
        .unwrap();
    wait_until("leaf learns the owner of c2", || leaf.owner_of("c2").is_some()).await;

    let result = leaf.register_processor(TestProcessor::new(&["c2"])).await;
    assert!(matches!(result, Err(BusError::AlreadyOwned { .. })));

    // Re-registration by the same owner stays idempotent.
    hub.register_processor(TestProcessor::new(&["c2"]))
        .await
        .unwrap();

    leaf.graceful_shutdown().await;
    hub.graceful_shutdown().await;
}

#[tokio::test]
async fn issuing_an_unowned_command_fails() {
    let pool = PortPool::new(36390, 36394).unwrap();
    let bus = ServiceBus::start(
        ServiceBusConfig::new("127.0.0.1:36380", None).with_service_list(service_list()),
        pool,
    )
    .await
    .unwrap();

    let proxy = TestProxy::new("c3", Vec::new());
    let result = bus.issue_bus_command(proxy as Arc<dyn CommandProxy>).await;
    assert!(matches!(result, Err(BusError::UnknownCommand(_))));

    let stranger = TestProxy::new("not_in_service_list", Vec::new());
    let result = bus
        .issue_bus_command(stranger as Arc<dyn CommandProxy>)
        .await;
    assert!(matches!(result, Err(BusError::UnknownCommand(_))));

    bus.graceful_shutdown().await;
}
