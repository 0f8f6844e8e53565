//! Agent commands end-to-end over a two-node bus.

use std::sync::Arc;
use std::time::Duration;

use atomspace::AtomStore;

use agents::{
    AnswerElement, AtomDbProcessor, AtomDbProxy, ContextBrokerProcessor, ContextBrokerProxy,
    InferenceProcessor, LinkCreationProcessor, LinkCreationRequestProxy,
    QueryEvolutionProcessor, QueryEvolutionProxy,
};
use atomspace::{
    Atom, AttentionEvent, Handle, InMemoryAtomStore, Link, Node, NullAttentionBroker,
    RecordingAttentionBroker,
};
use service_bus::{CommandProcessor, CommandProxy, PortPool, ServiceBus, ServiceBusConfig};

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..3000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

fn toks(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(String::from).collect()
}

/// Store with three `(Similarity X human)` expressions carrying
/// strengths.
async fn similarity_store() -> Arc<InMemoryAtomStore> {
    let store = InMemoryAtomStore::new();
    let similarity = store
        .add_node(Node::new("Symbol", "Similarity"))
        .await
        .unwrap();
    let human = store.add_node(Node::new("Symbol", "human")).await.unwrap();
    for (name, strength) in [("monkey", 0.9), ("chimp", 0.6), ("ent", 0.2)] {
        let other = store.add_node(Node::new("Symbol", name)).await.unwrap();
        store
            .add_link(
                Link::new("Expression", vec![similarity.clone(), other, human.clone()])
                    .toplevel()
                    .with_property("strength", strength),
            )
            .await
            .unwrap();
    }
    Arc::new(store)
}

async fn two_node_bus(
    base_port: u16,
    processors: Vec<Arc<dyn CommandProcessor>>,
) -> (Arc<ServiceBus>, Arc<ServiceBus>) {
    let server_id = format!("127.0.0.1:{}", base_port);
    let client_id = format!("127.0.0.1:{}", base_port + 1);
    let server = ServiceBus::start(
        ServiceBusConfig::new(server_id.clone(), None),
        PortPool::new(base_port + 10, base_port + 29).unwrap(),
    )
    .await
    .unwrap();
    let client = ServiceBus::start(
        ServiceBusConfig::new(client_id, Some(server_id)),
        PortPool::new(base_port + 30, base_port + 49).unwrap(),
    )
    .await
    .unwrap();
    let mut owned_commands = Vec::new();
    for processor in processors {
        owned_commands.extend(processor.commands().iter().cloned());
        server.register_processor(processor).await.unwrap();
    }
    wait_until("client learns command ownership", || {
        owned_commands
            .iter()
            .all(|command| client.owner_of(command).is_some())
    })
    .await;
    (server, client)
}

const SIMILAR_TO_HUMAN: &str =
    "LINK_TEMPLATE Expression 3 NODE Symbol Similarity VARIABLE v1 NODE Symbol human";

#[tokio::test]
async fn context_broker_creates_and_serves_a_context() {
    let store = similarity_store().await;
    let broker = Arc::new(RecordingAttentionBroker::new());
    let cache_dir = tempfile::tempdir().unwrap();
    let (server, client) = two_node_bus(
        37000,
        vec![ContextBrokerProcessor::with_cache_dir(
            store.clone(),
            broker.clone(),
            cache_dir.path(),
        )],
    )
    .await;

    let proxy = ContextBrokerProxy::new(
        "animals",
        toks(SIMILAR_TO_HUMAN),
        vec![(
            AnswerElement::Handle(0),
            AnswerElement::Variable("v1".to_string()),
        )],
        vec![AnswerElement::Variable("v1".to_string())],
    );
    client
        .issue_bus_command(proxy.clone() as Arc<dyn CommandProxy>)
        .await
        .unwrap();

    wait_until("context is created", || proxy.is_context_created()).await;
    assert!(cache_dir.path().join(proxy.cache_file_name()).exists());

    let events = broker.events();
    assert!(events
        .iter()
        .any(|event| matches!(event, AttentionEvent::SetParameters { .. })));
    assert!(events
        .iter()
        .any(|event| matches!(event, AttentionEvent::SetDeterminers { group_count: 3, .. })));
    assert!(events
        .iter()
        .any(|event| matches!(event, AttentionEvent::Stimulate { .. })));

    // Re-entrant parameter update on the long-lived command.
    proxy.attention_broker_set_parameters(0.5, 0.2, 0.8).unwrap();
    wait_until("parameter update is acknowledged", || {
        proxy.attention_broker_set_parameters_finished()
    })
    .await;
    assert!(broker.events().iter().any(|event| matches!(
        event,
        AttentionEvent::SetParameters { rent_rate, .. } if (*rent_rate - 0.5).abs() < 1e-9
    )));

    proxy.abort();
    wait_until("context command winds down", || proxy.finished()).await;
    client.graceful_shutdown().await;
    server.graceful_shutdown().await;
}

#[tokio::test]
async fn link_creation_materialises_links_from_answers() {
    let store = similarity_store().await;
    let (server, client) = two_node_bus(
        37100,
        vec![LinkCreationProcessor::new(
            store.clone(),
            Arc::new(NullAttentionBroker),
        )],
    )
    .await;

    let proxy = LinkCreationRequestProxy::new(
        toks(SIMILAR_TO_HUMAN),
        toks("LINK Expression 2 NODE Symbol Primate VARIABLE v1"),
        "animals",
    );
    client
        .issue_bus_command(proxy.clone() as Arc<dyn CommandProxy>)
        .await
        .unwrap();
    wait_until("link creation finishes", || proxy.finished()).await;
    assert!(proxy.failures().is_empty());

    let primate = Handle::of_node("Symbol", "Primate");
    for name in ["monkey", "chimp", "ent"] {
        let expected = Handle::of_link(
            "Expression",
            &[primate.clone(), Handle::of_node("Symbol", name)],
        );
        assert!(
            store.link_exists(&expected).await.unwrap(),
            "missing created link for {}",
            name
        );
    }
    client.graceful_shutdown().await;
    server.graceful_shutdown().await;
}

#[tokio::test]
async fn atomdb_session_persists_batches_remotely() {
    let store = similarity_store().await;
    let (server, client) =
        two_node_bus(37200, vec![AtomDbProcessor::new(store.clone())]).await;

    let proxy = AtomDbProxy::new();
    client
        .issue_bus_command(proxy.clone() as Arc<dyn CommandProxy>)
        .await
        .unwrap();

    let snake = Node::new("Symbol", "snake");
    let vine = Node::new("Symbol", "vine");
    let pair = Link::new("Pair", vec![snake.handle(), vine.handle()]);
    let atoms: Vec<Atom> = vec![snake.clone().into(), vine.into(), pair.clone().into()];
    let handles = proxy.add_atoms(&atoms).await.unwrap();
    assert_eq!(handles.len(), 3);
    assert_eq!(handles[0], snake.handle());
    assert!(store.link_exists(&pair.handle()).await.unwrap());
    assert!(proxy.running());

    proxy.shutdown().unwrap();
    wait_until("session winds down", || !proxy.running()).await;
    client.graceful_shutdown().await;
    server.graceful_shutdown().await;
}

#[tokio::test]
async fn evolution_streams_scored_elites() {
    let store = similarity_store().await;
    let (server, client) = two_node_bus(
        37300,
        vec![QueryEvolutionProcessor::new(
            store.clone(),
            Arc::new(NullAttentionBroker),
        )],
    )
    .await;

    let proxy = QueryEvolutionProxy::new(toks(SIMILAR_TO_HUMAN), "animals");
    proxy.set_fitness_function("multiply_strength");
    proxy.set_population_size(10);
    proxy.set_max_generations(2);
    client
        .issue_bus_command(proxy.clone() as Arc<dyn CommandProxy>)
        .await
        .unwrap();

    let mut answers = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !proxy.finished() {
        assert!(tokio::time::Instant::now() < deadline, "evolution stalled");
        match proxy.pop() {
            Some(answer) => answers.push(answer),
            None => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    }
    while let Some(answer) = proxy.pop() {
        answers.push(answer);
    }
    // One elite per generation at minimum; the strongest link leads.
    assert!(!answers.is_empty());
    for answer in &answers {
        assert!((0.0..=1.0).contains(&answer.strength));
    }
    assert!((answers[0].strength - 0.9).abs() < 1e-9);
    client.graceful_shutdown().await;
    server.graceful_shutdown().await;
}

#[tokio::test]
async fn inference_relays_evolution_answers() {
    let store = similarity_store().await;
    // Inference chains into query_evolution, so the hub owns both.
    let server_id = "127.0.0.1:37400".to_string();
    let server = ServiceBus::start(
        ServiceBusConfig::new(server_id.clone(), None),
        PortPool::new(37410, 37429).unwrap(),
    )
    .await
    .unwrap();
    let client = ServiceBus::start(
        ServiceBusConfig::new("127.0.0.1:37401".to_string(), Some(server_id)),
        PortPool::new(37430, 37449).unwrap(),
    )
    .await
    .unwrap();
    server
        .register_processor(QueryEvolutionProcessor::new(
            store.clone(),
            Arc::new(NullAttentionBroker),
        ))
        .await
        .unwrap();
    server
        .register_processor(InferenceProcessor::new(server.clone()))
        .await
        .unwrap();
    wait_until("client learns command ownership", || {
        client.owner_of(service_bus::commands::INFERENCE).is_some()
            && client
                .owner_of(service_bus::commands::QUERY_EVOLUTION)
                .is_some()
    })
    .await;

    // Links are (Similarity X human); the evaluation query pins the
    // second position, so "monkey" hits exactly one expression.
    let request = agents::inference::InferenceRequest {
        kind: "proof_of_implication".to_string(),
        first: Handle::of_node("Symbol", "monkey"),
        second: Handle::of_node("Symbol", "human"),
        max_proof_length: 1,
    };
    let proxy = agents::InferenceProxy::new(&request, "animals");
    proxy.set_timeout_secs(20);
    client
        .issue_bus_command(proxy.clone() as Arc<dyn CommandProxy>)
        .await
        .unwrap();

    let mut answers = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !proxy.finished() {
        assert!(tokio::time::Instant::now() < deadline, "inference stalled");
        match proxy.pop() {
            Some(answer) => answers.push(answer),
            None => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    }
    while let Some(answer) = proxy.pop() {
        answers.push(answer);
    }
    // The evaluation query binds predicates around the Similarity node,
    // so at least one elite comes back per generation.
    assert!(!answers.is_empty());
    client.graceful_shutdown().await;
    server.graceful_shutdown().await;
}
