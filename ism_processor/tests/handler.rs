use ism_core::config::{ConfigKind, LmSettings, StateConfig};
use ism_core::{
    Config, KeyDefinition, Message, ProcessorState, ProcessorStatus, QueryStateMessage, Record, State, StateDirection,
};
use ism_mq::{Consumer, ConsumerConfig, MemoryRouteFactory, MonitorPublisher, Router, RoutingConfig};
use ism_processor::storage::{Processor, ProcessorProvider, Template};
use ism_processor::{
    ExecutionRequest, ExecutionResponse, Executor, FnExecutor, MemoryStorage, PoolConfig, ProcessorHandler,
    ProcessorStateQuery, ProcessorStateRouteStorage, ProcessorStorage, StateStorage, TemplateStorage, WorkerPool,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ROUTES: &str = r#"
messageConfig:
  routes:
    - {selector: processor/input, subject: ism.input}
    - {selector: processor/forward, subject: ism.forward}
    - {selector: processor/monitor, subject: ism.monitor}
"#;

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

async fn seed(storage: &MemoryStorage) {
    storage
        .save_state(&State::new("animals", Config::new(StateConfig::default())))
        .await
        .unwrap();
    let output_config = Config::new(StateConfig {
        primary_key_definition: vec![KeyDefinition::required("animal")],
        ..Default::default()
    })
    .with_kind(ConfigKind::Lm(LmSettings {
        model_name: Some("zoo-model".into()),
        system_template_path: Some("facts-system".into()),
        ..Default::default()
    }));
    storage.save_state(&State::new("animal_facts", output_config)).await.unwrap();

    storage
        .insert_template(&Template::new("facts-user", "user_template", "Describe {animal}"))
        .await
        .unwrap();
    storage
        .insert_template(&Template::new("facts-system", "system_template", "You are a zoologist"))
        .await
        .unwrap();
    let mut provider = ProcessorProvider::new("chat", "Chat", "ChatProcessor");
    provider.user_template_id = Some("facts-user".into());
    storage.insert_processor_provider(&provider).await.unwrap();
    storage.insert_processor(&Processor::new("facts", "chat")).await.unwrap();

    for association in [
        ProcessorState::new("facts", "animals", StateDirection::Input),
        ProcessorState::new("facts", "animal_facts", StateDirection::Output),
        ProcessorState::new("summary", "animal_facts", StateDirection::Input),
    ] {
        storage.upsert_processor_state(&association).await.unwrap();
    }
}

#[tokio::test]
async fn test_messages_flow_through_processor_and_forward() {
    let _ = tracing_subscriber::fmt::try_init();
    let storage = MemoryStorage::new();
    seed(&storage).await;

    let factory = MemoryRouteFactory::default();
    let broker = factory.broker().clone();
    let router = Arc::new(Router::from_config(&RoutingConfig::from_yaml(ROUTES).unwrap(), Arc::new(factory)).unwrap());
    router.connect_all().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = seen.clone();
    let executor = FnExecutor::new(move |request: &ExecutionRequest| {
        observed.lock().unwrap().push((
            request.user_prompt.clone(),
            request.system_prompt.clone(),
            request.properties.get("model_name").cloned(),
        ));
        let animal = request.query_state["animal"].as_str().unwrap_or_default().to_owned();
        Ok(ExecutionResponse::new(json!({"fact": format!("{animal} is an animal")}).to_string()))
    })
    .into_dyn();

    let reporter = MonitorPublisher::new(router.find_route("processor/monitor").unwrap());
    let handler = ProcessorHandler::new(storage.clone(), executor, reporter.clone())
        .with_forwarding(router.clone(), "processor/forward");

    let batch = |route_id: &str, animals: &[&str]| {
        Message::QueryState(QueryStateMessage::new(
            route_id,
            animals.iter().map(|animal| record(json!({"animal": animal}))).collect(),
        ))
        .encode()
        .unwrap()
    };
    broker.enqueue("ism.input", batch("animals:facts", &["cat", "dog"]));
    broker.enqueue("ism.input", batch("animals:facts", &["cat"]));
    broker.enqueue("ism.input", batch("animals:missing", &["owl"]));

    let config = ConsumerConfig::default()
        .with_max_loops(3)
        .with_receive_wait(Duration::from_millis(10))
        .with_backoff(Duration::from_millis(1), Duration::from_millis(2));
    let mut consumer = Consumer::new(router.find_route("processor/input").unwrap(), handler, reporter, config);
    let stats = consumer.run().await.unwrap();
    assert_eq!((stats.received, stats.handled, stats.failed), (3, 2, 1));

    let output = storage.load_state("animal_facts", true).await.unwrap();
    assert_eq!(output.count(), 2);
    let cat = output.iter_query_states().next().unwrap();
    assert_eq!(cat["fact"], json!("cat is an animal"));
    assert_eq!(cat["user_prompt"], json!("Describe cat"));

    let calls = seen.lock().unwrap().clone();
    assert_eq!(calls.len(), 2, "the repeated cat is skipped");
    assert_eq!(
        calls[0],
        (
            "Describe cat".to_owned(),
            Some("You are a zoologist".to_owned()),
            Some(json!("zoo-model"))
        )
    );

    let input = storage
        .fetch_processor_state_route(&ProcessorStateQuery::RouteId {
            route_id: "animals:facts".into(),
            direction: StateDirection::Input,
        })
        .await
        .unwrap();
    assert_eq!(input[0].status, ProcessorStatus::Completed);
    // the second run restarted from a completed state
    assert_eq!(input[0].current_index, 1);
    assert_eq!(input[0].count, 2);

    let missing = storage
        .fetch_processor_state_route(&ProcessorStateQuery::RouteId {
            route_id: "animals:missing".into(),
            direction: StateDirection::Input,
        })
        .await
        .unwrap();
    assert_eq!(missing[0].status, ProcessorStatus::Failed);

    // only the first batch produced new rows
    assert_eq!(broker.depth("ism.forward"), 1);
    let forwarded = router
        .find_route("processor/forward")
        .unwrap()
        .consume(Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    let Message::QueryState(forwarded) = Message::decode(&forwarded.payload).unwrap() else {
        panic!("expected query state");
    };
    assert_eq!(forwarded.route_id, "animal_facts:summary");
    assert_eq!(forwarded.query_state.len(), 2);

    assert_eq!(broker.depth("ism.monitor"), 9);
    router.disconnect_all().await;
}

#[tokio::test]
async fn test_terminated_route_is_refused() {
    let storage = MemoryStorage::new();
    seed(&storage).await;
    let mut terminated = ProcessorState::new("facts", "animals", StateDirection::Input);
    terminated.transition(ProcessorStatus::Terminate).unwrap();
    storage.upsert_processor_state(&terminated).await.unwrap();

    let executor = FnExecutor::new(|_: &ExecutionRequest| Ok(ExecutionResponse::new("{}"))).into_dyn();
    let mut handler = ProcessorHandler::new(storage.clone(), executor, MonitorPublisher::disabled());
    let message = QueryStateMessage::new("animals:facts", vec![record(json!({"animal": "cat"}))]);
    let err = ism_mq::MessageHandler::handle(&mut handler, &message).await.unwrap_err();
    assert!(err.to_string().contains("terminated"));
    assert!(storage.load_state("animal_facts", true).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_route_stays_failed_until_reset() {
    let storage = MemoryStorage::new();
    seed(&storage).await;
    let mut failed = ProcessorState::new("facts", "animals", StateDirection::Input);
    for status in [ProcessorStatus::Running, ProcessorStatus::Failed] {
        failed.transition(status).unwrap();
    }
    storage.upsert_processor_state(&failed).await.unwrap();

    let executor = FnExecutor::new(|_: &ExecutionRequest| Ok(ExecutionResponse::new(r#"{"fact": "purrs"}"#))).into_dyn();
    let mut handler = ProcessorHandler::new(storage.clone(), executor, MonitorPublisher::disabled());
    let message = QueryStateMessage::new("animals:facts", vec![record(json!({"animal": "cat"}))]);

    let err = ism_mq::MessageHandler::handle(&mut handler, &message).await.unwrap_err();
    assert!(format!("{err:#}").contains("from FAILED to RUNNING"), "{err:#}");
    let query = ProcessorStateQuery::RouteId {
        route_id: "animals:facts".into(),
        direction: StateDirection::Input,
    };
    let stored = storage.fetch_processor_state_route(&query).await.unwrap();
    assert_eq!(stored[0].status, ProcessorStatus::Failed);
    assert!(storage.load_state("animal_facts", true).await.unwrap().is_empty());

    let reset = storage
        .reset_processor_state("animals:facts", StateDirection::Input)
        .await
        .unwrap();
    assert_eq!(reset.status, ProcessorStatus::Created);
    ism_mq::MessageHandler::handle(&mut handler, &message).await.unwrap();
    let stored = storage.fetch_processor_state_route(&query).await.unwrap();
    assert_eq!(stored[0].status, ProcessorStatus::Completed);
    assert_eq!(storage.load_state("animal_facts", true).await.unwrap().count(), 1);
}

#[tokio::test]
async fn test_pooled_handler_writes_every_row() {
    let storage = MemoryStorage::new();
    seed(&storage).await;
    let executor = FnExecutor::new(|request: &ExecutionRequest| {
        let animal = request.query_state["animal"].as_str().unwrap_or_default().to_owned();
        Ok(ExecutionResponse::new(json!({"fact": format!("{animal} is fast")}).to_string()))
    })
    .into_dyn();
    let pool = Arc::new(WorkerPool::new(PoolConfig {
        workers: 3,
        ..Default::default()
    }));
    let mut handler =
        ProcessorHandler::new(storage.clone(), executor, MonitorPublisher::disabled()).with_pool(pool.clone());
    let animals = ["cat", "dog", "owl", "fox", "elk"];
    let message = QueryStateMessage::new(
        "animals:facts",
        animals.iter().map(|animal| record(json!({"animal": animal}))).collect(),
    );

    ism_mq::MessageHandler::handle(&mut handler, &message).await.unwrap();

    let output = storage.load_state("animal_facts", true).await.unwrap();
    let mut written: Vec<String> = output
        .iter_query_states()
        .map(|row| row["animal"].as_str().unwrap().to_owned())
        .collect();
    written.sort();
    assert_eq!(written, ["cat", "dog", "elk", "fox", "owl"]);
    let query = ProcessorStateQuery::RouteId {
        route_id: "animals:facts".into(),
        direction: StateDirection::Input,
    };
    let stored = storage.fetch_processor_state_route(&query).await.unwrap();
    assert_eq!(stored[0].status, ProcessorStatus::Completed);

    drop(handler);
    Arc::try_unwrap(pool).ok().unwrap().shutdown().await;
}
