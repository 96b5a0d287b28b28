use eyre::Result;
use ism_core::{Message, ProcessorStatus, QueryStateMessage};
use ism_mq::{
    Consumer, ConsumerConfig, MemoryBroker, MemoryRoute, MessageHandler, RecordingReporter,
    RouteConfig, RouteDyn,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct CollectingHandler {
    seen: Vec<QueryStateMessage>,
    fail_on: Option<String>,
}

impl MessageHandler for CollectingHandler {
    async fn handle(&mut self, message: &QueryStateMessage) -> Result<()> {
        if self.fail_on.as_deref() == Some(message.route_id.as_str()) {
            eyre::bail!("handler refused {}", message.route_id);
        }
        self.seen.push(message.clone());
        Ok(())
    }
}

fn fast_config(max_loops: u64) -> ConsumerConfig {
    ConsumerConfig::default()
        .with_max_loops(max_loops)
        .with_receive_wait(Duration::from_millis(5))
        .with_backoff(Duration::from_millis(1), Duration::from_millis(4))
}

async fn connected_route(broker: &MemoryBroker) -> Arc<dyn RouteDyn> {
    let route: Arc<dyn RouteDyn> = Arc::new(MemoryRoute::new(
        RouteConfig::new("processor/input", "ism.input"),
        broker.clone(),
    ));
    route.connect().await.unwrap();
    route
}

fn query_state(route_id: &str) -> Vec<u8> {
    Message::QueryState(QueryStateMessage::new(
        route_id,
        vec![json!({"animal": "cat"}).as_object().cloned().unwrap()],
    ))
    .encode()
    .unwrap()
}

#[tokio::test]
async fn test_malformed_message_fails_acks_and_continues() {
    let _ = tracing_subscriber::fmt::try_init();
    let broker = MemoryBroker::new();
    let route = connected_route(&broker).await;
    broker.enqueue("ism.input", b"{not json".to_vec());
    broker.enqueue(
        "ism.input",
        json!({"type": "query_state", "route_id": "s:p", "query_state": null})
            .to_string()
            .into_bytes(),
    );
    broker.enqueue("ism.input", query_state("s:p"));

    let reporter = RecordingReporter::new();
    let mut consumer = Consumer::new(route, CollectingHandler::default(), reporter.clone(), fast_config(3));
    let stats = consumer.run().await.unwrap();

    assert_eq!(stats.received, 3);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.handled, 1);
    assert_eq!(broker.in_flight(), 0, "every delivery is acknowledged");
    assert_eq!(consumer.handler().seen.len(), 1);

    let events = reporter.events();
    assert_eq!(events[0].status, ProcessorStatus::Failed);
    assert!(events[0].exception.as_deref().unwrap().contains("Invalid JSON"));
    assert_eq!(events[0].data, Some(json!("{not json")));
    assert_eq!(events[1].status, ProcessorStatus::Failed);
    assert_eq!(events[1].route_id, "s:p");
    assert_eq!(
        reporter.statuses()[2..],
        [ProcessorStatus::Queued, ProcessorStatus::Running, ProcessorStatus::Completed]
    );
}

#[tokio::test]
async fn test_handler_error_reports_failure_with_data() {
    let broker = MemoryBroker::new();
    let route = connected_route(&broker).await;
    broker.enqueue("ism.input", query_state("bad:p"));
    broker.enqueue("ism.input", query_state("good:p"));

    let reporter = RecordingReporter::new();
    let handler = CollectingHandler {
        fail_on: Some("bad:p".into()),
        ..Default::default()
    };
    let mut consumer = Consumer::new(route, handler, reporter.clone(), fast_config(2));
    let stats = consumer.run().await.unwrap();
    assert_eq!((stats.handled, stats.failed), (1, 1));

    let failure = reporter
        .events()
        .into_iter()
        .find(|event| event.status == ProcessorStatus::Failed)
        .unwrap();
    assert_eq!(failure.route_id, "bad:p");
    assert!(failure.exception.unwrap().contains("handler refused bad:p"));
    assert_eq!(failure.data, Some(json!([{"animal": "cat"}])));
}

#[tokio::test]
async fn test_empty_polls_back_off_until_max_loops() {
    let broker = MemoryBroker::new();
    let route = connected_route(&broker).await;
    let mut consumer = Consumer::new(route, CollectingHandler::default(), RecordingReporter::new(), fast_config(4));
    let stats = consumer.run().await.unwrap();
    assert_eq!(stats.loops, 4);
    assert_eq!(stats.empty_polls, 4);
    assert_eq!(stats.received, 0);
}

#[tokio::test]
async fn test_disconnected_route_stops_loop() {
    let broker = MemoryBroker::new();
    let route = connected_route(&broker).await;
    route.disconnect().await.unwrap();
    let mut consumer = Consumer::new(route, CollectingHandler::default(), RecordingReporter::new(), fast_config(10));
    let err = consumer.run().await.unwrap_err();
    assert!(format!("{err:#}").contains("disconnected"));
    assert_eq!(consumer.stats().loops, 1);
}

#[tokio::test]
async fn test_shutdown_handle_stops_loop() {
    let broker = MemoryBroker::new();
    let route = connected_route(&broker).await;
    let mut consumer = Consumer::new(
        route,
        CollectingHandler::default(),
        RecordingReporter::new(),
        ConsumerConfig::default().with_receive_wait(Duration::from_millis(5)),
    );
    let handle = consumer.shutdown_handle();
    let task = tokio::spawn(async move { consumer.run().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.shutdown();
    let stats = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(stats.loops >= 1);
}
