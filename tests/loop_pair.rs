//! ---
//! vdev_section: "15-testing-qa"
//! vdev_subsection: "tests"
//! vdev_type: "source"
//! vdev_scope: "test"
//! vdev_description: "Two devices sharing one id, one of them in loop mode."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use vdev_core::{
    compose_tx_message, DeliveryBudget, DeviceStateStore, EngineHandle, EngineMode, ProtocolEngine,
};
use vdev_logging::memory_sink;
use vdev_msg::{InMemoryBroker, MessageCodec};
use vdev_schema::{AttributeSchema, AttributeValue};
use vdev_sim::{Counter, TrafficScheduler};
use vdev_tests::{json_of, WAIT};

const DEVICE: &str = "dev-7";

fn schema() -> Arc<AttributeSchema> {
    Arc::new(
        AttributeSchema::compile(&json!([
            {"name": "f_num", "type": "Number"},
            {"name": "f_str", "type": "String"},
            {"name": "f_enum", "type": ["off", "on"]}
        ]))
        .expect("schema"),
    )
}

async fn spawn_device(
    broker: &InMemoryBroker,
    client: &str,
    mode: EngineMode,
    loop_mode: bool,
) -> EngineHandle {
    let schema = schema();
    let (sink, _) = memory_sink();
    ProtocolEngine::new(
        DEVICE,
        MessageCodec::new(schema.clone(), None),
        Arc::new(DeviceStateStore::new(schema)),
        Arc::new(broker.client(client)),
        mode,
    )
    .with_loop_mode(loop_mode)
    .with_sink(sink)
    .start()
    .await
    .expect("engine start")
}

async fn eventually(handle: &EngineHandle, name: &str, expected: AttributeValue) {
    tokio::time::timeout(WAIT, async {
        while handle.store().get(name).as_ref() != Some(&expected) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{name} never became {expected:?}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn platform_request_reaches_both_devices() {
    let broker = InMemoryBroker::new();
    let device = spawn_device(&broker, "device", EngineMode::Subscribe, false).await;
    let platform = spawn_device(&broker, "platform", EngineMode::Subscribe, true).await;

    broker.inject("/dev-7/p2d", json!({"DATA": {"f_str": "ping"}}).to_string());
    eventually(&device, "f_str", AttributeValue::from("ping")).await;
    eventually(&platform, "f_str", AttributeValue::from("ping")).await;

    // The loop-mode side never answers, so each topic carries exactly one message.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.published_on("/dev-7/p2d").len(), 1);
    assert_eq!(broker.published_on("/dev-7/d2p").len(), 1);

    assert_eq!(platform.stop().await.expect("stop").sent, 0);
    assert_eq!(device.stop().await.expect("stop").sent, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loop_mode_publish_once_drives_the_device() {
    let broker = InMemoryBroker::new();
    let device = spawn_device(&broker, "device", EngineMode::Subscribe, false).await;

    let (sink, _) = memory_sink();
    let payload = compose_tx_message(&["f_enum=\"on\"", "f_num=3"], &*sink).expect("compose");
    let sender =
        spawn_device(&broker, "sender", EngineMode::PublishOnce(payload), true).await;
    assert!(sender.wait_for_delivery(DeliveryBudget::default()).await);

    eventually(&device, "f_enum", AttributeValue::from("on")).await;
    eventually(&device, "f_num", AttributeValue::from(3i64)).await;

    let sent = broker.published_on("/dev-7/p2d");
    assert_eq!(sent.len(), 1);
    assert_eq!(
        json_of(&sent[0].payload),
        json!({"DATA": [{"f_enum": "on", "f_num": 3}]})
    );
    let echoed = broker.wait_for("/dev-7/d2p", 1, WAIT).await;
    assert_eq!(
        json_of(&echoed[0].payload),
        json!({"DATA": [{"f_enum": "on", "f_num": 3}]})
    );

    sender.stop().await.expect("stop");
    device.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loop_mode_stream_feeds_the_device() {
    let broker = InMemoryBroker::new();
    let device = spawn_device(&broker, "device", EngineMode::Subscribe, false).await;
    let scheduler = TrafficScheduler::new(vec![Box::new(Counter::new("f_num", 0.02))]);
    let streamer = spawn_device(
        &broker,
        "streamer",
        EngineMode::PublishStream(scheduler),
        true,
    )
    .await;

    let echoed = broker.wait_for("/dev-7/d2p", 3, WAIT).await;
    assert!(echoed.len() >= 3);
    let counts: Vec<Value> = echoed[..3]
        .iter()
        .map(|message| json_of(&message.payload)["DATA"][0]["f_num"].clone())
        .collect();
    assert_eq!(counts, [json!(0), json!(1), json!(2)]);

    let streamed = streamer.stop().await.expect("stop");
    assert!(streamed.sent >= 3);
    assert!(device.metrics().received >= 3);
    device.stop().await.expect("stop");
}
