//! ---
//! vdev_section: "15-testing-qa"
//! vdev_subsection: "tests"
//! vdev_type: "source"
//! vdev_scope: "test"
//! vdev_description: "Encrypted exchanges between devices sharing a key."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use vdev_core::{
    compose_tx_message, DeliveryBudget, DeviceStateStore, EngineHandle, EngineMode, ProtocolEngine,
};
use vdev_logging::{memory_sink, LogLevel, MemorySink};
use vdev_msg::{InMemoryBroker, MessageCodec};
use vdev_schema::{AttributeSchema, AttributeValue};
use vdev_security::{build_cipher, CipherScheme, SharedCipher};
use vdev_tests::{json_of, WAIT};


fn schema() -> Arc<AttributeSchema> {
    Arc::new(
        AttributeSchema::compile(&json!([
            {"name": "f_bool", "type": "Boolean"},
            {"name": "f_str", "type": "String"}
        ]))
        .expect("schema"),
    )
}

fn cipher(scheme: CipherScheme, key: &str) -> SharedCipher {
    build_cipher(scheme, key).expect("cipher")
}

async fn spawn_device(
    broker: &InMemoryBroker,
    client: &str,
    cipher: SharedCipher,
    mode: EngineMode,
    loop_mode: bool,
) -> (EngineHandle, Arc<MemorySink>) {
    let schema = schema();
    let (sink, memory) = memory_sink();
    let handle = ProtocolEngine::new(
        "dev-enc",
        MessageCodec::new(schema.clone(), Some(cipher)),
        Arc::new(DeviceStateStore::new(schema)),
        Arc::new(broker.client(client)),
        mode,
    )
    .with_loop_mode(loop_mode)
    .with_sink(sink)
    .start()
    .await
    .expect("engine start");
    (handle, memory)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aes_ccm_pair_exchanges_sealed_messages() {
    let broker = InMemoryBroker::new();
    let key = cipher(CipherScheme::AesCcm, "shared-secret");
    let (device, _) = spawn_device(
        &broker,
        "device",
        key.clone(),
        EngineMode::Subscribe,
        false,
    )
    .await;

    let (sink, _) = memory_sink();
    let payload =
        compose_tx_message(&["f_str=\"sealed\"", "f_bool=true"], &*sink).expect("compose");
    let (sender, _) = spawn_device(
        &broker,
        "sender",
        key.clone(),
        EngineMode::PublishOnce(payload),
        true,
    )
    .await;
    assert!(sender.wait_for_delivery(DeliveryBudget::default()).await);

    let request = broker.published_on("/dev-enc/p2d");
    assert_eq!(request.len(), 1);
    assert!(serde_json::from_slice::<Value>(&request[0].payload).is_err());

    let replies = broker.wait_for("/dev-enc/d2p", 1, WAIT).await;
    assert_eq!(replies.len(), 1);
    let opened = key.decrypt(&replies[0].payload).expect("decrypt reply");
    assert_eq!(
        json_of(&opened),
        json!({"DATA": [{"f_str": "sealed", "f_bool": true}]})
    );
    assert_eq!(
        device.store().get("f_str"),
        Some(AttributeValue::from("sealed"))
    );

    sender.stop().await.expect("stop");
    let metrics = device.stop().await.expect("stop");
    assert_eq!(metrics.received, 1);
    assert_eq!(metrics.dropped, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identical_requests_produce_distinct_aes_ciphertexts() {
    let broker = InMemoryBroker::new();
    let key = cipher(CipherScheme::AesCcm, "shared-secret");
    let (device, _) =
        spawn_device(&broker, "device", key.clone(), EngineMode::Subscribe, false).await;

    let request = json!({"DATA": {"f_bool": "?"}}).to_string();
    broker.inject("/dev-enc/p2d", key.encrypt(request.as_bytes()).expect("encrypt"));
    broker.inject("/dev-enc/p2d", key.encrypt(request.as_bytes()).expect("encrypt"));

    let replies = broker.wait_for("/dev-enc/d2p", 2, WAIT).await;
    assert_eq!(replies.len(), 2);
    assert_ne!(replies[0].payload, replies[1].payload);
    for reply in &replies {
        let opened = key.decrypt(&reply.payload).expect("decrypt reply");
        assert_eq!(json_of(&opened), json!({"DATA": [{"f_bool": false}]}));
    }
    device.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mismatched_keys_drop_every_message() {
    let broker = InMemoryBroker::new();
    let (device, memory) = spawn_device(
        &broker,
        "device",
        cipher(CipherScheme::DesEcb, "right-key"),
        EngineMode::Subscribe,
        false,
    )
    .await;

    let wrong = cipher(CipherScheme::DesEcb, "wrong-key");
    let request = json!({"DATA": {"f_str": "hi"}}).to_string();
    broker.inject("/dev-enc/p2d", wrong.encrypt(request.as_bytes()).expect("encrypt"));
    broker.inject("/dev-enc/p2d", request);

    tokio::time::timeout(WAIT, async {
        while device.metrics().dropped < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both messages dropped");

    assert!(broker.published_on("/dev-enc/d2p").is_empty());
    assert_eq!(device.store().get("f_str"), Some(AttributeValue::from("-")));
    assert!(memory.at_least(LogLevel::Warn).len() >= 2);
    device.stop().await.expect("stop");
}
