// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use mqclient::{memory::MemoryBroker, ConsumerHandler, MqClient, MqError, Outcome};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time;

type Recorded = Arc<Mutex<Vec<String>>>;

fn recorder() -> (Recorded, Arc<dyn ConsumerHandler>) {
    let recorded: Recorded = Arc::default();
    let seen = recorded.clone();
    let handler = move |payload: &[u8]| {
        seen.lock()
            .unwrap()
            .push(String::from_utf8_lossy(payload).into_owned());
        Outcome::Accept
    };
    (recorded, Arc::new(handler))
}

fn snapshot(recorded: &Recorded) -> Vec<String> {
    recorded.lock().unwrap().clone()
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..400 {
        if check() {
            return;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

async fn client(broker: &MemoryBroker) -> MqClient {
    let mut cfg = mqclient::ClientConfig::default();
    cfg.reconnect.first_ms = 1;
    cfg.reconnect.max_ms = 10;
    MqClient::builder(broker.connector())
        .config(cfg)
        .addresses(["mem:1"])
        .build()
        .await
}

#[tokio::test]
async fn test_orders_are_consumed_in_order_without_nack() {
    let broker = MemoryBroker::new();
    let (recorded, handler) = recorder();
    let client = client(&broker).await;
    client.register_handler("orders", handler).await;
    client.init().await.unwrap();

    for payload in [b"a", b"b", b"c"] {
        client.send("orders", payload, 0).await.unwrap();
    }
    client.start_consuming().await.unwrap();

    eventually(|| snapshot(&recorded).len() == 3).await;
    assert_eq!(snapshot(&recorded), vec!["a", "b", "c"]);
    assert_eq!(broker.accepted(), 3);
    assert_eq!(broker.rejected(), 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_messages_of_one_destination_keep_send_order() {
    let broker = MemoryBroker::new();
    let (recorded, handler) = recorder();
    let client = client(&broker).await;
    client.register_handler("events", handler).await;
    client.init().await.unwrap();
    client.start_consuming().await.unwrap();

    let expected: Vec<String> = (1..=50).map(|i| i.to_string()).collect();
    for payload in &expected {
        client.send("events", payload.as_bytes(), 0).await.unwrap();
    }

    eventually(|| snapshot(&recorded).len() == expected.len()).await;
    assert_eq!(snapshot(&recorded), expected);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_send_during_degraded_window_is_delivered_once() {
    let broker = MemoryBroker::new();
    let (recorded, handler) = recorder();
    let client = client(&broker).await;
    client.register_handler("orders", handler).await;
    client.init().await.unwrap();
    client.start_consuming().await.unwrap();
    eventually(|| broker.receivers_created() == 1).await;

    broker.sever();
    broker.fail_next_dials(1);
    client.send("orders", b"during-outage", 0).await.unwrap();

    eventually(|| snapshot(&recorded).len() == 1).await;
    time::sleep(Duration::from_millis(50)).await;

    assert_eq!(snapshot(&recorded), vec!["during-outage"]);
    assert_eq!(client.recoveries(), 1);
    assert_eq!(client.generation(), 2);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_many_failing_consumers_trigger_one_recovery() {
    let broker = MemoryBroker::new();
    let client = client(&broker).await;
    let destinations = ["q1", "q2", "q3", "q4", "q5"];
    for destination in destinations {
        let (_, handler) = recorder();
        client.register_handler(destination, handler).await;
    }
    client.init().await.unwrap();
    client.start_consuming().await.unwrap();
    eventually(|| broker.receivers_created() == destinations.len()).await;

    broker.sever();
    eventually(|| broker.receivers_created() == 2 * destinations.len()).await;
    time::sleep(Duration::from_millis(30)).await;

    assert_eq!(client.recoveries(), 1);
    assert_eq!(client.generation(), 2);
    assert!(client.is_consuming().await);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_rejected_message_is_redelivered_and_never_double_settled() {
    let broker = MemoryBroker::new();
    let attempts = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen = attempts.clone();
    let handler = move |payload: &[u8]| {
        let mut seen = seen.lock().unwrap();
        let payload = String::from_utf8_lossy(payload).into_owned();
        let first_try = !seen.contains(&payload);
        seen.push(payload.clone());
        Outcome::from(!(payload == "flaky" && first_try))
    };

    let client = client(&broker).await;
    client.register_handler("jobs", Arc::new(handler)).await;
    client.init().await.unwrap();
    client.send("jobs", b"flaky", 0).await.unwrap();
    client.send("jobs", b"steady", 0).await.unwrap();
    client.start_consuming().await.unwrap();

    eventually(|| broker.accepted() == 2).await;

    assert_eq!(broker.rejected(), 1);
    assert_eq!(
        attempts.lock().unwrap().clone(),
        vec!["flaky", "flaky", "steady"]
    );
    assert_eq!(broker.queue_depth("jobs"), 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_failover_remembers_reachable_address() {
    let broker = MemoryBroker::new();
    broker.set_unreachable("down:1", true);
    broker.set_unreachable("down:2", true);
    let client = MqClient::builder(broker.connector())
        .addresses(["down:1", "down:2", "mem:1"])
        .build()
        .await;

    client.init().await.unwrap();

    assert_eq!(client.current_address_index(), 2);
    assert_eq!(client.generation(), 1);
}

#[tokio::test]
async fn test_prefetch_reaches_receivers() {
    let broker = MemoryBroker::new();
    let (_, handler) = recorder();
    let client = MqClient::builder(broker.connector())
        .addresses(["mem:1"])
        .prefetch(4)
        .register_handler("orders", handler)
        .build()
        .await;
    client.init().await.unwrap();
    client.start_consuming().await.unwrap();

    eventually(|| broker.receivers_created() == 1).await;
    assert_eq!(broker.last_prefetch(), 4);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_delayed_send_is_held_back() {
    let broker = MemoryBroker::new();
    let (recorded, handler) = recorder();
    let client = client(&broker).await;
    client.register_handler("reminders", handler).await;
    client.init().await.unwrap();
    client.start_consuming().await.unwrap();

    client.send("reminders", b"later", 80).await.unwrap();
    time::sleep(Duration::from_millis(20)).await;
    assert!(snapshot(&recorded).is_empty());

    eventually(|| snapshot(&recorded).len() == 1).await;

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_close_stops_consumers() {
    let broker = MemoryBroker::new();
    let (_, handler) = recorder();
    let client = client(&broker).await;
    client.register_handler("orders", handler).await;
    client.init().await.unwrap();
    client.start_consuming().await.unwrap();
    assert!(client.is_consuming().await);

    client.close().await.unwrap();

    assert!(!client.is_consuming().await);
    assert_eq!(client.recoveries(), 0);
    assert_eq!(client.send("orders", b"x", 0).await, Err(MqError::Stopped));
}
