use lib_realtime::protocol::{Action, Topic};
use lib_realtime::{ErrorEvent, RuntimeError};
use project_tests::{drain, expect, fast_config, msg, next, FakeServer};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_pattern_subscriber_receives_one_delivery() {
    let mut server = FakeServer::new();
    let (client, mut peer) = server.logged_in(fast_config()).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .event()
        .listen("event/.*", Arc::new(move |name: &str, payload: &Value| {
            let _ = tx.send((name.to_string(), payload.clone()));
        }))
        .unwrap();
    let subscribe = expect(&mut peer, Topic::Event, Action::Subscribe).await;
    assert_eq!(subscribe.part(0), "event/.*");

    peer.send(&msg(Topic::Event, Action::Event, ["event/foo", "O[42,\"x\"]"]));
    let (name, payload) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(name, "event/foo");
    assert_eq!(payload, json!([42, "x"]));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "delivered more than once");
    client.close();
}

#[tokio::test]
async fn test_emit_goes_out_typed() {
    let mut server = FakeServer::new();
    let (client, mut peer) = server.logged_in(fast_config()).await;

    client.event().emit("event/nobody-listens", json!(["An event just happened", 1.5])).unwrap();
    let sent = next(&mut peer).await;
    assert_eq!(sent, msg(Topic::Event, Action::Event, ["event/nobody-listens", "O[\"An event just happened\",1.5]"]));
    client.close();
}

#[tokio::test]
async fn test_handler_panic_is_reported_and_delivery_continues() {
    let mut server = FakeServer::new();
    let (client, mut peer) = server.logged_in(fast_config()).await;

    let errors: Arc<Mutex<Vec<RuntimeError>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    client.set_runtime_error_handler(move |e: &RuntimeError| sink.lock().unwrap().push(e.clone()));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.event().listen("a/.*", Arc::new(|_: &str, _: &Value| panic!("bad handler"))).unwrap();
    client
        .event()
        .listen("a/.*", Arc::new(move |name: &str, _: &Value| {
            let _ = tx.send(name.to_string());
        }))
        .unwrap();
    drain(&mut peer);

    peer.send(&msg(Topic::Event, Action::Event, ["a/1", "L"]));
    let name = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(name, "a/1");

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].event(), &ErrorEvent::HandlerException);
    drop(errors);
    client.close();
}

#[tokio::test]
async fn test_malformed_frame_does_not_stop_the_rest() {
    let mut server = FakeServer::new();
    let (client, peer) = server.logged_in(fast_config()).await;

    let errors: Arc<Mutex<Vec<RuntimeError>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    client.set_runtime_error_handler(move |e: &RuntimeError| sink.lock().unwrap().push(e.clone()));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .event()
        .listen("ok", Arc::new(move |_: &str, payload: &Value| {
            let _ = tx.send(payload.clone());
        }))
        .unwrap();

    peer.send_raw("Q\u{1f}NOPE\u{1e}E\u{1f}EVT\u{1f}ok\u{1f}N7\u{1e}");
    let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload, json!(7));
    assert_eq!(errors.lock().unwrap()[0].event(), &ErrorEvent::MessageParseError);
    client.close();
}
