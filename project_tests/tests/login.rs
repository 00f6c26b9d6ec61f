use lib_realtime::core::ConnectionState;
use lib_realtime::protocol::{Action, Topic};
use lib_realtime::ErrorEvent;
use project_tests::{expect, fast_config, msg, FakeServer};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn test_login_sends_credentials_and_reports_states() {
    let mut server = FakeServer::new();
    let client = server.client(fast_config());
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    client.add_connection_change_listener(move |_, new| sink.lock().unwrap().push(new));

    let login = tokio::spawn({
        let client = client.clone();
        async move { client.login(&json!({"username": "Publisher"})).await }
    });
    let mut peer = server.accept().await;
    let auth = FakeServer::accept_auth(&mut peer).await;
    assert_eq!(auth.part(0), r#"{"username":"Publisher"}"#);

    assert!(login.await.unwrap().logged_in());
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::AwaitingAuthentication,
            ConnectionState::Authenticating,
            ConnectionState::Open,
        ]
    );
    client.close();
    assert_eq!(client.connection_state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_refused_credentials() {
    let mut server = FakeServer::new();
    let client = server.client(fast_config());
    let login = tokio::spawn({
        let client = client.clone();
        async move { client.login(&json!({"username": "nobody"})).await }
    });
    let mut peer = server.accept().await;
    expect(&mut peer, Topic::Auth, Action::Request).await;
    peer.send(&msg(Topic::Auth, Action::Error, ["INVALID_AUTH_DATA", "Sinvalid user"]));

    let result = login.await.unwrap();
    assert!(!result.logged_in());
    assert_eq!(result.error_event(), Some(&ErrorEvent::InvalidAuthData));
    assert_eq!(client.connection_state(), ConnectionState::Error);
}

#[tokio::test]
async fn test_silent_server_times_out_login() {
    let mut server = FakeServer::new();
    let client = server.client(fast_config());
    let login = tokio::spawn({
        let client = client.clone();
        async move { client.login(&json!({})).await }
    });
    let mut peer = server.accept().await;
    expect(&mut peer, Topic::Auth, Action::Request).await;

    let result = login.await.unwrap();
    assert!(!result.logged_in());
    assert_eq!(result.error_event(), Some(&ErrorEvent::ConnectionError));
    assert_eq!(client.connection_state(), ConnectionState::Error);
}

#[tokio::test]
async fn test_login_after_error_retries() {
    let mut server = FakeServer::new();
    server.connector.set_refusing(true);
    let client = server.client(fast_config());
    assert!(!client.login(&json!({})).await.logged_in());

    server.connector.set_refusing(false);
    let login = tokio::spawn({
        let client = client.clone();
        async move { client.login(&json!({})).await }
    });
    let mut peer = server.accept().await;
    FakeServer::accept_auth(&mut peer).await;
    assert!(login.await.unwrap().logged_in());
    client.close();
}
