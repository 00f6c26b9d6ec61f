use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use serde_json::{Value, json};
use tokio::signal;

use lib_realtime::core::rpc_broker::RpcResponse;
use lib_realtime::loggers::{parse_level, setup_logging};
use lib_realtime::{ConnectionState, RealtimeClient, RuntimeError};

mod publisher_logic;
use publisher_logic::config::{self, Config};
use publisher_logic::provider::{FaultInjector, Outcome};
use publisher_logic::tasks::PublishTasks;

const RPC_NAME: &str = "add-numbers";

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn listen_records(client: &RealtimeClient, config: &Config, tasks: Arc<PublishTasks>) -> Result<()> {
    let pattern = config.record_pattern.as_deref().unwrap_or("record/.*");
    let publisher = client.clone();
    client.record().listen(
        pattern,
        Arc::new(move |subscription: &str, is_subscribed: bool| {
            if !is_subscribed {
                log::info!("Record {} no longer has subscribers", subscription);
                tasks.stop(subscription);
                return;
            }
            log::info!("Record {} just subscribed", subscription);
            let client = publisher.clone();
            let name = subscription.to_string();
            tasks.start(subscription, move |count| {
                let data = json!({ "timer": now_seconds(), "id": name, "count": count });
                log::info!("Setting record {} to {}", name, data);
                if let Err(e) = client.record().set(&name, data) {
                    log::warn!("Could not set record {}: {}", name, e);
                }
            });
        }),
    )?;
    Ok(())
}

fn listen_events(client: &RealtimeClient, config: &Config, tasks: Arc<PublishTasks>) -> Result<()> {
    let pattern = config.event_pattern.as_deref().unwrap_or("event/.*");
    let publisher = client.clone();
    client.event().listen_subscriptions(
        pattern,
        Arc::new(move |subscription: &str, is_subscribed: bool| {
            if !is_subscribed {
                log::info!("Event {} no longer has subscribers", subscription);
                tasks.stop(subscription);
                return;
            }
            log::info!("Event {} just subscribed", subscription);
            let client = publisher.clone();
            let name = subscription.to_string();
            tasks.start(subscription, move |_| {
                let data = json!(["An event just happened", now_seconds()]);
                log::info!("Emitting event {} {}", name, data);
                if let Err(e) = client.event().emit(&name, data) {
                    log::warn!("Could not emit event {}: {}", name, e);
                }
            });
        }),
    )?;
    Ok(())
}

fn provide_rpc(client: &RealtimeClient, injector: FaultInjector) {
    if injector.is_active() {
        log::warn!("Fault injection enabled for {}: {:?}", RPC_NAME, injector);
    }
    client.rpc().provide(
        RPC_NAME,
        Arc::new(move |name: &str, payload: Value, response: RpcResponse| {
            log::info!("Got an RPC request {} {}", name, payload);
            match injector.handle(&payload) {
                Outcome::Send(value) => {
                    response.send(value);
                }
                Outcome::Reject => {
                    log::info!("Rejecting {} request on purpose", name);
                    response.reject();
                }
                Outcome::Error(message) => {
                    log::warn!("Bad {} request: {}", name, message);
                    response.error(&message);
                }
                Outcome::Silence => log::info!("This intentionally randomly failed"),
            }
        }),
    );
}

async fn write_with_ack(client: &RealtimeClient, record: &str) {
    match client.record().set_with_ack(record, "number", json!(2)).await {
        Ok(()) => log::info!("Record {} set successfully with ack", record),
        Err(e) => log::warn!("Record {} wasn't able to be set: {}", record, e),
    }
}

async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = config::load_config();
    let level = parse_level(config.log_level.as_deref().unwrap_or("info"));
    if let Some(path) = setup_logging("publisher", config.log_dir.as_deref(), level)? {
        log::info!("Logging to {}", path.display());
    }

    let client_config = config.client_config()?;
    log::info!("{}", client_config);
    let client = RealtimeClient::new(client_config);

    client.add_connection_change_listener(|old: ConnectionState, new: ConnectionState| {
        log::info!("Connection state changed: {:?} -> {:?}", old, new);
    });
    client.set_runtime_error_handler(|error: &RuntimeError| {
        log::error!("Runtime error: {}", error);
    });

    let username = config.username.clone().unwrap_or_else(|| "Publisher".to_string());
    let login = client.login(&json!({ "username": username })).await;
    if !login.logged_in() {
        let event = login.error_event().map(|e| e.to_string()).unwrap_or_default();
        log::error!("Provider failed to login: {} {}", event, login.error_message().unwrap_or(""));
        client.close();
        bail!("login failed: {}", event);
    }
    log::info!("Provider login success");

    let interval = Duration::from_millis(config.publish_interval_ms.unwrap_or(5000));
    let record_tasks = Arc::new(PublishTasks::new("record", interval));
    let event_tasks = Arc::new(PublishTasks::new("event", interval));

    listen_events(&client, &config, Arc::clone(&event_tasks))?;
    listen_records(&client, &config, Arc::clone(&record_tasks))?;
    provide_rpc(
        &client,
        FaultInjector::new(
            config.reject_probability.unwrap_or(0.0),
            config.silence_probability.unwrap_or(0.0),
        ),
    );

    if let Some(record) = config.ack_record.as_deref() {
        write_with_ack(&client, record).await;
    }

    wait_for_shutdown().await;

    record_tasks.stop_all();
    event_tasks.stop_all();
    client.close();

    log::info!("Shutdown complete.");
    Ok(())
}
