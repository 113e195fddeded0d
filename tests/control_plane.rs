//! Integration tests for the two HTTP control planes.
//!
//! Each test binds a router on an ephemeral port and exercises it with a
//! real HTTP client, the same way the opposite side of a session would.
//! Nothing here touches a hypervisor; the handlers that shell out do so
//! with harmless or non-existent targets.

use std::time::Duration;

use glasshouse::config::AgentConfig;
use glasshouse::control::client::ClientControl;
use glasshouse::control::guest::GuestControl;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn serve(router: axum::Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    addr
}

fn agent_config() -> AgentConfig {
    // Long keepalive timeout so the watchdog can never fire mid-test.
    serde_json::from_str(
        r#"{
            "host_ip": "127.0.0.1",
            "display_host_path": "lg-host.exe",
            "keepalive_timeout": 600.0,
            "watcher_exe": "no-such-watcher.exe"
        }"#,
    )
    .unwrap()
}

fn http() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Client side: /ready and the readiness token
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ready_token_is_one_shot_idempotent() {
    let control = ClientControl::new(0, "display.exe");
    let addr = serve(control.clone().router()).await;
    let client = http();

    assert!(!control.is_ready());

    let first = client
        .get(format!("http://{addr}/ready"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(first, "Session is ready.");
    assert!(control.is_ready());

    // A duplicate token gets the same ack and changes nothing.
    let second = client
        .get(format!("http://{addr}/ready"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(second, "Session is ready.");
    assert!(control.is_ready());
}

#[tokio::test]
async fn readiness_unblocks_a_waiting_orchestrator() {
    let control = ClientControl::new(0, "display.exe");
    let addr = serve(control.clone().router()).await;

    let waiter = {
        let control = control.clone();
        tokio::spawn(async move { control.wait_ready().await })
    };

    http()
        .get(format!("http://{addr}/ready"))
        .send()
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("wait_ready must return once the token arrives")
        .unwrap();
}

// ---------------------------------------------------------------------------
// Guest side: launch, teardown and liveness endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execute_acknowledges_without_waiting_for_the_command() {
    let addr = serve(GuestControl::new(agent_config()).router()).await;

    let body = http()
        .post(format!("http://{addr}/execute"))
        .form(&[("command", "true")])
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "Command 'true' will be executed.");
}

#[tokio::test]
async fn execute_rejects_an_empty_command() {
    let addr = serve(GuestControl::new(agent_config()).router()).await;

    let body = http()
        .post(format!("http://{addr}/execute"))
        .form(&[("command", "")])
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "No command provided.");
}

#[tokio::test]
async fn cancel_and_stop_ack_with_their_verbs() {
    let addr = serve(GuestControl::new(agent_config()).router()).await;
    let client = http();

    let cancel = client
        .post(format!("http://{addr}/cancel"))
        .form(&[("exes", "")])
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(cancel, "Cancelled");

    let stop = client
        .post(format!("http://{addr}/stop"))
        .form(&[("exes", "")])
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(stop, "Stopped");
}

#[tokio::test]
async fn disconnected_acks_and_accepts_a_replacement_timer() {
    let addr = serve(GuestControl::new(agent_config()).router()).await;
    let client = http();

    // Timeouts far in the future: the timers must never fire in-test.
    let first = client
        .post(format!("http://{addr}/disconnected"))
        .form(&[("timeout", "600"), ("exes", "")])
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(first, "Disconnected. Timeout: 600");

    let second = client
        .post(format!("http://{addr}/disconnected"))
        .form(&[("timeout", "2.5"), ("exes", "")])
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(second, "Disconnected. Timeout: 2.5");
}

#[tokio::test]
async fn keepalive_is_acknowledged() {
    let addr = serve(GuestControl::new(agent_config()).router()).await;

    let body = http()
        .get(format!("http://{addr}/keepalive"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "Acknowledged");
}

// Drive the shared retrying client against a real guest control plane: a
// launch request must survive the listener coming up late.
#[tokio::test]
async fn launch_request_retries_until_the_listener_appears() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Hold the port but only start serving after a delay.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        axum::serve(listener, GuestControl::new(agent_config()).router())
            .await
            .unwrap();
    });

    let client = glasshouse::httpc::control_client(Duration::from_millis(50));
    let policy = glasshouse::httpc::RetryPolicy {
        max_retries: 20,
        backoff_factor: 0.05,
    };
    let body = glasshouse::httpc::post_form_retrying(
        &client,
        &format!("http://{addr}/execute"),
        &[("command", "true".to_string())],
        &policy,
    )
    .await
    .unwrap();
    assert_eq!(body, "Command 'true' will be executed.");
}
