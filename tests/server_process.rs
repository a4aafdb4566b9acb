// Integration tests that run the compiled `canopy` binary: the server through
// `ServerProcess`, and the one-shot `validate` / `authorize` subcommands.

mod helpers;

use std::net::TcpListener;
use std::process::{Command, Stdio};
use std::time::Duration;

use canopy::authz::types::{Decision, DenyReason};
use canopy::client::ServerProcess;
use helpers::{repo_path, request};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("Failed to find a free port")
}

/// The binary configured through the environment against the shipped
/// TinyTodo data. The config file path deliberately does not exist.
fn canopy_command(args: &[&str]) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_canopy"));
    command
        .args(["--config", "/nonexistent/canopy.toml"])
        .args(args)
        .env("RUST_LOG", "error")
        .env("CANOPY__DATA__ENTITIES_PATH", repo_path("data/entities.json"))
        .env("CANOPY__DATA__POLICIES_DIR", repo_path("policies"));
    command
}

#[tokio::test]
async fn test_spawned_server_answers_and_shuts_down() {
    let port = free_port();
    let mut command = canopy_command(&["serve"]);
    command
        .env("CANOPY__SERVER__HOST", "127.0.0.1")
        .env("CANOPY__SERVER__PORT", port.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let server = ServerProcess::spawn(
        command,
        &format!("http://127.0.0.1:{port}"),
        Duration::from_secs(30),
    )
    .await
    .expect("Server failed to start");

    let status = server.client().status().await.unwrap();
    assert!(status.entities_loaded && status.policies_loaded);
    assert_eq!(status.policy_count, 5);

    let decision = server
        .client()
        .authorize(&request("User/kesha", "GetList", "List/0"))
        .await
        .unwrap();
    assert!(decision.is_allowed());

    let client = server.client().clone();
    server.shutdown().expect("Failed to stop server");
    assert!(client.health().await.is_err());
}

#[tokio::test]
async fn test_dropping_handle_stops_server() {
    let port = free_port();
    let mut command = canopy_command(&[]);
    command
        .env("CANOPY__SERVER__HOST", "127.0.0.1")
        .env("CANOPY__SERVER__PORT", port.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let client = {
        let server = ServerProcess::spawn(
            command,
            &format!("http://127.0.0.1:{port}"),
            Duration::from_secs(30),
        )
        .await
        .expect("Server failed to start");
        server.client().clone()
    };
    assert!(client.health().await.is_err());
}

#[tokio::test]
async fn test_server_that_exits_early_is_reported() {
    let mut command = canopy_command(&["serve"]);
    command
        .env("CANOPY__DATA__POLICIES_DIR", repo_path("data"))
        .env("CANOPY__DATA__ENTITIES_PATH", repo_path("policies/tinytodo.kdl"))
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let result = ServerProcess::spawn(
        command,
        &format!("http://127.0.0.1:{}", free_port()),
        Duration::from_secs(30),
    )
    .await;
    assert!(result.is_err());
}

#[test]
fn test_validate_subcommand() {
    let output = canopy_command(&["validate"]).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("entities: 10"), "{stdout}");
    assert!(stdout.contains("policies: 5"), "{stdout}");
}

#[test]
fn test_validate_fails_on_bad_policies() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("broken.kdl"),
        r#"policy "p" effect="permit" { when "principal.x ===" }"#,
    )
    .unwrap();
    let output = canopy_command(&["validate"])
        .env("CANOPY__DATA__POLICIES_DIR", dir.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_authorize_subcommand() {
    let output = canopy_command(&[
        "authorize",
        "--principal",
        r#"User::"aaron""#,
        "--action",
        "CreateList",
        "--resource",
        "Application/TinyTodo",
    ])
    .output()
    .unwrap();
    assert!(output.status.success());
    let decision: Decision = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(decision.reason, Some(DenyReason::ExplicitForbid));

    let output = canopy_command(&[
        "authorize",
        "--principal",
        "User/andrew",
        "--action",
        "GetList",
        "--resource",
        "List/0",
        "--context",
        "[1]",
    ])
    .output()
    .unwrap();
    let decision: Decision = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(decision.reason, Some(DenyReason::InvalidContext));
}
