//! API tests against a real listener, a mock host and a scripted model

use sandbox_agent::{AgentOrchestrator, ScriptedModel, EXECUTE_COMMAND_TOOL};
use sandbox_remote::{
    CommandHistory, DirectorySubmissionStore, MockTransport, RemoteSession, SessionRegistry,
};
use sandbox_server::{router, AppState, CommandResponse, SessionOutput};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct TestServer {
    base: String,
    mock: MockTransport,
    _submissions: TempDir,
}

async fn start(mock: MockTransport, model: ScriptedModel) -> TestServer {
    let submissions = TempDir::new().unwrap();
    let submission = submissions.path().join("fall").join("cs101").join("hw1").join("alice");
    std::fs::create_dir_all(&submission).unwrap();
    std::fs::write(submission.join("main.py"), "print('hi')\n").unwrap();

    let session = Arc::new(RemoteSession::new(
        Arc::new(mock.clone()),
        "/home/ubuntu/submission",
        Duration::from_secs(5),
        Arc::new(CommandHistory::new(50)),
    ));
    let registry = Arc::new(SessionRegistry::new(session.clone(), "background", 200));
    let agent = Arc::new(AgentOrchestrator::new(
        session.clone(),
        registry.clone(),
        Arc::new(model),
    ));
    let state = Arc::new(AppState::new(
        session,
        registry,
        agent,
        Arc::new(DirectorySubmissionStore::new(submissions.path())),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        mock,
        _submissions: submissions,
    }
}

#[tokio::test]
async fn test_health() {
    let server = start(MockTransport::new(), ScriptedModel::new()).await;
    let body: Value = reqwest::get(format!("{}/api/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connected"], false);
}

#[tokio::test]
async fn test_run_command_and_history() {
    let mock = MockTransport::new().with_stdout("ls --color", "\u{1b}[34msrc\u{1b}[0m\n");
    let server = start(mock, ScriptedModel::new()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/commands", server.base))
        .json(&json!({"command": "ls --color"}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: CommandResponse = response.json().await.unwrap();
    assert_eq!(body.stdout, "\u{1b}[34msrc\u{1b}[0m\n");
    assert!(body.html.contains("<span"));
    assert!(body.html.contains("src"));

    let history: Vec<Value> = client
        .get(format!("{}/api/commands/history", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["command"], "ls --color");
    assert_eq!(history[0]["directory"], "/home/ubuntu/submission");
}

#[tokio::test]
async fn test_empty_command_is_rejected() {
    let server = start(MockTransport::new(), ScriptedModel::new()).await;
    let response = reqwest::Client::new()
        .post(format!("{}/api/commands", server.base))
        .json(&json!({"command": "  "}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("command"));
    assert!(server.mock.commands().is_empty());
}

#[tokio::test]
async fn test_background_session_lifecycle() {
    let mock = MockTransport::new()
        .with_stdout("kill-session", "__sandbox_session_ended__\n")
        .with_stdout("-S -200", "Listening on :3000\n");
    let server = start(mock, ScriptedModel::new()).await;
    let client = reqwest::Client::new();

    let started = client
        .post(format!("{}/api/sessions/web/commands", server.base))
        .json(&json!({"command": "npm start"}))
        .send()
        .await
        .unwrap();
    assert!(started.status().is_success());

    let output: SessionOutput = client
        .get(format!("{}/api/sessions/web/output", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(output.session, "web");
    assert_eq!(output.stdout, "Listening on :3000\n");

    let ended: Value = client
        .delete(format!("{}/api/sessions/web", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ended["ended"], true);

    let bad = client
        .get(format!("{}/api/sessions/bad%20name/output", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
}

#[tokio::test]
async fn test_load_submission() {
    let server = start(MockTransport::new(), ScriptedModel::new()).await;
    let client = reqwest::Client::new();

    let loaded = client
        .post(format!("{}/api/submissions/load", server.base))
        .json(&json!({"term": "fall", "course": "cs101", "assignment": "hw1", "student": "alice"}))
        .send()
        .await
        .unwrap();
    assert!(loaded.status().is_success());
    let body: Value = loaded.json().await.unwrap();
    assert_eq!(body["submission"], "fall/cs101/hw1/alice");
    assert_eq!(server.mock.uploads().len(), 1);

    let missing = client
        .post(format!("{}/api/submissions/load", server.base))
        .json(&json!({"term": "fall", "course": "cs101", "assignment": "hw1", "student": "bob"}))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    assert_eq!(server.mock.uploads().len(), 1);
}

#[tokio::test]
async fn test_run_task() {
    let mock = MockTransport::new().with_stdout("ls", "a.txt\nb.txt\n");
    let model = ScriptedModel::new()
        .with_tool_call("call_1", EXECUTE_COMMAND_TOOL, json!({"command": "ls"}))
        .with_text("Found 2 files: a.txt, b.txt");
    let server = start(mock, model).await;

    let outcome: Value = reqwest::Client::new()
        .post(format!("{}/api/tasks", server.base))
        .json(&json!({"task": "list files in the project"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(outcome["status"], "completed");
    assert_eq!(outcome["summary"], "Found 2 files: a.txt, b.txt");
    assert_eq!(outcome["conversation"].as_array().unwrap().len(), 5);
    assert_eq!(outcome["conversation"][3]["kind"], "tool");
}

#[tokio::test]
async fn test_stream_task() {
    let mock = MockTransport::new().with_stdout("ls", "a.txt\n");
    let model = ScriptedModel::new()
        .with_tool_call("call_1", EXECUTE_COMMAND_TOOL, json!({"command": "ls"}))
        .with_text("One file");
    let server = start(mock, model).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/tasks/stream", server.base))
        .json(&json!({"task": "list"}))
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let body = response.text().await.unwrap();
    assert_eq!(body.matches("event: turn").count(), 5);
    assert_eq!(body.matches("event: result").count(), 1);
    assert!(body.find("event: result").unwrap() > body.rfind("event: turn").unwrap());
    assert!(body.contains("One file"));
}
