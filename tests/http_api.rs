//! HTTP API surface: start/status/resume over a real socket, mapping
//! editor endpoints and the NotFound retry protocol of the status client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use gradeprobe::pipeline::processors::{self, HeuristicScoring};
use gradeprobe::registry::RunRegistry;
use gradeprobe::server::{build_router, ApiState};
use gradeprobe::storage::ArtifactStore;
use gradeprobe::sync::{RefreshOptions, StatusClient, SyncError};
use gradeprobe::pipeline::executor::StageExecutor;

struct TestServer {
    _data_dir: tempfile::TempDir,
    _artifact_dir: tempfile::TempDir,
    base_url: String,
    registry: Arc<RunRegistry>,
}

async fn spawn_server() -> TestServer {
    let data_dir = tempfile::tempdir().unwrap();
    let artifact_dir = tempfile::tempdir().unwrap();

    let registry = Arc::new(RunRegistry::open(data_dir.path()).await.unwrap());
    let artifacts = ArtifactStore::new(artifact_dir.path());
    let executor = StageExecutor::new(
        Arc::clone(&registry),
        artifacts.clone(),
        processors::builtin(Arc::new(HeuristicScoring)),
    );
    let state = ApiState::new(
        Arc::clone(&registry),
        executor,
        artifacts,
        Arc::new(HeuristicScoring),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    TestServer {
        _data_dir: data_dir,
        _artifact_dir: artifact_dir,
        base_url: format!("http://{addr}"),
        registry,
    }
}

fn start_body() -> serde_json::Value {
    json!({
        "document": {
            "kind": "inline",
            "name": "story-quiz.txt",
            "text": "1. What color is the cat in the story?\n\n2. True or false: the story ends at sea.\n",
            "answer_key": "1. Black\n2. True\n"
        }
    })
}

async fn wait_for_status(
    client: &StatusClient,
    run_id: Uuid,
    expected: &str,
) -> gradeprobe::sync::StatusView {
    let options = RefreshOptions::quiet();
    for _ in 0..200 {
        let view = client.refresh(run_id, &options).await.unwrap();
        if serde_json::to_value(view.status).unwrap() == expected {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached status {expected}");
}

#[tokio::test]
async fn test_full_lifecycle_over_http() {
    let server = spawn_server().await;
    let http = reqwest::Client::new();
    let status_client = StatusClient::new(&server.base_url);

    let health: serde_json::Value = http
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    // Start answers before the first stage finishes.
    let response = http
        .post(format!("{}/pipeline/start", server.base_url))
        .json(&start_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);
    let started: serde_json::Value = response.json().await.unwrap();
    let run_id: Uuid = started["run_id"].as_str().unwrap().parse().unwrap();

    // The status client absorbs the write-visibility gap via 404 retries.
    let view = wait_for_status(&status_client, run_id, "paused_for_mapping").await;
    assert_eq!(view.current_stage.to_string(), "content_discovery");

    let run: serde_json::Value = http
        .get(format!("{}/pipeline/{}", server.base_url, run_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let question_id = run["structured_data"]["questions"][0]["id"]
        .as_str()
        .unwrap()
        .to_string();

    // Overlapping sets answer 422 with the conflicting pair.
    let conflict = http
        .put(format!(
            "{}/pipeline/{}/questions/{}/manipulation",
            server.base_url, run_id, question_id
        ))
        .json(&json!({
            "method": "synonym_swap",
            "substring_mappings": [
                {"original": "cat", "replacement": "dog", "start_pos": 18, "end_pos": 21},
                {"original": "at", "replacement": "x", "start_pos": 19, "end_pos": 21}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status().as_u16(), 422);
    let body: serde_json::Value = conflict.json().await.unwrap();
    assert!(body["conflict"]["first"].is_array());

    // A valid set replaces the question's manipulation.
    let ok = http
        .put(format!(
            "{}/pipeline/{}/questions/{}/manipulation",
            server.base_url, run_id, question_id
        ))
        .json(&json!({
            "method": "synonym_swap",
            "substring_mappings": [
                {"original": "cat", "replacement": "dog", "start_pos": 18, "end_pos": 21}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status().as_u16(), 200);

    // Validation is a query: invalid sets answer 200 with valid=false.
    let validated: serde_json::Value = http
        .post(format!(
            "{}/pipeline/{}/questions/{}/validate",
            server.base_url, run_id, question_id
        ))
        .json(&json!({
            "substring_mappings": [
                {"original": "cat", "replacement": "dog", "start_pos": 3, "end_pos": 0}
            ]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(validated["valid"], false);
    assert!(validated.get("effectiveness").is_none());

    // A valid set previews the attacked text and scores it against the
    // configured grader.
    let validated: serde_json::Value = http
        .post(format!(
            "{}/pipeline/{}/questions/{}/validate",
            server.base_url, run_id, question_id
        ))
        .json(&json!({
            "substring_mappings": [
                {"original": "cat", "replacement": "dog", "start_pos": 18, "end_pos": 21}
            ]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(validated["valid"], true);
    assert_eq!(
        validated["preview"].as_str().unwrap(),
        "What color is the dog in the story?"
    );
    let effectiveness = validated["effectiveness"].as_f64().unwrap();
    assert!(effectiveness > 0.0 && effectiveness <= 1.0);

    let resume = http
        .post(format!("{}/pipeline/{}/resume", server.base_url, run_id))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resume.status().as_u16(), 202);

    wait_for_status(&status_client, run_id, "completed").await;

    let files: serde_json::Value = http
        .get(format!("{}/pipeline/{}/files", server.base_url, run_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let listed: Vec<String> = files["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(listed.contains(&"attacked/document.txt".to_string()));

    let rendered = http
        .get(format!(
            "{}/pipeline/{}/files/attacked/document.txt",
            server.base_url, run_id
        ))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(rendered.contains("the dog in the story"));

    // Soft delete keeps the record but blocks further execution.
    let deleted = http
        .post(format!("{}/pipeline/{}/soft_delete", server.base_url, run_id))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status().as_u16(), 200);

    let resume_deleted = http
        .post(format!("{}/pipeline/{}/resume", server.base_url, run_id))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resume_deleted.status().as_u16(), 410);

    let page: serde_json::Value = http
        .get(format!("{}/pipeline/runs", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["total"], 0);

    // The soft-deleted record is still retrievable by id.
    let kept = http
        .get(format!("{}/pipeline/{}", server.base_url, run_id))
        .send()
        .await
        .unwrap();
    assert_eq!(kept.status().as_u16(), 200);

    // Hard delete removes the row and the artifact root.
    let hard = http
        .delete(format!("{}/pipeline/{}", server.base_url, run_id))
        .send()
        .await
        .unwrap();
    assert_eq!(hard.status().as_u16(), 204);

    let gone = http
        .get(format!("{}/pipeline/{}", server.base_url, run_id))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status().as_u16(), 404);

    let no_files = http
        .get(format!(
            "{}/pipeline/{}/files/attacked/document.txt",
            server.base_url, run_id
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(no_files.status().as_u16(), 404);
}

#[tokio::test]
async fn test_manipulation_edit_rejected_while_running() {
    let server = spawn_server().await;
    let http = reqwest::Client::new();
    let status_client = StatusClient::new(&server.base_url);

    let started: serde_json::Value = http
        .post(format!("{}/pipeline/start", server.base_url))
        .json(&start_body())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let run_id: Uuid = started["run_id"].as_str().unwrap().parse().unwrap();
    wait_for_status(&status_client, run_id, "paused_for_mapping").await;

    let run: serde_json::Value = http
        .get(format!("{}/pipeline/{}", server.base_url, run_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let question_id = run["structured_data"]["questions"][0]["id"]
        .as_str()
        .unwrap()
        .to_string();

    // Flip the run to running through the shared registry; the edit must
    // observe it inside the same critical section as the write.
    server
        .registry
        .update(run_id, |run| {
            run.status = gradeprobe::registry::run::RunStatus::Running;
            Ok(())
        })
        .await
        .unwrap();

    let rejected = http
        .put(format!(
            "{}/pipeline/{}/questions/{}/manipulation",
            server.base_url, run_id, question_id
        ))
        .json(&json!({
            "method": "synonym_swap",
            "substring_mappings": [
                {"original": "cat", "replacement": "dog", "start_pos": 18, "end_pos": 21}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status().as_u16(), 409);

    // The rejected edit left the question untouched.
    let run: serde_json::Value = http
        .get(format!("{}/pipeline/{}", server.base_url, run_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(run["structured_data"]["questions"][0]["substring_mappings"]
        .as_array()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_status_client_exhausts_retry_budget_on_missing_run() {
    let server = spawn_server().await;
    let client = StatusClient::new(&server.base_url);

    let options = RefreshOptions {
        quiet: true,
        retries: 2,
        retry_delay: Duration::from_millis(5),
    };
    let result = client.refresh(Uuid::new_v4(), &options).await;
    assert!(matches!(result, Err(SyncError::NotFound(_, 3))));
}

#[tokio::test]
async fn test_fork_over_http() {
    let server = spawn_server().await;
    let http = reqwest::Client::new();
    let status_client = StatusClient::new(&server.base_url);

    let started: serde_json::Value = http
        .post(format!("{}/pipeline/start", server.base_url))
        .json(&start_body())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let run_id: Uuid = started["run_id"].as_str().unwrap().parse().unwrap();
    wait_for_status(&status_client, run_id, "paused_for_mapping").await;

    let forked = http
        .post(format!("{}/pipeline/{}/fork", server.base_url, run_id))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(forked.status().as_u16(), 202);
    let body: serde_json::Value = forked.json().await.unwrap();
    let fork_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();
    assert_ne!(fork_id, run_id);

    let view = wait_for_status(&status_client, fork_id, "completed").await;
    assert!(view.processing_stats.stages_completed > 0);
}
