use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn facts_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("facts");
    path
}

/// Serve `app` on an ephemeral port from a background runtime.
fn spawn_server(app: Router) -> SocketAddr {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });
    rx.recv().unwrap()
}

// ============ Mock chat completions ============

#[derive(Clone, Default)]
struct Llm {
    models: Arc<Mutex<Vec<String>>>,
    /// Models that answer 429.
    limited: Arc<Vec<String>>,
    /// Answer every call with this status instead of a result.
    fail_with: Option<u16>,
}

fn completion() -> Value {
    let result = json!({
        "globalContext": ["A report about harbours"],
        "currentContext": ["Section on shipping"],
        "facts": [
            {"subject": "Harbour", "predicate": "handles", "object": "cargo"},
            {"subject": "Cargo", "predicate": "includes", "object": "grain"},
            {"subject": "Grain", "predicate": "comes from", "object": "inland farms"}
        ]
    });
    json!({
        "choices": [{"message": {"role": "assistant", "content": result.to_string()}}]
    })
}

async fn chat(State(llm): State<Llm>, Json(body): Json<Value>) -> impl IntoResponse {
    let model = body["model"].as_str().unwrap_or_default().to_string();
    llm.models.lock().unwrap().push(model.clone());
    if let Some(code) = llm.fail_with {
        let status = StatusCode::from_u16(code).unwrap();
        return (status, Json(json!({"error": "upstream exploded"}))).into_response();
    }
    if llm.limited.contains(&model) {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit reached").into_response();
    }
    Json(completion()).into_response()
}

fn mock_llm(llm: Llm) -> SocketAddr {
    spawn_server(Router::new().route("/chat/completions", post(chat)).with_state(llm))
}

// ============ Mock graph service ============

#[derive(Clone, Default)]
struct Graph {
    episodes: Arc<Mutex<Vec<Value>>>,
}

async fn add_episode(State(graph): State<Graph>, Json(body): Json<Value>) -> impl IntoResponse {
    graph.episodes.lock().unwrap().push(body);
    Json(json!({"success": true}))
}

fn mock_graph(graph: Graph) -> SocketAddr {
    spawn_server(
        Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/episodes", post(add_episode))
            .with_state(graph),
    )
}

// ============ Harness ============

fn setup_test_env(llm: SocketAddr, graph: Option<SocketAddr>) -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let docs_dir = root.join("docs");
    fs::create_dir_all(&docs_dir).unwrap();

    let mut text = String::new();
    for i in 0..40 {
        text.push_str(&format!(
            "Paragraph {} describes how the harbour moved goods during season {}.\n",
            i, i
        ));
        if i % 5 == 4 {
            text.push('\n');
        }
    }
    let doc = docs_dir.join("harbour.txt");
    fs::write(&doc, text).unwrap();

    let graph_section = match graph {
        Some(addr) => format!(
            "enabled = true\nurl = \"http://{}\"\nbase_delay_ms = 10\ndelay_between_chunks_ms = 0\nbatch_delay_ms = 0\n",
            addr
        ),
        None => "enabled = false\n".to_string(),
    };
    let config_content = format!(
        r#"[chunking]
threshold_chars = 400

[extraction]
models = ["model-a", "model-b", "model-c"]
api_base = "http://{}"
timeout_ms = 10000

[graphiti]
{}
[supervisor]
max_retries = 2
retry_delay_ms = 10
"#,
        llm, graph_section
    );
    let config_path = config_dir.join("facts.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, doc)
}

fn run_facts(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    run_facts_env(config_path, args, &[("OPENAI_API_KEY", "test-key")])
}

fn run_facts_env(
    config_path: &Path,
    args: &[&str],
    env: &[(&str, &str)],
) -> (String, String, Option<i32>) {
    let binary = facts_binary();
    let mut cmd = Command::new(&binary);
    cmd.arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("OPENAI_API_KEY")
        .env_remove("RESUME_FROM_POSITION")
        .env_remove("LLM_MODELS")
        .env_remove("LLM_API_BASE")
        .env_remove("ENABLE_GRAPHITI")
        .env_remove("GRAPHITI_URL")
        .env_remove("CHUNK_SIZE_THRESHOLD");
    for (k, v) in env {
        cmd.env(k, v);
    }
    let output = cmd
        .output()
        .unwrap_or_else(|e| panic!("Failed to run facts binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

fn state_dir(doc: &Path) -> PathBuf {
    doc.parent().unwrap().join(doc.file_stem().unwrap())
}

fn read_metadata(doc: &Path) -> Value {
    let raw = fs::read_to_string(state_dir(doc).join("metadata.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

fn read_records(doc: &Path) -> Vec<Value> {
    let raw = fs::read_to_string(state_dir(doc).join("chunks.jsonl")).unwrap();
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

// ============ extract ============

#[test]
fn test_extract_completes_and_persists() {
    let llm = Llm::default();
    let addr = mock_llm(llm.clone());
    let (_tmp, config_path, doc) = setup_test_env(addr, None);

    let (stdout, stderr, code) = run_facts(&config_path, &["extract", doc.to_str().unwrap()]);
    assert_eq!(code, Some(0), "stdout: {}\nstderr: {}", stdout, stderr);
    assert!(stdout.contains("ok"));

    let meta = read_metadata(&doc);
    assert_eq!(meta["status"], "completed");
    assert!(meta["completedAt"].is_string());
    // The cursor stops after the last paragraph's newline; the trailing
    // blank line is never part of a chunk.
    let text = fs::read_to_string(&doc).unwrap();
    let last_paragraph_end = text.trim_end().chars().count() as u64 + 1;
    assert_eq!(meta["cursorPosition"].as_u64().unwrap(), last_paragraph_end);

    let records = read_records(&doc);
    assert!(records.len() > 1);
    assert_eq!(records.len() as u64, meta["totalChunks"].as_u64().unwrap());
    let cursors: Vec<u64> = records
        .iter()
        .map(|r| r["cursorPosition"].as_u64().unwrap())
        .collect();
    assert!(cursors.windows(2).all(|w| w[0] <= w[1]));
    for record in &records {
        assert!(record["hashes"]["extraction"].as_str().unwrap().len() > 10);
        assert_eq!(
            record["context"]["lastFiveGlobal"][0],
            "A report about harbours"
        );
    }
    // One model call per chunk, all on the first model.
    let models = llm.models.lock().unwrap().clone();
    assert_eq!(models.len(), records.len());
    assert!(models.iter().all(|m| m == "model-a"));
}

#[test]
fn test_extract_skips_completed_document() {
    let llm = Llm::default();
    let addr = mock_llm(llm.clone());
    let (_tmp, config_path, doc) = setup_test_env(addr, None);
    let doc_arg = doc.to_str().unwrap();

    let (_, _, code) = run_facts(&config_path, &["extract", doc_arg]);
    assert_eq!(code, Some(0));
    let calls = llm.models.lock().unwrap().len();

    let (stdout, _, code) = run_facts(&config_path, &["extract", doc_arg]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("already completed"));
    assert_eq!(llm.models.lock().unwrap().len(), calls);

    let (_, _, code) = run_facts(&config_path, &["extract", doc_arg, "--fresh"]);
    assert_eq!(code, Some(0));
    assert_eq!(llm.models.lock().unwrap().len(), calls * 2);
    assert_eq!(read_records(&doc).len(), calls);
}

#[test]
fn test_rate_limited_model_rotates() {
    let llm = Llm {
        limited: Arc::new(vec!["model-a".to_string()]),
        ..Llm::default()
    };
    let addr = mock_llm(llm.clone());
    let (_tmp, config_path, doc) = setup_test_env(addr, None);

    let (stdout, stderr, code) = run_facts(&config_path, &["extract", doc.to_str().unwrap()]);
    assert_eq!(code, Some(0), "stdout: {}\nstderr: {}", stdout, stderr);

    let models = llm.models.lock().unwrap().clone();
    assert_eq!(models[0], "model-a");
    assert_eq!(models[1], "model-b");
    // Once rotated, later chunks stay on the working model.
    assert!(models[2..].iter().all(|m| m == "model-b"));
}

#[test]
fn test_model_failure_is_resumable() {
    let llm = Llm {
        fail_with: Some(500),
        ..Llm::default()
    };
    let addr = mock_llm(llm);
    let (_tmp, config_path, doc) = setup_test_env(addr, None);

    let (_, stderr, code) = run_facts(&config_path, &["extract", doc.to_str().unwrap()]);
    assert_eq!(code, Some(1), "stderr: {}", stderr);
    assert!(stderr.contains("To resume, run: RESUME_FROM_POSITION=0"));
    let meta = read_metadata(&doc);
    assert_eq!(meta["status"], "processing");
    assert_eq!(meta["cursorPosition"], 0);
}

#[test]
fn test_resume_from_env_position() {
    let llm = Llm::default();
    let addr = mock_llm(llm.clone());
    let (_tmp, config_path, doc) = setup_test_env(addr, None);

    let (_, stderr, code) = run_facts_env(
        &config_path,
        &["extract", doc.to_str().unwrap()],
        &[("OPENAI_API_KEY", "k"), ("RESUME_FROM_POSITION", "1000")],
    );
    assert_eq!(code, Some(0), "stderr: {}", stderr);
    assert_eq!(read_metadata(&doc)["status"], "completed");
    let records = read_records(&doc);
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r["cursorPosition"].as_u64().unwrap() > 1000));
    // Nothing before the resume point was sent to the model.
    assert_eq!(llm.models.lock().unwrap().len(), records.len());
}

#[test]
fn test_missing_api_key_is_fatal() {
    let addr = mock_llm(Llm::default());
    let (_tmp, config_path, doc) = setup_test_env(addr, None);

    let (_, stderr, code) = run_facts_env(&config_path, &["extract", doc.to_str().unwrap()], &[]);
    assert_eq!(code, Some(3));
    assert!(stderr.contains("OPENAI_API_KEY"));
}

#[test]
fn test_missing_source_is_fatal() {
    let addr = mock_llm(Llm::default());
    let (tmp, config_path, _) = setup_test_env(addr, None);
    let missing = tmp.path().join("nope.txt");

    let (_, stderr, code) = run_facts(&config_path, &["extract", missing.to_str().unwrap()]);
    assert_eq!(code, Some(3));
    assert!(stderr.contains("Source file not found"));
}

#[test]
fn test_usage_error_exit_code() {
    let addr = mock_llm(Llm::default());
    let (_tmp, config_path, _) = setup_test_env(addr, None);

    let (_, _, code) = run_facts(&config_path, &["extract"]);
    assert_eq!(code, Some(3));
    let (stdout, _, code) = run_facts(&config_path, &["--help"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("extract"));
}

#[test]
fn test_explicit_missing_config_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, code) = run_facts(&tmp.path().join("absent.toml"), &["status", "x.txt"]);
    assert_eq!(code, Some(3));
    assert!(stderr.contains("Failed to read config file"));
}

// ============ status ============

#[test]
fn test_status_before_and_after() {
    let addr = mock_llm(Llm::default());
    let (_tmp, config_path, doc) = setup_test_env(addr, None);
    let doc_arg = doc.to_str().unwrap();

    let (stdout, _, code) = run_facts(&config_path, &["status", doc_arg]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("not started"));

    run_facts(&config_path, &["extract", doc_arg]);
    let (stdout, _, code) = run_facts(&config_path, &["status", doc_arg]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("status: completed"));
    assert!(stdout.contains("recorded"));
}

// ============ extract-all ============

#[test]
fn test_extract_all_processes_each_document() {
    let llm = Llm::default();
    let addr = mock_llm(llm.clone());
    let (_tmp, config_path, doc) = setup_test_env(addr, None);
    let docs_dir = doc.parent().unwrap();
    fs::write(docs_dir.join("second.txt"), "A short second document.\n").unwrap();
    fs::write(docs_dir.join("ignored.md"), "Not a text file.\n").unwrap();

    let (stdout, stderr, code) = run_facts(&config_path, &["extract-all", docs_dir.to_str().unwrap()]);
    assert_eq!(code, Some(0), "stderr: {}", stderr);
    assert!(stdout.contains("extract-all: 2 documents"));
    assert_eq!(read_metadata(&doc)["status"], "completed");
    assert_eq!(
        read_metadata(&docs_dir.join("second.txt"))["status"],
        "completed"
    );
    assert!(!docs_dir.join("ignored").exists());
}

// ============ graph ============

#[test]
fn test_graph_replays_chunk_log() {
    let addr = mock_llm(Llm::default());
    let graph = Graph::default();
    let graph_addr = mock_graph(graph.clone());
    let (_tmp, config_path, doc) = setup_test_env(addr, None);
    run_facts(&config_path, &["extract", doc.to_str().unwrap()]);
    let records = read_records(&doc);

    let (stdout, stderr, code) = run_facts_env(
        &config_path,
        &["graph", state_dir(&doc).to_str().unwrap()],
        &[("GRAPHITI_URL", &format!("http://{}", graph_addr))],
    );
    assert_eq!(code, Some(0), "stdout: {}\nstderr: {}", stdout, stderr);
    assert!(stdout.contains("graph done"));

    let episodes = graph.episodes.lock().unwrap().clone();
    assert_eq!(episodes.len(), records.len());
    for (episode, record) in episodes.iter().zip(&records) {
        assert_eq!(
            episode["name"],
            format!("harbour_chunk_{}", record["chunkId"].as_str().unwrap())
        );
        assert_eq!(episode["content"]["chunkId"], record["chunkId"]);
    }
}

#[test]
fn test_graph_from_chunk_skips_earlier_chunks() {
    let addr = mock_llm(Llm::default());
    let graph = Graph::default();
    let graph_addr = mock_graph(graph.clone());
    let (_tmp, config_path, doc) = setup_test_env(addr, None);
    run_facts(&config_path, &["extract", doc.to_str().unwrap()]);
    let records = read_records(&doc);
    let from = records[1]["chunkId"].as_str().unwrap();

    let (_, stderr, code) = run_facts_env(
        &config_path,
        &[
            "graph",
            state_dir(&doc).join("chunks.jsonl").to_str().unwrap(),
            "--from-chunk",
            from,
        ],
        &[("GRAPHITI_URL", &format!("http://{}", graph_addr))],
    );
    assert_eq!(code, Some(0), "stderr: {}", stderr);
    assert_eq!(graph.episodes.lock().unwrap().len(), records.len() - 1);
}

#[test]
fn test_inline_graph_delivery_during_extract() {
    let addr = mock_llm(Llm::default());
    let graph = Graph::default();
    let graph_addr = mock_graph(graph.clone());
    let (_tmp, config_path, doc) = setup_test_env(addr, Some(graph_addr));

    let (_, stderr, code) = run_facts(&config_path, &["extract", doc.to_str().unwrap()]);
    assert_eq!(code, Some(0), "stderr: {}", stderr);
    assert_eq!(
        graph.episodes.lock().unwrap().len(),
        read_records(&doc).len()
    );
}

// ============ supervise ============

#[test]
fn test_supervise_runs_to_completion() {
    let addr = mock_llm(Llm::default());
    let (_tmp, config_path, doc) = setup_test_env(addr, None);

    let (stdout, stderr, code) = run_facts(&config_path, &["supervise", doc.to_str().unwrap()]);
    assert_eq!(code, Some(0), "stdout: {}\nstderr: {}", stdout, stderr);
    assert!(stdout.contains("attempts: 1"));
    assert_eq!(read_metadata(&doc)["status"], "completed");
}

#[test]
fn test_supervise_gives_up_after_retries() {
    let llm = Llm {
        fail_with: Some(500),
        ..Llm::default()
    };
    let addr = mock_llm(llm.clone());
    let (_tmp, config_path, doc) = setup_test_env(addr, None);

    let (_, stderr, code) = run_facts(&config_path, &["supervise", doc.to_str().unwrap()]);
    assert_eq!(code, Some(1), "stderr: {}", stderr);
    assert!(stderr.contains("gave up after 2 attempts"));
    // Two children, one failing call each.
    assert_eq!(llm.models.lock().unwrap().len(), 2);
}
