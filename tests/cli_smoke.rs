use std::path::Path;
use std::process::{Command, Output};

use serde_json::{json, Value};
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn distill() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_distill"));
    for var in [
        "DEEPSEEK_API_KEY",
        "DISTILL_BASE_URL",
        "DISTILL_MODEL",
        "DISTILL_WORKERS",
        "DISTILL_TIMEOUT_SECONDS",
    ] {
        cmd.env_remove(var);
    }
    cmd.env("RUST_LOG", "warn");
    cmd
}

async fn run(mut cmd: Command) -> Output {
    tokio::task::spawn_blocking(move || cmd.output().unwrap())
        .await
        .unwrap()
}

fn write_tasks(path: &Path) {
    let body = format!(
        "{}\n{}\n{}\n",
        json!({"instruction": "Assess", "input": "row 1"}),
        json!({"instruction": "Assess", "input": "row 2", "gt": "low"}),
        json!({"instruction": "Assess", "input": "row 1"}),
    );
    std::fs::write(path, body).unwrap();
}

async fn mock_endpoint() -> MockServer {
    let server = MockServer::start().await;
    let body = format!(
        "data: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
        json!({"choices": [{"delta": {"reasoning_content": "weighing"}}]}),
        json!({"choices": [{"delta": {"content": "low risk"}}]}),
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/event-stream"))
        .mount(&server)
        .await;
    server
}

#[test]
fn help_lists_subcommands() {
    let out = distill().arg("--help").output().unwrap();
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("run"));
    assert!(text.contains("checkpoint"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_writes_results_then_resumes_as_a_no_op() {
    let server = mock_endpoint().await;
    let dir = tempdir().unwrap();
    let input = dir.path().join("in.jsonl");
    let output = dir.path().join("out/results.jsonl");
    write_tasks(&input);

    let mut cmd = distill();
    cmd.arg("run")
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(&output)
        .args(["--api-key", "sk-test", "--workers", "2", "--base-url"])
        .arg(server.uri());
    let out = run(cmd).await;
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );

    let status: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(status["phase"], "completed");
    assert_eq!(status["written"], 2);
    assert_eq!(status["skipped"], 1);
    assert!(String::from_utf8_lossy(&out.stderr).contains("[distill]"));

    let text = std::fs::read_to_string(&output).unwrap();
    let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(lines.len(), 2);
    for line in &lines {
        assert_eq!(
            line["output"],
            "<think>weighing</think> <answer>low risk</answer>"
        );
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    let mut again = distill();
    again
        .arg("run")
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(&output)
        .args(["--api-key", "sk-test", "--base-url"])
        .arg(server.uri());
    let out = run(again).await;
    assert!(out.status.success());
    let status: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(status["written"], 0);
    assert_eq!(status["skipped"], 3);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    let mut check = distill();
    check.arg("checkpoint").arg("--output").arg(&output);
    let out = run(check).await;
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("2 completed fingerprints"));
}

#[test]
fn non_ascii_key_fails_the_run_without_leaking_it() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("in.jsonl");
    write_tasks(&input);

    let out = distill()
        .arg("run")
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(dir.path().join("out.jsonl"))
        .args(["--api-key", "sk-1234567890在这里填写密钥abcdefghij"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    let stdout: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(stdout["phase"], "error");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("non-ASCII"), "{stderr}");
    assert!(!stderr.contains("1234567890"));
}

#[test]
fn comparison_mode_requires_both_templates() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("in.jsonl");
    write_tasks(&input);
    let prompt = dir.path().join("a.txt");
    std::fs::write(&prompt, "Rewrite: {instruction}").unwrap();

    let out = distill()
        .arg("run")
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(dir.path().join("out.jsonl"))
        .args(["--mode", "compare", "--prompt-a"])
        .arg(&prompt)
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("--prompt-b"));
}
