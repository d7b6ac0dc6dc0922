use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use distill_harness::gateway::{
    ChatRequest, ChatStreamProvider, Message, OpenAiCompatAdapter, RetryPolicy,
    StreamedCompletion, StreamingGateway,
};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn reasoning(text: &str) -> Value {
    json!({"choices": [{"delta": {"reasoning_content": text}}]})
}

fn content(text: &str) -> Value {
    json!({"choices": [{"delta": {"content": text}}]})
}

fn sse_body(frames: &[Value]) -> String {
    let mut body = String::new();
    for frame in frames {
        body.push_str(&format!("data: {frame}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/event-stream")
}

fn adapter(server: &MockServer) -> OpenAiCompatAdapter {
    OpenAiCompatAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap()
}

fn request() -> ChatRequest {
    ChatRequest::new(
        "deepseek-reasoner",
        vec![Message::system("You are a helpful assistant."), Message::user("Q")],
    )
}

#[tokio::test]
async fn adapter_keeps_reasoning_and_answer_apart() {
    let server = MockServer::start().await;

    let mut body = String::new();
    body.push_str(": keep-alive\n\n");
    body.push_str(&format!("data: {}\n\n", reasoning("Let me")));
    body.push_str("data: {not json}\n\n");
    body.push_str(&format!("data: {}\n\n", reasoning(" think.")));
    body.push_str("event: ping\n\n");
    body.push_str(&format!("data: {}\n\n", content("42")));
    body.push_str("data: [DONE]\n\n");
    body.push_str(&format!("data: {}\n\n", content(" ignored")));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"stream": true, "model": "deepseek-reasoner"})))
        .respond_with(sse_response(body))
        .expect(1)
        .mount(&server)
        .await;

    let resp = adapter(&server).stream_chat(&request()).await.unwrap();
    assert_eq!(resp.completion.reasoning, "Let me think.");
    assert_eq!(resp.completion.answer, "42");
    assert!(resp.stats.terminated);
    assert_eq!(resp.stats.malformed_frames, 1);
}

#[tokio::test]
async fn adapter_decodes_unterminated_stream() {
    let server = MockServer::start().await;
    let body = format!("data: {}\n\ndata: {}", reasoning("r"), content("a"));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(body))
        .mount(&server)
        .await;

    let resp = adapter(&server).stream_chat(&request()).await.unwrap();
    assert_eq!(resp.completion, StreamedCompletion::new("r", "a"));
    assert!(!resp.stats.terminated);
}

#[tokio::test]
async fn adapter_sends_system_and_joined_user_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse_body(&[content("ok")])))
        .mount(&server)
        .await;

    let gateway = StreamingGateway::new(adapter(&server), "deepseek-reasoner");
    let out = gateway.call("  Assess the risk ", "row 17").await;
    assert_eq!(out.answer, "ok");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["stream"], json!(true));
    assert_eq!(body["temperature"].as_f64().map(|t| (t * 10.0).round()), Some(6.0));
    assert_eq!(
        body["messages"],
        json!([
            {"role": "system", "content": "You are a helpful assistant."},
            {"role": "user", "content": "Assess the risk\n\nrow 17"}
        ])
    );
}

#[tokio::test]
async fn adapter_classifies_rate_limit_with_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "req-123")
                .set_body_json(json!({
                    "error": {"message": "slow down", "code": "rate_limit_exceeded"}
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).stream_chat(&request()).await.unwrap_err();
    assert!(err.is_rate_limited());
    assert!(err.is_retryable());
    assert_eq!(err.http_status(), Some(429));
    assert_eq!(err.request_id(), Some("req-123"));
    assert_eq!(
        err.context().and_then(|c| c.provider_code.as_deref()),
        Some("rate_limit_exceeded")
    );
}

#[tokio::test]
async fn adapter_reports_server_error_as_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let err = adapter(&server).stream_chat(&request()).await.unwrap_err();
    assert!(!err.is_rate_limited());
    assert!(err.is_retryable());
    assert_eq!(err.http_status(), Some(503));
    assert!(err.to_string().contains("upstream down"), "{err}");
}

/// Replies 429 for the first `failures` requests, then streams an answer.
struct FlakyResponder {
    calls: AtomicUsize,
    failures: usize,
    status: u16,
}

impl Respond for FlakyResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            ResponseTemplate::new(self.status)
        } else {
            sse_response(sse_body(&[reasoning("because"), content("yes")]))
        }
    }
}

#[tokio::test]
async fn gateway_recovers_after_repeated_rate_limits() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyResponder {
            calls: AtomicUsize::new(0),
            failures: 3,
            status: 429,
        })
        .mount(&server)
        .await;

    let gateway = StreamingGateway::new(adapter(&server), "deepseek-reasoner")
        .with_policy(RetryPolicy::new(5, Duration::from_millis(5)));
    let out = gateway.call("Q", "").await;

    assert_eq!(out, StreamedCompletion::new("because", "yes"));
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn gateway_degrades_to_empty_sentinel_on_permanent_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let gateway = StreamingGateway::new(adapter(&server), "deepseek-reasoner")
        .with_policy(RetryPolicy::new(3, Duration::from_millis(1)));
    let out = gateway.call("Q", "").await;

    assert_eq!(out, StreamedCompletion::empty());
    assert!(!out.is_usable());
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn gateway_retries_stream_with_no_tokens() {
    let server = MockServer::start().await;
    let calls = AtomicUsize::new(0);

    struct EmptyThenAnswer(AtomicUsize);
    impl Respond for EmptyThenAnswer {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                sse_response(sse_body(&[]))
            } else {
                sse_response(sse_body(&[content("second time")]))
            }
        }
    }

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(EmptyThenAnswer(calls))
        .mount(&server)
        .await;

    let gateway = StreamingGateway::new(adapter(&server), "deepseek-reasoner")
        .with_policy(RetryPolicy::new(3, Duration::from_millis(1)));
    let out = gateway.call("Q", "").await;

    assert_eq!(out.answer, "second time");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn gateway_treats_connection_failure_as_retryable() {
    let adapter = OpenAiCompatAdapter::with_config(
        "sk-test",
        "http://127.0.0.1:9",
        Duration::from_secs(1),
    )
    .unwrap();
    let gateway = StreamingGateway::new(adapter, "deepseek-reasoner")
        .with_policy(RetryPolicy::new(2, Duration::from_millis(1)));
    assert_eq!(gateway.call("Q", "").await, StreamedCompletion::empty());
}

#[tokio::test]
async fn adapter_reports_attempt_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            sse_response(sse_body(&[content("late")])).set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let adapter =
        OpenAiCompatAdapter::with_config("sk-test", server.uri(), Duration::from_millis(200))
            .unwrap();
    let err = adapter.stream_chat(&request()).await.unwrap_err();
    assert_eq!(err.code(), "timeout");
    assert!(err.is_retryable());
}

/// Serves one raw HTTP response per accepted connection, in order.
///
/// A response whose `Content-Length` promises more than it carries makes the
/// connection drop mid-body.
fn raw_http_server(responses: Vec<Vec<u8>>) -> (String, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let uri = format!("http://{}", listener.local_addr().unwrap());
    let handle = thread::spawn(move || {
        for response in responses {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            stream.write_all(&response).unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(50));
        }
    });
    (uri, handle)
}

fn read_request(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + body_len {
            return;
        }
    }
}

fn sse_http_response(body: &str, declared_len: usize) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: {declared_len}\r\nconnection: close\r\n\r\n{body}"
    )
    .into_bytes()
}

fn broken_stream_response() -> Vec<u8> {
    let partial = format!(
        "data: {}\n\ndata: {}\n\n",
        reasoning("half a thought"),
        content("stale")
    );
    sse_http_response(&partial, partial.len() + 4096)
}

#[tokio::test]
async fn adapter_reports_connection_drop_mid_stream() {
    let (uri, server) = raw_http_server(vec![broken_stream_response()]);
    let adapter = OpenAiCompatAdapter::with_config("sk-test", uri, Duration::from_secs(5)).unwrap();

    let err = adapter.stream_chat(&request()).await.unwrap_err();
    assert_eq!(err.code(), "http_error");
    assert!(err.is_retryable());
    server.join().unwrap();
}

#[tokio::test]
async fn gateway_discards_partial_stream_and_returns_next_attempt() {
    let full = sse_body(&[reasoning("fresh"), content("second time")]);
    let (uri, server) = raw_http_server(vec![
        broken_stream_response(),
        sse_http_response(&full, full.len()),
    ]);
    let adapter = OpenAiCompatAdapter::with_config("sk-test", uri, Duration::from_secs(5)).unwrap();
    let gateway = StreamingGateway::new(adapter, "deepseek-reasoner")
        .with_policy(RetryPolicy::new(3, Duration::from_millis(1)));

    let out = gateway.call("Q", "").await;

    assert_eq!(out, StreamedCompletion::new("fresh", "second time"));
    server.join().unwrap();
}
