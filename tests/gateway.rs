//! Gateway integration tests: drive the router with scripted runners and the
//! local runner, and check the event stream and session cookie.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    http::{header, Method, Request, Response, StatusCode},
};
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio_util::io::StreamReader;
use tower::ServiceExt;

use scriptbox::http_server::{router, MAX_SCRIPT_BYTES};
use scriptbox::sandbox::local::LocalRunner;
use scriptbox::sandbox::{Context, Release, Result, RunResult, Runner, SandboxError};
use scriptbox::AppState;

/// What the output stream does after the canned text.
#[derive(Default, Clone, Copy)]
enum Tail {
    #[default]
    End,
    /// Never ends, like a script that keeps running.
    Hang,
    /// Breaks off with an I/O error.
    Fail,
}

/// Runner that prints a canned output, or fails the way it was told to.
#[derive(Default)]
struct ScriptedRunner {
    output: String,
    tail: Tail,
    unreachable: bool,
    reset_fails: bool,
    sessions: Mutex<Vec<String>>,
    resets: Mutex<Vec<String>>,
    released: Arc<AtomicBool>,
}

impl ScriptedRunner {
    fn output_stream(&self) -> BoxStream<'static, io::Result<Bytes>> {
        let text = stream::iter(vec![Ok(Bytes::from(self.output.clone()))]);
        match self.tail {
            Tail::End => text.boxed(),
            Tail::Hang => text.chain(stream::pending()).boxed(),
            Tail::Fail => text
                .chain(stream::iter(vec![Err(io::Error::other("connection reset"))]))
                .boxed(),
        }
    }
}

struct FlagRelease(Arc<AtomicBool>);

#[async_trait]
impl Release for FlagRelease {
    async fn release(self: Box<Self>) -> Result<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, _ctx: &Context, session: &str, _script: &str) -> Result<RunResult> {
        self.sessions.lock().unwrap().push(session.to_string());
        if self.unreachable {
            return Err(SandboxError::Connectivity {
                backend: "scripted",
                message: "connection refused".into(),
            });
        }
        Ok(RunResult::new(
            StreamReader::new(self.output_stream()),
            FlagRelease(self.released.clone()),
        ))
    }

    async fn reset(&self, _ctx: &Context, session: &str) -> Result<()> {
        self.resets.lock().unwrap().push(session.to_string());
        if self.reset_fails {
            return Err(SandboxError::Api {
                operation: "remove_container",
                message: "boom".into(),
            });
        }
        Ok(())
    }
}

fn scripted(output: &str) -> ScriptedRunner {
    ScriptedRunner {
        output: output.to_string(),
        ..ScriptedRunner::default()
    }
}

async fn post(
    runner: Arc<dyn Runner>,
    uri: &str,
    cookie: Option<&str>,
    body: impl Into<Body>,
) -> Response<Body> {
    let mut request = Request::builder().uri(uri).method(Method::POST);
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    router(AppState::new(runner))
        .oneshot(request.body(body.into()).unwrap())
        .await
        .unwrap()
}

async fn body_text(response: Response<Body>) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

/// Splits an SSE body into `(event, data)` pairs, skipping comments.
fn parse_events(body: &str) -> Vec<(String, String)> {
    body.split("\n\n")
        .filter_map(|block| {
            let mut kind = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    kind = Some(value.strip_prefix(' ').unwrap_or(value).to_string());
                } else if let Some(value) = line.strip_prefix("data:") {
                    data = Some(value.strip_prefix(' ').unwrap_or(value).to_string());
                }
            }
            Some((kind?, data.unwrap_or_default()))
        })
        .collect()
}

fn of_kind<'a>(events: &'a [(String, String)], kind: &str) -> Vec<&'a str> {
    events
        .iter()
        .filter(|(k, _)| k == kind)
        .map(|(_, data)| data.as_str())
        .collect()
}

fn set_cookie(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn test_health_endpoint() {
    let response = router(AppState::new(Arc::new(scripted(""))))
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "OK");
}

#[tokio::test]
async fn test_run_streams_commands_then_output() {
    let runner = Arc::new(scripted("hi\nbye\n"));
    let response = post(
        runner.clone(),
        "/api/term/run",
        Some("session-id=abc123"),
        "echo hi\necho bye",
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookie(&response).starts_with("session-id=abc123"));
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let events = parse_events(&body_text(response).await);
    assert_eq!(of_kind(&events, "command"), vec!["$ echo hi", "echo bye"]);
    assert_eq!(of_kind(&events, "output"), vec!["hi", "bye"]);
    assert!(of_kind(&events, "error").is_empty());
    // every command event precedes the first output event
    assert_eq!(events[0].0, "command");
    assert_eq!(events[1].0, "command");

    assert_eq!(*runner.sessions.lock().unwrap(), vec!["abc123"]);
    assert!(runner.released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_run_preserves_output_order() {
    let output: String = (1..=200).map(|i| format!("line {i}\n")).collect();
    let response = post(Arc::new(scripted(&output)), "/api/term/run", None, "seq 200").await;

    let events = parse_events(&body_text(response).await);
    let expected: Vec<String> = (1..=200).map(|i| format!("line {i}")).collect();
    assert_eq!(of_kind(&events, "output"), expected);
}

#[tokio::test]
async fn test_run_strips_carriage_returns() {
    let response = post(Arc::new(scripted("a\r\nb\rc\nlast")), "/api/term/run", None, "x").await;

    let events = parse_events(&body_text(response).await);
    assert_eq!(of_kind(&events, "output"), vec!["a", "bc", "last"]);
}

#[tokio::test]
async fn test_unreachable_backend_yields_single_error() {
    let runner = Arc::new(ScriptedRunner {
        unreachable: true,
        ..ScriptedRunner::default()
    });
    let response = post(runner.clone(), "/api/term/run", None, "echo hi").await;

    let events = parse_events(&body_text(response).await);
    let errors = of_kind(&events, "error");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("connection refused"));
    assert!(of_kind(&events, "output").is_empty());
    assert_eq!(of_kind(&events, "command"), vec!["$ echo hi"]);
    assert!(!runner.released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_session_cookie_minted_when_absent() {
    let runner = Arc::new(scripted(""));
    let response = post(runner.clone(), "/api/term/run", None, "true").await;

    let cookie = set_cookie(&response);
    assert!(cookie.starts_with("session-id="));
    assert!(cookie.contains("HttpOnly"));
    body_text(response).await;

    let sessions = runner.sessions.lock().unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(cookie.contains(&sessions[0]));
}

#[tokio::test]
async fn test_reset_acknowledges_with_no_content() {
    let runner = Arc::new(scripted(""));
    let response = post(runner.clone(), "/api/term/reset", Some("session-id=abc123"), "").await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(set_cookie(&response).starts_with("session-id=abc123"));
    assert!(body_text(response).await.is_empty());
    assert_eq!(*runner.resets.lock().unwrap(), vec!["abc123"]);
}

#[tokio::test]
async fn test_reset_failure_is_server_error() {
    let runner = Arc::new(ScriptedRunner {
        reset_fails: true,
        ..ScriptedRunner::default()
    });
    let response = post(runner, "/api/term/reset", None, "").await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_text(response).await,
        "failed to reset sandbox: remove_container failed: boom"
    );
}

#[tokio::test]
async fn test_local_runner_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(LocalRunner::new(dir.path()));
    let response = post(runner, "/api/term/run", Some("session-id=abc123"), "echo hi\necho bye").await;

    let events = parse_events(&body_text(response).await);
    assert_eq!(of_kind(&events, "command"), vec!["$ echo hi", "echo bye"]);
    assert_eq!(of_kind(&events, "output"), vec!["hi", "bye"]);
    assert!(of_kind(&events, "error").is_empty());
}

#[tokio::test]
async fn test_local_runner_exit_status_reported_after_output() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(LocalRunner::new(dir.path()));
    let response = post(runner, "/api/term/run", None, "echo partial; exit 3").await;

    let events = parse_events(&body_text(response).await);
    assert_eq!(of_kind(&events, "output"), vec!["partial"]);
    let last = events.last().unwrap();
    assert_eq!(last.0, "error");
    assert!(last.1.contains("exit status: 3"));
}

#[tokio::test]
async fn test_local_runner_reset_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(LocalRunner::new(dir.path()));
    let response = post(runner, "/api/term/reset", None, "").await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_text(response).await.contains("reset is not supported by the local runner"));
}

#[tokio::test]
async fn test_read_failure_reported_once_after_output() {
    let runner = Arc::new(ScriptedRunner {
        output: "one\ntwo\n".into(),
        tail: Tail::Fail,
        ..ScriptedRunner::default()
    });
    let response = post(runner.clone(), "/api/term/run", None, "cat big.log").await;

    let events = parse_events(&body_text(response).await);
    assert_eq!(of_kind(&events, "output"), vec!["one", "two"]);
    let errors = of_kind(&events, "error");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("failed to read output"));
    assert_eq!(events.last().unwrap().0, "error");
    assert!(runner.released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_client_disconnect_releases_attachment() {
    let runner = Arc::new(ScriptedRunner {
        output: "started\n".into(),
        tail: Tail::Hang,
        ..ScriptedRunner::default()
    });
    let response = post(runner.clone(), "/api/term/run", Some("session-id=abc123"), "tail -f log").await;

    let mut body = response.into_body().into_data_stream();
    let mut seen = String::new();
    while !seen.contains("started") {
        let chunk = body.next().await.unwrap().unwrap();
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    drop(body);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !runner.released.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("attachment was not released after disconnect");
    assert!(runner.resets.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_script_sends_no_command_events() {
    let runner = Arc::new(scripted(""));
    let response = post(runner.clone(), "/api/term/run", None, "").await;

    let events = parse_events(&body_text(response).await);
    assert!(events.is_empty());
    assert_eq!(runner.sessions.lock().unwrap().len(), 1);
    assert!(runner.released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_invalid_utf8_script_is_rejected() {
    let runner = Arc::new(scripted("never\n"));
    let response = post(runner.clone(), "/api/term/run", None, vec![b'e', b'c', 0xff, b'\n']).await;

    let events = parse_events(&body_text(response).await);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "error");
    assert!(events[0].1.starts_with("script is not valid UTF-8"));
    assert!(runner.sessions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_oversized_script_is_refused() {
    let runner = Arc::new(scripted(""));
    let script = "x".repeat(MAX_SCRIPT_BYTES + 1);
    let response = post(runner.clone(), "/api/term/run", None, script).await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(runner.sessions.lock().unwrap().is_empty());
}
