//! HTTP gateway using Axum.
//!
//! `POST /api/term/run` takes a script as the request body and answers with a
//! server-sent event stream:
//!
//! - `command`: one per script line, the first prefixed with `$ `
//! - `output`: one per line the sandbox prints
//! - `error`: the run could not start, reading broke off, or releasing the
//!   attachment reported a failure
//!
//! The script must be valid UTF-8 and at most [`MAX_SCRIPT_BYTES`] long;
//! larger bodies are refused with `413` before any event is sent.
//!
//! `POST /api/term/reset` throws the session's sandbox away.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use axum_extra::extract::cookie::CookieJar;
use futures_util::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::sandbox::{Context, RunResult};
use crate::session;
use crate::state::AppState;

/// Events buffered between the relay task and the response body.
const RELAY_BUFFER: usize = 64;

/// Largest accepted script body.
pub const MAX_SCRIPT_BYTES: usize = 1024 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/term/run",
            post(run_script).layer(DefaultBodyLimit::max(MAX_SCRIPT_BYTES)),
        )
        .route("/api/term/reset", post(reset_sandbox))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    "OK"
}

type EventResult = Result<Event, Infallible>;

/// Response body of a run. Dropping it (the client went away) cancels the
/// request context, which stops the relay and releases the attachment.
struct EventStream {
    events: ReceiverStream<EventResult>,
    _cancel_on_drop: DropGuard,
}

impl Stream for EventStream {
    type Item = EventResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

async fn run_script(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Bytes,
) -> (CookieJar, Sse<EventStream>) {
    let (jar, session) = session::resolve(jar);
    info!(%session, bytes = body.len(), "Running script");

    let ctx = state.context();
    let (tx, rx) = mpsc::channel(RELAY_BUFFER);
    let events = EventStream {
        events: ReceiverStream::new(rx),
        _cancel_on_drop: ctx.cancellation().clone().drop_guard(),
    };
    tokio::spawn(relay(state, ctx, session, body, EventSink(tx)));

    (jar, Sse::new(events).keep_alive(KeepAlive::default()))
}

struct EventSink(mpsc::Sender<EventResult>);

impl EventSink {
    /// Queues one event. Returns false once the client is gone.
    async fn send(&self, kind: &str, line: &str) -> bool {
        // SSE fields cannot carry carriage returns
        let event = Event::default().event(kind).data(line.replace('\r', ""));
        self.0.send(Ok(event)).await.is_ok()
    }
}

/// Drives one run from echoing the script to releasing the attachment.
async fn relay(state: AppState, ctx: Context, session: String, body: Bytes, sink: EventSink) {
    let script = match String::from_utf8(body.to_vec()) {
        Ok(script) => script,
        Err(err) => {
            warn!(%session, error = %err, "Rejected script");
            sink.send("error", &format!("script is not valid UTF-8: {err}")).await;
            return;
        }
    };

    for (i, line) in script.lines().enumerate() {
        let line = if i == 0 {
            format!("$ {line}")
        } else {
            line.to_string()
        };
        if !sink.send("command", &line).await {
            return;
        }
    }

    let run = tokio::select! {
        run = state.runner.run(&ctx, &session, &script) => run,
        _ = ctx.cancellation().cancelled() => {
            debug!(%session, "Client left before the script started");
            return;
        }
    };
    let RunResult { output, release } = match run {
        Ok(result) => result,
        Err(err) => {
            warn!(%session, runner = state.runner.name(), error = %err, "Run failed");
            sink.send("error", &format!("failed to run script: {err}")).await;
            return;
        }
    };

    let mut reader = BufReader::new(output);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => read,
            _ = ctx.cancellation().cancelled() => {
                debug!(%session, "Client disconnected, dropping attachment");
                break;
            }
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches('\n').trim_end_matches('\r');
                if !sink.send("output", text).await {
                    break;
                }
            }
            Err(err) => {
                warn!(%session, error = %err, "Reading output failed");
                sink.send("error", &format!("failed to read output: {err}")).await;
                break;
            }
        }
    }
    drop(reader);

    if let Err(err) = release.release().await {
        warn!(%session, error = %err, "Releasing attachment failed");
        sink.send("error", &err.to_string()).await;
    }
    debug!(%session, "Run finished");
}

async fn reset_sandbox(State(state): State<AppState>, jar: CookieJar) -> Response {
    let (jar, session) = session::resolve(jar);
    match state.runner.reset(&state.context(), &session).await {
        Ok(()) => {
            info!(%session, "Reset sandbox");
            (StatusCode::NO_CONTENT, jar).into_response()
        }
        Err(err) => {
            warn!(%session, error = %err, "Reset failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                jar,
                format!("failed to reset sandbox: {err}"),
            )
                .into_response()
        }
    }
}
