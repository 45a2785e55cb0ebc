use std::convert::Infallible;
use std::env;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;

const DEFAULT_UPSTREAM_PORT: u16 = 19_001;
const DEFAULT_DELAY_MS: u64 = 20;

type MockBody = UnsyncBoxBody<Bytes, io::Error>;

/// Canned upstream behaviour selected with `MOCK_SCENARIO`.
#[derive(Copy, Clone)]
enum MockScenario {
    /// Cumulative text ending with `[DONE]`.
    Text,
    /// Multi-byte characters split across cumulative events.
    Unicode,
    /// One unparseable event between valid ones.
    Malformed,
    /// One event, then the connection is torn down.
    Drop,
    /// Non-2xx status before any event.
    Error,
}

impl MockScenario {
    fn as_str(self) -> &'static str {
        match self {
            MockScenario::Text => "text",
            MockScenario::Unicode => "unicode",
            MockScenario::Malformed => "malformed",
            MockScenario::Drop => "drop",
            MockScenario::Error => "error",
        }
    }
}

struct MockState {
    scenario: MockScenario,
    delay: Duration,
    requests: AtomicU64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_u16("UPSTREAM_PORT", DEFAULT_UPSTREAM_PORT);
    let state = Arc::new(MockState {
        scenario: parse_scenario(),
        delay: Duration::from_millis(env_u64("MOCK_DELAY_MS", DEFAULT_DELAY_MS)),
        requests: AtomicU64::new(0),
    });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock upstream on 127.0.0.1:{port}: {err}"));
    eprintln!(
        "mock sse upstream on 127.0.0.1:{port} (scenario={})",
        state.scenario.as_str()
    );

    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok((stream, remote_addr)) => (stream, remote_addr),
            Err(err) => {
                eprintln!("accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let service_state = Arc::clone(&state);
        let service = service_fn(move |request: Request<Incoming>| {
            let state_ref = Arc::clone(&service_state);
            async move { Ok::<_, Infallible>(handle_request(request, &state_ref).await) }
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, service).await {
                eprintln!("mock upstream connection error from {remote_addr}: {err}");
            }
        });
    }
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_scenario() -> MockScenario {
    match env::var("MOCK_SCENARIO").as_deref() {
        Ok("unicode") => MockScenario::Unicode,
        Ok("malformed") => MockScenario::Malformed,
        Ok("drop") => MockScenario::Drop,
        Ok("error") => MockScenario::Error,
        Ok("text") | Err(_) => MockScenario::Text,
        Ok(other) => {
            eprintln!("unknown MOCK_SCENARIO '{other}', fallback to text");
            MockScenario::Text
        }
    }
}

async fn handle_request(request: Request<Incoming>, state: &Arc<MockState>) -> Response<MockBody> {
    let (parts, body) = request.into_parts();
    drain_request_body(body).await;

    if parts.method == Method::GET && parts.uri.path() == "/_mock/stats" {
        let body = format!(
            "{{\"scenario\":\"{}\",\"requests\":{}}}",
            state.scenario.as_str(),
            state.requests.load(Ordering::Relaxed)
        );
        return simple_response(StatusCode::OK, "application/json", Bytes::from(body));
    }
    if parts.method != Method::POST {
        return simple_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "application/json",
            Bytes::from_static(br#"{"error":"method_not_allowed"}"#),
        );
    }
    state.requests.fetch_add(1, Ordering::Relaxed);

    let events: &'static [&'static str] = match state.scenario {
        MockScenario::Error => {
            return simple_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "application/json",
                Bytes::from_static(br#"{"error":"mock_injected_error"}"#),
            );
        }
        MockScenario::Text => TEXT_EVENTS,
        MockScenario::Unicode => UNICODE_EVENTS,
        MockScenario::Malformed => MALFORMED_EVENTS,
        MockScenario::Drop => DROP_EVENTS,
    };
    let fail_at_end = matches!(state.scenario, MockScenario::Drop);
    streaming_response(events, state.delay, fail_at_end)
}

async fn drain_request_body(mut body: Incoming) {
    while let Some(frame_result) = body.frame().await {
        if frame_result.is_err() {
            break;
        }
    }
}

fn streaming_response(
    events: &'static [&'static str],
    delay: Duration,
    fail_at_end: bool,
) -> Response<MockBody> {
    let frames = futures_util::stream::unfold(0_usize, move |index| async move {
        if index > 0 {
            tokio::time::sleep(delay).await;
        }
        match events.get(index) {
            Some(event) => Some((Ok(Frame::data(Bytes::from_static(event.as_bytes()))), index + 1)),
            None if fail_at_end && index == events.len() => Some((
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "mock drop")),
                index + 1,
            )),
            None => None,
        }
    });

    let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn simple_response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<MockBody> {
    let body = Full::new(body).map_err(|never| match never {}).boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

const TEXT_EVENTS: &[&str] = &[
    "data: {\"response\":\"Hi\"}\n\n",
    "data: {\"response\":\"Hi there\"}\n\n",
    "data: {\"response\":\"Hi there!\"}\n\n",
    "data: [DONE]\n\n",
];
const UNICODE_EVENTS: &[&str] = &[
    "data: {\"response\":\"你\"}\n\n",
    "data: {\"response\":\"你好\"}\n\n",
    "data: {\"response\":\"你好，世界 🌍\"}\n\n",
    "data: [DONE]\n\n",
];
const MALFORMED_EVENTS: &[&str] = &[
    "data: {\"response\":\"partial\"}\n\n",
    "data: {\"response\":\n\n",
    "data: {\"response\":\"partial answer\"}\n\n",
    "data: [DONE]\n\n",
];
const DROP_EVENTS: &[&str] = &["data: {\"response\":\"Hello\"}\n\n"];
