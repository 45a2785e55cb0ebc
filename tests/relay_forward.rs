use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use chat_relay::config::{
    AppConfig, FeaturesConfig, MockMethod, MockRouteConfig, RelayConfig, ServerConfig,
    UpstreamConfig,
};
use chat_relay::routing::dispatch_request;
use chat_relay::state::AppState;
use chat_relay::transport::UpstreamClient;
use http_body_util::BodyExt;
use serde_json::{json, Value};

fn build_config(url: String) -> AppConfig {
    AppConfig {
        server: ServerConfig::default(),
        upstream: UpstreamConfig::with_url(url, "llama3"),
        relay: RelayConfig::default(),
        features: FeaturesConfig::default(),
        mock_routes: vec![MockRouteConfig {
            path: "/api/agent/html".to_string(),
            method: MockMethod::Get,
            status: 200,
            content_type: "text/html; charset=utf-8".to_string(),
            body: "<h1>hello</h1>".to_string(),
        }],
    }
}

fn build_state(url: String) -> Arc<AppState> {
    Arc::new(AppState::from_config(build_config(url)).expect("build state"))
}

async fn spawn_upstream(app: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/api/generate"), server)
}

fn sse_response(chunks: Vec<&'static str>) -> Response {
    let stream = futures_util::stream::iter(
        chunks
            .into_iter()
            .map(|chunk| Ok::<_, std::io::Error>(Bytes::from_static(chunk.as_bytes()))),
    );
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .expect("build sse response")
}

fn chat_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).expect("serialize")))
        .expect("build request")
}

async fn read_body(response: Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    String::from_utf8(body.to_vec()).expect("utf8 body")
}

#[tokio::test]
async fn test_relay_cumulative_stream_as_deltas() {
    let app = Router::new().route(
        "/api/generate",
        post(|| async {
            sse_response(vec![
                "data: {\"response\":\"Hi\"}\n\n",
                "data: {\"response\":\"Hi there\"}\n\n",
                "data: {\"response\":\"Hi there!\"}\n\n",
                "data: [DONE]\n\n",
            ])
        }),
    );
    let (url, server) = spawn_upstream(app).await;
    let state = build_state(url);

    let request = chat_request(&json!({
        "messages": [{"role": "user", "content": "hello"}],
        "model": "llama3"
    }));
    let response = dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert_eq!(response.headers()["cache-control"], "no-cache");

    let body = read_body(response).await;
    assert_eq!(
        body,
        concat!(
            "data: {\"choices\":[{\"role\":\"assistant\",\"content\":\"Hi\"}],\"model\":\"llama3\"}\n\n",
            "data: {\"choices\":[{\"role\":\"assistant\",\"content\":\" there\"}],\"model\":\"llama3\"}\n\n",
            "data: {\"choices\":[{\"role\":\"assistant\",\"content\":\"!\"}],\"model\":\"llama3\"}\n\n",
            "data: [DONE]\n\n",
        )
    );

    server.abort();
}

#[tokio::test]
async fn test_upstream_request_shape_and_default_model() {
    let captured: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let capture = Arc::clone(&captured);
    let app = Router::new().route(
        "/api/generate",
        post(move |Json(body): Json<Value>| {
            let capture = Arc::clone(&capture);
            async move {
                *capture.lock().expect("capture lock") = Some(body);
                sse_response(vec!["data: {\"response\":\"ok\"}\n\n"])
            }
        }),
    );
    let (url, server) = spawn_upstream(app).await;
    let state = build_state(url);

    let request = chat_request(&json!({
        "messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "message": "ping"}
        ]
    }));
    let response = dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_body(response).await;
    assert!(body.contains("\"content\":\"ok\""));
    assert!(body.contains("\"model\":\"llama3\""));
    assert!(body.ends_with("data: [DONE]\n\n"));

    let upstream_body = captured
        .lock()
        .expect("capture lock")
        .clone()
        .expect("upstream saw a request");
    assert_eq!(upstream_body["model"], "llama3");
    assert_eq!(upstream_body["stream"], true);
    assert_eq!(upstream_body["max_tokens"], 2048);
    assert_eq!(upstream_body["messages"][0]["role"], "system");
    assert_eq!(upstream_body["messages"][1]["role"], "user");
    assert_eq!(upstream_body["messages"][1]["content"], "ping");

    server.abort();
}

#[tokio::test]
async fn test_unreachable_upstream_returns_bad_gateway() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind placeholder");
    let addr = listener.local_addr().expect("placeholder addr");
    drop(listener);

    let state = build_state(format!("http://{addr}/api/generate"));
    let request = chat_request(&json!({
        "messages": [{"role": "user", "content": "hello"}]
    }));
    let response = dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let payload: Value = serde_json::from_str(&read_body(response).await).expect("json error");
    assert_eq!(payload["status_code"], 10502);
    assert!(payload["message"].as_str().is_some());
}

#[tokio::test]
async fn test_upstream_error_status_returns_bad_gateway() {
    let app = Router::new().route(
        "/api/generate",
        post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "model loading") }),
    );
    let (url, server) = spawn_upstream(app).await;
    let state = build_state(url);

    let request = chat_request(&json!({
        "messages": [{"role": "user", "content": "hello"}]
    }));
    let response = dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let payload: Value = serde_json::from_str(&read_body(response).await).expect("json error");
    assert_eq!(payload["status_code"], 10502);
    assert!(payload["message"]
        .as_str()
        .is_some_and(|message| message.contains("model loading")));

    server.abort();
}

#[tokio::test]
async fn test_stalled_error_body_still_returns_bad_gateway() {
    let app = Router::new().route(
        "/api/generate",
        post(|| async {
            let first = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(
                Bytes::from_static(b"partial"),
            )]);
            let stream = futures_util::StreamExt::chain(first, futures_util::stream::pending());
            Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(Body::from_stream(stream))
                .expect("build error response")
        }),
    );
    let (url, server) = spawn_upstream(app).await;
    let config = build_config(url);
    let upstream = UpstreamClient::new(&config.server, &config.upstream)
        .expect("upstream client")
        .with_read_timeout(Duration::from_millis(200));
    let state = Arc::new(AppState::new(config, upstream));

    let request = chat_request(&json!({
        "messages": [{"role": "user", "content": "hello"}]
    }));
    let response = tokio::time::timeout(
        Duration::from_secs(3),
        dispatch_request(state, Arc::<str>::from(""), request),
    )
    .await
    .expect("error body read should be bounded by the read timeout")
    .expect("dispatch");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let payload: Value = serde_json::from_str(&read_body(response).await).expect("json error");
    assert_eq!(payload["status_code"], 10502);
    assert!(payload["message"]
        .as_str()
        .is_some_and(|message| message.contains("503")));

    server.abort();
}

struct ReleaseFlag(Arc<AtomicBool>);

impl Drop for ReleaseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_caller_disconnect_releases_upstream() {
    let released = Arc::new(AtomicBool::new(false));
    let upstream_flag = Arc::clone(&released);
    let app = Router::new().route(
        "/api/generate",
        post(move || {
            let flag = ReleaseFlag(Arc::clone(&upstream_flag));
            async move {
                let stream = futures_util::stream::unfold(
                    (flag, String::new()),
                    |(flag, mut text)| async move {
                        if !text.is_empty() {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        text.push('x');
                        let frame = format!("data: {{\"response\":\"{text}\"}}\n\n");
                        Some((Ok::<_, std::io::Error>(Bytes::from(frame)), (flag, text)))
                    },
                );
                Response::builder()
                    .header("content-type", "text/event-stream")
                    .body(Body::from_stream(stream))
                    .expect("build sse response")
            }
        }),
    );
    let (url, server) = spawn_upstream(app).await;
    let state = build_state(url);

    let request = chat_request(&json!({
        "messages": [{"role": "user", "content": "hello"}]
    }));
    let response = dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let first = body
        .frame()
        .await
        .expect("first frame")
        .expect("first frame ok")
        .into_data()
        .expect("data frame");
    assert!(first.starts_with(b"data: {\"choices\""));
    assert!(!released.load(Ordering::SeqCst));

    drop(body);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        released.load(Ordering::SeqCst),
        "upstream body should be dropped once the caller goes away"
    );

    server.abort();
}

#[tokio::test]
async fn test_mid_stream_failure_ends_without_done() {
    let app = Router::new().route(
        "/api/generate",
        post(|| async {
            let stream = futures_util::stream::unfold(0_u8, |step| async move {
                match step {
                    0 => Some((
                        Ok(Bytes::from_static(b"data: {\"response\":\"Hello\"}\n\n")),
                        1,
                    )),
                    1 => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Some((Err(std::io::Error::other("upstream reset")), 2))
                    }
                    _ => None,
                }
            });
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(stream))
                .expect("build sse response")
        }),
    );
    let (url, server) = spawn_upstream(app).await;
    let state = build_state(url);

    let request = chat_request(&json!({
        "messages": [{"role": "user", "content": "hello"}]
    }));
    let response = dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let first = body
        .frame()
        .await
        .expect("first frame")
        .expect("first frame ok")
        .into_data()
        .expect("data frame");
    assert_eq!(
        &first[..],
        b"data: {\"choices\":[{\"role\":\"assistant\",\"content\":\"Hello\"}],\"model\":\"llama3\"}\n\n"
    );

    let mut saw_error = false;
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                let data = frame.into_data().unwrap_or_default();
                assert!(!data.windows(6).any(|w| w == b"[DONE]"));
            }
            Err(_) => {
                saw_error = true;
                break;
            }
        }
    }
    assert!(saw_error, "relay should end abruptly");

    server.abort();
}

#[tokio::test]
async fn test_stalled_upstream_ends_relay_after_idle_timeout() {
    let app = Router::new().route(
        "/api/generate",
        post(|| async {
            let first = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(
                Bytes::from_static(b"data: {\"response\":\"Hel\"}\n\n"),
            )]);
            let stream = futures_util::StreamExt::chain(first, futures_util::stream::pending());
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(stream))
                .expect("build sse response")
        }),
    );
    let (url, server) = spawn_upstream(app).await;
    let config = build_config(url);
    let upstream = UpstreamClient::new(&config.server, &config.upstream)
        .expect("upstream client")
        .with_read_timeout(Duration::from_millis(200));
    let state = Arc::new(AppState::new(config, upstream));

    let request = chat_request(&json!({
        "messages": [{"role": "user", "content": "hello"}]
    }));
    let response = dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let first = body
        .frame()
        .await
        .expect("first frame")
        .expect("first frame ok")
        .into_data()
        .expect("data frame");
    assert!(first.ends_with(b"\"content\":\"Hel\"}],\"model\":\"llama3\"}\n\n"));

    let next = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("relay should not hang past the idle timeout");
    assert!(matches!(next, Some(Err(_))));

    server.abort();
}

#[tokio::test]
async fn test_malformed_only_stream_returns_bad_gateway() {
    let app = Router::new().route(
        "/api/generate",
        post(|| async {
            sse_response(vec![
                "data: {oops\n\n",
                "data: not json\n\n",
                "data: {\"response\":\n\n",
            ])
        }),
    );
    let (url, server) = spawn_upstream(app).await;
    let state = build_state(url);

    let request = chat_request(&json!({
        "messages": [{"role": "user", "content": "hello"}]
    }));
    let response = dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    server.abort();
}

#[tokio::test]
async fn test_empty_messages_rejected() {
    let state = build_state("http://127.0.0.1:9/api/generate".to_string());
    let request = chat_request(&json!({ "messages": [] }));
    let response = dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let payload: Value = serde_json::from_str(&read_body(response).await).expect("json error");
    assert_eq!(payload["status_code"], 10422);
}

#[tokio::test]
async fn test_malformed_body_rejected() {
    let state = build_state("http://127.0.0.1:9/api/generate".to_string());
    let request = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .body(Body::from("{not json"))
        .expect("build request");
    let response = dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let state = build_state("http://127.0.0.1:9/api/generate".to_string());
    let request = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .body(Body::from(vec![b'a'; 3 * 1024 * 1024]))
        .expect("build request");
    let response = dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_health_mock_and_fallback_routes() {
    let state = build_state("http://127.0.0.1:9/api/generate".to_string());

    let health = dispatch_request(
        Arc::clone(&state),
        Arc::<str>::from(""),
        Request::builder()
            .uri("/")
            .body(Body::empty())
            .expect("build request"),
    )
    .await
    .expect("dispatch");
    assert_eq!(health.status(), StatusCode::OK);
    let payload: Value = serde_json::from_str(&read_body(health).await).expect("json health");
    assert_eq!(payload["config"]["chat_path"], "/api/chat");
    assert_eq!(payload["config"]["mock_routes_count"], 1);

    let mock = dispatch_request(
        Arc::clone(&state),
        Arc::<str>::from(""),
        Request::builder()
            .uri("/api/agent/html")
            .body(Body::empty())
            .expect("build request"),
    )
    .await
    .expect("dispatch");
    assert_eq!(mock.status(), StatusCode::OK);
    assert_eq!(mock.headers()["content-type"], "text/html; charset=utf-8");
    assert_eq!(read_body(mock).await, "<h1>hello</h1>");

    let wrong_method = dispatch_request(
        Arc::clone(&state),
        Arc::<str>::from(""),
        Request::builder()
            .method("GET")
            .uri("/api/chat")
            .body(Body::empty())
            .expect("build request"),
    )
    .await
    .expect("dispatch");
    assert_eq!(wrong_method.status(), StatusCode::METHOD_NOT_ALLOWED);

    let missing = dispatch_request(
        state,
        Arc::<str>::from(""),
        Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .expect("build request"),
    )
    .await
    .expect("dispatch");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}
