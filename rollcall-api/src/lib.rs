use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, Response, StatusCode},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::net::{AddrParseError, SocketAddr};
use std::path;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch::{Receiver, Sender};
use tower_http::trace::TraceLayer;
use tracing::{
    Span, debug_span, error,
    field::{Empty, display},
    info, instrument, warn,
};

use rollcall_attendance::{AttendanceEvent, Capture, PipelineHandle};
use rollcall_remote::{
    Backlog, DeviceIdentity, HeartbeatRecord, LinkStatus, PollRequest, SessionContext,
};

pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Local API listen address
#[derive(Clone, Debug)]
pub enum LocalAddress {
    Tcp(SocketAddr),
    Unix(path::PathBuf),
}

impl Display for LocalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalAddress::Tcp(socket_addr) => socket_addr.fmt(f),
            LocalAddress::Unix(path) => path.as_path().display().fmt(f),
        }
    }
}

impl FromStr for LocalAddress {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(LocalAddress::Tcp)
            .or_else(|_| Ok(LocalAddress::Unix(path::Path::new(s).to_path_buf())))
    }
}

/// Everything the request handlers get to see of the agent
#[derive(Clone)]
pub struct ApiState {
    pub identity: DeviceIdentity,
    pub session_check_interval: Duration,
    pub link_rx: Receiver<LinkStatus>,
    pub session_rx: Receiver<Option<SessionContext>>,
    pub heartbeat_rx: Receiver<HeartbeatRecord>,
    pub backlog_rx: Receiver<Backlog>,
    pub poll_tx: Sender<PollRequest>,
    pub pipeline: PipelineHandle,
}

/// Start the API
///
/// Receives a listener already bound to the right address, the external
/// collector hands attendance records over through it.
#[instrument(name = "api", skip_all)]
pub async fn start(listener: Listener, state: ApiState) {
    let api_span = Span::current();
    let app = Router::new()
        .route("/v1/ping", get(|| async { "OK" }))
        .route("/v1/status", get(get_status))
        .route("/v1/attendance", post(capture_attendance))
        .route(
            "/v1/attendance/failed",
            get(list_failed).delete(flush_failed),
        )
        .route("/v1/session/refresh", post(refresh_session));

    // Enable tracing
    let app = app.layer(
        TraceLayer::new_for_http()
            .make_span_with(move |request: &Request<Body>| {
                debug_span!(parent: &api_span, "request",
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                    status = Empty,
                )
            })
            .on_response(|response: &Response<Body>, _: Duration, span: &Span| {
                span.record("status", display(response.status()));
            }),
    );

    let app = app.with_state(state);

    info!("ready");

    let res = match listener {
        Listener::Tcp(listener) => axum::serve(listener, app).await,
        Listener::Unix(listener) => axum::serve(listener, app).await,
    };
    if let Err(e) = res {
        error!("local API stopped: {e}");
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct DeviceStatus {
    device_id: String,
    display_name: String,
    location: String,
    registered: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SessionStatus {
    #[serde(flatten)]
    context: SessionContext,
    stale: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AgentStatus {
    device: DeviceStatus,
    link: LinkStatus,
    session: Option<SessionStatus>,
    heartbeat: HeartbeatRecord,
    backlog: Backlog,
}

/// Handle `GET /v1/status`
async fn get_status(State(state): State<ApiState>) -> Json<AgentStatus> {
    let now = Utc::now();
    let identity = &state.identity;
    let session = state.session_rx.borrow().clone().map(|context| {
        let stale = context.is_stale(now, state.session_check_interval) || context.is_expired(now);
        SessionStatus { context, stale }
    });

    Json(AgentStatus {
        device: DeviceStatus {
            device_id: identity.device_id.to_string(),
            display_name: identity.display_name.clone(),
            location: identity.location.clone(),
            registered: identity.registered,
        },
        link: *state.link_rx.borrow(),
        session,
        heartbeat: state.heartbeat_rx.borrow().clone(),
        backlog: *state.backlog_rx.borrow(),
    })
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AttendanceRequest {
    student_token: String,
    timestamp: Option<DateTime<Utc>>,
}

/// Handle `POST /v1/attendance`
///
/// Queues the record for delivery to the server
async fn capture_attendance(
    State(state): State<ApiState>,
    Json(request): Json<AttendanceRequest>,
) -> Result<(StatusCode, Json<Capture>), StatusCode> {
    let student_token = request.student_token.trim();
    if student_token.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    match state
        .pipeline
        .capture(student_token.to_owned(), request.timestamp)
        .await
    {
        Ok(capture) => Ok((StatusCode::ACCEPTED, Json(capture))),
        Err(e) => {
            warn!("{e}");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// Handle `GET /v1/attendance/failed`
async fn list_failed(
    State(state): State<ApiState>,
) -> Result<Json<Vec<AttendanceEvent>>, StatusCode> {
    state
        .pipeline
        .failed()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

/// Handle `DELETE /v1/attendance/failed`
///
/// Removes the failed events from the device, returning them to the caller
async fn flush_failed(
    State(state): State<ApiState>,
) -> Result<Json<Vec<AttendanceEvent>>, StatusCode> {
    state
        .pipeline
        .flush_failed()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

/// Handle `POST /v1/session/refresh`
///
/// Triggers a session poll without waiting for the next interval
async fn refresh_session(State(state): State<ApiState>) -> StatusCode {
    if state.poll_tx.send(PollRequest).is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rollcall_attendance::{
        AttendanceClient, Pipeline, StateStore, SubmissionConfig, start_submit,
    };
    use rollcall_remote::LinkState;
    use serde_json::{Value, json};
    use tokio::sync::watch;

    struct TestServer {
        port: u16,
        poll_rx: watch::Receiver<PollRequest>,
        session_tx: watch::Sender<Option<SessionContext>>,
        _link_tx: watch::Sender<LinkStatus>,
    }

    async fn setup_test_server() -> TestServer {
        let identity = DeviceIdentity {
            device_id: "ESP32_Bridge_001".into(),
            display_name: "CS101_Classroom_Bridge".into(),
            location: "LT1".into(),
            registered: true,
        };
        let (link_tx, link_rx) = watch::channel(LinkStatus {
            state: LinkState::Connected,
            reconnects: 3,
        });
        let (session_tx, session_rx) = watch::channel(None);
        let (_, heartbeat_rx) = watch::channel(HeartbeatRecord::default());
        let (backlog_tx, backlog_rx) = watch::channel(Backlog::default());
        let (poll_tx, poll_rx) = watch::channel(PollRequest);

        // a pipeline without a server only captures events
        let config = SubmissionConfig::default();
        let pipeline = Pipeline::<AttendanceClient>::new(
            &config,
            StateStore::memory(),
            None,
            Vec::new(),
            session_rx.clone(),
            backlog_tx,
        );
        let (handle, cmd_rx) = PipelineHandle::channel(8);
        tokio::spawn(start_submit(pipeline, link_rx.clone(), cmd_rx));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(start(
            Listener::Tcp(listener),
            ApiState {
                identity,
                session_check_interval: config.session_check_interval,
                link_rx,
                session_rx,
                heartbeat_rx,
                backlog_rx,
                poll_tx,
                pipeline: handle,
            },
        ));

        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        TestServer {
            port,
            poll_rx,
            session_tx,
            _link_tx: link_tx,
        }
    }

    fn active_session() -> Option<SessionContext> {
        Some(SessionContext {
            session_id: Some("42".into()),
            course_id: Some("CS101".into()),
            course_title: Some("Intro to CS".into()),
            expires_at: None,
            fetched_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_ping() {
        let server = setup_test_server().await;
        let response = reqwest::get(format!("http://127.0.0.1:{}/v1/ping", server.port))
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn test_capture_attendance() {
        let server = setup_test_server().await;
        server.session_tx.send_replace(active_session());
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/v1/attendance", server.port);

        let response = client
            .post(&url)
            .json(&json!({"studentToken": "tok-1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        let first: Value = response.json().await.unwrap();
        assert_eq!(first["outcome"], "captured");
        assert_eq!(first["sessionId"], "42");

        let response = client
            .post(&url)
            .json(&json!({"studentToken": "tok-1", "timestamp": "2026-03-02T09:00:00Z"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        let second: Value = response.json().await.unwrap();
        assert_eq!(second["outcome"], "collapsed");
        assert_eq!(second["id"], first["id"]);
    }

    #[tokio::test]
    async fn test_capture_rejects_empty_tokens() {
        let server = setup_test_server().await;
        let response = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/v1/attendance", server.port))
            .json(&json!({"studentToken": "  "}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_status() {
        let server = setup_test_server().await;
        server.session_tx.send_replace(active_session());
        let client = reqwest::Client::new();
        client
            .post(format!("http://127.0.0.1:{}/v1/attendance", server.port))
            .json(&json!({"studentToken": "tok-1"}))
            .send()
            .await
            .unwrap();

        let status: Value = client
            .get(format!("http://127.0.0.1:{}/v1/status", server.port))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(status["device"]["deviceId"], "ESP32_Bridge_001");
        assert_eq!(status["link"], json!({"state": "Connected", "reconnects": 3}));
        assert_eq!(status["session"]["sessionId"], "42");
        assert_eq!(status["session"]["stale"], false);
        assert_eq!(status["backlog"], json!({"pending": 1, "failed": 0}));
    }

    #[tokio::test]
    async fn test_failed_events_start_empty() {
        let server = setup_test_server().await;
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/v1/attendance/failed", server.port);

        let listed: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(listed, json!([]));

        let response = client.delete(&url).send().await.unwrap();
        assert_eq!(response.status(), 200);
        let flushed: Value = response.json().await.unwrap();
        assert_eq!(flushed, json!([]));
    }

    #[tokio::test]
    async fn test_session_refresh() {
        let mut server = setup_test_server().await;
        let response = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/v1/session/refresh", server.port))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 202);
        assert!(server.poll_rx.changed().await.is_ok());
    }
}
