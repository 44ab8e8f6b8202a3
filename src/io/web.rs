//! HTTP presentation layer
//!
//! Serves the live state as JSON, the open statistics, and a server-sent
//! events stream fed by the event bus. Uses hyper for the HTTP server.
//! Stream clients pick topics via query parameters
//! (`?spaceOpen=1&spaceDevices=1&...`); their bus registrations are released
//! when the client goes away.

use crate::domain::AppState;
use crate::infra::config::WebConfig;
use crate::io::store::Store;
use crate::services::event_bus::{EventBus, RegistrationId, Topic};
use crate::services::history::open_statistics;
use bytes::Bytes;
use chrono::{Datelike, Utc};
use futures::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(600);

type ApiBody = UnsyncBoxBody<Bytes, Infallible>;

fn full(data: impl Into<Bytes>) -> ApiBody {
    Full::new(data.into()).boxed_unsync()
}

fn json_response(data: &impl Serialize) -> Response<ApiBody> {
    let body = match serde_json::to_vec(data) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "json_serialize_failed");
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(full("internal error"))
                .expect("static response should not fail");
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(full(body))
        .expect("static response should not fail")
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
    bus: Arc<EventBus>,
    store: Arc<Store>,
) -> Result<Response<ApiBody>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(full("ok"))
            .expect("static response should not fail")),
        (&Method::GET, "/api/open-state") => Ok(json_response(&state.open_snapshot())),
        (&Method::GET, "/api/space-devices") => Ok(json_response(&state.devices_snapshot())),
        (&Method::GET, "/api/power-usage") => Ok(json_response(&state.power_snapshot())),
        (&Method::GET, "/api/open-statistics") => Ok(open_statistics_response(&store).await),
        (&Method::GET, "/api/status-stream") => {
            let query = req.uri().query().unwrap_or("").to_string();
            Ok(status_stream(&query, state, bus))
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full("Not Found"))
            .expect("static response should not fail")),
    }
}

async fn open_statistics_response(store: &Store) -> Response<ApiBody> {
    let rows = match store.all_space_open_states().await {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "open_statistics_query_failed");
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(full("internal error"))
                .expect("static response should not fail");
        }
    };

    let tables = open_statistics(&rows, Utc::now().year());
    if tables.is_empty() {
        return json_response(&serde_json::Value::Null);
    }
    json_response(&tables)
}

/// `?spaceOpen=1&mqtt=1&...` - did the client ask for this topic?
fn wants(query: &str, topic: Topic) -> bool {
    query.split('&').any(|pair| {
        let mut parts = pair.splitn(2, '=');
        parts.next() == Some(topic.as_str()) && parts.next() == Some("1")
    })
}

fn sse_frame(name: &str, data: &impl Serialize) -> Option<Bytes> {
    match serde_json::to_string(data) {
        Ok(json) => Some(Bytes::from(format!("event: {name}\ndata: {json}\n\n"))),
        Err(e) => {
            warn!(error = %e, event = %name, "sse_serialize_failed");
            None
        }
    }
}

/// The current payload of a topic, framed for the stream.
fn topic_frame(state: &AppState, topic: Topic) -> Option<Bytes> {
    let name = topic.as_str();
    match topic {
        Topic::Mqtt => sse_frame(name, &state.mqtt_snapshot()),
        Topic::SpaceOpen => sse_frame(name, &state.open_snapshot().space),
        Topic::WorkshopOpen => sse_frame(name, &state.open_snapshot().workshop),
        Topic::LabOpen => sse_frame(name, &state.open_snapshot().lab),
        Topic::SpaceDevices => sse_frame(name, &state.devices_snapshot()),
        Topic::PowerUsage => sse_frame(name, &state.power_snapshot()),
    }
}

fn status_stream(query: &str, state: Arc<AppState>, bus: Arc<EventBus>) -> Response<ApiBody> {
    debug!(query = %query, "status_stream_started");

    // a small buffer so a burst between polls does not drop events
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    let mut registrations: Vec<RegistrationId> = Vec::with_capacity(8);

    for topic in Topic::ALL {
        if !wants(query, topic) {
            continue;
        }

        // initial snapshot of every requested topic
        if let Some(frame) = topic_frame(&state, topic) {
            let _ = tx.try_send(frame);
        }

        let tx = tx.clone();
        let state = Arc::clone(&state);
        registrations.push(bus.subscribe(topic, move |topic| {
            if let Some(frame) = topic_frame(&state, topic) {
                if tx.try_send(frame).is_err() {
                    debug!(topic = %topic.as_str(), "status_stream_client_lagging");
                }
            }
        }));
    }

    // keepalive until the client goes away or stops reading
    {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.try_send(Bytes::from_static(b"event: keepalive\ndata: \"\"\n\n")).is_err() {
                    debug!("stopping_keepalive");
                    return;
                }
            }
        });
    }

    // release the bus registrations once the client disconnects
    {
        let bus = Arc::clone(&bus);
        let tx = tx.clone();
        tokio::spawn(async move {
            tx.closed().await;
            for id in &registrations {
                bus.unsubscribe(*id);
            }
            debug!("status_stream_closed");
        });
    }

    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|bytes| (Ok::<_, Infallible>(Frame::data(bytes)), rx))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Access-Control-Allow-Origin", "*")
        .body(StreamBody::new(stream).boxed_unsync())
        .expect("static response should not fail")
}

/// Start the HTTP server
pub async fn start_web_server(
    config: &WebConfig,
    state: Arc<AppState>,
    bus: Arc<EventBus>,
    store: Arc<Store>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(addr = %addr, "web_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = Arc::clone(&state);
                        let bus = Arc::clone(&bus);
                        let store = Arc::clone(&store);

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = Arc::clone(&state);
                                let bus = Arc::clone(&bus);
                                let store = Arc::clone(&store);
                                async move { handle_request(req, state, bus, store).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                // stream clients disconnecting mid-response is routine
                                debug!(error = %e, "http_connection_ended");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "web_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("web_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
