//! HTTP export of the liveness monitor
//!
//! Serves the fleet health as JSON for dashboards and lets operators ask
//! sensors for an immediate reading. Every internal failure is mapped to a
//! JSON error body; nothing here panics on bad input.

use crate::monitor::{LivenessMonitor, StatusSummary};
use crate::protocol::{encode_payload, Command, CommandTarget, COMMAND_TOPIC};
use crate::transport::retry::{publish_with_retry, RetryPolicy};
use crate::transport::{PublishOutcome, QoS, Transport};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::{Filter, Rejection, Reply};

/// Acknowledgment wait for a trigger command
pub const TRIGGER_TIMEOUT: Duration = Duration::from_secs(5);

const INDEX_TEXT: &str = "TechTemp System Monitor API\n\nEndpoints:\n\
/api/system/health - Full system status\n\
/api/system/status - Simple status\n\
/api/trigger-reading - Trigger sensor reading (POST)";

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Failed to bind HTTP server: {0}")]
    Bind(#[from] warp::Error),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    status: &'static str,
    message: String,
    timestamp: i64,
}

#[derive(Debug, Default, Deserialize)]
struct TriggerRequest {
    sensor_id: Option<i64>,
}

/// HTTP server over a monitor and a transport
pub struct HttpServer {
    port: u16,
    monitor: Arc<LivenessMonitor>,
    transport: Arc<dyn Transport>,
}

impl HttpServer {
    pub fn new(port: u16, monitor: Arc<LivenessMonitor>, transport: Arc<dyn Transport>) -> Self {
        Self {
            port,
            monitor,
            transport,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All routes with rejection handling and CORS applied
    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let monitor = self.monitor.clone();
        let with_monitor = warp::any().map(move || monitor.clone());
        let transport = self.transport.clone();
        let with_transport = warp::any().map(move || transport.clone());

        // GET /api/system/health - full fleet health
        let health_route = warp::path!("api" / "system" / "health")
            .and(warp::get())
            .and(with_monitor.clone())
            .and_then(system_health);

        // GET /api/system/status - compact status
        let status_route = warp::path!("api" / "system" / "status")
            .and(warp::get())
            .and(with_monitor.clone())
            .and_then(system_status);

        // POST /api/trigger-reading - ask sensors for a reading now
        let trigger_route = warp::path!("api" / "trigger-reading")
            .and(warp::post())
            .and(warp::body::bytes())
            .and(with_monitor)
            .and(with_transport)
            .and_then(trigger_reading);

        // GET / and GET /health - endpoint listing
        let index_route = warp::path::end()
            .or(warp::path!("health"))
            .unify()
            .and(warp::get())
            .map(|| INDEX_TEXT);

        let cors = warp::cors()
            .allow_any_origin()
            .allow_methods(vec!["GET", "POST", "OPTIONS"])
            .allow_header("content-type");

        health_route
            .or(status_route)
            .or(trigger_route)
            .or(index_route)
            .recover(handle_rejection)
            .with(cors)
    }

    /// Serve until `shutdown` resolves
    pub async fn run(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), HttpError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let (bound, server) =
            warp::serve(self.routes()).try_bind_with_graceful_shutdown(addr, shutdown)?;
        info!(address = %bound, "HTTP server listening");
        server.await;
        info!("HTTP server stopped");
        Ok(())
    }
}

fn json_reply<T: Serialize>(body: &T, status: StatusCode) -> WithStatus<Json> {
    warp::reply::with_status(warp::reply::json(body), status)
}

fn error_reply(error: &'static str, status: StatusCode) -> WithStatus<Json> {
    json_reply(&ErrorResponse { error }, status)
}

async fn system_health(monitor: Arc<LivenessMonitor>) -> Result<WithStatus<Json>, Infallible> {
    Ok(match monitor.snapshot().await {
        Ok(health) => json_reply(&health, StatusCode::OK),
        Err(e) => {
            warn!(error = %e, "Health requested before monitor initialization");
            error_reply("Monitor not initialized", StatusCode::INTERNAL_SERVER_ERROR)
        }
    })
}

async fn system_status(monitor: Arc<LivenessMonitor>) -> Result<WithStatus<Json>, Infallible> {
    Ok(match monitor.snapshot().await {
        Ok(health) => json_reply(&StatusSummary::from(&health), StatusCode::OK),
        Err(_) => error_reply("Monitor not available", StatusCode::INTERNAL_SERVER_ERROR),
    })
}

async fn trigger_reading(
    body: Bytes,
    monitor: Arc<LivenessMonitor>,
    transport: Arc<dyn Transport>,
) -> Result<WithStatus<Json>, Infallible> {
    let request = parse_trigger_request(&body);
    let target = CommandTarget::from_requested(request.sensor_id);

    let payload = match encode_payload(&Command::capture(target)) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Failed to encode capture command");
            return Ok(trigger_failed());
        }
    };

    let outcome = publish_with_retry(
        transport.as_ref(),
        COMMAND_TOPIC,
        &payload,
        QoS::AtLeastOnce,
        false,
        &RetryPolicy::single(TRIGGER_TIMEOUT),
    )
    .await;

    if outcome != PublishOutcome::Ok {
        warn!(command_target = ?target, outcome = %outcome, "Trigger command not delivered");
        return Ok(trigger_failed());
    }

    info!(command_target = ?target, "Reading triggered");
    let scope = match target {
        CommandTarget::Sensor(_) => "specific",
        CommandTarget::All => "all",
    };
    Ok(json_reply(
        &TriggerResponse {
            status: "success",
            message: format!("Reading triggered for sensor {scope}"),
            timestamp: monitor.now().timestamp(),
        },
        StatusCode::OK,
    ))
}

fn trigger_failed() -> WithStatus<Json> {
    error_reply("Failed to trigger reading", StatusCode::INTERNAL_SERVER_ERROR)
}

/// Missing or unreadable bodies target every sensor
fn parse_trigger_request(body: &[u8]) -> TriggerRequest {
    if body.iter().all(u8::is_ascii_whitespace) {
        return TriggerRequest::default();
    }
    serde_json::from_slice(body).unwrap_or_else(|e| {
        debug!(error = %e, "Unreadable trigger body, targeting all sensors");
        TriggerRequest::default()
    })
}

async fn handle_rejection(rejection: Rejection) -> Result<WithStatus<Json>, Infallible> {
    if rejection.is_not_found() {
        Ok(error_reply("Endpoint not found", StatusCode::NOT_FOUND))
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        Ok(error_reply("Method not allowed", StatusCode::METHOD_NOT_ALLOWED))
    } else {
        warn!(rejection = ?rejection, "Unhandled HTTP rejection");
        Ok(error_reply("Bad request", StatusCode::BAD_REQUEST))
    }
}
