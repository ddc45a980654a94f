//! Snapshot of the controller state and the HTTP endpoint that exposes it.
use std::future::Future;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::FLEETQ_VERSION;
use crate::controller::ControllerService;
use crate::controller::job::ResultMessage;
use crate::controller::registry::Worker;
use crate::controller::scaling::ScalingOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobCounters {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub unroutable: u64,
    /// Completed jobs whose message could not be deleted from the queue.
    pub unacknowledged: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub at: DateTime<Utc>,
    pub outcome: ScalingOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub name: String,
    pub version: String,
    pub state: ControllerState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cycles: u64,
    pub jobs: JobCounters,
    pub max_fleet_size: u32,
    pub workers: Vec<Worker>,
    pub last_scaling: Option<ScalingEvent>,
    pub last_result: Option<ResultMessage>,
    pub last_error: Option<ErrorRecord>,
}

impl ControllerStatus {
    pub fn new(name: String, max_fleet_size: u32) -> Self {
        let now = Utc::now();
        Self {
            name,
            version: FLEETQ_VERSION.to_string(),
            state: ControllerState::Starting,
            started_at: now,
            updated_at: now,
            cycles: 0,
            jobs: JobCounters::default(),
            max_fleet_size,
            workers: vec![],
            last_scaling: None,
            last_result: None,
            last_error: None,
        }
    }

    pub fn record_error(&mut self, message: String) {
        self.last_error = Some(ErrorRecord {
            at: Utc::now(),
            message,
        });
    }
}

pub fn status_routes() -> Router<ControllerService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/stop", post(stop))
}

async fn healthz(State(service): State<ControllerService>) -> impl IntoResponse {
    match service.status().state {
        ControllerState::Stopped => (StatusCode::SERVICE_UNAVAILABLE, "stopped"),
        _ => (StatusCode::OK, "ok"),
    }
}

async fn status(State(service): State<ControllerService>) -> Json<ControllerStatus> {
    Json(service.status())
}

async fn stop(State(service): State<ControllerService>) -> StatusCode {
    log::info!("Stop was requested over HTTP");
    service.request_stop();
    StatusCode::ACCEPTED
}

/// Serves the status endpoints until `shutdown` resolves.
pub async fn serve_status(
    listener: TcpListener,
    service: ControllerService,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(address) = listener.local_addr() {
        log::info!("Status endpoint listening on http://{address}");
    }
    let app = status_routes().with_state(service);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    use super::{ControllerState, ControllerStatus, serve_status};
    use crate::common::rpc::make_rpc_queue;
    use crate::controller::service::{ControllerMessage, ControllerService};

    #[tokio::test]
    async fn status_endpoints() {
        let (sender, mut receiver) = make_rpc_queue();
        let mut status = ControllerStatus::new("classifier".to_string(), 20);
        status.cycles = 7;
        let (status_sender, status_receiver) = watch::channel(status);
        let service = ControllerService::new(sender, status_receiver);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(serve_status(listener, service, std::future::pending()));
        let client = reqwest::Client::new();

        let response = client
            .get(format!("http://{address}/healthz"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let fetched: ControllerStatus = client
            .get(format!("http://{address}/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetched.name, "classifier");
        assert_eq!(fetched.cycles, 7);
        assert_eq!(fetched.state, ControllerState::Starting);

        let response = client
            .post(format!("http://{address}/stop"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        assert!(matches!(
            receiver.recv().await,
            Some(ControllerMessage::Stop { response: None })
        ));

        status_sender.send_modify(|status| status.state = ControllerState::Stopped);
        let response = client
            .get(format!("http://{address}/healthz"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
    }
}
