use std::sync::Arc;

use axum::{
    Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    clients::{health::HealthChecker, store::TicketStore},
    models::{
        health::HealthStatus,
        response::ApiResponse,
        ticket::{NewTicket, Ticket},
    },
    services::publisher::TicketPublisher,
};

pub struct AppState {
    pub health_checker: HealthChecker,
    pub store: Arc<dyn TicketStore>,
    pub publisher: TicketPublisher,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/tickets", post(create_ticket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "HTTP server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn create_ticket(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewTicket>, JsonRejection>,
) -> (StatusCode, Json<ApiResponse<Ticket>>) {
    let Json(new_ticket) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(
                    rejection.body_text(),
                    "Invalid ticket payload".to_string(),
                )),
            );
        }
    };

    let ticket = match new_ticket.into_ticket() {
        Ok(ticket) => ticket,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(e.to_string(), "Validation failed".to_string())),
            );
        }
    };

    if let Err(e) = state.store.insert(ticket.clone()).await {
        error!(ticket_id = %ticket.id, error = %e, "Failed to store ticket");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e.to_string(), "Ticket not created".to_string())),
        );
    }

    // The response never waits on the broker.
    let publisher = state.publisher.clone();
    let published = ticket.clone();
    tokio::spawn(async move {
        publisher.on_ticket_created(&published).await;
    });

    info!(ticket_id = %ticket.id, "Ticket created");

    (
        StatusCode::CREATED,
        Json(ApiResponse::success(ticket, "Ticket created".to_string())),
    )
}
