//! HTTP control surface: trigger one pass per request

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::models::{ControlResponse, PassReport, TriageMode};
use crate::scheduler::SingleFlight;
use crate::state::parse_timestamp;

#[derive(Debug, Default, Deserialize)]
pub struct ProcessQuery {
    /// RFC 3339 watermark override for this pass only
    pub timestamp: Option<String>,
}

type ControlReply = (StatusCode, Json<ControlResponse>);

fn reply(mode: TriageMode, result: Result<PassReport>) -> ControlReply {
    match result {
        Ok(report) => (StatusCode::OK, Json(ControlResponse::from_report(&report))),
        Err(e) => {
            error!("{} pass requested over HTTP failed: {}", mode, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ControlResponse::from_error(mode, &e)),
            )
        }
    }
}

async fn process_emails(
    State(flight): State<SingleFlight>,
    Query(query): Query<ProcessQuery>,
) -> ControlReply {
    let watermark_override = match query.timestamp.as_deref() {
        Some(raw) => match parse_timestamp(raw) {
            Ok(timestamp) => Some(timestamp),
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ControlResponse::from_error(TriageMode::New, &e)),
                )
            }
        },
        None => None,
    };

    let result = flight.run_queued(TriageMode::New, watermark_override).await;
    reply(TriageMode::New, result)
}

async fn process_old_emails(State(flight): State<SingleFlight>) -> ControlReply {
    let result = flight.run_queued(TriageMode::Backlog, None).await;
    reply(TriageMode::Backlog, result)
}

pub fn router(flight: SingleFlight) -> Router {
    Router::new()
        .route("/process-emails", get(process_emails))
        .route("/process-old-emails", get(process_old_emails))
        .layer(TraceLayer::new_for_http())
        .with_state(flight)
}

pub async fn serve(flight: SingleFlight, config: &ServerConfig) -> Result<()> {
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Control server listening on http://{}", addr);
    axum::serve(listener, router(flight)).await?;
    Ok(())
}
