use crate::config::{ApiConfig, WebConfig};
use crate::db;
use crate::error::Error;
use crate::hub::HubHandle;
use crate::registry::StreamRegistry;
use crate::security::publish::{PublishAuthorizer, PublishDecision};
use crate::session::{SessionState, SessionStatus, StreamUrls};
use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use super::websocket::ws_handler;

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db_pool: Arc<SqlitePool>,
    pub registry: StreamRegistry,
    pub authorizer: PublishAuthorizer,
    pub hub: HubHandle,
    pub sessions: watch::Receiver<Vec<SessionStatus>>,
    pub urls: StreamUrls,
    pub web: WebConfig,
    pub shutdown: CancellationToken,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub status: u16,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match err {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::InvalidInput(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        ApiError {
            message: err.to_string(),
            status: status.as_u16(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(err) = err.downcast_ref::<Error>() {
            return (*err).clone().into();
        }

        ApiError {
            message: err.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(self);
        (status, body).into_response()
    }
}

/// Build the gateway router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let static_dir = ServeDir::new(&state.web.static_dir);

    Router::new()
        .route("/", get(list_page))
        .route("/ws", get(ws_handler))
        .route("/on_publish", post(on_publish))
        .route("/live/:hash", get(viewer_page))
        .route("/watch/:hash", get(viewer_page))
        .route("/health", get(health))
        .with_state(state)
        .nest_service("/static", static_dir)
        .layer(cors)
}

pub struct RestApi {
    config: ApiConfig,
    state: AppState,
}

impl RestApi {
    pub fn new(config: &ApiConfig, state: AppState) -> Self {
        Self {
            config: config.clone(),
            state,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let addr = self.config.address.clone() + ":" + &self.config.port.to_string();
        let addr: SocketAddr = addr.parse()?;

        let listener = TcpListener::bind(addr).await?;
        info!("Gateway listening on {}", addr);

        let shutdown = self.state.shutdown.clone();
        let app = router(self.state.clone());

        axum::Server::from_tcp(listener.into_std()?)?
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        info!("Gateway stopped");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct OnPublishForm {
    #[serde(default)]
    pub name: String,
}

/// Publish-authorization callback for the ingest edge. A body that is not a
/// form carries no key and is refused like an unknown one.
async fn on_publish(State(state): State<AppState>, form: Option<Form<OnPublishForm>>) -> Response {
    let name = form.map(|Form(form)| form.name).unwrap_or_default();

    match state.authorizer.authorize(&name).await {
        Ok(PublishDecision::Authorized(_)) => (
            StatusCode::OK,
            Json(json!({"status": "success", "message": "Stream key is valid"})),
        )
            .into_response(),
        Ok(PublishDecision::Denied) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": "error", "message": "Invalid stream key"})),
        )
            .into_response(),
        Err(e) => {
            error!("on_publish lookup failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// Viewer page; the page itself reads the hash from its URL
async fn viewer_page(State(state): State<AppState>, Path(hash): Path<String>) -> ApiResult<Html<String>> {
    state
        .registry
        .find_by_hash(&hash)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Stream {} not found", hash)))?;

    let path = state.web.page_dir.join("index.html");
    let page = tokio::fs::read_to_string(&path).await.map_err(|e| {
        error!("Failed to read viewer page {:?}: {}", path, e);
        Error::NotFound("Viewer page is not installed".to_string())
    })?;

    Ok(Html(page))
}

/// Listing of known streams. Stream keys are never shown.
async fn list_page(State(state): State<AppState>) -> ApiResult<Html<String>> {
    let records = state.registry.list().await?;
    let sessions = state.sessions.borrow().clone();
    let viewers = state.hub.member_count().await.unwrap_or(0);

    let mut page = String::from(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Live streams</title></head><body>\n",
    );
    let _ = writeln!(page, "<h1>Live streams</h1>\n<p>{} chat members online</p>", viewers);

    if records.is_empty() {
        page.push_str("<p>No streams registered.</p>\n");
    } else {
        page.push_str("<ul>\n");
        for record in &records {
            let state_label = sessions
                .iter()
                .find(|s| s.stream_id == record.id)
                .map(|s| s.state.to_string())
                .unwrap_or_else(|| SessionState::Unstarted.to_string());
            let play_url = state.urls.play_url(record).unwrap_or_default();
            let _ = writeln!(
                page,
                "<li><a href=\"/live/{hash}\">{hash}</a> &middot; {state} &middot; <code>{play}</code> &middot; since {created}</li>",
                hash = record.routing_hash,
                state = state_label,
                play = play_url,
                created = record.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            );
        }
        page.push_str("</ul>\n");
    }
    page.push_str("</body></html>\n");

    Ok(Html(page))
}

async fn health(State(state): State<AppState>) -> Response {
    let database = db::health_check(&state.db_pool).await;
    let hub = state.hub.member_count().await.is_ok();

    let status = if database && hub {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let label = if status == StatusCode::OK { "ok" } else { "degraded" };

    (
        status,
        Json(json!({"status": label, "database": database, "hub": hub})),
    )
        .into_response()
}
