//! Webhook server
//!
//! `POST /interbank` is the peer-facing endpoint. The remaining routes serve
//! local services: forwarding prepared messages, proposing transfers and
//! inspecting delivery history.

use crate::codec::InterbankMessage;
use crate::config::Config;
use crate::metrics;
use crate::orchestrator::{ForwardOutcome, Orchestrator, OutboundTransfer};
use crate::transport::API_KEY_HEADER;
use crate::Error;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, ResponseError};
use serde_json::json;
use tracing::info;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    orchestrator: Orchestrator,
    api_key: String,
    public_url: Option<String>,
}

impl AppState {
    /// State for handlers that accept `api_key` in `X-Api-Key`
    pub fn new(orchestrator: Orchestrator, api_key: impl Into<String>) -> Self {
        Self {
            orchestrator,
            api_key: api_key.into(),
            public_url: None,
        }
    }

    /// Advertise the URL peers reach this node at
    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = Some(url.into());
        self
    }

    fn authorize(&self, req: &HttpRequest) -> Result<(), Error> {
        match req.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            Some(key) if key == self.api_key => Ok(()),
            _ => Err(Error::Unauthorized),
        }
    }
}

/// Register every route
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/interbank", web::post().to(receive))
        .route("/interbank/internal", web::post().to(forward))
        .route("/interbank/transfers", web::post().to(originate))
        .route("/interbank/events/{id}", web::get().to(event_history));
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "interbank",
        "version": env!("CARGO_PKG_VERSION"),
        "routing_number": state.orchestrator.routing_number(),
        "public_url": state.public_url,
    }))
}

async fn metrics_handler() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::gather())
}

async fn receive(state: web::Data<AppState>, req: HttpRequest, body: web::Bytes) -> HttpResponse {
    if let Err(e) = state.authorize(&req) {
        return e.error_response();
    }

    let source = req
        .connection_info()
        .realip_remote_addr()
        .map(|addr| format!("http://{}", addr))
        .unwrap_or_else(|| "unknown".to_string());

    match state.orchestrator.receive_inbound(&body, &source).await {
        Ok(reply) => HttpResponse::Ok()
            .content_type("application/json")
            .body(reply.body),
        Err(e) => e.error_response(),
    }
}

async fn forward(state: web::Data<AppState>, req: HttpRequest, body: web::Bytes) -> HttpResponse {
    if let Err(e) = state.authorize(&req) {
        return e.error_response();
    }

    let message = match InterbankMessage::decode(&body) {
        Ok(message) => message,
        Err(e) => return Error::from(e).error_response(),
    };

    match state.orchestrator.internal_forward(message).await {
        Ok(ForwardOutcome::Forwarded(event)) => HttpResponse::Accepted().json(event),
        Ok(ForwardOutcome::AlreadyDelivered(event)) => HttpResponse::Ok().json(event),
        Err(e) => e.error_response(),
    }
}

async fn originate(
    state: web::Data<AppState>,
    req: HttpRequest,
    request: web::Json<OutboundTransfer>,
) -> HttpResponse {
    if let Err(e) = state.authorize(&req) {
        return e.error_response();
    }

    match state.orchestrator.originate(request.into_inner()).await {
        Ok(key) => HttpResponse::Accepted().json(json!({
            "idempotenceKey": key,
            "transactionId": key.as_transaction_id(),
        })),
        Err(e) => e.error_response(),
    }
}

async fn event_history(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
) -> HttpResponse {
    if let Err(e) = state.authorize(&req) {
        return e.error_response();
    }

    let event_id = path.into_inner();
    match state.orchestrator.event_history(event_id).await {
        Ok(Some(history)) => HttpResponse::Ok().json(history),
        Ok(None) => HttpResponse::NotFound().json(json!({
            "error": format!("Event {} not found", event_id)
        })),
        Err(e) => e.error_response(),
    }
}

/// Serve until the server is stopped
pub async fn run(config: &Config, orchestrator: Orchestrator) -> std::io::Result<()> {
    let state = web::Data::new(
        AppState::new(orchestrator, config.bank.api_key.clone())
            .with_public_url(config.server.public_url.clone()),
    );
    let addr = config.server.listen_addr.clone();

    info!("Starting interbank webhook server on {}", addr);

    HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
        .bind(&addr)?
        .run()
        .await
}
