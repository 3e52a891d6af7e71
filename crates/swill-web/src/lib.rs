//! Axum server for the Swillbot slash commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use swill_sync::{SwillConfig, SwillServices};
use tokio::net::TcpListener;
use tracing::{info, info_span, warn, Instrument};

mod commands;
mod query;
mod slack;
#[cfg(test)]
mod test_support;

pub use commands::{
    register, run_command, run_dump_reviews, run_review, run_tick, run_ticks, run_untappd, Command,
    DUMP_LIMIT,
};
pub use query::{parse_text, split_queries, ParsedText, Target};
pub use slack::{
    error_message, rating_string, receipt, Attachment, ResponseType, SlackMessage, SlashCommand,
};

pub const CRATE_NAME: &str = "swill-web";

const INVALID_TOKEN: &str =
    "✋  An invalid slash token was provided\n   Is your Slack slash token correctly configured?";

/// Where delayed command answers go; Slack's `response_url` in production.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn deliver(&self, response_url: &str, message: &SlackMessage) -> Result<()>;
}

pub struct HttpResponseSink {
    client: reqwest::Client,
}

impl HttpResponseSink {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building Slack response client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ResponseSink for HttpResponseSink {
    async fn deliver(&self, response_url: &str, message: &SlackMessage) -> Result<()> {
        self.client
            .post(response_url)
            .json(message)
            .send()
            .await
            .context("posting delayed response")?
            .error_for_status()
            .context("Slack rejected delayed response")?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub services: SwillServices,
    pub slack_token: String,
    pub sink: Arc<dyn ResponseSink>,
}

impl AppState {
    pub fn new(services: SwillServices, slack_token: impl Into<String>, sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            services,
            slack_token: slack_token.into(),
            sink,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/commands/review", post(review_handler))
        .route("/commands/tick", post(tick_handler))
        .route("/commands/ticks", post(ticks_handler))
        .route("/commands/untappd", post(untappd_handler))
        .route("/commands/dumpreviews", post(dump_reviews_handler))
        .route("/commands/username", post(username_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> Result<()> {
    let config = SwillConfig::from_env();
    let slack_token = config
        .slack_token
        .clone()
        .context("SLACK_TOKEN must be set to serve slash commands")?;
    let services = SwillServices::connect(&config).await?;
    let sink = Arc::new(HttpResponseSink::new(Duration::from_secs(config.http_timeout_secs))?);
    let state = AppState::new(services, slack_token, sink);

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "Swillbot LIVES");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler() -> &'static str {
    "\n 👋 🌍 \n"
}

async fn review_handler(State(state): State<Arc<AppState>>, Form(payload): Form<SlashCommand>) -> Response {
    dispatch(state, Command::Review, payload).await
}

async fn tick_handler(State(state): State<Arc<AppState>>, Form(payload): Form<SlashCommand>) -> Response {
    dispatch(state, Command::Tick, payload).await
}

async fn ticks_handler(State(state): State<Arc<AppState>>, Form(payload): Form<SlashCommand>) -> Response {
    dispatch(state, Command::Ticks, payload).await
}

async fn untappd_handler(State(state): State<Arc<AppState>>, Form(payload): Form<SlashCommand>) -> Response {
    dispatch(state, Command::Untappd, payload).await
}

async fn dump_reviews_handler(State(state): State<Arc<AppState>>, Form(payload): Form<SlashCommand>) -> Response {
    dispatch(state, Command::DumpReviews, payload).await
}

async fn username_handler(State(state): State<Arc<AppState>>, Form(payload): Form<SlashCommand>) -> Response {
    dispatch(state, Command::Username, payload).await
}

/// Checks the token, then answers `/username` inline and everything else
/// with a receipt followed by a delayed response.
async fn dispatch(state: Arc<AppState>, command: Command, payload: SlashCommand) -> Response {
    if payload.token != state.slack_token {
        warn!(command = command.name(), "invalid slash token");
        return (StatusCode::UNAUTHORIZED, INVALID_TOKEN).into_response();
    }

    let span = info_span!("slash_command", command = command.name(), user_id = %payload.user_id);
    if command == Command::Username {
        let message = run_command(&state.services, command, &payload)
            .instrument(span)
            .await;
        return Json(message).into_response();
    }

    tokio::spawn(
        async move {
            let message = run_command(&state.services, command, &payload).await;
            if let Err(err) = state.sink.deliver(&payload.response_url, &message).await {
                warn!(error = %err, "could not deliver delayed response");
            }
        }
        .instrument(span),
    );
    Json(receipt()).into_response()
}
