use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::channel::{ChannelHandle, ConnState};
use crate::protocol::{ActuatorPayload, Outbound};
use crate::recommend::RecommendationClient;
use crate::render;
use crate::state::{Actuator, ChatDirection, ChatLine, FarmState, SharedState, SystemEvent};
use crate::voice::{self, VoiceQueue};

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub channel: ChannelHandle,
    pub voice: VoiceQueue,
    /// Set when fresh advice should be narrated automatically.
    pub advice_narrator: Option<VoiceQueue>,
    pub recommender: RecommendationClient,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/state", get(api_state))
        .route("/api/view", get(api_view))
        .route("/api/events", get(api_events))
        .route("/api/chat", get(api_chat_log).post(api_chat_send))
        .route("/api/actuator", post(api_actuator))
        .route("/api/narrate", post(api_narrate))
        .route("/api/read-advice", post(api_read_advice))
        .route("/api/recommendation", post(api_recommendation))
        .with_state(state)
}

async fn api_state(State(app): State<AppState>) -> Json<FarmState> {
    Json(app.shared.read().await.farm.clone())
}

#[derive(Serialize)]
struct ViewResponse {
    fields: BTreeMap<&'static str, String>,
    advice: String,
    channel: ConnState,
    uptime_secs: u64,
    speaking: bool,
    pending_utterances: usize,
}

async fn api_view(State(app): State<AppState>) -> Json<ViewResponse> {
    let st = app.shared.read().await;
    Json(ViewResponse {
        fields: render::view(&st),
        advice: st.advice_text(),
        channel: app.channel.status(),
        uptime_secs: st.started_at.elapsed().as_secs(),
        speaking: app.voice.is_speaking(),
        pending_utterances: app.voice.pending(),
    })
}

async fn api_events(State(app): State<AppState>) -> Json<Vec<SystemEvent>> {
    Json(app.shared.read().await.events.iter().rev().cloned().collect())
}

async fn api_chat_log(State(app): State<AppState>) -> Json<Vec<ChatLine>> {
    Json(app.shared.read().await.chat.iter().cloned().collect())
}

#[derive(Deserialize)]
struct ChatRequest {
    text: String,
}

async fn api_chat_send(
    State(app): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Json<serde_json::Value> {
    let text = req.text.trim().to_string();
    let sent = !text.is_empty() && app.channel.send(Outbound::Chat { text: text.clone() });
    if sent {
        app.shared
            .write()
            .await
            .record_chat(ChatDirection::Outgoing, text);
    }
    Json(json!({ "sent": sent }))
}

#[derive(Deserialize)]
struct ActuatorRequest {
    actuator: Actuator,
    /// Toggle when absent.
    on: Option<bool>,
}

#[derive(Serialize)]
struct ActuatorResponse {
    state: FarmState,
    sent: bool,
}

async fn api_actuator(
    State(app): State<AppState>,
    Json(req): Json<ActuatorRequest>,
) -> Json<ActuatorResponse> {
    let (state, payload, fresh_advice) = {
        let mut st = app.shared.write().await;
        let on = req.on.unwrap_or(!st.farm.actuator(req.actuator));
        st.farm.set_actuator(req.actuator, on);
        let fresh_advice = st.recompute();
        (
            st.farm.clone(),
            ActuatorPayload::after_change(req.actuator, &st.farm),
            fresh_advice,
        )
    };

    if let (Some(voice), Some(text)) = (&app.advice_narrator, fresh_advice) {
        voice.enqueue(text);
    }

    let sent = app.channel.send(Outbound::SetState { payload });
    Json(ActuatorResponse { state, sent })
}

async fn api_narrate(State(app): State<AppState>) -> Json<serde_json::Value> {
    let lines = voice::analyze(&app.shared.read().await.farm);
    for line in &lines {
        app.voice.enqueue(*line);
    }
    Json(json!({ "queued": lines }))
}

async fn api_read_advice(State(app): State<AppState>) -> Json<serde_json::Value> {
    let advice = app.shared.read().await.advice_text();
    let text = if advice.trim().is_empty() {
        voice::NOT_ANALYZED.to_string()
    } else {
        advice
    };
    app.voice.enqueue(text.clone());
    Json(json!({ "queued": text }))
}

async fn api_recommendation(State(app): State<AppState>) -> Response {
    match app.recommender.fetch().await {
        Ok(Some(text)) => {
            app.shared.write().await.recommendation = Some(text.clone());
            app.voice.enqueue(text.clone());
            Json(json!({ "recommendation": text })).into_response()
        }
        Ok(None) => Json(json!({ "recommendation": null })).into_response(),
        Err(e) => {
            error!("recommendation fetch failed: {e:#}");
            app.shared
                .write()
                .await
                .record_error(format!("recommendation fetch failed: {e:#}"));
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": format!("{e:#}") })),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "control api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
