pub mod config;
pub mod course;
pub mod error;
pub mod generation;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod scoring;
pub mod state;
pub mod telemetry;

use std::sync::Arc;

/// Wires the Gemini client when a key is configured, the offline mock otherwise.
pub fn build_state(settings: config::Settings) -> anyhow::Result<state::AppState> {
    let schemas = generation::ContentSchemas::load()?;
    let ai_client: Arc<dyn state::AiContentClient> = match settings.gemini.clone() {
        Some(gemini) => Arc::new(state::GeminiAiClient::new(gemini)?),
        None => Arc::new(state::MockAiClient),
    };
    Ok(state::AppState::new(settings, ai_client, schemas))
}
