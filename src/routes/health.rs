//! Health check endpoints

use axum::{extract::State, Json};
use serde::Serialize;

use crate::convert::{BackendClass, Invocation};
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub converters: Vec<BackendClass>,
    pub backends: Vec<BackendInfo>,
}

#[derive(Serialize)]
pub struct BackendInfo {
    pub class: BackendClass,
    pub extensions: &'static [&'static str],
    pub invocation: &'static str,
    pub timeout_secs: f64,
}

/// Liveness plus the statically configured backends. Touches no job state.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let backends: Vec<BackendInfo> = state
        .backends()
        .enabled()
        .map(|d| BackendInfo {
            class: d.class,
            extensions: d.extensions(),
            invocation: match d.invocation {
                Invocation::Command(_) => "command",
                Invocation::Gateway { .. } => "gateway",
            },
            timeout_secs: d.timeout.as_secs_f64(),
        })
        .collect();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        service: "doc-convert-server",
        converters: backends.iter().map(|b| b.class).collect(),
        backends,
    })
}
