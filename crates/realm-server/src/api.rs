use axum::extract::State;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use realm_core::admin::{AdminCommand, AdminOutcome};
use realm_core::participant::ParticipantId;

use crate::error::AppError;
use crate::game_loop::GameCommand;
use crate::state::AppState;

/// Longest accepted admin broadcast.
const MAX_BROADCAST_LEN: usize = 512;

#[derive(Debug, Deserialize)]
pub struct PresetBody {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct MaintenanceBody {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct RuleBody {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastBody {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct KickBody {
    pub id: ParticipantId,
    #[serde(default = "default_kick_reason")]
    pub reason: String,
}

fn default_kick_reason() -> String {
    "kicked by admin".to_string()
}

#[derive(Debug, Deserialize)]
pub struct BanBody {
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct FieldBody {
    pub id: ParticipantId,
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct RebootBody {
    pub after_rounds: u32,
}

/// Hand one command to the control loop and wait for its answer.
async fn submit(state: &AppState, cmd: AdminCommand) -> Result<Json<AdminOutcome>, AppError> {
    let (reply, rx) = oneshot::channel();
    state
        .commands
        .send(GameCommand::Admin { cmd, reply })
        .await
        .map_err(|_| AppError::Unavailable("control loop stopped".to_string()))?;
    let outcome = rx
        .await
        .map_err(|_| AppError::Unavailable("control loop dropped the command".to_string()))??;
    Ok(Json(outcome))
}

pub async fn pause(State(state): State<AppState>) -> Result<Json<AdminOutcome>, AppError> {
    submit(&state, AdminCommand::Pause).await
}

pub async fn resume(State(state): State<AppState>) -> Result<Json<AdminOutcome>, AppError> {
    submit(&state, AdminCommand::Resume).await
}

pub async fn force_preset(
    State(state): State<AppState>,
    Json(body): Json<PresetBody>,
) -> Result<Json<AdminOutcome>, AppError> {
    submit(&state, AdminCommand::ForcePreset { name: body.name }).await
}

pub async fn set_maintenance(
    State(state): State<AppState>,
    Json(body): Json<MaintenanceBody>,
) -> Result<Json<AdminOutcome>, AppError> {
    submit(
        &state,
        AdminCommand::SetMaintenance {
            enabled: body.enabled,
        },
    )
    .await
}

pub async fn set_rule(
    State(state): State<AppState>,
    Json(body): Json<RuleBody>,
) -> Result<Json<AdminOutcome>, AppError> {
    if body.key.is_empty() {
        return Err(AppError::BadRequest("key is empty".to_string()));
    }
    submit(
        &state,
        AdminCommand::SetRule {
            key: body.key,
            value: body.value,
        },
    )
    .await
}

pub async fn broadcast(
    State(state): State<AppState>,
    Json(body): Json<BroadcastBody>,
) -> Result<Json<AdminOutcome>, AppError> {
    if body.message.trim().is_empty() {
        return Err(AppError::BadRequest("message is empty".to_string()));
    }
    if body.message.len() > MAX_BROADCAST_LEN {
        return Err(AppError::BadRequest(format!(
            "message exceeds {MAX_BROADCAST_LEN} chars"
        )));
    }
    submit(
        &state,
        AdminCommand::Broadcast {
            message: body.message,
        },
    )
    .await
}

pub async fn kick(
    State(state): State<AppState>,
    Json(body): Json<KickBody>,
) -> Result<Json<AdminOutcome>, AppError> {
    submit(
        &state,
        AdminCommand::Kick {
            id: body.id,
            reason: body.reason,
        },
    )
    .await
}

pub async fn ban(
    State(state): State<AppState>,
    Json(body): Json<BanBody>,
) -> Result<Json<AdminOutcome>, AppError> {
    if body.address.is_empty() {
        return Err(AppError::BadRequest("address is empty".to_string()));
    }
    submit(
        &state,
        AdminCommand::Ban {
            address: body.address,
        },
    )
    .await
}

pub async fn set_field(
    State(state): State<AppState>,
    Json(body): Json<FieldBody>,
) -> Result<Json<AdminOutcome>, AppError> {
    submit(
        &state,
        AdminCommand::SetField {
            id: body.id,
            field: body.field,
            value: body.value,
        },
    )
    .await
}

pub async fn schedule_reboot(
    State(state): State<AppState>,
    Json(body): Json<RebootBody>,
) -> Result<Json<AdminOutcome>, AppError> {
    submit(
        &state,
        AdminCommand::ScheduleReboot {
            after_rounds: body.after_rounds,
        },
    )
    .await
}

pub async fn status(State(state): State<AppState>) -> Result<Json<AdminOutcome>, AppError> {
    submit(&state, AdminCommand::Status).await
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub connections: usize,
    /// False once the control loop has stopped.
    pub simulation: bool,
}

/// Liveness. Does not touch the world, so it answers even mid-tick.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let simulation = !state.commands.is_closed();
    Json(HealthResponse {
        status: if simulation { "healthy" } else { "stopping" },
        version: env!("CARGO_PKG_VERSION"),
        connections: state
            .ws_connection_count
            .load(std::sync::atomic::Ordering::Relaxed),
        simulation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kick_body_defaults_reason() {
        let body: KickBody = serde_json::from_str(r#"{"id": 4}"#).unwrap();
        assert_eq!(body.id, 4);
        assert_eq!(body.reason, "kicked by admin");
    }

    #[test]
    fn health_response_serializes() {
        let resp = HealthResponse {
            status: "healthy",
            version: "0.1.0",
            connections: 5,
            simulation: true,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"healthy\""));
        assert!(json.contains("\"connections\":5"));
    }

    #[tokio::test]
    async fn submit_reports_stopped_loop() {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(rx);
        let state = AppState::new(crate::config::ServerConfig::default(), tx);
        let err = submit(&state, AdminCommand::Status).await.unwrap_err();
        assert!(matches!(err, AppError::Unavailable(_)));
    }
}
