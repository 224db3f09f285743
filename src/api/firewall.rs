//! `/api/firewall` handlers
//!
//! Request bodies carry addresses and protocols as strings, exactly as the
//! dashboard sends them; they are parsed with [`validators`] into typed
//! [`ConfigCommand`]s before reaching the session.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ApiError, ApiResult, ApiState};
use crate::command::ConfigCommand;
use crate::core::firewall::{BlockedIp, DmzConfig, ForwardKey, PortForward};
use crate::core::session::StageOutcome;
use crate::validators;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/status", get(status))
        .route("/toggle", post(toggle))
        .route("/port-forwards", get(port_forwards))
        .route("/port-forwards/add", post(add_port_forward))
        .route("/port-forwards/remove", post(remove_port_forward))
        .route("/blocked-ips", get(blocked_ips))
        .route("/blocked-ips/add", post(add_blocked_ip))
        .route("/blocked-ips/remove", post(remove_blocked_ip))
        .route("/dmz", get(dmz_status))
        .route("/dmz/set", post(set_dmz))
        .route("/rules", get(raw_rules))
        .route("/pending", get(pending))
        .route("/confirm", post(confirm))
        .route("/revert", post(revert))
}

#[derive(Debug, Serialize)]
pub struct FirewallStatus {
    pub enabled: bool,
    pub input_policy: String,
    pub forward_policy: String,
    pub output_policy: String,
    pub pending_changes: bool,
    pub pending_timeout: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct PendingStatus {
    pub pending: bool,
    pub seconds_remaining: Option<u32>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct DmzStatus {
    pub enabled: bool,
    pub target_ip: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RawRules {
    pub table: String,
    pub text: String,
    pub json: Value,
    /// Changes relative to the committed rules while a change is pending
    pub diff: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ToggleFirewall {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddPortForward {
    pub protocol: String,
    pub external_port: u16,
    pub internal_ip: String,
    pub internal_port: u16,
    pub description: Option<String>,
}

/// Forwards are identified by protocol and external port; the internal side
/// is accepted for compatibility and ignored.
#[derive(Debug, Deserialize)]
pub struct RemovePortForward {
    pub protocol: String,
    pub external_port: u16,
    pub internal_ip: Option<String>,
    pub internal_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct AddBlockedIp {
    pub ip: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveBlockedIp {
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub struct SetDmz {
    pub enabled: bool,
    pub target_ip: Option<String>,
}

fn current_status(state: &ApiState) -> FirewallStatus {
    let status = state.status.get_status();
    FirewallStatus {
        enabled: status.enabled,
        input_policy: status.input_policy.to_string(),
        forward_policy: status.forward_policy.to_string(),
        output_policy: status.output_policy.to_string(),
        pending_changes: status.pending,
        pending_timeout: status.seconds_remaining,
    }
}

fn pending_status(state: &ApiState, message: Option<&str>) -> PendingStatus {
    let status = state.status.get_status();
    let message = match (message, status.seconds_remaining) {
        (Some(message), _) => message.to_string(),
        (None, Some(seconds)) => {
            format!("Changes pending confirmation. Auto-revert in {seconds} seconds.")
        }
        (None, None) => "No pending changes.".to_string(),
    };
    PendingStatus {
        pending: status.pending,
        seconds_remaining: status.seconds_remaining,
        message,
    }
}

fn dmz_of(dmz: &DmzConfig) -> DmzStatus {
    DmzStatus {
        enabled: dmz.enabled,
        target_ip: dmz.target_ip.map(|ip| ip.to_string()),
    }
}

fn staged(outcome: StageOutcome) -> Json<Value> {
    match outcome {
        StageOutcome::Staged {
            id,
            seconds_remaining,
        } => Json(json!({
            "success": true,
            "pending": true,
            "change_id": id,
            "seconds_remaining": seconds_remaining,
        })),
        StageOutcome::Unchanged => Json(json!({
            "success": true,
            "pending": false,
            "seconds_remaining": null,
        })),
    }
}

fn description(input: Option<&str>) -> Result<String, ApiError> {
    Ok(input
        .map(validators::validate_description)
        .transpose()?
        .unwrap_or_default())
}

async fn status(State(state): State<ApiState>) -> Json<FirewallStatus> {
    Json(current_status(&state))
}

async fn toggle(
    State(state): State<ApiState>,
    payload: Result<Json<ToggleFirewall>, JsonRejection>,
) -> ApiResult<FirewallStatus> {
    let Json(payload) = payload?;
    state
        .session
        .stage(ConfigCommand::SetEnabled(payload.enabled))
        .await?;
    Ok(Json(current_status(&state)))
}

async fn port_forwards(State(state): State<ApiState>) -> Json<Vec<PortForward>> {
    let snapshot = state.status.snapshot();
    Json(snapshot.live.config.port_forwards.values().cloned().collect())
}

async fn add_port_forward(
    State(state): State<ApiState>,
    payload: Result<Json<AddPortForward>, JsonRejection>,
) -> ApiResult<Value> {
    let Json(payload) = payload?;
    let forward = PortForward {
        protocol: validators::parse_protocol(&payload.protocol)?,
        external_port: validators::validate_port("external_port", payload.external_port)?,
        internal_ip: validators::parse_ipv4("internal_ip", &payload.internal_ip)?,
        internal_port: validators::validate_port("internal_port", payload.internal_port)?,
        description: description(payload.description.as_deref())?,
    };

    let outcome = state
        .session
        .stage(ConfigCommand::AddPortForward(forward))
        .await?;
    Ok(staged(outcome))
}

async fn remove_port_forward(
    State(state): State<ApiState>,
    payload: Result<Json<RemovePortForward>, JsonRejection>,
) -> ApiResult<Value> {
    let Json(payload) = payload?;
    let key = ForwardKey {
        external_port: payload.external_port,
        protocol: validators::parse_protocol(&payload.protocol)?,
    };
    if !state
        .status
        .snapshot()
        .live
        .config
        .port_forwards
        .contains_key(&key)
    {
        return Err(ApiError::NotFound(format!(
            "No {} forward on port {}",
            key.protocol, key.external_port
        )));
    }

    let outcome = state
        .session
        .stage(ConfigCommand::RemovePortForward(key))
        .await?;
    Ok(staged(outcome))
}

async fn blocked_ips(State(state): State<ApiState>) -> Json<Vec<BlockedIp>> {
    let snapshot = state.status.snapshot();
    Json(snapshot.live.config.blocked_ips.values().cloned().collect())
}

async fn add_blocked_ip(
    State(state): State<ApiState>,
    payload: Result<Json<AddBlockedIp>, JsonRejection>,
) -> ApiResult<Value> {
    let Json(payload) = payload?;
    let blocked = BlockedIp {
        ip: validators::parse_ip("ip", &payload.ip)?,
        description: description(payload.description.as_deref())?,
    };

    let outcome = state.session.stage(ConfigCommand::BlockIp(blocked)).await?;
    Ok(staged(outcome))
}

async fn remove_blocked_ip(
    State(state): State<ApiState>,
    payload: Result<Json<RemoveBlockedIp>, JsonRejection>,
) -> ApiResult<Value> {
    let Json(payload) = payload?;
    let ip = validators::parse_ip("ip", &payload.ip)?;
    if !state
        .status
        .snapshot()
        .live
        .config
        .blocked_ips
        .contains_key(&ip)
    {
        return Err(ApiError::NotFound(format!("{ip} is not blocked")));
    }

    let outcome = state.session.stage(ConfigCommand::UnblockIp(ip)).await?;
    Ok(staged(outcome))
}

async fn dmz_status(State(state): State<ApiState>) -> Json<DmzStatus> {
    Json(dmz_of(&state.status.snapshot().live.config.dmz))
}

async fn set_dmz(
    State(state): State<ApiState>,
    payload: Result<Json<SetDmz>, JsonRejection>,
) -> ApiResult<DmzStatus> {
    let Json(payload) = payload?;
    let target_ip = payload
        .target_ip
        .as_deref()
        .filter(|ip| !ip.trim().is_empty())
        .map(|ip| validators::parse_ipv4("target_ip", ip))
        .transpose()?;

    state
        .session
        .stage(ConfigCommand::SetDmz(DmzConfig {
            enabled: payload.enabled,
            target_ip,
        }))
        .await?;
    Ok(Json(dmz_of(&state.status.snapshot().live.config.dmz)))
}

async fn raw_rules(State(state): State<ApiState>) -> Json<RawRules> {
    let snapshot = state.status.snapshot();
    let rules = &snapshot.live.rules;
    Json(RawRules {
        table: rules.table.clone(),
        text: rules.to_nft_text(),
        json: rules.to_nftables_json(),
        diff: rules.diff_from(&snapshot.active.rules),
    })
}

async fn pending(State(state): State<ApiState>) -> Json<PendingStatus> {
    Json(pending_status(&state, None))
}

async fn confirm(State(state): State<ApiState>) -> ApiResult<PendingStatus> {
    state.session.confirm().await?;
    Ok(Json(pending_status(
        &state,
        Some("Changes confirmed and saved."),
    )))
}

async fn revert(State(state): State<ApiState>) -> ApiResult<PendingStatus> {
    state.session.revert().await?;
    Ok(Json(pending_status(
        &state,
        Some("Changes reverted to previous state."),
    )))
}
