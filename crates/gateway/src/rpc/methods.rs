//! JSON-RPC method dispatch table for `/v1/rpc`.
//!
//! Each method is grounded on an existing REST handler or runtime
//! primitive — see the per-method doc comment for its source — and
//! re-expressed as a `(state, conn_id, params) -> RpcResult` arm instead of
//! an axum extractor chain, since a single WebSocket connection dispatches
//! many methods over its lifetime rather than one per HTTP request.

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::runtime::approval::ApprovalDecision;
use crate::runtime::idempotency::ChatSendOutcome;
use crate::runtime::queue;
use crate::runtime::schedules::{
    validate_cron, validate_timezone, Schedule, SchedulePayload, ScheduleKind, SessionTarget,
    WakeMode,
};
use crate::runtime::{run_turn_on_lane, TurnEvent, TurnInput};
use crate::state::AppState;

use super::{RpcError, RpcResult, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, NOT_FOUND, QUEUE_FULL, UNAVAILABLE};

pub async fn dispatch(state: &AppState, conn_id: Uuid, method: &str, params: Value) -> RpcResult {
    match method {
        "chat.send" => chat_send(state, params).await,
        "chat.history" => chat_history(state, params).await,
        "chat.abort" => chat_abort(state, params).await,
        "chat.inject" => chat_inject(state, params).await,
        "chat.ingress" => Err(RpcError::new(
            METHOD_NOT_FOUND,
            "chat.ingress: use the connector-specific POST /v1/inbound/:channel surface",
        )),

        "sessions.list" => sessions_list(state).await,
        "sessions.history" => chat_history(state, params).await,
        "sessions.spawn" => sessions_spawn(state, params).await,
        "sessions.send" => chat_send(state, params).await,

        "system.event" => system_event(state, params).await,
        "system.subscribe" => system_subscribe(state, conn_id, params).await,
        "system.unsubscribe" => system_unsubscribe(state, conn_id, params).await,

        "heartbeat.enable" => heartbeat_enable(state, params).await,
        "heartbeat.disable" => heartbeat_disable(state, params).await,
        "heartbeat.last" => heartbeat_last(state, params).await,

        "cron.add" => cron_add(state, params).await,
        "cron.update" => cron_update(state, params).await,
        "cron.remove" => cron_remove(state, params).await,
        "cron.run" => cron_run(state, params).await,
        "cron.list" => cron_list(state).await,

        "exec.approval.get" => exec_approval_get(state, params).await,
        "exec.approval.decide" => exec_approval_decide(state, params).await,

        "voicecall.initiate" | "voicecall.continue" | "voicecall.speak" | "voicecall.end"
        | "voicecall.status" => Err(RpcError::new(
            UNAVAILABLE,
            format!("{method}: no voice provider session is configured on this gateway"),
        )),

        _ => Err(RpcError::new(METHOD_NOT_FOUND, format!("unknown method '{method}'"))),
    }
}

fn bad_params(e: impl std::fmt::Display) -> RpcError {
    RpcError::new(INVALID_PARAMS, format!("invalid params: {e}"))
}

fn parse<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(bad_params)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// chat.* — grounded on api/inbound.rs's turn-execution flow and
// api/sessions.rs's transcript/stop handlers.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct ChatSendParams {
    session_key: String,
    text: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

/// `chat.send` — run one turn on the session's lane. When `idempotencyKey`
/// is given, a concurrent or repeated call with the same key returns the
/// already-running run (`status: "in_flight"`) or the cached terminal
/// result (`cached: true`) instead of starting a second run.
async fn chat_send(state: &AppState, params: Value) -> RpcResult {
    let p: ChatSendParams = parse(params)?;
    let Some(entry) = state.sessions.get(&p.session_key) else {
        return Err(RpcError::new(NOT_FOUND, "unknown session_key"));
    };

    let run_id = if let Some(key) = &p.idempotency_key {
        match state.chat_idempotency.begin(key) {
            ChatSendOutcome::InFlight { run_id } => {
                return Ok(json!({ "runId": run_id, "status": "in_flight" }));
            }
            ChatSendOutcome::Cached { payload } => {
                let mut payload = payload;
                if let Value::Object(ref mut obj) = payload {
                    obj.insert("cached".into(), json!(true));
                }
                return Ok(payload);
            }
            ChatSendOutcome::Start { run_id } => run_id,
        }
    } else {
        Uuid::new_v4()
    };

    let input = TurnInput {
        session_key: p.session_key.clone(),
        session_id: entry.session_id.clone(),
        user_message: p.text,
        model: p.model,
        response_format: None,
        agent: None,
    };

    let (run_id, mut rx) = match run_turn_on_lane(
        state.clone(),
        input,
        queue::session_lane(&p.session_key),
        run_id,
    )
    .await
    {
        Ok(pair) => pair,
        Err(full) => {
            if let Some(key) = &p.idempotency_key {
                state.chat_idempotency.abandon(key);
            }
            return Err(RpcError::new(QUEUE_FULL, full.to_string()));
        }
    };

    let mut final_text = String::new();
    let mut was_stopped = false;
    while let Some(event) = rx.recv().await {
        match event {
            TurnEvent::Final { content } => final_text = content,
            TurnEvent::Stopped { content } => {
                final_text = content;
                was_stopped = true;
            }
            _ => {}
        }
    }

    let payload = json!({
        "runId": run_id,
        "sessionKey": p.session_key,
        "status": if was_stopped { "stopped" } else { "final" },
        "text": final_text,
    });

    if let Some(key) = &p.idempotency_key {
        state.chat_idempotency.complete(key, payload.clone());
    }

    Ok(payload)
}

#[derive(Debug, Deserialize)]
struct ChatHistoryParams {
    session_key: String,
    #[serde(default)]
    limit: Option<usize>,
}

/// `chat.history` / `sessions.history` — grounded on
/// `api/sessions.rs::get_transcript`.
async fn chat_history(state: &AppState, params: Value) -> RpcResult {
    let p: ChatHistoryParams = parse(params)?;
    let Some(entry) = state.sessions.get(&p.session_key) else {
        return Err(RpcError::new(NOT_FOUND, "unknown session_key"));
    };
    let limit = p.limit.unwrap_or(gw_sessions::transcript::DEFAULT_TAIL_LIMIT);
    let lines = state
        .transcripts
        .read_tail(&entry.session_id, gw_sessions::transcript::DEFAULT_TAIL_BYTE_CAP, limit)
        .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;
    Ok(json!({ "sessionKey": p.session_key, "lines": lines }))
}

#[derive(Debug, Deserialize)]
struct ChatAbortParams {
    session_key: String,
}

/// `chat.abort` — grounded on `api/sessions.rs::stop_session`.
async fn chat_abort(state: &AppState, params: Value) -> RpcResult {
    let p: ChatAbortParams = parse(params)?;
    let stopped = state.cancel_map.cancel(&p.session_key);
    Ok(json!({ "sessionKey": p.session_key, "stopped": stopped }))
}

#[derive(Debug, Deserialize)]
struct ChatInjectParams {
    session_key: String,
    text: String,
    #[serde(default = "default_inject_role")]
    role: String,
}

fn default_inject_role() -> String {
    "system".to_string()
}

/// `chat.inject` — append a line to the session transcript without
/// running a turn (e.g. an operator note or an out-of-band system event).
async fn chat_inject(state: &AppState, params: Value) -> RpcResult {
    let p: ChatInjectParams = parse(params)?;
    let Some(entry) = state.sessions.get(&p.session_key) else {
        return Err(RpcError::new(NOT_FOUND, "unknown session_key"));
    };
    let line = gw_sessions::transcript::TranscriptWriter::line(&p.role, &p.text);
    state
        .transcripts
        .append_async(&entry.session_id, &[line])
        .await
        .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;
    Ok(json!({ "sessionKey": p.session_key, "injected": true }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// sessions.* — grounded on api/sessions.rs.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn sessions_list(state: &AppState) -> RpcResult {
    let sessions = state.sessions.list();
    Ok(json!({ "sessions": sessions, "count": sessions.len() }))
}

#[derive(Debug, Deserialize)]
struct SessionsSpawnParams {
    session_key: String,
}

/// `sessions.spawn` — resolve-or-create a session directly by key, for
/// RPC callers that already own session-key derivation (no `api/sessions.rs`
/// REST analogue takes a bare key; `resolve_session` derives one from
/// connector metadata instead).
async fn sessions_spawn(state: &AppState, params: Value) -> RpcResult {
    let p: SessionsSpawnParams = parse(params)?;
    let origin = gw_sessions::store::SessionOrigin {
        channel: None,
        account: None,
        peer: None,
        group: None,
    };
    let (entry, is_new) = state.sessions.resolve_or_create(&p.session_key, origin);
    Ok(json!({
        "sessionKey": entry.session_key,
        "sessionId": entry.session_id,
        "isNew": is_new,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// system.* — ad-hoc broadcast + subscription management via BroadcastHub.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct SystemEventParams {
    topic: String,
    #[serde(default)]
    payload: Value,
}

async fn system_event(state: &AppState, params: Value) -> RpcResult {
    let p: SystemEventParams = parse(params)?;
    state.rpc_broadcast.publish(&p.topic, p.payload);
    Ok(json!({ "published": true }))
}

#[derive(Debug, Deserialize)]
struct TopicParams {
    topic: String,
}

async fn system_subscribe(state: &AppState, conn_id: Uuid, params: Value) -> RpcResult {
    let p: TopicParams = parse(params)?;
    state.rpc_broadcast.subscribe(conn_id, &p.topic);
    Ok(json!({ "subscribed": p.topic }))
}

async fn system_unsubscribe(state: &AppState, conn_id: Uuid, params: Value) -> RpcResult {
    let p: TopicParams = parse(params)?;
    state.rpc_broadcast.unsubscribe(conn_id, &p.topic);
    Ok(json!({ "unsubscribed": p.topic }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// heartbeat.* — a per-session `Every` schedule with `wake_mode:
// next_heartbeat`, stored in the same `ScheduleStore` the cron runner
// already ticks; no dedicated teacher subsystem exists for this.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn heartbeat_name(session_key: &str) -> String {
    format!("heartbeat:{session_key}")
}

#[derive(Debug, Deserialize)]
struct HeartbeatEnableParams {
    session_key: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    interval_ms: i64,
}

fn default_heartbeat_interval_ms() -> i64 {
    5 * 60 * 1000
}

async fn heartbeat_enable(state: &AppState, params: Value) -> RpcResult {
    let p: HeartbeatEnableParams = parse(params)?;
    let name = heartbeat_name(&p.session_key);
    let now = chrono::Utc::now();

    if let Some(existing) = find_by_name(state, &name).await {
        state
            .schedule_store
            .update(&existing.id, |s| {
                s.enabled = true;
                s.schedule = ScheduleKind::Every {
                    every_ms: p.interval_ms,
                    anchor_ms: now.timestamp_millis(),
                };
            })
            .await;
        return Ok(json!({ "sessionKey": p.session_key, "enabled": true }));
    }

    let payload = SchedulePayload::SystemEvent {
        text: "heartbeat".to_string(),
    };
    let session_target = SessionTarget::Session;
    Schedule::check_target_invariant(&payload, session_target)
        .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;

    let schedule = Schedule {
        id: Uuid::new_v4(),
        name,
        schedule: ScheduleKind::Every {
            every_ms: p.interval_ms,
            anchor_ms: now.timestamp_millis(),
        },
        session_target,
        wake_mode: WakeMode::NextHeartbeat,
        payload,
        enabled: true,
        agent_id: p.session_key.clone(),
        sources: Vec::new(),
        delivery_targets: Vec::new(),
        webhook_secret: None,
        created_at: now,
        updated_at: now,
        last_run_id: None,
        last_run_at: None,
        next_run_at: None,
        missed_policy: Default::default(),
        max_concurrency: 1,
        timeout_ms: None,
        digest_mode: Default::default(),
        fetch_config: Default::default(),
        source_states: Default::default(),
        max_catchup_runs: 5,
        last_error: None,
        last_error_at: None,
        consecutive_failures: 0,
        cooldown_until: None,
        total_input_tokens: 0,
        total_output_tokens: 0,
        total_runs: 0,
    };
    let created = state.schedule_store.insert(schedule).await;
    Ok(json!({ "sessionKey": p.session_key, "enabled": true, "scheduleId": created.id }))
}

#[derive(Debug, Deserialize)]
struct SessionKeyParams {
    session_key: String,
}

async fn heartbeat_disable(state: &AppState, params: Value) -> RpcResult {
    let p: SessionKeyParams = parse(params)?;
    let name = heartbeat_name(&p.session_key);
    let Some(existing) = find_by_name(state, &name).await else {
        return Ok(json!({ "sessionKey": p.session_key, "enabled": false }));
    };
    state
        .schedule_store
        .update(&existing.id, |s| s.enabled = false)
        .await;
    Ok(json!({ "sessionKey": p.session_key, "enabled": false }))
}

async fn heartbeat_last(state: &AppState, params: Value) -> RpcResult {
    let p: SessionKeyParams = parse(params)?;
    let name = heartbeat_name(&p.session_key);
    match find_by_name(state, &name).await {
        Some(s) => Ok(json!({
            "sessionKey": p.session_key,
            "enabled": s.enabled,
            "lastRunAt": s.last_run_at,
            "nextRunAt": s.next_run_at,
        })),
        None => Ok(json!({ "sessionKey": p.session_key, "enabled": false, "lastRunAt": null, "nextRunAt": null })),
    }
}

async fn find_by_name(state: &AppState, name: &str) -> Option<Schedule> {
    state.schedule_store.list().await.into_iter().find(|s| s.name == name)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// cron.* — grounded on api/schedules.rs.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct CronAddParams {
    name: String,
    expr: String,
    #[serde(default = "default_tz")]
    tz: String,
    text: String,
    #[serde(default)]
    agent_id: Option<String>,
}

fn default_tz() -> String {
    "UTC".to_string()
}

async fn cron_add(state: &AppState, params: Value) -> RpcResult {
    let p: CronAddParams = parse(params)?;
    if state.schedule_store.name_exists(&p.name, None).await {
        return Err(RpcError::new(INVALID_PARAMS, "a schedule with that name already exists"));
    }
    validate_cron(&p.expr).map_err(|e| RpcError::new(INVALID_PARAMS, e))?;
    validate_timezone(&p.tz).map_err(|e| RpcError::new(INVALID_PARAMS, e))?;

    let now = chrono::Utc::now();
    let payload = SchedulePayload::SystemEvent { text: p.text };
    let session_target = SessionTarget::Session;
    Schedule::check_target_invariant(&payload, session_target)
        .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;

    let schedule = Schedule {
        id: Uuid::new_v4(),
        name: p.name,
        schedule: ScheduleKind::Cron { expr: p.expr, tz: p.tz },
        session_target,
        wake_mode: WakeMode::Now,
        payload,
        enabled: true,
        agent_id: p.agent_id.unwrap_or_default(),
        sources: Vec::new(),
        delivery_targets: Vec::new(),
        webhook_secret: None,
        created_at: now,
        updated_at: now,
        last_run_id: None,
        last_run_at: None,
        next_run_at: None,
        missed_policy: Default::default(),
        max_concurrency: 1,
        timeout_ms: None,
        digest_mode: Default::default(),
        fetch_config: Default::default(),
        source_states: Default::default(),
        max_catchup_runs: 5,
        last_error: None,
        last_error_at: None,
        consecutive_failures: 0,
        cooldown_until: None,
        total_input_tokens: 0,
        total_output_tokens: 0,
        total_runs: 0,
    };
    let created = state.schedule_store.insert(schedule).await;
    Ok(json!({ "id": created.id, "name": created.name }))
}

#[derive(Debug, Deserialize)]
struct CronIdParams {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
struct CronUpdateParams {
    id: Uuid,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    expr: Option<String>,
}

async fn cron_update(state: &AppState, params: Value) -> RpcResult {
    let p: CronUpdateParams = parse(params)?;
    let updated = state
        .schedule_store
        .update(&p.id, |s| {
            if let Some(enabled) = p.enabled {
                s.enabled = enabled;
            }
            if let Some(expr) = p.expr.clone() {
                if let ScheduleKind::Cron { tz, .. } = &s.schedule {
                    s.schedule = ScheduleKind::Cron { expr, tz: tz.clone() };
                }
            }
        })
        .await;
    match updated {
        Some(s) => Ok(json!({ "id": s.id, "enabled": s.enabled })),
        None => Err(RpcError::new(NOT_FOUND, "no schedule with that id")),
    }
}

async fn cron_remove(state: &AppState, params: Value) -> RpcResult {
    let p: CronIdParams = parse(params)?;
    if state.schedule_store.delete(&p.id).await {
        Ok(json!({ "id": p.id, "removed": true }))
    } else {
        Err(RpcError::new(NOT_FOUND, "no schedule with that id"))
    }
}

async fn cron_run(state: &AppState, params: Value) -> RpcResult {
    let p: CronIdParams = parse(params)?;
    let Some(_schedule) = state.schedule_store.get(&p.id).await else {
        return Err(RpcError::new(NOT_FOUND, "no schedule with that id"));
    };
    let run_id = Uuid::new_v4();
    state.schedule_store.record_run(&p.id, run_id).await;
    Ok(json!({ "id": p.id, "runId": run_id }))
}

async fn cron_list(state: &AppState) -> RpcResult {
    let schedules = state.schedule_store.list().await;
    Ok(json!({ "schedules": schedules, "count": schedules.len() }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// exec.approval.* — grounded on api/tools.rs's approve_exec/deny_exec
// and runtime/approval.rs's ApprovalStore.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn exec_approval_get(state: &AppState, params: Value) -> RpcResult {
    #[derive(Debug, Deserialize)]
    struct Params {
        #[serde(default)]
        id: Option<Uuid>,
    }
    let p: Params = parse(params)?;
    let pending = state.approval_store.list_pending();
    match p.id {
        Some(id) => pending
            .into_iter()
            .find(|a| a.id == id)
            .map(|a| serde_json::to_value(a).unwrap_or(Value::Null))
            .ok_or_else(|| RpcError::new(NOT_FOUND, "no pending approval with that id")),
        None => Ok(json!({ "pending": pending, "count": pending.len() })),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DecideOutcome {
    AllowOnce,
    AllowAlways,
    Deny,
}

#[derive(Debug, Deserialize)]
struct ExecApprovalDecideParams {
    id: Uuid,
    outcome: DecideOutcome,
    #[serde(default)]
    reason: Option<String>,
}

async fn exec_approval_decide(state: &AppState, params: Value) -> RpcResult {
    let p: ExecApprovalDecideParams = parse(params)?;
    let decision = match p.outcome {
        DecideOutcome::AllowOnce => ApprovalDecision::AllowOnce,
        DecideOutcome::AllowAlways => ApprovalDecision::AllowAlways,
        DecideOutcome::Deny => ApprovalDecision::Denied { reason: p.reason },
    };
    if state.approval_store.resolve(&p.id, decision) {
        Ok(json!({ "id": p.id, "decided": true }))
    } else {
        Err(RpcError::new(NOT_FOUND, "no pending approval with that id"))
    }
}
