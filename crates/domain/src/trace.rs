use serde::Serialize;

/// Structured trace events emitted across all OpenClaw Gateway crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    ContextBuilt {
        total_injected_chars: usize,
        files_included: usize,
        files_truncated_per_file: usize,
        files_truncated_total_cap: usize,
        files_excluded: usize,
        skills_index_chars: usize,
        user_facts_chars: usize,
        bootstrap_included: bool,
    },
    SkillDocLoaded {
        skill_name: String,
        doc_chars: usize,
    },
    UserFactsFetched {
        user_id: String,
        facts_chars: usize,
        pinned_count: usize,
        search_count: usize,
    },
    WorkspaceFileRead {
        filename: String,
        raw_chars: usize,
        cache_hit: bool,
    },
    BootstrapCompleted {
        workspace_id: String,
    },
    SerialMemoryCall {
        endpoint: String,
        status: u16,
        duration_ms: u64,
    },
    LlmRequest {
        provider: String,
        model: String,
        role: String,
        streaming: bool,
        duration_ms: u64,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
    LlmFallback {
        from_provider: String,
        from_model: String,
        to_provider: String,
        to_model: String,
        reason: String,
    },
    SessionResolved {
        session_key: String,
        session_id: String,
        is_new: bool,
    },
    SessionReset {
        session_key: String,
        old_session_id: String,
        new_session_id: String,
        reason: String,
    },
    TranscriptAppend {
        session_id: String,
        lines: usize,
    },
    IdentityResolved {
        raw_peer_id: String,
        canonical: String,
    },
    /// An entry was accepted onto a lane's FIFO.
    QueueEnqueued {
        lane: String,
        run_id: String,
        depth_after: usize,
    },
    /// A worker pulled an entry off a lane's FIFO.
    QueueDequeued {
        lane: String,
        run_id: String,
        wait_ms: u64,
    },
    /// A lane rejected an enqueue because it was at its configured depth.
    QueueFull { lane: String, depth: usize },
    /// A run transitioned to a new lifecycle state.
    RunStateChanged {
        run_id: String,
        session_key: String,
        from: String,
        to: String,
    },
    /// An exec approval was requested and is now pending a decision.
    ApprovalRequested {
        approval_id: String,
        run_id: String,
        session_key: String,
        command: String,
        host: String,
    },
    /// An exec approval reached a terminal decision.
    ApprovalDecided {
        approval_id: String,
        status: String,
    },
    /// A cron job fired.
    CronFired { job_id: String, name: String },
    /// A cron job's `nextRunAtMs` was recomputed after firing.
    CronRescheduled {
        job_id: String,
        next_run_at_ms: i64,
    },
    /// An inbound payload was normalized and accepted as a turn.
    IngressAccepted {
        session_key: String,
        channel: String,
    },
    /// An inbound payload was normalized and rejected.
    IngressBlocked { channel: String, reason: String },
    /// A JSON-RPC/WebSocket connection to the Hub opened.
    RpcConnectionOpened { connection_id: String },
    /// A JSON-RPC/WebSocket connection to the Hub closed.
    RpcConnectionClosed {
        connection_id: String,
        reason: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "gw_event");
    }
}
