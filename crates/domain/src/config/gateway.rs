use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway bind mode & RPC Hub auth (spec.md §4.H / §6)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the Gateway's listener is bound, mirroring `OPENCLAW_BIND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// `127.0.0.1` only. Auth is not required in this mode.
    Loopback,
    /// Bound to a LAN-reachable interface. Requires auth.
    Lan,
    /// Bound to a tailnet interface (e.g. Tailscale). Requires auth.
    Tailnet,
    /// Operator-specified host. Requires auth.
    Custom,
}

impl Default for BindMode {
    fn default() -> Self {
        BindMode::Loopback
    }
}

impl BindMode {
    /// Per `spec.md` §6: non-loopback binds without auth configured are a
    /// fatal startup condition (exit code 3).
    pub fn requires_auth(&self) -> bool {
        !matches!(self, BindMode::Loopback)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub bind: BindMode,
    /// Env var holding the RPC/REST bearer token. Read at boot; unset in
    /// loopback mode is fine, fatal in any other bind mode.
    #[serde(default = "d_token_env")]
    pub token_env: String,
    /// Env var holding a password (alternative to bearer token, for the
    /// `chat.send`-style CLI bridge). Optional even off-loopback if
    /// `token_env` is set.
    #[serde(default = "d_password_env")]
    pub password_env: String,
    /// Path to the JSON-RPC WebSocket route, default `/v1/rpc`.
    #[serde(default = "d_rpc_path")]
    pub rpc_path: String,
    /// Max attachment size accepted by `chat.send`, bytes. Default 5 MiB.
    #[serde(default = "d_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: BindMode::default(),
            token_env: d_token_env(),
            password_env: d_password_env(),
            rpc_path: d_rpc_path(),
            max_attachment_bytes: d_max_attachment_bytes(),
        }
    }
}

fn d_token_env() -> String {
    "OPENCLAW_GATEWAY_TOKEN".into()
}
fn d_password_env() -> String {
    "OPENCLAW_GATEWAY_PASSWORD".into()
}
fn d_rpc_path() -> String {
    "/v1/rpc".into()
}
fn d_max_attachment_bytes() -> u64 {
    5 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_does_not_require_auth() {
        assert!(!BindMode::Loopback.requires_auth());
    }

    #[test]
    fn lan_tailnet_custom_require_auth() {
        assert!(BindMode::Lan.requires_auth());
        assert!(BindMode::Tailnet.requires_auth());
        assert!(BindMode::Custom.requires_auth());
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.bind, BindMode::Loopback);
        assert_eq!(cfg.rpc_path, "/v1/rpc");
        assert_eq!(cfg.max_attachment_bytes, 5 * 1024 * 1024);
    }
}
