/// Shared error type used across all OpenClaw Gateway crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("SerialMemory: {0}")]
    SerialMemory(String),

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    /// Malformed RPC params, bad JSON, unknown method, or a request that
    /// fails schema validation. Never surfaced to subscribers — only to
    /// the caller that issued the request.
    #[error("validation: {0}")]
    Validation(String),

    /// A request was rejected by an access-control or approval policy
    /// (DM/group gating, exec denylist, approval denied).
    #[error("access denied: {0}")]
    Access(String),

    /// Queue depth exceeded for a lane, or a resource is at capacity.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Corrupted on-disk state, port unavailable, or any condition the
    /// process cannot recover from. Callers at the process boundary map
    /// this to a non-zero exit code.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

/// JSON-RPC error code, per `spec.md` §4.H / §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RpcErrorCode {
    #[serde(rename = "INVALID_REQUEST")]
    InvalidRequest,
    #[serde(rename = "UNAVAILABLE")]
    Unavailable,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "FORBIDDEN")]
    Forbidden,
    #[serde(rename = "TIMEOUT")]
    Timeout,
}

impl Error {
    /// Map this error onto the JSON-RPC error code taxonomy from §7.
    pub fn rpc_code(&self) -> RpcErrorCode {
        match self {
            Error::Validation(_) | Error::Json(_) | Error::Config(_) => {
                RpcErrorCode::InvalidRequest
            }
            Error::Access(_) | Error::Auth(_) => RpcErrorCode::Forbidden,
            Error::NotFound(_) | Error::SkillNotFound(_) => RpcErrorCode::NotFound,
            Error::Timeout(_) => RpcErrorCode::Timeout,
            Error::Io(_)
            | Error::Http(_)
            | Error::Provider { .. }
            | Error::SerialMemory(_)
            | Error::Unavailable(_) => RpcErrorCode::Unavailable,
            Error::Fatal(_) | Error::Other(_) => RpcErrorCode::Unavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_invalid_request() {
        assert_eq!(
            Error::Validation("bad param".into()).rpc_code(),
            RpcErrorCode::InvalidRequest
        );
    }

    #[test]
    fn access_maps_to_forbidden() {
        assert_eq!(
            Error::Access("policy denied".into()).rpc_code(),
            RpcErrorCode::Forbidden
        );
    }

    #[test]
    fn timeout_maps_to_timeout() {
        assert_eq!(
            Error::Timeout("run timed out".into()).rpc_code(),
            RpcErrorCode::Timeout
        );
    }

    #[test]
    fn not_found_maps_to_not_found() {
        assert_eq!(
            Error::NotFound("session".into()).rpc_code(),
            RpcErrorCode::NotFound
        );
    }
}
