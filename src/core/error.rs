use thiserror::Error;

/// Error taxonomy shared by the scheduler, pool, tool router and gateway.
///
/// Registration/validation failures surface synchronously to the caller;
/// execution-time failures inside jobs and sweeps are caught, classified
/// and recorded in runtime state instead of propagating.
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("duplicate registration: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no pool slot for plugin '{plugin}' within {waited_ms}ms")]
    PoolTimeout { plugin: String, waited_ms: u64 },

    #[error("worker start failed: {0}")]
    StartFailed(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("protocol error from [{server}]: {detail}")]
    Protocol { server: String, detail: serde_json::Value },

    #[error("signature verification failed")]
    Signature,

    #[error("rate limit exceeded for plugin '{0}'")]
    RateLimited(String),
}

impl OrchestratorError {
    /// HTTP status the gateway maps this failure class to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Config(_) | Self::Duplicate(_) => 400,
            Self::Signature => 401,
            Self::NotFound(_) => 404,
            Self::RateLimited(_) => 429,
            Self::PoolTimeout { .. } | Self::Timeout(_) => 503,
            Self::StartFailed(_) | Self::Execution(_) | Self::Protocol { .. } => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_failure_class() {
        assert_eq!(OrchestratorError::Config("x".into()).http_status(), 400);
        assert_eq!(OrchestratorError::Signature.http_status(), 401);
        assert_eq!(OrchestratorError::NotFound("j".into()).http_status(), 404);
        assert_eq!(OrchestratorError::RateLimited("p".into()).http_status(), 429);
        assert_eq!(
            OrchestratorError::PoolTimeout {
                plugin: "p".into(),
                waited_ms: 30_000
            }
            .http_status(),
            503
        );
        assert_eq!(
            OrchestratorError::StartFailed("spawn".into()).http_status(),
            500
        );
    }

    #[test]
    fn display_carries_detail() {
        let e = OrchestratorError::PoolTimeout {
            plugin: "stripe-sync".into(),
            waited_ms: 30_000,
        };
        assert!(e.to_string().contains("stripe-sync"));
        assert!(e.to_string().contains("30000"));
    }
}
