use std::time::Duration;

use thiserror::Error;

/// Errors raised by the device-plugin session.
///
/// Protocol violations ([`PluginError::UnknownDevice`],
/// [`PluginError::UnhealthyDevice`]) are reported to the caller and are
/// never fatal to the process. Everything else aborts the startup step
/// that produced it.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Peer unreachable. Retried only on the self-test dial path; the
    /// memoized vendor connection surfaces this to the discovery caller.
    #[error("failed to connect to {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },

    /// The self-test dial spent its whole attempt or time budget.
    #[error("self-test dial of {endpoint} gave up after {attempts} attempts")]
    SelfTestExhausted { endpoint: String, attempts: u32 },

    /// The vendor enumeration call did not answer in time. Distinct from
    /// [`PluginError::Discovery`] so callers can treat it as retryable.
    #[error("device discovery timed out after {timeout:?}")]
    DiscoveryTimeout { timeout: Duration },

    #[error("device discovery failed: {source}")]
    Discovery {
        #[source]
        source: tonic::Status,
    },

    #[error("unknown device: {id}")]
    UnknownDevice { id: String },

    #[error("unhealthy device: {id}")]
    UnhealthyDevice { id: String },

    #[error("failed to register resource {resource} with kubelet: {source}")]
    Registration {
        resource: String,
        #[source]
        source: tonic::Status,
    },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PluginError> for tonic::Status {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::UnknownDevice { .. } => tonic::Status::not_found(err.to_string()),
            PluginError::UnhealthyDevice { .. } => {
                tonic::Status::failed_precondition(err.to_string())
            }
            PluginError::DiscoveryTimeout { .. } => {
                tonic::Status::deadline_exceeded(err.to_string())
            }
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
