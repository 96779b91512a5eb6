//! Tunnel errors

use std::io;

/// Result alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors raised by the tunnel client
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Missing or malformed configuration; raised before any resource exists
    #[error("configuration error: {0}")]
    Config(String),

    /// Host refused to let us create the virtual interface
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Virtual interface bring-up failed
    #[error("interface error: {0}")]
    Interface(String),

    /// Upstream connect timed out, was refused, or could not be protected
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation not allowed in the session's current state
    #[error("invalid state: {0}")]
    State(String),

    /// The platform backend cannot perform an optional step
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl TunnelError {
    /// Stable snake_case code used on the command bridge
    pub fn code(&self) -> &'static str {
        match self {
            TunnelError::Config(_) => "config_error",
            TunnelError::PermissionDenied(_) => "permission_denied",
            TunnelError::Interface(_) => "interface_error",
            TunnelError::UpstreamUnreachable(_) => "upstream_unreachable",
            TunnelError::Io(_) => "io_error",
            TunnelError::State(_) => "state_error",
            TunnelError::NotSupported(_) => "not_supported",
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, TunnelError::Config(_))
    }

    /// Whether the error came from the OS refusing permission
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, TunnelError::PermissionDenied(_))
            || matches!(self, TunnelError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }
}
