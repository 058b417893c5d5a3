use thiserror::Error;

/// Errors surfaced by the multiplexer and the typed appliance client.
///
/// `Rpc` carries whatever the appliance itself returned; everything else is
/// synthesized locally by the transport or the decoding layer.
#[derive(Error, Debug, Clone)]
pub enum ApplianceError {
    #[error("connection to appliance lost")]
    TransportLost,

    #[error("call timed out waiting for a response")]
    Timeout,

    #[error("authentication with the appliance failed: {0}")]
    AuthenticationFailed(String),

    #[error("multiplexer is closed after exhausting reconnect attempts")]
    Closed,

    #[error("appliance returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("failed to decode appliance response: {0}")]
    Decode(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("object has dependents and cannot be removed: {0}")]
    HasDependents(String),

    #[error("invalid parameters: {0}")]
    InvalidArgument(String),
}

impl ApplianceError {
    /// True for conditions a caller may treat as "doesn't exist", regardless
    /// of whether the appliance raised a structured not-found error or the
    /// transport never reached it at all.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApplianceError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ApplianceError::AlreadyExists(_))
    }

    pub fn is_has_dependents(&self) -> bool {
        matches!(self, ApplianceError::HasDependents(_))
    }

    /// Transient per spec §7: safe for the CSI caller to retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApplianceError::TransportLost | ApplianceError::Timeout | ApplianceError::Closed
        )
    }

    /// Classify a raw JSON-RPC error object returned by the appliance into
    /// one of our structured variants, by inspecting the message text.
    /// TrueNAS middleware does not give us a stable machine-readable error
    /// taxonomy over this transport, only a code and a free-form message.
    pub fn from_rpc(code: i64, message: String) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("does not exist") || lower.contains("not found") {
            ApplianceError::NotFound(message)
        } else if lower.contains("already exists") {
            ApplianceError::AlreadyExists(message)
        } else if lower.contains("has dependent") || lower.contains("has children") {
            ApplianceError::HasDependents(message)
        } else {
            ApplianceError::Rpc { code, message }
        }
    }
}

pub type Result<T> = std::result::Result<T, ApplianceError>;
