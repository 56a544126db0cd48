use thiserror::Error;

use crate::gateway::GatewayError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),

    #[error("Bulk job has no recipients")]
    NoRecipients,

    #[error("Multi-block job has no blocks")]
    NoBlocks,

    #[error("Unsupported message type: {0}")]
    UnsupportedMessage(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("All {0} unit(s) failed")]
    AllUnitsFailed(usize),

    #[error("Queue error: {0}")]
    Queue(#[from] relay_queue::QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether running the job again could succeed. Input errors reproduce
    /// on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::InvalidPhone(_)
            | EngineError::NoRecipients
            | EngineError::NoBlocks
            | EngineError::UnsupportedMessage(_) => false,
            EngineError::Gateway(_)
            | EngineError::AllUnitsFailed(_)
            | EngineError::Queue(_)
            | EngineError::Serialization(_) => true,
        }
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidPhone(_) => "invalid_phone",
            EngineError::NoRecipients => "no_recipients",
            EngineError::NoBlocks => "no_blocks",
            EngineError::UnsupportedMessage(_) => "unsupported_message",
            EngineError::Gateway(_) => "gateway",
            EngineError::AllUnitsFailed(_) => "all_units_failed",
            EngineError::Queue(_) => "queue",
            EngineError::Serialization(_) => "serialization",
        }
    }
}
