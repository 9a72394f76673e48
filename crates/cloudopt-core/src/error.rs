use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CloudoptError {
    #[error("not initialized: run 'cloudopt init'")]
    NotInitialized,

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("action {0} requires approval before execution")]
    ApprovalRequired(Uuid),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("action {id} exhausted its retry budget after {attempts} attempts")]
    RetryExhausted { id: Uuid, attempts: u32 },

    #[error("provider error: {0}")]
    Provider(String),

    /// A step failed with no failure edge to follow. `step` is the step's
    /// index, plus its name when it has one.
    #[error("workflow failed at step {step}: {message}")]
    WorkflowStep { step: String, message: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CloudoptError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Errors a caller can fix by changing its request, as opposed to
    /// infrastructure failures.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Validation(_)
                | Self::InvalidWorkflow(_)
                | Self::ApprovalRequired(_)
                | Self::InvalidTransition { .. }
                | Self::RetryExhausted { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CloudoptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_the_kind() {
        let err = CloudoptError::not_found("action", "abc");
        assert_eq!(err.to_string(), "action not found: abc");
    }

    #[test]
    fn workflow_step_message_names_the_step() {
        let err = CloudoptError::WorkflowStep {
            step: "0 (stop)".into(),
            message: "throttled".into(),
        };
        assert_eq!(err.to_string(), "workflow failed at step 0 (stop): throttled");
        assert!(!err.is_rejection());
    }

    #[test]
    fn store_errors_are_not_rejections() {
        assert!(!CloudoptError::Store("disk full".into()).is_rejection());
        assert!(CloudoptError::ApprovalRequired(Uuid::nil()).is_rejection());
    }
}
