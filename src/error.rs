//! Failure taxonomy of the analysis pipeline.
//!
//! Rejected content is not an error (see [`crate::pipeline::normalize::Rejection`]) and
//! rate-limit waits never leave the HTTP client, so neither has a variant here.

use thiserror::Error;

use crate::store::dao::LeaseLost;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("channel {0} does not exist")]
    ChannelNotFound(String),

    #[error("message limit is not configured for channel {0}")]
    LimitNotConfigured(String),

    /// An offset or quote segment could not be mapped back to its owning message.
    #[error("attribution failure: {0}")]
    AttributionFailure(String),

    #[error("{service} request failed")]
    ExternalService {
        service: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("stage invariant violated: {0}")]
    StageInvariant(String),

    /// The attempt was stopped and its channel taken by a newer attempt mid-write.
    #[error("stage attempt {attempt} on channel {channel_id} was superseded")]
    Superseded { channel_id: String, attempt: i64 },

    #[error("storage operation failed")]
    Storage(#[source] anyhow::Error),
}

impl PipelineError {
    pub(crate) fn external(service: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| PipelineError::ExternalService { service, source }
    }

    /// Short label used for metrics and structured logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::ChannelNotFound(_) => "channel_not_found",
            PipelineError::LimitNotConfigured(_) => "limit_not_configured",
            PipelineError::AttributionFailure(_) => "attribution_failure",
            PipelineError::ExternalService { .. } => "external_service",
            PipelineError::StageInvariant(_) => "stage_invariant",
            PipelineError::Superseded { .. } => "superseded",
            PipelineError::Storage(_) => "storage",
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(source: anyhow::Error) -> Self {
        match source.downcast::<LeaseLost>() {
            Ok(lost) => PipelineError::Superseded {
                channel_id: lost.channel_id,
                attempt: lost.attempt,
            },
            Err(source) => PipelineError::Storage(source),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_wraps_source_with_service_name() {
        let error = PipelineError::external("sentiment")(anyhow::anyhow!("503 Service Unavailable"));
        assert_eq!(error.to_string(), "sentiment request failed");
        assert_eq!(error.kind(), "external_service");
        let source = std::error::Error::source(&error).expect("source kept");
        assert!(source.to_string().contains("503"));
    }

    #[test]
    fn anyhow_errors_become_storage_failures() {
        let error: PipelineError = anyhow::anyhow!("connection reset").into();
        assert!(matches!(error, PipelineError::Storage(_)));
    }

    #[test]
    fn lost_lease_becomes_superseded() {
        let lost = LeaseLost {
            channel_id: "c1".to_string(),
            attempt: 3,
        };
        let error: PipelineError = anyhow::Error::from(lost).into();
        assert!(matches!(
            error,
            PipelineError::Superseded { ref channel_id, attempt: 3 } if channel_id == "c1"
        ));
        assert_eq!(error.kind(), "superseded");
    }
}
