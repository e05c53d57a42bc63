//! Result display collaborator interface.

use std::sync::Arc;

use super::info::EvaluationInfo;

/// External collaborator that renders a finished run to the user.
pub trait ResultDisplay: Send + Sync {
    fn display(&self, info: &Arc<EvaluationInfo>);
}

/// Display that only logs the outcome. Useful as a default and in tests.
#[derive(Debug, Default)]
pub struct LoggingDisplay;

impl ResultDisplay for LoggingDisplay {
    fn display(&self, info: &Arc<EvaluationInfo>) {
        tracing::info!(
            query = %info.query_name,
            outcome = info.outcome.label(),
            "evaluation finished"
        );
    }
}
