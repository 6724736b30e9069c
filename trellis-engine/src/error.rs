//! Pipeline errors

use thiserror::Error;
use trellis_core::ProvisionError;

/// A failed run: the step that failed, the node it failed on and why
#[derive(Debug, Error)]
#[error("step '{step}'{} failed: {source}", on_node(.node))]
pub struct PipelineError {
    pub step: String,
    pub node: Option<String>,
    #[source]
    pub source: ProvisionError,
}

impl PipelineError {
    pub fn new(step: impl Into<String>, node: Option<String>, source: ProvisionError) -> Self {
        Self {
            step: step.into(),
            node,
            source,
        }
    }

    /// Whether a polled operation ran out of time
    pub fn is_timeout(&self) -> bool {
        self.source.is_timeout()
    }
}

fn on_node(node: &Option<String>) -> String {
    node.as_deref()
        .map(|n| format!(" on node '{n}'"))
        .unwrap_or_default()
}
