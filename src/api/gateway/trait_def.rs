//! Gateway trait definition
//!
//! This module defines the `Gateway` trait that abstracts over the ways the
//! model can be reached.

use super::GatewayError;
use crate::models::TaskTree;

/// Trait defining the language-model interface
#[async_trait::async_trait]
pub trait Gateway: Send + Sync {
    /// Send the current tree and the user's text, returning the raw reply.
    ///
    /// The reply is untrusted text that is expected to contain a JSON payload.
    async fn interpret(&self, tree: &TaskTree, input: &str) -> Result<String, GatewayError>;
}
