//! API module
//!
//! This module provides the boundary to the language model: the gateway that
//! sends the prompt, the prompt itself, and the parser for the reply.

pub mod gateway;
pub mod prompt;
pub mod response;

// Re-export commonly used types
pub use gateway::{Gateway, GatewayConfig, GatewayError, HttpGateway, ScriptedGateway};
pub use prompt::render_prompt;
pub use response::{parse_response, ParsedResponse, Payload};
