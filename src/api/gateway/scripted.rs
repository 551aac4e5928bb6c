//! A gateway that replays canned replies in order, without any network.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::{Gateway, GatewayError};
use crate::models::TaskTree;

#[derive(Debug, Default)]
pub struct ScriptedGateway {
    replies: Mutex<VecDeque<String>>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Queue another reply
    pub fn push(&self, reply: impl Into<String>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply.into());
        }
    }

    /// Inputs received so far
    pub fn inputs(&self) -> Vec<String> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Gateway for ScriptedGateway {
    async fn interpret(&self, _tree: &TaskTree, input: &str) -> Result<String, GatewayError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(input.to_string());
        }
        self.replies
            .lock()
            .map_err(|_| GatewayError::LlmUnavailable("script lock poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| GatewayError::LlmUnavailable("no scripted reply left".to_string()))
    }
}
