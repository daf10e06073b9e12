//! LLM-backed specialist agents.
//!
//! A [`SpecialistAgent`] is the leaf actor of the runtime: it accumulates a
//! rolling conversation history from the broadcasts it receives and, when
//! asked for a reply, sends `[system prompt] + history` to its
//! [`ClientWrapper`] and appends the assistant's answer back onto the
//! history.
//!
//! Specialists are normally spawned behind an
//! [`ActorHandle`](crate::mailbox::ActorHandle), but the direct-call surface
//! ([`observe`](SpecialistAgent::observe), [`respond`](SpecialistAgent::respond),
//! [`clear`](SpecialistAgent::clear)) is public so coordinators can drive a
//! private sub-agent without a mailbox in between.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use roundtable::agent::SpecialistAgent;
//! use roundtable::client_wrapper::ClientWrapper;
//! use roundtable::mailbox::ActorHandle;
//!
//! # fn demo(client: Arc<dyn ClientWrapper>) {
//! let agent = SpecialistAgent::new("analyst", "Reads logs and finds anomalies", client)
//!     .with_system_prompt("You are a terse log analyst.");
//!
//! // As an actor:
//! let handle = ActorHandle::spawn_ordered(Arc::new(agent));
//! # }
//! ```

use crate::roundtable::client_wrapper::{
    ClientWrapper, Message, Role, SendError, TokenUsage,
};
use crate::roundtable::event::{AgentEvent, EventHandler};
use crate::roundtable::mailbox::{MessageContext, MessageHandler};
use crate::roundtable::messages::BroadcastMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// An LLM-powered agent with a stable identity and a rolling history.
pub struct SpecialistAgent {
    name: String,
    description: String,
    system_prompt: String,
    client: Arc<dyn ClientWrapper>,
    history: Mutex<Vec<Message>>,
    events: Option<Arc<dyn EventHandler>>,
}

impl SpecialistAgent {
    /// Create an agent with the given identity. Name and description are
    /// immutable afterwards; the description is what orchestrators show to
    /// other models when presenting the team roster.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        client: Arc<dyn ClientWrapper>,
    ) -> Self {
        let name = name.into();
        let description = description.into();
        let system_prompt = format!("You are {}. {}", name, description);
        Self {
            name,
            description,
            system_prompt,
            client,
            history: Mutex::new(Vec::new()),
            events: None,
        }
    }

    /// Replace the default system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Attach an event handler for LLM call observability.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = Some(handler);
        self
    }

    /// Append a message to the rolling history without responding.
    pub async fn observe(&self, message: Message) {
        self.history.lock().await.push(message);
    }

    /// Number of messages currently held in the rolling history.
    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    /// Clear the rolling history.
    pub async fn clear(&self) {
        self.history.lock().await.clear();
    }

    /// Usage reported by the client for its last call, when available.
    pub async fn last_usage(&self) -> Option<TokenUsage> {
        self.client.get_last_usage().await
    }

    /// Send `[system] + history` to the model, append the assistant reply to
    /// the history, and return it.
    pub async fn respond(&self, cancellation: &CancellationToken) -> Result<Message, SendError> {
        let mut outgoing = Vec::new();
        outgoing.push(Message::new(Role::System, self.system_prompt.clone()));
        {
            let history = self.history.lock().await;
            outgoing.extend(history.iter().cloned());
        }

        self.emit(AgentEvent::LlmCallStarted {
            agent_name: self.name.clone(),
            message_count: outgoing.len(),
        })
        .await;

        // Best-effort cancellation: bail at this suspension point even when
        // the client itself never looks at the token.
        let reply = tokio::select! {
            _ = cancellation.cancelled() => {
                return Err("llm call cancelled".into());
            }
            result = self.client.send_message(&outgoing, cancellation) => result?,
        };

        self.emit(AgentEvent::LlmCallCompleted {
            agent_name: self.name.clone(),
            response_length: reply.content.len(),
            tokens_used: self.client.get_last_usage().await,
        })
        .await;

        self.history.lock().await.push(reply.clone());
        Ok(reply)
    }

    async fn emit(&self, event: AgentEvent) {
        if let Some(handler) = &self.events {
            handler.on_agent_event(&event).await;
        }
    }
}

#[async_trait]
impl MessageHandler for SpecialistAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn on_broadcast(
        &self,
        message: &BroadcastMessage,
        _context: &MessageContext,
    ) -> Result<(), SendError> {
        self.observe(message.content.clone()).await;
        Ok(())
    }

    async fn on_request_reply(
        &self,
        context: &MessageContext,
    ) -> Result<Option<Message>, SendError> {
        self.respond(&context.cancellation).await.map(Some)
    }

    async fn on_reset(&self, _context: &MessageContext) -> Result<(), SendError> {
        self.clear().await;
        Ok(())
    }

    async fn on_deactivate(&self, _context: &MessageContext) -> Result<(), SendError> {
        self.emit(AgentEvent::Deactivated {
            agent_name: self.name.clone(),
        })
        .await;
        Ok(())
    }
}
