//! Message kinds exchanged between actors.
//!
//! The runtime speaks exactly four message kinds, modelled as one closed
//! union so dispatch is an exhaustive `match` rather than a runtime type
//! probe:
//!
//! - [`AgentMessage::Broadcast`]: conversational content published to a
//!   recipient, optionally requesting a halt of the orchestration;
//! - [`AgentMessage::RequestReply`]: ask the recipient to produce its next
//!   utterance from the context it has accumulated;
//! - [`AgentMessage::Reset`]: clear the recipient's accumulated state;
//! - [`AgentMessage::Deactivate`]: permanently switch the recipient off.
//!
//! A message is created by a sender, consumed exactly once by the recipient's
//! mailbox, and discarded after (at most) producing a reply. The runtime
//! never retains messages.

use crate::roundtable::client_wrapper::Message;

/// Conversational content published to an actor.
///
/// # Example
///
/// ```rust
/// use roundtable::client_wrapper::{Message, Role};
/// use roundtable::messages::BroadcastMessage;
///
/// let b = BroadcastMessage::new(Message::new(Role::User, "Summarize the findings"));
/// assert!(!b.request_halt);
///
/// let halting = BroadcastMessage::new(Message::new(Role::User, "done")).with_halt();
/// assert!(halting.request_halt);
/// ```
#[derive(Clone, Debug)]
pub struct BroadcastMessage {
    /// The role-tagged content being published.
    pub content: Message,
    /// When set, asks any orchestrator that receives this broadcast to stop
    /// advancing rounds.
    pub request_halt: bool,
}

impl BroadcastMessage {
    /// Create a broadcast carrying the given content, without a halt request.
    pub fn new(content: Message) -> Self {
        Self {
            content,
            request_halt: false,
        }
    }

    /// Mark this broadcast as a halt request.
    pub fn with_halt(mut self) -> Self {
        self.request_halt = true;
        self
    }
}

/// The closed set of message kinds an actor can receive.
///
/// `RequestReply`, `Reset` and `Deactivate` carry no payload: a reply request
/// is answered from the context the recipient accumulated through earlier
/// broadcasts.
#[derive(Clone, Debug)]
pub enum AgentMessage {
    /// Conversational content, possibly requesting a halt.
    Broadcast(BroadcastMessage),
    /// Ask the recipient to produce a reply from its accumulated context.
    RequestReply,
    /// Clear the recipient's accumulated state.
    Reset,
    /// Switch the recipient off; subsequent messages are ignored.
    Deactivate,
}

impl AgentMessage {
    /// Short human-readable kind tag, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentMessage::Broadcast(_) => "broadcast",
            AgentMessage::RequestReply => "request-reply",
            AgentMessage::Reset => "reset",
            AgentMessage::Deactivate => "deactivate",
        }
    }
}
