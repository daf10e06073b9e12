use async_trait::async_trait;
use std::error::Error;
use tokio_util::sync::CancellationToken;

/// A ClientWrapper is a wrapper around a remote LLM completion service.
/// It is the single external boundary of this crate: given an ordered
/// sequence of role-tagged messages, return one assistant message.
/// Vendor-specific request/response shapes live behind implementations of
/// this trait and never leak into the runtime.

/// Represents the possible roles for a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Set by the developer to steer the model's responses.
    System,
    /// A message sent by a human user or by another agent on the team.
    User,
    /// Content generated by the model in response to prior messages.
    Assistant,
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Clone, Debug)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// Represents a generic message exchanged with an LLM.
///
/// # Example
///
/// ```rust
/// use roundtable::client_wrapper::{Message, Role};
///
/// let msg = Message::new(Role::User, "What changed since the last round?");
/// assert_eq!(msg.role, Role::User);
/// ```
#[derive(Clone, Debug)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The actual content of the message.
    pub content: String,
}

impl Message {
    /// Create a message with the given role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Type alias for a Send-able error box.
pub type SendError = Box<dyn Error + Send + Sync>;

/// Trait defining the interface to interact with an LLM completion service.
///
/// Implementations should honor the cancellation token at their own
/// suspension points where practical; the runtime always threads the token
/// through so a cancelled exchange can be abandoned without waiting for the
/// provider to respond.
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Send the ordered message sequence to the LLM and return the single
    /// assistant message it produces.
    async fn send_message(
        &self,
        messages: &[Message],
        cancellation: &CancellationToken,
    ) -> Result<Message, SendError>;

    /// Name of the underlying model, for logging and events.
    fn model_name(&self) -> &str;

    /// Usage reported by the *last* `send_message()` call.
    /// Default impl returns `None` so wrappers without accounting don't break.
    async fn get_last_usage(&self) -> Option<TokenUsage> {
        None
    }
}
