//! Per-actor mailboxes with optional strict ordering.
//!
//! Every agent in the runtime sits behind an [`ActorHandle`]. The handle
//! accepts the four [`AgentMessage`](crate::messages::AgentMessage) kinds and
//! either:
//!
//! - queues them onto an internal FIFO mailbox drained by a single worker
//!   task (the default), so at most one handler runs at a time and handling
//!   order equals arrival order, or
//! - dispatches them inline in the caller's task when the actor opted into
//!   concurrent handling, in which case no ordering guarantee is made.
//!
//! # Architecture
//!
//! ```text
//! caller ──handle_incoming_message──▶ mpsc queue ──▶ worker task
//!    │                                                  │
//!    └───────── awaits oneshot completion ◀─────────────┘
//! ```
//!
//! Each queued item carries a oneshot completion handle. The worker resolves
//! it with the handler's outcome or rejects it with the handler's error.
//! When the caller's cancellation token fired before the item was dequeued,
//! the worker resolves it as [`ActorError::Cancelled`] without invoking any
//! handler, so a cancelled exchange has zero side effects.
//!
//! A handler error is delivered on that message's completion handle only;
//! the worker keeps draining subsequent items.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use roundtable::client_wrapper::{Message, Role};
//! use roundtable::mailbox::{ActorHandle, MessageContext, MessageHandler};
//! use roundtable::messages::BroadcastMessage;
//! use async_trait::async_trait;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl MessageHandler for Echo {
//!     fn name(&self) -> &str { "echo" }
//!     fn description(&self) -> &str { "Repeats the last thing it heard" }
//! }
//!
//! # async {
//! let actor = ActorHandle::spawn_ordered(Arc::new(Echo));
//! let ctx = MessageContext::root();
//! actor.broadcast(
//!     BroadcastMessage::new(Message::new(Role::User, "hello")),
//!     ctx,
//! ).await.unwrap();
//! # };
//! ```

use crate::roundtable::client_wrapper::{Message, SendError};
use crate::roundtable::messages::{AgentMessage, BroadcastMessage};
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Delivery context threaded through every message exchange.
///
/// Carries the identity of the sender (when it chose to identify itself) and
/// the cancellation token governing the exchange. Forwarding a context keeps
/// the same token so cancellation reaches every hop.
#[derive(Clone, Debug)]
pub struct MessageContext {
    /// Name of the sending actor, if known.
    pub sender: Option<String>,
    /// Token observed at every suspension point of the exchange.
    pub cancellation: CancellationToken,
}

impl MessageContext {
    /// A fresh anonymous context with its own cancellation token.
    pub fn root() -> Self {
        Self {
            sender: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// An anonymous context governed by an existing token.
    pub fn with_token(cancellation: CancellationToken) -> Self {
        Self {
            sender: None,
            cancellation,
        }
    }

    /// A context identifying its sender, governed by an existing token.
    pub fn from_sender(sender: impl Into<String>, cancellation: CancellationToken) -> Self {
        Self {
            sender: Some(sender.into()),
            cancellation,
        }
    }

    /// Derive a context for a follow-up hop: same token, new sender.
    pub fn forwarded_by(&self, sender: &str) -> Self {
        Self {
            sender: Some(sender.to_string()),
            cancellation: self.cancellation.clone(),
        }
    }

    /// The sender name, or `"unknown"` when the sender did not identify
    /// itself.
    pub fn effective_source(&self) -> &str {
        self.sender.as_deref().unwrap_or("unknown")
    }
}

/// Errors surfaced on a message's completion handle.
#[derive(Debug)]
pub enum ActorError {
    /// The exchange was cancelled before the handler was invoked, or the
    /// handler observed cancellation itself. Distinct from failure.
    Cancelled,
    /// The actor's mailbox worker is gone (the handle outlived the runtime).
    MailboxClosed,
    /// The handler for this specific message failed.
    Handler(SendError),
}

impl ActorError {
    /// Whether this outcome is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ActorError::Cancelled)
    }
}

impl fmt::Display for ActorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorError::Cancelled => write!(f, "message exchange cancelled"),
            ActorError::MailboxClosed => write!(f, "actor mailbox closed"),
            ActorError::Handler(e) => write!(f, "handler error: {}", e),
        }
    }
}

impl Error for ActorError {}

/// Outcome of delivering one message: an optional reply, or the error that
/// specific message produced.
pub type DeliveryResult = Result<Option<Message>, ActorError>;

/// The behavior an actor attaches to its mailbox.
///
/// One method per message kind. The defaults drop the message with a
/// debug-level trace (the generic-dispatch fallback for kinds the actor does
/// not care about); `on_request_reply` additionally answers `Ok(None)` so an
/// uninterested actor never blocks a reply request.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Stable name of this actor; identity is immutable after construction.
    fn name(&self) -> &str;

    /// Human-readable description, used by orchestrators to present the
    /// team roster.
    fn description(&self) -> &str;

    /// Handle published conversational content.
    async fn on_broadcast(
        &self,
        _message: &BroadcastMessage,
        _context: &MessageContext,
    ) -> Result<(), SendError> {
        log::debug!("actor '{}' dropped unhandled broadcast", self.name());
        Ok(())
    }

    /// Produce this actor's next utterance from its accumulated context.
    async fn on_request_reply(
        &self,
        _context: &MessageContext,
    ) -> Result<Option<Message>, SendError> {
        log::debug!("actor '{}' dropped unhandled reply request", self.name());
        Ok(None)
    }

    /// Clear accumulated state.
    async fn on_reset(&self, _context: &MessageContext) -> Result<(), SendError> {
        log::debug!("actor '{}' dropped unhandled reset", self.name());
        Ok(())
    }

    /// Observe deactivation. The mailbox flips the enabled flag before this
    /// runs; this hook always runs to completion.
    async fn on_deactivate(&self, _context: &MessageContext) -> Result<(), SendError> {
        Ok(())
    }
}

struct QueueItem {
    message: AgentMessage,
    context: MessageContext,
    done: oneshot::Sender<DeliveryResult>,
}

struct MailboxCore {
    handler: Arc<dyn MessageHandler>,
    enabled: AtomicBool,
}

impl MailboxCore {
    async fn dispatch(&self, message: AgentMessage, context: &MessageContext) -> DeliveryResult {
        log::debug!(
            "actor '{}' handling {} message from '{}'",
            self.handler.name(),
            message.kind(),
            context.effective_source()
        );
        match message {
            AgentMessage::Broadcast(broadcast) => self
                .handler
                .on_broadcast(&broadcast, context)
                .await
                .map(|_| None)
                .map_err(ActorError::Handler),
            AgentMessage::RequestReply => self
                .handler
                .on_request_reply(context)
                .await
                .map_err(ActorError::Handler),
            AgentMessage::Reset => self
                .handler
                .on_reset(context)
                .await
                .map(|_| None)
                .map_err(ActorError::Handler),
            AgentMessage::Deactivate => {
                self.enabled.store(false, Ordering::SeqCst);
                log::info!("actor '{}' deactivated", self.handler.name());
                self.handler
                    .on_deactivate(context)
                    .await
                    .map(|_| None)
                    .map_err(ActorError::Handler)
            }
        }
    }
}

/// Addressable handle to a spawned actor.
///
/// Cloning the handle yields another address for the same mailbox. Dropping
/// every clone closes the mailbox and ends its worker task.
#[derive(Clone)]
pub struct ActorHandle {
    name: String,
    description: String,
    core: Arc<MailboxCore>,
    queue: Option<mpsc::UnboundedSender<QueueItem>>,
}

impl ActorHandle {
    /// Spawn an actor around the given handler.
    ///
    /// With `handle_messages_concurrently == false` (the usual mode) a
    /// dedicated worker task drains the mailbox strictly in arrival order.
    /// With `true`, messages are dispatched inline in the caller's task and
    /// handlers may interleave at suspension points.
    pub fn spawn(handler: Arc<dyn MessageHandler>, handle_messages_concurrently: bool) -> Self {
        let name = handler.name().to_string();
        let description = handler.description().to_string();
        let core = Arc::new(MailboxCore {
            handler,
            enabled: AtomicBool::new(true),
        });

        let queue = if handle_messages_concurrently {
            None
        } else {
            let (tx, mut rx) = mpsc::unbounded_channel::<QueueItem>();
            let worker_core = Arc::clone(&core);
            tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    let QueueItem {
                        message,
                        context,
                        done,
                    } = item;
                    if context.cancellation.is_cancelled() {
                        // Dropped before it was ever handled: no side effects.
                        let _ = done.send(Err(ActorError::Cancelled));
                        continue;
                    }
                    let result = worker_core.dispatch(message, &context).await;
                    // A dropped completion handle just means nobody is
                    // waiting; the worker keeps draining either way.
                    let _ = done.send(result);
                }
            });
            Some(tx)
        };

        Self {
            name,
            description,
            core,
            queue,
        }
    }

    /// Spawn with strict FIFO ordering (the default mode).
    pub fn spawn_ordered(handler: Arc<dyn MessageHandler>) -> Self {
        Self::spawn(handler, false)
    }

    /// Stable name of the actor behind this handle.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description of the actor behind this handle.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether the actor is still accepting messages.
    pub fn is_enabled(&self) -> bool {
        self.core.enabled.load(Ordering::SeqCst)
    }

    /// Deliver one message and await its outcome.
    ///
    /// A deactivated actor ignores the call entirely (`Ok(None)`), without
    /// queueing or dispatching anything.
    pub async fn handle_incoming_message(
        &self,
        message: AgentMessage,
        context: MessageContext,
    ) -> DeliveryResult {
        if !self.is_enabled() {
            return Ok(None);
        }
        match &self.queue {
            Some(tx) => {
                let (done, wait) = oneshot::channel();
                tx.send(QueueItem {
                    message,
                    context,
                    done,
                })
                .map_err(|_| ActorError::MailboxClosed)?;
                wait.await.map_err(|_| ActorError::MailboxClosed)?
            }
            None => self.core.dispatch(message, &context).await,
        }
    }

    /// Deliver one message without awaiting its outcome.
    ///
    /// The completion handle is discarded; failures surface only in the
    /// actor's own logs. Used for topic-style fan-out where the publisher
    /// does not care when subscribers finish.
    pub fn post(&self, message: AgentMessage, context: MessageContext) {
        if !self.is_enabled() {
            return;
        }
        match &self.queue {
            Some(tx) => {
                let (done, _discarded) = oneshot::channel();
                let _ = tx.send(QueueItem {
                    message,
                    context,
                    done,
                });
            }
            None => {
                let core = Arc::clone(&self.core);
                tokio::spawn(async move {
                    if let Err(e) = core.dispatch(message, &context).await {
                        if !e.is_cancelled() {
                            log::warn!("posted message failed: {}", e);
                        }
                    }
                });
            }
        }
    }

    /// Publish conversational content to this actor.
    pub async fn broadcast(
        &self,
        message: BroadcastMessage,
        context: MessageContext,
    ) -> Result<(), ActorError> {
        self.handle_incoming_message(AgentMessage::Broadcast(message), context)
            .await
            .map(|_| ())
    }

    /// Ask this actor for its next utterance.
    pub async fn request_reply(&self, context: MessageContext) -> DeliveryResult {
        self.handle_incoming_message(AgentMessage::RequestReply, context)
            .await
    }

    /// Clear this actor's accumulated state.
    pub async fn reset(&self, context: MessageContext) -> Result<(), ActorError> {
        self.handle_incoming_message(AgentMessage::Reset, context)
            .await
            .map(|_| ())
    }

    /// Switch this actor off. The deactivation itself is processed; anything
    /// arriving afterwards is silently ignored.
    pub async fn deactivate(&self, context: MessageContext) -> Result<(), ActorError> {
        self.handle_incoming_message(AgentMessage::Deactivate, context)
            .await
            .map(|_| ())
    }
}
