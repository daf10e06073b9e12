//! # Roundtable
//!
//! Roundtable is a single-threaded actor runtime and round-based orchestration
//! core for teams of agents that converse with remote Large Language Models.
//!
//! The crate provides carefully layered abstractions for:
//!
//! * **Mailbox Actors**: every agent sits behind an [`ActorHandle`] that
//!   accepts four message kinds and, by default, guarantees they are handled
//!   one at a time in strict arrival order
//! * **Specialist Agents**: [`SpecialistAgent`] wraps an LLM client with a
//!   stable identity and a rolling conversation history
//! * **Round-Based Orchestration**: [`orchestrator::Orchestrator`] drives a
//!   team through speaker-selection rounds with round, wall-clock, and halt
//!   termination ceilings and a pluggable [`orchestrator::NextSpeaker`] policy
//! * **Reflective Sessions**: [`TeamSession`] repeatedly asks a reflection
//!   model for a strict-JSON progress [`ledger::Ledger`] (satisfied?
//!   progressing? who speaks next?), repairing malformed output with
//!   corrective re-prompts, rewriting its fact sheet on stalls, and falling
//!   back to an educated guess before giving up
//! * **Evolutionary Search**: [`evolution::SearchAgent`] evolves LLM-authored
//!   candidate programs against an example set, persisting a durable,
//!   resumable archive
//! * **Provider Neutrality**: the [`ClientWrapper`] trait is the entire
//!   external boundary: any vendor SDK can sit behind it
//!
//! ## Concurrency Model
//!
//! The runtime is cooperatively scheduled on tokio: actors do not run on
//! dedicated threads, and concurrency comes from interleaved suspension on
//! LLM calls and mailbox waits. An actor spawned with
//! [`ActorHandle::spawn_ordered`](mailbox::ActorHandle::spawn_ordered) owns a
//! FIFO mailbox drained by one worker task, so handling order equals arrival
//! order and at most one handler runs at a time. Cancellation tokens are
//! threaded through every exchange; cancelling before an item is dequeued
//! means its handler is never invoked.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use roundtable::client_wrapper::ClientWrapper;
//! use roundtable::mailbox::ActorHandle;
//! use roundtable::{SpecialistAgent, TeamSession};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(client: Arc<dyn ClientWrapper>) -> Result<(), Box<dyn std::error::Error>> {
//! roundtable::init_logger();
//!
//! let coder = SpecialistAgent::new("coder", "Writes and fixes code", Arc::clone(&client));
//! let browser = SpecialistAgent::new("browser", "Looks things up on the web", Arc::clone(&client));
//!
//! let team = vec![
//!     ActorHandle::spawn_ordered(Arc::new(coder)),
//!     ActorHandle::spawn_ordered(Arc::new(browser)),
//! ];
//!
//! let session = TeamSession::new("mission-control", client, team);
//! let outcome = session
//!     .run("Find and fix the flaky test in CI", CancellationToken::new())
//!     .await?;
//!
//! println!("{}", outcome.message);
//! # Ok(())
//! # }
//! ```
//!
//! Continue exploring the modules re-exported from the crate root for
//! progressively richer interaction patterns.

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// The helper is intentionally lightweight so that applications embedding
/// Roundtable can opt in to simple `RUST_LOG` driven diagnostics without
/// having to choose a specific logging backend upfront.
///
/// ```rust
/// roundtable::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `roundtable` module.
pub mod roundtable;

// Re-exporting key items for easier external access.
pub use crate::roundtable::agent;
pub use crate::roundtable::agent::SpecialistAgent;
pub use crate::roundtable::client_wrapper;
pub use crate::roundtable::client_wrapper::{
    ClientWrapper, Message, Role, SendError, TokenUsage,
};
pub use crate::roundtable::event;
pub use crate::roundtable::event::{AgentEvent, EventHandler, OrchestrationEvent};
pub use crate::roundtable::evolution;
pub use crate::roundtable::ledger;
pub use crate::roundtable::mailbox;
pub use crate::roundtable::mailbox::{
    ActorError, ActorHandle, DeliveryResult, MessageContext, MessageHandler,
};
pub use crate::roundtable::messages;
pub use crate::roundtable::messages::{AgentMessage, BroadcastMessage};
pub use crate::roundtable::orchestrator;
pub use crate::roundtable::orchestrator::{
    NextSpeaker, Orchestrator, OrchestratorConfig, RoundRobinPolicy,
};
pub use crate::roundtable::session;
pub use crate::roundtable::session::{
    OutcomeKind, SessionConfig, SessionError, SessionOutcome, TeamSession,
};
