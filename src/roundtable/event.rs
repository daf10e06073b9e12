//! Agent and orchestration event system.
//!
//! Provides a callback-based observability layer for the runtime. Implement
//! [`EventHandler`] to receive real-time notifications about:
//!
//! - **LLM round-trips**: when an agent sends to and receives from its model
//! - **Actor lifecycle**: deactivation
//! - **Orchestration lifecycle**: broadcasts received, termination causes,
//!   speaker selection and responses
//! - **Reflective sessions**: ledger acceptance/rejection, fact-sheet and
//!   plan rewrites, educated guesses, terminal outcomes
//!
//! Both methods have default no-op implementations, so you only override
//! what you care about. The handler is wrapped in `Arc<dyn EventHandler>`
//! and shared; when registered on a
//! [`TeamSession`](crate::session::TeamSession) it is propagated to the
//! sub-agents the session constructs.
//!
//! # Example
//!
//! ```rust
//! use roundtable::event::{AgentEvent, EventHandler, OrchestrationEvent};
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_agent_event(&self, event: &AgentEvent) {
//!         if let AgentEvent::LlmCallCompleted { agent_name, response_length, .. } = event {
//!             println!("{} got {} chars back", agent_name, response_length);
//!         }
//!     }
//!     async fn on_orchestration_event(&self, event: &OrchestrationEvent) {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

use crate::roundtable::client_wrapper::TokenUsage;
use async_trait::async_trait;

/// Events emitted by an individual agent during its lifecycle.
///
/// Every variant carries `agent_name` so handlers can identify the source
/// without external state.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Fired before an agent's LLM round-trip.
    LlmCallStarted {
        /// Name of the agent making the call.
        agent_name: String,
        /// Number of messages in the outgoing context.
        message_count: usize,
    },

    /// Fired when an agent's LLM round-trip returns successfully.
    LlmCallCompleted {
        /// Name of the agent that made the call.
        agent_name: String,
        /// Character length of the assistant reply.
        response_length: usize,
        /// Usage reported by the client, when available.
        tokens_used: Option<TokenUsage>,
    },

    /// Fired when an actor processes a deactivation message. The actor will
    /// silently ignore everything that arrives after this.
    Deactivated {
        /// Name of the deactivated actor.
        agent_name: String,
    },
}

/// Events emitted by orchestrators and reflective sessions.
#[derive(Debug, Clone)]
pub enum OrchestrationEvent {
    /// A reflective session began working on a task.
    SessionStarted {
        /// Unique id of this run.
        session_id: String,
        /// First ~120 characters of the task text.
        task_preview: String,
    },

    /// An orchestrator received a broadcast.
    BroadcastReceived {
        /// Name of the receiving orchestrator.
        orchestrator: String,
        /// Effective source of the broadcast (`"unknown"` when the sender
        /// did not identify itself).
        source: String,
        /// First ~120 characters of the content.
        content_preview: String,
    },

    /// Terminal: the round ceiling was reached before this broadcast.
    MaxRoundsReached {
        /// Name of the orchestrator that stopped.
        orchestrator: String,
        /// The configured ceiling that was hit.
        rounds: usize,
    },

    /// Terminal: the wall-clock ceiling was exceeded.
    MaxTimeReached {
        /// Name of the orchestrator that stopped.
        orchestrator: String,
        /// Seconds elapsed since the first broadcast of the run.
        elapsed_secs: u64,
    },

    /// Terminal: the incoming broadcast explicitly requested a halt.
    HaltRequested {
        /// Name of the orchestrator that stopped.
        orchestrator: String,
        /// Source of the halting broadcast.
        source: String,
    },

    /// Terminal: the next-speaker policy produced no selection.
    NoSpeakerSelected {
        /// Name of the orchestrator that stopped.
        orchestrator: String,
    },

    /// A speaker was chosen for the round about to be sent.
    SpeakerSelected {
        /// Name of the orchestrator doing the choosing.
        orchestrator: String,
        /// Name of the chosen agent.
        agent_name: String,
        /// Round number this selection belongs to (1-based).
        round: usize,
    },

    /// The chosen speaker produced a reply.
    SpeakerResponded {
        /// Name of the orchestrator that requested the reply.
        orchestrator: String,
        /// Name of the responding agent.
        agent_name: String,
        /// Character length of the reply.
        response_length: usize,
    },

    /// The chosen speaker failed to produce a reply.
    SpeakerFailed {
        /// Name of the orchestrator that requested the reply.
        orchestrator: String,
        /// Name of the failing agent.
        agent_name: String,
        /// Rendered error.
        error: String,
    },

    /// A reflection produced a schema-valid ledger.
    LedgerAccepted {
        /// Session run id.
        session_id: String,
        /// Speaker the ledger selected.
        next_speaker: String,
        /// Whether the ledger judged the request satisfied.
        request_satisfied: bool,
        /// Whether the ledger judged forward progress to be happening.
        progress_being_made: bool,
    },

    /// A reflection response failed validation and a corrective re-prompt
    /// was issued.
    LedgerRejected {
        /// Session run id.
        session_id: String,
        /// The correction sentence sent back to the model.
        correction: String,
    },

    /// The session rewrote its fact sheet after a stall.
    FactsRewritten {
        /// Session run id.
        session_id: String,
    },

    /// The session rewrote its plan before re-briefing the team.
    PlanRewritten {
        /// Session run id.
        session_id: String,
    },

    /// The session asked for an educated guess after exhausting its retry
    /// budget.
    EducatedGuessIssued {
        /// Session run id.
        session_id: String,
        /// Whether the guess was judged good enough to terminate on.
        accepted: bool,
    },

    /// The session reached one of its terminal outcomes.
    SessionCompleted {
        /// Session run id.
        session_id: String,
        /// Terminal outcome kind (`"satisfied"`, `"educated-guess"`,
        /// `"exhausted"`).
        outcome: String,
        /// Turns consumed out of the configured budget.
        turns: usize,
    },
}

/// Receives [`AgentEvent`]s and [`OrchestrationEvent`]s in real time.
///
/// Both methods default to no-ops; override the ones you need.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every event emitted by an individual agent.
    async fn on_agent_event(&self, _event: &AgentEvent) {}

    /// Called for every event emitted by an orchestrator or session.
    async fn on_orchestration_event(&self, _event: &OrchestrationEvent) {}
}

/// First ~120 characters of a string, for logging and event payloads.
pub(crate) fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(120).collect();
    if out.len() < text.len() {
        out.push_str("...");
    }
    out
}
