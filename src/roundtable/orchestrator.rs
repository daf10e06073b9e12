//! Round-based orchestration over a team of specialist actors.
//!
//! An [`Orchestrator`] is itself a mailbox actor. Every broadcast it receives
//! drives at most one round: it checks its termination ceilings (rounds,
//! wall-clock, halt requests) in a fixed order, asks its [`NextSpeaker`]
//! policy who should speak, sends that specialist a reply request, and
//! publishes the reply to the rest of the team. The broadcast that trips a
//! ceiling produces a distinct terminal event and nothing else.
//!
//! The round counter and session start time survive between broadcasts and
//! are cleared only by an explicit reset message.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use roundtable::mailbox::{ActorHandle, MessageContext};
//! use roundtable::messages::BroadcastMessage;
//! use roundtable::client_wrapper::{Message, Role};
//! use roundtable::orchestrator::{Orchestrator, OrchestratorConfig, RoundRobinPolicy};
//!
//! # async fn demo(team: Vec<ActorHandle>) {
//! let orchestrator = Orchestrator::new(
//!     "coordinator",
//!     "Routes questions to the right specialist",
//!     team,
//!     Box::new(RoundRobinPolicy::new()),
//! )
//! .with_config(OrchestratorConfig { max_rounds: 8, max_time: None });
//!
//! let handle = ActorHandle::spawn_ordered(Arc::new(orchestrator));
//! handle.broadcast(
//!     BroadcastMessage::new(Message::new(Role::User, "Kick off the discussion")),
//!     MessageContext::root(),
//! ).await.unwrap();
//! # }
//! ```

use crate::roundtable::client_wrapper::{Message, Role, SendError};
use crate::roundtable::event::{preview, EventHandler, OrchestrationEvent};
use crate::roundtable::mailbox::{ActorHandle, MessageContext, MessageHandler};
use crate::roundtable::messages::BroadcastMessage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Termination ceilings for an orchestrator. Immutable once the orchestrator
/// is constructed.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Rounds allowed before the orchestrator stops advancing.
    pub max_rounds: usize,
    /// Wall-clock budget measured from the first received broadcast.
    /// `None` means unbounded.
    pub max_time: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_rounds: 20,
            max_time: None,
        }
    }
}

/// Pluggable "who speaks next" policy.
#[async_trait]
pub trait NextSpeaker: Send + Sync {
    /// Pick a team member (by index into `team`) to answer the given
    /// content, or `None` to stop the orchestration.
    async fn select(&self, content: &Message, team: &[ActorHandle]) -> Option<usize>;
}

/// Deterministic rotation through the team, in registration order.
pub struct RoundRobinPolicy {
    cursor: AtomicUsize,
}

impl RoundRobinPolicy {
    /// A policy starting at the first registered team member.
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NextSpeaker for RoundRobinPolicy {
    async fn select(&self, _content: &Message, team: &[ActorHandle]) -> Option<usize> {
        if team.is_empty() {
            return None;
        }
        let next = self.cursor.fetch_add(1, Ordering::SeqCst);
        Some(next % team.len())
    }
}

#[derive(Default)]
struct RoundState {
    rounds: usize,
    started_at: Option<Instant>,
}

/// A mailbox actor that drives a team through speaker-selection rounds until
/// one of its termination conditions is met.
pub struct Orchestrator {
    name: String,
    description: String,
    team: Vec<ActorHandle>,
    policy: Box<dyn NextSpeaker>,
    config: OrchestratorConfig,
    state: Mutex<RoundState>,
    events: Option<Arc<dyn EventHandler>>,
}

impl Orchestrator {
    /// Create an orchestrator over the given team roster.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        team: Vec<ActorHandle>,
        policy: Box<dyn NextSpeaker>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            team,
            policy,
            config: OrchestratorConfig::default(),
            state: Mutex::new(RoundState::default()),
            events: None,
        }
    }

    /// Replace the default termination ceilings.
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach an event handler for orchestration observability.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = Some(handler);
        self
    }

    /// The configured round ceiling.
    pub fn max_rounds(&self) -> usize {
        self.config.max_rounds
    }

    /// Rounds advanced so far in the current session.
    pub fn rounds(&self) -> usize {
        self.state.lock().unwrap().rounds
    }

    /// The team roster, in registration order.
    pub fn team(&self) -> &[ActorHandle] {
        &self.team
    }

    async fn emit(&self, event: OrchestrationEvent) {
        if let Some(handler) = &self.events {
            handler.on_orchestration_event(&event).await;
        }
    }

    /// Clear the round counter and session start time. Invoked from the
    /// reset message only.
    fn reset_round_state(&self) {
        let mut state = self.state.lock().unwrap();
        state.rounds = 0;
        state.started_at = None;
    }
}

#[async_trait]
impl MessageHandler for Orchestrator {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn on_broadcast(
        &self,
        message: &BroadcastMessage,
        context: &MessageContext,
    ) -> Result<(), SendError> {
        let (rounds, elapsed) = {
            let mut state = self.state.lock().unwrap();
            if state.started_at.is_none() {
                state.started_at = Some(Instant::now());
            }
            (state.rounds, state.started_at.map(|t| t.elapsed()))
        };

        let source = context.effective_source().to_string();
        log::info!(
            "{}: broadcast from '{}': {}",
            self.name,
            source,
            preview(&message.content.content)
        );
        self.emit(OrchestrationEvent::BroadcastReceived {
            orchestrator: self.name.clone(),
            source: source.clone(),
            content_preview: preview(&message.content.content),
        })
        .await;

        if rounds >= self.config.max_rounds {
            log::info!(
                "{}: round ceiling reached ({} rounds): stopping",
                self.name,
                self.config.max_rounds
            );
            self.emit(OrchestrationEvent::MaxRoundsReached {
                orchestrator: self.name.clone(),
                rounds: self.config.max_rounds,
            })
            .await;
            return Ok(());
        }

        if let (Some(budget), Some(elapsed)) = (self.config.max_time, elapsed) {
            if elapsed >= budget {
                log::info!(
                    "{}: time ceiling reached after {}s: stopping",
                    self.name,
                    elapsed.as_secs()
                );
                self.emit(OrchestrationEvent::MaxTimeReached {
                    orchestrator: self.name.clone(),
                    elapsed_secs: elapsed.as_secs(),
                })
                .await;
                return Ok(());
            }
        }

        if message.request_halt {
            log::info!("{}: halt requested by '{}': stopping", self.name, source);
            self.emit(OrchestrationEvent::HaltRequested {
                orchestrator: self.name.clone(),
                source,
            })
            .await;
            return Ok(());
        }

        let selected = self.policy.select(&message.content, &self.team).await;
        let index = match selected {
            Some(index) if index < self.team.len() => index,
            _ => {
                log::info!("{}: no agent selected: stopping", self.name);
                self.emit(OrchestrationEvent::NoSpeakerSelected {
                    orchestrator: self.name.clone(),
                })
                .await;
                return Ok(());
            }
        };

        // The round is counted before the send so a failed send still
        // consumes it.
        let round = {
            let mut state = self.state.lock().unwrap();
            state.rounds += 1;
            state.rounds
        };

        let speaker = &self.team[index];
        log::info!(
            "{}: round {}: '{}' speaks next",
            self.name,
            round,
            speaker.name()
        );
        self.emit(OrchestrationEvent::SpeakerSelected {
            orchestrator: self.name.clone(),
            agent_name: speaker.name().to_string(),
            round,
        })
        .await;

        let reply = speaker
            .request_reply(context.forwarded_by(&self.name))
            .await;

        match reply {
            Ok(Some(reply)) => {
                self.emit(OrchestrationEvent::SpeakerResponded {
                    orchestrator: self.name.clone(),
                    agent_name: speaker.name().to_string(),
                    response_length: reply.content.len(),
                })
                .await;

                // Publish the reply to the rest of the team so everyone
                // shares the same view of the conversation.
                let attributed = Message::new(
                    Role::Assistant,
                    format!("[{}]: {}", speaker.name(), reply.content),
                );
                for (i, member) in self.team.iter().enumerate() {
                    if i == index {
                        continue;
                    }
                    if let Err(e) = member
                        .broadcast(
                            BroadcastMessage::new(attributed.clone()),
                            context.forwarded_by(&self.name),
                        )
                        .await
                    {
                        if !e.is_cancelled() {
                            log::warn!(
                                "{}: failed to publish reply to '{}': {}",
                                self.name,
                                member.name(),
                                e
                            );
                        }
                    }
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.emit(OrchestrationEvent::SpeakerFailed {
                    orchestrator: self.name.clone(),
                    agent_name: speaker.name().to_string(),
                    error: e.to_string(),
                })
                .await;
                Err(Box::new(e) as SendError)
            }
        }
    }

    async fn on_reset(&self, _context: &MessageContext) -> Result<(), SendError> {
        self.reset_round_state();
        log::info!("{}: round state reset", self.name);
        Ok(())
    }
}
