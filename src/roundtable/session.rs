//! The reflective team session: reflect → select → instruct → respond.
//!
//! A [`TeamSession`] drives a fixed roster of specialist actors through
//! repeated reflection cycles. Each cycle asks a private reflection
//! sub-agent for a [`Ledger`](crate::ledger::Ledger) (request satisfied?
//! progress being made? who speaks next? with what instruction?), then
//! broadcasts the instruction, collects the chosen specialist's reply, and
//! shares it with the rest of the team.
//!
//! Before the first cycle a planning sub-agent is asked for a fact
//! pre-survey (given / to look up / to derive / to guess) and an initial
//! plan; both are broadcast to the team as shared context. When reflections
//! repeatedly report no progress, the session rewrites the fact sheet,
//! eventually asks for an educated guess, rewrites the plan, and re-briefs
//! the team from scratch: all against one global turn budget.
//!
//! The session always lands on one of three terminal outcomes: satisfied,
//! educated guess, or budget exhausted. Malformed reflection output is
//! repaired by corrective re-prompting and never surfaces as an error.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use roundtable::client_wrapper::ClientWrapper;
//! use roundtable::mailbox::ActorHandle;
//! use roundtable::session::{SessionConfig, TeamSession};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(client: Arc<dyn ClientWrapper>, team: Vec<ActorHandle>) {
//! let session = TeamSession::new("mission-control", client, team)
//!     .with_config(SessionConfig { max_turns: 12, ..SessionConfig::default() });
//!
//! let outcome = session
//!     .run("Find the commit that broke the nightly build", CancellationToken::new())
//!     .await
//!     .unwrap();
//! println!("{}", outcome.message);
//! # }
//! ```

use crate::roundtable::agent::SpecialistAgent;
use crate::roundtable::client_wrapper::{ClientWrapper, Message, Role, SendError};
use crate::roundtable::event::{preview, EventHandler, OrchestrationEvent};
use crate::roundtable::ledger::{parse_judgment, parse_ledger, Judgment, Ledger};
use crate::roundtable::mailbox::{ActorError, ActorHandle, MessageContext};
use crate::roundtable::messages::BroadcastMessage;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Budgets for a reflective session. Immutable once the session runs.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Global turn budget across all outer iterations.
    pub max_turns: usize,
    /// Stalled reflections tolerated before the fact sheet is rewritten.
    pub max_stalled_turns_before_retry: usize,
    /// Fact-sheet rewrites tolerated before an educated guess is requested.
    pub max_retry_attempts_before_educated_guess: usize,
    /// Corrective re-prompts allowed per reflection before the session gives
    /// up on that run and reports exhaustion.
    pub max_ledger_retries: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: 30,
            max_stalled_turns_before_retry: 3,
            max_retry_attempts_before_educated_guess: 1,
            max_ledger_retries: 10,
        }
    }
}

/// How a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeKind {
    /// A reflection judged the request fully satisfied.
    Satisfied,
    /// The retry budget ran out and the model offered an educated guess.
    EducatedGuess,
    /// The turn budget (or the ledger-repair budget) ran out.
    Exhausted,
}

impl OutcomeKind {
    /// Stable string form, used in events and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Satisfied => "satisfied",
            OutcomeKind::EducatedGuess => "educated-guess",
            OutcomeKind::Exhausted => "exhausted",
        }
    }
}

/// Terminal result of [`TeamSession::run`]. Always a text message: the
/// session never ends any other way.
#[derive(Clone, Debug)]
pub struct SessionOutcome {
    /// Which terminal state was reached.
    pub kind: OutcomeKind,
    /// Human-readable terminal message. For `Satisfied` and `EducatedGuess`
    /// it embeds the reflection's stated reason.
    pub message: String,
    /// Turns consumed out of the configured budget.
    pub turns: usize,
}

/// Failures that escape a session. Everything the protocol can repair is
/// repaired internally; these are the genuinely unexpected conditions.
#[derive(Debug)]
pub enum SessionError {
    /// The LLM client failed (or the exchange was cancelled).
    Client(SendError),
    /// A specialist's mailbox failed.
    Actor(ActorError),
    /// A validated ledger named a speaker that no longer resolves to a team
    /// member. By contract this cannot happen unless the roster changed
    /// mid-run.
    UnknownSpeaker(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Client(e) => write!(f, "client error: {}", e),
            SessionError::Actor(e) => write!(f, "actor error: {}", e),
            SessionError::UnknownSpeaker(name) => {
                write!(f, "ledger speaker '{}' is not on the team", name)
            }
        }
    }
}

impl Error for SessionError {}

const EXHAUSTED_MESSAGE: &str =
    "The task was not addressed before the maximum number of turns was reached.";

const LEDGER_REPAIR_EXHAUSTED_MESSAGE: &str =
    "The task was not addressed: reflection never produced a valid progress ledger.";

/// Coordinates a team of specialists through reflect/act cycles.
pub struct TeamSession {
    id: String,
    name: String,
    client: Arc<dyn ClientWrapper>,
    specialists: Vec<ActorHandle>,
    config: SessionConfig,
    events: Option<Arc<dyn EventHandler>>,
}

impl TeamSession {
    /// Create a session over the given specialist roster. The same client
    /// powers the private planning and reflection sub-agents.
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn ClientWrapper>,
        specialists: Vec<ActorHandle>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            client,
            specialists,
            config: SessionConfig::default(),
            events: None,
        }
    }

    /// Replace the default budgets.
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach an event handler; it is propagated to the sub-agents the
    /// session constructs.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = Some(handler);
        self
    }

    /// Unique id of this session instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The team roster rendered as `name: description` lines, the way it is
    /// presented to the models.
    pub fn roster_text(&self) -> String {
        self.specialists
            .iter()
            .map(|s| format!("{}: {}", s.name(), s.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn roster_names(&self) -> Vec<String> {
        self.specialists
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    async fn emit(&self, event: OrchestrationEvent) {
        if let Some(handler) = &self.events {
            handler.on_orchestration_event(&event).await;
        }
    }

    fn sub_agent(&self, name: &str, description: &str, system_prompt: &str) -> SpecialistAgent {
        let mut agent = SpecialistAgent::new(name, description, Arc::clone(&self.client))
            .with_system_prompt(system_prompt);
        if let Some(handler) = &self.events {
            agent = agent.with_event_handler(Arc::clone(handler));
        }
        agent
    }

    /// Drive the team until the request is satisfied, an educated guess is
    /// accepted, or the budgets run out.
    pub async fn run(
        &self,
        task: &str,
        cancellation: CancellationToken,
    ) -> Result<SessionOutcome, SessionError> {
        let planner = self.sub_agent(
            "planner",
            "Surveys the known facts and drafts the plan",
            "You are a careful planner. You survey what is known, what must be \
             looked up, what must be derived, and you produce short actionable plans.",
        );
        let reflector = self.sub_agent(
            "reflector",
            "Judges progress and selects the next speaker",
            "You monitor a team conversation, judge progress honestly, and \
             answer in the exact JSON shapes you are asked for.",
        );

        self.emit(OrchestrationEvent::SessionStarted {
            session_id: self.id.clone(),
            task_preview: preview(task),
        })
        .await;
        log::info!("{}: session {} started", self.name, self.id);

        let roster = self.roster_text();
        let names = self.roster_names();
        let context = MessageContext::from_sender(self.name.clone(), cancellation.clone());

        // Pre-survey and initial plan: two single round trips, no retry.
        planner
            .observe(Message::new(Role::User, facts_survey_prompt(task)))
            .await;
        let mut facts = self.ask(&planner, &cancellation).await?;
        planner
            .observe(Message::new(Role::User, plan_prompt(&roster)))
            .await;
        let mut plan = self.ask(&planner, &cancellation).await?;

        let mut turns = 0usize;
        let mut retry_attempts = 0usize;

        loop {
            // (Re-)brief: reset everyone, then share task + roster + facts
            // + plan as common context.
            for specialist in &self.specialists {
                specialist
                    .reset(context.clone())
                    .await
                    .map_err(SessionError::Actor)?;
            }
            reflector.clear().await;

            let briefing = Message::new(Role::User, briefing_text(task, &roster, &facts, &plan));
            for specialist in &self.specialists {
                specialist
                    .broadcast(BroadcastMessage::new(briefing.clone()), context.clone())
                    .await
                    .map_err(SessionError::Actor)?;
            }
            reflector.observe(briefing).await;

            let mut stalled = 0usize;

            loop {
                if turns >= self.config.max_turns {
                    return Ok(self
                        .finish(OutcomeKind::Exhausted, EXHAUSTED_MESSAGE.to_string(), turns)
                        .await);
                }

                let ledger = match self
                    .reflect(&reflector, task, &roster, &names, &cancellation)
                    .await?
                {
                    Some(ledger) => ledger,
                    None => {
                        return Ok(self
                            .finish(
                                OutcomeKind::Exhausted,
                                LEDGER_REPAIR_EXHAUSTED_MESSAGE.to_string(),
                                turns,
                            )
                            .await);
                    }
                };

                if ledger.is_request_satisfied.answer {
                    let message = format!(
                        "The request has been satisfied: {}",
                        ledger.is_request_satisfied.reason
                    );
                    return Ok(self.finish(OutcomeKind::Satisfied, message, turns).await);
                }

                if ledger.is_progress_being_made.answer {
                    stalled = stalled.saturating_sub(1);
                } else {
                    stalled += 1;
                }

                if stalled > self.config.max_stalled_turns_before_retry {
                    log::info!(
                        "{}: stalled for {} reflections: rewriting the fact sheet",
                        self.name,
                        stalled
                    );
                    reflector
                        .observe(Message::new(Role::User, facts_update_prompt(&facts)))
                        .await;
                    facts = self.ask(&reflector, &cancellation).await?;
                    self.emit(OrchestrationEvent::FactsRewritten {
                        session_id: self.id.clone(),
                    })
                    .await;

                    retry_attempts += 1;
                    if retry_attempts > self.config.max_retry_attempts_before_educated_guess {
                        if let Some(guess) = self
                            .ask_educated_guess(&reflector, &cancellation)
                            .await?
                        {
                            self.emit(OrchestrationEvent::EducatedGuessIssued {
                                session_id: self.id.clone(),
                                accepted: guess.answer,
                            })
                            .await;
                            if guess.answer {
                                let message =
                                    format!("An educated guess of the answer: {}", guess.reason);
                                return Ok(self
                                    .finish(OutcomeKind::EducatedGuess, message, turns)
                                    .await);
                            }
                        }
                    }

                    reflector
                        .observe(Message::new(Role::User, plan_update_prompt(&roster)))
                        .await;
                    plan = self.ask(&reflector, &cancellation).await?;
                    self.emit(OrchestrationEvent::PlanRewritten {
                        session_id: self.id.clone(),
                    })
                    .await;

                    // Back to the re-brief; the turn budget carries over.
                    break;
                }

                // ACT: share the instruction, collect the chosen
                // specialist's reply, fan it out to the rest of the team.
                let instruction = ledger
                    .instruction_or_question
                    .answer
                    .clone()
                    .unwrap_or_default();
                let instruction_msg = Message::new(Role::User, instruction);
                for specialist in &self.specialists {
                    specialist
                        .broadcast(
                            BroadcastMessage::new(instruction_msg.clone()),
                            context.clone(),
                        )
                        .await
                        .map_err(SessionError::Actor)?;
                }
                reflector.observe(instruction_msg).await;

                let speaker_name = ledger.next_speaker.answer.clone().unwrap_or_default();
                let speaker = self
                    .specialists
                    .iter()
                    .find(|s| s.name() == speaker_name)
                    .ok_or_else(|| SessionError::UnknownSpeaker(speaker_name.clone()))?;

                let reply = speaker
                    .request_reply(context.clone())
                    .await
                    .map_err(SessionError::Actor)?
                    .unwrap_or_else(|| Message::new(Role::Assistant, String::new()));

                log::info!(
                    "{}: turn {}: '{}' replied ({} chars)",
                    self.name,
                    turns + 1,
                    speaker_name,
                    reply.content.len()
                );

                let attributed = Message::new(
                    Role::Assistant,
                    format!("[{}]: {}", speaker_name, reply.content),
                );
                for specialist in &self.specialists {
                    if specialist.name() == speaker_name {
                        continue;
                    }
                    specialist
                        .broadcast(BroadcastMessage::new(attributed.clone()), context.clone())
                        .await
                        .map_err(SessionError::Actor)?;
                }
                reflector.observe(attributed).await;

                turns += 1;
            }
        }
    }

    /// One un-retried round trip to a sub-agent, returning the reply text.
    async fn ask(
        &self,
        agent: &SpecialistAgent,
        cancellation: &CancellationToken,
    ) -> Result<String, SessionError> {
        agent
            .respond(cancellation)
            .await
            .map(|m| m.content)
            .map_err(SessionError::Client)
    }

    /// Ask the reflection sub-agent for a ledger, repairing malformed output
    /// with one corrective re-prompt per defect, up to the configured budget.
    /// `Ok(None)` means the budget ran out.
    async fn reflect(
        &self,
        reflector: &SpecialistAgent,
        task: &str,
        roster: &str,
        names: &[String],
        cancellation: &CancellationToken,
    ) -> Result<Option<Ledger>, SessionError> {
        reflector
            .observe(Message::new(Role::User, ledger_prompt(task, roster, names)))
            .await;

        for _ in 0..self.config.max_ledger_retries {
            let raw = self.ask(reflector, cancellation).await?;
            match parse_ledger(&raw, names) {
                Ok(ledger) => {
                    self.emit(OrchestrationEvent::LedgerAccepted {
                        session_id: self.id.clone(),
                        next_speaker: ledger
                            .next_speaker
                            .answer
                            .clone()
                            .unwrap_or_default(),
                        request_satisfied: ledger.is_request_satisfied.answer,
                        progress_being_made: ledger.is_progress_being_made.answer,
                    })
                    .await;
                    return Ok(Some(ledger));
                }
                Err(defect) => {
                    let correction = defect.correction();
                    log::warn!("{}: ledger rejected: {}", self.name, correction);
                    self.emit(OrchestrationEvent::LedgerRejected {
                        session_id: self.id.clone(),
                        correction: correction.clone(),
                    })
                    .await;
                    reflector.observe(Message::new(Role::User, correction)).await;
                }
            }
        }
        log::warn!(
            "{}: gave up on the ledger after {} repairs",
            self.name,
            self.config.max_ledger_retries
        );
        Ok(None)
    }

    /// Ask whether an educated guess is available, with the same repair
    /// machinery as the ledger. `Ok(None)` means the repair budget ran out;
    /// the caller treats that as "no guess".
    async fn ask_educated_guess(
        &self,
        reflector: &SpecialistAgent,
        cancellation: &CancellationToken,
    ) -> Result<Option<Judgment>, SessionError> {
        reflector
            .observe(Message::new(Role::User, EDUCATED_GUESS_PROMPT.to_string()))
            .await;

        for _ in 0..self.config.max_ledger_retries {
            let raw = self.ask(reflector, cancellation).await?;
            match parse_judgment(&raw, "has_educated_guess") {
                Ok(judgment) => return Ok(Some(judgment)),
                Err(defect) => {
                    let correction = defect.correction();
                    log::warn!("{}: guess judgment rejected: {}", self.name, correction);
                    self.emit(OrchestrationEvent::LedgerRejected {
                        session_id: self.id.clone(),
                        correction: correction.clone(),
                    })
                    .await;
                    reflector.observe(Message::new(Role::User, correction)).await;
                }
            }
        }
        Ok(None)
    }

    async fn finish(&self, kind: OutcomeKind, message: String, turns: usize) -> SessionOutcome {
        self.emit(OrchestrationEvent::SessionCompleted {
            session_id: self.id.clone(),
            outcome: kind.as_str().to_string(),
            turns,
        })
        .await;
        log::info!(
            "{}: session {} completed ({}) after {} turns",
            self.name,
            self.id,
            kind.as_str(),
            turns
        );
        SessionOutcome {
            kind,
            message,
            turns,
        }
    }
}

fn facts_survey_prompt(task: &str) -> String {
    format!(
        "Below I will present you a request.\n\n{}\n\nBefore we begin addressing it, \
         answer the following pre-survey:\n\n\
         1. Facts GIVEN in the request itself.\n\
         2. Facts that need to be LOOKED UP.\n\
         3. Facts that need to be DERIVED via computation or reasoning.\n\
         4. Educated GUESSES it would be reasonable to make.\n\n\
         Answer under the headings GIVEN, LOOKUP, DERIVE, GUESS.",
        task
    )
}

fn plan_prompt(roster: &str) -> String {
    format!(
        "To address this request we have assembled the following team:\n\n{}\n\n\
         Based on the team composition and the known and unknown facts, devise a \
         short bullet-point plan for addressing the original request.",
        roster
    )
}

fn briefing_text(task: &str, roster: &str, facts: &str, plan: &str) -> String {
    format!(
        "We are working to address the following user request:\n\n{}\n\n\
         To answer this request we have assembled the following team:\n\n{}\n\n\
         Here is an initial fact sheet to consider:\n\n{}\n\n\
         Here is the plan to follow as best as possible:\n\n{}",
        task, roster, facts, plan
    )
}

fn ledger_prompt(task: &str, roster: &str, names: &[String]) -> String {
    let names = names.join(", ");
    format!(
        "Recall we are working on the following request:\n\n{}\n\n\
         And we have assembled the following team:\n\n{}\n\n\
         To make progress, answer the following questions, including any \
         necessary reasoning:\n\n\
         - Is the request fully satisfied?\n\
         - Are we making forward progress?\n\
         - Who should speak next? (select from: {})\n\
         - What instruction or question would you give that team member?\n\n\
         Output an answer in pure JSON according to the following schema. The \
         JSON object must be parsable as-is. DO NOT OUTPUT ANYTHING OTHER THAN \
         JSON:\n\n\
         {{\n\
           \"is_request_satisfied\": {{\"answer\": boolean, \"reason\": string}},\n\
           \"is_progress_being_made\": {{\"answer\": boolean, \"reason\": string}},\n\
           \"next_speaker\": {{\"answer\": string (one of: {}), \"reason\": string}},\n\
           \"instruction_or_question\": {{\"answer\": string, \"reason\": string}}\n\
         }}",
        task, roster, names, names
    )
}

fn facts_update_prompt(facts: &str) -> String {
    format!(
        "It looks like we are stalled. Rewrite the fact sheet below: fold in \
         anything we have learned, revise prior guesses that turned out wrong, \
         and add new educated guesses where they would help:\n\n{}",
        facts
    )
}

fn plan_update_prompt(roster: &str) -> String {
    format!(
        "Briefly explain what went wrong in this attempt, then produce a new \
         short bullet-point plan for the team that avoids repeating the same \
         mistakes. The team remains:\n\n{}",
        roster
    )
}

const EDUCATED_GUESS_PROMPT: &str =
    "We have exhausted our retries. Given everything above, is there an educated \
     guess we can give as the final answer to the request? Output pure JSON in \
     the shape {\"has_educated_guess\": {\"answer\": boolean, \"reason\": string}}. \
     If the answer is true, state the guess itself inside the reason.";
