use async_trait::async_trait;
use roundtable::agent::SpecialistAgent;
use roundtable::client_wrapper::{ClientWrapper, Message, Role, SendError};
use roundtable::event::{EventHandler, OrchestrationEvent};
use roundtable::mailbox::ActorHandle;
use roundtable::session::{OutcomeKind, SessionConfig, TeamSession};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Replays a fixed script of responses, one per call.
struct ScriptedClient {
    responses: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn new(script: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    async fn send_message(
        &self,
        _messages: &[Message],
        _cancellation: &tokio_util::sync::CancellationToken,
    ) -> Result<Message, SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.responses.lock().unwrap().pop_front() {
            Some(content) => Ok(Message::new(Role::Assistant, content)),
            None => Err("script exhausted".into()),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[derive(Default)]
struct EventRecorder {
    events: Mutex<Vec<OrchestrationEvent>>,
}

impl EventRecorder {
    fn count(&self, matcher: impl Fn(&OrchestrationEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| matcher(e)).count()
    }
}

#[async_trait]
impl EventHandler for EventRecorder {
    async fn on_orchestration_event(&self, event: &OrchestrationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn ledger_json(satisfied: bool, progress: bool, speaker: &str, instruction: &str) -> String {
    serde_json::json!({
        "is_request_satisfied": {"answer": satisfied, "reason": if satisfied { "done" } else { "not yet" }},
        "is_progress_being_made": {"answer": progress, "reason": "judged"},
        "next_speaker": {"answer": speaker, "reason": "their turn"},
        "instruction_or_question": {"answer": instruction, "reason": "next step"},
    })
    .to_string()
}

fn solver_team(solver_client: &Arc<ScriptedClient>) -> Vec<ActorHandle> {
    let solver = SpecialistAgent::new(
        "solver",
        "Solves whatever it is asked",
        solver_client.clone() as Arc<dyn ClientWrapper>,
    );
    vec![ActorHandle::spawn_ordered(Arc::new(solver))]
}

#[tokio::test]
async fn test_satisfied_on_first_reflection_never_asks_a_specialist() {
    let session_client = ScriptedClient::new(vec![
        "FACTS: none needed".to_string(),
        "PLAN: answer directly".to_string(),
        ledger_json(true, true, "solver", "irrelevant"),
    ]);
    let solver_client = ScriptedClient::new(vec!["should never be used".to_string()]);

    let session = TeamSession::new(
        "mission-control",
        session_client.clone() as Arc<dyn ClientWrapper>,
        solver_team(&solver_client),
    );

    let outcome = session.run("trivial task", CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.kind, OutcomeKind::Satisfied);
    assert!(outcome.message.contains("done"));
    assert_eq!(outcome.turns, 0);
    // The specialist was never asked to speak.
    assert_eq!(solver_client.calls(), 0);
}

#[tokio::test]
async fn test_malformed_ledgers_get_one_correction_each() {
    let session_client = ScriptedClient::new(vec![
        "facts".to_string(),
        "plan".to_string(),
        // Reflection 1: not JSON at all.
        "I think the solver should go next.".to_string(),
        // Reflection 2: JSON but missing a required key.
        r#"{"is_request_satisfied": {"answer": false, "reason": "no"},
            "next_speaker": {"answer": "solver", "reason": "r"},
            "instruction_or_question": {"answer": "x", "reason": "r"}}"#
            .to_string(),
        // Reflection 3: valid, satisfied.
        ledger_json(true, true, "solver", "wrap up"),
    ]);
    let solver_client = ScriptedClient::new(vec![]);
    let events = Arc::new(EventRecorder::default());

    let session = TeamSession::new(
        "mission-control",
        session_client.clone() as Arc<dyn ClientWrapper>,
        solver_team(&solver_client),
    )
    .with_event_handler(events.clone());

    let outcome = session.run("task", CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.kind, OutcomeKind::Satisfied);
    assert_eq!(
        events.count(|e| matches!(e, OrchestrationEvent::LedgerRejected { .. })),
        2
    );
    assert_eq!(
        events.count(|e| matches!(e, OrchestrationEvent::LedgerAccepted { .. })),
        1
    );
    // Every corrective re-prompt costs exactly one extra model call:
    // facts + plan + 3 reflection attempts.
    assert_eq!(session_client.calls(), 5);
}

#[tokio::test]
async fn test_unknown_speaker_in_ledger_is_corrected() {
    let session_client = ScriptedClient::new(vec![
        "facts".to_string(),
        "plan".to_string(),
        ledger_json(false, true, "stranger", "do something"),
        ledger_json(true, true, "solver", "wrap up"),
    ]);
    let solver_client = ScriptedClient::new(vec![]);
    let events = Arc::new(EventRecorder::default());

    let session = TeamSession::new(
        "mission-control",
        session_client.clone() as Arc<dyn ClientWrapper>,
        solver_team(&solver_client),
    )
    .with_event_handler(events.clone());

    let outcome = session.run("task", CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Satisfied);

    let rejected = events.events.lock().unwrap().iter().any(|e| {
        matches!(
            e,
            OrchestrationEvent::LedgerRejected { correction, .. }
                if correction.contains("stranger") && correction.contains("solver")
        )
    });
    assert!(rejected, "the correction should name the offending speaker and the roster");
}

#[tokio::test]
async fn test_third_stalled_reflection_triggers_fact_rewrite() {
    let session_client = ScriptedClient::new(vec![
        "facts".to_string(),
        "plan".to_string(),
        // Two stalled-but-acting reflections, then the third trips the
        // rewrite threshold.
        ledger_json(false, false, "solver", "try A"),
        ledger_json(false, false, "solver", "try B"),
        ledger_json(false, false, "solver", "try C"),
        "rewritten facts".to_string(),
        "rewritten plan".to_string(),
        ledger_json(true, true, "solver", "wrap up"),
    ]);
    let solver_client = ScriptedClient::new(vec![
        "attempt A".to_string(),
        "attempt B".to_string(),
    ]);
    let events = Arc::new(EventRecorder::default());

    let session = TeamSession::new(
        "mission-control",
        session_client.clone() as Arc<dyn ClientWrapper>,
        solver_team(&solver_client),
    )
    .with_config(SessionConfig {
        max_stalled_turns_before_retry: 2,
        max_retry_attempts_before_educated_guess: 5,
        ..SessionConfig::default()
    })
    .with_event_handler(events.clone());

    let outcome = session.run("task", CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.kind, OutcomeKind::Satisfied);
    assert_eq!(
        events.count(|e| matches!(e, OrchestrationEvent::FactsRewritten { .. })),
        1
    );
    assert_eq!(
        events.count(|e| matches!(e, OrchestrationEvent::PlanRewritten { .. })),
        1
    );
    // Only the first two stalled reflections acted; the third went straight
    // to the rewrite.
    assert_eq!(solver_client.calls(), 2);
}

#[tokio::test]
async fn test_educated_guess_terminates_the_session() {
    let session_client = ScriptedClient::new(vec![
        "facts".to_string(),
        "plan".to_string(),
        ledger_json(false, false, "solver", "try"),
        "rewritten facts".to_string(),
        r#"{"has_educated_guess": {"answer": true, "reason": "the answer is 42"}}"#.to_string(),
    ]);
    let solver_client = ScriptedClient::new(vec![]);
    let events = Arc::new(EventRecorder::default());

    let session = TeamSession::new(
        "mission-control",
        session_client.clone() as Arc<dyn ClientWrapper>,
        solver_team(&solver_client),
    )
    .with_config(SessionConfig {
        max_stalled_turns_before_retry: 0,
        max_retry_attempts_before_educated_guess: 0,
        ..SessionConfig::default()
    })
    .with_event_handler(events.clone());

    let outcome = session.run("task", CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.kind, OutcomeKind::EducatedGuess);
    assert!(outcome.message.contains("42"));
    assert_eq!(
        events.count(|e| matches!(
            e,
            OrchestrationEvent::EducatedGuessIssued { accepted: true, .. }
        )),
        1
    );
    assert_eq!(solver_client.calls(), 0);
}

#[tokio::test]
async fn test_turn_budget_exhaustion_yields_the_fixed_message() {
    let session_client = ScriptedClient::new(vec![
        "facts".to_string(),
        "plan".to_string(),
        ledger_json(false, true, "solver", "keep going"),
    ]);
    let solver_client = ScriptedClient::new(vec!["one reply".to_string()]);

    let session = TeamSession::new(
        "mission-control",
        session_client.clone() as Arc<dyn ClientWrapper>,
        solver_team(&solver_client),
    )
    .with_config(SessionConfig {
        max_turns: 1,
        ..SessionConfig::default()
    });

    let outcome = session.run("task", CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.kind, OutcomeKind::Exhausted);
    assert!(outcome.message.contains("maximum number of turns"));
    assert_eq!(outcome.turns, 1);
    assert_eq!(solver_client.calls(), 1);
}
