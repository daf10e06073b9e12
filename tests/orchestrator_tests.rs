use async_trait::async_trait;
use roundtable::client_wrapper::{Message, Role, SendError};
use roundtable::event::{EventHandler, OrchestrationEvent};
use roundtable::mailbox::{ActorHandle, MessageContext, MessageHandler};
use roundtable::messages::BroadcastMessage;
use roundtable::orchestrator::{
    NextSpeaker, Orchestrator, OrchestratorConfig, RoundRobinPolicy,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A scripted specialist: records everything it hears, answers reply
/// requests with a fixed line.
struct RecorderActor {
    name: String,
    reply: String,
    received: Mutex<Vec<String>>,
}

impl RecorderActor {
    fn new(name: &str, reply: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reply: reply.to_string(),
            received: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MessageHandler for RecorderActor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted specialist"
    }

    async fn on_broadcast(
        &self,
        message: &BroadcastMessage,
        _context: &MessageContext,
    ) -> Result<(), SendError> {
        self.received
            .lock()
            .unwrap()
            .push(message.content.content.clone());
        Ok(())
    }

    async fn on_request_reply(
        &self,
        _context: &MessageContext,
    ) -> Result<Option<Message>, SendError> {
        Ok(Some(Message::new(Role::Assistant, self.reply.clone())))
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

struct NullPolicy;

#[async_trait]
impl NextSpeaker for NullPolicy {
    async fn select(&self, _content: &Message, _team: &[ActorHandle]) -> Option<usize> {
        None
    }
}

fn user_broadcast(text: &str) -> BroadcastMessage {
    BroadcastMessage::new(Message::new(Role::User, text))
}

#[tokio::test]
async fn test_round_ceiling_terminates_on_the_extra_broadcast() {
    let specialist = RecorderActor::new("solver", "working on it");
    let events = Arc::new(EventRecorder::default());

    let orchestrator = Orchestrator::new(
        "coordinator",
        "Routes work to the solver",
        vec![ActorHandle::spawn_ordered(specialist.clone())],
        Box::new(RoundRobinPolicy::new()),
    )
    .with_config(OrchestratorConfig {
        max_rounds: 2,
        max_time: None,
    })
    .with_event_handler(events.clone());
    let orchestrator = Arc::new(orchestrator);
    let handle = ActorHandle::spawn_ordered(orchestrator.clone());

    for i in 0..3 {
        handle
            .broadcast(user_broadcast(&format!("message {}", i)), MessageContext::root())
            .await
            .unwrap();
    }

    assert_eq!(orchestrator.rounds(), 2);
    assert_eq!(
        events.count(|e| matches!(e, OrchestrationEvent::SpeakerSelected { .. })),
        2
    );
    assert_eq!(
        events.count(|e| matches!(e, OrchestrationEvent::MaxRoundsReached { .. })),
        1
    );
}

#[tokio::test]
async fn test_reply_is_published_to_the_rest_of_the_team() {
    let alpha = RecorderActor::new("alpha", "alpha speaking");
    let beta = RecorderActor::new("beta", "beta speaking");

    let orchestrator = Orchestrator::new(
        "coordinator",
        "Two-specialist team",
        vec![
            ActorHandle::spawn_ordered(alpha.clone()),
            ActorHandle::spawn_ordered(beta.clone()),
        ],
        Box::new(RoundRobinPolicy::new()),
    );
    let handle = ActorHandle::spawn_ordered(Arc::new(orchestrator));

    handle
        .broadcast(user_broadcast("kick off"), MessageContext::root())
        .await
        .unwrap();
    // The round-robin picks alpha; beta should have seen alpha's reply,
    // attributed, and alpha should have seen nothing back.
    let beta_received = beta.received.lock().unwrap().clone();
    assert_eq!(beta_received, vec!["[alpha]: alpha speaking"]);
    assert!(alpha.received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_halt_request_stops_before_selection() {
    let specialist = RecorderActor::new("solver", "never called");
    let events = Arc::new(EventRecorder::default());

    let orchestrator = Orchestrator::new(
        "coordinator",
        "Halting test",
        vec![ActorHandle::spawn_ordered(specialist)],
        Box::new(RoundRobinPolicy::new()),
    )
    .with_event_handler(events.clone());
    let handle = ActorHandle::spawn_ordered(Arc::new(orchestrator));

    handle
        .broadcast(user_broadcast("stop now").with_halt(), MessageContext::root())
        .await
        .unwrap();

    assert_eq!(
        events.count(|e| matches!(e, OrchestrationEvent::HaltRequested { .. })),
        1
    );
    assert_eq!(
        events.count(|e| matches!(e, OrchestrationEvent::SpeakerSelected { .. })),
        0
    );
}

#[tokio::test]
async fn test_time_ceiling_produces_its_own_terminal_event() {
    let specialist = RecorderActor::new("solver", "never called");
    let events = Arc::new(EventRecorder::default());

    let orchestrator = Orchestrator::new(
        "coordinator",
        "Time ceiling test",
        vec![ActorHandle::spawn_ordered(specialist)],
        Box::new(RoundRobinPolicy::new()),
    )
    .with_config(OrchestratorConfig {
        max_rounds: 20,
        max_time: Some(Duration::from_secs(0)),
    })
    .with_event_handler(events.clone());
    let handle = ActorHandle::spawn_ordered(Arc::new(orchestrator));

    handle
        .broadcast(user_broadcast("too late"), MessageContext::root())
        .await
        .unwrap();

    assert_eq!(
        events.count(|e| matches!(e, OrchestrationEvent::MaxTimeReached { .. })),
        1
    );
    assert_eq!(
        events.count(|e| matches!(e, OrchestrationEvent::SpeakerSelected { .. })),
        0
    );
}

#[tokio::test]
async fn test_policy_returning_none_logs_no_speaker() {
    let specialist = RecorderActor::new("solver", "never called");
    let events = Arc::new(EventRecorder::default());

    let orchestrator = Orchestrator::new(
        "coordinator",
        "Null policy test",
        vec![ActorHandle::spawn_ordered(specialist)],
        Box::new(NullPolicy),
    )
    .with_event_handler(events.clone());
    let handle = ActorHandle::spawn_ordered(Arc::new(orchestrator));

    handle
        .broadcast(user_broadcast("anyone?"), MessageContext::root())
        .await
        .unwrap();

    assert_eq!(
        events.count(|e| matches!(e, OrchestrationEvent::NoSpeakerSelected { .. })),
        1
    );
}

#[tokio::test]
async fn test_reset_restores_fresh_orchestrator_behavior() {
    let specialist = RecorderActor::new("solver", "reply");
    let events = Arc::new(EventRecorder::default());

    let orchestrator = Orchestrator::new(
        "coordinator",
        "Reset test",
        vec![ActorHandle::spawn_ordered(specialist)],
        Box::new(RoundRobinPolicy::new()),
    )
    .with_config(OrchestratorConfig {
        max_rounds: 2,
        max_time: None,
    })
    .with_event_handler(events.clone());
    let orchestrator = Arc::new(orchestrator);
    let handle = ActorHandle::spawn_ordered(orchestrator.clone());

    for _ in 0..3 {
        handle
            .broadcast(user_broadcast("go"), MessageContext::root())
            .await
            .unwrap();
    }
    assert_eq!(
        events.count(|e| matches!(e, OrchestrationEvent::MaxRoundsReached { .. })),
        1
    );

    handle.reset(MessageContext::root()).await.unwrap();
    assert_eq!(orchestrator.rounds(), 0);

    // Behaves exactly like a fresh orchestrator again.
    handle
        .broadcast(user_broadcast("go again"), MessageContext::root())
        .await
        .unwrap();
    assert_eq!(orchestrator.rounds(), 1);
    assert_eq!(
        events.count(|e| matches!(e, OrchestrationEvent::SpeakerSelected { .. })),
        3
    );
}
