use async_trait::async_trait;
use roundtable::client_wrapper::{ClientWrapper, Message, Role, SendError};
use roundtable::evolution::{
    ArchiveEntry, ArchiveStore, Evaluator, JsonArchiveStore, SearchAgent, SearchConfig,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

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
        _cancellation: &CancellationToken,
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

/// Scores every candidate at a fixed accuracy, optionally failing the first
/// few calls; counts every invocation.
struct FixedEvaluator {
    examples: usize,
    accuracy: f64,
    fail_first: usize,
    calls: AtomicUsize,
}

impl FixedEvaluator {
    fn new(examples: usize, accuracy: f64) -> Arc<Self> {
        Arc::new(Self {
            examples,
            accuracy,
            fail_first: 0,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing_first(examples: usize, accuracy: f64, fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            examples,
            accuracy,
            fail_first,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for FixedEvaluator {
    fn example_count(&self) -> usize {
        self.examples
    }

    async fn evaluate(&self, _code: &str, _example_index: usize) -> Result<f64, SendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err("evaluation harness crashed".into());
        }
        Ok(self.accuracy)
    }
}

fn candidate_json(name: &str) -> String {
    serde_json::json!({
        "thought": "a new idea",
        "name": name,
        "code": format!("def {}(): pass", name),
    })
    .to_string()
}

#[tokio::test]
async fn test_scored_entries_are_never_reevaluated() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonArchiveStore::new(dir.path(), "resume"));

    let mut scored = ArchiveEntry::seed("already_done", "code");
    scored.fitness = Some(0.9);
    scored.generation = 1;
    store.rewrite(&[scored]).unwrap();

    let client = ScriptedClient::new(vec![]);
    let evaluator = FixedEvaluator::new(3, 0.5);
    let agent = SearchAgent::new(
        "searcher",
        client.clone() as Arc<dyn ClientWrapper>,
        store.clone() as Arc<dyn ArchiveStore>,
        evaluator.clone() as Arc<dyn Evaluator>,
    )
    .with_config(SearchConfig {
        max_generations: 1,
        ..SearchConfig::default()
    });

    let archive = agent.run("task", CancellationToken::new()).await.unwrap();

    assert_eq!(archive.len(), 1);
    assert_eq!(archive[0].fitness, Some(0.9));
    // Skip-if-scored: the evaluator never ran.
    assert_eq!(evaluator.calls(), 0);
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn test_unscored_archive_entries_are_evaluated_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonArchiveStore::new(dir.path(), "backfill"));

    let mut unscored = ArchiveEntry::seed("pending", "code");
    unscored.generation = 1;
    store.rewrite(&[unscored]).unwrap();

    let client = ScriptedClient::new(vec![]);
    let evaluator = FixedEvaluator::new(4, 0.25);
    let agent = SearchAgent::new(
        "searcher",
        client as Arc<dyn ClientWrapper>,
        store.clone() as Arc<dyn ArchiveStore>,
        evaluator.clone() as Arc<dyn Evaluator>,
    )
    .with_config(SearchConfig {
        max_generations: 1,
        ..SearchConfig::default()
    });

    let archive = agent.run("task", CancellationToken::new()).await.unwrap();

    assert_eq!(evaluator.calls(), 4);
    assert_eq!(archive[0].fitness, Some(0.25));

    // Durability: the rewrite hit disk, so a reload sees the score.
    let reloaded = store.load().unwrap();
    assert_eq!(reloaded[0].fitness, Some(0.25));
}

#[tokio::test]
async fn test_generation_produces_refined_scored_entry() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonArchiveStore::new(dir.path(), "evolve"));

    // One proposal plus four reflexion refinements.
    let client = ScriptedClient::new(vec![
        candidate_json("draft"),
        candidate_json("draft_novel"),
        candidate_json("draft_correct"),
        candidate_json("draft_simple"),
        candidate_json("final"),
    ]);
    let evaluator = FixedEvaluator::new(2, 0.5);
    let agent = SearchAgent::new(
        "searcher",
        client.clone() as Arc<dyn ClientWrapper>,
        store.clone() as Arc<dyn ArchiveStore>,
        evaluator.clone() as Arc<dyn Evaluator>,
    )
    .with_config(SearchConfig {
        max_generations: 1,
        seed: vec![{
            let mut seed = ArchiveEntry::seed("seed", "code");
            seed.fitness = Some(0.1);
            seed
        }],
        ..SearchConfig::default()
    });

    let archive = agent.run("task", CancellationToken::new()).await.unwrap();

    assert_eq!(client.calls(), 5);
    assert_eq!(archive.len(), 2);
    let newest = archive.last().unwrap();
    assert_eq!(newest.name, "final");
    assert_eq!(newest.generation, 1);
    assert_eq!(newest.fitness, Some(0.5));
    // Transient working fields are stripped before archiving.
    assert!(newest.thought.is_none());
    assert!(newest.reflection.is_none());
}

#[tokio::test]
async fn test_failed_evaluation_triggers_debug_retry() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonArchiveStore::new(dir.path(), "debug"));

    let client = ScriptedClient::new(vec![
        candidate_json("draft"),
        candidate_json("r1"),
        candidate_json("r2"),
        candidate_json("r3"),
        candidate_json("r4"),
        // Requested again after the first evaluation fails.
        candidate_json("fixed"),
    ]);
    // Single-example set; the first evaluation call fails, the retry passes.
    let evaluator = FixedEvaluator::failing_first(1, 0.8, 1);
    let agent = SearchAgent::new(
        "searcher",
        client.clone() as Arc<dyn ClientWrapper>,
        store.clone() as Arc<dyn ArchiveStore>,
        evaluator.clone() as Arc<dyn Evaluator>,
    )
    .with_config(SearchConfig {
        max_generations: 1,
        debug_max: 2,
        ..SearchConfig::default()
    });

    let archive = agent.run("task", CancellationToken::new()).await.unwrap();

    assert_eq!(client.calls(), 6);
    assert_eq!(archive.len(), 1);
    assert_eq!(archive[0].name, "fixed");
    assert_eq!(archive[0].fitness, Some(0.8));
}

#[tokio::test]
async fn test_malformed_candidate_gets_a_correction_reprompt() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonArchiveStore::new(dir.path(), "repair"));

    let client = ScriptedClient::new(vec![
        "no json here at all".to_string(),
        candidate_json("draft"),
        candidate_json("r1"),
        candidate_json("r2"),
        candidate_json("r3"),
        candidate_json("final"),
    ]);
    let evaluator = FixedEvaluator::new(1, 0.6);
    let agent = SearchAgent::new(
        "searcher",
        client.clone() as Arc<dyn ClientWrapper>,
        store.clone() as Arc<dyn ArchiveStore>,
        evaluator as Arc<dyn Evaluator>,
    )
    .with_config(SearchConfig {
        max_generations: 1,
        ..SearchConfig::default()
    });

    let archive = agent.run("task", CancellationToken::new()).await.unwrap();

    assert_eq!(client.calls(), 6);
    assert_eq!(archive.last().unwrap().name, "final");
}

#[tokio::test]
async fn test_unreadable_archive_falls_back_to_the_seed_set() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonArchiveStore::new(dir.path(), "corrupt"));
    std::fs::write(store.file_path(), "not valid json").unwrap();

    let client = ScriptedClient::new(vec![]);
    let evaluator = FixedEvaluator::new(2, 1.0);
    let agent = SearchAgent::new(
        "searcher",
        client as Arc<dyn ClientWrapper>,
        store.clone() as Arc<dyn ArchiveStore>,
        evaluator.clone() as Arc<dyn Evaluator>,
    )
    .with_config(SearchConfig {
        max_generations: 0,
        seed: vec![ArchiveEntry::seed("fallback", "code")],
        ..SearchConfig::default()
    });

    let archive = agent.run("task", CancellationToken::new()).await.unwrap();

    assert_eq!(archive.len(), 1);
    assert_eq!(archive[0].name, "fallback");
    assert_eq!(archive[0].fitness, Some(1.0));
    assert_eq!(evaluator.calls(), 2);

    // The corrupt file was replaced by a well-formed archive.
    let reloaded = store.load().unwrap();
    assert_eq!(reloaded.len(), 1);
}

#[tokio::test]
async fn test_archive_filename_derivation() {
    let store = JsonArchiveStore::new(Path::new("/tmp/runs"), "math_eval");
    assert!(store
        .file_path()
        .ends_with("math_eval_run_archive.json"));
}
