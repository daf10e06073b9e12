//! Evolutionary search over LLM-authored candidate programs.
//!
//! A [`SearchAgent`] runs a generate → refine → evaluate → debug-retry loop:
//! each generation it asks its model for a candidate solution as JSON,
//! refines the candidate through four fixed reflexion follow-ups, evaluates
//! the result against a fixed example set, and appends the scored candidate
//! to a durable archive. The archive is the single source of truth: it is
//! reloaded on startup to resume from the last recorded generation, and it
//! is rewritten in full after every successful unit of progress.
//!
//! # Disk format
//!
//! One JSON file per experiment, `<save_dir>/<expr_name>_run_archive.json`,
//! holding an array of [`ArchiveEntry`] objects:
//!
//! ```text
//! [
//!   {"name":"seed_cot","code":"...","generation":0,"fitness":0.41,"recorded_at":"2026-07-01T12:00:00Z"},
//!   {"name":"debate_pair","code":"...","generation":1,"fitness":0.47,"recorded_at":"2026-07-01T12:09:12Z"}
//! ]
//! ```
//!
//! The design assumes a single writer per experiment file. Swap
//! [`JsonArchiveStore`] for another [`ArchiveStore`] implementation to back
//! the archive with a database instead.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use roundtable::client_wrapper::ClientWrapper;
//! use roundtable::evolution::{ArchiveEntry, Evaluator, JsonArchiveStore, SearchAgent, SearchConfig};
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(client: Arc<dyn ClientWrapper>, evaluator: Arc<dyn Evaluator>) {
//! let store = Arc::new(JsonArchiveStore::new(Path::new("runs"), "math_eval"));
//! let agent = SearchAgent::new("searcher", client, store, evaluator)
//!     .with_config(SearchConfig {
//!         max_generations: 10,
//!         seed: vec![ArchiveEntry::seed("chain_of_thought", "...")],
//!         ..SearchConfig::default()
//!     });
//!
//! let archive = agent.run("Design agents for the math benchmark", CancellationToken::new())
//!     .await
//!     .unwrap();
//! println!("{} entries", archive.len());
//! # }
//! ```

use crate::roundtable::client_wrapper::{ClientWrapper, Message, Role, SendError};
use crate::roundtable::ledger::extract_json_object;
use crate::roundtable::mailbox::{MessageContext, MessageHandler};
use crate::roundtable::messages::BroadcastMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Mean accuracy at or below this counts as "never succeeds" while the
/// search is in searching mode, and triggers a debug retry.
const NEAR_ZERO_ACCURACY: f64 = 0.01;

/// One candidate recorded in the archive.
///
/// Entries that carry a `fitness` are considered scored forever: they are
/// never re-evaluated, which is what makes runs resumable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Short identifying name the model gave the candidate.
    pub name: String,
    /// The candidate program itself.
    pub code: String,
    /// Working-notes field produced during generation; stripped before the
    /// entry is archived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    /// Reflexion notes produced during refinement; stripped before the
    /// entry is archived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
    /// Generation the entry was produced in. Seed entries are generation 0.
    #[serde(default)]
    pub generation: u32,
    /// Mean accuracy over the example set, once evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fitness: Option<f64>,
    /// When the entry was recorded.
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

impl ArchiveEntry {
    /// An unscored generation-0 entry, for seeding a fresh archive.
    pub fn seed(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            thought: None,
            reflection: None,
            generation: 0,
            fitness: None,
            recorded_at: Utc::now(),
        }
    }
}

/// Errors from archive persistence.
#[derive(Debug)]
pub enum ArchiveError {
    /// The archive file could not be read or written.
    Io(std::io::Error),
    /// The archive file exists but does not parse as an entry array.
    Json(serde_json::Error),
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveError::Io(e) => write!(f, "archive i/o error: {}", e),
            ArchiveError::Json(e) => write!(f, "archive parse error: {}", e),
        }
    }
}

impl Error for ArchiveError {}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        ArchiveError::Io(e)
    }
}

impl From<serde_json::Error> for ArchiveError {
    fn from(e: serde_json::Error) -> Self {
        ArchiveError::Json(e)
    }
}

/// Durable storage for the archive. One writer per experiment: the
/// full-rewrite contract is crash-resumable but not safe against concurrent
/// writers.
pub trait ArchiveStore: Send + Sync {
    /// Load every recorded entry. An absent archive loads as empty.
    fn load(&self) -> Result<Vec<ArchiveEntry>, ArchiveError>;

    /// Replace the stored archive with exactly these entries.
    fn rewrite(&self, entries: &[ArchiveEntry]) -> Result<(), ArchiveError>;
}

/// Derive the archive filename for an experiment.
pub fn archive_filename(expr_name: &str) -> String {
    format!("{}_run_archive.json", expr_name)
}

/// File-backed [`ArchiveStore`]: one pretty-printed JSON array per
/// experiment, rewritten in full on every update.
pub struct JsonArchiveStore {
    path: PathBuf,
}

impl JsonArchiveStore {
    /// Store for `<save_dir>/<expr_name>_run_archive.json`. The directory is
    /// created on first write.
    pub fn new(save_dir: &Path, expr_name: &str) -> Self {
        Self {
            path: save_dir.join(archive_filename(expr_name)),
        }
    }

    /// Path of the backing file.
    pub fn file_path(&self) -> &Path {
        &self.path
    }
}

impl ArchiveStore for JsonArchiveStore {
    fn load(&self) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn rewrite(&self, entries: &[ArchiveEntry]) -> Result<(), ArchiveError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

/// Scores candidate code against a fixed example set.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Size of the example set.
    fn example_count(&self) -> usize;

    /// Score the candidate on one example, as an accuracy in `0.0..=1.0`.
    async fn evaluate(&self, code: &str, example_index: usize) -> Result<f64, SendError>;
}

/// Budgets and knobs for a search run.
#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// Generations to produce before stopping.
    pub max_generations: u32,
    /// Debug retries per candidate when evaluation fails or scores
    /// near zero; also bounds candidate-JSON repair re-prompts.
    pub debug_max: usize,
    /// Examples evaluated concurrently.
    pub eval_parallelism: usize,
    /// Whole-generation retries per generation slot before the slot is
    /// skipped.
    pub generation_retry_cap: usize,
    /// While set, a near-zero mean accuracy is treated as a failed
    /// evaluation worth debugging.
    pub searching_mode: bool,
    /// Entries a fresh archive starts from.
    pub seed: Vec<ArchiveEntry>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_generations: 25,
            debug_max: 3,
            eval_parallelism: 4,
            generation_retry_cap: 3,
            searching_mode: true,
            seed: Vec::new(),
        }
    }
}

/// Failures that abort a search run (attempt-local failures are retried
/// internally and logged, not surfaced).
#[derive(Debug)]
pub enum SearchError {
    /// Archive persistence failed; progress durability is gone, so the run
    /// stops.
    Store(ArchiveError),
    /// The LLM client failed outside cancellation.
    Client(SendError),
    /// The model never produced a parsable candidate within the repair
    /// budget.
    MalformedCandidate(String),
    /// Evaluation kept failing past the debug budget.
    Evaluation(String),
    /// The run's cancellation token fired.
    Cancelled,
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::Store(e) => write!(f, "archive store error: {}", e),
            SearchError::Client(e) => write!(f, "client error: {}", e),
            SearchError::MalformedCandidate(msg) => write!(f, "malformed candidate: {}", msg),
            SearchError::Evaluation(msg) => write!(f, "evaluation failed: {}", msg),
            SearchError::Cancelled => write!(f, "search cancelled"),
        }
    }
}

impl Error for SearchError {}

struct Candidate {
    name: String,
    code: String,
}

fn parse_candidate(raw: &str) -> Result<Candidate, String> {
    let slice = match extract_json_object(raw) {
        Some(s) => s,
        None => {
            return Err(
                "Your previous reply contained no JSON object. Answer again with ONLY a \
                 JSON object with the keys 'thought', 'name' and 'code'."
                    .to_string(),
            )
        }
    };
    let value: Value = match serde_json::from_str(slice) {
        Ok(v) => v,
        Err(e) => {
            return Err(format!(
                "Your previous reply was not valid JSON ({}). Answer again with ONLY a \
                 JSON object with the keys 'thought', 'name' and 'code'.",
                e
            ))
        }
    };
    let name = match value.get("name").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => {
            return Err(
                "Your previous JSON reply was missing a non-empty string key 'name'. \
                 Answer again with the complete object."
                    .to_string(),
            )
        }
    };
    let code = match value.get("code").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => {
            return Err(
                "Your previous JSON reply was missing a non-empty string key 'code'. \
                 Answer again with the complete object."
                    .to_string(),
            )
        }
    };
    Ok(Candidate { name, code })
}

/// Runs the generate → refine → evaluate → archive loop.
///
/// Also usable as a mailbox actor: a broadcast's content becomes the task
/// and kicks off a full run.
pub struct SearchAgent {
    name: String,
    description: String,
    client: Arc<dyn ClientWrapper>,
    store: Arc<dyn ArchiveStore>,
    evaluator: Arc<dyn Evaluator>,
    config: SearchConfig,
}

impl SearchAgent {
    /// Create a search agent over the given store and evaluator.
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn ClientWrapper>,
        store: Arc<dyn ArchiveStore>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        Self {
            name: name.into(),
            description: "Evolves candidate agent programs against an example set".to_string(),
            client,
            store,
            evaluator,
            config: SearchConfig::default(),
        }
    }

    /// Replace the default budgets.
    pub fn with_config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the search to the configured generation ceiling and return the
    /// final archive.
    pub async fn run(
        &self,
        task: &str,
        cancellation: CancellationToken,
    ) -> Result<Vec<ArchiveEntry>, SearchError> {
        let mut archive = match self.store.load() {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("{}: archive unreadable ({}), starting fresh", self.name, e);
                Vec::new()
            }
        };
        if archive.is_empty() {
            archive = self.config.seed.clone();
        }

        // Score whatever the archive is missing scores for. A failed
        // evaluation leaves the entry unscored; it is not retried this run.
        for index in 0..archive.len() {
            if cancellation.is_cancelled() {
                return Err(SearchError::Cancelled);
            }
            if archive[index].fitness.is_some() {
                continue;
            }
            let scored = self.score(&archive[index].code, &cancellation).await;
            match scored {
                Ok(fitness) => {
                    log::info!(
                        "{}: archive entry '{}' scored {:.3}",
                        self.name,
                        archive[index].name,
                        fitness
                    );
                    archive[index].fitness = Some(fitness);
                    self.store.rewrite(&archive).map_err(SearchError::Store)?;
                }
                Err(SearchError::Cancelled) => return Err(SearchError::Cancelled),
                Err(e) => {
                    log::warn!(
                        "{}: evaluation of archive entry '{}' failed: {}",
                        self.name,
                        archive[index].name,
                        e
                    );
                }
            }
        }

        let mut generation = archive.iter().map(|e| e.generation).max().unwrap_or(0);
        let mut slot_attempts = 0usize;

        while generation < self.config.max_generations {
            if cancellation.is_cancelled() {
                return Err(SearchError::Cancelled);
            }
            let target = generation + 1;
            let produced = self
                .run_generation(task, &archive, target, &cancellation)
                .await;
            match produced {
                Ok(entry) => {
                    log::info!(
                        "{}: generation {}: '{}' scored {:.3}",
                        self.name,
                        target,
                        entry.name,
                        entry.fitness.unwrap_or(0.0)
                    );
                    archive.push(entry);
                    self.store.rewrite(&archive).map_err(SearchError::Store)?;
                    generation = target;
                    slot_attempts = 0;
                }
                Err(SearchError::Cancelled) => return Err(SearchError::Cancelled),
                Err(e) => {
                    slot_attempts += 1;
                    log::warn!(
                        "{}: generation {} attempt {} failed: {}",
                        self.name,
                        target,
                        slot_attempts,
                        e
                    );
                    if slot_attempts > self.config.generation_retry_cap {
                        log::warn!(
                            "{}: skipping generation {} after {} failed attempts",
                            self.name,
                            target,
                            slot_attempts
                        );
                        generation = target;
                        slot_attempts = 0;
                    }
                }
            }
        }

        Ok(archive)
    }

    async fn run_generation(
        &self,
        task: &str,
        archive: &[ArchiveEntry],
        target: u32,
        cancellation: &CancellationToken,
    ) -> Result<ArchiveEntry, SearchError> {
        let mut history = vec![
            Message::new(Role::System, SEARCH_SYSTEM_PROMPT),
            Message::new(Role::User, proposal_prompt(task, archive)),
        ];
        let mut candidate = self.request_candidate(&mut history, cancellation).await?;

        for prompt in REFLEXION_PROMPTS.iter() {
            history.push(Message::new(Role::User, (*prompt).to_string()));
            candidate = self.request_candidate(&mut history, cancellation).await?;
        }

        let mut attempts = 0usize;
        loop {
            let scored = self.score(&candidate.code, cancellation).await;
            match scored {
                Ok(mean) if self.config.searching_mode && mean <= NEAR_ZERO_ACCURACY => {
                    if attempts >= self.config.debug_max {
                        return Err(SearchError::Evaluation(format!(
                            "mean accuracy stayed at {:.3} through {} debug attempts",
                            mean, attempts
                        )));
                    }
                    attempts += 1;
                    history.push(Message::new(
                        Role::User,
                        debug_prompt(&format!(
                            "the candidate scored a mean accuracy of {:.3}, which means it \
                             effectively never succeeds",
                            mean
                        )),
                    ));
                    candidate = self.request_candidate(&mut history, cancellation).await?;
                }
                Ok(mean) => {
                    // Transient working fields stay out of the archive.
                    return Ok(ArchiveEntry {
                        name: candidate.name,
                        code: candidate.code,
                        thought: None,
                        reflection: None,
                        generation: target,
                        fitness: Some(mean),
                        recorded_at: Utc::now(),
                    });
                }
                Err(SearchError::Cancelled) => return Err(SearchError::Cancelled),
                Err(e) => {
                    if attempts >= self.config.debug_max {
                        return Err(e);
                    }
                    attempts += 1;
                    history.push(Message::new(Role::User, debug_prompt(&e.to_string())));
                    candidate = self.request_candidate(&mut history, cancellation).await?;
                }
            }
        }
    }

    async fn request_candidate(
        &self,
        history: &mut Vec<Message>,
        cancellation: &CancellationToken,
    ) -> Result<Candidate, SearchError> {
        for _ in 0..=self.config.debug_max {
            let reply = self.llm(history, cancellation).await?;
            history.push(reply.clone());
            match parse_candidate(&reply.content) {
                Ok(candidate) => return Ok(candidate),
                Err(correction) => {
                    log::warn!("{}: candidate rejected: {}", self.name, correction);
                    history.push(Message::new(Role::User, correction));
                }
            }
        }
        Err(SearchError::MalformedCandidate(
            "no valid candidate JSON within the repair budget".to_string(),
        ))
    }

    async fn llm(
        &self,
        history: &[Message],
        cancellation: &CancellationToken,
    ) -> Result<Message, SearchError> {
        if cancellation.is_cancelled() {
            return Err(SearchError::Cancelled);
        }
        tokio::select! {
            _ = cancellation.cancelled() => Err(SearchError::Cancelled),
            result = self.client.send_message(history, cancellation) => {
                result.map_err(SearchError::Client)
            }
        }
    }

    /// Mean accuracy over the full example set, evaluated with bounded
    /// parallelism. Any per-example error fails the whole evaluation (and is
    /// then subject to the caller's debug retries).
    async fn score(
        &self,
        code: &str,
        cancellation: &CancellationToken,
    ) -> Result<f64, SearchError> {
        let count = self.evaluator.example_count();
        if count == 0 {
            return Err(SearchError::Evaluation(
                "evaluator has an empty example set".to_string(),
            ));
        }

        let evaluator = Arc::clone(&self.evaluator);
        let gather = stream::iter(0..count)
            .map(|index| {
                let evaluator = Arc::clone(&evaluator);
                async move { evaluator.evaluate(code, index).await }
            })
            .buffer_unordered(self.config.eval_parallelism.max(1))
            .collect::<Vec<_>>();

        let results = tokio::select! {
            _ = cancellation.cancelled() => return Err(SearchError::Cancelled),
            results = gather => results,
        };

        let mut total = 0.0;
        for result in results {
            total += result.map_err(|e| SearchError::Evaluation(e.to_string()))?;
        }
        Ok(total / count as f64)
    }
}

#[async_trait]
impl MessageHandler for SearchAgent {
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
        self.run(&message.content.content, context.cancellation.clone())
            .await
            .map(|_| ())
            .map_err(|e| Box::new(e) as SendError)
    }
}

const SEARCH_SYSTEM_PROMPT: &str =
    "You are an expert researcher evolving candidate agent programs. Every \
     answer you give is a single JSON object with the string keys 'thought', \
     'name' and 'code'. 'code' contains the complete candidate program.";

fn proposal_prompt(task: &str, archive: &[ArchiveEntry]) -> String {
    let mut rendered = String::new();
    for entry in archive {
        rendered.push_str(&format!(
            "### {} (generation {}, fitness {})\n{}\n\n",
            entry.name,
            entry.generation,
            entry
                .fitness
                .map(|f| format!("{:.3}", f))
                .unwrap_or_else(|| "unscored".to_string()),
            entry.code
        ));
    }
    format!(
        "We are addressing the following task:\n\n{}\n\n\
         Here is the archive of candidates discovered so far:\n\n{}\
         Propose the next candidate: interestingly different from everything \
         in the archive, and plausibly higher-scoring. Output a single JSON \
         object with the keys 'thought', 'name' and 'code'.",
        task, rendered
    )
}

fn debug_prompt(error: &str) -> String {
    format!(
        "Evaluating your candidate failed: {}. Revise the candidate to fix \
         this and answer again with the full JSON object ('thought', 'name', \
         'code').",
        error
    )
}

const REFLEXION_PROMPTS: [&str; 4] = [
    "Reflexion pass 1 of 4 (novelty): compare your proposal against every archive entry \
     above. If it closely mirrors an existing entry, change the approach until \
     it is interestingly new. Answer again with the full JSON object.",
    "Reflexion pass 2 of 4 (correctness): re-read the code line by line for \
     implementation mistakes, unhandled inputs, and places where the behavior \
     does not match your stated thought. Fix what you find and answer again \
     with the full JSON object.",
    "Reflexion pass 3 of 4 (simplicity): remove anything the candidate does not need to \
     score well; complexity that earns nothing costs reliability. Answer again \
     with the full JSON object.",
    "Reflexion pass 4 of 4 (final check): confirm the candidate would run as-is against \
     the example set, then answer one last time with the full JSON object.",
];
