//! The progress ledger: structured judgments produced by reflection.
//!
//! Once per reflection the orchestration loop asks its model for exactly four
//! judgments as strict JSON: request satisfied? progress being made? who
//! speaks next? what should they do? Model output being what it is, the
//! parser here tolerates surrounding prose and markdown fences, then
//! validates field by field. Every way the reply can be wrong maps to a
//! [`LedgerDefect`] that renders a correction sentence naming exactly the
//! offending key or shape, so the loop can re-prompt instead of crashing.
//!
//! A ledger is ephemeral: it drives one speaker selection and is re-derived
//! on the next reflection. Only a fully valid ledger ever reaches the loop.
//!
//! # Example
//!
//! ```rust
//! use roundtable::ledger::parse_ledger;
//!
//! let roster = vec!["coder".to_string(), "browser".to_string()];
//! let raw = r#"{
//!     "is_request_satisfied": {"answer": false, "reason": "still searching"},
//!     "is_progress_being_made": {"answer": true, "reason": "found the repo"},
//!     "next_speaker": {"answer": "coder", "reason": "needs a script"},
//!     "instruction_or_question": {"answer": "Write the scraper", "reason": "next step"}
//! }"#;
//!
//! let ledger = parse_ledger(raw, &roster).unwrap();
//! assert_eq!(ledger.next_speaker.answer.as_deref(), Some("coder"));
//! assert!(!ledger.is_request_satisfied.answer);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A boolean judgment with its supporting reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgment {
    /// The yes/no verdict.
    pub answer: bool,
    /// The model's stated reason for the verdict.
    pub reason: String,
}

/// A free-text judgment (speaker name or instruction) with its reason.
/// `answer` may be null in the wire form; the instruction slot treats null
/// as the empty instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChoice {
    /// The chosen text, when the model provided one.
    pub answer: Option<String>,
    /// The model's stated reason for the choice.
    pub reason: String,
}

/// The four judgments a reflection produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    /// Is the original request fully satisfied?
    pub is_request_satisfied: Judgment,
    /// Is the team making forward progress?
    pub is_progress_being_made: Judgment,
    /// Which team member should speak next? Validated against the roster.
    pub next_speaker: TextChoice,
    /// The instruction or question to give the next speaker.
    pub instruction_or_question: TextChoice,
}

/// Exactly how a reflection reply failed validation.
///
/// Each defect renders a correction sentence via
/// [`correction`](LedgerDefect::correction) that the loop appends to the
/// conversation before re-prompting.
#[derive(Debug, Clone)]
pub enum LedgerDefect {
    /// The reply contained no parseable JSON object.
    InvalidJson(String),
    /// A required key was absent. The payload is the dotted key path.
    MissingKey(String),
    /// A key was present with the wrong shape.
    WrongType {
        /// Dotted path of the offending key.
        key: String,
        /// What the key should have been.
        expected: &'static str,
    },
    /// `next_speaker.answer` named someone who is not on the team.
    UnknownSpeaker {
        /// The name the model produced.
        name: String,
        /// The names it may choose from.
        known: Vec<String>,
    },
}

impl LedgerDefect {
    /// The correction sentence to send back to the model.
    pub fn correction(&self) -> String {
        match self {
            LedgerDefect::InvalidJson(reason) => format!(
                "Your previous reply was not a valid JSON object ({}). \
                 Answer again with ONLY a JSON object in the requested shape.",
                reason
            ),
            LedgerDefect::MissingKey(key) => format!(
                "Your previous JSON reply was missing the key '{}'. \
                 Answer again with the complete JSON object, including '{}'.",
                key, key
            ),
            LedgerDefect::WrongType { key, expected } => format!(
                "In your previous JSON reply the value of '{}' was not {}. \
                 Answer again with '{}' as {}.",
                key, expected, key, expected
            ),
            LedgerDefect::UnknownSpeaker { name, known } => format!(
                "In your previous JSON reply 'next_speaker.answer' was '{}', \
                 which is not a member of the team. It must be exactly one of: {}.",
                name,
                known.join(", ")
            ),
        }
    }
}

impl fmt::Display for LedgerDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.correction())
    }
}

impl std::error::Error for LedgerDefect {}

/// Extract the first balanced JSON object from free-form model output.
///
/// Scans for `{`, then walks the text respecting string literals and escape
/// sequences until the braces balance. Markdown fences and surrounding prose
/// are ignored naturally.
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_object(raw: &str) -> Result<Value, LedgerDefect> {
    let slice = extract_json_object(raw)
        .ok_or_else(|| LedgerDefect::InvalidJson("no JSON object found".to_string()))?;
    let value: Value =
        serde_json::from_str(slice).map_err(|e| LedgerDefect::InvalidJson(e.to_string()))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(LedgerDefect::InvalidJson(
            "top-level value is not an object".to_string(),
        ))
    }
}

fn reason_of(entry: &Value) -> String {
    entry
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn bool_judgment(root: &Value, key: &str) -> Result<Judgment, LedgerDefect> {
    let entry = root
        .get(key)
        .ok_or_else(|| LedgerDefect::MissingKey(key.to_string()))?;
    let answer = entry
        .get("answer")
        .ok_or_else(|| LedgerDefect::MissingKey(format!("{}.answer", key)))?
        .as_bool()
        .ok_or(LedgerDefect::WrongType {
            key: format!("{}.answer", key),
            expected: "a boolean",
        })?;
    Ok(Judgment {
        answer,
        reason: reason_of(entry),
    })
}

fn text_choice(root: &Value, key: &str, allow_null: bool) -> Result<TextChoice, LedgerDefect> {
    let entry = root
        .get(key)
        .ok_or_else(|| LedgerDefect::MissingKey(key.to_string()))?;
    let answer = entry
        .get("answer")
        .ok_or_else(|| LedgerDefect::MissingKey(format!("{}.answer", key)))?;
    let answer = match answer {
        Value::String(s) => Some(s.clone()),
        Value::Null if allow_null => None,
        _ => {
            return Err(LedgerDefect::WrongType {
                key: format!("{}.answer", key),
                expected: "a string",
            })
        }
    };
    Ok(TextChoice {
        answer,
        reason: reason_of(entry),
    })
}

/// Parse and validate a full four-judgment ledger.
///
/// `roster` is the list of currently known specialist names;
/// `next_speaker.answer` must match one of them exactly.
pub fn parse_ledger(raw: &str, roster: &[String]) -> Result<Ledger, LedgerDefect> {
    let root = parse_object(raw)?;

    let is_request_satisfied = bool_judgment(&root, "is_request_satisfied")?;
    let is_progress_being_made = bool_judgment(&root, "is_progress_being_made")?;
    let next_speaker = text_choice(&root, "next_speaker", false)?;
    let instruction_or_question = text_choice(&root, "instruction_or_question", true)?;

    match next_speaker.answer.as_deref() {
        Some(name) if roster.iter().any(|r| r == name) => {}
        Some(name) => {
            return Err(LedgerDefect::UnknownSpeaker {
                name: name.to_string(),
                known: roster.to_vec(),
            })
        }
        None => {
            return Err(LedgerDefect::WrongType {
                key: "next_speaker.answer".to_string(),
                expected: "a string",
            })
        }
    }

    Ok(Ledger {
        is_request_satisfied,
        is_progress_being_made,
        next_speaker,
        instruction_or_question,
    })
}

/// Parse a single boolean judgment under `key`: the educated-guess check
/// uses this with the same tolerance and correction machinery as the full
/// ledger.
pub fn parse_judgment(raw: &str, key: &str) -> Result<Judgment, LedgerDefect> {
    let root = parse_object(raw)?;
    bool_judgment(&root, key)
}
