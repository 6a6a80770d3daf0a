//! Chat dataset loading and flattening for supervised fine-tuning
//!
//! Each JSONL line holds one conversation (`{"messages": [{role, content}, ...]}`).
//! A conversation is flattened into one text blob by emitting
//! `<|role|>\n{content}\n` per turn and appending the end marker.

use serde::{Deserialize, Deserializer, Serialize};
use std::io::Write;
use std::path::Path;

use super::{DataError, DataResult};
use crate::constants::{END_MARKER, KNOWN_ROLES};

/// Number of characters shown in the dataset preview
const PREVIEW_CHARS: usize = 200;

/// A single conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// Missing and `null` content both read as empty text
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// One line of the training file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub messages: Vec<ChatMessage>,
}

/// Flattened training text, as consumed by the trainer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedExample {
    pub text: String,
}

/// Render turns without the trailing end marker.
///
/// Used directly by the smoke-test prompt, which leaves the conversation open
/// for the assistant.
pub fn format_messages(messages: &[ChatMessage]) -> String {
    let mut text = String::new();
    for msg in messages {
        if !KNOWN_ROLES.contains(&msg.role.as_str()) {
            tracing::warn!("Skipping turn with unknown role '{}'", msg.role);
            continue;
        }
        text.push_str("<|");
        text.push_str(&msg.role);
        text.push_str("|>\n");
        text.push_str(&msg.content);
        text.push('\n');
    }
    text
}

/// Flatten a record into its training text
pub fn format_record(record: &TrainingRecord) -> FormattedExample {
    let mut text = format_messages(&record.messages);
    text.push_str(END_MARKER);
    FormattedExample { text }
}

/// Parse one JSONL line. `line_number` is 1-based and only used for errors.
pub fn parse_line(line: &str, line_number: usize) -> DataResult<TrainingRecord> {
    serde_json::from_str(line).map_err(|source| DataError::MalformedLine {
        line: line_number,
        source,
    })
}

/// Load and format the whole training file.
///
/// Blank lines are skipped. The first malformed line aborts the load.
pub fn load_training_data(path: &Path) -> DataResult<Vec<FormattedExample>> {
    let content = std::fs::read_to_string(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut examples = Vec::new();
    for (line_num, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let record = parse_line(line, line_num + 1).map_err(|e| e.in_file(path))?;
        examples.push(format_record(&record));
    }

    if examples.is_empty() {
        return Err(DataError::EmptyDataset(path.to_path_buf()));
    }

    tracing::debug!("Loaded {} examples from {}", examples.len(), path.display());
    Ok(examples)
}

/// Write formatted examples back out as `{"text": ...}` JSONL
pub fn write_formatted(path: &Path, examples: &[FormattedExample]) -> DataResult<()> {
    let io_err = |source| DataError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = std::fs::File::create(path).map_err(io_err)?;
    let mut writer = std::io::BufWriter::new(file);
    for example in examples {
        let line = serde_json::to_string(example)
            .map_err(|source| DataError::Serialize { source })?;
        writeln!(writer, "{}", line).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}

/// Summary printed before training
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetStats {
    pub examples: usize,
    /// Mean text length in characters
    pub average_length: f64,
    /// Leading characters of the first example
    pub preview: String,
}

impl DatasetStats {
    pub fn from_examples(examples: &[FormattedExample]) -> Self {
        let total: usize = examples.iter().map(|e| e.text.chars().count()).sum();
        let average_length = if examples.is_empty() {
            0.0
        } else {
            total as f64 / examples.len() as f64
        };
        let preview = examples
            .first()
            .map(|e| e.text.chars().take(PREVIEW_CHARS).collect())
            .unwrap_or_default();

        Self {
            examples: examples.len(),
            average_length,
            preview,
        }
    }

    pub fn log(&self) {
        tracing::info!("Training examples: {}", self.examples);
        tracing::info!("Average text length: {:.0} chars", self.average_length);
        tracing::info!("First example preview:\n{}...", self.preview);
    }
}
