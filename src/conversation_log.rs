//! Daily append-only conversation archive.
//!
//! One JSONL file per local day; each line is a structured record
//! `{ts, session_id, role, content}`. Appends are best-effort and run in
//! background tasks; an unwritable disk never disturbs the conversation.

use crate::context::Message;
use crate::error::Result;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

/// One archived line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub session_id: Uuid,
    pub role: String,
    pub content: String,
}

/// Writes conversation records into daily files.
pub struct ConversationLogger {
    dir: PathBuf,
    session_id: Uuid,
}

impl ConversationLogger {
    /// Create a logger for a fresh session id.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            session_id: Uuid::new_v4(),
        }
    }

    /// This session's id.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn day_path(&self) -> PathBuf {
        let day = Local::now().format("%Y-%m-%d");
        self.dir.join(format!("{day}.jsonl"))
    }

    /// Append messages to today's file. Returns the file path.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory or file cannot be written.
    pub fn append(&self, messages: &[Message]) -> Result<PathBuf> {
        let path = self.day_path();
        std::fs::create_dir_all(&self.dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        for message in messages {
            let record = LogRecord {
                ts: message.timestamp,
                session_id: self.session_id,
                role: format!("{:?}", message.role).to_lowercase(),
                content: message.content.as_text(),
            };
            let line = serde_json::to_string(&record)
                .map_err(|e| crate::error::VoiceError::Protocol {
                    component: "log",
                    message: e.to_string(),
                })?;
            writeln!(file, "{line}")?;
        }
        debug!(path = %path.display(), count = messages.len(), "conversation archived");
        Ok(path)
    }

    /// Export today's records as CSV next to the JSONL file. Used on
    /// clean shutdown when configured.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if either file cannot be accessed.
    pub fn export_csv(&self) -> Result<PathBuf> {
        let source = self.day_path();
        let target = source.with_extension("csv");
        let raw = std::fs::read_to_string(&source)?;

        let mut out = String::from("ts,session_id,role,content\n");
        for line in raw.lines() {
            let Ok(record) = serde_json::from_str::<LogRecord>(line) else {
                continue;
            };
            out.push_str(&format!(
                "{},{},{},{}\n",
                record.ts.to_rfc3339(),
                record.session_id,
                record.role,
                csv_escape(&record.content),
            ));
        }
        std::fs::write(&target, out)?;
        Ok(target)
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}
