//! Long-term memory: LLM-driven extraction into an append-only record
//! store, and budgeted context assembly for the system prompt.
//!
//! Extraction runs as a background task after each turn; both operations
//! are best-effort and never surface failures to the user.

use crate::config::{LlmConfig, MemoryConfig};
use crate::context::Message;
use crate::contracts::Memory;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const EXTRACTION_PROMPT: &str = "\
Extract entities and relationships from this conversation.
The conversation may be in Korean or English. Keep entity names in their original language.

Return JSON with this exact structure:
{
  \"entities\": [{\"name\": \"...\", \"type\": \"person|place|concept|event|preference\", \"description\": \"...\"}],
  \"relationships\": [{\"source\": \"...\", \"target\": \"...\", \"type\": \"...\", \"description\": \"...\"}]
}

Extract names, places, preferences, plans, opinions, and technical topics.
Skip generic greetings and filler. If nothing meaningful, return empty arrays.";

/// One persisted memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub ts: DateTime<Utc>,
    pub kind: RecordKind,
    pub name: String,
    #[serde(default)]
    pub entity_type: String,
    pub description: String,
}

/// Record discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Entity,
    Relationship,
}

/// LLM-backed extractor persisting to an append-only JSONL store.
pub struct ExtractionMemory {
    http: reqwest::Client,
    llm: LlmConfig,
    config: MemoryConfig,
}

impl ExtractionMemory {
    /// Create an extractor. The store directory is created on first save.
    pub fn new(llm: LlmConfig, config: MemoryConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            llm,
            config,
        }
    }

    fn store_path(&self) -> PathBuf {
        self.config.data_dir.join("memories.jsonl")
    }

    /// Call the extraction model (non-streaming) and return its text.
    async fn extract_text(&self, conversation: &str) -> Result<String> {
        let body = json!({
            "model": self.config.extraction_model,
            "max_tokens": 2000,
            "system": EXTRACTION_PROMPT,
            "messages": [{"role": "user", "content": conversation}],
        });
        let response = self
            .http
            .post(format!("{}/v1/messages", self.llm.base_url))
            .header("x-api-key", &self.llm.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::transport("memory", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VoiceError::transport("memory", status.to_string()));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| VoiceError::protocol("memory", e.to_string()))?;
        Ok(payload["content"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_owned())
    }

    fn append_records(&self, records: &[MemoryRecord]) -> Result<()> {
        std::fs::create_dir_all(&self.config.data_dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.store_path())?;
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|e| VoiceError::protocol("memory", e.to_string()))?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    fn load_records(&self) -> Vec<MemoryRecord> {
        let Ok(raw) = std::fs::read_to_string(self.store_path()) else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

/// Strip a markdown fence if the model wrapped its JSON.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.rsplit_once("```").map(|(body, _)| body).unwrap_or(rest).trim()
}

/// Parse the extraction JSON into records. Malformed entries are skipped.
fn parse_extraction(raw: &str) -> Vec<MemoryRecord> {
    let Ok(value) = serde_json::from_str::<Value>(strip_fences(raw)) else {
        return Vec::new();
    };
    let now = Utc::now();
    let mut records = Vec::new();

    if let Some(entities) = value["entities"].as_array() {
        for e in entities {
            let (Some(name), Some(description)) = (e["name"].as_str(), e["description"].as_str())
            else {
                continue;
            };
            records.push(MemoryRecord {
                ts: now,
                kind: RecordKind::Entity,
                name: name.to_owned(),
                entity_type: e["type"].as_str().unwrap_or("concept").to_owned(),
                description: description.to_owned(),
            });
        }
    }
    if let Some(rels) = value["relationships"].as_array() {
        for r in rels {
            let (Some(source), Some(target)) = (r["source"].as_str(), r["target"].as_str()) else {
                continue;
            };
            records.push(MemoryRecord {
                ts: now,
                kind: RecordKind::Relationship,
                name: format!("{source} -> {target}"),
                entity_type: r["type"].as_str().unwrap_or_default().to_owned(),
                description: r["description"].as_str().unwrap_or_default().to_owned(),
            });
        }
    }
    records
}

/// Assemble a context block from records, newest first, within a rough
/// token budget (4 chars per token).
fn assemble_context(records: &[MemoryRecord], query: &str, target_tokens: usize) -> String {
    let query_lower = query.to_lowercase();
    let needles: Vec<&str> = query_lower.split_whitespace().collect();
    let relevant = |r: &MemoryRecord| {
        needles.is_empty()
            || needles.iter().any(|n| {
                r.name.to_lowercase().contains(n) || r.description.to_lowercase().contains(n)
            })
    };

    let mut lines = Vec::new();
    let mut budget = 0usize;
    // Query-relevant records first, then the most recent remainder.
    let mut ordered: Vec<&MemoryRecord> = records.iter().rev().collect();
    ordered.sort_by_key(|r| !relevant(r));

    for record in ordered {
        let line = match record.kind {
            RecordKind::Entity => {
                format!("- {} ({}): {}", record.name, record.entity_type, record.description)
            }
            RecordKind::Relationship => {
                format!("- {} [{}]: {}", record.name, record.entity_type, record.description)
            }
        };
        budget += line.chars().count() / 4;
        if budget > target_tokens {
            break;
        }
        lines.push(line);
    }
    lines.join("\n")
}

#[async_trait]
impl Memory for ExtractionMemory {
    async fn pre_load(&self, query: &str) -> Result<String> {
        let records = self.load_records();
        if records.is_empty() {
            return Ok(String::new());
        }
        Ok(assemble_context(
            &records,
            query,
            self.config.context_target_tokens,
        ))
    }

    async fn extract_and_save(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let conversation: String = messages
            .iter()
            .map(|m| format!("{:?}: {}\n", m.role, m.content.as_text()))
            .collect();

        debug!(messages = messages.len(), "extracting memories");
        let raw = self.extract_text(&conversation).await?;
        let records = parse_extraction(&raw);
        if records.is_empty() {
            debug!("extraction empty, skipping save");
            return Ok(());
        }

        self.append_records(&records)?;
        info!(records = records.len(), "memories saved");
        Ok(())
    }
}

/// No-op memory for sessions with extraction disabled.
pub struct NullMemory;

#[async_trait]
impl Memory for NullMemory {
    async fn pre_load(&self, _query: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn extract_and_save(&self, _messages: &[Message]) -> Result<()> {
        Ok(())
    }
}

/// Log-and-drop wrapper used by background extraction tasks.
pub async fn extract_quietly(memory: &dyn Memory, messages: &[Message]) {
    if let Err(e) = memory.extract_and_save(messages).await {
        warn!("memory extraction failed: {e}");
    }
}
