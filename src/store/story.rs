//! Story records and their status ladder.

use md5::{Digest, Md5};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

use super::Store;

/// MD5 hex digest of a formatter prompt.
///
/// Stored next to the tagged story text so a stale tagging run is
/// detectable when the formatter prompt changes.
pub fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One enumerated stage of the story pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryStatus {
    pub id: i64,
    pub code: String,
    /// Pipeline position; stories only move forward through it.
    pub step: i64,
    pub description: String,
    pub operation_type: Option<String>,
    pub agent_type: Option<String>,
    pub function_name: Option<String>,
    pub caption_to_execute: Option<String>,
}

impl StoryStatus {
    /// Status with a code and step position.
    pub fn new(code: impl Into<String>, step: i64) -> Self {
        Self {
            id: 0,
            code: code.into(),
            step,
            description: String::new(),
            operation_type: None,
            agent_type: None,
            function_name: None,
            caption_to_execute: None,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            code: row.get("code")?,
            step: row.get("step")?,
            description: row.get("description")?,
            operation_type: row.get("operation_type")?,
            agent_type: row.get("agent_type")?,
            function_name: row.get("function_name")?,
            caption_to_execute: row.get("caption_to_execute")?,
        })
    }
}

/// Generation flags tracked per story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationFlag {
    TtsJson,
    Tts,
    Ambient,
    Music,
    Effects,
    MixedAudio,
}

impl GenerationFlag {
    fn column(&self) -> &'static str {
        match self {
            GenerationFlag::TtsJson => "tts_json",
            GenerationFlag::Tts => "tts",
            GenerationFlag::Ambient => "ambient",
            GenerationFlag::Music => "music",
            GenerationFlag::Effects => "effects",
            GenerationFlag::MixedAudio => "mixed_audio",
        }
    }
}

/// A generated story with full provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryRecord {
    pub id: i64,
    /// Stable correlation id minted by the numerator, independent of
    /// the row id.
    pub story_id: Option<i64>,
    pub generation_id: Option<String>,
    pub memory_key: Option<String>,
    pub timestamp: String,
    pub prompt: Option<String>,
    pub story_raw: String,
    pub story_revised: Option<String>,
    pub story_tagged: Option<String>,
    pub story_tagged_version: Option<i64>,
    pub formatter_model_id: Option<i64>,
    pub formatter_prompt_hash: Option<String>,
    pub characters: Option<Value>,
    pub story_structure: Option<Value>,
    pub summary: Option<String>,
    pub title: Option<String>,
    pub char_count: i64,
    pub eval: Option<String>,
    pub score: Option<f64>,
    pub approved: bool,
    pub status_id: Option<i64>,
    pub folder: Option<String>,
    /// Creator model; write-once without the admin override.
    pub model_id: Option<i64>,
    /// Creator agent; write-once without the admin override.
    pub agent_id: Option<i64>,
    pub serie_id: Option<i64>,
    pub serie_episode: Option<i64>,
    pub tts_json: bool,
    pub tts: bool,
    pub ambient: bool,
    pub music: bool,
    pub effects: bool,
    pub mixed_audio: bool,
}

impl StoryRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let characters: Option<String> = row.get("characters")?;
        let structure: Option<String> = row.get("story_structure")?;
        Ok(Self {
            id: row.get("id")?,
            story_id: row.get("story_id")?,
            generation_id: row.get("generation_id")?,
            memory_key: row.get("memory_key")?,
            timestamp: row.get("timestamp")?,
            prompt: row.get("prompt")?,
            story_raw: row.get("story_raw")?,
            story_revised: row.get("story_revised")?,
            story_tagged: row.get("story_tagged")?,
            story_tagged_version: row.get("story_tagged_version")?,
            formatter_model_id: row.get("formatter_model_id")?,
            formatter_prompt_hash: row.get("formatter_prompt_hash")?,
            characters: characters.and_then(|c| serde_json::from_str(&c).ok()),
            story_structure: structure.and_then(|s| serde_json::from_str(&s).ok()),
            summary: row.get("summary")?,
            title: row.get("title")?,
            char_count: row.get("char_count")?,
            eval: row.get("eval")?,
            score: row.get("score")?,
            approved: row.get("approved")?,
            status_id: row.get("status_id")?,
            folder: row.get("folder")?,
            model_id: row.get("model_id")?,
            agent_id: row.get("agent_id")?,
            serie_id: row.get("serie_id")?,
            serie_episode: row.get("serie_episode")?,
            tts_json: row.get("tts_json")?,
            tts: row.get("tts")?,
            ambient: row.get("ambient")?,
            music: row.get("music")?,
            effects: row.get("effects")?,
            mixed_audio: row.get("mixed_audio")?,
        })
    }
}

impl Store {
    /// Insert or update a story status by its natural key (`code`).
    pub fn upsert_story_status(&self, status: &StoryStatus) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO story_statuses (
                     code, step, description, operation_type, agent_type,
                     function_name, caption_to_execute
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(code) DO UPDATE SET
                     step = excluded.step,
                     description = excluded.description,
                     operation_type = excluded.operation_type,
                     agent_type = excluded.agent_type,
                     function_name = excluded.function_name,
                     caption_to_execute = excluded.caption_to_execute",
                params![
                    status.code,
                    status.step,
                    status.description,
                    status.operation_type,
                    status.agent_type,
                    status.function_name,
                    status.caption_to_execute,
                ],
            )?;
            let id = conn.query_row(
                "SELECT id FROM story_statuses WHERE code = ?1",
                params![status.code],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// Fetch a status by code.
    pub fn story_status_by_code(&self, code: &str) -> Result<StoryStatus> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM story_statuses WHERE code = ?1",
                params![code],
                StoryStatus::from_row,
            )
            .optional()?
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "story status",
                name: code.to_string(),
            })
        })
    }

    /// Create a story row. `char_count` is derived from `story_raw`
    /// as a character count, not a byte length.
    pub fn create_story(
        &self,
        story_id: Option<i64>,
        prompt: Option<&str>,
        story_raw: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO stories (story_id, timestamp, prompt, story_raw, char_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    story_id,
                    Store::now(),
                    prompt,
                    story_raw,
                    story_raw.chars().count() as i64
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Fetch a story by row id.
    pub fn story_by_id(&self, id: i64) -> Result<StoryRecord> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM stories WHERE id = ?1",
                params![id],
                StoryRecord::from_row,
            )
            .optional()?
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "story",
                name: id.to_string(),
            })
        })
    }

    /// Replace the raw story text, keeping `char_count` consistent.
    pub fn set_story_raw(&self, id: i64, story_raw: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE stories SET story_raw = ?1, char_count = ?2 WHERE id = ?3",
                params![story_raw, story_raw.chars().count() as i64, id],
            )?;
            Ok(())
        })
    }

    /// Store the character list produced by a characters step.
    pub fn set_story_characters(&self, id: i64, characters: &Value) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE stories SET characters = ?1 WHERE id = ?2",
                params![characters.to_string(), id],
            )?;
            Ok(())
        })
    }

    /// Store the summary and title.
    pub fn set_story_summary(&self, id: i64, summary: &str, title: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE stories SET summary = ?1, title = COALESCE(?2, title) WHERE id = ?3",
                params![summary, title, id],
            )?;
            Ok(())
        })
    }

    /// Record creator provenance.
    ///
    /// `model_id` and `agent_id` are write-once: without
    /// `admin_override`, only currently-empty fields are filled.
    pub fn set_story_creator(
        &self,
        id: i64,
        model_id: Option<i64>,
        agent_id: Option<i64>,
        admin_override: bool,
    ) -> Result<()> {
        self.with_conn(|conn| {
            if admin_override {
                conn.execute(
                    "UPDATE stories SET model_id = ?1, agent_id = ?2 WHERE id = ?3",
                    params![model_id, agent_id, id],
                )?;
            } else {
                conn.execute(
                    "UPDATE stories SET
                         model_id = COALESCE(model_id, ?1),
                         agent_id = COALESCE(agent_id, ?2)
                     WHERE id = ?3",
                    params![model_id, agent_id, id],
                )?;
            }
            Ok(())
        })
    }

    /// Advance the story status. The status ladder is monotone: a
    /// target whose `step` is behind the current one is ignored.
    pub fn advance_story_status(&self, id: i64, status_id: i64) -> Result<()> {
        self.with_tx(|tx| {
            let target: Option<i64> = tx
                .query_row(
                    "SELECT step FROM story_statuses WHERE id = ?1",
                    params![status_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(target_step) = target else {
                return Err(OrchestratorError::NotFound {
                    kind: "story status",
                    name: status_id.to_string(),
                });
            };
            let current_step: Option<i64> = tx.query_row(
                "SELECT s.step FROM stories st
                 LEFT JOIN story_statuses s ON s.id = st.status_id
                 WHERE st.id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            if current_step.map_or(true, |current| target_step >= current) {
                tx.execute(
                    "UPDATE stories SET status_id = ?1 WHERE id = ?2",
                    params![status_id, id],
                )?;
            }
            Ok(())
        })
    }

    /// Set one generation flag.
    pub fn set_generation_flag(&self, id: i64, flag: GenerationFlag, value: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE stories SET {} = ?1 WHERE id = ?2", flag.column()),
                params![value, id],
            )?;
            Ok(())
        })
    }

    /// Store a voice-tagged rendition of the story, with the
    /// formatter provenance that produced it.
    pub fn set_story_tagged(
        &self,
        id: i64,
        story_tagged: &str,
        version: i64,
        formatter_model_id: Option<i64>,
        formatter_prompt: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE stories SET
                     story_tagged = ?1,
                     story_tagged_version = ?2,
                     formatter_model_id = ?3,
                     formatter_prompt_hash = ?4
                 WHERE id = ?5",
                params![
                    story_tagged,
                    version,
                    formatter_model_id,
                    prompt_hash(formatter_prompt),
                    id
                ],
            )?;
            Ok(())
        })
    }

    /// Record the evaluation summary line and score shown on the
    /// story view.
    pub fn set_story_eval(&self, id: i64, eval: &str, score: Option<f64>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE stories SET eval = ?1, score = COALESCE(?2, score) WHERE id = ?3",
                params![eval, score, id],
            )?;
            Ok(())
        })
    }
}
