//! Step templates, task types, and the voice catalog contract.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

use super::Store;

/// How a completed execution's step outputs merge into one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Concatenate step outputs in order, blank-line separated.
    AccumulateChapters,
    /// The final step's output is the artifact.
    LastOnly,
}

impl MergeStrategy {
    /// Parse from the stored column value.
    pub fn parse(text: &str) -> Self {
        match text {
            "accumulate_chapters" => MergeStrategy::AccumulateChapters,
            _ => MergeStrategy::LastOnly,
        }
    }

    /// Stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::AccumulateChapters => "accumulate_chapters",
            MergeStrategy::LastOnly => "last_only",
        }
    }
}

/// A declarative multi-step task template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub id: i64,
    pub name: String,
    pub task_type: String,
    /// Multiline prompt, numbered `1.` .. `N.`, one step per number.
    pub step_prompt: String,
    pub instructions: String,
    /// Step whose output is the character list, if any.
    pub characters_step: Option<i64>,
    /// CSV of steps that trigger an evaluation pass.
    pub evaluation_steps: Option<String>,
    /// CSV of plot ("trama") steps subject to `min_chars_trama`.
    pub trama_steps: Option<String>,
    pub min_chars_trama: i64,
    pub min_chars_story: i64,
    /// Step whose output materializes the assembled story, if any.
    pub full_story_step: Option<i64>,
}

impl StepTemplate {
    /// Minimal template with a name and step prompt.
    pub fn new(name: impl Into<String>, step_prompt: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            task_type: String::new(),
            step_prompt: step_prompt.into(),
            instructions: String::new(),
            characters_step: None,
            evaluation_steps: None,
            trama_steps: None,
            min_chars_trama: 0,
            min_chars_story: 0,
            full_story_step: None,
        }
    }

    /// Parse a CSV column (`"2,4"`) into step numbers.
    pub fn csv_steps(csv: Option<&str>) -> Vec<i64> {
        csv.map(|text| {
            text.split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
    }

    /// Steps listed in `trama_steps`.
    pub fn trama_step_numbers(&self) -> Vec<i64> {
        Self::csv_steps(self.trama_steps.as_deref())
    }

    /// Steps listed in `evaluation_steps`.
    pub fn evaluation_step_numbers(&self) -> Vec<i64> {
        Self::csv_steps(self.evaluation_steps.as_deref())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            task_type: row.get("task_type")?,
            step_prompt: row.get("step_prompt")?,
            instructions: row.get("instructions")?,
            characters_step: row.get("characters_step")?,
            evaluation_steps: row.get("evaluation_steps")?,
            trama_steps: row.get("trama_steps")?,
            min_chars_trama: row.get("min_chars_trama")?,
            min_chars_story: row.get("min_chars_story")?,
            full_story_step: row.get("full_story_step")?,
        })
    }
}

/// A task-type contract: default roles and merge behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskType {
    pub id: i64,
    pub code: String,
    pub default_executor_role: String,
    pub default_checker_role: String,
    pub output_merge_strategy: MergeStrategy,
    pub validation_criteria: Option<Value>,
}

impl TaskType {
    /// Task type with the conventional role defaults.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            id: 0,
            code: code.into(),
            default_executor_role: "writer".to_string(),
            default_checker_role: "response_checker".to_string(),
            output_merge_strategy: MergeStrategy::LastOnly,
            validation_criteria: None,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let strategy: String = row.get("output_merge_strategy")?;
        let criteria: Option<String> = row.get("validation_criteria")?;
        Ok(Self {
            id: row.get("id")?,
            code: row.get("code")?,
            default_executor_role: row.get("default_executor_role")?,
            default_checker_role: row.get("default_checker_role")?,
            output_merge_strategy: MergeStrategy::parse(&strategy),
            validation_criteria: criteria.and_then(|c| serde_json::from_str(&c).ok()),
        })
    }
}

/// Voice catalog row referenced by agents. The audio pipeline itself
/// lives outside this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsVoice {
    pub id: i64,
    pub voice_id: String,
    pub name: String,
    pub language: Option<String>,
    pub gender: Option<String>,
    pub notes: Option<String>,
}

impl Store {
    /// Insert or update a template by its natural key (`name`).
    pub fn upsert_step_template(&self, template: &StepTemplate) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO step_templates (
                     name, task_type, step_prompt, instructions, characters_step,
                     evaluation_steps, trama_steps, min_chars_trama, min_chars_story,
                     full_story_step
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(name) DO UPDATE SET
                     task_type = excluded.task_type,
                     step_prompt = excluded.step_prompt,
                     instructions = excluded.instructions,
                     characters_step = excluded.characters_step,
                     evaluation_steps = excluded.evaluation_steps,
                     trama_steps = excluded.trama_steps,
                     min_chars_trama = excluded.min_chars_trama,
                     min_chars_story = excluded.min_chars_story,
                     full_story_step = excluded.full_story_step",
                params![
                    template.name,
                    template.task_type,
                    template.step_prompt,
                    template.instructions,
                    template.characters_step,
                    template.evaluation_steps,
                    template.trama_steps,
                    template.min_chars_trama,
                    template.min_chars_story,
                    template.full_story_step,
                ],
            )?;
            let id = conn.query_row(
                "SELECT id FROM step_templates WHERE name = ?1",
                params![template.name],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// Fetch a template by name.
    pub fn step_template_by_name(&self, name: &str) -> Result<StepTemplate> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM step_templates WHERE name = ?1",
                params![name],
                StepTemplate::from_row,
            )
            .optional()?
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "step template",
                name: name.to_string(),
            })
        })
    }

    /// Insert or update a task type by its natural key (`code`).
    pub fn upsert_task_type(&self, task_type: &TaskType) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_types (
                     code, default_executor_role, default_checker_role,
                     output_merge_strategy, validation_criteria
                 ) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(code) DO UPDATE SET
                     default_executor_role = excluded.default_executor_role,
                     default_checker_role = excluded.default_checker_role,
                     output_merge_strategy = excluded.output_merge_strategy,
                     validation_criteria = excluded.validation_criteria",
                params![
                    task_type.code,
                    task_type.default_executor_role,
                    task_type.default_checker_role,
                    task_type.output_merge_strategy.as_str(),
                    task_type.validation_criteria.as_ref().map(|c| c.to_string()),
                ],
            )?;
            let id = conn.query_row(
                "SELECT id FROM task_types WHERE code = ?1",
                params![task_type.code],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// Fetch a task type by code.
    pub fn task_type_by_code(&self, code: &str) -> Result<TaskType> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM task_types WHERE code = ?1",
                params![code],
                TaskType::from_row,
            )
            .optional()?
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "task type",
                name: code.to_string(),
            })
        })
    }

    /// Insert or update a voice by its natural key (`voice_id`).
    pub fn upsert_tts_voice(&self, voice: &TtsVoice) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tts_voices (voice_id, name, language, gender, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(voice_id) DO UPDATE SET
                     name = excluded.name,
                     language = excluded.language,
                     gender = excluded.gender,
                     notes = excluded.notes",
                params![
                    voice.voice_id,
                    voice.name,
                    voice.language,
                    voice.gender,
                    voice.notes,
                ],
            )?;
            let id = conn.query_row(
                "SELECT id FROM tts_voices WHERE voice_id = ?1",
                params![voice.voice_id],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_strategy_parse() {
        assert_eq!(
            MergeStrategy::parse("accumulate_chapters"),
            MergeStrategy::AccumulateChapters
        );
        assert_eq!(MergeStrategy::parse("last_only"), MergeStrategy::LastOnly);
        assert_eq!(MergeStrategy::parse("unknown"), MergeStrategy::LastOnly);
    }

    #[test]
    fn test_csv_steps() {
        assert_eq!(StepTemplate::csv_steps(Some("2, 4,6")), vec![2, 4, 6]);
        assert_eq!(StepTemplate::csv_steps(Some("")), Vec::<i64>::new());
        assert_eq!(StepTemplate::csv_steps(None), Vec::<i64>::new());
    }

    #[test]
    fn test_template_upsert_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut template = StepTemplate::new("story_3", "1. Outline\n2. Characters\n3. Chapter");
        template.trama_steps = Some("1".into());
        template.min_chars_trama = 100;
        template.min_chars_story = 500;
        template.characters_step = Some(2);

        let id1 = store.upsert_step_template(&template).unwrap();
        template.min_chars_story = 800;
        let id2 = store.upsert_step_template(&template).unwrap();
        assert_eq!(id1, id2);

        let loaded = store.step_template_by_name("story_3").unwrap();
        assert_eq!(loaded.min_chars_story, 800);
        assert_eq!(loaded.trama_step_numbers(), vec![1]);
        assert_eq!(loaded.characters_step, Some(2));
    }

    #[test]
    fn test_task_type_upsert_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut task_type = TaskType::new("story_generation");
        task_type.output_merge_strategy = MergeStrategy::AccumulateChapters;
        task_type.validation_criteria = Some(serde_json::json!({"min_len": 10}));

        store.upsert_task_type(&task_type).unwrap();
        let loaded = store.task_type_by_code("story_generation").unwrap();
        assert_eq!(
            loaded.output_merge_strategy,
            MergeStrategy::AccumulateChapters
        );
        assert_eq!(loaded.validation_criteria.unwrap()["min_len"], 10);
        assert_eq!(loaded.default_executor_role, "writer");
    }

    #[test]
    fn test_missing_template_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.step_template_by_name("absent").is_err());
    }

    #[test]
    fn test_voice_upsert_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let voice = TtsVoice {
            id: 0,
            voice_id: "v-001".into(),
            name: "Aria".into(),
            language: Some("en".into()),
            gender: None,
            notes: None,
        };
        let id1 = store.upsert_tts_voice(&voice).unwrap();
        let id2 = store.upsert_tts_voice(&voice).unwrap();
        assert_eq!(id1, id2);
    }
}
