//! SQLite persistence layer.
//!
//! One relational store holds every entity the core reads or writes.
//! All access goes through a single [`Store`] handle: a
//! `parking_lot::Mutex` around the connection serializes the write
//! lane, foreign keys are enforced at connection level, and multi-row
//! logical operations run inside one transaction.
//!
//! Upserts are expressed as `ON CONFLICT ... DO UPDATE` on the natural
//! keys: `models.name`, `agents.name`, `step_templates.name`,
//! `task_types.code`, `story_statuses.code`, `tts_voices.voice_id`,
//! `numerator_state.key`, `usage_state.month`,
//! `global_coherence.story_id`.

pub mod agent;
pub mod evaluation;
pub mod execution;
pub mod model;
pub mod response_log;
pub mod story;
pub mod template;
pub mod usage;

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};

use crate::error::Result;

pub use agent::Agent;
pub use evaluation::{ChunkFacts, GlobalCoherence, StoryEvaluation};
pub use execution::{ExecutionStatus, NewExecution, TaskExecution, TaskExecutionStep};
pub use model::Model;
pub use response_log::{CallResult, ModelResponseLog, ResponseLogWriter};
pub use story::{GenerationFlag, StoryRecord, StoryStatus};
pub use template::{MergeStrategy, StepTemplate, TaskType, TtsVoice};
pub use usage::UsageState;

/// Shared SQLite store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the store at `path` and bootstrap the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a read or single-statement write against the connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a multi-statement logical operation in one transaction.
    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Current UTC timestamp, ISO-8601 with second precision.
    pub fn now() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS models (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    provider TEXT NOT NULL DEFAULT '',
    endpoint TEXT NOT NULL DEFAULT '',
    is_local INTEGER NOT NULL DEFAULT 0,
    max_context INTEGER NOT NULL DEFAULT 8192,
    context_to_use INTEGER NOT NULL DEFAULT 0,
    input_token_cost REAL NOT NULL DEFAULT 0,
    output_token_cost REAL NOT NULL DEFAULT 0,
    daily_token_limit INTEGER NOT NULL DEFAULT 0,
    weekly_token_limit INTEGER NOT NULL DEFAULT 0,
    monthly_token_limit INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    no_tools INTEGER NOT NULL DEFAULT 0,
    note TEXT,
    metadata TEXT,
    function_calling_score REAL NOT NULL DEFAULT 0,
    writer_score REAL NOT NULL DEFAULT 0,
    base_score REAL NOT NULL DEFAULT 0,
    texteval_score REAL NOT NULL DEFAULT 0,
    tts_score REAL NOT NULL DEFAULT 0,
    music_score REAL NOT NULL DEFAULT 0,
    fx_score REAL NOT NULL DEFAULT 0,
    ambient_score REAL NOT NULL DEFAULT 0,
    total_score REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS step_templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    task_type TEXT NOT NULL DEFAULT '',
    step_prompt TEXT NOT NULL,
    instructions TEXT NOT NULL DEFAULT '',
    characters_step INTEGER,
    evaluation_steps TEXT,
    trama_steps TEXT,
    min_chars_trama INTEGER NOT NULL DEFAULT 0,
    min_chars_story INTEGER NOT NULL DEFAULT 0,
    full_story_step INTEGER
);

CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL,
    model_id INTEGER REFERENCES models(id) ON DELETE SET NULL,
    temperature REAL,
    top_p REAL,
    repeat_penalty REAL,
    top_k INTEGER,
    repeat_last_n INTEGER,
    num_predict INTEGER,
    prompt TEXT NOT NULL DEFAULT '',
    instructions TEXT NOT NULL DEFAULT '',
    skills TEXT,
    multi_step_template_id INTEGER REFERENCES step_templates(id) ON DELETE SET NULL,
    voice_id TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    notes TEXT
);

CREATE TABLE IF NOT EXISTS task_types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    default_executor_role TEXT NOT NULL DEFAULT 'writer',
    default_checker_role TEXT NOT NULL DEFAULT 'response_checker',
    output_merge_strategy TEXT NOT NULL DEFAULT 'last_only',
    validation_criteria TEXT
);

CREATE TABLE IF NOT EXISTS task_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL,
    entity_id INTEGER,
    step_prompt TEXT NOT NULL,
    initial_context TEXT,
    current_step INTEGER NOT NULL DEFAULT 0,
    max_step INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    executor_agent_id INTEGER REFERENCES agents(id) ON DELETE SET NULL,
    checker_agent_id INTEGER REFERENCES agents(id) ON DELETE SET NULL,
    config TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_task_executions_active
    ON task_executions(entity_id, task_type)
    WHERE status IN ('pending', 'in_progress');

CREATE TABLE IF NOT EXISTS task_execution_steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id INTEGER NOT NULL REFERENCES task_executions(id) ON DELETE CASCADE,
    step_number INTEGER NOT NULL,
    step_instruction TEXT NOT NULL,
    step_output TEXT NOT NULL DEFAULT '',
    validation_result TEXT,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_execution_steps_execution
    ON task_execution_steps(execution_id, step_number);

CREATE TABLE IF NOT EXISTS story_statuses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    step INTEGER NOT NULL DEFAULT 0,
    description TEXT NOT NULL DEFAULT '',
    operation_type TEXT,
    agent_type TEXT,
    function_name TEXT,
    caption_to_execute TEXT
);

CREATE TABLE IF NOT EXISTS stories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    story_id INTEGER,
    generation_id TEXT,
    memory_key TEXT,
    timestamp TEXT NOT NULL,
    prompt TEXT,
    story_raw TEXT NOT NULL DEFAULT '',
    story_revised TEXT,
    story_tagged TEXT,
    story_tagged_version INTEGER,
    formatter_model_id INTEGER REFERENCES models(id) ON DELETE SET NULL,
    formatter_prompt_hash TEXT,
    characters TEXT,
    story_structure TEXT,
    summary TEXT,
    title TEXT,
    char_count INTEGER NOT NULL DEFAULT 0,
    eval TEXT,
    score REAL,
    approved INTEGER NOT NULL DEFAULT 0,
    status_id INTEGER REFERENCES story_statuses(id) ON DELETE SET NULL,
    folder TEXT,
    model_id INTEGER REFERENCES models(id) ON DELETE SET NULL,
    agent_id INTEGER REFERENCES agents(id) ON DELETE SET NULL,
    serie_id INTEGER,
    serie_episode INTEGER,
    tts_json INTEGER NOT NULL DEFAULT 0,
    tts INTEGER NOT NULL DEFAULT 0,
    ambient INTEGER NOT NULL DEFAULT 0,
    music INTEGER NOT NULL DEFAULT 0,
    effects INTEGER NOT NULL DEFAULT 0,
    mixed_audio INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS story_evaluations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    story_id INTEGER NOT NULL REFERENCES stories(id) ON DELETE CASCADE,
    agent_id INTEGER REFERENCES agents(id) ON DELETE SET NULL,
    model_id INTEGER REFERENCES models(id) ON DELETE SET NULL,
    narrative_coherence INTEGER NOT NULL DEFAULT 0,
    narrative_coherence_defects TEXT,
    originality INTEGER NOT NULL DEFAULT 0,
    originality_defects TEXT,
    emotional_impact INTEGER NOT NULL DEFAULT 0,
    emotional_impact_defects TEXT,
    action INTEGER NOT NULL DEFAULT 0,
    action_defects TEXT,
    total_score REAL NOT NULL DEFAULT 0,
    raw_json TEXT NOT NULL DEFAULT '',
    ts TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_story_evaluations_story
    ON story_evaluations(story_id);

CREATE TABLE IF NOT EXISTS global_coherence (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    story_id INTEGER NOT NULL UNIQUE REFERENCES stories(id) ON DELETE CASCADE,
    global_coherence_value REAL NOT NULL DEFAULT 0,
    chunk_count INTEGER NOT NULL DEFAULT 0,
    notes TEXT,
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunk_facts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    story_id INTEGER NOT NULL REFERENCES stories(id) ON DELETE CASCADE,
    chunk_number INTEGER NOT NULL,
    facts_json TEXT NOT NULL,
    UNIQUE(story_id, chunk_number)
);

CREATE TABLE IF NOT EXISTS model_response_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id TEXT NOT NULL,
    agent_name TEXT,
    model_name TEXT NOT NULL,
    request_json TEXT,
    response_json TEXT,
    result TEXT,
    fail_reason TEXT,
    examined INTEGER NOT NULL DEFAULT 0,
    ts TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_model_response_log_thread
    ON model_response_log(thread_id, id);

CREATE TABLE IF NOT EXISTS usage_state (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    month TEXT NOT NULL UNIQUE,
    tokens_this_run INTEGER NOT NULL DEFAULT 0,
    tokens_this_month INTEGER NOT NULL DEFAULT 0,
    cost_this_month REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS numerator_state (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    value INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS role_fallback (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    role TEXT NOT NULL,
    model_id INTEGER NOT NULL REFERENCES models(id) ON DELETE CASCADE,
    priority INTEGER NOT NULL DEFAULT 0,
    UNIQUE(role, model_id)
);

CREATE TABLE IF NOT EXISTS model_role_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    role TEXT NOT NULL,
    model_id INTEGER NOT NULL REFERENCES models(id) ON DELETE CASCADE,
    successes INTEGER NOT NULL DEFAULT 0,
    failures INTEGER NOT NULL DEFAULT 0,
    UNIQUE(role, model_id)
);

CREATE TABLE IF NOT EXISTS model_test_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_id INTEGER NOT NULL REFERENCES models(id) ON DELETE CASCADE,
    test_group TEXT NOT NULL,
    passed INTEGER NOT NULL DEFAULT 0,
    total INTEGER NOT NULL DEFAULT 0,
    ts TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_model_test_runs_group
    ON model_test_runs(model_id, test_group);

CREATE TABLE IF NOT EXISTS tts_voices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    voice_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL DEFAULT '',
    language TEXT,
    gender TEXT,
    notes TEXT
);
"#;
