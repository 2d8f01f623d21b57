//! Agent rows: named executor configurations bound to a model.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

use super::Store;

/// A named executor role configuration.
///
/// An agent pairs a role with the model it runs on, its sampling
/// parameters, and its system prompt material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub role: String,
    pub model_id: Option<i64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub repeat_penalty: Option<f64>,
    pub top_k: Option<i64>,
    pub repeat_last_n: Option<i64>,
    pub num_predict: Option<i64>,
    pub prompt: String,
    pub instructions: String,
    pub skills: Option<String>,
    pub multi_step_template_id: Option<i64>,
    pub voice_id: Option<String>,
    pub is_active: bool,
    pub notes: Option<String>,
}

impl Agent {
    /// Minimal agent with a name and role.
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            role: role.into(),
            model_id: None,
            temperature: None,
            top_p: None,
            repeat_penalty: None,
            top_k: None,
            repeat_last_n: None,
            num_predict: None,
            prompt: String::new(),
            instructions: String::new(),
            skills: None,
            multi_step_template_id: None,
            voice_id: None,
            is_active: true,
            notes: None,
        }
    }

    /// System text for this agent: prompt plus instructions.
    pub fn system_text(&self) -> String {
        if self.instructions.is_empty() {
            self.prompt.clone()
        } else if self.prompt.is_empty() {
            self.instructions.clone()
        } else {
            format!("{}\n\n{}", self.prompt, self.instructions)
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            role: row.get("role")?,
            model_id: row.get("model_id")?,
            temperature: row.get("temperature")?,
            top_p: row.get("top_p")?,
            repeat_penalty: row.get("repeat_penalty")?,
            top_k: row.get("top_k")?,
            repeat_last_n: row.get("repeat_last_n")?,
            num_predict: row.get("num_predict")?,
            prompt: row.get("prompt")?,
            instructions: row.get("instructions")?,
            skills: row.get("skills")?,
            multi_step_template_id: row.get("multi_step_template_id")?,
            voice_id: row.get("voice_id")?,
            is_active: row.get("is_active")?,
            notes: row.get("notes")?,
        })
    }
}

impl Store {
    /// Insert or update an agent by its natural key (`name`).
    pub fn upsert_agent(&self, agent: &Agent) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agents (
                     name, role, model_id, temperature, top_p, repeat_penalty,
                     top_k, repeat_last_n, num_predict, prompt, instructions,
                     skills, multi_step_template_id, voice_id, is_active, notes
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(name) DO UPDATE SET
                     role = excluded.role,
                     model_id = excluded.model_id,
                     temperature = excluded.temperature,
                     top_p = excluded.top_p,
                     repeat_penalty = excluded.repeat_penalty,
                     top_k = excluded.top_k,
                     repeat_last_n = excluded.repeat_last_n,
                     num_predict = excluded.num_predict,
                     prompt = excluded.prompt,
                     instructions = excluded.instructions,
                     skills = excluded.skills,
                     multi_step_template_id = excluded.multi_step_template_id,
                     voice_id = excluded.voice_id,
                     is_active = excluded.is_active,
                     notes = excluded.notes",
                params![
                    agent.name,
                    agent.role,
                    agent.model_id,
                    agent.temperature,
                    agent.top_p,
                    agent.repeat_penalty,
                    agent.top_k,
                    agent.repeat_last_n,
                    agent.num_predict,
                    agent.prompt,
                    agent.instructions,
                    agent.skills,
                    agent.multi_step_template_id,
                    agent.voice_id,
                    agent.is_active,
                    agent.notes,
                ],
            )?;
            let id = conn.query_row(
                "SELECT id FROM agents WHERE name = ?1",
                params![agent.name],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// Fetch an agent by id.
    pub fn agent_by_id(&self, id: i64) -> Result<Agent> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM agents WHERE id = ?1",
                params![id],
                Agent::from_row,
            )
            .optional()?
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "agent",
                name: id.to_string(),
            })
        })
    }

    /// Fetch an agent by name.
    pub fn agent_by_name(&self, name: &str) -> Result<Agent> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM agents WHERE name = ?1",
                params![name],
                Agent::from_row,
            )
            .optional()?
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "agent",
                name: name.to_string(),
            })
        })
    }

    /// Every active agent with a role, ordered by id.
    pub fn active_agents_for_role(&self, role: &str) -> Result<Vec<Agent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM agents WHERE role = ?1 AND is_active = 1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![role], Agent::from_row)?;
            let mut agents = Vec::new();
            for row in rows {
                agents.push(row?);
            }
            Ok(agents)
        })
    }

    /// Default executor for a role: the active agent with that role,
    /// ties broken by lowest id.
    pub fn active_agent_for_role(&self, role: &str) -> Result<Agent> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM agents
                 WHERE role = ?1 AND is_active = 1
                 ORDER BY id ASC LIMIT 1",
                params![role],
                Agent::from_row,
            )
            .optional()?
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "agent role",
                name: role.to_string(),
            })
        })
    }
}
