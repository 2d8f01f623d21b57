//! Model catalog rows: CRUD, score recomputation, role fallback
//! rankings, and per-role success/failure counters.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

use super::Store;

/// One catalog entry for a chat-completion model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: i64,
    pub name: String,
    pub provider: String,
    pub endpoint: String,
    pub is_local: bool,
    pub max_context: i64,
    pub context_to_use: i64,
    pub input_token_cost: f64,
    pub output_token_cost: f64,
    pub daily_token_limit: i64,
    pub weekly_token_limit: i64,
    pub monthly_token_limit: i64,
    pub enabled: bool,
    pub no_tools: bool,
    pub note: Option<String>,
    pub metadata: Option<Value>,
    pub function_calling_score: f64,
    pub writer_score: f64,
    pub base_score: f64,
    pub texteval_score: f64,
    pub tts_score: f64,
    pub music_score: f64,
    pub fx_score: f64,
    pub ambient_score: f64,
    /// Always the sum of the six per-category scores; recomputed
    /// inside every write that touches them. The derived
    /// `writer_score` stays out of the sum.
    pub total_score: f64,
}

impl Model {
    /// Minimal model with a name and endpoint, everything else default.
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            provider: String::new(),
            endpoint: endpoint.into(),
            is_local: false,
            max_context: 8192,
            context_to_use: 0,
            input_token_cost: 0.0,
            output_token_cost: 0.0,
            daily_token_limit: 0,
            weekly_token_limit: 0,
            monthly_token_limit: 0,
            enabled: true,
            no_tools: false,
            note: None,
            metadata: None,
            function_calling_score: 0.0,
            writer_score: 0.0,
            base_score: 0.0,
            texteval_score: 0.0,
            tts_score: 0.0,
            music_score: 0.0,
            fx_score: 0.0,
            ambient_score: 0.0,
            total_score: 0.0,
        }
    }

    /// Sum of the six per-category scores.
    pub fn category_total(&self) -> f64 {
        self.base_score
            + self.texteval_score
            + self.tts_score
            + self.music_score
            + self.fx_score
            + self.ambient_score
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let metadata: Option<String> = row.get("metadata")?;
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            provider: row.get("provider")?,
            endpoint: row.get("endpoint")?,
            is_local: row.get("is_local")?,
            max_context: row.get("max_context")?,
            context_to_use: row.get("context_to_use")?,
            input_token_cost: row.get("input_token_cost")?,
            output_token_cost: row.get("output_token_cost")?,
            daily_token_limit: row.get("daily_token_limit")?,
            weekly_token_limit: row.get("weekly_token_limit")?,
            monthly_token_limit: row.get("monthly_token_limit")?,
            enabled: row.get("enabled")?,
            no_tools: row.get("no_tools")?,
            note: row.get("note")?,
            metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
            function_calling_score: row.get("function_calling_score")?,
            writer_score: row.get("writer_score")?,
            base_score: row.get("base_score")?,
            texteval_score: row.get("texteval_score")?,
            tts_score: row.get("tts_score")?,
            music_score: row.get("music_score")?,
            fx_score: row.get("fx_score")?,
            ambient_score: row.get("ambient_score")?,
            total_score: row.get("total_score")?,
        })
    }
}

/// Recompute `total_score` from the six per-category columns, inside
/// the caller's transaction or connection.
pub(crate) fn recompute_total_score(conn: &Connection, model_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE models SET total_score =
             base_score + texteval_score + tts_score +
             music_score + fx_score + ambient_score
         WHERE id = ?1",
        params![model_id],
    )?;
    Ok(())
}

impl Store {
    /// Insert or update a model by its natural key (`name`).
    ///
    /// Returns the row id. `total_score` is recomputed in the same
    /// transaction.
    pub fn upsert_model(&self, model: &Model) -> Result<i64> {
        self.with_tx(|tx| {
            let metadata = model
                .metadata
                .as_ref()
                .map(|m| m.to_string());
            tx.execute(
                "INSERT INTO models (
                     name, provider, endpoint, is_local, max_context, context_to_use,
                     input_token_cost, output_token_cost,
                     daily_token_limit, weekly_token_limit, monthly_token_limit,
                     enabled, no_tools, note, metadata,
                     function_calling_score, writer_score, base_score, texteval_score,
                     tts_score, music_score, fx_score, ambient_score
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                           ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
                 ON CONFLICT(name) DO UPDATE SET
                     provider = excluded.provider,
                     endpoint = excluded.endpoint,
                     is_local = excluded.is_local,
                     max_context = excluded.max_context,
                     context_to_use = excluded.context_to_use,
                     input_token_cost = excluded.input_token_cost,
                     output_token_cost = excluded.output_token_cost,
                     daily_token_limit = excluded.daily_token_limit,
                     weekly_token_limit = excluded.weekly_token_limit,
                     monthly_token_limit = excluded.monthly_token_limit,
                     enabled = excluded.enabled,
                     no_tools = excluded.no_tools,
                     note = excluded.note,
                     metadata = excluded.metadata",
                params![
                    model.name,
                    model.provider,
                    model.endpoint,
                    model.is_local,
                    model.max_context,
                    model.context_to_use,
                    model.input_token_cost,
                    model.output_token_cost,
                    model.daily_token_limit,
                    model.weekly_token_limit,
                    model.monthly_token_limit,
                    model.enabled,
                    model.no_tools,
                    model.note,
                    metadata,
                    model.function_calling_score,
                    model.writer_score,
                    model.base_score,
                    model.texteval_score,
                    model.tts_score,
                    model.music_score,
                    model.fx_score,
                    model.ambient_score,
                ],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM models WHERE name = ?1",
                params![model.name],
                |row| row.get(0),
            )?;
            recompute_total_score(tx, id)?;
            Ok(id)
        })
    }

    /// Fetch a model by id.
    pub fn model_by_id(&self, id: i64) -> Result<Model> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM models WHERE id = ?1",
                params![id],
                Model::from_row,
            )
            .optional()?
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "model",
                name: id.to_string(),
            })
        })
    }

    /// Fetch a model by name.
    pub fn model_by_name(&self, name: &str) -> Result<Model> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM models WHERE name = ?1",
                params![name],
                Model::from_row,
            )
            .optional()?
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "model",
                name: name.to_string(),
            })
        })
    }

    /// Overwrite one per-category score and recompute the total, in
    /// one transaction. `writer_score` is derived from evaluations and
    /// is not settable here.
    pub fn set_model_category_score(
        &self,
        model_id: i64,
        category: &str,
        score: f64,
    ) -> Result<()> {
        let column = match category {
            "base" => "base_score",
            "texteval" => "texteval_score",
            "tts" => "tts_score",
            "music" => "music_score",
            "fx" => "fx_score",
            "ambient" => "ambient_score",
            other => {
                return Err(OrchestratorError::NotFound {
                    kind: "score category",
                    name: other.to_string(),
                })
            }
        };
        self.with_tx(|tx| {
            let changed = tx.execute(
                &format!("UPDATE models SET {column} = ?1 WHERE id = ?2"),
                params![score, model_id],
            )?;
            if changed == 0 {
                return Err(OrchestratorError::NotFound {
                    kind: "model",
                    name: model_id.to_string(),
                });
            }
            recompute_total_score(tx, model_id)?;
            Ok(())
        })
    }

    /// Overwrite the function-calling score.
    pub fn set_function_calling_score(&self, model_id: i64, score: f64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE models SET function_calling_score = ?1 WHERE id = ?2",
                params![score, model_id],
            )?;
            Ok(())
        })
    }

    /// Replace the ranked fallback list for a role.
    pub fn set_role_fallbacks(&self, role: &str, ranked_model_ids: &[i64]) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM role_fallback WHERE role = ?1", params![role])?;
            for (priority, model_id) in ranked_model_ids.iter().enumerate() {
                tx.execute(
                    "INSERT INTO role_fallback (role, model_id, priority) VALUES (?1, ?2, ?3)",
                    params![role, model_id, priority as i64],
                )?;
            }
            Ok(())
        })
    }

    /// Enabled fallback models for a role, in priority order.
    pub fn fallback_models_for_role(&self, role: &str) -> Result<Vec<Model>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.* FROM role_fallback rf
                 JOIN models m ON m.id = rf.model_id
                 WHERE rf.role = ?1 AND m.enabled = 1
                 ORDER BY rf.priority ASC",
            )?;
            let rows = stmt.query_map(params![role], Model::from_row)?;
            let mut models = Vec::new();
            for row in rows {
                models.push(row?);
            }
            Ok(models)
        })
    }

    /// Record a success or failure for `(role, model)`.
    pub fn record_role_outcome(&self, role: &str, model_id: i64, success: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO model_role_stats (role, model_id, successes, failures)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(role, model_id) DO UPDATE SET
                     successes = successes + excluded.successes,
                     failures = failures + excluded.failures",
                params![role, model_id, success as i64, (!success) as i64],
            )?;
            Ok(())
        })
    }

    /// `(successes, failures)` for `(role, model)`.
    pub fn role_outcome_counts(&self, role: &str, model_id: i64) -> Result<(i64, i64)> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT successes, failures FROM model_role_stats
                     WHERE role = ?1 AND model_id = ?2",
                    params![role, model_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .unwrap_or((0, 0)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let model = Model::new("gpt-4o", "https://api.openai.com");
        let id1 = store.upsert_model(&model).unwrap();
        let id2 = store.upsert_model(&model).unwrap();
        assert_eq!(id1, id2);

        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn
                    .query_row("SELECT COUNT(*) FROM models", [], |row| row.get(0))
                    .unwrap())
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_upsert_updates_fields() {
        let store = Store::open_in_memory().unwrap();
        let mut model = Model::new("llama3.3", "http://localhost:11434");
        store.upsert_model(&model).unwrap();

        model.is_local = true;
        model.no_tools = true;
        let id = store.upsert_model(&model).unwrap();

        let loaded = store.model_by_id(id).unwrap();
        assert!(loaded.is_local);
        assert!(loaded.no_tools);
    }

    #[test]
    fn test_total_score_is_sum_of_categories() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .upsert_model(&Model::new("m1", "http://x"))
            .unwrap();

        store.set_model_category_score(id, "base", 9.0).unwrap();
        store.set_model_category_score(id, "tts", 5.5).unwrap();
        store.set_model_category_score(id, "ambient", 6.0).unwrap();

        let model = store.model_by_id(id).unwrap();
        assert!((model.total_score - (9.0 + 5.5 + 6.0)).abs() < 1e-9);
        assert!((model.total_score - model.category_total()).abs() < 1e-9);
    }

    #[test]
    fn test_writer_score_stays_out_of_total() {
        let store = Store::open_in_memory().unwrap();
        let id = store.upsert_model(&Model::new("m1", "http://x")).unwrap();
        store.set_model_category_score(id, "base", 9.0).unwrap();

        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE models SET writer_score = 7.8 WHERE id = ?1",
                    params![id],
                )?;
                recompute_total_score(conn, id)?;
                Ok(())
            })
            .unwrap();

        let model = store.model_by_id(id).unwrap();
        assert_eq!(model.writer_score, 7.8);
        assert!((model.total_score - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_category_rejected() {
        let store = Store::open_in_memory().unwrap();
        let id = store.upsert_model(&Model::new("m1", "http://x")).unwrap();
        assert!(store.set_model_category_score(id, "bogus", 1.0).is_err());
        // The derived writer aggregate is not settable as a category.
        assert!(store.set_model_category_score(id, "writer", 1.0).is_err());
    }

    #[test]
    fn test_fallback_ranking_order() {
        let store = Store::open_in_memory().unwrap();
        let m1 = store.upsert_model(&Model::new("m1", "http://x")).unwrap();
        let m2 = store.upsert_model(&Model::new("m2", "http://x")).unwrap();
        let m3 = store.upsert_model(&Model::new("m3", "http://x")).unwrap();

        store.set_role_fallbacks("writer", &[m2, m3, m1]).unwrap();
        let ranked = store.fallback_models_for_role("writer").unwrap();
        let names: Vec<&str> = ranked.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["m2", "m3", "m1"]);
    }

    #[test]
    fn test_fallback_skips_disabled_models() {
        let store = Store::open_in_memory().unwrap();
        let m1 = store.upsert_model(&Model::new("m1", "http://x")).unwrap();
        let mut disabled = Model::new("m2", "http://x");
        disabled.enabled = false;
        let m2 = store.upsert_model(&disabled).unwrap();

        store.set_role_fallbacks("writer", &[m2, m1]).unwrap();
        let ranked = store.fallback_models_for_role("writer").unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name, "m1");
    }

    #[test]
    fn test_role_outcome_counters_accumulate() {
        let store = Store::open_in_memory().unwrap();
        let id = store.upsert_model(&Model::new("m1", "http://x")).unwrap();

        store.record_role_outcome("writer", id, true).unwrap();
        store.record_role_outcome("writer", id, false).unwrap();
        store.record_role_outcome("writer", id, true).unwrap();

        assert_eq!(store.role_outcome_counts("writer", id).unwrap(), (2, 1));
        assert_eq!(store.role_outcome_counts("tts_json", id).unwrap(), (0, 0));
    }

    #[test]
    fn test_metadata_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut model = Model::new("m1", "http://x");
        model.metadata = Some(serde_json::json!({"no_max_tokens": true}));
        let id = store.upsert_model(&model).unwrap();
        let loaded = store.model_by_id(id).unwrap();
        assert_eq!(loaded.metadata.unwrap()["no_max_tokens"], true);
    }
}
