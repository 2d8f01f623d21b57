//! Story evaluations, chunk facts, coherence aggregates, and test
//! runs feeding the model score table.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::Store;

/// One evaluator verdict over a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryEvaluation {
    pub id: i64,
    pub story_id: i64,
    pub agent_id: Option<i64>,
    pub model_id: Option<i64>,
    pub narrative_coherence: i64,
    pub narrative_coherence_defects: Option<String>,
    pub originality: i64,
    pub originality_defects: Option<String>,
    pub emotional_impact: i64,
    pub emotional_impact_defects: Option<String>,
    pub action: i64,
    pub action_defects: Option<String>,
    pub total_score: f64,
    pub raw_json: String,
    pub ts: String,
}

impl StoryEvaluation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            story_id: row.get("story_id")?,
            agent_id: row.get("agent_id")?,
            model_id: row.get("model_id")?,
            narrative_coherence: row.get("narrative_coherence")?,
            narrative_coherence_defects: row.get("narrative_coherence_defects")?,
            originality: row.get("originality")?,
            originality_defects: row.get("originality_defects")?,
            emotional_impact: row.get("emotional_impact")?,
            emotional_impact_defects: row.get("emotional_impact_defects")?,
            action: row.get("action")?,
            action_defects: row.get("action_defects")?,
            total_score: row.get("total_score")?,
            raw_json: row.get("raw_json")?,
            ts: row.get("ts")?,
        })
    }
}

/// Aggregated coherence for one story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalCoherence {
    pub id: i64,
    pub story_id: i64,
    /// In `[0, 1]`.
    pub global_coherence_value: f64,
    pub chunk_count: i64,
    pub notes: Option<String>,
    pub ts: String,
}

/// Extracted facts for one chunk of a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFacts {
    pub story_id: i64,
    pub chunk_number: i64,
    pub facts_json: String,
}

/// Recompute the creator model's writer score from every evaluation
/// of its stories: `sum(total_score) * 10 / (count * 100)`.
///
/// The writer score is a derived aggregate; it does not enter the
/// model's per-category `total_score`.
pub(crate) fn recompute_writer_score(conn: &Connection, model_id: i64) -> Result<()> {
    let (sum, count): (f64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(e.total_score), 0), COUNT(e.id)
         FROM story_evaluations e
         JOIN stories s ON s.id = e.story_id
         WHERE s.model_id = ?1",
        params![model_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let score = if count == 0 {
        0.0
    } else {
        (sum * 10.0) / (count as f64 * 100.0)
    };
    conn.execute(
        "UPDATE models SET writer_score = ?1 WHERE id = ?2",
        params![score, model_id],
    )?;
    Ok(())
}

impl Store {
    /// Insert an evaluation, deduplicating on
    /// `(story_id, agent_id, raw_json)`.
    ///
    /// Returns `(row_id, inserted)`; a duplicate returns the existing
    /// row id with `inserted = false` and leaves scores untouched.
    /// On a real insert the creator model's writer score is recomputed
    /// in the same transaction.
    pub fn insert_story_evaluation(&self, eval: &StoryEvaluation) -> Result<(i64, bool)> {
        self.with_tx(|tx| {
            if let Some(agent_id) = eval.agent_id {
                if !eval.raw_json.is_empty() {
                    let existing: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM story_evaluations
                             WHERE story_id = ?1 AND agent_id = ?2 AND raw_json = ?3",
                            params![eval.story_id, agent_id, eval.raw_json],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if let Some(id) = existing {
                        return Ok((id, false));
                    }
                }
            }

            tx.execute(
                "INSERT INTO story_evaluations (
                     story_id, agent_id, model_id,
                     narrative_coherence, narrative_coherence_defects,
                     originality, originality_defects,
                     emotional_impact, emotional_impact_defects,
                     action, action_defects,
                     total_score, raw_json, ts
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    eval.story_id,
                    eval.agent_id,
                    eval.model_id,
                    eval.narrative_coherence,
                    eval.narrative_coherence_defects,
                    eval.originality,
                    eval.originality_defects,
                    eval.emotional_impact,
                    eval.emotional_impact_defects,
                    eval.action,
                    eval.action_defects,
                    eval.total_score,
                    eval.raw_json,
                    eval.ts,
                ],
            )?;
            let id = tx.last_insert_rowid();

            let creator: Option<i64> = tx.query_row(
                "SELECT model_id FROM stories WHERE id = ?1",
                params![eval.story_id],
                |row| row.get(0),
            )?;
            if let Some(model_id) = creator {
                recompute_writer_score(tx, model_id)?;
            }
            Ok((id, true))
        })
    }

    /// Every evaluation of a story, in insertion order.
    pub fn evaluations_for_story(&self, story_id: i64) -> Result<Vec<StoryEvaluation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM story_evaluations WHERE story_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![story_id], StoryEvaluation::from_row)?;
            let mut evals = Vec::new();
            for row in rows {
                evals.push(row?);
            }
            Ok(evals)
        })
    }

    /// Delete every evaluation of a story and recompute the creator's
    /// writer score, in one transaction.
    pub fn delete_evaluations_for_story(&self, story_id: i64) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM story_evaluations WHERE story_id = ?1",
                params![story_id],
            )?;
            let creator: Option<i64> = tx.query_row(
                "SELECT model_id FROM stories WHERE id = ?1",
                params![story_id],
                |row| row.get(0),
            )?;
            if let Some(model_id) = creator {
                recompute_writer_score(tx, model_id)?;
            }
            Ok(())
        })
    }

    /// Upsert the single coherence aggregate of a story.
    pub fn upsert_global_coherence(
        &self,
        story_id: i64,
        value: f64,
        chunk_count: i64,
        notes: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO global_coherence
                     (story_id, global_coherence_value, chunk_count, notes, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(story_id) DO UPDATE SET
                     global_coherence_value = excluded.global_coherence_value,
                     chunk_count = excluded.chunk_count,
                     notes = excluded.notes,
                     ts = excluded.ts",
                params![story_id, value.clamp(0.0, 1.0), chunk_count, notes, Store::now()],
            )?;
            Ok(())
        })
    }

    /// The coherence aggregate of a story, if computed.
    pub fn global_coherence_for_story(&self, story_id: i64) -> Result<Option<GlobalCoherence>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM global_coherence WHERE story_id = ?1",
                    params![story_id],
                    |row| {
                        Ok(GlobalCoherence {
                            id: row.get("id")?,
                            story_id: row.get("story_id")?,
                            global_coherence_value: row.get("global_coherence_value")?,
                            chunk_count: row.get("chunk_count")?,
                            notes: row.get("notes")?,
                            ts: row.get("ts")?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Upsert the extracted facts of one chunk.
    pub fn upsert_chunk_facts(&self, facts: &ChunkFacts) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chunk_facts (story_id, chunk_number, facts_json)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(story_id, chunk_number) DO UPDATE SET
                     facts_json = excluded.facts_json",
                params![facts.story_id, facts.chunk_number, facts.facts_json],
            )?;
            Ok(())
        })
    }

    /// Facts for every chunk of a story, ordered by chunk number.
    pub fn chunk_facts_for_story(&self, story_id: i64) -> Result<Vec<ChunkFacts>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT story_id, chunk_number, facts_json FROM chunk_facts
                 WHERE story_id = ?1 ORDER BY chunk_number ASC",
            )?;
            let rows = stmt.query_map(params![story_id], |row| {
                Ok(ChunkFacts {
                    story_id: row.get(0)?,
                    chunk_number: row.get(1)?,
                    facts_json: row.get(2)?,
                })
            })?;
            let mut facts = Vec::new();
            for row in rows {
                facts.push(row?);
            }
            Ok(facts)
        })
    }

    /// Record one test run for a model/group.
    pub fn record_test_run(
        &self,
        model_id: i64,
        test_group: &str,
        passed: i64,
        total: i64,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO model_test_runs (model_id, test_group, passed, total, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![model_id, test_group, passed, total, Store::now()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// `(passed, total)` of the latest run for a model/group.
    pub fn latest_test_run(&self, model_id: i64, test_group: &str) -> Result<Option<(i64, i64)>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT passed, total FROM model_test_runs
                     WHERE model_id = ?1 AND test_group = ?2
                     ORDER BY id DESC LIMIT 1",
                    params![model_id, test_group],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })
    }
}
