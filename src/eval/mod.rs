//! Evaluation: per-story category scoring and score propagation.
//!
//! Evaluator agents return a JSON with four category scores and a
//! total; verdicts persist as `story_evaluations` rows (deduplicated)
//! and feed the creator model's writer score. Group scores come from
//! the latest test run per group. The chunked coherence pass lives in
//! [`coherence`].

pub mod coherence;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;

use crate::bridge::messages::ChatMessage;
use crate::bridge::{ProviderFactory, SamplingParams};
use crate::context::ScopeContext;
use crate::engine::EvaluationHook;
use crate::error::{OrchestratorError, Result};
use crate::registry::Registry;
use crate::store::{Agent, Store, StoryEvaluation};
use crate::validation::checks::extract_json_object;
use crate::validation::Validator;

pub use coherence::{chunk_story, CoherenceAnalyzer, COHERENCE_ROLE};

/// Role of the category-scoring agents.
pub const EVALUATOR_ROLE: &str = "texteval";

/// Status code a story advances to once enough evaluations exist.
pub const EVALUATED_STATUS_CODE: &str = "evaluated";

/// Distinct evaluations required for the status advance.
pub const EVALUATIONS_FOR_STATUS: usize = 2;

/// The six test-group score categories on a model row.
pub const SCORE_GROUPS: &[&str] = &["base", "texteval", "tts", "music", "fx", "ambient"];

/// One category's score and defect notes.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryScore {
    pub score: i64,
    pub defects: Option<String>,
}

/// A parsed evaluator verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvaluation {
    pub narrative_coherence: CategoryScore,
    pub originality: CategoryScore,
    pub emotional_impact: CategoryScore,
    pub action: CategoryScore,
    pub total_score: f64,
}

/// Parse an evaluator's JSON. The legacy `pacing` key is accepted as
/// an alias of `action`.
pub fn parse_evaluation(value: &Value) -> Result<ParsedEvaluation> {
    let category = |keys: &[&str]| -> Result<CategoryScore> {
        for key in keys {
            if let Some(entry) = value.get(key) {
                let score = entry
                    .get("score")
                    .and_then(Value::as_i64)
                    .or_else(|| entry.as_i64())
                    .unwrap_or(0);
                let defects = entry
                    .get("defects")
                    .and_then(Value::as_str)
                    .filter(|d| !d.is_empty())
                    .map(String::from);
                return Ok(CategoryScore { score, defects });
            }
        }
        Err(OrchestratorError::ValidationInvalid {
            needs_retry: true,
            reason: format!("evaluation missing category '{}'", keys[0]),
        })
    };

    let narrative_coherence = category(&["narrative_coherence"])?;
    let originality = category(&["originality"])?;
    let emotional_impact = category(&["emotional_impact"])?;
    let action = category(&["action", "pacing"])?;
    let total_score = value
        .get("total_score")
        .and_then(Value::as_f64)
        .ok_or_else(|| OrchestratorError::ValidationInvalid {
            needs_retry: true,
            reason: "evaluation missing total_score".to_string(),
        })?;

    Ok(ParsedEvaluation {
        narrative_coherence,
        originality,
        emotional_impact,
        action,
        total_score,
    })
}

/// Per-story evaluation runner and score recomputation.
pub struct Evaluator {
    store: Arc<Store>,
    registry: Arc<Registry>,
    validator: Arc<Validator>,
    factory: Arc<dyn ProviderFactory>,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator").finish_non_exhaustive()
    }
}

impl Evaluator {
    /// Evaluator resolving its agents through `registry`.
    pub fn new(
        store: Arc<Store>,
        registry: Arc<Registry>,
        validator: Arc<Validator>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        Self {
            store,
            registry,
            validator,
            factory,
        }
    }

    /// Record one evaluator verdict for a story.
    ///
    /// Deduplicates on `(story, agent, raw_json)`; a real insert
    /// recomputes the creator's writer score in the same transaction
    /// and advances the story status once enough evaluations exist.
    /// Returns `(row_id, inserted)`.
    pub fn record_evaluation(
        &self,
        story_row_id: i64,
        agent_id: Option<i64>,
        model_id: Option<i64>,
        raw: &Value,
    ) -> Result<(i64, bool)> {
        let parsed = parse_evaluation(raw)?;
        let eval = StoryEvaluation {
            id: 0,
            story_id: story_row_id,
            agent_id,
            model_id,
            narrative_coherence: parsed.narrative_coherence.score,
            narrative_coherence_defects: parsed.narrative_coherence.defects,
            originality: parsed.originality.score,
            originality_defects: parsed.originality.defects,
            emotional_impact: parsed.emotional_impact.score,
            emotional_impact_defects: parsed.emotional_impact.defects,
            action: parsed.action.score,
            action_defects: parsed.action.defects,
            total_score: parsed.total_score,
            raw_json: raw.to_string(),
            ts: Store::now(),
        };

        let (id, inserted) = self.store.insert_story_evaluation(&eval)?;
        if inserted {
            self.registry.invalidate();
            self.maybe_advance_status(story_row_id)?;
        }
        Ok((id, inserted))
    }

    fn maybe_advance_status(&self, story_row_id: i64) -> Result<()> {
        let evaluations = self.store.evaluations_for_story(story_row_id)?;
        if evaluations.len() < EVALUATIONS_FOR_STATUS {
            return Ok(());
        }
        match self.store.story_status_by_code(EVALUATED_STATUS_CODE) {
            Ok(status) => self.store.advance_story_status(story_row_id, status.id),
            Err(OrchestratorError::NotFound { .. }) => {
                log::warn!("no '{EVALUATED_STATUS_CODE}' status configured, skipping advance");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run every active evaluator agent over a story, concurrently,
    /// and record each verdict.
    pub async fn evaluate_story(
        &self,
        story_row_id: i64,
        ctx: &ScopeContext,
    ) -> Result<Vec<i64>> {
        let story = self.store.story_by_id(story_row_id)?;
        if story.story_raw.is_empty() {
            return Err(OrchestratorError::ValidationInvalid {
                needs_retry: false,
                reason: "story_empty".to_string(),
            });
        }
        let agents = self.store.active_agents_for_role(EVALUATOR_ROLE)?;
        if agents.is_empty() {
            return Err(OrchestratorError::NotFound {
                kind: "agent role",
                name: EVALUATOR_ROLE.to_string(),
            });
        }

        let futures: Vec<_> = agents
            .iter()
            .map(|agent| self.evaluate_with_agent(agent, &story.story_raw, ctx))
            .collect();

        let mut ids = Vec::new();
        for (agent, outcome) in agents.iter().zip(join_all(futures).await) {
            match outcome {
                Ok(raw) => {
                    let model_id = agent.model_id;
                    match self.record_evaluation(story_row_id, Some(agent.id), model_id, &raw) {
                        Ok((id, _)) => ids.push(id),
                        Err(e) => {
                            log::warn!("evaluation by '{}' not recorded: {e}", agent.name)
                        }
                    }
                }
                Err(e) => log::warn!("evaluator '{}' failed: {e}", agent.name),
            }
        }

        if ids.is_empty() {
            return Err(OrchestratorError::ValidationInvalid {
                needs_retry: false,
                reason: "no_evaluation_recorded".to_string(),
            });
        }
        Ok(ids)
    }

    async fn evaluate_with_agent(
        &self,
        agent: &Agent,
        story_text: &str,
        ctx: &ScopeContext,
    ) -> Result<Value> {
        let model_id = agent.model_id.ok_or(OrchestratorError::NotFound {
            kind: "evaluator model",
            name: agent.name.clone(),
        })?;
        let model = self.registry.model_by_id(model_id)?;
        let params = SamplingParams {
            temperature: agent.temperature.unwrap_or(0.2),
            response_format: Some(serde_json::json!({"type": "json_object"})),
            ..SamplingParams::default()
        };
        let provider = self.factory.make(&model, &params);
        let sub_ctx = ctx
            .child("story/evaluate")
            .reagent(agent.name.clone(), EVALUATOR_ROLE);

        let messages = vec![
            ChatMessage::system(agent.system_text()),
            ChatMessage::user(format!(
                "Evaluate the following story. Answer as JSON with the fields \
                 narrative_coherence, originality, emotional_impact, action \
                 (each {{\"score\": 0-100, \"defects\": string}}) and \
                 total_score (0-100).\n\n{story_text}"
            )),
        ];

        let call = self
            .validator
            .call_with_validation(provider.as_ref(), &messages, &[], &sub_ctx)
            .await?;

        extract_json_object(call.envelope.text()).ok_or_else(|| {
            OrchestratorError::ValidationInvalid {
                needs_retry: false,
                reason: "evaluation_not_json".to_string(),
            }
        })
    }

    /// Recompute one model's six group scores from its latest test
    /// runs: `round(passed/total * 10, 1)` per group. Groups with no
    /// runs keep their current score.
    pub fn recompute_group_scores(&self, model_id: i64) -> Result<()> {
        for group in SCORE_GROUPS {
            if let Some((passed, total)) = self.store.latest_test_run(model_id, group)? {
                if total > 0 {
                    let score = group_score(passed, total);
                    self.store
                        .set_model_category_score(model_id, group, score)?;
                }
            }
        }
        self.registry.invalidate();
        Ok(())
    }
}

#[async_trait]
impl EvaluationHook for Evaluator {
    async fn evaluate(&self, story_row_id: i64, ctx: &ScopeContext) -> Result<()> {
        self.evaluate_story(story_row_id, ctx).await.map(|_| ())
    }
}

/// `round(passed/total * 10, 1)`.
pub fn group_score(passed: i64, total: i64) -> f64 {
    ((passed as f64 / total as f64) * 100.0).round() / 10.0
}
