//! Chunked coherence analysis.
//!
//! A long story is split into ~1800-character chunks on sentence
//! boundaries; each chunk gets its facts extracted and a local/global
//! coherence pair scored by the coherence agent. Per-chunk facts are
//! upserted and the global values aggregate into one
//! `global_coherence` row per story.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::bridge::messages::ChatMessage;
use crate::bridge::{ProviderFactory, SamplingParams};
use crate::context::ScopeContext;
use crate::error::{OrchestratorError, Result};
use crate::registry::Registry;
use crate::store::{ChunkFacts, GlobalCoherence, Store};
use crate::validation::checks::extract_json_object;
use crate::validation::Validator;

/// Role of the chunk-analysis agent.
pub const COHERENCE_ROLE: &str = "coherence_mapper";

/// Target chunk length in characters.
pub const CHUNK_TARGET: usize = 1800;

/// Boundary search window around the target, in characters.
pub const CHUNK_WINDOW: usize = 200;

/// Split a story into chunks close to [`CHUNK_TARGET`] characters,
/// cutting on `.`, `!`, `?`, or newline within the ±[`CHUNK_WINDOW`]
/// span when one exists.
pub fn chunk_story(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= CHUNK_TARGET + CHUNK_WINDOW {
            chunks.push(chars[start..].iter().collect::<String>());
            break;
        }

        let target = start + CHUNK_TARGET;
        let low = target - CHUNK_WINDOW;
        let high = (target + CHUNK_WINDOW).min(chars.len() - 1);

        // Prefer the boundary closest to the target, scanning outward.
        let mut cut = None;
        for offset in 0..=(high - low) {
            for candidate in [target.checked_sub(offset), Some(target + offset)] {
                let Some(index) = candidate else { continue };
                if index < low || index > high {
                    continue;
                }
                if matches!(chars[index], '.' | '!' | '?' | '\n') {
                    cut = Some(index + 1);
                    break;
                }
            }
            if cut.is_some() {
                break;
            }
        }
        let cut = cut.unwrap_or(target);

        chunks.push(chars[start..cut].iter().collect::<String>());
        start = cut;
    }

    chunks
        .into_iter()
        .map(|chunk| chunk.trim().to_string())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

/// One chunk's analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkAnalysis {
    pub facts: Value,
    pub local_coherence: f64,
    pub global_coherence: f64,
}

/// Parse the coherence agent's JSON answer for one chunk.
pub fn parse_chunk_analysis(text: &str) -> Result<ChunkAnalysis> {
    let value = extract_json_object(text).ok_or_else(|| {
        OrchestratorError::ValidationInvalid {
            needs_retry: true,
            reason: "coherence_not_json".to_string(),
        }
    })?;
    let facts = value.get("facts").cloned().unwrap_or_else(|| json!({}));
    let local = value
        .get("local_coherence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let global = value
        .get("global_coherence")
        .and_then(Value::as_f64)
        .unwrap_or(local);
    Ok(ChunkAnalysis {
        facts,
        local_coherence: local.clamp(0.0, 1.0),
        global_coherence: global.clamp(0.0, 1.0),
    })
}

/// Runs the chunked coherence pass over stories.
pub struct CoherenceAnalyzer {
    store: Arc<Store>,
    registry: Arc<Registry>,
    validator: Arc<Validator>,
    factory: Arc<dyn ProviderFactory>,
}

impl std::fmt::Debug for CoherenceAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoherenceAnalyzer").finish_non_exhaustive()
    }
}

impl CoherenceAnalyzer {
    /// Analyzer resolving its agent through `registry`.
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

    /// Analyze a story: extract facts per chunk, store them, and
    /// aggregate the global coherence row. The aggregate is also
    /// written back to the story view as a synthetic evaluation line.
    pub async fn analyze_story(
        &self,
        story_row_id: i64,
        ctx: &ScopeContext,
    ) -> Result<GlobalCoherence> {
        let story = self.store.story_by_id(story_row_id)?;
        let chunks = chunk_story(&story.story_raw);
        if chunks.is_empty() {
            return Err(OrchestratorError::ValidationInvalid {
                needs_retry: false,
                reason: "story_empty".to_string(),
            });
        }

        let agent = self.registry.active_agent_for_role(COHERENCE_ROLE)?;
        let model_id = agent.model_id.ok_or(OrchestratorError::NotFound {
            kind: "coherence model",
            name: agent.name.clone(),
        })?;
        let model = self.registry.model_by_id(model_id)?;
        let params = SamplingParams {
            temperature: agent.temperature.unwrap_or(0.2),
            response_format: Some(json!({"type": "json_object"})),
            ..SamplingParams::default()
        };
        let provider = self.factory.make(&model, &params);

        let mut globals = Vec::with_capacity(chunks.len());
        let mut prior_facts = json!({});

        for (index, chunk) in chunks.iter().enumerate() {
            let chunk_number = index as i64 + 1;
            ctx.ensure_active()?;

            let sub_ctx = ctx
                .child("story/coherence_chunk")
                .reagent(agent.name.clone(), COHERENCE_ROLE);
            let messages = vec![
                ChatMessage::system(agent.system_text()),
                ChatMessage::user(format!(
                    "Facts established so far:\n{prior_facts}\n\n\
                     Story chunk {chunk_number}:\n{chunk}\n\n\
                     Extract the chunk's facts (characters, places, open plot \
                     threads) and score its coherence. Answer as JSON: \
                     {{\"facts\": {{…}}, \"local_coherence\": 0..1, \
                     \"global_coherence\": 0..1}}"
                )),
            ];

            let call = self
                .validator
                .call_with_validation(provider.as_ref(), &messages, &[], &sub_ctx)
                .await?;
            let analysis = parse_chunk_analysis(call.envelope.text())?;

            self.store.upsert_chunk_facts(&ChunkFacts {
                story_id: story_row_id,
                chunk_number,
                facts_json: analysis.facts.to_string(),
            })?;
            prior_facts = analysis.facts;
            globals.push(analysis.global_coherence);
        }

        let aggregate = globals.iter().sum::<f64>() / globals.len() as f64;
        let notes = format!("{} chunk(s) analyzed", globals.len());
        self.store.upsert_global_coherence(
            story_row_id,
            aggregate,
            globals.len() as i64,
            Some(&notes),
        )?;

        let coherence = self
            .store
            .global_coherence_for_story(story_row_id)?
            .expect("row upserted above");
        self.store
            .set_story_eval(story_row_id, &synthetic_evaluation_line(&coherence), None)?;
        Ok(coherence)
    }
}

/// The aggregate rendered as one evaluation line for the story view.
pub fn synthetic_evaluation_line(coherence: &GlobalCoherence) -> String {
    format!(
        "Global coherence {:.2} over {} chunk(s)",
        coherence.global_coherence_value, coherence.chunk_count
    )
}
