//! Sampling parameters and per-model parameter filtering.
//!
//! Some models reject individual sampling knobs outright (reasoning
//! models reject `temperature`, several hosted models reject
//! `max_tokens`). Exclusions are a closed set of named flags applied
//! at request-assembly time, never scattered `if model == ...` checks
//! in the builders.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default sampling temperature when none is configured.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Default nucleus-sampling value when none is configured.
pub const DEFAULT_TOP_P: f64 = 1.0;

/// Model-name fragments that select the `max_completion_tokens`
/// parameter name instead of `max_tokens`.
const NEW_STYLE_MODEL_MARKERS: &[&str] = &["o1", "gpt-4o", "gpt-5"];

/// Sampling configuration for one bridge.
///
/// `temperature` and `top_p` always have a value; the remaining knobs
/// are sent only when explicitly set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature.
    pub temperature: f64,
    /// Nucleus sampling.
    pub top_p: f64,
    /// Ollama repeat penalty.
    pub repeat_penalty: Option<f64>,
    /// Ollama top-k.
    pub top_k: Option<i64>,
    /// Ollama repeat-last-n window.
    pub repeat_last_n: Option<i64>,
    /// Ollama completion-token cap.
    pub num_predict: Option<i64>,
    /// OpenAI frequency penalty.
    pub frequency_penalty: Option<f64>,
    /// Response-token cap. Omitted by default; sent as
    /// `max_completion_tokens` for new-style models, `max_tokens`
    /// otherwise.
    pub max_response_tokens: Option<i64>,
    /// Forwarded verbatim (e.g. `{"type":"json_object"}`).
    pub response_format: Option<Value>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            repeat_penalty: None,
            top_k: None,
            repeat_last_n: None,
            num_predict: None,
            frequency_penalty: None,
            max_response_tokens: None,
            response_format: None,
        }
    }
}

impl SamplingParams {
    /// Set the temperature.
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set top-p.
    pub fn top_p(mut self, top_p: f64) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set the response-token cap.
    pub fn max_response_tokens(mut self, max: i64) -> Self {
        self.max_response_tokens = Some(max);
        self
    }

    /// Set the response format, forwarded as-is.
    pub fn response_format(mut self, format: Value) -> Self {
        self.response_format = Some(format);
        self
    }

    /// Populate the Ollama-specific knobs from an agent row.
    pub fn ollama_knobs(
        mut self,
        repeat_penalty: Option<f64>,
        top_k: Option<i64>,
        repeat_last_n: Option<i64>,
        num_predict: Option<i64>,
    ) -> Self {
        self.repeat_penalty = repeat_penalty;
        self.top_k = top_k;
        self.repeat_last_n = repeat_last_n;
        self.num_predict = num_predict;
        self
    }
}

/// Closed set of per-model parameter exclusions.
///
/// A raised flag removes the parameter from the outbound request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamFilter {
    pub no_temperature: bool,
    pub no_top_p: bool,
    pub no_top_k: bool,
    pub no_repeat_penalty: bool,
    pub no_repeat_last_n: bool,
    pub no_num_predict: bool,
    pub no_frequency_penalty: bool,
    pub no_max_tokens: bool,
}

impl ParamFilter {
    /// Filter that passes every parameter through.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Static exclusion table keyed by model-name fragments.
    ///
    /// Reasoning-model families reject sampling knobs entirely.
    pub fn for_model(model: &str) -> Self {
        let lower = model.to_lowercase();
        if lower.starts_with("o1") || lower.starts_with("gpt-5") {
            Self {
                no_temperature: true,
                no_top_p: true,
                no_top_k: true,
                no_repeat_penalty: true,
                no_repeat_last_n: true,
                no_num_predict: true,
                no_frequency_penalty: true,
                no_max_tokens: false,
            }
        } else {
            Self::default()
        }
    }

    /// Parse a filter from a model row's JSON metadata, falling back
    /// to the static table for anything the metadata does not name.
    pub fn from_metadata(model: &str, metadata: Option<&Value>) -> Self {
        let mut filter = Self::for_model(model);
        let Some(meta) = metadata else {
            return filter;
        };
        let flag = |key: &str, current: bool| meta.get(key).and_then(Value::as_bool).unwrap_or(current);
        filter.no_temperature = flag("no_temperature", filter.no_temperature);
        filter.no_top_p = flag("no_top_p", filter.no_top_p);
        filter.no_top_k = flag("no_top_k", filter.no_top_k);
        filter.no_repeat_penalty = flag("no_repeat_penalty", filter.no_repeat_penalty);
        filter.no_repeat_last_n = flag("no_repeat_last_n", filter.no_repeat_last_n);
        filter.no_num_predict = flag("no_num_predict", filter.no_num_predict);
        filter.no_frequency_penalty = flag("no_frequency_penalty", filter.no_frequency_penalty);
        filter.no_max_tokens = flag("no_max_tokens", filter.no_max_tokens);
        filter
    }
}

/// Whether `model` takes `max_completion_tokens` instead of
/// `max_tokens`.
pub fn uses_max_completion_tokens(model: &str) -> bool {
    let lower = model.to_lowercase();
    NEW_STYLE_MODEL_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let params = SamplingParams::default();
        assert_eq!(params.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(params.top_p, DEFAULT_TOP_P);
        assert!(params.max_response_tokens.is_none());
        assert!(params.response_format.is_none());
    }

    #[test]
    fn test_reasoning_models_drop_sampling_knobs() {
        let filter = ParamFilter::for_model("o1-mini");
        assert!(filter.no_temperature);
        assert!(filter.no_top_p);
        assert!(!filter.no_max_tokens);

        let filter = ParamFilter::for_model("gpt-5-nano");
        assert!(filter.no_temperature);

        let filter = ParamFilter::for_model("llama3.3");
        assert_eq!(filter, ParamFilter::permissive());
    }

    #[test]
    fn test_metadata_overrides_static_table() {
        let meta = json!({"no_max_tokens": true, "no_temperature": false});
        let filter = ParamFilter::from_metadata("o1-mini", Some(&meta));
        assert!(!filter.no_temperature); // metadata wins
        assert!(filter.no_max_tokens);
        assert!(filter.no_top_p); // static table survives where unnamed
    }

    #[test]
    fn test_new_style_model_detection() {
        assert!(uses_max_completion_tokens("gpt-4o"));
        assert!(uses_max_completion_tokens("o1-preview"));
        assert!(uses_max_completion_tokens("gpt-5"));
        assert!(!uses_max_completion_tokens("gpt-4-turbo"));
        assert!(!uses_max_completion_tokens("llama3.3"));
    }
}
