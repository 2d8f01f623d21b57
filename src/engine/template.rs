//! Step-prompt parsing.
//!
//! A template's `step_prompt` is a multiline text numbered `1.` ..
//! `N.`; each numbered block is one step instruction. Instructions may
//! span multiple lines and carry interpolation placeholders resolved
//! at run time.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{OrchestratorError, Result};

static STEP_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)[.)]\s*(.*)$").expect("static regex"));

static PLACEHOLDER_STEP_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{STEPS?_(\d+)(?:-(\d+))?(?:_[A-Z]+(?::[^}]*)?)?\}\}").expect("static regex")
});

/// Parse a numbered step prompt into ordered instructions.
///
/// Numbers must run 1..N without gaps; the result is indexed from 0
/// for step 1.
pub fn parse_step_prompt(step_prompt: &str) -> Result<Vec<String>> {
    let mut steps: Vec<(i64, String)> = Vec::new();

    for line in step_prompt.lines() {
        if let Some(captures) = STEP_NUMBER.captures(line) {
            let number: i64 = captures[1]
                .parse()
                .map_err(|_| OrchestratorError::Template("unparseable step number".into()))?;
            steps.push((number, captures[2].trim().to_string()));
        } else if let Some((_, text)) = steps.last_mut() {
            // Continuation line of the current step.
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(line.trim_end());
        } else if !line.trim().is_empty() {
            return Err(OrchestratorError::Template(format!(
                "step prompt must start with a numbered step, found: {line:?}"
            )));
        }
    }

    if steps.is_empty() {
        return Err(OrchestratorError::Template(
            "step prompt contains no steps".into(),
        ));
    }

    for (index, (number, _)) in steps.iter().enumerate() {
        let expected = index as i64 + 1;
        if *number != expected {
            return Err(OrchestratorError::Template(format!(
                "step numbers must run 1..N; expected {expected}, found {number}"
            )));
        }
    }

    let instructions: Vec<String> = steps
        .into_iter()
        .map(|(_, text)| text.trim().to_string())
        .collect();

    validate_placeholder_refs(&instructions)?;
    Ok(instructions)
}

/// Every `{{STEP_k…}}` placeholder in step n must reference k < n.
pub fn validate_placeholder_refs(instructions: &[String]) -> Result<()> {
    for (index, instruction) in instructions.iter().enumerate() {
        let step_number = index as i64 + 1;
        for captures in PLACEHOLDER_STEP_REF.captures_iter(instruction) {
            let first: i64 = captures[1]
                .parse()
                .map_err(|_| OrchestratorError::Template("bad placeholder index".into()))?;
            let last: i64 = match captures.get(2) {
                Some(m) => m
                    .as_str()
                    .parse()
                    .map_err(|_| OrchestratorError::Template("bad placeholder range".into()))?,
                None => first,
            };
            if first < 1 || last < first {
                return Err(OrchestratorError::Template(format!(
                    "invalid placeholder range {first}-{last} in step {step_number}"
                )));
            }
            if last >= step_number {
                return Err(OrchestratorError::Template(format!(
                    "step {step_number} references step {last}, which has not run yet"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_steps() {
        let steps = parse_step_prompt(
            "1. Write outline (>=100 chars).\n\
             2. {{STEP_1}} - list characters.\n\
             3. {{STEP_1}} {{STEP_2}} - write chapter (>=500 chars).",
        )
        .unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps[0].starts_with("Write outline"));
        assert!(steps[2].contains("{{STEP_2}}"));
    }

    #[test]
    fn test_multiline_step_bodies() {
        let steps = parse_step_prompt(
            "1. Write the outline.\n\
             Include at least three acts.\n\
             2. Expand act one.",
        )
        .unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps[0].contains("three acts"));
    }

    #[test]
    fn test_paren_numbering_accepted() {
        let steps = parse_step_prompt("1) first\n2) second").unwrap();
        assert_eq!(steps, vec!["first", "second"]);
    }

    #[test]
    fn test_empty_prompt_rejected() {
        assert!(parse_step_prompt("").is_err());
        assert!(parse_step_prompt("   \n  ").is_err());
    }

    #[test]
    fn test_gap_in_numbering_rejected() {
        let err = parse_step_prompt("1. first\n3. third").unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn test_leading_prose_rejected() {
        assert!(parse_step_prompt("intro text\n1. first").is_err());
    }

    #[test]
    fn test_single_step_template_is_valid() {
        let steps = parse_step_prompt("1. Do everything at once.").unwrap();
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn test_forward_placeholder_reference_rejected() {
        let err = parse_step_prompt("1. Use {{STEP_2}} early.\n2. second").unwrap_err();
        assert!(err.to_string().contains("has not run yet"));
    }

    #[test]
    fn test_self_placeholder_reference_rejected() {
        assert!(parse_step_prompt("1. ok\n2. {{STEP_2}} loops").is_err());
    }

    #[test]
    fn test_range_placeholder_validation() {
        assert!(parse_step_prompt(
            "1. a\n2. b\n3. {{STEPS_1-2_SUMMARY}} summarize"
        )
        .is_ok());
        assert!(parse_step_prompt("1. a\n2. {{STEPS_1-2_SUMMARY}} bad").is_err());
        assert!(parse_step_prompt("1. a\n2. b\n3. {{STEPS_2-1_SUMMARY}} bad").is_err());
    }

    #[test]
    fn test_extract_and_summary_placeholders_validated() {
        assert!(parse_step_prompt("1. a\n2. {{STEP_1_EXTRACT:Characters}} ok").is_ok());
        assert!(parse_step_prompt("1. a\n2. {{STEP_1_SUMMARY}} ok").is_ok());
        assert!(parse_step_prompt("1. {{STEP_1_SUMMARY}} bad").is_err());
    }
}
