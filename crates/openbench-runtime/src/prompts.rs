//! Prompt text added by the runtime.
//!
//! Two uses:
//! 1. JSON-only instructions appended for local models without a native
//!    JSON mode
//! 2. The grading prompt sent to a judge model for `llm_judge` test cases

use serde_json::Value as JsonValue;

const JSON_ONLY_CLOSING: &str =
    "Your response should contain ONLY the JSON object, with no additional text or formatting.";

/// Append JSON-only instructions to `prompt`, quoting the schema if given.
pub fn with_json_instructions(prompt: &str, schema: Option<&JsonValue>) -> String {
    match schema.and_then(|s| serde_json::to_string_pretty(s).ok()) {
        Some(schema) => format!(
            "{}\n\nPlease provide your response as valid JSON that conforms to this schema:\n{}\n\n{}",
            prompt, schema, JSON_ONLY_CLOSING
        ),
        None => format!(
            "{}\n\nPlease provide your response as valid JSON.\n\n{}",
            prompt, JSON_ONLY_CLOSING
        ),
    }
}

/// System prompt for the judge model.
pub const JUDGE_SYSTEM_PROMPT: &str = r#"
You are grading a language model's answer to a benchmark task.

You are given the task, a reference answer, and the candidate answer.
Judge whether the candidate answer is correct and complete with respect to
the reference. Wording may differ; substance may not.

## Output Format (JSON)
{
  "score": 0.0-1.0,
  "reasoning": "one or two sentences"
}

## Scoring Guidelines
- 1.0: Equivalent to the reference
- 0.5 - 0.9: Mostly correct, minor omissions or errors
- 0.1 - 0.4: Partially correct, major errors
- 0.0: Wrong, empty, or off-task

Reply with the JSON object only.
"#;

/// User prompt for the judge model.
pub fn judge_prompt(task: &str, expected: &JsonValue, response: &str) -> String {
    let reference = match expected {
        JsonValue::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    format!(
        "## Task\n{}\n\n## Reference Answer\n{}\n\n## Candidate Answer\n{}\n",
        task.trim(),
        reference.trim(),
        response.trim()
    )
}
