//! NL → SQL generation.
//!
//! The model receives the ranked schema summary, the question, the
//! tenant's response language, and a policy preamble that forbids
//! anything but a single parameterized SELECT. It must answer with one
//! JSON object `{sql, params, rationale}`; the extractor tolerates code
//! fences and leading prose because models add both.

use super::safety::GateRejection;
use crate::llm::{ChatMessage, CompletionParams, LlmProvider};
use askgate_core::{Error, RequestContext, Result};
use serde::Deserialize;
use tracing::debug;

/// A parsed generation candidate, not yet trusted.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedQuery {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
    #[serde(default)]
    pub rationale: Option<String>,
}

const POLICY_PREAMBLE: &str = "\
You translate questions into PostgreSQL. Rules, all mandatory:\n\
- Produce exactly ONE SELECT statement. Never any other statement kind.\n\
- Never reference system catalogs or schemas outside the provided summary.\n\
- Every user-supplied value must be a $n placeholder with its value in \"params\", in order. Do not inline values.\n\
- Use explicit JOIN syntax, never comma-separated FROM lists.\n\
- Prefer aggregate queries over returning raw rows when the question asks for a count, sum, or average.\n\
- Answer ONLY with a JSON object: {\"sql\": \"...\", \"params\": [...], \"rationale\": \"...\"}.";

/// Builds the generation conversation.
pub fn build_messages(
    schema_summary: &str,
    question: &str,
    response_language: &str,
    prior_rejection: Option<&GateRejection>,
) -> Vec<ChatMessage> {
    let mut system = format!(
        "{POLICY_PREAMBLE}\n\nDatabase schema:\n{schema_summary}\n\
         The user reads answers in '{response_language}'. Column aliases may use that language."
    );
    if let Some(rejection) = prior_rejection {
        system.push_str(&format!(
            "\n\nYour previous attempt was rejected by the safety gate: {rejection}. \
             Produce a corrected query that cannot trigger this rule."
        ));
    }
    vec![ChatMessage::system(system), ChatMessage::user(question.to_string())]
}

/// Extracts the first JSON object from model output. Handles ```json
/// fences and stray prose around the object.
pub fn parse_generated(text: &str) -> Result<GeneratedQuery> {
    let trimmed = strip_fences(text);
    let candidate = first_json_object(trimmed)
        .ok_or_else(|| Error::internal("model output contained no JSON object"))?;
    let query: GeneratedQuery = serde_json::from_str(candidate)
        .map_err(|e| Error::internal(format!("model output was not valid generation JSON: {e}")))?;
    if query.sql.trim().is_empty() {
        return Err(Error::internal("model produced an empty sql field"));
    }
    Ok(query)
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        // drop the info string (e.g. "json") up to the first newline
        let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
        if let Some(inner) = body.rsplit_once("```") {
            return inner.0.trim();
        }
        return body.trim();
    }
    trimmed
}

/// Finds the first balanced `{ ... }` region, quote-aware.
fn first_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// One generation round trip. Returns the candidate and the tokens spent
/// producing it.
pub async fn generate(
    provider: &dyn LlmProvider,
    ctx: &RequestContext,
    params: &CompletionParams,
    schema_summary: &str,
    question: &str,
    response_language: &str,
    prior_rejection: Option<&GateRejection>,
) -> Result<(GeneratedQuery, crate::outcome::TokenUsage)> {
    let messages = build_messages(schema_summary, question, response_language, prior_rejection);
    let completion = provider.complete(ctx, &messages, params).await?;
    let query = parse_generated(&completion.text)?;
    debug!(
        sql = %query.sql,
        params = query.params.len(),
        "sql candidate generated"
    );
    Ok((query, completion.usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let out = r#"{"sql": "SELECT COUNT(*) FROM employees WHERE department = $1", "params": ["IT"], "rationale": "count filter"}"#;
        let q = parse_generated(out).unwrap();
        assert!(q.sql.starts_with("SELECT COUNT"));
        assert_eq!(q.params, vec![serde_json::json!("IT")]);
    }

    #[test]
    fn parses_fenced_json_with_prose() {
        let out = "Here is the query:\n```json\n{\"sql\": \"SELECT 1\", \"params\": []}\n```\nHope that helps!";
        let q = parse_generated(out).unwrap();
        assert_eq!(q.sql, "SELECT 1");
    }

    #[test]
    fn braces_inside_sql_strings_do_not_break_extraction() {
        let out = r#"{"sql": "SELECT '{a}' FROM t", "params": []}"#;
        let q = parse_generated(out).unwrap();
        assert_eq!(q.sql, "SELECT '{a}' FROM t");
    }

    #[test]
    fn rejects_output_without_json() {
        assert!(parse_generated("I cannot answer that.").is_err());
    }

    #[test]
    fn rejection_feedback_lands_in_system_prompt() {
        let rejection = GateRejection {
            rule: super::super::safety::GateRule::ForbiddenSchema,
            detail: "schema 'hr' is outside the tenant allow-list".to_string(),
        };
        let messages = build_messages("public.t: id int", "q", "th", Some(&rejection));
        assert!(messages[0].content.contains("forbidden_schema"));
        assert!(messages[0].content.contains("previous attempt was rejected"));
    }
}
