//! Output normalization and response construction
//!
//! Handler output is free text from the model; the declared output format
//! says how to turn it into a renderable payload. Every pipeline outcome —
//! success, clarification, failure — goes through the builders here so the
//! caller always receives the same response shape.

use serde_json::{json, Value};
use tracing::warn;

use crate::error::EngineError;
use crate::types::{NormalizedResponse, ResponseStatus};

pub const FORMAT_STRUCTURED_JSON: &str = "structured_json";
pub const FORMAT_MARKDOWN_TABLE: &str = "markdown_table";
pub const FORMAT_CHART_DATA: &str = "chart_data";
pub const FORMAT_SUMMARY_TEXT: &str = "summary_text";

/// Parse raw handler output according to the declared format.
///
/// Returns the payload and the format actually applied; malformed output
/// falls back to plain text rather than failing the request.
pub fn normalize_output(text: &str, format: &str) -> (Value, String) {
    match format {
        FORMAT_STRUCTURED_JSON => parse_json(text),
        FORMAT_CHART_DATA => parse_chart(text),
        FORMAT_MARKDOWN_TABLE => (json!({"content": text}), FORMAT_MARKDOWN_TABLE.to_string()),
        _ => (json!({"content": text}), FORMAT_SUMMARY_TEXT.to_string()),
    }
}

fn parse_json(text: &str) -> (Value, String) {
    let json_str = if let Some(start) = text.find("```json") {
        let body = &text[start + 7..];
        match body.find("```") {
            Some(end) => body[..end].trim(),
            None => body.trim(),
        }
    } else if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        // A closing brace before the first opening brace means no candidate
        if start > end {
            return (json!({"content": text}), FORMAT_SUMMARY_TEXT.to_string());
        }
        &text[start..=end]
    } else {
        return (json!({"content": text}), FORMAT_SUMMARY_TEXT.to_string());
    };

    match serde_json::from_str::<Value>(json_str) {
        Ok(value) => (value, FORMAT_STRUCTURED_JSON.to_string()),
        Err(e) => {
            warn!(error = %e, "handler output was not valid json, falling back to text");
            (json!({"content": text}), FORMAT_SUMMARY_TEXT.to_string())
        }
    }
}

fn parse_chart(text: &str) -> (Value, String) {
    if text.contains('{') {
        let (value, format) = parse_json(text);
        if format == FORMAT_STRUCTURED_JSON {
            return (value, FORMAT_CHART_DATA.to_string());
        }
        return (value, format);
    }
    (json!({"content": text}), FORMAT_SUMMARY_TEXT.to_string())
}

/// Successful handler response
pub fn success_response(
    handler: &str,
    intent: &str,
    data: Value,
    format: String,
    render_hint: Value,
    elapsed_ms: u64,
) -> NormalizedResponse {
    NormalizedResponse {
        status: ResponseStatus::Ok,
        handler: Some(handler.to_string()),
        intent: intent.to_string(),
        data,
        format,
        render_hint,
        elapsed_ms,
    }
}

/// Multi-intent rejection: fixed clarification enumerating the detected
/// topics and asking for one question at a time
pub fn multi_intent_response(topics: &[String], elapsed_ms: u64) -> NormalizedResponse {
    NormalizedResponse {
        status: ResponseStatus::ClarificationNeeded,
        handler: None,
        intent: "multi_intent_detected".to_string(),
        data: json!({
            "message": "I detected multiple questions. Please ask about one topic at a time \
                        so I can help you better.",
            "detected_topics": topics,
        }),
        format: FORMAT_SUMMARY_TEXT.to_string(),
        render_hint: json!({"type": "text"}),
        elapsed_ms,
    }
}

/// Unclear-routing clarification
pub fn unclear_response(elapsed_ms: u64) -> NormalizedResponse {
    NormalizedResponse {
        status: ResponseStatus::ClarificationNeeded,
        handler: None,
        intent: "unclear".to_string(),
        data: json!({
            "message": "I'm not sure what you're asking about. Can you please rephrase \
                        your question or specify a topic?",
            "detected_topics": [],
        }),
        format: FORMAT_SUMMARY_TEXT.to_string(),
        render_hint: json!({"type": "text"}),
        elapsed_ms,
    }
}

/// Error outcome; the payload carries only the user-safe message
pub fn error_response(
    error: &EngineError,
    handler: Option<&str>,
    elapsed_ms: u64,
) -> NormalizedResponse {
    let kind = match error {
        EngineError::Validation(_) => "validation",
        EngineError::NotFound(_) => "not_found",
        EngineError::Execution(_) => "execution",
        EngineError::Timeout(_) => "timeout",
    };
    NormalizedResponse {
        status: ResponseStatus::Error,
        handler: handler.map(String::from),
        intent: kind.to_string(),
        data: json!({
            "message": error.user_message(),
            "kind": kind,
        }),
        format: FORMAT_SUMMARY_TEXT.to_string(),
        render_hint: json!({"type": "error"}),
        elapsed_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_structured_json_from_fenced_block() {
        let text = "Here is the result:\n```json\n{\"balance\": 42}\n```\nDone.";
        let (value, format) = normalize_output(text, FORMAT_STRUCTURED_JSON);
        assert_eq!(format, FORMAT_STRUCTURED_JSON);
        assert_eq!(value["balance"], 42);
    }

    #[test]
    fn test_structured_json_from_braces() {
        let text = "The answer is {\"balance\": 10, \"currency\": \"EUR\"} as requested.";
        let (value, format) = normalize_output(text, FORMAT_STRUCTURED_JSON);
        assert_eq!(format, FORMAT_STRUCTURED_JSON);
        assert_eq!(value["currency"], "EUR");
    }

    #[test]
    fn test_invalid_json_falls_back_to_text() {
        let text = "Your balance is {not json at all";
        let (value, format) = normalize_output(text, FORMAT_STRUCTURED_JSON);
        assert_eq!(format, FORMAT_SUMMARY_TEXT);
        assert_eq!(value["content"], text);
    }

    #[test]
    fn test_closing_brace_before_opening_falls_back_to_text() {
        let text = "unbalanced } and later {";
        let (value, format) = normalize_output(text, FORMAT_STRUCTURED_JSON);
        assert_eq!(format, FORMAT_SUMMARY_TEXT);
        assert_eq!(value["content"], text);
    }

    #[test]
    fn test_plain_text_passthrough() {
        let (value, format) = normalize_output("hello", FORMAT_SUMMARY_TEXT);
        assert_eq!(format, FORMAT_SUMMARY_TEXT);
        assert_eq!(value["content"], "hello");
    }

    #[test]
    fn test_markdown_table_passthrough() {
        let table = "| a | b |\n|---|---|\n| 1 | 2 |";
        let (value, format) = normalize_output(table, FORMAT_MARKDOWN_TABLE);
        assert_eq!(format, FORMAT_MARKDOWN_TABLE);
        assert_eq!(value["content"], table);
    }

    #[test]
    fn test_chart_data() {
        let text = "{\"labels\": [\"A\"], \"values\": [1]}";
        let (value, format) = normalize_output(text, FORMAT_CHART_DATA);
        assert_eq!(format, FORMAT_CHART_DATA);
        assert_eq!(value["labels"][0], "A");
    }

    #[test]
    fn test_chart_without_json_is_text() {
        let (_, format) = normalize_output("no data here", FORMAT_CHART_DATA);
        assert_eq!(format, FORMAT_SUMMARY_TEXT);
    }

    #[test]
    fn test_multi_intent_response_shape() {
        let resp = multi_intent_response(&["billing".to_string(), "logistics".to_string()], 5);
        assert_eq!(resp.status, ResponseStatus::ClarificationNeeded);
        assert!(resp.handler.is_none());
        assert_eq!(resp.data["detected_topics"][1], "logistics");
        assert!(resp.data["message"].as_str().unwrap().contains("one topic at a time"));
    }

    #[test]
    fn test_unclear_response_shape() {
        let resp = unclear_response(3);
        assert_eq!(resp.status, ResponseStatus::ClarificationNeeded);
        assert_eq!(resp.intent, "unclear");
    }

    #[test]
    fn test_error_response_timeout_distinct_from_execution() {
        let timeout = error_response(&EngineError::Timeout(Duration::from_secs(30)), None, 30000);
        let execution =
            error_response(&EngineError::Execution("detail".to_string()), Some("billing"), 10);
        assert_eq!(timeout.intent, "timeout");
        assert_eq!(execution.intent, "execution");
        assert_ne!(timeout.data["kind"], execution.data["kind"]);
    }

    #[test]
    fn test_error_response_hides_execution_detail() {
        let resp = error_response(
            &EngineError::Execution("upstream 503 at http://internal".to_string()),
            Some("billing"),
            10,
        );
        assert!(!resp.data["message"].as_str().unwrap().contains("internal"));
    }
}
