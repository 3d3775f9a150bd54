//! Deterministic reasoning annotation, derived from packet content alone.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use strata_types::config::InsightConfig;
use strata_types::packet::{payload_text, ReasoningAnnotation};

const SUMMARY_CHARS: usize = 280;
const MAX_KEYWORDS: usize = 8;
const MIN_KEYWORD_LEN: usize = 3;
const MAX_CATEGORICAL_LEN: usize = 64;

/// Lower-cased alphanumeric tokens of `text`, in order.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Text a packet is embedded and matched by: payload leaves, or the type when
/// the payload has none.
pub fn packet_text(packet_type: &str, payload: &Value) -> String {
    let text = payload_text(payload);
    if text.is_empty() {
        packet_type.to_string()
    } else {
        text
    }
}

/// Build the annotation for a packet about to be written.
pub fn derive_annotation(
    packet_type: &str,
    payload: &Value,
    config: &InsightConfig,
) -> ReasoningAnnotation {
    let text = packet_text(packet_type, payload);
    let tokens = tokenize(&text);

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in tokens.iter().filter(|t| t.chars().count() >= MIN_KEYWORD_LEN) {
        *counts.entry(t.as_str()).or_default() += 1;
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    let keywords = ranked
        .into_iter()
        .take(MAX_KEYWORDS)
        .map(|(t, _)| t.to_string())
        .collect();

    let mut decision_tokens: Vec<String> = Vec::new();
    if let Value::Object(map) = payload {
        for key in &config.decision_keys {
            if let Some(Value::String(s)) = map.get(key) {
                let s = s.trim();
                if !s.is_empty() {
                    decision_tokens.push(s.to_string());
                }
            }
        }
    }
    for word in &config.decision_words {
        let word = word.to_lowercase();
        if tokens.iter().any(|t| *t == word) {
            decision_tokens.push(word);
        }
    }
    let mut seen = std::collections::HashSet::new();
    decision_tokens.retain(|t| seen.insert(t.clone()));

    let mut numeric_fields = BTreeMap::new();
    let mut categorical_fields = BTreeMap::new();
    let mut segment = packet_type.to_string();
    if let Value::Object(map) = payload {
        for (key, value) in map {
            match value {
                Value::Number(n) => {
                    if let Some(f) = n.as_f64().filter(|f| f.is_finite()) {
                        numeric_fields.insert(key.clone(), f);
                    }
                }
                Value::String(s) if s.chars().count() <= MAX_CATEGORICAL_LEN => {
                    categorical_fields.insert(key.clone(), s.clone());
                }
                _ => {}
            }
        }
        if let Some(Value::String(s)) = map.get("segment") {
            if !s.trim().is_empty() {
                segment = s.trim().to_string();
            }
        }
    }

    ReasoningAnnotation {
        summary: text.chars().take(SUMMARY_CHARS).collect(),
        keywords,
        decision_tokens,
        numeric_fields,
        categorical_fields,
        segment,
        text_length: text.chars().count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("User-Login, ok!"), vec!["user", "login", "ok"]);
        assert!(tokenize("  ").is_empty());
    }

    #[test]
    fn test_packet_text_falls_back_to_type() {
        assert_eq!(packet_text("heartbeat", &json!({})), "heartbeat");
        assert_eq!(packet_text("event", &json!({"a": "x"})), "x");
    }

    #[test]
    fn test_annotation_fields() {
        let payload = json!({
            "decision": "ship it",
            "latency_ms": 120,
            "region": "eu-west",
            "segment": "deploys",
            "notes": "deploy approved after deploy review, deploy done"
        });
        let a = derive_annotation("event", &payload, &InsightConfig::default());
        assert_eq!(a.decision_tokens, vec!["ship it".to_string(), "approved".to_string()]);
        assert_eq!(a.numeric_fields.get("latency_ms"), Some(&120.0));
        assert_eq!(a.categorical_fields.get("region").map(String::as_str), Some("eu-west"));
        assert_eq!(a.segment, "deploys");
        assert_eq!(a.keywords[0], "deploy");
        assert!(a.summary.len() <= SUMMARY_CHARS);
        assert!(a.text_length > 0);
    }

    #[test]
    fn test_segment_defaults_to_type() {
        let a = derive_annotation("metric", &json!({"v": 1}), &InsightConfig::default());
        assert_eq!(a.segment, "metric");
        assert!(a.decision_tokens.is_empty());
    }

    #[test]
    fn test_annotation_is_deterministic() {
        let payload = json!({"text": "alpha beta gamma beta alpha delta"});
        let config = InsightConfig::default();
        assert_eq!(
            derive_annotation("event", &payload, &config),
            derive_annotation("event", &payload, &config)
        );
    }
}
