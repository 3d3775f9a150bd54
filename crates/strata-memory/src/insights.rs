//! Insight extraction engine.
//!
//! `InsightEngine::extract` is a pure function of the packet, its reasoning
//! annotation and the annotation history of its segment. It performs no I/O;
//! the pipeline loads the history and persists the output. Rule families run
//! independently and a packet may match any number of them.
//!
//! Output is sorted by (kind, content) and de-duplicated, and every
//! timestamp is the packet's own `created_at`, so repeated calls on the same
//! input return identical results.

use crate::reasoning::{packet_text, tokenize};
use regex_lite::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use strata_types::config::InsightConfig;
use strata_types::knowledge::{ExtractedInsight, Extraction, InsightKind, KnowledgeFact};
use strata_types::packet::{Packet, ReasoningAnnotation};

const CONCLUSION_CONFIDENCE: f32 = 0.9;
const TERM_PATTERN_CONFIDENCE: f32 = 0.6;
const STRUCTURE_PATTERN_CONFIDENCE: f32 = 0.7;
const CATEGORY_ANOMALY_CONFIDENCE: f32 = 0.6;
const KEYED_RECOMMENDATION_CONFIDENCE: f32 = 0.8;
const PREFIXED_RECOMMENDATION_CONFIDENCE: f32 = 0.65;
const EXPLICIT_FACT_CONFIDENCE: f32 = 0.95;
const ENTITY_FACT_CONFIDENCE: f32 = 0.8;
const TEXT_FACT_CONFIDENCE: f32 = 0.6;

const MIN_TERM_LEN: usize = 3;
const FACT_STOPWORDS: &[&str] = &[
    "it", "this", "that", "there", "what", "which", "who", "he", "she", "they",
];

fn fact_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)\b([a-z][a-z0-9_-]*) (is|has|uses|owns|requires) ([a-z0-9][a-z0-9_-]*)",
            )
            .ok()
        })
        .as_ref()
}

/// Rule-based extractor.
#[derive(Debug, Clone)]
pub struct InsightEngine {
    config: InsightConfig,
}

impl InsightEngine {
    /// Create an engine with the given rule parameters.
    pub fn new(config: InsightConfig) -> Self {
        Self { config }
    }

    /// Rule parameters in use.
    pub fn config(&self) -> &InsightConfig {
        &self.config
    }

    /// Extract insights and facts from one packet.
    ///
    /// `history` holds the annotations of prior packets in the same segment,
    /// most recent first, already bounded to the anomaly window.
    pub fn extract(
        &self,
        packet: &Packet,
        annotation: &ReasoningAnnotation,
        history: &[ReasoningAnnotation],
    ) -> Extraction {
        let mut insights: Vec<(InsightKind, String, f32)> = Vec::new();
        self.conclusions(annotation, &mut insights);
        self.patterns(packet, &mut insights);
        self.anomalies(annotation, history, &mut insights);
        self.recommendations(&packet.payload, &mut insights);

        let mut facts: Vec<(String, String, String, f32)> = Vec::new();
        explicit_facts(&packet.payload, &mut facts);
        entity_facts(&packet.payload, &mut facts);
        text_facts(&packet.payload, &mut facts);

        insights.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        insights.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);
        facts.sort_by(|a, b| (&a.0, &a.1, &a.2).cmp(&(&b.0, &b.1, &b.2)));
        facts.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1 && a.2 == b.2);

        Extraction {
            insights: insights
                .into_iter()
                .map(|(kind, content, confidence)| ExtractedInsight {
                    id: String::new(),
                    kind,
                    content,
                    confidence,
                    source_packet: packet.id,
                    created_at: packet.created_at,
                })
                .collect(),
            facts: facts
                .into_iter()
                .map(|(subject, predicate, object, confidence)| KnowledgeFact {
                    id: String::new(),
                    subject,
                    predicate,
                    object,
                    confidence,
                    source_packet: packet.id,
                    created_at: packet.created_at,
                })
                .collect(),
        }
    }

    fn conclusions(
        &self,
        annotation: &ReasoningAnnotation,
        out: &mut Vec<(InsightKind, String, f32)>,
    ) {
        for token in &annotation.decision_tokens {
            out.push((
                InsightKind::Conclusion,
                format!("decision: {token}"),
                CONCLUSION_CONFIDENCE,
            ));
        }
    }

    fn patterns(&self, packet: &Packet, out: &mut Vec<(InsightKind, String, f32)>) {
        let min = self.config.pattern_min_repeats.max(2);

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for token in tokenize(&packet_text(&packet.packet_type, &packet.payload)) {
            if token.chars().count() >= MIN_TERM_LEN {
                *counts.entry(token).or_default() += 1;
            }
        }
        for (term, n) in counts {
            if n >= min {
                out.push((
                    InsightKind::Pattern,
                    format!("term '{term}' repeated {n} times"),
                    TERM_PATTERN_CONFIDENCE,
                ));
            }
        }

        repeated_structures(&packet.payload, "$", min, out);
    }

    fn anomalies(
        &self,
        annotation: &ReasoningAnnotation,
        history: &[ReasoningAnnotation],
        out: &mut Vec<(InsightKind, String, f32)>,
    ) {
        let min_samples = self.config.anomaly_min_samples.max(1);
        let threshold = self.config.anomaly_z_threshold;
        let window = &history[..history.len().min(self.config.anomaly_window)];

        for (field, &value) in &annotation.numeric_fields {
            let samples: Vec<f64> = window
                .iter()
                .filter_map(|a| a.numeric_fields.get(field).copied())
                .collect();
            if samples.len() < min_samples {
                continue;
            }
            let n = samples.len() as f64;
            let mean = samples.iter().sum::<f64>() / n;
            let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
            let std_dev = variance.sqrt();

            let z = if std_dev < f64::EPSILON {
                if (value - mean).abs() < f64::EPSILON {
                    continue;
                }
                f64::INFINITY
            } else {
                (value - mean) / std_dev
            };
            if z.abs() < threshold {
                continue;
            }
            let confidence = (0.5 + z.abs() / (2.0 * threshold)).min(0.99) as f32;
            let z_text = if z.is_finite() {
                format!("{z:.2}")
            } else {
                "inf".to_string()
            };
            out.push((
                InsightKind::Anomaly,
                format!(
                    "{field} = {value} deviates from segment '{}' mean {mean:.3} (z = {z_text})",
                    annotation.segment
                ),
                confidence,
            ));
        }

        if window.len() < min_samples {
            return;
        }
        for (field, value) in &annotation.categorical_fields {
            let seen: Option<BTreeSet<&str>> = window
                .iter()
                .map(|a| a.categorical_fields.get(field).map(String::as_str))
                .collect();
            let Some(seen) = seen else {
                continue;
            };
            if !seen.contains(value.as_str()) {
                out.push((
                    InsightKind::Anomaly,
                    format!(
                        "{field} has unseen value '{value}' in segment '{}'",
                        annotation.segment
                    ),
                    CATEGORY_ANOMALY_CONFIDENCE,
                ));
            }
        }
    }

    fn recommendations(&self, payload: &Value, out: &mut Vec<(InsightKind, String, f32)>) {
        if let Value::Object(map) = payload {
            for key in &self.config.recommendation_keys {
                if let Some(Value::String(s)) = map.get(key) {
                    let s = s.trim();
                    if !s.is_empty() {
                        out.push((
                            InsightKind::Recommendation,
                            s.to_string(),
                            KEYED_RECOMMENDATION_CONFIDENCE,
                        ));
                    }
                }
            }
        }

        let mut leaves = Vec::new();
        string_leaves(payload, &mut leaves);
        for leaf in leaves {
            for line in leaf.lines() {
                let line = line.trim();
                let lower = line.to_lowercase();
                for prefix in &self.config.recommendation_prefixes {
                    let prefix = prefix.to_lowercase();
                    if lower.starts_with(&prefix) {
                        // Lower-casing can change byte lengths; cut by chars.
                        let rest: String =
                            line.chars().skip(prefix.chars().count()).collect();
                        let rest = rest.trim();
                        if !rest.is_empty() {
                            out.push((
                                InsightKind::Recommendation,
                                rest.to_string(),
                                PREFIXED_RECOMMENDATION_CONFIDENCE,
                            ));
                        }
                        break;
                    }
                }
            }
        }
    }
}

/// Arrays holding `min` or more objects with an identical key set.
fn repeated_structures(
    value: &Value,
    path: &str,
    min: usize,
    out: &mut Vec<(InsightKind, String, f32)>,
) {
    match value {
        Value::Array(items) => {
            let mut shapes: BTreeMap<Vec<&str>, usize> = BTreeMap::new();
            for item in items {
                if let Value::Object(map) = item {
                    let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
                    keys.sort_unstable();
                    *shapes.entry(keys).or_default() += 1;
                }
            }
            for (keys, n) in shapes {
                if n >= min && !keys.is_empty() {
                    out.push((
                        InsightKind::Pattern,
                        format!("{n} records share fields [{}] at {path}", keys.join(", ")),
                        STRUCTURE_PATTERN_CONFIDENCE,
                    ));
                }
            }
            for (i, item) in items.iter().enumerate() {
                repeated_structures(item, &format!("{path}[{i}]"), min, out);
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                repeated_structures(child, &format!("{path}.{key}"), min, out);
            }
        }
        _ => {}
    }
}

fn string_leaves<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| string_leaves(v, out)),
        Value::Object(map) => map.values().for_each(|v| string_leaves(v, out)),
        _ => {}
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn triple(map: &Map<String, Value>) -> Option<(String, String, String)> {
    Some((
        scalar_text(map.get("subject")?)?,
        scalar_text(map.get("predicate")?)?,
        scalar_text(map.get("object")?)?,
    ))
}

fn explicit_facts(payload: &Value, out: &mut Vec<(String, String, String, f32)>) {
    let Value::Object(map) = payload else {
        return;
    };
    if let Some((s, p, o)) = triple(map) {
        out.push((s, p, o, EXPLICIT_FACT_CONFIDENCE));
    }
    if let Some(Value::Array(items)) = map.get("facts") {
        for item in items {
            if let Value::Object(fact) = item {
                if let Some((s, p, o)) = triple(fact) {
                    out.push((s, p, o, EXPLICIT_FACT_CONFIDENCE));
                }
            }
        }
    }
}

fn entity_facts(payload: &Value, out: &mut Vec<(String, String, String, f32)>) {
    let Value::Object(map) = payload else {
        return;
    };
    let Some(entity) = map.get("entity").and_then(scalar_text) else {
        return;
    };
    for (key, value) in map {
        if matches!(key.as_str(), "entity" | "facts" | "segment") {
            continue;
        }
        if let Some(object) = scalar_text(value) {
            out.push((entity.clone(), key.clone(), object, ENTITY_FACT_CONFIDENCE));
        }
    }
}

fn text_facts(payload: &Value, out: &mut Vec<(String, String, String, f32)>) {
    let Some(pattern) = fact_pattern() else {
        return;
    };
    let mut leaves = Vec::new();
    string_leaves(payload, &mut leaves);
    for leaf in leaves {
        for caps in pattern.captures_iter(leaf) {
            let (Some(s), Some(p), Some(o)) = (caps.get(1), caps.get(2), caps.get(3)) else {
                continue;
            };
            let subject = s.as_str().to_lowercase();
            if FACT_STOPWORDS.contains(&subject.as_str()) {
                continue;
            }
            out.push((
                subject,
                p.as_str().to_lowercase(),
                o.as_str().to_lowercase(),
                TEXT_FACT_CONFIDENCE,
            ));
        }
    }
}
