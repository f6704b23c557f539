// Handoff payload optimization and encoding

//! Accepted payloads pass through three stages:
//!
//! 1. **Transform**: well-known agent pairs get a derived brief added (the
//!    original fields stay untouched)
//! 2. **Field filter**: pairs with a relevant-field allow-list drop everything
//!    else; a filter that would drop every field is skipped
//! 3. **Encoding**: gzip + base64 above the compression threshold (reference
//!    handoffs are stored out of band by the protocol)
//!
//! Every stage that changes the payload appends an [`OptimizationRecord`].
//! The checksum covers the exact JSON bytes produced after stage 2.
//!
//! ## Rust Learning Notes:
//!
//! ### `Read` / `Write` Adapters
//! `GzEncoder` wraps a `Vec<u8>` writer and `GzDecoder` wraps a byte slice
//! reader, so compression is just `write_all` / `read_to_end`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::time::Instant;

use crate::models::{AgentKind, OptimizationRecord};
use crate::{ChainError, Result};

/// Named transforms for well-known agent pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTransform {
    TrendToContentBrief,
    SeoToContentBrief,
    ContentToDesignBrief,
    ContentToSocialPost,
    ContentToEmailDraft,
}

impl DataTransform {
    pub fn for_pair(from: AgentKind, to: AgentKind) -> Option<Self> {
        use AgentKind::*;
        match (from, to) {
            (TrendAnalysis, Content) => Some(Self::TrendToContentBrief),
            (Seo, Content) => Some(Self::SeoToContentBrief),
            (Content, Design) => Some(Self::ContentToDesignBrief),
            (Content, SocialMedia) => Some(Self::ContentToSocialPost),
            (Content, Email) => Some(Self::ContentToEmailDraft),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TrendToContentBrief => "trend_to_content_brief",
            Self::SeoToContentBrief => "seo_to_content_brief",
            Self::ContentToDesignBrief => "content_to_design_brief",
            Self::ContentToSocialPost => "content_to_social_post",
            Self::ContentToEmailDraft => "content_to_email_draft",
        }
    }

    /// Field the transform writes
    pub fn target_field(&self) -> &'static str {
        match self {
            Self::TrendToContentBrief | Self::SeoToContentBrief => "content_brief",
            Self::ContentToDesignBrief => "design_brief",
            Self::ContentToSocialPost => "social_brief",
            Self::ContentToEmailDraft => "email_brief",
        }
    }

    /// Derive the target field; `None` when the inputs are missing
    fn derive(&self, data: &Map<String, Value>) -> Option<Value> {
        let first = |field: &str, n: usize| -> Option<Vec<Value>> {
            data.get(field)
                .and_then(Value::as_array)
                .map(|items| items.iter().take(n).cloned().collect())
        };
        let text = |field: &str| data.get(field).and_then(Value::as_str);

        match self {
            Self::TrendToContentBrief => {
                let topics = first("trends", 3)?;
                Some(json!({
                    "topics": topics,
                    "keywords": data.get("keywords").cloned().unwrap_or(Value::Null),
                    "audience": data.get("audience").cloned().unwrap_or(Value::Null),
                }))
            }
            Self::SeoToContentBrief => {
                let keywords = first("keywords", 5)?;
                Some(json!({
                    "primary_keywords": keywords,
                    "meta_description": text("meta_description"),
                }))
            }
            Self::ContentToDesignBrief => {
                let headline = text("title")?;
                Some(json!({
                    "headline": headline,
                    "tone": text("tone"),
                    "call_to_action": text("call_to_action"),
                }))
            }
            Self::ContentToSocialPost => {
                let headline = text("title")?;
                let hook = text("body").map(|b| truncate(b, 140));
                let hashtags: Vec<String> = first("keywords", 5)
                    .unwrap_or_default()
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|k| format!("#{}", k.split_whitespace().collect::<String>()))
                    .collect();
                Some(json!({ "headline": headline, "hook": hook, "hashtags": hashtags }))
            }
            Self::ContentToEmailDraft => {
                let subject = text("title")?;
                Some(json!({
                    "subject": subject,
                    "preview_text": text("body").map(|b| truncate(b, 90)),
                    "call_to_action": text("call_to_action"),
                }))
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Relevant-field allow-list for an agent pair
pub fn relevant_fields(from: AgentKind, to: AgentKind) -> Option<&'static [&'static str]> {
    use AgentKind::*;
    let fields: &'static [&'static str] = match (from, to) {
        (TrendAnalysis, Content) => &["trends", "keywords", "audience", "momentum", "insights", "content_brief"],
        (Seo, Content) => &["keywords", "search_volume", "difficulty", "meta_description", "content_brief"],
        (Content, Design) => &["title", "body", "tone", "keywords", "call_to_action", "design_brief"],
        (Content, SocialMedia) => &["title", "body", "keywords", "call_to_action", "tone", "assets", "social_brief"],
        (Content, Email) => &["title", "body", "call_to_action", "keywords", "tone", "email_brief"],
        (Design, SocialMedia) | (Design, Advertising) => &["assets", "palette", "format", "title", "body"],
        (SocialMedia, Analytics) => &["posts", "platforms", "scheduled", "engagement_estimate"],
        (Advertising, Analytics) => &["ad_sets", "budget", "targeting"],
        (Email, Analytics) => &["subject", "segments", "preview_text"],
        _ => return None,
    };
    Some(fields)
}

fn json_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0)
}

fn record(kind: impl Into<String>, before: usize, after: usize, started: Instant) -> OptimizationRecord {
    OptimizationRecord {
        kind: kind.into(),
        bytes_before: before,
        bytes_after: after,
        bytes_saved: before as i64 - after as i64,
        time_ms: started.elapsed().as_secs_f64() * 1000.0,
    }
}

/// Apply the pair's transform and field filter
pub fn optimize_payload(from: AgentKind, to: AgentKind, payload: Value) -> (Value, Vec<OptimizationRecord>) {
    let mut records = Vec::new();
    let mut map = match payload {
        Value::Object(map) => map,
        other => return (other, records),
    };

    if let Some(transform) = DataTransform::for_pair(from, to) {
        let started = Instant::now();
        let before = json_len(&Value::Object(map.clone()));
        if let Some(derived) = transform.derive(&map) {
            map.insert(transform.target_field().to_string(), derived);
            let after = json_len(&Value::Object(map.clone()));
            records.push(record(format!("transform:{}", transform.name()), before, after, started));
        }
    }

    if let Some(allowed) = relevant_fields(from, to) {
        let started = Instant::now();
        if map.keys().any(|k| allowed.contains(&k.as_str())) {
            let before = json_len(&Value::Object(map.clone()));
            let dropped = map.len();
            map.retain(|k, _| allowed.contains(&k.as_str()));
            if map.len() < dropped {
                let after = json_len(&Value::Object(map.clone()));
                records.push(record("field_filter", before, after, started));
            }
        }
    }

    (Value::Object(map), records)
}

/// Hex SHA-256 of `bytes`
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// gzip then base64; returns the encoded text and its record
pub fn compress(bytes: &[u8]) -> Result<(String, OptimizationRecord)> {
    let started = Instant::now();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    let compressed = encoder.finish()?;
    let encoded = BASE64.encode(compressed);
    let record = record("compression", bytes.len(), encoded.len(), started);
    Ok((encoded, record))
}

pub fn decompress(encoded: &str) -> Result<Vec<u8>> {
    let compressed = BASE64
        .decode(encoded)
        .map_err(|e| ChainError::Internal(format!("corrupt compressed handoff: {}", e)))?;
    let mut decoder = GzDecoder::new(&compressed[..]);
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trend_to_content_adds_brief_and_filters() {
        let payload = json!({
            "trends": ["a", "b", "c", "d"],
            "keywords": ["k"],
            "audience": "teens",
            "agent": "trend_analysis",
            "raw_scrape": "lots of noise",
        });
        let (optimized, records) = optimize_payload(AgentKind::TrendAnalysis, AgentKind::Content, payload);

        assert_eq!(optimized["content_brief"]["topics"], json!(["a", "b", "c"]));
        assert_eq!(optimized["trends"], json!(["a", "b", "c", "d"]));
        assert!(optimized.get("raw_scrape").is_none());
        assert!(optimized.get("agent").is_none());
        let kinds: Vec<&str> = records.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, vec!["transform:trend_to_content_brief", "field_filter"]);
        assert!(records[1].bytes_saved > 0);
    }

    #[test]
    fn test_filter_skipped_when_nothing_relevant() {
        let payload = json!({"unrelated": 1});
        let (optimized, records) = optimize_payload(AgentKind::Content, AgentKind::Design, payload.clone());
        assert_eq!(optimized, payload);
        assert!(records.is_empty());
    }

    #[test]
    fn test_unknown_pair_passes_through() {
        let payload = json!({"x": [1, 2, 3]});
        let (optimized, records) = optimize_payload(AgentKind::Outreach, AgentKind::Seo, payload.clone());
        assert_eq!(optimized, payload);
        assert!(records.is_empty());
    }

    #[test]
    fn test_social_post_hashtags() {
        let payload = json!({"title": "T", "body": "B", "keywords": ["cold brew", "coffee"]});
        let (optimized, _) = optimize_payload(AgentKind::Content, AgentKind::SocialMedia, payload);
        assert_eq!(optimized["social_brief"]["hashtags"], json!(["#coldbrew", "#coffee"]));
    }

    #[test]
    fn test_compression_is_lossless() {
        let bytes = serde_json::to_vec(&json!({"text": "abc".repeat(10_000)})).unwrap();
        let (encoded, record) = compress(&bytes).unwrap();
        assert!(record.bytes_saved > 0);
        assert_eq!(decompress(&encoded).unwrap(), bytes);
        assert!(decompress("not base64!!").is_err());
    }

    #[test]
    fn test_checksum_is_stable_hex() {
        let sum = checksum(b"payload");
        assert_eq!(sum.len(), 64);
        assert_eq!(sum, checksum(b"payload"));
        assert_ne!(sum, checksum(b"payload2"));
    }
}
