//! Cache-reuse estimation
//!
//! Predicts what fraction of a prompt an upstream provider would serve from
//! its own prompt cache, so stored estimates can be compared post-hoc with
//! the hit rates providers actually report. Three additive buckets:
//!
//! 1. **System messages** - a bounded set of content hashes; a system prompt
//!    seen before counts as fully cacheable.
//! 2. **Templates** - a fixed table of instruction-boilerplate patterns; the
//!    first match per message contributes a capped share.
//! 3. **Conversation history** - every message except the last contributes
//!    its tokens weighted by a reuse probability.
//!
//! The sum is capped at the prompt's total token estimate. The seen-set is
//! the only stateful part and the only lock on the request path.

use crate::telemetry::CacheAnalysis;
use crate::tokens::{estimate_content_tokens, estimate_tokens};
use lru::LruCache;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Bound on the system-message seen-set so a long-lived gateway process
/// cannot grow it without limit.
const SEEN_SET_CAPACITY: usize = 10_000;

/// Instruction-template patterns, checked in order; at most one counts per
/// message. The table is the single place new templates get declared.
const TEMPLATE_PATTERNS: &[&str] = &[
    r"(?i)You are a helpful assistant",
    r"(?i)Please (analyze|review|explain|summarize)",
    r"(?i)Based on the following (context|information|data)",
    r"(?i)Act as a (professional|expert|senior)",
    r"(?i)Given the (following|above) (code|text|document)",
    r"(?i)Here is (the|a) (code|function|class|file)",
    r"(?i)Can you help me (with|to)",
    r"(?i)I need (help|assistance) (with|for)",
    r"(?i)What (is|are|would be) the",
    r"(?i)How (do|can|should) (I|you|we)",
];

/// Tunable probabilities for the conversation-history bucket.
///
/// These are heuristic constants without validation against real provider
/// behavior, so they live in configuration rather than code.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheTuning {
    /// Baseline reuse probability for any non-final message
    pub history_base_p: f64,
    /// Added when the message role is `system`
    pub system_bonus_p: f64,
    /// Added when content is under 100 characters
    pub short_bonus_p: f64,
    /// Added when content is under 500 characters (and not under 100)
    pub medium_bonus_p: f64,
    /// Added when content repeats a 3-gram
    pub repetition_bonus_p: f64,
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self {
            history_base_p: 0.3,
            system_bonus_p: 0.5,
            short_bonus_p: 0.2,
            medium_bonus_p: 0.1,
            repetition_bonus_p: 0.2,
        }
    }
}

/// Shared cache-reuse estimator
///
/// Safe to call from many request tasks at once; the seen-set mutex guards
/// an O(1) lookup/insert.
pub struct CacheEstimator {
    seen_systems: Mutex<LruCache<String, ()>>,
    patterns: Vec<Regex>,
    tuning: CacheTuning,
}

impl CacheEstimator {
    pub fn new(tuning: CacheTuning) -> Self {
        let patterns = TEMPLATE_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("valid template pattern"))
            .collect();

        Self {
            seen_systems: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEEN_SET_CAPACITY).expect("nonzero capacity"),
            )),
            patterns,
            tuning,
        }
    }

    /// Estimate cache reuse for a message list (in the client's dialect,
    /// before any translation).
    pub fn estimate(&self, messages: &[serde_json::Value]) -> CacheAnalysis {
        if messages.is_empty() {
            return CacheAnalysis::default();
        }

        let total_tokens: u64 = messages
            .iter()
            .filter_map(|m| m.get("content"))
            .map(|c| estimate_content_tokens(c) as u64)
            .sum();

        let system_cached = self.analyze_system_messages(messages);
        let template_cached = self.analyze_templates(messages);
        let history_cached = self.analyze_history(messages);

        let cached = (system_cached + template_cached + history_cached).min(total_tokens);
        let fresh = total_tokens - cached;
        let hit_rate = if total_tokens > 0 {
            cached as f64 / total_tokens as f64
        } else {
            0.0
        };

        CacheAnalysis {
            estimated_cached_tokens: cached,
            estimated_fresh_tokens: fresh,
            estimated_cache_hit_rate: hit_rate,
            system_message_cached: system_cached,
            template_cached,
            conversation_history_cached: history_cached,
        }
    }

    /// System messages seen before count fully; unseen ones are remembered
    /// for next time and contribute nothing now.
    fn analyze_system_messages(&self, messages: &[serde_json::Value]) -> u64 {
        let mut cached = 0u64;
        let mut seen = self.seen_systems.lock().expect("seen-set lock poisoned");

        for msg in messages {
            if msg.get("role").and_then(|r| r.as_str()) != Some("system") {
                continue;
            }
            let Some(content) = msg.get("content").and_then(|c| c.as_str()) else {
                continue;
            };

            let hash = content_hash(content);
            if seen.get(&hash).is_some() {
                cached += estimate_tokens(content) as u64;
            } else {
                seen.put(hash, ());
            }
        }

        cached
    }

    /// First matching template pattern per message, capped at a quarter of
    /// the message so boilerplate never dominates the estimate.
    fn analyze_templates(&self, messages: &[serde_json::Value]) -> u64 {
        let mut cached = 0u64;

        for msg in messages {
            let text = message_text(msg);
            if text.is_empty() {
                continue;
            }

            for pattern in &self.patterns {
                let matched: u32 = pattern
                    .find_iter(&text)
                    .map(|m| estimate_tokens(m.as_str()))
                    .sum();
                if matched > 0 {
                    let content_tokens = estimate_tokens(&text);
                    cached += matched.min(content_tokens / 4) as u64;
                    break;
                }
            }
        }

        cached
    }

    /// Every message except the last, weighted by reuse probability.
    fn analyze_history(&self, messages: &[serde_json::Value]) -> u64 {
        let mut cached = 0u64;
        let history_len = messages.len().saturating_sub(1);

        for msg in &messages[..history_len] {
            let text = message_text(msg);
            if text.is_empty() {
                continue;
            }

            let msg_tokens = estimate_tokens(&text) as f64;
            let p = self.history_probability(msg, &text);
            cached += (msg_tokens * p) as u64;
        }

        cached
    }

    fn history_probability(&self, msg: &serde_json::Value, text: &str) -> f64 {
        let t = &self.tuning;
        let mut p = t.history_base_p;

        if msg.get("role").and_then(|r| r.as_str()) == Some("system") {
            p += t.system_bonus_p;
        }

        let len = text.len();
        if len < 100 {
            p += t.short_bonus_p;
        } else if len < 500 {
            p += t.medium_bonus_p;
        }

        if has_repetitive_patterns(text) {
            p += t.repetition_bonus_p;
        }

        p.min(1.0)
    }
}

/// True iff the content has at least 10 words and repeats any 3-gram.
fn has_repetitive_patterns(content: &str) -> bool {
    let words: Vec<String> = content
        .to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect();
    if words.len() < 10 {
        return false;
    }

    let mut seen = HashSet::new();
    for window in words.windows(3) {
        let phrase = window.join(" ");
        if !seen.insert(phrase) {
            return true;
        }
    }
    false
}

/// Collapse message content to plain text (string or joined text parts).
fn message_text(msg: &serde_json::Value) -> String {
    match msg.get("content") {
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(serde_json::Value::Array(parts)) => parts
            .iter()
            .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// Short stable hash of message content (same scheme the gateway uses for
/// API key fingerprints).
fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn estimator() -> CacheEstimator {
        CacheEstimator::new(CacheTuning::default())
    }

    #[test]
    fn test_empty_messages() {
        let analysis = estimator().estimate(&[]);
        assert_eq!(analysis.estimated_cached_tokens, 0);
        assert_eq!(analysis.estimated_cache_hit_rate, 0.0);
    }

    #[test]
    fn test_repeated_system_message_counts_second_time() {
        let est = estimator();
        let system = "You keep the answers short and factual.";
        let first = est.estimate(&[
            json!({"role": "system", "content": system}),
            json!({"role": "user", "content": "First question"}),
        ]);
        assert_eq!(first.system_message_cached, 0);

        let second = est.estimate(&[
            json!({"role": "system", "content": system}),
            json!({"role": "user", "content": "A different question"}),
        ]);
        assert_eq!(
            second.system_message_cached,
            estimate_tokens(system) as u64
        );
        assert!(second.estimated_cached_tokens >= second.system_message_cached);
    }

    #[test]
    fn test_template_match_capped_at_quarter() {
        let est = estimator();
        let analysis = est.estimate(&[
            json!({"role": "user", "content": "Please analyze this function"}),
        ]);
        let content_tokens = estimate_tokens("Please analyze this function") as u64;
        assert!(analysis.template_cached <= content_tokens / 4);
    }

    #[test]
    fn test_cached_plus_fresh_bounded_by_total() {
        let est = estimator();
        let messages = vec![
            json!({"role": "system", "content": "You are a helpful assistant"}),
            json!({"role": "user", "content": "Explain lifetimes in Rust"}),
            json!({"role": "assistant", "content": "Lifetimes describe how long references are valid."}),
            json!({"role": "user", "content": "Now with an example"}),
        ];
        let total: u64 = messages
            .iter()
            .map(|m| estimate_content_tokens(m.get("content").unwrap()) as u64)
            .sum();

        let analysis = est.estimate(&messages);
        assert!(analysis.estimated_cached_tokens + analysis.estimated_fresh_tokens <= total);

        let denom = analysis.estimated_cached_tokens + analysis.estimated_fresh_tokens;
        if denom > 0 {
            let expected = analysis.estimated_cached_tokens as f64 / denom as f64;
            assert!((analysis.estimated_cache_hit_rate - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_repetitive_pattern_detection() {
        assert!(has_repetitive_patterns(
            "the cat sat on the mat and the cat sat on the mat again"
        ));
        assert!(!has_repetitive_patterns("short text"));
        assert!(!has_repetitive_patterns(
            "every word here appears exactly once without any repeats whatsoever today"
        ));
    }

    #[test]
    fn test_history_excludes_last_message() {
        let est = estimator();
        let analysis = est.estimate(&[json!({"role": "user", "content": "only message"})]);
        assert_eq!(analysis.conversation_history_cached, 0);
    }

    #[test]
    fn test_deterministic_for_same_state() {
        let est = estimator();
        let messages = vec![
            json!({"role": "user", "content": "How do I write a parser?"}),
            json!({"role": "assistant", "content": "Start with a lexer."}),
            json!({"role": "user", "content": "Show me"}),
        ];
        let a = est.estimate(&messages);
        let b = est.estimate(&messages);
        assert_eq!(a.estimated_cached_tokens, b.estimated_cached_tokens);
        assert_eq!(a.estimated_fresh_tokens, b.estimated_fresh_tokens);
    }
}
