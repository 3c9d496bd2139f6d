//! Deterministic intent classification.
//!
//! A cheap keyword pass runs before anything touches the network. Cue
//! lists cover mixed Thai/English questions: aggregation and data words
//! vote for the SQL agent, document and policy words vote for retrieval.
//! Only a genuinely ambiguous question earns an LLM routing call, and
//! that verdict is cached by normalized question hash.

use askgate_core::AgentType;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time::Instant;

/// What the keyword pass concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Counts, sums, ranges, tabular lookups
    Structured,
    /// Policies, manuals, free-text knowledge
    Unstructured,
    Ambiguous,
}

/// Cues that point at the tenant database. Mixed Thai/English on purpose:
/// real questions arrive in both, often in one sentence.
const STRUCTURED_CUES: &[&str] = &[
    // English aggregation and data words
    "how many", "count", "sum", "total", "average", "avg", "maximum", "minimum", "highest",
    "lowest", "top ", "list all", "per month", "per year", "between", "revenue", "salary",
    "price", "amount", "orders", "invoice", "quantity", "last month", "this year", "table",
    // Thai: กี่ = how many, จำนวน = count/amount, รวม = sum, เฉลี่ย = average,
    // สูงสุด/ต่ำสุด = max/min, ยอดขาย = sales, ราคา = price, เงินเดือน = salary,
    // บาท = baht, ตาราง = table, กี่คน = how many people, ล่าสุด = latest
    "กี่", "จำนวน", "รวม", "เฉลี่ย", "สูงสุด", "ต่ำสุด", "ยอดขาย", "ราคา", "เงินเดือน",
    "บาท", "ตาราง", "กี่คน", "ล่าสุด", "เดือนที่แล้ว", "ปีนี้",
];

/// Cues that point at the knowledge base.
const UNSTRUCTURED_CUES: &[&str] = &[
    "policy", "policies", "explain", "what is", "how do i", "how to", "procedure", "process",
    "document", "manual", "guideline", "regulation", "rule", "benefit", "describe", "summarize",
    "why",
    // Thai: นโยบาย = policy, อธิบาย = explain, คืออะไร = what is, วิธี = how to,
    // ขั้นตอน = procedure, เอกสาร = document, คู่มือ = manual, ระเบียบ = regulation,
    // สรุป = summarize, การลา = taking leave, สวัสดิการ = benefits
    "นโยบาย", "อธิบาย", "คืออะไร", "วิธี", "ขั้นตอน", "เอกสาร", "คู่มือ", "ระเบียบ",
    "สรุป", "การลา", "สวัสดิการ", "ทำไม", "ทำอย่างไร",
];

fn score(question: &str, cues: &[&str]) -> usize {
    cues.iter().filter(|cue| question.contains(*cue)).count()
}

/// Classifies a question by keyword cues alone.
pub fn classify(question: &str) -> Intent {
    let normalized = normalize(question);
    let structured = score(&normalized, STRUCTURED_CUES);
    let unstructured = score(&normalized, UNSTRUCTURED_CUES);

    if structured > 0 && unstructured == 0 {
        Intent::Structured
    } else if unstructured > 0 && structured == 0 {
        Intent::Unstructured
    } else if structured >= unstructured + 2 {
        Intent::Structured
    } else if unstructured >= structured + 2 {
        Intent::Unstructured
    } else {
        Intent::Ambiguous
    }
}

/// Lowercases and collapses whitespace so hashing and cue matching are
/// stable across formatting differences.
pub fn normalize(question: &str) -> String {
    question
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn question_hash(normalized: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);
    hasher.finish()
}

/// TTL cache for LLM routing verdicts, keyed by normalized question hash.
pub struct RoutingCache {
    entries: DashMap<u64, (AgentType, Instant)>,
    ttl: Duration,
}

impl RoutingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, question: &str) -> Option<AgentType> {
        let key = question_hash(&normalize(question));
        let entry = self.entries.get(&key)?;
        let (agent, stored) = *entry;
        if stored.elapsed() < self.ttl {
            Some(agent)
        } else {
            drop(entry);
            self.entries.remove(&key);
            None
        }
    }

    pub fn put(&self, question: &str, agent: AgentType) {
        let key = question_hash(&normalize(question));
        self.entries.insert(key, (agent, Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_count_questions_are_structured() {
        assert_eq!(classify("How many employees are in IT?"), Intent::Structured);
        assert_eq!(classify("Total revenue between January and March"), Intent::Structured);
    }

    #[test]
    fn thai_count_questions_are_structured() {
        assert_eq!(classify("พนักงานแผนกไอทีมีกี่คน"), Intent::Structured);
        assert_eq!(classify("ยอดขายรวมเดือนที่แล้วเท่าไหร่"), Intent::Structured);
    }

    #[test]
    fn policy_questions_are_unstructured() {
        assert_eq!(classify("Explain the leave policy"), Intent::Unstructured);
        assert_eq!(classify("อธิบายนโยบายการลางาน"), Intent::Unstructured);
    }

    #[test]
    fn greetings_are_ambiguous() {
        assert_eq!(classify("hello there"), Intent::Ambiguous);
        assert_eq!(classify("สวัสดีครับ"), Intent::Ambiguous);
    }

    #[test]
    fn mixed_cues_need_a_clear_margin() {
        // one cue each way -> ambiguous
        assert_eq!(
            classify("explain the total for last month"),
            Intent::Ambiguous
        );
    }

    #[test]
    fn normalization_is_case_and_space_insensitive() {
        assert_eq!(normalize("  How   MANY\nrows "), "how many rows");
    }

    #[tokio::test]
    async fn routing_cache_hits_normalize_and_expire() {
        let cache = RoutingCache::new(Duration::from_secs(600));
        cache.put("How many employees?", AgentType::Postgres);
        assert_eq!(cache.get("how many   employees?"), Some(AgentType::Postgres));
        assert_eq!(cache.get("a different question"), None);

        // zero TTL: every entry is already stale
        let cache = RoutingCache::new(Duration::ZERO);
        cache.put("How many employees?", AgentType::Postgres);
        assert_eq!(cache.get("How many employees?"), None);
    }
}
