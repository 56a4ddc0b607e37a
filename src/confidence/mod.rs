//! Per-decision risk and confidence scoring with pattern learning from
//! historical outcomes (§4.5). Grounded in `original_source`'s
//! `test_confidence_tracker.py`, which backs this by a sqlite `decisions`/
//! `patterns` pair keyed on a context fingerprint and compares combined
//! confidence against a risk-adjusted threshold — exactly the algorithm
//! below, now over `Store`.

use crate::config::ConfidenceConfig;
use crate::constants::FINGERPRINT_LENGTH;
use crate::models::{Decision, DecisionContext, Outcome, Pattern};
use crate::store::Store;
use crate::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct ConfidenceTracker {
    store: Arc<Store>,
    config: ConfidenceConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceResult {
    pub involve_human: bool,
    pub confidence: f64,
    pub fingerprint: String,
}

impl ConfidenceTracker {
    pub fn new(store: Arc<Store>, config: ConfidenceConfig) -> Self {
        Self { store, config }
    }

    /// (C1): pure and order-independent. The feature subset is canonicalized
    /// into a `BTreeMap` before hashing so key order never affects the
    /// fingerprint.
    pub fn fingerprint(&self, context: &DecisionContext) -> String {
        let mut canonical: BTreeMap<String, String> = BTreeMap::new();
        for feature in &self.config.fingerprint_features {
            let value = match feature.as_str() {
                "task_type" => context.task_type.clone(),
                "complexity" => context.complexity.clone(),
                "has_security_implications" => context.has_security_implications.to_string(),
                "has_architecture_changes" => context.has_architecture_changes.to_string(),
                "affects_performance" => context.affects_performance.to_string(),
                "is_customer_facing" => context.is_customer_facing.to_string(),
                "modifies_critical_path" => context.modifies_critical_path.to_string(),
                other => context.extra.get(other).cloned().unwrap_or_default(),
            };
            canonical.insert(feature.clone(), value);
        }
        let serialized = serde_json::to_string(&canonical).unwrap_or_default();
        let digest = Sha256::digest(serialized.as_bytes());
        hex::encode(digest)[..FINGERPRINT_LENGTH].to_string()
    }

    fn risk_score(&self, context: &DecisionContext) -> f64 {
        let mut risk = 0.0;
        if context.has_security_implications {
            risk += self.config.risk_weights.get("security").copied().unwrap_or(0.0);
        }
        if context.has_architecture_changes {
            risk += self
                .config
                .risk_weights
                .get("architecture")
                .copied()
                .unwrap_or(0.0);
        }
        if context.affects_performance {
            risk += self
                .config
                .risk_weights
                .get("performance")
                .copied()
                .unwrap_or(0.0);
        }
        if context.is_customer_facing {
            risk += self
                .config
                .risk_weights
                .get("customer_facing")
                .copied()
                .unwrap_or(0.0);
        }
        if context.modifies_critical_path {
            risk += self
                .config
                .risk_weights
                .get("critical_path")
                .copied()
                .unwrap_or(0.0);
        }
        risk.min(1.0)
    }

    pub fn should_involve_human(
        &self,
        context: &DecisionContext,
        agent_confidence: f64,
        external_confidence: f64,
    ) -> Result<ConfidenceResult> {
        let fingerprint = self.fingerprint(context);

        if let Some(pattern) = self.store.get_pattern(&fingerprint)? {
            if pattern.sample_count >= self.config.min_samples
                && pattern.success_rate > self.config.high_success_threshold
            {
                debug!(
                    fingerprint = %fingerprint,
                    success_rate = pattern.success_rate,
                    "pattern confidently learned, skipping human involvement"
                );
                return Ok(ConfidenceResult {
                    involve_human: false,
                    confidence: pattern.success_rate,
                    fingerprint,
                });
            }
        }

        let combined = (agent_confidence + external_confidence) / 2.0;
        let risk = self.risk_score(context);
        let threshold = if risk > 0.7 {
            self.config.high_risk_threshold
        } else {
            self.config.base_threshold
        };

        Ok(ConfidenceResult {
            involve_human: combined < threshold,
            confidence: combined,
            fingerprint,
        })
    }

    /// Inserts a `Decision` and folds the outcome into the fingerprint's
    /// `Pattern`. `Pending` outcomes are stored but do not move the success
    /// rate (C2 holds only across non-pending outcomes).
    pub fn record_outcome(
        &self,
        decision_id: impl Into<String>,
        context: &DecisionContext,
        agent_confidence: f64,
        external_confidence: f64,
        human_involved: bool,
        outcome: Outcome,
    ) -> Result<()> {
        let fingerprint = self.fingerprint(context);
        let decision = Decision {
            id: decision_id.into(),
            context_fingerprint: fingerprint.clone(),
            agent_confidence,
            external_confidence,
            human_involved,
            outcome,
            recorded_at: Utc::now(),
        };
        self.store.insert_decision(&decision)?;

        if outcome != Outcome::Pending {
            self.rebuild_pattern(&fingerprint)?;
        }
        Ok(())
    }

    pub fn update_outcome(&self, decision_id: &str, fingerprint: &str, outcome: Outcome) -> Result<()> {
        self.store.update_decision_outcome(decision_id, outcome)?;
        self.rebuild_pattern(fingerprint)
    }

    fn rebuild_pattern(&self, fingerprint: &str) -> Result<()> {
        let decisions = self.store.decisions_for_fingerprint(fingerprint)?;
        let counted: Vec<&Decision> = decisions
            .iter()
            .filter(|d| d.outcome != Outcome::Pending)
            .collect();
        if counted.is_empty() {
            return Ok(());
        }
        let successes = counted.iter().filter(|d| d.outcome == Outcome::Success).count();
        let pattern = Pattern {
            fingerprint: fingerprint.to_string(),
            success_rate: successes as f64 / counted.len() as f64,
            sample_count: counted.len() as u32,
            last_updated: Utc::now(),
        };
        self.store.upsert_pattern(&pattern)
    }

    pub fn cleanup_older_than(&self, days: i64) -> Result<usize> {
        self.store.cleanup_decisions_older_than(days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> ConfidenceConfig {
        let mut risk_weights = HashMap::new();
        risk_weights.insert("security".to_string(), 0.4);
        risk_weights.insert("architecture".to_string(), 0.3);
        risk_weights.insert("performance".to_string(), 0.2);
        risk_weights.insert("customer_facing".to_string(), 0.3);
        risk_weights.insert("critical_path".to_string(), 0.4);
        ConfidenceConfig {
            min_samples: 5,
            high_success_threshold: 0.9,
            base_threshold: 0.75,
            high_risk_threshold: 0.85,
            risk_weights,
            fingerprint_features: vec![
                "task_type".to_string(),
                "has_security_implications".to_string(),
                "has_architecture_changes".to_string(),
                "affects_performance".to_string(),
            ],
        }
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tracker = ConfidenceTracker::new(store, config());
        let mut context_a = DecisionContext::default();
        context_a.task_type = "code_generation".to_string();
        context_a.has_security_implications = true;
        let mut context_b = context_a.clone();
        context_b.extra.insert("zzz".to_string(), "ignored".to_string());
        assert_eq!(tracker.fingerprint(&context_a), tracker.fingerprint(&context_b));
    }

    #[test]
    fn risk_above_threshold_raises_bar() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tracker = ConfidenceTracker::new(store, config());
        let mut context = DecisionContext::default();
        context.has_security_implications = true;
        context.has_architecture_changes = true;
        let result = tracker.should_involve_human(&context, 0.8, 0.8).unwrap();
        assert!(!result.involve_human);

        context.affects_performance = true;
        let result = tracker.should_involve_human(&context, 0.8, 0.8).unwrap();
        assert!(result.involve_human);
    }

    #[test]
    fn confident_pattern_skips_human_even_with_low_combined_confidence() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tracker = ConfidenceTracker::new(Arc::clone(&store), config());
        let context = DecisionContext::default();

        for i in 0..6 {
            tracker
                .record_outcome(
                    format!("d{i}"),
                    &context,
                    0.9,
                    0.9,
                    false,
                    Outcome::Success,
                )
                .unwrap();
        }

        let result = tracker.should_involve_human(&context, 0.1, 0.1).unwrap();
        assert!(!result.involve_human);
        assert_eq!(result.confidence, 1.0);
    }
}
