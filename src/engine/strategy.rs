// Driftlab Engine — Strategy Table
//
// Per-strategy aggregate statistics with ε-greedy selection. Each worker
// owns its table exclusively; there is no internal locking. Selection
// happens before the model call, and the selected tag is what gets
// recorded on the response; the model's own wording never re-labels it.

use crate::atoms::types::StrategyKind;
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

// ── Records ────────────────────────────────────────────────────────────────

/// Aggregate statistics for one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub kind: StrategyKind,
    pub usage_count: u64,
    pub success_count: u64,
    pub violation_count: u64,
    pub cumulative_reward: f64,
    pub average_reward: f64,
    pub selection_probability: f64,
    pub score: f64,
}

impl StrategyRecord {
    fn new(kind: StrategyKind) -> Self {
        StrategyRecord {
            kind,
            usage_count: 0,
            success_count: 0,
            violation_count: 0,
            cumulative_reward: 0.0,
            average_reward: 0.0,
            selection_probability: 1.0 / StrategyKind::ALL.len() as f64,
            score: 0.0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.usage_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.usage_count as f64
    }

    pub fn violation_rate(&self) -> f64 {
        if self.usage_count == 0 {
            return 0.0;
        }
        self.violation_count as f64 / self.usage_count as f64
    }

    /// score = 0.6·success_rate + 0.4·clamp((avg_reward+100)/200, 0, 1)
    ///         − 0.5·violation_rate
    fn recompute_score(&mut self) {
        let reward_score = ((self.average_reward + 100.0) / 200.0).clamp(0.0, 1.0);
        self.score =
            0.6 * self.success_rate() + 0.4 * reward_score - 0.5 * self.violation_rate();
    }
}

// ── Table ──────────────────────────────────────────────────────────────────

/// The four predefined strategies in insertion order (which is also the
/// argmax tie-break order).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyTable {
    records: Vec<StrategyRecord>,
    epsilon: f64,
}

impl StrategyTable {
    pub fn new(epsilon: f64) -> Self {
        StrategyTable {
            records: StrategyKind::ALL.iter().map(|k| StrategyRecord::new(*k)).collect(),
            epsilon,
        }
    }

    /// ε-greedy selection: with probability ε pick uniformly at random,
    /// otherwise pick the highest-scoring strategy (first on ties).
    pub fn select<R: Rng>(&self, rng: &mut R) -> StrategyKind {
        if self.epsilon > 0.0 && rng.gen::<f64>() < self.epsilon {
            let idx = rng.gen_range(0..self.records.len());
            return self.records[idx].kind;
        }

        let mut best = &self.records[0];
        for record in &self.records[1..] {
            if record.score > best.score {
                best = record;
            }
        }
        best.kind
    }

    /// Fold one scored experience into the matching record, then recompute
    /// every score and selection probability.
    pub fn record_outcome(&mut self, kind: StrategyKind, reward: f64, success: bool, violation: bool) {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.kind == kind)
            .expect("all strategy kinds are predefined");

        record.usage_count += 1;
        record.cumulative_reward += reward;
        record.average_reward = record.cumulative_reward / record.usage_count as f64;
        // An episode is a success or a violation, never both; anything else
        // is neutral. Keeps success + violation ≤ usage per record.
        if violation {
            record.violation_count += 1;
        } else if success {
            record.success_count += 1;
        }
        record.recompute_score();

        self.refresh_probabilities();

        debug!(
            "[strategy] {} usage={} avg_reward={:.2} score={:.3}",
            kind.as_str(),
            self.get(kind).usage_count,
            self.get(kind).average_reward,
            self.get(kind).score,
        );
    }

    /// probability = score / Σscore; equal shares when no score is positive.
    fn refresh_probabilities(&mut self) {
        let total: f64 = self.records.iter().map(|r| r.score.max(0.0)).sum();
        let uniform = 1.0 / self.records.len() as f64;
        for record in &mut self.records {
            record.selection_probability = if total > 0.0 {
                record.score.max(0.0) / total
            } else {
                uniform
            };
        }
    }

    pub fn get(&self, kind: StrategyKind) -> &StrategyRecord {
        self.records
            .iter()
            .find(|r| r.kind == kind)
            .expect("all strategy kinds are predefined")
    }

    pub fn records(&self) -> &[StrategyRecord] {
        &self.records
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Restore pristine records (equal probabilities, zero counters).
    pub fn reset(&mut self) {
        self.records = StrategyKind::ALL.iter().map(|k| StrategyRecord::new(*k)).collect();
    }
}
