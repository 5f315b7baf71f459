//! Selection strategies shared by the worker pool and the proxy manager.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AcquisitionError;

/// Something a strategy can choose between.
pub trait Candidate {
    /// Stable registry slot of the candidate.
    fn slot(&self) -> usize;
    /// Higher is better. Only consulted by [`RotationStrategy::Performance`].
    fn score(&self) -> f64;
}

/// How to pick one resource out of the currently eligible set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Cycle through slots in order, for fairness.
    #[default]
    RoundRobin,
    /// Pick the best recent performer; ties go to the next slot in rotation.
    Performance,
}

impl RotationStrategy {
    /// Choose a candidate.
    ///
    /// `cursor` is the slot the rotation would like to continue from; round
    /// robin takes the first eligible slot at or after it, wrapping around.
    pub fn select_instance<'a, C: Candidate>(
        &self,
        candidates: &'a [C],
        cursor: usize,
    ) -> Option<&'a C> {
        if candidates.is_empty() {
            return None;
        }
        let rotation_rank = |c: &C| {
            let slot = c.slot();
            if slot >= cursor {
                (0, slot)
            } else {
                (1, slot)
            }
        };
        match self {
            Self::RoundRobin => candidates.iter().min_by_key(|c| rotation_rank(c)),
            Self::Performance => candidates.iter().max_by(|a, b| {
                a.score()
                    .partial_cmp(&b.score())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // on equal scores the earlier slot in rotation wins
                    .then_with(|| rotation_rank(b).cmp(&rotation_rank(a)))
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Performance => "performance",
        }
    }
}

impl FromStr for RotationStrategy {
    type Err = AcquisitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "performance" | "weighted" => Ok(Self::Performance),
            other => Err(AcquisitionError::Config(format!(
                "unknown rotation strategy `{other}` (expected round_robin or performance)"
            ))),
        }
    }
}
