//! Confidence model: `[0, 1]` scores with provenance.
//!
//! Every entity, relationship, table row, vector and similarity edge carries a
//! [`Confidence`]. Scores only move down through derivations ([`combine`] with `min` or
//! `product`, [`degrade`]); the single exception is [`revalidate`], which may raise a score on
//! new evidence and always logs it.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Rule used to fold several scores into one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CombineRule {
    /// The weakest input bounds the result.
    Min,
    /// Independent uncertainties multiply.
    Product,
    /// Weighted mean. Empty `weights` means equal weights.
    WeightedAverage { weights: Vec<f64> },
}

impl CombineRule {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Product => "product",
            Self::WeightedAverage { .. } => "weighted_average",
        }
    }

    /// `true` when the result can never exceed the smallest input.
    pub fn preserves_min_bound(&self) -> bool {
        matches!(self, Self::Min | Self::Product)
    }
}

impl std::fmt::Display for CombineRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CombineRule {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "min" => Ok(Self::Min),
            "product" => Ok(Self::Product),
            "weighted_average" | "weighted-average" => Ok(Self::WeightedAverage { weights: vec![] }),
            _ => Err(format!("unknown combine rule: {s}")),
        }
    }
}

/// How a score was derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// Supplied by the upstream extractor.
    Source,
    /// Folded from `inputs` scores with `rule`.
    Combined { rule: String, inputs: usize },
    /// Discounted by a lossy transformation.
    Degraded { factor: f64 },
    /// Raised by a re-validation step on new evidence.
    Revalidated { evidence: String },
}

/// A confidence score together with its derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confidence {
    pub score: f64,
    pub provenance: Provenance,
}

impl Confidence {
    /// A score supplied by an upstream producer.
    pub fn source(score: f64) -> Result<Self> {
        Ok(Self {
            score: validate(score)?,
            provenance: Provenance::Source,
        })
    }

    pub fn combined(scores: &[f64], rule: &CombineRule) -> Result<Self> {
        Ok(Self {
            score: combine(scores, rule)?,
            provenance: Provenance::Combined {
                rule: rule.name().to_string(),
                inputs: scores.len(),
            },
        })
    }

    pub fn degraded(&self, factor: f64) -> Result<Self> {
        Ok(Self {
            score: degrade(self.score, factor)?,
            provenance: Provenance::Degraded { factor },
        })
    }
}

/// Reject anything outside `[0, 1]` (NaN included).
pub fn validate(score: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&score) {
        Ok(score)
    } else {
        Err(Error::InvalidScore { value: score })
    }
}

/// Fold `scores` into a single score using `rule`.
pub fn combine(scores: &[f64], rule: &CombineRule) -> Result<f64> {
    if scores.is_empty() {
        return Err(Error::invalid_input("combine requires at least one score"));
    }
    for &s in scores {
        validate(s)?;
    }

    let combined = match rule {
        CombineRule::Min => scores.iter().copied().fold(1.0, f64::min),
        CombineRule::Product => scores.iter().product(),
        CombineRule::WeightedAverage { weights } => {
            let weights: Vec<f64> = if weights.is_empty() {
                vec![1.0; scores.len()]
            } else {
                weights.clone()
            };
            if weights.len() != scores.len() {
                return Err(Error::invalid_input(format!(
                    "weighted average needs {} weights, got {}",
                    scores.len(),
                    weights.len()
                )));
            }
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(Error::invalid_input("weights must be finite and non-negative"));
            }
            let total: f64 = weights.iter().sum();
            if total <= 0.0 {
                return Err(Error::invalid_input("weights must not all be zero"));
            }
            scores.iter().zip(&weights).map(|(s, w)| s * w).sum::<f64>() / total
        }
    };

    // Guard against float drift pushing a product or mean a hair outside the range.
    Ok(combined.clamp(0.0, 1.0))
}

/// Discount `score` by `factor` for a lossy transformation.
pub fn degrade(score: f64, factor: f64) -> Result<f64> {
    validate(score)?;
    validate(factor)?;
    Ok(score * factor)
}

/// Re-validation: the only derivation allowed to raise a score. Always logged.
pub fn revalidate(current: f64, evidence_score: f64, evidence: &str) -> Result<Confidence> {
    validate(current)?;
    validate(evidence_score)?;
    if evidence.trim().is_empty() {
        return Err(Error::invalid_input("re-validation requires an evidence reference"));
    }

    let score = current.max(evidence_score);
    tracing::info!(
        previous = current,
        revalidated = score,
        evidence = %evidence,
        "confidence re-validated"
    );
    Ok(Confidence {
        score,
        provenance: Provenance::Revalidated {
            evidence: evidence.to_string(),
        },
    })
}

/// Aggregate view over a set of scores, attached to every conversion result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl ConfidenceSummary {
    pub fn from_scores(scores: impl IntoIterator<Item = f64>) -> Self {
        let mut count = 0usize;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for s in scores {
            count += 1;
            min = min.min(s);
            max = max.max(s);
            sum += s;
        }
        if count == 0 {
            return Self::default();
        }
        Self {
            count,
            min,
            max,
            mean: sum / count as f64,
        }
    }
}
