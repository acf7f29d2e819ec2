use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The nine qualification pillars tracked on every opportunity.
///
/// Each pillar is backed by a free-text evidence field on the opportunity
/// record; scoring looks only at whether the field is filled in and how
/// substantial the text is, never at its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pillar {
    Metrics,
    EconomicBuyer,
    DecisionCriteria,
    DecisionProcess,
    PaperProcess,
    IdentifyPain,
    ImplicatePain,
    Champion,
    Competition,
}

impl Pillar {
    pub const ALL: [Pillar; 9] = [
        Pillar::Metrics,
        Pillar::EconomicBuyer,
        Pillar::DecisionCriteria,
        Pillar::DecisionProcess,
        Pillar::PaperProcess,
        Pillar::IdentifyPain,
        Pillar::ImplicatePain,
        Pillar::Champion,
        Pillar::Competition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Pillar::Metrics => "metrics",
            Pillar::EconomicBuyer => "economic_buyer",
            Pillar::DecisionCriteria => "decision_criteria",
            Pillar::DecisionProcess => "decision_process",
            Pillar::PaperProcess => "paper_process",
            Pillar::IdentifyPain => "identify_pain",
            Pillar::ImplicatePain => "implicate_pain",
            Pillar::Champion => "champion",
            Pillar::Competition => "competition",
        }
    }
}

/// The pillar evidence texts of a single opportunity, one optional field per pillar.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PillarTexts {
    pub metrics: Option<String>,
    pub economic_buyer: Option<String>,
    pub decision_criteria: Option<String>,
    pub decision_process: Option<String>,
    pub paper_process: Option<String>,
    pub identify_pain: Option<String>,
    pub implicate_pain: Option<String>,
    pub champion: Option<String>,
    pub competition: Option<String>,
}

impl PillarTexts {
    pub fn get(&self, pillar: Pillar) -> Option<&str> {
        match pillar {
            Pillar::Metrics => self.metrics.as_deref(),
            Pillar::EconomicBuyer => self.economic_buyer.as_deref(),
            Pillar::DecisionCriteria => self.decision_criteria.as_deref(),
            Pillar::DecisionProcess => self.decision_process.as_deref(),
            Pillar::PaperProcess => self.paper_process.as_deref(),
            Pillar::IdentifyPain => self.identify_pain.as_deref(),
            Pillar::ImplicatePain => self.implicate_pain.as_deref(),
            Pillar::Champion => self.champion.as_deref(),
            Pillar::Competition => self.competition.as_deref(),
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

/// Relative importance of each pillar in the overall score.
///
/// All weights default to 1.0 (equal importance). Overrides come from the
/// `SCORING_CONFIG` environment variable and may set any subset of fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PillarWeights {
    #[serde(default = "default_weight")]
    pub metrics: f64,
    #[serde(default = "default_weight")]
    pub economic_buyer: f64,
    #[serde(default = "default_weight")]
    pub decision_criteria: f64,
    #[serde(default = "default_weight")]
    pub decision_process: f64,
    #[serde(default = "default_weight")]
    pub paper_process: f64,
    #[serde(default = "default_weight")]
    pub identify_pain: f64,
    #[serde(default = "default_weight")]
    pub implicate_pain: f64,
    #[serde(default = "default_weight")]
    pub champion: f64,
    #[serde(default = "default_weight")]
    pub competition: f64,
}

impl Default for PillarWeights {
    fn default() -> Self {
        Self {
            metrics: 1.0,
            economic_buyer: 1.0,
            decision_criteria: 1.0,
            decision_process: 1.0,
            paper_process: 1.0,
            identify_pain: 1.0,
            implicate_pain: 1.0,
            champion: 1.0,
            competition: 1.0,
        }
    }
}

impl PillarWeights {
    pub fn get(&self, pillar: Pillar) -> f64 {
        match pillar {
            Pillar::Metrics => self.metrics,
            Pillar::EconomicBuyer => self.economic_buyer,
            Pillar::DecisionCriteria => self.decision_criteria,
            Pillar::DecisionProcess => self.decision_process,
            Pillar::PaperProcess => self.paper_process,
            Pillar::IdentifyPain => self.identify_pain,
            Pillar::ImplicatePain => self.implicate_pain,
            Pillar::Champion => self.champion,
            Pillar::Competition => self.competition,
        }
    }

    pub fn total(&self) -> f64 {
        Pillar::ALL.iter().map(|p| self.get(*p)).sum()
    }

    fn zeroed() -> Self {
        Self {
            metrics: 0.0,
            economic_buyer: 0.0,
            decision_criteria: 0.0,
            decision_process: 0.0,
            paper_process: 0.0,
            identify_pain: 0.0,
            implicate_pain: 0.0,
            champion: 0.0,
            competition: 0.0,
        }
    }
}

fn default_excellent() -> f64 {
    80.0
}

fn default_good() -> f64 {
    60.0
}

fn default_fair() -> f64 {
    40.0
}

/// Score percentages at which an opportunity enters each qualification tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierThresholds {
    #[serde(default = "default_excellent")]
    pub excellent: f64,
    #[serde(default = "default_good")]
    pub good: f64,
    #[serde(default = "default_fair")]
    pub fair: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            excellent: 80.0,
            good: 60.0,
            fair: 40.0,
        }
    }
}

fn default_quality_length() -> usize {
    40
}

/// Tunable scoring parameters, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub weights: PillarWeights,
    #[serde(default)]
    pub thresholds: TierThresholds,
    /// Pillar text at or above this many characters earns full credit;
    /// shorter non-empty text earns half credit.
    #[serde(default = "default_quality_length")]
    pub quality_length: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: PillarWeights::default(),
            thresholds: TierThresholds::default(),
            quality_length: default_quality_length(),
        }
    }
}

impl ScoringConfig {
    /// Builds the scoring configuration from an optional JSON override.
    ///
    /// Any subset of weights, thresholds and `quality_length` may be
    /// overridden. A malformed or unusable override never aborts startup;
    /// it degrades scoring so every assessment reports a zero score and
    /// the lowest tier until the configuration is fixed.
    pub fn from_env_json(raw: Option<&str>) -> Self {
        let config = match raw {
            None => Self::default(),
            Some(json) => match serde_json::from_str::<Self>(json) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse SCORING_CONFIG ({}); qualification scoring is degraded",
                        e
                    );
                    return Self::degraded();
                }
            },
        };
        if !config.is_usable() {
            tracing::warn!(
                "SCORING_CONFIG has unusable weights or thresholds; qualification scoring is degraded"
            );
        }
        config
    }

    /// Whether assessments computed under this configuration are meaningful.
    ///
    /// Requires every weight to be a finite non-negative number with a
    /// positive total, thresholds ordered `fair <= good <= excellent`
    /// within 0..=100, and a positive quality length.
    pub fn is_usable(&self) -> bool {
        let weights_ok = Pillar::ALL.iter().all(|p| {
            let w = self.weights.get(*p);
            w.is_finite() && w >= 0.0
        });
        let t = &self.thresholds;
        let thresholds_ok = t.fair.is_finite()
            && t.good.is_finite()
            && t.excellent.is_finite()
            && t.fair >= 0.0
            && t.fair <= t.good
            && t.good <= t.excellent
            && t.excellent <= 100.0;
        weights_ok && self.weights.total() > 0.0 && thresholds_ok && self.quality_length >= 1
    }

    /// A configuration that always fails `is_usable`, used when the override
    /// JSON cannot be parsed at all.
    fn degraded() -> Self {
        Self {
            weights: PillarWeights::zeroed(),
            ..Self::default()
        }
    }
}

/// Qualification tier of an opportunity, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualificationTier {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualificationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualificationTier::Poor => "poor",
            QualificationTier::Fair => "fair",
            QualificationTier::Good => "good",
            QualificationTier::Excellent => "excellent",
        }
    }
}

impl std::fmt::Display for QualificationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an overall percentage to its qualification tier.
pub fn classify(overall_pct: f64, thresholds: &TierThresholds) -> QualificationTier {
    if overall_pct >= thresholds.excellent {
        QualificationTier::Excellent
    } else if overall_pct >= thresholds.good {
        QualificationTier::Good
    } else if overall_pct >= thresholds.fair {
        QualificationTier::Fair
    } else {
        QualificationTier::Poor
    }
}

/// Score detail for a single pillar.
#[derive(Debug, Clone, Serialize)]
pub struct PillarScore {
    pub pillar: Pillar,
    /// Whether the pillar text is non-empty after trimming.
    pub populated: bool,
    /// Trimmed character count of the pillar text.
    pub chars: usize,
    /// Weighted credit earned: 0, half the weight, or the full weight.
    pub score: f64,
    /// The pillar's weight, i.e. the maximum attainable score.
    pub max: f64,
}

/// A complete qualification assessment of one opportunity.
#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    pub opportunity_id: Uuid,
    pub org_id: Uuid,
    pub pillar_scores: Vec<PillarScore>,
    /// Weighted completeness as a percentage of the attainable total, one decimal.
    pub overall_pct: f64,
    pub tier: QualificationTier,
    pub computed_at: DateTime<Utc>,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Scores one opportunity's pillar texts.
///
/// Per pillar: empty text earns no credit, non-empty text shorter than the
/// configured quality length earns half the pillar weight, longer text earns
/// the full weight. The overall percentage is the earned share of the total
/// attainable weight, rounded to one decimal, and the tier follows from the
/// configured thresholds.
///
/// Under an unusable configuration the result is pinned to a zero score and
/// the `Poor` tier; this function never panics on bad configuration.
pub fn assess(
    opportunity_id: Uuid,
    org_id: Uuid,
    texts: &PillarTexts,
    config: &ScoringConfig,
) -> Assessment {
    let usable = config.is_usable();
    let mut pillar_scores = Vec::with_capacity(Pillar::ALL.len());
    let mut earned = 0.0;
    let mut attainable = 0.0;

    for pillar in Pillar::ALL {
        let text = texts.get(pillar).map(str::trim).unwrap_or("");
        let chars = text.chars().count();
        let populated = chars > 0;
        let weight = if usable { config.weights.get(pillar) } else { 0.0 };
        let credit = if !populated {
            0.0
        } else if chars < config.quality_length {
            0.5
        } else {
            1.0
        };
        let score = credit * weight;
        earned += score;
        attainable += weight;
        pillar_scores.push(PillarScore {
            pillar,
            populated,
            chars,
            score,
            max: weight,
        });
    }

    let overall_pct = if usable && attainable > 0.0 {
        round1(100.0 * earned / attainable)
    } else {
        0.0
    };
    let tier = if usable {
        classify(overall_pct, &config.thresholds)
    } else {
        QualificationTier::Poor
    };

    Assessment {
        opportunity_id,
        org_id,
        pillar_scores,
        overall_pct,
        tier,
        computed_at: Utc::now(),
    }
}
