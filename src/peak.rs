use serde::{Deserialize, Serialize};

use crate::errors::ValidationIssue;
use crate::scoring::QualificationTier;

/// Pipeline stages of an active opportunity, in progression order.
///
/// Stages outside this lifecycle (closed-won, closed-lost and other statuses
/// owned by the upstream CRM) are not modeled here; transition requests on
/// such opportunities are rejected as validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakStage {
    Prospecting,
    Engaging,
    Advancing,
    KeyDecision,
}

impl PeakStage {
    pub const ALL: [PeakStage; 4] = [
        PeakStage::Prospecting,
        PeakStage::Engaging,
        PeakStage::Advancing,
        PeakStage::KeyDecision,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PeakStage::Prospecting => "prospecting",
            PeakStage::Engaging => "engaging",
            PeakStage::Advancing => "advancing",
            PeakStage::KeyDecision => "key_decision",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "prospecting" => Some(PeakStage::Prospecting),
            "engaging" => Some(PeakStage::Engaging),
            "advancing" => Some(PeakStage::Advancing),
            "key_decision" => Some(PeakStage::KeyDecision),
            _ => None,
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for PeakStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a requested stage transition was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionDenial {
    /// The opportunity is already in the requested stage.
    SameStage(PeakStage),
    /// Forward moves may only advance to the immediate next stage.
    SkipForward { from: PeakStage, to: PeakStage },
    /// Entering the final stage requires a sufficiently qualified opportunity.
    QualificationGate {
        required: QualificationTier,
        actual: QualificationTier,
    },
}

impl TransitionDenial {
    pub fn into_issue(self) -> ValidationIssue {
        match self {
            TransitionDenial::SameStage(stage) => ValidationIssue::new(
                "to_stage",
                "same_stage",
                format!("Opportunity is already in stage '{}'", stage),
            ),
            TransitionDenial::SkipForward { from, to } => ValidationIssue::new(
                "to_stage",
                "skip_forward",
                format!(
                    "Cannot move from '{}' directly to '{}'; forward moves advance one stage at a time",
                    from, to
                ),
            ),
            TransitionDenial::QualificationGate { required, actual } => ValidationIssue::new(
                "to_stage",
                "qualification_gate",
                format!(
                    "Entering '{}' requires at least a '{}' qualification tier (current: '{}')",
                    PeakStage::KeyDecision,
                    required,
                    actual
                ),
            ),
        }
    }
}

/// Minimum tier an opportunity must hold to enter the final stage.
pub const KEY_DECISION_GATE: QualificationTier = QualificationTier::Good;

/// Checks whether a stage transition is allowed.
///
/// Forward moves are restricted to the immediate next stage; backward moves
/// to any earlier stage are always allowed; a no-op move to the current
/// stage is refused. Entering `KeyDecision` additionally requires the
/// opportunity's qualification tier to be at least `Good`. Passing `None`
/// for the tier skips that gate, which is how callers behave when the
/// scoring configuration is degraded and no meaningful tier exists.
pub fn validate_transition(
    from: PeakStage,
    to: PeakStage,
    tier: Option<QualificationTier>,
) -> Result<(), TransitionDenial> {
    if to == from {
        return Err(TransitionDenial::SameStage(to));
    }
    if to.index() > from.index() {
        if to.index() != from.index() + 1 {
            return Err(TransitionDenial::SkipForward { from, to });
        }
        if to == PeakStage::KeyDecision {
            if let Some(actual) = tier {
                if actual < KEY_DECISION_GATE {
                    return Err(TransitionDenial::QualificationGate {
                        required: KEY_DECISION_GATE,
                        actual,
                    });
                }
            }
        }
    }
    Ok(())
}
