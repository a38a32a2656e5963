use serde::Serialize;
use std::fmt;

/// Fixed capture bitrate tiers. No adaptive bitrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    Standard,
    High,
    Ultra,
}

impl QualityTier {
    pub const ALL: [QualityTier; 5] = [
        QualityTier::Low,
        QualityTier::Medium,
        QualityTier::Standard,
        QualityTier::High,
        QualityTier::Ultra,
    ];

    pub fn bitrate_bps(self) -> u32 {
        match self {
            QualityTier::Low => 150_000,
            QualityTier::Medium => 500_000,
            QualityTier::Standard => 1_000_000,
            QualityTier::High => 2_500_000,
            QualityTier::Ultra => 5_000_000,
        }
    }

    /// Highest tier not above `target`; the lowest tier when `target` is
    /// below every tier; `Standard` when unset.
    pub fn for_target(target: Option<u32>) -> Self {
        let Some(target) = target else {
            return QualityTier::default();
        };

        Self::ALL
            .iter()
            .rev()
            .copied()
            .find(|tier| tier.bitrate_bps() <= target)
            .unwrap_or(QualityTier::Low)
    }
}

impl Default for QualityTier {
    fn default() -> Self {
        QualityTier::Standard
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityTier::Low => "low",
            QualityTier::Medium => "medium",
            QualityTier::Standard => "standard",
            QualityTier::High => "high",
            QualityTier::Ultra => "ultra",
        };
        f.write_str(name)
    }
}
