// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Memory pressure levels for the cache.
//!
//! Pressure is the fraction of the configured byte budget currently in use.
//! The level selects how aggressively [`crate::cache::TieredCache`] cleans up;
//! resource pressure is handled internally via eviction and never surfaced as
//! an error.
//!
//! # Example
//!
//! ```
//! use community_sync::{PressureLevel, CleanupTier};
//!
//! let level = PressureLevel::from_pressure(0.5);
//! assert_eq!(level, PressureLevel::Normal);
//! assert!(level.cleanup_tier().is_none());
//!
//! let level = PressureLevel::from_pressure(0.96);
//! assert_eq!(level, PressureLevel::Critical);
//! assert_eq!(level.cleanup_tier(), Some(CleanupTier::Aggressive));
//! ```

use crate::cache::eviction::CleanupTier;

/// Cache pressure level based on used/budget ratio.
///
/// - **Normal** (< 80%): no proactive cleanup
/// - **Elevated** (80-90%): gentle cleanup
/// - **High** (90-95%): moderate cleanup
/// - **Critical** (>= 95%): aggressive cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal = 0,
    Elevated = 1,
    High = 2,
    Critical = 3,
}

impl PressureLevel {
    /// Calculate pressure level from a usage ratio (0.0 → 1.0+).
    #[must_use]
    pub fn from_pressure(pressure: f64) -> Self {
        match pressure {
            p if p < 0.80 => Self::Normal,
            p if p < 0.90 => Self::Elevated,
            p if p < 0.95 => Self::High,
            _ => Self::Critical,
        }
    }

    /// Cleanup tier this level calls for, if any.
    #[must_use]
    pub fn cleanup_tier(&self) -> Option<CleanupTier> {
        match self {
            Self::Normal => None,
            Self::Elevated => Some(CleanupTier::Gentle),
            Self::High => Some(CleanupTier::Moderate),
            Self::Critical => Some(CleanupTier::Aggressive),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Elevated => "Elevated - gentle cleanup",
            Self::High => "High - moderate cleanup",
            Self::Critical => "Critical - aggressive cleanup",
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_level_thresholds() {
        assert_eq!(PressureLevel::from_pressure(0.0), PressureLevel::Normal);
        assert_eq!(PressureLevel::from_pressure(0.79), PressureLevel::Normal);
        assert_eq!(PressureLevel::from_pressure(0.80), PressureLevel::Elevated);
        assert_eq!(PressureLevel::from_pressure(0.89), PressureLevel::Elevated);
        assert_eq!(PressureLevel::from_pressure(0.90), PressureLevel::High);
        assert_eq!(PressureLevel::from_pressure(0.94), PressureLevel::High);
        assert_eq!(PressureLevel::from_pressure(0.95), PressureLevel::Critical);
        assert_eq!(PressureLevel::from_pressure(1.5), PressureLevel::Critical);
    }

    #[test]
    fn test_cleanup_tier_mapping() {
        assert_eq!(PressureLevel::Normal.cleanup_tier(), None);
        assert_eq!(PressureLevel::Elevated.cleanup_tier(), Some(CleanupTier::Gentle));
        assert_eq!(PressureLevel::High.cleanup_tier(), Some(CleanupTier::Moderate));
        assert_eq!(PressureLevel::Critical.cleanup_tier(), Some(CleanupTier::Aggressive));
    }

    #[test]
    fn test_level_ordering() {
        assert!(PressureLevel::Normal < PressureLevel::Elevated);
        assert!(PressureLevel::Elevated < PressureLevel::High);
        assert!(PressureLevel::High < PressureLevel::Critical);
    }
}
