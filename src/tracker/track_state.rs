use serde::{Deserialize, Serialize};

/// Track state enumeration for the vehicle lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    /// Newly created track, not yet confirmed
    #[default]
    Tentative,
    /// Confirmed by consecutive matches
    Active,
    /// Crossed a counting line; its record has been emitted
    Counted,
    /// Removed from tracking
    Retired,
}

impl TrackState {
    /// Confirmed tracks are the ones shown and counted.
    pub fn is_confirmed(self) -> bool {
        matches!(self, Self::Active | Self::Counted)
    }
}
