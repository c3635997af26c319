//! Value objects for the order domain.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DomainError;

/// Whether an order backs an outcome or lays (bets against) it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Back,
    Lay,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Back => "BACK",
            Side::Lay => "LAY",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = DomainError;

    /// Parses the wire form. Matching is exact: `"back"` is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BACK" => Ok(Side::Back),
            "LAY" => Ok(Side::Lay),
            other => Err(DomainError::InvalidSide(other.to_string())),
        }
    }
}
