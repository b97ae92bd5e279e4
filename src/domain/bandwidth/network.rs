use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Route over which retrievals travel. Bandwidth is budgeted independently
/// per network, so every bucket, plan and allocation is keyed by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Network {
    #[serde(rename = "OPSNET")]
    Opsnet,
    #[serde(rename = "SBN")]
    Sbn,
}

impl Network {
    pub const ALL: [Network; 2] = [Network::Opsnet, Network::Sbn];
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Opsnet => write!(f, "OPSNET"),
            Network::Sbn => write!(f, "SBN"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OPSNET" => Ok(Network::Opsnet),
            "SBN" => Ok(Network::Sbn),
            other => Err(format!("Unknown network route: {}", other)),
        }
    }
}
