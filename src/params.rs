//! Chain parameters: fork schedule, consensus engine selection and the
//! compatibility check run when a stored configuration meets a new one.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 3;
pub const VERSION_PATCH: u32 = 0;

/// On-disk schema revision written by this build.
pub const BLOCKCHAIN_VERSION: u64 = 3;

/// Largest extra-data payload a sealed header may carry.
pub const MAXIMUM_EXTRA_DATA_SIZE: usize = 32;

pub const MAINNET_CHAIN_ID: u64 = 1717;

/// Packed build version, `major << 16 | minor << 8 | patch`.
pub fn packed_version() -> u32 {
    VERSION_MAJOR << 16 | VERSION_MINOR << 8 | VERSION_PATCH
}

/// Consensus family a chain runs, with its engine-specific parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EngineConfig {
    /// Stake-weighted producer rotation.
    Ipos,
    /// Hash-based proof-of-work; `difficulty` is the number of leading zero bits.
    Ethash {
        #[serde(default = "default_difficulty")]
        difficulty: u32,
    },
    /// Permissioned signer set.
    Clique {
        #[serde(default = "default_period")]
        period: u64,
    },
}

impl EngineConfig {
    pub fn name(&self) -> &'static str {
        match self {
            EngineConfig::Ipos => "ipos",
            EngineConfig::Ethash { .. } => "ethash",
            EngineConfig::Clique { .. } => "clique",
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::Ipos
    }
}

fn default_difficulty() -> u32 {
    8
}

fn default_period() -> u64 {
    15
}

/// Rules governing which protocol changes apply at which height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homestead_block: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eip150_block: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eip155_block: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eip158_block: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byzantium_block: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constantinople_block: Option<u64>,
    /// Engine to run; `None` selects the default engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineConfig>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::mainnet()
    }
}

fn is_forked(fork: Option<u64>, height: u64) -> bool {
    fork.is_some_and(|at| at <= height)
}

impl ChainConfig {
    pub fn mainnet() -> Self {
        Self {
            chain_id: MAINNET_CHAIN_ID,
            homestead_block: Some(0),
            eip150_block: Some(0),
            eip155_block: Some(0),
            eip158_block: Some(0),
            byzantium_block: Some(0),
            constantinople_block: None,
            engine: None,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        self.engine.clone().unwrap_or_default()
    }

    pub fn is_eip155(&self, height: u64) -> bool {
        is_forked(self.eip155_block, height)
    }

    fn forks(&self) -> [(&'static str, Option<u64>); 6] {
        [
            ("Homestead fork block", self.homestead_block),
            ("EIP150 fork block", self.eip150_block),
            ("EIP155 fork block", self.eip155_block),
            ("EIP158 fork block", self.eip158_block),
            ("Byzantium fork block", self.byzantium_block),
            ("Constantinople fork block", self.constantinople_block),
        ]
    }

    /// Lowest height at which `self` (stored) and `new` apply different rules.
    pub fn first_divergence(&self, new: &ChainConfig) -> Option<ConfigCompatError> {
        let mut lowest: Option<ConfigCompatError> = None;
        let mut consider = |err: ConfigCompatError| {
            if lowest.as_ref().map_or(true, |cur| err.rewind_to < cur.rewind_to) {
                lowest = Some(err);
            }
        };

        if self.chain_id != new.chain_id {
            consider(ConfigCompatError::new(
                "chain id",
                Some(self.chain_id),
                Some(new.chain_id),
                0,
            ));
        }
        if self.engine_config() != new.engine_config() {
            consider(ConfigCompatError::new("consensus engine", None, None, 0));
        }
        for ((what, stored), (_, wanted)) in self.forks().into_iter().zip(new.forks()) {
            if stored == wanted {
                continue;
            }
            let at = match (stored, wanted) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) | (None, Some(a)) => a,
                (None, None) => continue,
            };
            consider(ConfigCompatError::new(what, stored, wanted, at));
        }

        lowest
    }

    /// Classify how `new` relates to `self` for a chain whose head is at `head`.
    pub fn check_compatible(&self, new: &ChainConfig, head: u64) -> Compatibility {
        match self.first_divergence(new) {
            None => Compatibility::Compatible,
            Some(err) if err.rewind_to > head => Compatibility::Rewind(err),
            Some(err) => Compatibility::Conflict(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    /// Both configurations apply identical rules at every height.
    Compatible,
    /// Rules diverge only above the current head.
    Rewind(ConfigCompatError),
    /// Rules diverge at or below the current head.
    Conflict(ConfigCompatError),
}

/// Describes where two chain configurations diverge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigCompatError {
    pub what: String,
    pub stored: Option<u64>,
    pub new: Option<u64>,
    pub rewind_to: u64,
}

impl ConfigCompatError {
    fn new(what: &str, stored: Option<u64>, new: Option<u64>, rewind_to: u64) -> Self {
        Self {
            what: what.to_string(),
            stored,
            new,
            rewind_to,
        }
    }
}

fn fmt_height(h: Option<u64>) -> String {
    h.map_or_else(|| "nil".to_string(), |h| h.to_string())
}

impl fmt::Display for ConfigCompatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "mismatching {} in database (have {}, want {}, rewindto {})",
            self.what,
            fmt_height(self.stored),
            fmt_height(self.new),
            self.rewind_to
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_constantinople(at: Option<u64>) -> ChainConfig {
        ChainConfig {
            constantinople_block: at,
            ..ChainConfig::mainnet()
        }
    }

    #[test]
    fn test_identical_configs_are_compatible() {
        let cfg = ChainConfig::mainnet();
        assert_eq!(cfg.check_compatible(&cfg.clone(), 1_000), Compatibility::Compatible);
    }

    #[test]
    fn test_moving_future_fork_earlier_requests_rewind() {
        let stored = with_constantinople(Some(200));
        let new = with_constantinople(Some(150));
        match stored.check_compatible(&new, 100) {
            Compatibility::Rewind(err) => {
                assert_eq!(err.rewind_to, 150);
                assert_eq!(err.stored, Some(200));
                assert_eq!(err.new, Some(150));
            }
            other => panic!("expected rewind, got {:?}", other),
        }
    }

    #[test]
    fn test_scheduling_new_fork_diverges_at_its_height() {
        let stored = with_constantinople(None);
        let new = with_constantinople(Some(500));
        assert!(matches!(
            stored.check_compatible(&new, 499),
            Compatibility::Rewind(ConfigCompatError { rewind_to: 500, .. })
        ));
        assert!(matches!(
            stored.check_compatible(&new, 500),
            Compatibility::Conflict(ConfigCompatError { rewind_to: 500, .. })
        ));
    }

    #[test]
    fn test_divergence_below_head_conflicts() {
        let stored = with_constantinople(Some(50));
        let new = with_constantinople(Some(80));
        assert!(matches!(stored.check_compatible(&new, 100), Compatibility::Conflict(_)));
    }

    #[test]
    fn test_lowest_divergence_wins() {
        let stored = ChainConfig {
            byzantium_block: Some(300),
            constantinople_block: Some(400),
            ..ChainConfig::mainnet()
        };
        let new = ChainConfig {
            byzantium_block: Some(250),
            constantinople_block: Some(260),
            ..ChainConfig::mainnet()
        };
        let err = stored.first_divergence(&new).unwrap();
        assert_eq!(err.what, "Byzantium fork block");
        assert_eq!(err.rewind_to, 250);
    }

    #[test]
    fn test_chain_id_change_diverges_at_genesis() {
        let stored = ChainConfig::mainnet();
        let new = ChainConfig {
            chain_id: 7,
            ..ChainConfig::mainnet()
        };
        let err = stored.first_divergence(&new).unwrap();
        assert_eq!(err.rewind_to, 0);
        assert!(matches!(stored.check_compatible(&new, 0), Compatibility::Conflict(_)));
    }

    #[test]
    fn test_default_engine_equals_explicit_ipos_default() {
        let implicit = ChainConfig::mainnet();
        let explicit = ChainConfig {
            engine: Some(EngineConfig::default()),
            ..ChainConfig::mainnet()
        };
        assert!(implicit.first_divergence(&explicit).is_none());
    }

    #[test]
    fn test_engine_config_roundtrips_through_json() {
        let cfg = ChainConfig {
            engine: Some(EngineConfig::Clique { period: 5 }),
            ..ChainConfig::mainnet()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"type\":\"clique\""));
        let back: ChainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_compat_error_display() {
        let err = ConfigCompatError::new("Byzantium fork block", Some(10), None, 10);
        assert_eq!(
            err.to_string(),
            "mismatching Byzantium fork block in database (have 10, want nil, rewindto 10)"
        );
    }
}
