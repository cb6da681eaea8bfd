//! Static system configuration: replica membership, quorum
//! parameters, and the timing knobs every subprotocol's timers are
//! derived from.
//!
//! Loaded from a TOML file at startup (`core::cli` resolves the path),
//! the way a deployed replica has no business hand-assembling its own
//! `NodeConfig`/`Quorum` values at the call site.

use std::collections::HashMap as StdHashMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::bft::communication::NodeId;
use crate::bft::error::*;

/// One member of the system, as listed in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberConfig {
    pub id: u32,
    pub addr: SocketAddr,
    pub hostname: String,
}

/// The full static configuration of one deployment: membership plus
/// every quorum and timing parameter derived from `f`/`k`.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    /// Maximum number of Byzantine-faulty replicas tolerated.
    pub f: usize,
    /// Additional slack beyond `f`, per spec.md's generalized
    /// `2f+k(+1)` quorum sizes (`k = 0` recovers classic PBFT-style
    /// quorums).
    pub k: usize,
    /// The full membership list; `n = members.len()` must satisfy
    /// `n >= 3f + 2k + 1`.
    pub members: Vec<MemberConfig>,

    /// Maximum number of client requests batched into a single
    /// Pre-Order sequence before proposing.
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// `sig_min_time`/`sig_max_time`/`max_batch_size` for the signing
    /// pipeline (spec.md §5).
    #[serde(default = "defaults::sig_min_time_ms")]
    pub sig_min_time_ms: u64,
    #[serde(default = "defaults::sig_max_time_ms")]
    pub sig_max_time_ms: u64,
    #[serde(default = "defaults::sig_max_batch_size")]
    pub sig_max_batch_size: usize,

    /// Base timeout for the catchup/jump protocol, doubled on every
    /// successive retry.
    #[serde(default = "defaults::cst_base_timeout_ms")]
    pub cst_base_timeout_ms: u64,

    /// `K_Lat`/`pp_time` feeding `suspect_leader::TatModel`.
    #[serde(default = "defaults::tat_k_lat")]
    pub tat_k_lat: f64,
    #[serde(default = "defaults::tat_pp_time_ms")]
    pub tat_pp_time_ms: u64,

    /// Directory holding this replica's PKCS#1 PEM key and every
    /// peer's public key, named `<id>.pub`/`<id>.priv`.
    pub key_dir: String,
}

mod defaults {
    pub fn batch_size() -> usize { 128 }
    pub fn sig_min_time_ms() -> u64 { 1 }
    pub fn sig_max_time_ms() -> u64 { 10 }
    pub fn sig_max_batch_size() -> usize { 256 }
    pub fn cst_base_timeout_ms() -> u64 { 300 }
    pub fn tat_k_lat() -> f64 { 2.0 }
    pub fn tat_pp_time_ms() -> u64 { 5 }
}

impl SystemConfig {
    /// Parses a `SystemConfig` out of a TOML document's contents.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).wrapped(ErrorKind::CoreConfig)?;
        config.is_well_formed()?;
        Ok(config)
    }

    /// Loads and parses a `SystemConfig` from the file at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).wrapped(ErrorKind::CoreConfig)?;
        Self::from_toml_str(&contents)
    }

    /// Total number of replicas, `n`.
    pub fn n(&self) -> usize {
        self.members.len()
    }

    /// Checks that membership is large enough for the declared `f, k`,
    /// and that every member id is unique and within `0..n`.
    pub fn is_well_formed(&self) -> Result<()> {
        let n = self.n();
        if n < 3 * self.f + 2 * self.k + 1 {
            return Err(format!(
                "membership of {} is too small for f={}, k={} (need at least {})",
                n, self.f, self.k, 3 * self.f + 2 * self.k + 1,
            ))
            .wrapped(ErrorKind::CoreConfig);
        }

        let mut seen = std::collections::HashSet::new();
        for member in &self.members {
            if member.id as usize >= n {
                return Err(format!("member id {} is out of bounds for n={}", member.id, n))
                    .wrapped(ErrorKind::CoreConfig);
            }
            if !seen.insert(member.id) {
                return Err(format!("duplicate member id {}", member.id)).wrapped(ErrorKind::CoreConfig);
            }
        }
        Ok(())
    }

    /// Builds the `(SocketAddr, hostname)` map `communication::NodeConfig`
    /// expects.
    pub fn member_addrs(&self) -> StdHashMap<NodeId, (SocketAddr, String)> {
        self.members
            .iter()
            .map(|m| (NodeId::from(m.id), (m.addr, m.hostname.clone())))
            .collect()
    }

    pub fn sig_min_time(&self) -> Duration {
        Duration::from_millis(self.sig_min_time_ms)
    }

    pub fn sig_max_time(&self) -> Duration {
        Duration::from_millis(self.sig_max_time_ms)
    }

    pub fn cst_base_timeout(&self) -> Duration {
        Duration::from_millis(self.cst_base_timeout_ms)
    }

    pub fn tat_pp_time(&self) -> Duration {
        Duration::from_millis(self.tat_pp_time_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        f = 1
        k = 1
        key_dir = "/etc/prime-order/keys"

        [[members]]
        id = 0
        addr = "127.0.0.1:10000"
        hostname = "replica0"

        [[members]]
        id = 1
        addr = "127.0.0.1:10001"
        hostname = "replica1"

        [[members]]
        id = 2
        addr = "127.0.0.1:10002"
        hostname = "replica2"

        [[members]]
        id = 3
        addr = "127.0.0.1:10003"
        hostname = "replica3"

        [[members]]
        id = 4
        addr = "127.0.0.1:10004"
        hostname = "replica4"

        [[members]]
        id = 5
        addr = "127.0.0.1:10005"
        hostname = "replica5"
    "#;

    #[test]
    fn test_parses_sample_config_and_fills_defaults() {
        let config = SystemConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.n(), 6);
        assert_eq!(config.batch_size, defaults::batch_size());
        assert_eq!(config.sig_max_batch_size, defaults::sig_max_batch_size());
    }

    #[test]
    fn test_rejects_membership_too_small_for_f_k() {
        let bad = r#"
            f = 3
            k = 0
            key_dir = "/tmp"

            [[members]]
            id = 0
            addr = "127.0.0.1:10000"
            hostname = "replica0"
        "#;
        assert!(SystemConfig::from_toml_str(bad).is_err());
    }
}
