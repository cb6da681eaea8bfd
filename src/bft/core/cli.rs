//! Hand-rolled command line parsing for the replica binary.
//!
//! Mirrors the bootstrap examples' bespoke `std::env::args_os()` walk
//! rather than reaching for an argument-parsing crate -- this process
//! only ever takes a handful of flags.

use crate::bft::error::*;

/// Attack-injection flags, present only to exercise `suspect_leader`
/// and the inconsistency-attack guard (spec.md §6) in integration
/// tests; a production deployment never sets these.
#[derive(Debug, Default, Clone, Copy)]
pub struct AttackFlags {
    /// The leader holds back its `Pre_Prepare` for one full
    /// `leader_duration_sw` window before sending it.
    pub delay_leader: bool,
    /// The leader sends two different `Pre_Prepare`s for the same
    /// `(view, seq)` to disjoint subsets of replicas.
    pub inconsistent_pre_prepare: bool,
}

/// Parsed command line arguments for a replica process.
pub struct Args {
    /// This replica's own id within the configured membership.
    pub id: u32,
    /// Path to the `SystemConfig` TOML file.
    pub config_path: String,
    /// Overrides `SystemConfig::key_dir`, if present.
    pub key_dir_override: Option<String>,
    /// Injects a TPM incarnation id distinct from `id`, for tests that
    /// exercise proactive recovery under a simulated hardware TPM.
    pub tpm_id: Option<u32>,
    pub attack: AttackFlags,
}

/// Parses `argv[1..]` into `Args`.
///
/// Usage: `prime-order-replica <id> --config <path> [--key-dir <dir>]
/// [--tpm-id <id>] [--attack-delay-leader] [--attack-inconsistent-pre-prepare]`
pub fn parse() -> Result<Args> {
    let mut argv = std::env::args_os().skip(1);

    let id = argv
        .next()
        .ok_or_else(|| Error::simple(ErrorKind::CoreCli))?;
    let id: u32 = id
        .to_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::simple(ErrorKind::CoreCli))?;

    let mut config_path = None;
    let mut key_dir_override = None;
    let mut tpm_id = None;
    let mut attack = AttackFlags::default();

    while let Some(flag) = argv.next() {
        let flag = flag.to_str().ok_or_else(|| Error::simple(ErrorKind::CoreCli))?;
        match flag {
            "--config" => {
                let value = argv.next().ok_or_else(|| Error::simple(ErrorKind::CoreCli))?;
                config_path = Some(value.to_str().ok_or_else(|| Error::simple(ErrorKind::CoreCli))?.to_owned());
            }
            "--key-dir" => {
                let value = argv.next().ok_or_else(|| Error::simple(ErrorKind::CoreCli))?;
                key_dir_override = Some(value.to_str().ok_or_else(|| Error::simple(ErrorKind::CoreCli))?.to_owned());
            }
            "--tpm-id" => {
                let value = argv.next().ok_or_else(|| Error::simple(ErrorKind::CoreCli))?;
                let value: u32 = value
                    .to_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::simple(ErrorKind::CoreCli))?;
                tpm_id = Some(value);
            }
            "--attack-delay-leader" => attack.delay_leader = true,
            "--attack-inconsistent-pre-prepare" => attack.inconsistent_pre_prepare = true,
            other => {
                return Err(format!("unrecognized flag: {}", other)).wrapped(ErrorKind::CoreCli);
            }
        }
    }

    let config_path = config_path.ok_or_else(|| {
        Error::wrapped(ErrorKind::CoreCli, "missing required --config <path> flag")
    })?;

    Ok(Args { id, config_path, key_dir_override, tpm_id, attack })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attack_flags_default_to_off() {
        let flags = AttackFlags::default();
        assert!(!flags.delay_leader);
        assert!(!flags.inconsistent_pre_prepare);
    }
}
