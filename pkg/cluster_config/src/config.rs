//! Runtime configuration: defaults, layered resolution (CCS < environment <
//! command line), validation, and the stable cross-node config hash.
//!
//! Grounded on `examples/original_source/gulm/src/config_main.c`
//! (`default_config`, `validate_config`, `hash_config`, `calc_quorum`) and
//! `config_env.c` (`parse_env`'s `GULMD_*` resolution, including the exact
//! clamp bounds applied to each field).

use std::path::PathBuf;

use common::errors::*;

use crate::args::Args;
use crate::ccs::CcsSource;
use crate::hash::{crc32_update, HASH_SEED};

/// Lower bound enforced on `heartbeat_rate_micros` (75ms). Below this the
/// sweep in the heartbeat engine would dominate the event loop.
pub const MIN_HEARTBEAT_RATE_MICROS: u64 = 75_000;

/// Default size in bytes of a lock value block.
pub const DEFAULT_LVB_SIZE: usize = 32;

const CCS_PREFIX: &str = "/cluster/core";

/// One entry of the ordered server list. Position in `Config::servers` is
/// the node's rank (lower index = higher rank, see SPEC_FULL.md §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cluster_name: String,
    pub servers: Vec<ServerEntry>,

    /// This process's own node name. Must appear in `servers` to run as
    /// core; may be absent for a pure client.
    pub name: String,
    pub ip: Option<String>,
    pub ifdev: Option<String>,
    pub use_ccs: bool,

    pub verbosity: u32,

    pub heartbeat_rate_micros: u64,
    pub allowed_misses: u16,
    pub new_connection_timeout_micros: u64,
    pub master_scan_delay_micros: u64,

    pub core_port: u16,
    pub ltpx_port: u16,
    pub lt_port_base: u16,

    pub fence_bin: String,
    pub run_as: String,
    pub lock_dir: PathBuf,

    pub lt_partitions: u16,
    pub lt_high_locks: u64,
    pub lt_drop_req_rate: u32,
    pub prealloc_locks: u32,
    pub prealloc_holders: u32,
    pub prealloc_lkrqs: u32,

    pub lvb_size: usize,

    /// Raw value of the `quorum` field before `calc_quorum` resolution. `0`
    /// means "derive from server count" (see `resolve_quorum`).
    pub quorum_override: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cluster_name: String::new(),
            servers: vec![],
            name: String::new(),
            ip: None,
            ifdev: None,
            use_ccs: false,
            verbosity: 0,
            heartbeat_rate_micros: 15_000_000,
            allowed_misses: 2,
            new_connection_timeout_micros: 15_000_000,
            master_scan_delay_micros: 1_000_000,
            core_port: 40040,
            ltpx_port: 40042,
            lt_port_base: 41040,
            fence_bin: "fence_node".to_string(),
            run_as: "root".to_string(),
            lock_dir: PathBuf::from("/var/run/cluster"),
            lt_partitions: 1,
            lt_high_locks: 1024 * 1024,
            lt_drop_req_rate: 10,
            prealloc_locks: 10,
            prealloc_holders: 10,
            prealloc_lkrqs: 10,
            lvb_size: DEFAULT_LVB_SIZE,
            quorum_override: 0,
        }
    }
}

impl Config {
    /// `calc_quorum(quorum, cnt)` from `config_main.c`: an override larger
    /// than the server count is nonsensical and falls back to the derived
    /// majority, `0` means "derive", anything else is used verbatim.
    pub fn quorum(&self) -> u16 {
        resolve_quorum(self.quorum_override, self.servers.len() as u16)
    }

    pub fn is_fog(&self) -> bool {
        self.servers.len() > 1
    }

    /// Rank of `name` in the server list, if it is a configured server.
    /// Lower is higher-ranked.
    pub fn rank_of(&self, name: &str) -> Option<usize> {
        self.servers.iter().position(|s| s.name == name)
    }

    pub fn is_server(&self, name: &str) -> bool {
        self.rank_of(name).is_some()
    }

    pub fn lt_port(&self, partition: u16) -> u16 {
        self.lt_port_base + partition
    }

    /// Stable, endianness-independent hash over the fields that must match
    /// cluster-wide (SPEC_FULL.md §3). `fence_bin`, `run_as`, `lock_dir`,
    /// `verbosity` and the preallocation knobs are intentionally excluded,
    /// matching `hash_config`'s comment that those "can differ on nodes".
    pub fn compute_hash(&self) -> u32 {
        let mut h = HASH_SEED;
        h = crc32_update(h, self.cluster_name.as_bytes());
        h = crc32_update(h, &self.core_port.to_be_bytes());
        h = crc32_update(h, &self.heartbeat_rate_micros.to_be_bytes());
        h = crc32_update(h, &self.allowed_misses.to_be_bytes());
        h = crc32_update(h, &self.quorum().to_be_bytes());
        h = crc32_update(h, &(self.is_fog() as u16).to_be_bytes());
        h = crc32_update(h, &(self.servers.len() as u16).to_be_bytes());
        for server in &self.servers {
            h = crc32_update(h, server.name.as_bytes());
        }
        h = crc32_update(h, &self.lt_partitions.to_be_bytes());
        h = crc32_update(h, &self.lt_port_base.to_be_bytes());
        h = crc32_update(h, &self.ltpx_port.to_be_bytes());
        h
    }

    /// Validates the assembled config, clamping fields the original source
    /// clamps rather than rejects and rejecting the ones it rejects
    /// outright (`validate_config`: server count must be 1/3/4/5).
    pub fn validate(&mut self) -> Result<()> {
        let n = self.servers.len();
        if !(n == 1 || n == 3 || n == 4 || n == 5) {
            return Err(format_err!(
                "cluster requires 1, 3, 4, or 5 configured servers, got {}",
                n
            ));
        }

        if self.heartbeat_rate_micros < MIN_HEARTBEAT_RATE_MICROS {
            self.heartbeat_rate_micros = MIN_HEARTBEAT_RATE_MICROS;
        }
        if self.allowed_misses < 1 {
            self.allowed_misses = 1;
        }
        if self.lt_partitions == 0 {
            self.lt_partitions = 1;
        }
        if self.lt_partitions > 256 {
            self.lt_partitions = 256;
        }

        Ok(())
    }
}

/// `calc_quorum` from `config_main.c`, ported field-for-field: an override
/// greater than the server count is treated as unset.
pub fn resolve_quorum(quorum_override: u16, server_count: u16) -> u16 {
    if quorum_override > server_count {
        (server_count / 2) + 1
    } else if quorum_override == 0 {
        (server_count / 2) + 1
    } else {
        quorum_override
    }
}

fn parse_servers(raw: &str) -> Vec<ServerEntry> {
    raw.split(|c| c == ',' || c == ' ')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .take(5)
        .map(|name| ServerEntry {
            name: name.to_string(),
        })
        .collect()
}

/// Layers configuration sources from lowest to highest precedence:
/// hard-coded defaults, the cluster repository (CCS), environment
/// variables, then command-line flags (SPEC_FULL.md §4.10).
pub struct ConfigBuilder<'a> {
    config: Config,
    ccs: &'a dyn CcsSource,
}

impl<'a> ConfigBuilder<'a> {
    pub fn new(ccs: &'a dyn CcsSource) -> Self {
        Self {
            config: Config::default(),
            ccs,
        }
    }

    fn apply_ccs(&mut self) {
        let ccs = self.ccs;
        macro_rules! set_str {
            ($field:expr, $key:expr) => {
                if let Some(v) = ccs.lookup(&format!("{}/{}", CCS_PREFIX, $key)) {
                    $field = v;
                }
            };
        }
        macro_rules! set_parsed {
            ($field:expr, $key:expr) => {
                if let Some(v) = ccs.lookup(&format!("{}/{}", CCS_PREFIX, $key)) {
                    if let Ok(parsed) = v.parse() {
                        $field = parsed;
                    }
                }
            };
        }

        set_str!(self.config.cluster_name, "name");
        if let Some(v) = ccs.lookup(&format!("{}/servers", CCS_PREFIX)) {
            self.config.servers = parse_servers(&v);
        }
        set_parsed!(self.config.heartbeat_rate_micros, "heartbeat_rate");
        set_parsed!(self.config.allowed_misses, "allowed_misses");
        set_parsed!(
            self.config.new_connection_timeout_micros,
            "new_connection_timeout"
        );
        set_parsed!(self.config.master_scan_delay_micros, "master_scan_delay");
        set_parsed!(self.config.core_port, "coreport");
        set_parsed!(self.config.ltpx_port, "ltpxport");
        set_parsed!(self.config.lt_port_base, "ltport");
        set_str!(self.config.fence_bin, "fence_bin");
        set_str!(self.config.run_as, "run_as");
        if let Some(v) = ccs.lookup(&format!("{}/lock_dir", CCS_PREFIX)) {
            self.config.lock_dir = PathBuf::from(v);
        }
        set_parsed!(self.config.lt_partitions, "lt_partitions");
        set_parsed!(self.config.lt_high_locks, "lt_high_locks");
        set_parsed!(self.config.lt_drop_req_rate, "lt_drop_req_rate");
        set_parsed!(self.config.prealloc_locks, "prealloc_locks");
        set_parsed!(self.config.prealloc_holders, "prealloc_holders");
        set_parsed!(self.config.prealloc_lkrqs, "prealloc_lkrqs");
    }

    /// Mirrors `parse_env`'s `GULMD_*` resolution, including its clamp
    /// bounds (e.g. heartbeat rate floors at 75ms, allowed misses floors
    /// at 1).
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("GULMD_NAME") {
            self.config.cluster_name = v;
        }
        if let Ok(v) = std::env::var("GULMD_SERVERS") {
            self.config.servers = parse_servers(&v);
        }
        if let Ok(v) = std::env::var("GULMD_VERBOSITY") {
            if let Ok(parsed) = v.parse() {
                self.config.verbosity = parsed;
            }
        }
        if let Ok(v) = std::env::var("GULMD_HEARTBEAT_RATE") {
            if let Ok(parsed) = v.parse::<u64>() {
                self.config.heartbeat_rate_micros = parsed.max(MIN_HEARTBEAT_RATE_MICROS);
            }
        }
        if let Ok(v) = std::env::var("GULMD_ALLOWED_MISSES") {
            if let Ok(parsed) = v.parse::<u16>() {
                self.config.allowed_misses = parsed.max(1);
            }
        }
        if let Ok(v) = std::env::var("GULMD_NEW_CONNECTION_TIMEOUT") {
            if let Ok(parsed) = v.parse() {
                self.config.new_connection_timeout_micros = parsed;
            }
        }
        if let Ok(v) = std::env::var("GULMD_MASTER_SCAN_DELAY") {
            if let Ok(parsed) = v.parse::<u64>() {
                self.config.master_scan_delay_micros = parsed.max(10);
            }
        }
        if let Ok(v) = std::env::var("GULMD_COREPORT") {
            if let Ok(parsed) = v.parse() {
                self.config.core_port = parsed;
            }
        }
        if let Ok(v) = std::env::var("GULMD_LTPXPORT") {
            if let Ok(parsed) = v.parse() {
                self.config.ltpx_port = parsed;
            }
        }
        if let Ok(v) = std::env::var("GULMD_LTPORT") {
            if let Ok(parsed) = v.parse() {
                self.config.lt_port_base = parsed;
            }
        }
        if let Ok(v) = std::env::var("GULMD_FENCE_BIN") {
            self.config.fence_bin = v;
        }
        if let Ok(v) = std::env::var("GULMD_RUN_AS") {
            self.config.run_as = v;
        }
        if let Ok(v) = std::env::var("GULMD_LOCK_DIR") {
            self.config.lock_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GULMD_LT_PARTITIONS") {
            if let Ok(parsed) = v.parse::<u16>() {
                self.config.lt_partitions = parsed.clamp(1, 256);
            }
        }
        if let Ok(v) = std::env::var("GULMD_LT_HIGH_LOCKS") {
            if let Ok(parsed) = v.parse::<u64>() {
                self.config.lt_high_locks = parsed.max(10_000);
            }
        }
        if let Ok(v) = std::env::var("GULMD_LT_DROP_REQ_RATE") {
            if let Ok(parsed) = v.parse::<u32>() {
                self.config.lt_drop_req_rate = parsed.max(5);
            }
        }
        if let Ok(v) = std::env::var("GULMD_PREALLOC_LOCKS") {
            if let Ok(parsed) = v.parse() {
                self.config.prealloc_locks = parsed;
            }
        }
        if let Ok(v) = std::env::var("GULMD_PREALLOC_HOLDERS") {
            if let Ok(parsed) = v.parse() {
                self.config.prealloc_holders = parsed;
            }
        }
        if let Ok(v) = std::env::var("GULMD_PREALLOC_LKRQS") {
            if let Ok(parsed) = v.parse() {
                self.config.prealloc_lkrqs = parsed;
            }
        }
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(v) = &args.name {
            self.config.name = v.clone();
        }
        if let Some(v) = &args.ip {
            self.config.ip = Some(v.clone());
        }
        if let Some(v) = &args.ifdev {
            self.config.ifdev = Some(v.clone());
        }
        self.config.use_ccs = args.use_ccs;
        if let Some(v) = &args.servers {
            self.config.servers = parse_servers(v);
        }
        if let Some(v) = &args.cluster_name {
            self.config.cluster_name = v.clone();
        }
        if let Some(v) = args.verbosity {
            self.config.verbosity = v;
        }
        if let Some(v) = args.heartbeat_rate {
            self.config.heartbeat_rate_micros = v;
        }
        if let Some(v) = args.allowed_misses {
            self.config.allowed_misses = v;
        }
        if let Some(v) = args.new_connection_timeout {
            self.config.new_connection_timeout_micros = v;
        }
        if let Some(v) = args.master_scan_delay {
            self.config.master_scan_delay_micros = v;
        }
        if let Some(v) = args.coreport {
            self.config.core_port = v;
        }
        if let Some(v) = args.ltpxport {
            self.config.ltpx_port = v;
        }
        if let Some(v) = args.ltport {
            self.config.lt_port_base = v;
        }
        if let Some(v) = &args.fence_bin {
            self.config.fence_bin = v.clone();
        }
        if let Some(v) = &args.run_as {
            self.config.run_as = v.clone();
        }
        if let Some(v) = &args.lock_dir {
            self.config.lock_dir = PathBuf::from(v);
        }
        if let Some(v) = args.lt_partitions {
            self.config.lt_partitions = v;
        }
        if let Some(v) = args.lt_high_locks {
            self.config.lt_high_locks = v;
        }
        if let Some(v) = args.lt_drop_req_rate {
            self.config.lt_drop_req_rate = v;
        }
        if let Some(v) = args.prealloc_locks {
            self.config.prealloc_locks = v;
        }
        if let Some(v) = args.prealloc_holders {
            self.config.prealloc_holders = v;
        }
        if let Some(v) = args.prealloc_lkrqs {
            self.config.prealloc_lkrqs = v;
        }
    }

    /// Assembles the final config from all four layers and validates it.
    /// CCS is only consulted when `use_ccs` ends up true after the
    /// environment and args layers have been applied (mirrors
    /// `parse_conf`'s `parse_ccs` call happening unconditionally but
    /// `NoneCcs` making it a no-op when nothing configured it).
    pub fn build(mut self, args: &Args) -> Result<Config> {
        // Environment and args are applied first to decide `use_ccs`, then
        // CCS is folded in underneath, then environment/args are re-applied
        // so they retain highest precedence.
        self.apply_env();
        self.apply_args(args);
        if self.config.use_ccs {
            self.apply_ccs();
            self.apply_env();
            self.apply_args(args);
        }

        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccs::{NoneCcs, StaticCcs};

    fn args() -> Args {
        Args {
            name: None,
            ip: None,
            ifdev: None,
            use_ccs: false,
            servers: None,
            cluster_name: None,
            verbosity: None,
            heartbeat_rate: None,
            allowed_misses: None,
            new_connection_timeout: None,
            master_scan_delay: None,
            coreport: None,
            ltpxport: None,
            ltport: None,
            fence_bin: None,
            run_as: None,
            lock_dir: None,
            lt_partitions: None,
            lt_high_locks: None,
            lt_drop_req_rate: None,
            prealloc_locks: None,
            prealloc_holders: None,
            prealloc_lkrqs: None,
        }
    }

    #[test]
    fn rejects_two_servers() {
        let mut a = args();
        a.servers = Some("a,b".to_string());
        let err = ConfigBuilder::new(&NoneCcs).build(&a);
        assert!(err.is_err());
    }

    #[test]
    fn accepts_single_server_and_becomes_non_fog() {
        let mut a = args();
        a.servers = Some("a".to_string());
        let cfg = ConfigBuilder::new(&NoneCcs).build(&a).unwrap();
        assert!(!cfg.is_fog());
        assert_eq!(cfg.quorum(), 1);
    }

    #[test]
    fn three_servers_is_fog_with_quorum_two() {
        let mut a = args();
        a.servers = Some("a,b,c".to_string());
        let cfg = ConfigBuilder::new(&NoneCcs).build(&a).unwrap();
        assert!(cfg.is_fog());
        assert_eq!(cfg.quorum(), 2);
        assert_eq!(cfg.rank_of("a"), Some(0));
        assert_eq!(cfg.rank_of("c"), Some(2));
    }

    #[test]
    fn heartbeat_rate_clamps_to_minimum() {
        let mut a = args();
        a.servers = Some("a".to_string());
        a.heartbeat_rate = Some(1000);
        let cfg = ConfigBuilder::new(&NoneCcs).build(&a).unwrap();
        assert_eq!(cfg.heartbeat_rate_micros, MIN_HEARTBEAT_RATE_MICROS);
    }

    #[test]
    fn partition_count_defaults_and_clamps() {
        let mut a = args();
        a.servers = Some("a".to_string());
        a.lt_partitions = Some(0);
        let cfg = ConfigBuilder::new(&NoneCcs).build(&a).unwrap();
        assert_eq!(cfg.lt_partitions, 1);

        let mut a2 = args();
        a2.servers = Some("a".to_string());
        a2.lt_partitions = Some(9000);
        let cfg2 = ConfigBuilder::new(&NoneCcs).build(&a2).unwrap();
        assert_eq!(cfg2.lt_partitions, 256);
    }

    #[test]
    fn config_hash_is_stable_across_builds() {
        let mut a = args();
        a.servers = Some("a,b,c".to_string());
        a.cluster_name = Some("mycluster".to_string());
        let cfg1 = ConfigBuilder::new(&NoneCcs).build(&a).unwrap();
        let cfg2 = ConfigBuilder::new(&NoneCcs).build(&a).unwrap();
        assert_eq!(cfg1.compute_hash(), cfg2.compute_hash());
    }

    #[test]
    fn config_hash_ignores_fence_bin_and_verbosity() {
        let mut a = args();
        a.servers = Some("a,b,c".to_string());
        let cfg1 = ConfigBuilder::new(&NoneCcs).build(&a).unwrap();

        let mut a2 = args();
        a2.servers = Some("a,b,c".to_string());
        a2.fence_bin = Some("/usr/local/bin/fence".to_string());
        a2.verbosity = Some(7);
        let cfg2 = ConfigBuilder::new(&NoneCcs).build(&a2).unwrap();

        assert_eq!(cfg1.compute_hash(), cfg2.compute_hash());
    }

    #[test]
    fn ccs_only_applies_when_use_ccs_is_set() {
        let mut ccs = StaticCcs::new();
        ccs.set("/cluster/core/name", "from-ccs");

        let mut a = args();
        a.servers = Some("a".to_string());
        let cfg = ConfigBuilder::new(&ccs).build(&a).unwrap();
        assert_eq!(cfg.cluster_name, "");

        a.use_ccs = true;
        let cfg2 = ConfigBuilder::new(&ccs).build(&a).unwrap();
        assert_eq!(cfg2.cluster_name, "from-ccs");
    }
}
