//! Command-line flags understood by every binary in this workspace
//! (`cluster_core`, `lock_table`, `lock_proxy`). Parsed with the
//! `#[derive(Args)]` macro the same way `pkg/datastore/src/bin/metastore.rs`
//! declares its `Args` struct; every field is optional here because the
//! command line is only the highest-precedence layer of `ConfigBuilder`
//! (see `config.rs`) and most deployments only override a handful of
//! fields.

#[derive(Args)]
pub struct Args {
    pub name: Option<String>,
    pub ip: Option<String>,
    pub ifdev: Option<String>,

    #[arg(default = false)]
    pub use_ccs: bool,

    pub servers: Option<String>,
    pub cluster_name: Option<String>,

    pub verbosity: Option<u32>,

    pub heartbeat_rate: Option<u64>,
    pub allowed_misses: Option<u16>,
    pub new_connection_timeout: Option<u64>,
    pub master_scan_delay: Option<u64>,

    pub coreport: Option<u16>,
    pub ltpxport: Option<u16>,
    pub ltport: Option<u16>,

    pub fence_bin: Option<String>,
    pub run_as: Option<String>,
    pub lock_dir: Option<String>,

    pub lt_partitions: Option<u16>,
    pub lt_high_locks: Option<u64>,
    pub lt_drop_req_rate: Option<u32>,
    pub prealloc_locks: Option<u32>,
    pub prealloc_holders: Option<u32>,
    pub prealloc_lkrqs: Option<u32>,
}
