//! `lock_table` binary entry point: resolve configuration, work out which
//! partitions this node owns, then run them until the process exits.
//!
//! Partition ownership (SPEC_FULL.md §4.7's "cluster-wide singleton hosted
//! by one of the elected servers") is assigned by rank: partition `p` is
//! owned by the server at index `p % server_count` in the configured
//! server list. This is deterministic and needs no runtime coordination,
//! which is the same property the config-hash-gated handshake already
//! leans on elsewhere in this design (see DESIGN.md, Open Questions).

#[macro_use]
extern crate macros;

use cluster_config::{Config, ConfigBuilder, NoneCcs, PidFile};
use common::args::parse_args;
use common::async_std::task::block_on;
use common::errors::*;
use lock_table::LtServer;

fn main() {
    let args = match parse_args::<cluster_config::args::Args>() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("lock_table: {}", e);
            cluster_config::ExitCode::ParseFail.exit();
        }
    };

    let config = match ConfigBuilder::new(&NoneCcs).build(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("lock_table: {}", e);
            cluster_config::ExitCode::BadOption.exit();
        }
    };

    if let Err(e) = block_on(run(config)) {
        eprintln!("lock_table: {}", e);
        cluster_config::ExitCode::InitFailed.exit();
    }
}

fn owned_partitions(config: &Config) -> Vec<u16> {
    let server_count = config.servers.len().max(1);
    let rank = config.rank_of(&config.name).unwrap_or(0);
    (0..config.lt_partitions)
        .filter(|p| (*p as usize) % server_count == rank)
        .collect()
}

async fn run(config: Config) -> Result<()> {
    let _pid_file = PidFile::acquire(&config.lock_dir, "lock_table").await?;

    let mine = owned_partitions(&config);
    if mine.is_empty() {
        return Err(format_err!("node {} owns no lt partitions", config.name));
    }

    let server = std::sync::Arc::new(LtServer::new(config, mine));
    server.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str, servers: &[&str], partitions: u16) -> Config {
        let mut c = Config::default();
        c.name = name.to_string();
        c.servers = servers
            .iter()
            .map(|s| cluster_config::ServerEntry { name: s.to_string() })
            .collect();
        c.lt_partitions = partitions;
        c
    }

    #[test]
    fn partitions_split_round_robin_by_rank() {
        let c = cfg("b", &["a", "b", "c"], 7);
        assert_eq!(owned_partitions(&c), vec![1, 4]);
    }

    #[test]
    fn single_server_owns_every_partition() {
        let c = cfg("a", &["a"], 4);
        assert_eq!(owned_partitions(&c), vec![0, 1, 2, 3]);
    }
}
