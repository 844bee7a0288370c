//! `ltpx` binary entry point: resolve configuration, work out which node
//! hosts each partition, then run the proxy until the process exits.
//!
//! Unlike `lock_table` (which only needs to know the partitions *it*
//! owns), `ltpx` needs the owner of every partition so it can route any
//! client's key to the right one — see `owner_of`, matching the same
//! rank-based assignment `lock_table::bin::owned_partitions` uses.

#[macro_use]
extern crate macros;

use cluster_config::{Config, ConfigBuilder, NoneCcs, PidFile};
use common::args::parse_args;
use common::async_std::task::block_on;
use common::errors::*;
use lock_proxy::LtpxServer;

fn main() {
    let args = match parse_args::<cluster_config::args::Args>() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("ltpx: {}", e);
            cluster_config::ExitCode::ParseFail.exit();
        }
    };

    let config = match ConfigBuilder::new(&NoneCcs).build(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ltpx: {}", e);
            cluster_config::ExitCode::BadOption.exit();
        }
    };

    if let Err(e) = block_on(run(config)) {
        eprintln!("ltpx: {}", e);
        cluster_config::ExitCode::InitFailed.exit();
    }
}

fn owner_of(config: &Config, partition: u16) -> String {
    let server_count = config.servers.len().max(1);
    let rank = (partition as usize) % server_count;
    config
        .servers
        .get(rank)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| config.name.clone())
}

async fn run(config: Config) -> Result<()> {
    let _pid_file = PidFile::acquire(&config.lock_dir, "ltpx").await?;

    let owners: Vec<String> = (0..config.lt_partitions).map(|p| owner_of(&config, p)).collect();
    let server = std::sync::Arc::new(LtpxServer::new(config, owners));
    server.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(servers: &[&str], partitions: u16) -> Config {
        let mut c = Config::default();
        c.name = servers.first().copied().unwrap_or("").to_string();
        c.servers = servers.iter().map(|s| cluster_config::ServerEntry { name: s.to_string() }).collect();
        c.lt_partitions = partitions;
        c
    }

    #[test]
    fn owners_follow_rank_round_robin() {
        let c = cfg(&["a", "b", "c"], 7);
        let owners: Vec<String> = (0..c.lt_partitions).map(|p| owner_of(&c, p)).collect();
        assert_eq!(owners, vec!["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn single_server_owns_every_partition() {
        let c = cfg(&["solo"], 4);
        for p in 0..c.lt_partitions {
            assert_eq!(owner_of(&c, p), "solo");
        }
    }
}
