//! `cluster_core` binary entry point: resolve configuration, acquire the
//! PID file, then run the core process until it exits (it only does so on
//! a fatal I/O error or an admin-triggered shutdown).

#[macro_use]
extern crate macros;

use cluster_config::{Config, ConfigBuilder, NoneCcs, PidFile};
use cluster_core::registry::AllowAll;
use cluster_core::Core;
use common::args::parse_args;
use common::async_std::task::block_on;
use common::errors::*;

fn main() {
    let args = match parse_args::<cluster_config::args::Args>() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("cluster_core: {}", e);
            cluster_config::ExitCode::ParseFail.exit();
        }
    };

    let config = match ConfigBuilder::new(&NoneCcs).build(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("cluster_core: {}", e);
            cluster_config::ExitCode::BadOption.exit();
        }
    };

    if let Err(e) = block_on(run(config)) {
        eprintln!("cluster_core: {}", e);
        cluster_config::ExitCode::InitFailed.exit();
    }
}

async fn run(config: Config) -> Result<()> {
    // Held for the lifetime of the process; dropped (and thus released)
    // only on exit.
    let _pid_file = PidFile::acquire(&config.lock_dir, "cluster_core").await?;

    let core = std::sync::Arc::new(Core::new(config, Box::new(AllowAll)));
    core.run().await
}
