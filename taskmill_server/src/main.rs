//! Taskmill server node executable.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;

use taskmill::{pf_error, Layout, Server, ServerConfig, TaskmillError};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// My rank in the cluster. Must be one of the trailing server ranks.
    #[arg(short, long)]
    rank: i32,

    /// Number of server ranks (the last `servers` members).
    #[arg(short, long, default_value_t = 1)]
    servers: i32,

    /// List of all cluster members, the order of which maps to ranks.
    /// Example: '-m host0:port0 -m host1:port1 -m host2:port2'.
    #[arg(short, long)]
    members: Vec<SocketAddr>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Server configuration in TOML format.
    /// Example: --config='work_types=4' '+steal_max_memory=1048576'.
    #[arg(long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, returning the cluster layout.
    fn sanitize(&self) -> Result<Layout, TaskmillError> {
        // check for duplicate member addresses
        let mut members_set = HashSet::new();
        for addr in self.members.iter() {
            if !members_set.insert(addr) {
                return Err(TaskmillError(format!(
                    "duplicate member address '{}' given",
                    addr
                )));
            }
        }
        if self.threads < 2 {
            return Err(TaskmillError(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        let layout = Layout::new(self.members.len() as i32, self.servers, self.rank)?;
        if !layout.is_server(self.rank) {
            return Err(TaskmillError(format!(
                "rank {} is a worker rank; this executable runs servers",
                self.rank
            )));
        }
        Ok(layout)
    }
}

// Server node executable main entrance.
fn server_main() -> Result<i32, TaskmillError> {
    let args = CliArgs::parse();
    let layout = args.sanitize()?;

    let config = {
        use taskmill::parsed_config;
        parsed_config!(args.config.as_deref() => ServerConfig;
                       work_types, steal_min_interval_ms,
                       steal_max_memory, idle_tick_ms)?
    };

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-rank{}", args.rank))
        .build()?;

    runtime.block_on(async move {
        let mut server = Server::new_and_setup(layout, &args.members, config).await?;
        server.run().await
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    match server_main() {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => {
            pf_error!("run ended with failure code {}", code);
            ExitCode::from((code & 0xFF).max(1) as u8)
        }
        Err(e) => {
            pf_error!("server_main exited: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod server_args_tests {
    use super::*;

    fn members(n: usize) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| format!("127.0.0.1:{}", 52800 + i).parse().unwrap())
            .collect()
    }

    #[test]
    fn sanitize_valid() -> Result<(), TaskmillError> {
        let args = CliArgs {
            rank: 3,
            servers: 2,
            members: members(4),
            threads: 2,
            config: None,
        };
        let layout = args.sanitize()?;
        assert_eq!(layout.workers, 2);
        Ok(())
    }

    #[test]
    fn sanitize_worker_rank_rejected() {
        let args = CliArgs {
            rank: 0,
            servers: 1,
            members: members(3),
            threads: 2,
            config: None,
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_duplicate_member() {
        let mut m = members(3);
        m[2] = m[0];
        let args = CliArgs {
            rank: 2,
            servers: 1,
            members: m,
            threads: 2,
            config: None,
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let args = CliArgs {
            rank: 2,
            servers: 1,
            members: members(3),
            threads: 1,
            config: None,
        };
        assert!(args.sanitize().is_err());
    }
}
