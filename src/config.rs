use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser};

use crate::snapshot::SNAPSHOT_FILE_NAME;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "namestore",
    about = "Single-value name store served over HTTP",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        env = "NAMESTORE_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:8080"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        env = "NAMESTORE_DATA_DIR",
        value_name = "PATH",
        default_value = "."
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "flush-interval-secs",
        env = "NAMESTORE_FLUSH_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    pub flush_interval_secs: u64,

    #[arg(
        long = "read-timeout-ms",
        env = "NAMESTORE_READ_TIMEOUT_MS",
        value_name = "MILLIS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(10..=60_000)
    )]
    pub read_timeout_ms: u64,
}

impl Config {
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE_NAME)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
