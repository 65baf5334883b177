//! Gateway Options
//!
//! Command-line flags for the gatehouse binary. Store variants are selected
//! by name; the hinted-handoff dirs take a comma-separated list so queues
//! can spread across spindles.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "gatehouse",
    version,
    about = "Distributed HTTP pub/sub gateway fronting a partitioned-log broker"
)]
pub struct Options {
    /// Gateway id, unique across the zone
    #[arg(long, default_value = "gw-1")]
    pub id: String,

    /// Default broker cluster
    #[arg(long, default_value = "c1")]
    pub cluster: String,

    /// Publish surface bind address
    #[arg(long, default_value = "127.0.0.1:9191")]
    pub pub_addr: SocketAddr,

    /// Subscribe surface bind address
    #[arg(long, default_value = "127.0.0.1:9192")]
    pub sub_addr: SocketAddr,

    /// Broker store variant
    #[arg(long, default_value = "dummy")]
    pub store: String,

    /// Hinted handoff variant: disk | dummy
    #[arg(long = "hh", default_value = "disk")]
    pub hinted_handoff: String,

    /// Hinted handoff data dirs, comma separated
    #[arg(long, default_value = "hh", value_delimiter = ',')]
    pub hh_dirs: Vec<PathBuf>,

    /// Job store: a SQLite path, or "dummy" to disable delayed jobs
    #[arg(long, default_value = "gatehouse-jobs.db")]
    pub job_db: String,

    /// Topics to run delayed-job executors for, comma separated
    #[arg(long, value_delimiter = ',')]
    pub job_topics: Vec<String>,

    /// Job handler pool size; 1 preserves due-time order
    #[arg(long, default_value_t = 10)]
    pub job_handlers: usize,

    /// Seconds the sub server waits for in-flight connections on shutdown
    #[arg(long, default_value_t = 30)]
    pub sub_timeout: u64,

    /// Accept subscribes from unregistered consumer groups
    #[arg(long)]
    pub permit_unregistered_group: bool,

    /// Replay buffered handoff blocks into the broker and exit
    #[arg(long)]
    pub flush_inflights_only: bool,
}
