#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use runway_gateway::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "runway-gateway", about = "API gateway with managed auth and traffic shaping")]
struct Cli {
    /// Path to gateway config file
    #[arg(short, long, default_value = "runway.toml")]
    config: PathBuf,

    /// Listen address for proxy traffic
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Admin API listen address (health/metrics/keys)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,

    /// Control-plane stream listen address
    #[arg(long, default_value = "0.0.0.0:9400")]
    control_listen: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let workers = server::runtime::WorkerPlan::detect();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
        control_listen: cli.control_listen,
        workers,
    }))
}
