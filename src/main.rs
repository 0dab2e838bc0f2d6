use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use testledger::manager::{self, SystemProfile};
use testledger::server;
use testledger::storage::{Backend, Compact};
use testledger::Ledger;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:8888")]
    addr: SocketAddr,

    /// Directory holding the segment log
    #[clap(long, default_value = "data")]
    data_dir: PathBuf,

    /// Keep everything in memory; nothing survives a restart
    #[clap(long)]
    memory: bool,

    /// Seconds between background compactions, 0 to disable
    #[clap(long)]
    compact_interval: Option<u64>,

    /// Force fsync after every write regardless of the detected profile
    #[clap(long)]
    strict: bool,
}

fn main() {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,testledger=info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .init();

    let profile = SystemProfile::detect();
    info!(
        cores = profile.logical_cores,
        workers = profile.worker_threads,
        strict = profile.strict_durability || args.strict,
        "resource profile"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(profile.worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(args, profile)) {
        error!(error = %e, "node stopped");
        std::process::exit(1);
    }
}

async fn async_main(args: Args, profile: SystemProfile) -> testledger::error::Result<()> {
    let interval = match args.compact_interval {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => Some(profile.compaction_interval),
    };

    if args.memory {
        info!("running with in-memory storage");
        serve(Arc::new(Ledger::in_memory()), args.addr, interval).await
    } else {
        std::fs::create_dir_all(&args.data_dir)?;
        let path = args.data_dir.join("ledger.log");
        let ledger = Ledger::open(&path, profile.strict_durability || args.strict)?;
        info!(path = %path.display(), bytes = ledger.size_bytes()?, "storage ready");
        serve(Arc::new(ledger), args.addr, interval).await
    }
}

async fn serve<B>(ledger: Arc<Ledger<B>>, addr: SocketAddr, interval: Option<Duration>) -> testledger::error::Result<()>
where
    B: Backend + Compact + Send + 'static,
{
    if let Some(interval) = interval {
        manager::start_compaction_thread(ledger.clone(), interval);
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutting down");
    };
    server::run(ledger, addr, shutdown).await
}
