//! ledgerfs daemon entry point.
//!
//! Mounts the filesystem and keeps it served until the mountpoint is
//! released externally (exit 0) or SIGINT/SIGTERM forces an unmount
//! (exit 1).

use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fuser::{MountOption, Session};
use nix::sys::signal::{SigSet, Signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ledgerfs::config::{Config, Overrides};
use ledgerfs::fs::LedgerFs;
use ledgerfs::store::StoreGateway;

/// FUSE filesystem persisted in an append-only key-value store.
#[derive(Parser, Debug)]
#[command(name = "ledgerfs", about = "FUSE filesystem backed by a key-value store")]
struct Args {
    /// Config file (YAML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Store database path
    #[arg(short = 'd', long)]
    database: Option<PathBuf>,

    /// Mountpoint
    #[arg(short = 'm', long)]
    mountpoint: Option<PathBuf>,

    /// Log file; logs go to stderr when absent
    #[arg(short = 'f', long)]
    logfile: Option<PathBuf>,

    /// uid owning every inode of the mount
    #[arg(short = 'i', long)]
    uid: Option<u32>,

    /// gid owning every inode of the mount
    #[arg(short = 'g', long)]
    gid: Option<u32>,
}

fn init_logging(logfile: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("could not open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    let cfg = match Config::resolve(
        args.config.as_deref(),
        Overrides {
            database: args.database,
            mountpoint: args.mountpoint,
            logfile: args.logfile,
            uid: args.uid,
            gid: args.gid,
        },
    ) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("ledgerfs: {err:#}");
            process::exit(1);
        }
    };
    if let Err(err) = init_logging(cfg.logfile.as_deref()) {
        eprintln!("ledgerfs: {err:#}");
        process::exit(1);
    }

    match run(&cfg) {
        Ok(forced) if forced => process::exit(1),
        Ok(_) => {}
        Err(err) => {
            error!("{err:#}");
            process::exit(1);
        }
    }
}

/// Mount and serve; returns whether the unmount was forced by a signal.
fn run(cfg: &Config) -> anyhow::Result<bool> {
    info!(
        database = %cfg.database.display(),
        mountpoint = %cfg.mountpoint.display(),
        uid = cfg.uid,
        gid = cfg.gid,
        "starting"
    );

    let store = StoreGateway::open(&cfg.database).context("could not open store")?;
    let fs = LedgerFs::new(store, cfg.uid, cfg.gid).context("could not initialize filesystem")?;

    // Block the shutdown signals before any other thread exists, so the
    // waiter below is their only receiver.
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals
        .thread_block()
        .context("could not block shutdown signals")?;

    let options = [MountOption::FSName("ledgerfs".into())];
    let mut session =
        Session::new(fs, &cfg.mountpoint, &options).context("could not mount filesystem")?;
    let mut unmounter = session.unmount_callable();

    let forced = Arc::new(AtomicBool::new(false));
    let forced_flag = forced.clone();
    std::thread::spawn(move || {
        if let Ok(signal) = signals.wait() {
            info!(%signal, "shutdown signal received, unmounting");
            forced_flag.store(true, Ordering::SeqCst);
            if let Err(err) = unmounter.unmount() {
                error!(%err, "unmount failed; release the mountpoint manually");
            }
        }
    });

    info!("mounted");
    session.run().context("session loop failed")?;
    info!("unmounted");
    Ok(forced.load(Ordering::SeqCst))
}
