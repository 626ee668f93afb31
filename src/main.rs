//! scripthost - CLI

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use scripthost::host::{DispatchTable, FsResourceLoader, HostServices};
use scripthost::util::config::HostConfig;
use scripthost::util::logger;
use scripthost::{NAME, VERSION};
use tracing::info;

/// Run scripts on per-thread embedded engines
#[derive(Parser, Debug)]
#[command(name = "scripthost")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a callback descriptor on one or more worker threads
    Run {
        /// Host configuration document (JSON)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Directory scripts are loaded from
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        root: PathBuf,

        /// Callback descriptor passed to `run_callback`
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Number of worker threads, each with its own engine
        #[arg(short, long, default_value_t = 1)]
        threads: usize,

        /// Wait for a debugger on this base port (default 9091)
        #[arg(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "9091")]
        debug_port: Option<u16>,
    },

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Run {
            config,
            root,
            payload,
            threads,
            debug_port,
        } => {
            let mut host_config = match &config {
                Some(path) => HostConfig::from_file(path)
                    .with_context(|| format!("Failed to load config: {}", path.display()))?,
                None => HostConfig::default(),
            };
            if let Some(port) = debug_port {
                host_config = host_config.with_debug_port(port);
            }

            if args.verbose {
                logger::init_debug();
            } else {
                logger::init_with_level(host_config.log_level()?);
            }

            run(host_config, root, payload, threads.max(1))?;
        }
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        }
    }

    Ok(())
}

fn run(
    config: HostConfig,
    root: PathBuf,
    payload: String,
    threads: usize,
) -> Result<()> {
    let table = Arc::new(DispatchTable::new());
    table.register("echo", |input| Ok(Some(input.to_vec())));
    table.register("log", |input| {
        info!(topic = "host.log", "{}", String::from_utf8_lossy(input));
        Ok(None)
    });

    let services = HostServices::new(Arc::new(FsResourceLoader::new(root)), table.clone(), config);
    let bridge = scripthost::start(services);
    bridge.register_calls(&table);

    let payload = Arc::new(payload);
    let workers: Vec<_> = (0..threads)
        .map(|index| {
            let bridge = bridge.clone();
            let payload = payload.clone();
            thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || {
                    let _guard = bridge.attach_current_thread();
                    bridge.run_script(payload.as_bytes())
                })
                .context("Failed to spawn worker thread")
        })
        .collect::<Result<_>>()?;

    let mut failures = 0;
    for (index, worker) in workers.into_iter().enumerate() {
        match worker.join() {
            Ok(Ok(Some(output))) => println!("[worker-{index}] {}", String::from_utf8_lossy(&output)),
            Ok(Ok(None)) => println!("[worker-{index}] (no result)"),
            Ok(Err(err)) => {
                eprintln!("[worker-{index}] error: {err}");
                failures += 1;
            }
            Err(_) => {
                eprintln!("[worker-{index}] panicked");
                failures += 1;
            }
        }
    }

    scripthost::shutdown();
    if failures > 0 {
        bail!("{failures} of {threads} workers failed");
    }
    Ok(())
}
