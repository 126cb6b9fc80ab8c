use std::{error::Error, fs, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use tokio::{net::TcpListener, runtime::Handle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{
    config::DservConfig,
    engine::{Caller, Engine, EngineHandle},
    event::EventNames,
    session::SessionContext,
    store::DatapointStore,
    timer::{default_probes, select_backend, TimerPool},
};

pub mod api;
pub mod cli;
pub mod config;
pub mod datapoint;
pub mod engine;
pub mod event;
pub mod session;
pub mod store;
pub mod timer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(version, about = "Datapoint server")]
struct Args {
    /// RON config file
    #[arg(long, default_value = "./dserv.ron")]
    config: PathBuf,
    /// Script run at startup against the store
    #[arg(short, long)]
    tscript: Option<PathBuf>,
    /// Script run at startup with every command available
    #[arg(short, long)]
    cscript: Option<PathBuf>,
    /// Static files for the HTTP port
    #[arg(short, long)]
    www: Option<PathBuf>,
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(long)]
    http_port: Option<u16>,
    /// Print the effective config and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dserv=info")),
        )
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut cfg = DservConfig::from_file(&args.config)?.with_env_overrides()?;
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(port) = args.http_port {
        cfg.http_port = Some(port);
    }
    if args.www.is_some() {
        cfg.www = args.www.clone();
    }
    if args.print_config {
        println!("{}", cfg.to_ron()?);
        return Ok(());
    }

    info!(version = VERSION, "starting");

    // read scripts before anything binds so a bad path fails fast
    let tscript = args.tscript.as_ref().map(fs::read_to_string).transpose()?;
    let cscript = args.cscript.as_ref().map(fs::read_to_string).transpose()?;

    let store = Arc::new(DatapointStore::new());
    let events = Arc::new(EventNames::default());
    let (handle, rx) = engine::channel(cfg.queue_capacity);

    let backend_kind = cfg.timers.backend;
    let runtime = Handle::current();
    let backend = tokio::task::spawn_blocking(move || {
        select_backend(backend_kind, runtime, &default_probes())
    })
    .await?;
    let timers = Arc::new(TimerPool::new(
        cfg.timers.count,
        &cfg.timers.prefix,
        backend,
        store.clone(),
        handle.expiry_hook(),
    ));
    info!(count = timers.len(), prefix = %timers.prefix(), "timers ready");

    let engine_thread = Engine::new(
        store.clone(),
        timers.clone(),
        events.clone(),
        handle.clone(),
        rx,
    )
    .spawn()?;

    let listener = TcpListener::bind((cfg.host.as_str(), cfg.port)).await?;
    let http_listener = match cfg.http_port {
        Some(port) => Some(TcpListener::bind((cfg.host.as_str(), port)).await?),
        None => None,
    };

    if let Some(script) = tscript {
        run_startup_script(&handle, Caller::store(), &script, "tscript").await?;
    }
    if let Some(script) = cscript {
        run_startup_script(&handle, Caller::full(), &script, "cscript").await?;
    }

    let shutdown = CancellationToken::new();
    let sessions = tokio::spawn(session::serve(
        listener,
        SessionContext {
            store: store.clone(),
            engine: handle.clone(),
            events: events.clone(),
            default_format: cfg.format,
            push_capacity: cfg.push_capacity,
        },
        shutdown.clone(),
    ));
    let http = http_listener.map(|listener| {
        tokio::spawn(api::serve(
            listener,
            api::ApiState {
                engine: handle.clone(),
                store: store.clone(),
                events: events.clone(),
                push_capacity: cfg.push_capacity,
            },
            cfg.www.clone(),
            shutdown.clone(),
        ))
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();

    sessions.await?;
    if let Some(http) = http {
        if let Err(e) = http.await? {
            error!("http server failed: {e}");
        }
    }
    timers.reset_all();
    handle.shutdown().await;
    tokio::task::spawn_blocking(move || engine_thread.join())
        .await?
        .map_err(|_| "engine thread panicked")?;

    info!(dropped = store.dropped_deliveries(), "stopped");
    Ok(())
}

async fn run_startup_script(
    handle: &EngineHandle,
    caller: Caller,
    script: &str,
    what: &str,
) -> Result<(), Box<dyn Error>> {
    info!("running {what}");
    handle
        .execute(caller, script)
        .await
        .map_err(|e| format!("{what} failed: {} {e}", e.tag()))?;
    Ok(())
}
