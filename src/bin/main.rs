use std::{
    error::Error,
    net::{Ipv4Addr, TcpListener},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use genworker::{
    asset::{AssetHandler, AssetMessage},
    cli::{Cli, Commands, parse_args},
    config::load_config,
    error::WorkerError,
    probe::HealthProbe,
    process::OsLauncher,
    relay::AssetRelay,
    server::{self, ServerState},
    store,
    supervisor::{ServiceSupervisor, SupervisorSettings},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Run { config } => run(&config)?,
        Commands::Relay {
            config,
            uid,
            file_name,
            task_type,
        } => relay(&config, uid, file_name, task_type)?,
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout is reserved for command results.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(config_path: &str) -> Result<(), Box<dyn Error>> {
    let config = load_config(Some(config_path))?;
    let specs = config.service_specs()?;
    let grace = config.shutdown_grace()?;
    let settings = SupervisorSettings {
        poll_interval: config.readiness_poll_interval()?,
        shutdown_grace: grace,
    };

    // Both hold blocking HTTP clients and must be dropped outside the async runtime.
    let store = store::from_config(&config)?;
    let supervisor = Arc::new(ServiceSupervisor::new(
        Arc::new(OsLauncher),
        Arc::new(HealthProbe::new()?),
        settings,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    register_signal_handler(Arc::clone(&supervisor), shutdown_tx)?;

    match supervisor.start_all(&specs) {
        Ok(()) => {}
        Err(WorkerError::StartupCancelled { .. }) if supervisor.shutdown_requested() => {
            info!("Shutdown requested during startup");
            supervisor.shutdown_all(grace);
            return Ok(());
        }
        Err(err) => {
            error!("Startup failed: {err}");
            supervisor.shutdown_all(grace);
            return Err(err.into());
        }
    }

    let port = config.server.port;
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
    listener.set_nonblocking(true)?;
    let state = Arc::new(ServerState {
        supervisor: Arc::clone(&supervisor),
        store: Arc::clone(&store),
        port,
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served = runtime.block_on(server::serve(
        listener,
        state,
        wait_for_shutdown(shutdown_rx),
    ));
    drop(runtime);

    if let Err(err) = &served {
        error!("HTTP facade failed: {err}");
    }
    supervisor.shutdown_all(grace);
    info!("genworker stopped");

    served.map_err(Into::into)
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
    info!("Stopping HTTP facade...");
}

fn register_signal_handler(
    supervisor: Arc<ServiceSupervisor>,
    shutdown: watch::Sender<bool>,
) -> Result<(), Box<dyn Error>> {
    let signalled = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if signalled.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already in progress");
            return;
        }
        info!("genworker is shutting down...");
        supervisor.request_shutdown();
        let _ = shutdown.send(true);
    })?;

    Ok(())
}

fn relay(
    config_path: &str,
    uid: String,
    file_name: String,
    task_type: String,
) -> Result<(), Box<dyn Error>> {
    let config = load_config(Some(config_path))?;
    let store = store::from_config(&config)?;
    let handler = AssetHandler::new(AssetRelay::new(store, config.input_dir()));

    let message = AssetMessage {
        uid,
        file_name,
        task_type,
    };
    let name = handler.route(&message.task_type, &message)?;
    println!("{name}");

    Ok(())
}
