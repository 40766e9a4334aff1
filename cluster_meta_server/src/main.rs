use std::error::Error;
use std::sync::Arc;

use cluster_meta_core::config::MetaServerConfig;
use cluster_meta_core::log::{init_logging, log_startup};
use cluster_meta_core::metrics::install_recorder;
use cluster_meta_core::{
    ClusterMetaWorker, HttpServer, PidFile, RespMetaStore, SentinelDirectory, ShutdownCoordinator, ShutdownSignal,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = None;
    let mut check_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                if i + 1 < args.len() {
                    config_path = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path");
                    return Err("Missing config path".into());
                }
            }
            "--check-config" => {
                check_only = true;
            }
            "--help" => {
                print_usage();
                return Ok(());
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                return Err("Unknown argument".into());
            }
        }
        i += 1;
    }

    let config = load_config(config_path.as_deref())?;
    if check_only {
        println!("Configuration is valid");
        return Ok(());
    }

    run_server(config).await
}

fn print_usage() {
    println!("cluster-meta-server - topology metadata for a sentinel-monitored cluster");
    println!();
    println!("Usage:");
    println!("  cluster-meta-server [--config <path>]   # Run the server");
    println!("  cluster-meta-server --check-config      # Validate configuration and exit");
    println!();
    println!("Options:");
    println!("  --config <path>    TOML or YAML configuration file");
    println!("  --help             Show this message");
    println!();
    println!("Environment overrides use the CLUSTER_META_ prefix, e.g. CLUSTER_META_SENTINELS=10.0.0.1:26379,10.0.0.2:26379");
}

fn load_config(path: Option<&str>) -> Result<MetaServerConfig, Box<dyn Error>> {
    let mut config = match path {
        Some(path) => MetaServerConfig::load(path)?,
        None => MetaServerConfig::default(),
    };
    config.apply_env_overrides()?;

    if let Err(problems) = config.validate() {
        for problem in &problems {
            eprintln!("Configuration error: {}", problem);
        }
        return Err(format!("{} configuration problem(s)", problems.len()).into());
    }
    Ok(config)
}

async fn run_server(config: MetaServerConfig) -> Result<(), Box<dyn Error>> {
    init_logging(&config.logging);
    log_startup(&config);

    // Held until run_server returns; dropping it removes the file.
    let _pid_file = PidFile::create(&config.server.pid)?;

    let metrics = install_recorder(&config.metrics)?;

    let directory = Arc::new(SentinelDirectory::new(&config.sentinel));
    let store = Arc::new(RespMetaStore::new(
        config.meta_store.connect_timeout(),
        config.meta_store.command_timeout(),
    ));

    let worker = match ClusterMetaWorker::bootstrap(config.clone(), directory, store).await {
        Ok(worker) => worker,
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            return Err(e.into());
        }
    };
    worker.start_watchers().await?;
    tracing::info!("Watchers started, snapshot version {}", worker.version().await);

    let shutdown = ShutdownCoordinator::new(&config.server);
    shutdown.listen_for_signals();

    let reconcile_loop = config
        .reconcile_interval()
        .map(|interval| worker.spawn_reconcile_loop(interval, shutdown.token()));

    let server = HttpServer::new(config.server.clone(), worker.clone(), metrics);
    let server_shutdown = shutdown.clone();
    let http = tokio::spawn(async move {
        if let Err(e) = server.serve(server_shutdown.token()).await {
            tracing::error!("HTTP server failed: {}", e);
            server_shutdown.trigger(ShutdownSignal::Manual);
        }
    });

    let signal = shutdown.wait().await;
    tracing::info!("Shutdown requested: {}", signal.reason());

    shutdown
        .run_bounded(async {
            if let Err(e) = http.await {
                tracing::warn!("HTTP task ended abnormally: {}", e);
            }
            if let Some(handle) = reconcile_loop {
                if let Err(e) = handle.await {
                    tracing::warn!("Reconciliation task ended abnormally: {}", e);
                }
            }
            worker.close().await;
        })
        .await;

    Ok(())
}
