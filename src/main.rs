use light_http::config::{ConfigStore, FleetConfig, StackConfig};
use light_http::error::ServerError;
use light_http::fleet::Fleet;
use light_http::instance::ServerInstance;
use light_http::listener::Serve;
use light_http::server::StaticServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("light_http=debug".parse().expect("valid log directive")),
        )
        .init();

    info!(name = PKG_NAME, version = VERSION, "Starting");

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None | Some("stack") => run_stack().await,
        Some("fleet") => run_fleet(args.next().map(PathBuf::from)).await,
        Some(other) => {
            anyhow::bail!("Unknown command '{}' (expected 'stack' or 'fleet [config.json]')", other)
        }
    }
}

/// Player and editor asset servers behind aliases on the main server
async fn run_stack() -> anyhow::Result<()> {
    let config = StackConfig::from_env()?;
    print_stack_banner(&config);

    let server = Arc::new(StaticServer::new(config.serve_options()));
    let serve: Arc<dyn Serve> = Arc::clone(&server) as Arc<dyn Serve>;

    let mut player = ServerInstance::with_server(
        "Player resources",
        config.player.path.clone(),
        Some(config.player.port),
        None,
        Arc::clone(&serve),
    );
    let mut editor = ServerInstance::with_server(
        "Editor resources",
        config.editor.path.clone(),
        Some(config.editor.port),
        None,
        Arc::clone(&serve),
    );
    let mut main = ServerInstance::with_server(
        "Global resources",
        config.public_path.clone(),
        Some(config.main_port),
        config.main_https_port,
        serve,
    );

    // Aliases need the listen URLs, so the asset servers go first
    let (player_result, editor_result) = tokio::join!(player.connect(), editor.connect());
    if let Err(e) = player_result.map(|_| ()).and(editor_result.map(|_| ())) {
        error!(error = %e, "Failed to start asset servers");
        player.disconnect();
        editor.disconnect();
        return Err(e.into());
    }

    let wiring = [(&config.player, &player), (&config.editor, &editor)]
        .into_iter()
        .try_for_each(|(asset, server)| -> Result<(), ServerError> {
            match asset.alias_url() {
                Some(url) => main.add_alias_path_with_url(&asset.alias, server, &url)?,
                None => main.add_alias_path(&asset.alias, server)?,
            };
            Ok(())
        });
    if let Err(e) = wiring {
        player.disconnect();
        editor.disconnect();
        return Err(e.into());
    }

    if let Err(e) = main.connect().await {
        error!(error = %e, "Failed to start main server");
        player.disconnect();
        editor.disconnect();
        return Err(e.into());
    }

    wait_for_shutdown().await?;

    info!("Shutting down servers...");
    player.disconnect();
    editor.disconnect();
    main.disconnect();
    log_upstream_stats(&server);

    info!("Shutdown complete");
    Ok(())
}

/// Servers listed in the JSON configuration file
async fn run_fleet(path: Option<PathBuf>) -> anyhow::Result<()> {
    let store = path.map(ConfigStore::new).unwrap_or_else(ConfigStore::default_location);

    // A broken file is reported and left alone rather than overwritten
    let (config, writable) = match store.load_or_default() {
        Ok(config) => (config, true),
        Err(e) => {
            error!(error = %e, "Unable to load configuration, starting with no servers");
            (FleetConfig::default(), false)
        }
    };
    info!(path = %store.path().display(), servers = config.server_list.len(), "Configuration loaded");

    let mut fleet = Fleet::new();
    if let Err(e) = fleet.load(&config) {
        error!(error = %e, "Skipping remaining servers in configuration");
    }

    fleet.auto_start().await;
    if writable {
        // Errors are already logged; the running fleet is unaffected
        let _ = fleet.persist(&store);
    }

    for item in fleet.menu() {
        match &item.warning {
            Some(warning) => warn!(id = %item.id, label = %item.label, warning = %warning, "Server not running"),
            None => info!(
                id = %item.id,
                label = %item.label,
                running = item.running,
                auto_start = item.auto_start,
                path = %item.path.display(),
                "Server"
            ),
        }
    }

    wait_for_shutdown().await?;

    info!("Stopping all servers...");
    fleet.disconnect_all();
    log_upstream_stats(&StaticServer::shared());
    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn log_upstream_stats(server: &StaticServer) {
    let stats = server.pool().stats();
    info!(
        total = stats.get_total_requests(),
        tls = stats.get_tls_requests(),
        "Requests forwarded by rewrite rules"
    );
}

fn print_stack_banner(config: &StackConfig) {
    let options = config.serve_options();
    info!(
        bind = %options.bind,
        main_port = config.main_port,
        main_https_port = ?config.main_https_port,
        public_path = %config.public_path.display(),
        tls_files = options.tls.has_tls_files(),
        "Main server configuration"
    );
    for (label, asset) in [("player", &config.player), ("editor", &config.editor)] {
        info!(
            server = label,
            port = asset.port,
            path = %asset.path.display(),
            alias = %asset.alias,
            alias_url = ?asset.alias_url(),
            "Asset server configuration"
        );
    }
}
