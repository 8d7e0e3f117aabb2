//! Kestrel DNS Resolver
//!
//! A caching, recursive DNS resolver with per-view forwarding and locally
//! served zones.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use kestrel_cache::Cache;
use kestrel_config::{Config, ConfigHolder, ConfigWatcher};
use kestrel_core::QueryHandler;
use kestrel_metrics::metrics;
use kestrel_metrics::tracing_setup::{init_tracing, LogConfig};
use kestrel_resolver::{ResolverManager, UdpTransport};
use kestrel_server::{Dispatcher, TcpServer, UdpServer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

mod settings;

/// Timeout of a single outbound query.
const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(3);

/// Kestrel DNS Resolver - caching recursive resolution with views
#[derive(Parser, Debug)]
#[command(name = "kestrel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the resolver (default)
    Run {
        /// Reload automatically when the configuration file changes
        #[arg(short, long)]
        watch: bool,
    },

    /// Validate configuration file
    Validate {
        /// Show detailed validation output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show version information
    Version {
        /// Show detailed version info
        #[arg(short, long)]
        verbose: bool,
    },
}

/// Find the configuration file in standard locations
fn find_config_file(explicit_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path);
    }

    let search_paths = [
        PathBuf::from("./kestrel.yaml"),
        PathBuf::from("./kestrel.yml"),
        PathBuf::from("./config.yaml"),
        PathBuf::from("/etc/kestrel/config.yaml"),
        PathBuf::from("/etc/kestrel/kestrel.yaml"),
        dirs::config_dir()
            .map(|p| p.join("kestrel/config.yaml"))
            .unwrap_or_default(),
    ];

    search_paths.into_iter().find(|path| path.exists())
}

/// Initialize logging/tracing subsystem
fn init_logging(config: &Config, cli_level: Option<&str>, quiet: bool) -> Result<()> {
    let level = if quiet {
        "error"
    } else {
        cli_level.unwrap_or(&config.logging.level)
    };

    let log_config = LogConfig::parse(level, &config.logging.format).map_err(anyhow::Error::msg)?;
    init_tracing(&log_config).map_err(anyhow::Error::msg)
}

/// Print the startup banner
fn print_banner(config: &Config, quiet: bool) {
    if quiet {
        return;
    }

    let version = env!("CARGO_PKG_VERSION");

    println!();
    println!(
        "  {} {}",
        style("Kestrel DNS Resolver").cyan().bold(),
        style(format!("v{}", version)).dim()
    );
    println!();

    println!("  {} {}", style("Server:").green(), config.server.name);

    let listeners: Vec<String> = config
        .server
        .listen
        .iter()
        .map(|addr| {
            if config.server.tcp {
                format!("{addr} (udp+tcp)")
            } else {
                format!("{addr} (udp)")
            }
        })
        .collect();
    println!("  {} {}", style("Listeners:").green(), listeners.join(", "));
    println!(
        "  {} {}",
        style("Views:").green(),
        config.view_names().join(", ")
    );

    let mut features = Vec::new();
    if config.cache.enabled {
        features.push("Cache");
    }
    if config.cache.prefetch {
        features.push("Prefetch");
    }
    if !config.forwarder.views.is_empty() {
        features.push("Forwarding");
    }
    if !config.auth.is_empty() {
        features.push("Local zones");
    }
    if !features.is_empty() {
        println!("  {} {}", style("Features:").green(), features.join(", "));
    }
    println!();
}

/// The running query pipeline.
struct Pipeline {
    cache: Option<Arc<Cache>>,
    resolver: Arc<ResolverManager>,
    dispatcher: Arc<Dispatcher>,
}

impl Pipeline {
    fn build(config: &Config) -> Result<Self> {
        let resolver = Arc::new(
            ResolverManager::new(
                settings::resolver_settings(config),
                Arc::new(UdpTransport::new(OUTBOUND_TIMEOUT)),
            )
            .context("Failed to build resolver")?,
        );

        let cache = config.cache.enabled.then(|| {
            Arc::new(Cache::new(
                settings::cache_config(config),
                &config.view_names(),
                resolver.clone(),
            ))
        });
        let head: Arc<dyn QueryHandler> = match &cache {
            Some(cache) => cache.clone(),
            None => resolver.clone(),
        };

        let dispatcher = Arc::new(Dispatcher::new(head, settings::view_selector(config)));

        Ok(Self {
            cache,
            resolver,
            dispatcher,
        })
    }

    /// Applies a reloaded configuration. Listener and cache on/off changes
    /// need a restart.
    async fn reload(&self, old: &Config, new: &Config) -> Result<()> {
        self.resolver
            .reload_config(settings::resolver_settings(new))
            .await
            .context("Failed to reload resolver")?;

        match &self.cache {
            Some(cache) => {
                cache
                    .reload_config(settings::cache_config(new), &new.view_names())
                    .await
            }
            None if new.cache.enabled => warn!("Enabling the cache requires a restart"),
            None => {}
        }
        if self.cache.is_some() && !new.cache.enabled {
            warn!("Disabling the cache requires a restart");
        }
        if old.server.listen != new.server.listen || old.server.tcp != new.server.tcp {
            warn!("Listener changes require a restart");
        }

        self.dispatcher.set_views(settings::view_selector(new));
        Ok(())
    }

    async fn close(&self) {
        if let Some(cache) = &self.cache {
            cache.close().await;
        }
        self.resolver.close().await;
    }
}

async fn reload(holder: &ConfigHolder, pipeline: &Pipeline) {
    let old = holder.get();
    let new = match holder.reload() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to reload configuration, keeping the current one");
            return;
        }
    };

    match pipeline.reload(&old, &new).await {
        Ok(()) => info!("Configuration reloaded"),
        Err(e) => error!(error = %e, "Configuration reload failed"),
    }
}

/// Start listeners and serve until SIGTERM or SIGINT.
async fn run_server(holder: Arc<ConfigHolder>, watch: bool, quiet: bool) -> Result<()> {
    let config = holder.get();
    print_banner(&config, quiet);

    let pipeline = Pipeline::build(&config)?;

    let mut servers = JoinSet::new();
    for &addr in &config.server.listen {
        let udp = UdpServer::bind(addr, pipeline.dispatcher.clone())
            .await
            .with_context(|| format!("Failed to bind UDP {addr}"))?;
        servers.spawn(async move { udp.run().await });

        if config.server.tcp {
            let tcp = TcpServer::bind(addr, pipeline.dispatcher.clone())
                .await
                .with_context(|| format!("Failed to bind TCP {addr}"))?;
            servers.spawn(async move { tcp.run().await });
        }
    }

    let mut watcher = match (watch, holder.path()) {
        (true, Some(path)) => {
            let watcher = ConfigWatcher::new(&path)
                .with_context(|| format!("Failed to watch {}", path.display()))?;
            info!(path = %path.display(), "Watching configuration file");
            Some(watcher)
        }
        (true, None) => {
            warn!("No configuration file to watch");
            None
        }
        _ => None,
    };

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;

    info!(name = %config.server.name, "Kestrel DNS resolver started");

    let result = loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                reload(&holder, &pipeline).await;
            }
            Some(()) = async {
                match watcher.as_mut() {
                    Some(w) => w.changed().await,
                    None => std::future::pending().await,
                }
            } => {
                info!("Configuration file changed, reloading");
                reload(&holder, &pipeline).await;
            }
            Some(joined) = servers.join_next() => {
                match joined {
                    Ok(Ok(())) => warn!("Listener exited"),
                    Ok(Err(e)) => break Err(anyhow::Error::new(e).context("Listener failed")),
                    Err(e) => break Err(anyhow::Error::new(e).context("Listener task panicked")),
                }
            }
        }
    };

    servers.abort_all();
    pipeline.close().await;
    let stats = metrics();
    info!(
        uptime_secs = stats.uptime().as_secs(),
        queries = stats.queries(),
        responses = stats.responses(),
        cache_hits = stats.cache_hits(),
        cache_misses = stats.cache_misses(),
        "Kestrel DNS resolver stopped"
    );
    result
}

/// Validate configuration file
fn validate_config(path: Option<PathBuf>, verbose: bool) -> Result<()> {
    let config_path = find_config_file(path).context("No configuration file found")?;

    println!("Validating configuration: {}", config_path.display());

    let config = Config::from_file(&config_path).with_context(|| {
        format!(
            "Failed to load configuration from {}",
            config_path.display()
        )
    })?;

    if verbose {
        println!("\n{}", style("Configuration loaded:").green().bold());
        println!("  Server name: {}", config.server.name);
        println!("  Handlers: {}", config.server.handler_count);
        println!("  Listeners: {}", config.server.listen.len());
        println!("  TCP: {}", config.server.tcp);
        println!("  Views: {}", config.view_names().join(", "));
        println!("  Cache enabled: {}", config.cache.enabled);
        println!("  Prefetch: {}", config.cache.prefetch);
        println!("  Forward views: {}", config.forwarder.views.len());
        println!(
            "  Local zones: {}",
            config.auth.iter().map(|a| a.zones.len()).sum::<usize>()
        );
    }

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;

    // Zone records are parsed by the auth stage, not by config validation.
    kestrel_resolver::AuthResolver::new(&settings::resolver_settings(&config).auth)
        .context("Invalid local zone data")?;

    println!("{}", style("Configuration is valid!").green().bold());
    Ok(())
}

/// Print version information
fn print_version(verbose: bool) {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");

    if verbose {
        println!(
            "{} {}",
            style(name).cyan().bold(),
            style(format!("v{}", version)).dim()
        );
        println!();
        println!(
            "  {}: {}",
            style("Build target").dim(),
            std::env::consts::ARCH
        );
        println!("  {}: {}", style("OS").dim(), std::env::consts::OS);
        println!();
    } else {
        println!("{} {}", name, version);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Version { verbose }) = &cli.command {
        print_version(*verbose);
        return Ok(());
    }

    if let Some(Commands::Validate { verbose }) = &cli.command {
        return validate_config(cli.config, *verbose);
    }

    let holder = match find_config_file(cli.config.clone()) {
        Some(path) => ConfigHolder::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            if !cli.quiet {
                eprintln!(
                    "{}",
                    style("No configuration file found, using defaults").yellow()
                );
            }
            ConfigHolder::default()
        }
    };

    init_logging(&holder.get(), cli.log_level.as_deref(), cli.quiet)?;

    let watch = matches!(cli.command, Some(Commands::Run { watch: true }));
    run_server(Arc::new(holder), watch, cli.quiet).await
}
