//! ikspoz CLI - expose a local HTTP server through a relayed public endpoint

use clap::{Args, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use url::Url;

use ikspoz::config::{parse_target, ClientConfig};
use ikspoz::console::{self, Console};
use ikspoz::settings::AutoInstance;
use ikspoz::{
    events, Config, ConnectionString, FileSystemSettingsManager, LocalRelayConnector,
    TargetClient, TunnelEngine, UserSettingsManager,
};

/// How long to wait for the last events to be printed after closing.
const CONSOLE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "ikspoz")]
#[command(about = "Expose a local HTTP server through a relayed public endpoint")]
#[command(version)]
struct Cli {
    /// Don't print the application banner
    #[arg(long, visible_alias = "nb", global = true)]
    no_banner: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tunnel traffic through an existing relay connection
    #[command(visible_alias = "azure-relay")]
    Relay {
        /// Relay connection string (Endpoint=...;EntityPath=...)
        connection_string: String,

        /// Base URL traffic is tunneled to
        target: String,
    },

    /// Tunnel through the relay instance recorded with `auto initialize`
    Auto {
        #[command(subcommand)]
        command: AutoCommands,
    },

    /// Tunnel using a configuration file
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Target base URL (overrides config)
        #[arg(short, long)]
        target: Option<String>,

        /// Relay connection string (overrides config)
        #[arg(long)]
        connection_string: Option<String>,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum AutoCommands {
    /// Start tunneling through the recorded relay instance
    Run {
        /// Base URL traffic is tunneled to
        target: String,
    },

    /// Record the relay instance used by `auto run`
    #[command(visible_aliases = ["init", "i"])]
    Initialize(InitializeArgs),

    /// Forget the recorded relay instance
    #[command(visible_aliases = ["clean", "c"])]
    Cleanup {
        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Args)]
struct InitializeArgs {
    /// Connection string of the relay instance
    connection_string: String,

    /// Subscription the relay namespace belongs to
    #[arg(long, visible_alias = "sub")]
    subscription_id: Option<String>,

    /// Resource group the relay namespace belongs to
    #[arg(long, visible_alias = "rg")]
    resource_group: Option<String>,

    /// Don't ask for confirmation before replacing an existing instance
    #[arg(short, long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();

    if !cli.no_banner {
        println!("{}", console::banner());
    }

    match cli.command {
        Commands::Relay {
            connection_string,
            target,
        } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            let connection = ConnectionString::parse(&connection_string)?;
            let target = parse_target(&target)?;
            tunnel(connection, target, &Config::default()).await?;
        }

        Commands::Auto { command } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            let settings = FileSystemSettingsManager::in_home_dir();
            match command {
                AutoCommands::Run { target } => {
                    let target = parse_target(&target)?;
                    let Some(instance) = settings.load()?.azure_relay_auto_instance else {
                        println!("Sorry, \"auto\" mode does not appear to have been initialized yet. For more information run:");
                        println!();
                        println!("\tikspoz auto initialize --help");
                        return Ok(());
                    };
                    let connection = ConnectionString::parse(&instance.connection_string)?;
                    tunnel(connection, target, &Config::default()).await?;
                }
                AutoCommands::Initialize(args) => initialize(&settings, args)?,
                AutoCommands::Cleanup { yes } => cleanup(&settings, yes)?,
            }
        }

        Commands::Run {
            config,
            target,
            connection_string,
        } => {
            let mut cfg = Config::from_file(&config)?;
            cfg.apply_overrides(target, connection_string);
            cfg.validate()?;

            init_logging(cli.log_level.as_deref().unwrap_or(&cfg.logging.level));
            tracing::info!(path = %config.display(), "Loaded configuration");

            let connection = cfg.connection_string()?;
            let target = cfg.target()?;
            tunnel(connection, target, &cfg).await?;
        }

        Commands::ValidateConfig { config } => {
            println!("Validating configuration: {}", config.display());

            let cfg = Config::from_file(&config)?;

            println!("Configuration is valid!");
            println!();
            println!(
                "  Target: {}",
                cfg.tunnel.target.as_deref().unwrap_or("(not set)")
            );
            match cfg.tunnel.connection_string.as_deref() {
                Some(raw) => println!("  Connection: {}", ConnectionString::parse(raw)?),
                None => println!("  Connection: (not set)"),
            }
            match cfg.client.connect_timeout() {
                Some(timeout) => println!("  Connect timeout: {}s", timeout.as_secs()),
                None => println!("  Connect timeout: none"),
            }
            println!(
                "  Extra CA: {}",
                cfg.client
                    .tls_ca
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(none)".to_string())
            );
            println!("  Log level: {}", cfg.logging.level);
            println!("  Log requests: {}", cfg.logging.log_requests);
            println!("  Event buffer: {}", cfg.logging.event_buffer);

            // Catch unreadable CA files now rather than at the first request
            target_client(&cfg.client)?;
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn target_client(config: &ClientConfig) -> ikspoz::Result<TargetClient> {
    let client = TargetClient::new().with_connect_timeout(config.connect_timeout());
    match &config.tls_ca {
        Some(path) => client.with_extra_roots(path),
        None => Ok(client),
    }
}

/// Open the tunnel, run until Ctrl+C, then close it.
async fn tunnel(
    connection: ConnectionString,
    target: Url,
    cfg: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let (emitter, stream) = events::channel(cfg.logging.event_buffer);
    let console = Console::new(cfg.logging.log_requests);
    let presenter = tokio::spawn(async move { console.run(stream, std::io::stdout()).await });

    let mut engine = TunnelEngine::new(Arc::new(LocalRelayConnector), &target)?
        .with_client(target_client(&cfg.client)?)
        .with_events(emitter);

    if let Err(e) = engine.open(&connection).await {
        drop(engine);
        let _ = tokio::time::timeout(CONSOLE_DRAIN_TIMEOUT, presenter).await;
        println!("An unexpected error occurred while attempting to open the connection:");
        println!();
        println!("{}", e);
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    let closed = engine.close().await;
    drop(engine);

    match tokio::time::timeout(CONSOLE_DRAIN_TIMEOUT, presenter).await {
        Ok(Ok(Err(e))) => tracing::debug!(error = %e, "Console output failed"),
        Ok(Err(e)) => tracing::debug!(error = %e, "Console task failed"),
        Ok(Ok(Ok(()))) => {}
        Err(_) => tracing::debug!("Requests still in flight, not waiting for their output"),
    }

    if let Err(e) = closed {
        tracing::warn!(error = %e, "Tunnel did not close cleanly");
    }
    println!("Bye!");
    Ok(())
}

fn initialize(
    settings: &FileSystemSettingsManager,
    args: InitializeArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let connection = ConnectionString::parse(&args.connection_string)?;
    let current = settings.load()?;

    if current.azure_relay_auto_instance.is_some() {
        if !args.yes
            && !confirm("An instance has already been initialized for auto mode, are you sure you want to re-initialize?")?
        {
            println!("Ok, auto initialization canceled.");
            return Ok(());
        }
        println!("Ok, beginning re-initialization.");
    }

    let instance = AutoInstance {
        subscription_id: args.subscription_id.unwrap_or_default(),
        resource_group: args.resource_group.unwrap_or_default(),
        relay_namespace: connection.namespace().to_string(),
        connection_name: connection.entity().to_string(),
        connection_string: args.connection_string,
        namespace_was_auto_created: false,
    };
    settings.save(&current.with_auto_instance(Some(instance)))?;

    println!("Auto mode initialized for {}", connection.public_url());
    println!("Settings saved to {}", settings.path().display());
    Ok(())
}

fn cleanup(
    settings: &FileSystemSettingsManager,
    yes: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let current = settings.load()?;
    let Some(instance) = &current.azure_relay_auto_instance else {
        println!("No instance has been initialized for auto mode. Try running ikspoz auto initialize --help");
        return Ok(());
    };

    if !yes && !confirm("Are you sure you want to forget your relay instance?")? {
        println!("Ok, we'll keep your relay instance.");
        return Ok(());
    }

    settings.save(&current.with_auto_instance(None))?;
    println!(
        "Forgot relay instance {}/{}.",
        instance.relay_namespace, instance.connection_name
    );
    Ok(())
}

/// Ask a y/n question on stdin. Anything but `y`/`yes` is a no.
fn confirm(question: &str) -> std::io::Result<bool> {
    print!("{} (y/n) ", question);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    let answer = answer.trim();
    Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
}
