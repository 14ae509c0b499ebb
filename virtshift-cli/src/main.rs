use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use virtshift_core::transport::{ConnectOptions, SshTransport};
use virtshift_core::{observability, AppConfig, Hypervisor, OperationRegistry, Transport};

mod commands;
mod output;

use commands::AppContext;
use output::OutputMode;

#[derive(Parser)]
#[command(name = "virtshift")]
#[command(about = "Clone and synchronize libvirt VMs between hosts over SSH", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "text")]
    output: OutputMode,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// SSH private key path
    #[arg(long, global = true)]
    ssh_key: Option<PathBuf>,

    /// SSH port
    #[arg(long, global = true)]
    ssh_port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone a VM from one host to another
    Clone(commands::clone::CloneArgs),

    /// Incrementally synchronize a VM between hosts
    Sync(commands::sync::SyncArgs),

    /// List VMs on one or more hosts
    List(commands::list::ListArgs),

    /// Show operation status
    Status(commands::status::StatusArgs),

    /// Inspect and edit configuration
    #[command(subcommand)]
    Config(commands::config::ConfigCommand),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let (output_mode, quiet) = (cli.output, cli.quiet);
    let config_path = cli.config.clone();

    let config = match AppConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => std::process::exit(output::report_error(&e, output_mode, None)),
    };

    let level = if cli.verbose {
        "DEBUG"
    } else if quiet {
        "ERROR"
    } else {
        config.logging.level.as_str()
    };
    let _ = observability::init(level);

    let explicit = ConnectOptions {
        username: None,
        port: cli.ssh_port,
        identity: cli.ssh_key.clone(),
    };
    let transport = Arc::new(SshTransport::with_options(config.ssh.clone(), explicit));
    let ctx = AppContext {
        hypervisor: Hypervisor::new(config.libvirt.uri.clone()),
        registry: Arc::new(OperationRegistry::new()),
        transport: transport.clone(),
        output: output_mode,
        quiet,
        config,
    };

    let result = match cli.command {
        Commands::Clone(args) => commands::clone::run(&ctx, args).await,
        Commands::Sync(args) => commands::sync::run(&ctx, args).await,
        Commands::List(args) => commands::list::run(&ctx, args).await,
        Commands::Status(args) => commands::status::run(&ctx, args).await,
        Commands::Config(command) => {
            commands::config::run(command, config_path.as_deref(), output_mode)
        }
    };

    transport.close_all().await;

    if let Err(e) = result {
        std::process::exit(output::report_error(&e, output_mode, None));
    }
}
