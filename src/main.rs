use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;
use voxturn::app::{list_audio_devices, run_conversation, run_scan, show_config};
use voxturn::cli::{Cli, Commands, ConfigAction};
use voxturn::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Run(args) => {
            let config = load_config(cli.config.as_deref())?;
            run_conversation(config, &args, cli.quiet)?;
        }
        Commands::Scan { format } => {
            let count = run_scan(format, std::io::stdin().lock(), std::io::stdout().lock())?;
            tracing::debug!(count, "scan finished");
        }
        Commands::Devices => {
            list_audio_devices()?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = load_config(cli.config.as_deref())?;
                print!("{}", show_config(&config)?);
            }
            ConfigAction::Path => {
                let path = cli.config.unwrap_or_else(Config::default_path);
                println!("{}", path.display());
            }
        },
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "voxturn", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise the level follows `-v`/`-q`.
fn init_tracing(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "voxturn=warn",
        (false, 1) => "voxturn=debug",
        (false, _) => "voxturn=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/voxturn/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path)?
    } else {
        Config::load_or_default(&Config::default_path())?
    };
    Ok(config.with_env_overrides())
}
