//! Command-line interface for voxturn
//!
//! Provides argument parsing using clap derive macros.

use crate::generation::scanner::FragmentFormat;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Turn-based voice conversations with barge-in
#[derive(Parser, Debug)]
#[command(name = "voxturn", version, about = "Turn-based voice conversations with barge-in")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only print transcripts and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Talk to the assistant from the microphone or a WAV file
    Run(RunArgs),

    /// Read generated text from stdin and print the fragments it yields
    Scan {
        /// Fragment format: json or sentences
        #[arg(long, value_name = "FORMAT", default_value = "json", value_parser = parse_format)]
        format: FragmentFormat,
    },

    /// List audio input and output devices
    Devices,

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Options for `voxturn run`; each overrides the config file.
#[derive(clap::Args, Debug, Default)]
pub struct RunArgs {
    /// WAV file to use as the user's speech (default: microphone)
    #[arg(long, short, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Audio input device
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Language code for transcription. Examples: auto, en, es
    #[arg(long, value_name = "LANG")]
    pub language: Option<String>,

    /// Text generation model
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Write each reply to a WAV file in this directory instead of playing it
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Number of synthesis workers
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Silence before a turn is finalized. Examples: 500ms, 1s
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub inactivity: Option<Duration>,

    /// Stop after this long. Examples: 30s, 5m
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub max_duration: Option<Duration>,

    /// Feed WAV input at real time
    #[arg(long)]
    pub pace: bool,
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
}

fn parse_format(s: &str) -> Result<FragmentFormat, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(FragmentFormat::Json),
        "sentences" | "sentence" => Ok(FragmentFormat::Sentences),
        other => Err(format!("unknown format '{}', expected json or sentences", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "voxturn",
            "run",
            "--input",
            "hola.wav",
            "--inactivity",
            "750ms",
            "--workers",
            "3",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.input, Some(PathBuf::from("hola.wav")));
        assert_eq!(args.inactivity, Some(Duration::from_millis(750)));
        assert_eq!(args.workers, Some(3));
        assert!(!args.pace);
    }

    #[test]
    fn test_scan_format() {
        let cli = Cli::try_parse_from(["voxturn", "scan", "--format", "sentences"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Scan {
                format: FragmentFormat::Sentences
            }
        ));

        let cli = Cli::try_parse_from(["voxturn", "scan"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Scan {
                format: FragmentFormat::Json
            }
        ));

        assert!(Cli::try_parse_from(["voxturn", "scan", "--format", "xml"]).is_err());
    }

    #[test]
    fn test_bad_duration_is_rejected() {
        assert!(Cli::try_parse_from(["voxturn", "run", "--max-duration", "soon"]).is_err());
    }

    #[test]
    fn test_global_config_flag_after_subcommand() {
        let cli =
            Cli::try_parse_from(["voxturn", "config", "show", "--config", "/tmp/v.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/v.toml")));
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Show
            }
        ));
    }
}
