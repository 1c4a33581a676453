//! naming: delegation config operator tool
//!
//! Checks delegation config documents without a host application.
//!
//! Usage:
//!   naming validate <config>                      - Validate a config
//!   naming schema <config>                        - Print the exposed tool schemas
//!   naming render <config> [--args JSON] [--urging] - Render the prompt or urging message
//!   naming units <config> [--args JSON]           - Show how one call is split into units
//!   naming --help                                 - Show help

mod cli;

use std::path::PathBuf;

use naming_core::EngineSettings;
use tracing_subscriber::EnvFilter;

/// Run mode
#[derive(Debug, PartialEq)]
enum RunMode {
    Validate { config: PathBuf },
    Schema { config: PathBuf },
    Render {
        config: PathBuf,
        args: Option<String>,
        urging: bool,
    },
    Units { config: PathBuf, args: Option<String> },
    /// Show help
    Help,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match parse_args(&args) {
        Ok(mode) => mode,
        Err(message) => {
            eprintln!("{}", cli::paint_error(&message));
            eprintln!();
            print_help();
            std::process::exit(2);
        }
    };

    match mode {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("naming {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    // Logs go to stderr so command output stays pipeable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();

    let settings = EngineSettings::from_env();
    tracing::debug!(?settings, "Engine settings");

    let output = match mode {
        RunMode::Validate { config } => cli::validate(&config),
        RunMode::Schema { config } => cli::schema(&config),
        RunMode::Render {
            config,
            args,
            urging,
        } => cli::render(&config, args.as_deref(), urging),
        RunMode::Units { config, args } => cli::units(&config, args.as_deref(), &settings),
        RunMode::Help | RunMode::Version => return Ok(()),
    };

    match output {
        Ok(text) => {
            println!("{}", text);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", cli::paint_error(&format!("{:#}", e)));
            std::process::exit(1);
        }
    }
}

/// Parse command line arguments (without the program name)
fn parse_args(args: &[String]) -> Result<RunMode, String> {
    let mut positional = Vec::new();
    let mut call_args = None;
    let mut urging = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(RunMode::Help),
            "--version" | "-v" => return Ok(RunMode::Version),
            "--args" | "-a" => match iter.next() {
                Some(value) => call_args = Some(value.clone()),
                None => return Err("--args needs a JSON object".to_string()),
            },
            "--urging" | "-u" => urging = true,
            other if other.starts_with('-') => return Err(format!("Unknown option: {}", other)),
            other => positional.push(other.to_string()),
        }
    }

    let mut positional = positional.into_iter();
    let Some(command) = positional.next() else {
        return Ok(RunMode::Help);
    };
    let config = match positional.next() {
        Some(path) => PathBuf::from(path),
        None => return Err(format!("'{}' needs a config file", command)),
    };
    if let Some(extra) = positional.next() {
        return Err(format!("Unexpected argument: {}", extra));
    }

    match command.as_str() {
        "validate" => Ok(RunMode::Validate { config }),
        "schema" => Ok(RunMode::Schema { config }),
        "render" => Ok(RunMode::Render {
            config,
            args: call_args,
            urging,
        }),
        "units" => Ok(RunMode::Units {
            config,
            args: call_args,
        }),
        other => Err(format!("Unknown command: {}", other)),
    }
}

/// Print help message
fn print_help() {
    println!("naming - sub-task delegation config tool");
    println!();
    println!("Usage:");
    println!("  naming validate <config>                  Validate a delegation config");
    println!("  naming schema <config>                    Print the function, return and error tool schemas");
    println!("  naming render <config> [--args JSON]      Render the prompt for a call");
    println!("                         [--urging]         Render the urging message instead");
    println!("  naming units <config> [--args JSON]       Show the sub-task units of a call");
    println!("  naming --help                             Show this help message");
    println!("  naming --version                          Show version");
    println!();
    println!("Config files ending in .json are read as JSON, everything else as TOML.");
    println!("${{VAR}} references in config files are expanded from the environment.");
    println!();
    println!("Environment Variables:");
    println!("  NAMING_MAX_CONCURRENCY    Default bound on concurrent units");
    println!("  NAMING_UNIT_TIMEOUT_SECS  Default per-unit timeout in seconds");
    println!("  NAMING_PARK_PAUSED        Keep paused delegations for resumption (default: true)");
    println!("  RUST_LOG                  Log filter (default: info)");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_arguments_shows_help() {
        assert_eq!(parse_args(&[]), Ok(RunMode::Help));
        assert_eq!(parse_args(&args(&["units", "-h"])), Ok(RunMode::Help));
    }

    #[test]
    fn test_render_options() {
        let mode = parse_args(&args(&["render", "review.toml", "--urging", "--args", "{}"]));
        assert_eq!(
            mode,
            Ok(RunMode::Render {
                config: PathBuf::from("review.toml"),
                args: Some("{}".to_string()),
                urging: true,
            })
        );
    }

    #[test]
    fn test_argument_errors() {
        assert_eq!(
            parse_args(&args(&["validate"])),
            Err("'validate' needs a config file".to_string())
        );
        assert_eq!(
            parse_args(&args(&["run", "a.toml"])),
            Err("Unknown command: run".to_string())
        );
        assert_eq!(
            parse_args(&args(&["units", "a.toml", "--args"])),
            Err("--args needs a JSON object".to_string())
        );
        assert_eq!(
            parse_args(&args(&["schema", "a.toml", "--fast"])),
            Err("Unknown option: --fast".to_string())
        );
    }
}
