//! CLI argument parsing for tailshipd.

use anyhow::Result;
use std::path::PathBuf;

pub enum Command {
    /// Load the config, wire the pipeline, and run until a shutdown signal.
    Run { config_path: PathBuf, state_dir: PathBuf },
    /// Load and expand the config, report any errors, and exit without
    /// starting anything.
    Validate { config_path: PathBuf },
}

pub fn print_usage() {
    eprintln!("tailshipd - durable log-tailing and shipping agent");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  tailshipd run --config <FILE> [--state-dir <DIR>]");
    eprintln!("  tailshipd validate --config <FILE>");
    eprintln!("  tailshipd --help");
    eprintln!("  tailshipd --version");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  run       Start discovery, reading, aggregation, and shipping");
    eprintln!("  validate  Parse and expand a config file, then exit");
    eprintln!();
    eprintln!("Run arguments:");
    eprintln!("  --config <FILE>     Path to the JSON config file");
    eprintln!("  --state-dir <DIR>   Directory for the machine UUID file (default: .)");
    eprintln!();
    eprintln!("Validate arguments:");
    eprintln!("  --config <FILE>     Path to the JSON config file");
}

fn parse_required_arg(args: &[String], i: &mut usize, flag: &str) -> Result<String> {
    if *i + 1 >= args.len() {
        return Err(anyhow::anyhow!("{} requires an argument", flag));
    }
    let value = args[*i + 1].clone();
    *i += 2;
    Ok(value)
}

fn parse_path_arg(args: &[String], i: &mut usize, flag: &str) -> Result<PathBuf> {
    let value = parse_required_arg(args, i, flag)?;
    Ok(PathBuf::from(value))
}

fn parse_run_args(args: &[String]) -> Result<Command> {
    let mut config_path: Option<PathBuf> = None;
    let mut state_dir = PathBuf::from(".");

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => config_path = Some(parse_path_arg(args, &mut i, "--config")?),
            "--state-dir" => state_dir = parse_path_arg(args, &mut i, "--state-dir")?,
            other => return Err(anyhow::anyhow!("Unknown argument: {}", other)),
        }
    }

    let config_path = config_path.ok_or_else(|| anyhow::anyhow!("--config is required"))?;
    Ok(Command::Run { config_path, state_dir })
}

fn parse_validate_args(args: &[String]) -> Result<Command> {
    let mut config_path: Option<PathBuf> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => config_path = Some(parse_path_arg(args, &mut i, "--config")?),
            other => return Err(anyhow::anyhow!("Unknown argument: {}", other)),
        }
    }

    let config_path = config_path.ok_or_else(|| anyhow::anyhow!("--config is required"))?;
    Ok(Command::Validate { config_path })
}

/// Parse CLI arguments into a `Command`. The version display is handled via
/// a closure passed in to avoid circular dependencies on a version module.
pub fn parse_args_impl<F>(print_version: F) -> Result<Command>
where
    F: FnOnce(),
{
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Err(anyhow::anyhow!("Missing command"));
    }

    let command = &args[1];

    if command == "--version" || command == "-V" {
        print_version();
        std::process::exit(0);
    }

    if command == "--help" || command == "-h" {
        print_usage();
        std::process::exit(0);
    }

    match command.as_str() {
        "run" => parse_run_args(&args[2..]),
        "validate" => parse_validate_args(&args[2..]),
        _ => Err(anyhow::anyhow!("Unknown command: {}", command)),
    }
}

pub fn parse_args() -> Result<Command> {
    parse_args_impl(|| {
        println!("tailshipd {}", env!("CARGO_PKG_VERSION"));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_require_config() {
        let err = parse_run_args(&["--state-dir".to_string(), "/tmp".to_string()]).unwrap_err();
        assert!(err.to_string().contains("--config"));
    }

    #[test]
    fn run_args_parse_config_and_state_dir() {
        let args = vec!["--config".to_string(), "cfg.json".to_string(), "--state-dir".to_string(), "/var/lib/tailship".to_string()];
        match parse_run_args(&args).unwrap() {
            Command::Run { config_path, state_dir } => {
                assert_eq!(config_path, PathBuf::from("cfg.json"));
                assert_eq!(state_dir, PathBuf::from("/var/lib/tailship"));
            }
            _ => panic!("expected Run"),
        }
    }

    #[test]
    fn run_args_default_state_dir() {
        let args = vec!["--config".to_string(), "cfg.json".to_string()];
        match parse_run_args(&args).unwrap() {
            Command::Run { state_dir, .. } => assert_eq!(state_dir, PathBuf::from(".")),
            _ => panic!("expected Run"),
        }
    }

    #[test]
    fn validate_args_require_config() {
        let err = parse_validate_args(&[]).unwrap_err();
        assert!(err.to_string().contains("--config"));
    }

    #[test]
    fn unknown_argument_is_rejected() {
        let err = parse_run_args(&["--bogus".to_string()]).unwrap_err();
        assert!(err.to_string().contains("Unknown argument"));
    }
}
