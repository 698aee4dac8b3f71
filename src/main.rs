//! tailshipd - durable log-tailing and shipping agent
//!
//! Usage: tailshipd <command> [arguments]

mod cli;

use cli::{parse_args, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tailship::config::Config;
use tailship::pipeline;

fn print_short_usage() {
    cli::print_usage();
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    if args.len() >= 2 {
        match args[1].as_str() {
            "--help" | "-h" => {
                print_short_usage();
                return ExitCode::SUCCESS;
            }
            "--version" | "-V" => {
                println!("tailshipd {}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            _ => {}
        }
    }

    if args.len() < 2 {
        print_short_usage();
        return ExitCode::from(1);
    }

    match parse_args() {
        Ok(Command::Validate { config_path }) => match Config::load(&config_path) {
            Ok(cfg) => {
                println!("config ok: {} input(s)", cfg.inputs.len());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::from(1)
            }
        },
        Ok(Command::Run { config_path, state_dir }) => match run(config_path, state_dir) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::from(1)
            }
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            print_short_usage();
            ExitCode::from(1)
        }
    }
}

fn run(config_path: PathBuf, state_dir: PathBuf) -> anyhow::Result<()> {
    let config = Config::load(&config_path)?;
    std::fs::create_dir_all(&state_dir)?;

    let run_flag = Arc::new(AtomicBool::new(true));

    #[cfg(unix)]
    {
        use signal_hook::consts::signal;
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([signal::SIGTERM, signal::SIGINT])?;
        let run_flag = run_flag.clone();
        std::thread::spawn(move || {
            for _ in &mut signals {
                run_flag.store(false, Ordering::SeqCst);
                break;
            }
        });
    }

    let pipeline = pipeline::spawn(config, state_dir, run_flag.clone())?;
    while run_flag.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    pipeline.join();
    Ok(())
}
