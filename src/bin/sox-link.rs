//! `sox-link` entry point: parse CLI arguments, wire up logging, run the
//! driver, and map the result onto the exit codes spec §6 defines.

use clap::Parser;
use sox_linker::cli::Cli;
use sox_linker::driver::{self, LinkJob};
use tracing_subscriber::EnvFilter;

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("sox_linker=debug,sox_link=debug")
    } else if std::env::var_os("SOX_MACHO_GOT_DEBUG").is_some() {
        EnvFilter::new("sox_linker::object::macho=trace")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("Error: invalid CLI: {message}");
            std::process::exit(2);
        }
    };

    init_tracing(config.debug);

    let job = LinkJob {
        input: &config.input,
        output: config.output,
        target: config.target,
        mode: config.mode,
        link_runtime: config.link_runtime,
        emit_object_only: config.emit_object_only,
    };

    if let Err(errors) = driver::run(job) {
        eprintln!("Error: link failed with {} error(s):", errors.0.len());
        eprintln!("{errors}");
        std::process::exit(1);
    }
}
