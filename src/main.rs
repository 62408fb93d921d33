mod client_loop;
mod config;
mod consts;
mod daemon;
mod log_session;
mod protocol;
mod remote_shell;
mod screen_buffer;
mod session_table;
mod tty;

use std::fs;
use std::io;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser, Debug)]
#[clap(version, author, about)]
struct Args {
    #[clap(short, long, action, help = "the file to write logs to, stderr if unset")]
    log_file: Option<String>,
    #[clap(short, long, action = clap::ArgAction::Count,
           help = "show more in logs, may be provided multiple times")]
    verbose: u8,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[clap(about = "serve starts the gateway daemon, listening for client connections")]
    Serve {
        #[clap(short, long, action, help = "a toml file containing configuration")]
        config_file: Option<String>,
        #[clap(short, long, action, help = "address to bind the control-plane listener to")]
        bind: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let trace_level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    match args.command {
        Commands::Serve { config_file, bind } => daemon::run(config_file, bind),
    }
}
