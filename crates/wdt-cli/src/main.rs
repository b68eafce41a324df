//! WDT command line: start a sender against a receiver URL.

mod progress;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wdt_core::{ErrorCode, Sender, WdtOptions, WdtTransferRequest};
use wdt_files::WdtFileInfo;

use progress::{ProgressBarReporter, format_bytes};

/// WDT - warp-speed data transfer over parallel TCP connections
#[derive(Parser)]
#[command(name = "wdt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a directory or file list to a receiver
    Send {
        /// Receiver connection URL (wdt://host?ports=...&transferId=...)
        #[arg(required = true)]
        url: String,

        /// Source directory; overrides the URL's dir parameter
        #[arg(short = 'd', long)]
        directory: Option<PathBuf>,

        /// Explicit files to send, relative to the source directory
        #[arg(short = 'f', long = "file")]
        files: Vec<String>,

        /// Follow symlinks during discovery
        #[arg(long)]
        follow_symlinks: bool,

        /// Read source files with direct I/O
        #[arg(long)]
        direct_reads: bool,

        /// Ask the receiver for its chunk manifest and resume
        #[arg(long)]
        resume: bool,

        /// Disable the CRC-32C block footers
        #[arg(long)]
        no_checksum: bool,

        /// Progress report interval in milliseconds, 0 disables
        #[arg(long, default_value_t = 200)]
        progress_interval: u64,
    },

    /// Print the connection URL for a receiver at HOST
    GenUrl {
        /// Receiver host
        #[arg(required = true)]
        host: String,

        /// First receiver port
        #[arg(short, long, default_value_t = 22356)]
        start_port: u16,

        /// Number of ports (one connection each)
        #[arg(short, long, default_value_t = 8)]
        num_ports: u16,

        /// Directory parameter to embed
        #[arg(short, long, default_value = ".")]
        directory: String,

        /// Transfer id; both ends must use the same one
        #[arg(short, long, default_value = "")]
        transfer_id: String,
    },
}

fn init_logging(cli: &Cli) {
    let default = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_send(
    url: &str,
    directory: Option<PathBuf>,
    files: Vec<String>,
    follow_symlinks: bool,
    direct_reads: bool,
    resume: bool,
    no_checksum: bool,
    progress_interval: u64,
) -> Result<(), String> {
    let mut request =
        WdtTransferRequest::from_url(url).map_err(|err| format!("bad url: {err}"))?;
    if let Some(directory) = directory {
        request.directory = directory;
    }
    request.file_info = files.into_iter().map(WdtFileInfo::new).collect();

    let options = WdtOptions {
        enable_checksum: !no_checksum,
        follow_symlinks,
        direct_reads,
        enable_download_resumption: resume,
        progress_report_interval_ms: progress_interval,
        ..WdtOptions::default()
    };

    let mut sender =
        Sender::new(&request, options).map_err(|err| format!("bad request: {err}"))?;
    if progress_interval > 0 {
        sender.set_progress_reporter(Arc::new(ProgressBarReporter::new()));
    }

    let report = sender
        .transfer()
        .map_err(|code| format!("cannot start transfer: {code}"))?;

    println!(
        "{}: {} in {} blocks, {:.2} MB/s, {} reconnects",
        report.error_code(),
        format_bytes(report.effective_data_bytes()),
        report.summary.num_blocks(),
        report.throughput_mbps(),
        report.num_reconnects(),
    );
    for stats in &report.failed_sources {
        eprintln!("failed: {}", stats.id().unwrap_or("<unknown>"));
    }
    if report.error_code() == ErrorCode::Ok {
        Ok(())
    } else {
        Err(format!("transfer failed: {}", report.error_code()))
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match cli.command {
        Commands::Send {
            url,
            directory,
            files,
            follow_symlinks,
            direct_reads,
            resume,
            no_checksum,
            progress_interval,
        } => run_send(
            &url,
            directory,
            files,
            follow_symlinks,
            direct_reads,
            resume,
            no_checksum,
            progress_interval,
        ),
        Commands::GenUrl {
            host,
            start_port,
            num_ports,
            directory,
            transfer_id,
        } => {
            let mut request = WdtTransferRequest::new(host, start_port, num_ports, directory);
            request.transfer_id = transfer_id;
            println!("{}", request.gen_url_with_secret());
            Ok(())
        }
    };

    if let Err(message) = result {
        eprintln!("{message}");
        std::process::exit(1);
    }
}
