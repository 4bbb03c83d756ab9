//! servalrx: TPX3 raw stream decoder for the SERVAL readout server.

mod print;

use clap::Parser;
use servalrx_io::{BufferQueue, FileIngress, IngressError, TcpConfig, TcpIngress};
use servalrx_pipeline::{Aggregator, DecodeDispatcher, EventSink, FrameParser};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

/// Queue pop timeout; also bounds how long shutdown takes to notice.
const QUEUE_POP_TIMEOUT: Duration = Duration::from_millis(100);

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ingress(#[from] IngressError),

    #[error("receive thread panicked")]
    ReceiverPanic,
}

/// TPX3 raw stream decoder: connects to a SERVAL server (or reads a
/// captured file) and turns the chunked word stream into pixel-hit and
/// TDC events with live statistics.
#[derive(Parser)]
#[command(name = "servalrx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// SERVAL server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// SERVAL server port
    #[arg(long, default_value_t = 8085)]
    port: u16,

    /// Decode a captured file instead of connecting
    #[arg(long, value_name = "PATH")]
    input_file: Option<PathBuf>,

    /// Restore ordering of sequenced SPIDR packets
    #[arg(long)]
    reorder: bool,

    /// Reorder window size in packets
    #[arg(long, default_value_t = 1000, value_name = "N")]
    reorder_window: usize,

    /// Words between periodic statistics prints
    #[arg(long, default_value_t = 1_000_000, value_name = "N")]
    stats_interval: u64,

    /// Seconds between status lines
    #[arg(long, default_value_t = 10, value_name = "N")]
    stats_time: u64,

    /// Print only the final summary
    #[arg(long)]
    stats_final_only: bool,

    /// Disable statistics output entirely
    #[arg(long)]
    stats_disable: bool,

    /// Recent hits kept for the summary (0 disables)
    #[arg(long, default_value_t = 10, value_name = "N")]
    recent_hit_count: usize,

    /// Decode worker threads (default: 1 for files, max(4, cores) for streams)
    #[arg(long, value_name = "N")]
    decoder_workers: Option<usize>,

    /// Receive queue capacity in buffers
    #[arg(long, default_value_t = 2000, value_name = "N")]
    queue_size: usize,

    /// Exit after the first disconnect instead of reconnecting
    #[arg(long)]
    exit_on_disconnect: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match &cli.input_file {
        Some(path) => run_file(&cli, path.clone()),
        None => run_stream(&cli),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("servalrx: {err}");
            ExitCode::FAILURE
        }
    }
}

fn build_parser(
    cli: &Cli,
    aggregator: &Arc<Aggregator>,
    dispatcher: Option<&Arc<DecodeDispatcher>>,
) -> FrameParser {
    let sink: Arc<dyn EventSink> = aggregator.clone();
    let mut parser = FrameParser::new(sink);
    if let Some(dispatcher) = dispatcher {
        parser = parser.with_dispatcher(Arc::clone(dispatcher));
    }
    if cli.reorder {
        parser = parser.with_reorder(cli.reorder_window, true);
    }
    parser
}

/// Drains workers, publishes the last counters, and prints the summary.
fn finalize(
    cli: &Cli,
    aggregator: &Arc<Aggregator>,
    dispatcher: Option<&Arc<DecodeDispatcher>>,
    parser: &mut FrameParser,
    connection: Option<servalrx_io::ConnectionStats>,
    file: Option<&servalrx_io::IngressSummary>,
    queue_dropped: Option<u64>,
) {
    parser.finish();
    if let Some(dispatcher) = dispatcher {
        dispatcher.wait_until_idle();
        dispatcher.shutdown();
    }
    if let Some(stats) = parser.reorder_stats() {
        aggregator.set_reorder_stats(stats);
    }
    aggregator.finalize_rates();
    if !cli.stats_disable {
        print::final_summary(&aggregator.snapshot(), connection, file, queue_dropped);
    }
}

fn run_file(cli: &Cli, path: PathBuf) -> Result<()> {
    let ingress = FileIngress::open(&path)?;
    info!(
        "decoding {} ({} bytes, {} words)",
        path.display(),
        ingress.file_size(),
        ingress.word_count()
    );

    let aggregator = Arc::new(Aggregator::new(cli.recent_hit_count));
    let workers = cli
        .decoder_workers
        .unwrap_or_else(|| DecodeDispatcher::default_worker_count(true));
    let dispatcher =
        (workers > 1).then(|| Arc::new(DecodeDispatcher::new(workers, Arc::clone(&aggregator))));

    let mut parser = build_parser(cli, &aggregator, dispatcher.as_ref());
    let summary = ingress.run(&mut parser);

    finalize(
        cli,
        &aggregator,
        dispatcher.as_ref(),
        &mut parser,
        None,
        Some(&summary),
        None,
    );
    Ok(())
}

fn run_stream(cli: &Cli) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    {
        // The handler only sets the flag; every waiting primitive observes
        // it on its short timeout.
        let stop = Arc::clone(&stop);
        if let Err(err) = ctrlc::set_handler(move || stop.store(true, Ordering::Release)) {
            tracing::warn!("could not install SIGINT handler: {err}");
        }
    }

    let aggregator = Arc::new(Aggregator::new(cli.recent_hit_count));
    let workers = cli
        .decoder_workers
        .unwrap_or_else(|| DecodeDispatcher::default_worker_count(false));
    let dispatcher = Arc::new(DecodeDispatcher::new(workers, Arc::clone(&aggregator)));
    let mut parser = build_parser(cli, &aggregator, Some(&dispatcher));

    let queue = Arc::new(BufferQueue::new(cli.queue_size));
    let config = TcpConfig {
        host: cli.host.clone(),
        port: cli.port,
        exit_on_disconnect: cli.exit_on_disconnect,
        ..TcpConfig::default()
    };
    info!("connecting to {}:{}", cli.host, cli.port);

    let ingress = TcpIngress::new(config, Arc::clone(&stop));
    let counters = ingress.counters();
    let receiver = {
        let queue = Arc::clone(&queue);
        std::thread::Builder::new()
            .name("tcp-recv".to_string())
            .spawn(move || ingress.run(&queue))?
    };

    let print_live = !cli.stats_disable && !cli.stats_final_only;
    let mut words_since_print = 0u64;
    let mut last_status = Instant::now();
    let mut status_hits = 0u64;

    loop {
        match queue.pop_timeout(QUEUE_POP_TIMEOUT) {
            Some(buffer) => {
                words_since_print += parser.process(&buffer) as u64;
            }
            None => {
                if queue.is_finished() || stop.load(Ordering::Acquire) {
                    break;
                }
            }
        }

        if print_live {
            if words_since_print >= cli.stats_interval {
                words_since_print = 0;
                dispatcher.flush_all();
                if let Some(stats) = parser.reorder_stats() {
                    aggregator.set_reorder_stats(stats);
                }
                print::periodic(&aggregator.snapshot());
            }
            if last_status.elapsed() >= Duration::from_secs(cli.stats_time.max(1)) {
                dispatcher.flush_all();
                let total = aggregator.snapshot().total_hits;
                print::status(total - status_hits, cli.stats_time.max(1));
                status_hits = total;
                last_status = Instant::now();
            }
        }
    }

    // Unblock the receiver if we left the loop on SIGINT.
    stop.store(true, Ordering::Release);
    let receive_result = receiver.join().map_err(|_| CliError::ReceiverPanic)?;

    finalize(
        cli,
        &aggregator,
        Some(&dispatcher),
        &mut parser,
        Some(counters.snapshot()),
        None,
        Some(queue.dropped()),
    );

    receive_result?;
    Ok(())
}
