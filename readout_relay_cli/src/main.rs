//! # readout_relay_cli
//!
//! Part of the readout_relay crate family.
//!
//! Command line front end for the readout relay.
//!
//! ## Use
//!
//! ```bash
//! readout_relay_cli -p config.yml new
//! readout_relay_cli -p config.yml generate --events 1000
//! readout_relay_cli -p config.yml
//! ```
//!
//! `new` writes a template configuration to the given path. `generate` writes a DMA dump
//! of synthetic, well-formed events to the configured `source_path`, which is useful for
//! bench tests of a downstream aggregator. Without a subcommand the relay replays the
//! configured dump to the downstream ports. The process exits with status 1 if the relay
//! stops on a fatal error; details are in the log file at `log_path`.
use clap::{value_parser, Arg, ArgAction, Command};
use indicatif::{MultiProgress, ProgressBar};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use libreadout_relay::config::Config;
use libreadout_relay::error::{ProcessorError, SourceError};
use libreadout_relay::fragment::encode_fragments;
use libreadout_relay::ingest_status::IngestStatus;
use libreadout_relay::process::run;
use libreadout_relay::source::write_dump;
use libreadout_relay::synthetic::SyntheticEvent;

/// Largest page the generator writes, in DMA words of payload
const GENERATED_PAGE_WORDS: usize = 256;

fn make_template_config(path: &Path) {
    if let Err(e) = Config::default().write_config_file(path) {
        log::error!("Could not write template config: {e}");
    }
}

fn init_file_logger(path: &Path) -> Result<(), spdlog::Error> {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from(path))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()?,
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()?,
    );
    spdlog::set_default_logger(logger);
    Ok(())
}

/// Write a dump of `n_events` synthetic events using the configured channels.
/// Every `not_reduced_every`-th event is written in the not-reduced layout.
fn generate_dump(
    config: &Config,
    n_events: u32,
    run: u32,
    not_reduced_every: u32,
) -> Result<u64, SourceError> {
    let channels = config.channel_set();
    let mut writer = BufWriter::new(File::create(&config.source_path)?);
    let mut total_bytes = 0;
    for idx in 0..n_events {
        let number = 1 + idx * config.event_stride;
        let mut event = SyntheticEvent::new(number, run << 8).with_node_id(config.node_id);
        for channel in channels.iter() {
            let n_words = 8 + (number as usize + channel) % 24;
            let payload = (0..n_words as u32)
                .map(|i| number.wrapping_mul(0x9E37_79B9) ^ (i << 16 | channel as u32))
                .collect();
            event = event.with_channel(channel, payload);
        }
        if not_reduced_every != 0 && (idx + 1) % not_reduced_every == 0 {
            event = event.not_reduced();
        }
        let fragments = encode_fragments(&event.build(), GENERATED_PAGE_WORDS);
        total_bytes += fragments.iter().map(|f| f.bytes.len() as u64).sum::<u64>();
        write_dump(&mut writer, &fragments)?;
    }
    Ok(total_bytes)
}

fn main() {
    // Create a cli
    let matches = Command::new("readout_relay_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("generate")
                .about("Write a DMA dump of synthetic events to the configured source path")
                .arg(
                    Arg::new("events")
                        .long("events")
                        .value_parser(value_parser!(u32))
                        .default_value("100"),
                )
                .arg(
                    Arg::new("run")
                        .long("run")
                        .value_parser(value_parser!(u32))
                        .default_value("1"),
                )
                .arg(
                    Arg::new("not-reduced-every")
                        .long("not-reduced-every")
                        .help("Write every Nth event in the not-reduced layout (0 for never)")
                        .value_parser(value_parser!(u32))
                        .default_value("0"),
                ),
        )
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the configuration file")
                .action(ArgAction::Set)
                .required(true),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        std::process::exit(1);
    }

    // Parse the cli
    let Some(config_path) = matches.get_one::<String>("path").map(PathBuf::from) else {
        log::error!("A configuration path is required");
        std::process::exit(1);
    };

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        log::info!("Done.");
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };
    log::info!("Config successfully loaded.");

    if let Some(("generate", sub)) = matches.subcommand() {
        let n_events = *sub.get_one::<u32>("events").unwrap_or(&100);
        let run = *sub.get_one::<u32>("run").unwrap_or(&1);
        let not_reduced_every = *sub.get_one::<u32>("not-reduced-every").unwrap_or(&0);
        log::info!(
            "Writing {} synthetic events for run {} to {}...",
            n_events,
            run,
            config.source_path.to_string_lossy()
        );
        match generate_dump(&config, n_events, run, not_reduced_every) {
            Ok(bytes) => log::info!("Done. Wrote {bytes} bytes."),
            Err(e) => {
                log::error!("Failed to write dump: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    log::info!("Source Path: {}", config.source_path.to_string_lossy());
    log::info!("Log Path: {}", config.log_path.to_string_lossy());
    log::info!("Node ID: {:#x}", config.node_id);
    log::info!("Channel Mask: {:#014x}", config.channel_mask);
    log::info!(
        "Workers: {} Downstream: {} .. {}",
        config.n_workers,
        config.worker_address(0),
        config.worker_address(config.n_workers.saturating_sub(1))
    );

    if let Err(e) = init_file_logger(&config.log_path) {
        log::error!("Could not open log file: {e}");
        std::process::exit(1);
    }
    spdlog::info!("Starting readout relay");

    // Setup the progress bar
    let pb = pb_manager.add(ProgressBar::new(100));
    let (tx, rx) = mpsc::channel::<IngestStatus>();
    // Spawn the task!
    let handle = std::thread::spawn(move || run(&config, &tx));

    // The channel closes when the relay thread exits
    for status in rx.iter() {
        pb.set_position((status.progress * 100.0) as u64);
        pb.set_message(format!("run {} -- {} events", status.run_number, status.events));
    }

    let result: Result<_, ProcessorError> = match handle.join() {
        Ok(result) => result,
        Err(_) => {
            log::error!("Failed to join relay task!");
            std::process::exit(1);
        }
    };
    pb.finish();

    match result {
        Ok(summary) => {
            log::info!(
                "Successfully relayed {} events ({} reduced)",
                summary.events,
                summary.reduced
            );
            log::info!("Done.");
        }
        Err(e) => {
            log::error!("Relay stopped with a fatal error: {e}");
            log::error!("Check the log file for details.");
            spdlog::critical!("Relay stopped with a fatal error: {e}");
            std::process::exit(1);
        }
    }
}
