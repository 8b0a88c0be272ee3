use std::io::Write;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::config::Config;
use super::constants::DEFAULT_SLOT_CAPACITY;
use super::dispatcher::{Dispatcher, PoolSettings};
use super::error::{ProcessorError, SendError, ValidationError};
use super::event::AssembledEvent;
use super::ingest_status::IngestStatus;
use super::reassembler::Reassembler;
use super::reducer::reduce_event;
use super::sender::connect_downstream;
use super::source::{DumpFileSource, FragmentSource};
use super::telemetry::{Reporter, Scope, Telemetry};
use super::validator::{ValidationOutcome, Validator};

/// Progress step between two status messages
const STATUS_STEP: f32 = 0.01;

/// Totals of a completed relay
#[derive(Debug, Clone)]
pub struct RelaySummary {
    pub events: u64,
    pub reduced: u64,
    pub soft_corrections: u64,
    pub sent_per_worker: Vec<u64>,
    pub telemetry: Arc<Telemetry>,
}

/// Validate an event at ingest, sending a not-reduced event through the reducer
/// once. Anything that is not OK after that is fatal.
fn accept_event(
    validator: &mut Validator,
    telemetry: &Telemetry,
    mut event: AssembledEvent,
) -> Result<AssembledEvent, ValidationError> {
    match validator.validate(event.as_bytes()) {
        ValidationOutcome::Ok => return Ok(event),
        ValidationOutcome::Fatal(e) => return Err(e),
        ValidationOutcome::Recoverable(_) => (),
    }

    if let Err(e) = reduce_event(&mut event) {
        spdlog::error!("Reduction failed: {e}");
        telemetry.record_failure(validator.scope(), e.kind());
        return Err(e);
    }
    telemetry.record_reduction();

    match validator.validate(event.as_bytes()) {
        ValidationOutcome::Ok => Ok(event),
        ValidationOutcome::Fatal(e) => Err(e),
        ValidationOutcome::Recoverable(_) => {
            let e = ValidationError::StillUnreduced;
            spdlog::error!("{e}");
            telemetry.record_failure(validator.scope(), e.kind());
            Err(e)
        }
    }
}

/// The main loop of the relay.
///
/// Pulls fragments from `source`, reassembles and validates events, and hands
/// them to the sender pool. `open_link(i)` opens worker `i`'s downstream link.
/// Any fatal classification stops the loop and is returned.
pub fn process<S, L, F>(
    config: &Config,
    source: &mut S,
    open_link: F,
    tx: &Sender<IngestStatus>,
) -> Result<RelaySummary, ProcessorError>
where
    S: FragmentSource,
    L: Write + Send + 'static,
    F: Fn(usize) -> Result<L, SendError> + Send + Sync + 'static,
{
    config.startup_checks()?;

    let channels = Arc::new(config.channel_set());
    let telemetry = Arc::new(Telemetry::new(config.n_workers));
    spdlog::info!(
        "Node {:#x} relaying {} channels (mask {:#014x}) over {} workers",
        config.node_id,
        channels.len(),
        channels.mask(),
        config.n_workers
    );

    let mut dispatcher = Dispatcher::spawn(
        PoolSettings {
            n_workers: config.n_workers,
            node_id: config.node_id,
            stride: config.event_stride,
            slot_capacity: DEFAULT_SLOT_CAPACITY,
        },
        channels.clone(),
        telemetry.clone(),
        open_link,
    )?;
    let mut validator = Validator::new(
        channels,
        telemetry.clone(),
        Scope::Ingest,
        config.event_stride,
    );
    let mut reassembler = Reassembler::new();

    source.start_transfer()?;
    tx.send(IngestStatus::new(0.0, 0, 0))?;

    let reporter = Reporter::spawn(telemetry.clone(), config.report_interval())?;
    let mut last_progress: f32 = 0.0;
    let mut soft_corrections = 0;

    while let Some(fragment) = source.next_fragment()? {
        let pushed = reassembler.push(&fragment);
        source.release(fragment);

        if reassembler.soft_corrections() > soft_corrections {
            soft_corrections = reassembler.soft_corrections();
            telemetry.record_soft_correction();
        }

        let event = match pushed {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                spdlog::error!("Fragment rejected: {e}");
                telemetry.record_failure(Scope::Ingest, e.kind());
                return Err(e.into());
            }
        };

        let event = accept_event(&mut validator, &telemetry, event)?;
        let payload = event.payload();
        telemetry.record_event(Scope::Ingest, payload.len());
        dispatcher.dispatch(payload)?;

        let progress = source.progress().unwrap_or(0.0);
        if progress - last_progress >= STATUS_STEP {
            last_progress = progress;
            tx.send(IngestStatus::new(
                progress,
                validator.run_state().run,
                dispatcher.dispatched(),
            ))?;
        }
    }

    if reassembler.is_mid_event() {
        spdlog::warn!(
            "Source ended in the middle of a multi-page event; the partial event was dropped"
        );
    }

    let events = dispatcher.dispatched();
    let sent_per_worker = dispatcher.finish()?;
    drop(reporter);
    telemetry.report();
    tx.send(IngestStatus::new(1.0, validator.run_state().run, events))?;
    spdlog::info!("Relayed {} events.", events);

    Ok(RelaySummary {
        events,
        reduced: telemetry.reduced(),
        soft_corrections: telemetry.soft_corrections(),
        sent_per_worker,
        telemetry,
    })
}

/// Replay the configured dump file to the configured downstream ports.
///
/// This is the flavor used by readout_relay_cli.
pub fn run(config: &Config, tx: &Sender<IngestStatus>) -> Result<RelaySummary, ProcessorError> {
    let mut source = DumpFileSource::new(&config.source_path)?;
    let link_config = config.clone();
    let open_link = move |worker_id: usize| {
        connect_downstream(
            &link_config.worker_address(worker_id),
            link_config.send_timeout(),
            link_config.connect_retries,
        )
    };
    process(config, &mut source, open_link, tx)
}
