use std::io::Write;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use super::channel_set::ActiveChannelSet;
use super::constants::SLOTS_PER_WORKER;
use super::error::{DispatchError, SendError, WorkerError};
use super::sender::{encode_send_frame, write_frame};
use super::telemetry::{Scope, Telemetry};
use super::validator::{ValidationOutcome, Validator};

/// One of the fixed buffers owned by a worker.
///
/// A slot sitting in a worker's free channel is EMPTY and belongs to the
/// producer; a slot in the full channel is FULL and belongs to the worker.
#[derive(Debug)]
pub struct BufferSlot {
    seq: u64,
    data: Vec<u8>,
}

impl BufferSlot {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            seq: 0,
            data: Vec::with_capacity(capacity),
        }
    }

    fn fill(&mut self, seq: u64, event: &[u8]) {
        self.seq = seq;
        self.data.clear();
        self.data.extend_from_slice(event);
    }
}

/// Settings shared by every worker in the pool
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub n_workers: usize,
    pub node_id: u32,
    /// Event number increment between consecutive events at ingest
    pub stride: u32,
    /// Initial capacity of each slot, in bytes
    pub slot_capacity: usize,
}

struct Lane {
    full_tx: Option<Sender<BufferSlot>>,
    free_rx: Receiver<BufferSlot>,
    handle: Option<JoinHandle<Result<u64, WorkerError>>>,
}

/// Round-robin hand-off of validated events to a fixed pool of sender threads.
///
/// Each worker owns `SLOTS_PER_WORKER` slots. `dispatch` blocks while the target
/// worker has no EMPTY slot, so a slow link stalls the producer without dropping
/// or reordering the events bound for it.
pub struct Dispatcher {
    lanes: Vec<Lane>,
    next_seq: u64,
}

impl Dispatcher {
    /// Start the worker threads. `open_link(i)` is called on worker `i`'s own
    /// thread to open its downstream connection.
    pub fn spawn<S, F>(
        settings: PoolSettings,
        channels: Arc<ActiveChannelSet>,
        telemetry: Arc<Telemetry>,
        open_link: F,
    ) -> Result<Self, DispatchError>
    where
        S: Write + Send + 'static,
        F: Fn(usize) -> Result<S, SendError> + Send + Sync + 'static,
    {
        let open_link = Arc::new(open_link);
        let mut lanes = Vec::with_capacity(settings.n_workers);
        for id in 0..settings.n_workers {
            let (full_tx, full_rx) = bounded(SLOTS_PER_WORKER);
            let (free_tx, free_rx) = bounded(SLOTS_PER_WORKER);
            for _ in 0..SLOTS_PER_WORKER {
                free_tx
                    .send(BufferSlot::with_capacity(settings.slot_capacity))
                    .map_err(|_| DispatchError::WorkerGone(id))?;
            }

            let worker = Worker {
                id,
                node_id: settings.node_id,
                full_rx,
                free_tx,
                validator: Validator::new(
                    channels.clone(),
                    telemetry.clone(),
                    Scope::Worker(id),
                    settings.stride.wrapping_mul(settings.n_workers as u32),
                ),
                telemetry: telemetry.clone(),
                scratch: Vec::with_capacity(settings.slot_capacity),
                frame: Vec::new(),
            };
            let open_link = open_link.clone();
            let handle = std::thread::Builder::new()
                .name(format!("sender-{id}"))
                .spawn(move || -> Result<u64, WorkerError> {
                    let link = open_link(id).inspect_err(|e| {
                        spdlog::error!("worker {id}: {e}");
                        worker.telemetry.record_failure(Scope::Worker(id), e.kind());
                    })?;
                    worker.run(link)
                })?;

            lanes.push(Lane {
                full_tx: Some(full_tx),
                free_rx,
                handle: Some(handle),
            });
        }
        spdlog::info!("Started {} sender workers", settings.n_workers);

        Ok(Self { lanes, next_seq: 0 })
    }

    /// Number of events handed off so far
    pub fn dispatched(&self) -> u64 {
        self.next_seq
    }

    /// Copy an event into the next worker's slot. Returns the worker id.
    pub fn dispatch(&mut self, event: &[u8]) -> Result<usize, DispatchError> {
        let worker = (self.next_seq % self.lanes.len() as u64) as usize;
        let lane = &self.lanes[worker];

        let mut slot = match lane.free_rx.recv() {
            Ok(slot) => slot,
            Err(_) => return Err(self.collect_failure(worker)),
        };
        slot.fill(self.next_seq, event);

        let delivered = match &lane.full_tx {
            Some(full_tx) => full_tx.send(slot).is_ok(),
            None => false,
        };
        if !delivered {
            return Err(self.collect_failure(worker));
        }
        self.next_seq += 1;
        Ok(worker)
    }

    /// Join a worker whose channels have closed and report why it stopped.
    fn collect_failure(&mut self, worker: usize) -> DispatchError {
        let lane = &mut self.lanes[worker];
        lane.full_tx.take();
        match lane.handle.take().map(JoinHandle::join) {
            Some(Ok(Err(source))) => DispatchError::WorkerFailed { worker, source },
            Some(Err(_)) => DispatchError::WorkerPanicked(worker),
            Some(Ok(Ok(_))) | None => DispatchError::WorkerGone(worker),
        }
    }

    /// Close every lane, let the workers drain their FULL slots, and join them.
    ///
    /// Returns the number of events each worker sent, or the first failure.
    pub fn finish(mut self) -> Result<Vec<u64>, DispatchError> {
        for lane in self.lanes.iter_mut() {
            lane.full_tx.take();
        }

        let mut sent = Vec::with_capacity(self.lanes.len());
        let mut first_failure = None;
        for worker in 0..self.lanes.len() {
            let result = match self.lanes[worker].handle.take().map(JoinHandle::join) {
                Some(Ok(Ok(count))) => Ok(count),
                Some(Ok(Err(source))) => Err(DispatchError::WorkerFailed { worker, source }),
                Some(Err(_)) => Err(DispatchError::WorkerPanicked(worker)),
                None => Err(DispatchError::WorkerGone(worker)),
            };
            match result {
                Ok(count) => sent.push(count),
                Err(e) => {
                    spdlog::error!("{e}");
                    sent.push(0);
                    first_failure.get_or_insert(e);
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(sent),
        }
    }
}

impl Drop for Dispatcher {
    /// A dispatcher dropped without `finish` (the ingest loop stopped on a fatal
    /// error) still closes its lanes and joins every worker. Worker failures are
    /// only logged here.
    fn drop(&mut self) {
        for lane in self.lanes.iter_mut() {
            lane.full_tx.take();
        }
        for (worker, lane) in self.lanes.iter_mut().enumerate() {
            match lane.handle.take().map(JoinHandle::join) {
                Some(Ok(Err(e))) => spdlog::error!("worker {worker} stopped: {e}"),
                Some(Err(_)) => spdlog::error!("worker {worker} panicked"),
                Some(Ok(Ok(_))) | None => (),
            }
        }
    }
}

struct Worker {
    id: usize,
    node_id: u32,
    full_rx: Receiver<BufferSlot>,
    free_tx: Sender<BufferSlot>,
    validator: Validator,
    telemetry: Arc<Telemetry>,
    scratch: Vec<u8>,
    frame: Vec<u8>,
}

impl Worker {
    fn run<S: Write>(mut self, mut link: S) -> Result<u64, WorkerError> {
        let mut sent = 0;
        while let Ok(slot) = self.full_rx.recv() {
            self.scratch.clear();
            self.scratch.extend_from_slice(&slot.data);
            let seq = slot.seq;
            // The producer may already have shut down
            let _ = self.free_tx.send(slot);

            if let Err(e) = self.forward(&mut link) {
                spdlog::error!("worker {}: event #{} not sent: {}", self.id, seq, e);
                if let WorkerError::Send(send) = &e {
                    self.telemetry
                        .record_failure(Scope::Worker(self.id), send.kind());
                }
                return Err(e);
            }
            sent += 1;
        }

        link.flush().map_err(SendError::from)?;
        spdlog::info!("worker {}: done after {} events", self.id, sent);
        Ok(sent)
    }

    fn forward<S: Write>(&mut self, link: &mut S) -> Result<(), WorkerError> {
        match self.validator.validate(&self.scratch) {
            ValidationOutcome::Ok => (),
            ValidationOutcome::Recoverable(_) => return Err(WorkerError::Unreduced),
            ValidationOutcome::Fatal(e) => return Err(WorkerError::Validation(e)),
        }
        encode_send_frame(&mut self.frame, &self.scratch, self.node_id);
        write_frame(link, &self.frame)?;
        self.telemetry
            .record_event(Scope::Worker(self.id), self.frame.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{POS_EVENT_NUMBER, SEND_HEADER_WORDS};
    use crate::synthetic::SyntheticEvent;
    use byteorder::{ByteOrder, LittleEndian};
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    const EXP_RUN: u32 = 0x0040_0500;

    /// In-memory downstream link shared with the test
    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Sink {
        /// Event numbers of every frame received, in order
        fn event_numbers(&self) -> Vec<u32> {
            let bytes = self.0.lock().unwrap();
            let mut numbers = Vec::new();
            let mut pos = 0;
            while pos < bytes.len() {
                let total = LittleEndian::read_u32(&bytes[pos..]) as usize * 4;
                let event = &bytes[pos + SEND_HEADER_WORDS * 4..];
                numbers.push(LittleEndian::read_u32(&event[POS_EVENT_NUMBER * 4..]));
                pos += total;
            }
            numbers
        }
    }

    /// A link that blocks every write until the gate opens
    #[derive(Clone)]
    struct Gated {
        open: Arc<(Mutex<bool>, Condvar)>,
        sink: Sink,
    }

    impl Write for Gated {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let (lock, cvar) = &*self.open;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
            self.sink.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn settings(n_workers: usize) -> PoolSettings {
        PoolSettings {
            n_workers,
            node_id: 9,
            stride: 1,
            slot_capacity: 1024,
        }
    }

    fn event(number: u32) -> Vec<u8> {
        SyntheticEvent::new(number, EXP_RUN)
            .with_channel(0, vec![number, 1, 2])
            .with_channel(1, vec![3])
            .build()
    }

    fn channels() -> Arc<ActiveChannelSet> {
        Arc::new(ActiveChannelSet::from_channels(&[0, 1]))
    }

    #[test]
    fn test_round_robin_fairness() {
        let sinks: Vec<Sink> = (0..5).map(|_| Sink::default()).collect();
        let links = sinks.clone();
        let telemetry = Arc::new(Telemetry::new(5));
        let mut dispatcher = Dispatcher::spawn(settings(5), channels(), telemetry.clone(), move |id| {
            Ok(links[id].clone())
        })
        .unwrap();

        for number in 1..=10 {
            let worker = dispatcher.dispatch(&event(number)).unwrap();
            assert_eq!(worker, (number as usize - 1) % 5);
        }
        assert_eq!(dispatcher.finish().unwrap(), vec![2; 5]);

        for (id, sink) in sinks.iter().enumerate() {
            let first = id as u32 + 1;
            assert_eq!(sink.event_numbers(), vec![first, first + 5]);
            assert_eq!(telemetry.events(Scope::Worker(id)), 2);
        }
    }

    #[test]
    fn test_slow_worker_stalls_only_its_producer_path() {
        let open = Arc::new((Mutex::new(false), Condvar::new()));
        let slow = Gated {
            open: open.clone(),
            sink: Sink::default(),
        };
        let fast = Sink::default();
        let (slow_link, fast_link) = (slow.clone(), fast.clone());
        let telemetry = Arc::new(Telemetry::new(2));
        let dispatcher = Dispatcher::spawn(settings(2), channels(), telemetry, move |id| {
            let link: Box<dyn Write + Send> = if id == 0 {
                Box::new(slow_link.clone())
            } else {
                Box::new(fast_link.clone())
            };
            Ok(link)
        })
        .unwrap();

        let dispatcher = Arc::new(Mutex::new(dispatcher));
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let producer = {
            let dispatcher = dispatcher.clone();
            std::thread::spawn(move || {
                // Worker 0 holds one event in its writer and two in its slots,
                // so the fourth event for worker 0 (#7) has to wait.
                for number in 1..=8 {
                    dispatcher.lock().unwrap().dispatch(&event(number)).unwrap();
                    done_tx.send(number).unwrap();
                }
            })
        };

        let mut delivered = Vec::new();
        while let Ok(number) = done_rx.recv_timeout(Duration::from_millis(500)) {
            delivered.push(number);
        }
        assert_eq!(delivered, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(fast.event_numbers(), vec![2, 4, 6]);
        assert!(slow.sink.event_numbers().is_empty());

        {
            let (lock, cvar) = &*open;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        producer.join().unwrap();
        let dispatcher = Arc::try_unwrap(dispatcher).ok().unwrap().into_inner().unwrap();
        assert_eq!(dispatcher.finish().unwrap(), vec![4, 4]);
        assert_eq!(slow.sink.event_numbers(), vec![1, 3, 5, 7]);
        assert_eq!(fast.event_numbers(), vec![2, 4, 6, 8]);
    }

    #[test]
    fn test_worker_failure_reaches_producer() {
        let telemetry = Arc::new(Telemetry::new(1));
        let mut dispatcher = Dispatcher::spawn(settings(1), channels(), telemetry.clone(), |_| {
            let closed: Vec<u8> = Vec::new();
            Ok(std::io::Cursor::new(closed.into_boxed_slice()))
        })
        .unwrap();

        let mut result = Ok(0);
        for number in 1..=4 {
            result = dispatcher.dispatch(&event(number));
            if result.is_err() {
                break;
            }
        }
        let err = match result {
            Err(e) => e,
            Ok(_) => dispatcher.finish().unwrap_err(),
        };
        assert!(matches!(
            err,
            DispatchError::WorkerFailed {
                worker: 0,
                source: WorkerError::Send(SendError::Disconnected { sent: 0, .. })
            }
        ));
        assert_eq!(telemetry.failures("disconnect"), 1);
    }

    #[test]
    fn test_worker_rejects_corrupted_event() {
        let sink = Sink::default();
        let link = sink.clone();
        let telemetry = Arc::new(Telemetry::new(1));
        let mut dispatcher =
            Dispatcher::spawn(settings(1), channels(), telemetry.clone(), move |_| Ok(link.clone()))
                .unwrap();

        let bad = SyntheticEvent::new(1, EXP_RUN)
            .with_channel(0, vec![1])
            .with_channel(1, vec![2])
            .with_corrupted_crc(1)
            .build();
        dispatcher.dispatch(&bad).unwrap();
        assert!(matches!(
            dispatcher.finish(),
            Err(DispatchError::WorkerFailed {
                worker: 0,
                source: WorkerError::Validation(_)
            })
        ));
        assert!(sink.event_numbers().is_empty());
        assert_eq!(telemetry.crc_counts(Scope::Worker(0), 1), (0, 1));
    }

    #[test]
    fn test_link_open_failure() {
        let telemetry = Arc::new(Telemetry::new(2));
        let dispatcher = Dispatcher::spawn(settings(2), channels(), telemetry, |id| {
            if id == 1 {
                Err(SendError::Disconnected { sent: 0, total: 0 })
            } else {
                Ok(Sink::default())
            }
        })
        .unwrap();
        assert!(matches!(
            dispatcher.finish(),
            Err(DispatchError::WorkerFailed { worker: 1, .. })
        ));
    }

    #[test]
    fn test_drop_joins_workers() {
        let sinks: Vec<Sink> = (0..2).map(|_| Sink::default()).collect();
        let links = sinks.clone();
        let telemetry = Arc::new(Telemetry::new(2));
        let mut dispatcher = Dispatcher::spawn(settings(2), channels(), telemetry.clone(), move |id| {
            Ok(links[id].clone())
        })
        .unwrap();
        for number in 1..=3 {
            dispatcher.dispatch(&event(number)).unwrap();
        }
        assert_eq!(dispatcher.dispatched(), 3);
        drop(dispatcher);

        // Every handed-off event was drained before the workers were joined
        assert_eq!(sinks[0].event_numbers(), vec![1, 3]);
        assert_eq!(sinks[1].event_numbers(), vec![2]);
        assert_eq!(telemetry.events(Scope::Worker(0)), 2);
        assert_eq!(telemetry.events(Scope::Worker(1)), 1);
    }
}
