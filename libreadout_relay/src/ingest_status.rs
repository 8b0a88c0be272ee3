/// Progress message sent from the ingest loop to whoever is watching it.
#[derive(Debug, Clone, Default)]
pub struct IngestStatus {
    pub progress: f32,
    pub run_number: u32,
    pub events: u64,
}

impl IngestStatus {
    pub fn new(progress: f32, run_number: u32, events: u64) -> Self {
        Self {
            progress,
            run_number,
            events,
        }
    }
}
