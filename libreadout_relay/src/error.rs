use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;
use super::ingest_status::IngestStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    #[error("DMA fragment contained no data")]
    NoData,
    #[error("DMA fragment of {0} bytes is too short to hold its header")]
    ShortHeader(usize),
    #[error("Bad DMA header -- magic A: {magic_a:#010x} magic B: {magic_b:#010x} size constant: {size_const:#x}")]
    BadHeader {
        magic_a: u32,
        magic_b: u32,
        size_const: u32,
    },
    #[error("DMA word count {0} exceeds the ceiling of {max}", max=DMA_MAX_WORD_COUNT)]
    WordCountTooLarge(u32),
    #[error("DMA byte size {declared} does not match word count; expected {expected}")]
    BadWordSize { declared: u32, expected: u32 },
    #[error("DMA trailer {trailer:?} does not match word count {word_count}")]
    BadTrailer {
        word_count: u32,
        trailer: Option<u32>,
    },
    #[error("Multi-page event grew to {0} bytes, past the event size limit")]
    EventTooLarge(usize),
    #[error("DMA page {page} of {total} arrived out of order; expected page {expected} of {expected_total}")]
    PageOutOfOrder {
        page: u16,
        total: u16,
        expected: u16,
        expected_total: u16,
    },
}

impl FragmentError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoData => "no_data",
            Self::BadHeader { .. } | Self::ShortHeader(_) => "bad_header",
            Self::WordCountTooLarge(_) | Self::BadTrailer { .. } | Self::EventTooLarge(_) => {
                "bad_size"
            }
            Self::BadWordSize { .. } => "bad_word_size",
            Self::PageOutOfOrder { .. } => "page_order",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Event length {0} is outside (0, {max}]", max=EVENT_MAX_WORDS)]
    BadLength(u32),
    #[error("Event declares {declared} bytes but only {available} were assembled")]
    Truncated { declared: usize, available: usize },
    #[error("Word {0} lies outside of the event buffer")]
    OutOfBounds(usize),
    #[error("Bad event magic in format word {0:#010x}")]
    BadMagic(u32),
    #[error("Event number jumped -- expected {expected} found {found}")]
    EventNumberJump { expected: u32, found: u32 },
    #[error("Channel offset table is not monotonic at channel {0}")]
    NonMonotonicOffset(usize),
    #[error("Found channel {found} where channel {expected:?} was expected by the channel mask")]
    UnexpectedChannel {
        found: usize,
        expected: Option<usize>,
    },
    #[error("Channel {channel} starts at word {offset} but the previous block ended at word {cursor}")]
    ChannelGap {
        channel: usize,
        offset: usize,
        cursor: usize,
    },
    #[error("Channel {channel} block of {size} words is smaller than its framing")]
    BlockTooSmall { channel: usize, size: usize },
    #[error("Bad sub-header magic {word:#010x} in channel {channel}")]
    BadChannelMagic { channel: usize, word: u32 },
    #[error("Channel {channel} carries event tag {found:#04x}; header event tag is {expected:#04x}")]
    EventTagMismatch {
        channel: usize,
        found: u8,
        expected: u8,
    },
    #[error("Channel {channel} carries channel tag {found}")]
    ChannelTagMismatch { channel: usize, found: u8 },
    #[error("Channel {channel} embeds {found:#010x} where the header carries {expected:#010x}")]
    EmbeddedHeaderMismatch {
        channel: usize,
        found: u32,
        expected: u32,
    },
    #[error("Channel {channel} ends at word {end}, past the trailer start {trailer_start}")]
    ChannelOverrun {
        channel: usize,
        end: usize,
        trailer_start: usize,
    },
    #[error("Bad sub-trailer magic {word:#010x} in channel {channel}")]
    BadChannelTrailer { channel: usize, word: u32 },
    #[error("CRC mismatch in channel {channel} -- computed {computed:#06x} embedded {embedded:#06x}")]
    CrcMismatch {
        channel: usize,
        computed: u16,
        embedded: u16,
    },
    #[error("Channel blocks end at word {cursor}; trailer expected at word {expected}")]
    TrailerPosition { cursor: usize, expected: usize },
    #[error("Bad event trailer magic {0:#010x}")]
    BadTrailerMagic(u32),
    #[error("Observed {observed} channels; the channel mask expects {expected}")]
    ChannelCount { observed: usize, expected: usize },
    #[error("Event is still flagged not-reduced after reduction")]
    StillUnreduced,
}

impl ValidationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadLength(_) | Self::Truncated { .. } | Self::OutOfBounds(_) => "length",
            Self::BadMagic(_) => "magic",
            Self::EventNumberJump { .. } => "event_number",
            Self::NonMonotonicOffset(_)
            | Self::UnexpectedChannel { .. }
            | Self::ChannelGap { .. }
            | Self::ChannelCount { .. } => "channel_order",
            Self::BlockTooSmall { .. } | Self::ChannelOverrun { .. } => "channel_size",
            Self::BadChannelMagic { .. } | Self::BadChannelTrailer { .. } => "channel_magic",
            Self::EventTagMismatch { .. }
            | Self::ChannelTagMismatch { .. }
            | Self::EmbeddedHeaderMismatch { .. } => "channel_tag",
            Self::CrcMismatch { .. } => "crc",
            Self::TrailerPosition { .. } | Self::BadTrailerMagic(_) => "trailer",
            Self::StillUnreduced => "unreduced",
        }
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Could not connect to downstream {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("Downstream closed the connection after {sent} of {total} bytes")]
    Disconnected { sent: usize, total: usize },
    #[error("Wrote {sent} bytes for a {total} byte frame")]
    Oversend { sent: usize, total: usize },
    #[error("Send failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

impl SendError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnected { .. } => "disconnect",
            Self::Oversend { .. } => "oversend",
            Self::IOError(_) => "send_io",
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Could not open fragment source because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Fragment source ended in the middle of a fragment")]
    Truncated,
    #[error("Fragment source failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config requested {0} workers; at least one is required")]
    InvalidWorkers(usize),
    #[error("Config channel mask selects no channels")]
    EmptyChannelMask,
    #[error("Config event stride must be non-zero")]
    ZeroStride,
    #[error("This build has CRC checking disabled and will not start")]
    CrcCheckDisabled,
    #[error("This build is permissive about framing magic; set permissive_acknowledged to start it")]
    PermissiveNotAcknowledged,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker re-validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("Worker received an event that was never reduced")]
    Unreduced,
    #[error("Worker send failed: {0}")]
    Send(#[from] SendError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Worker {worker} failed: {source}")]
    WorkerFailed { worker: usize, source: WorkerError },
    #[error("Worker {0} panicked")]
    WorkerPanicked(usize),
    #[error("Worker {0} exited without reporting an error")]
    WorkerGone(usize),
    #[error("Could not spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to fragment source error: {0}")]
    SourceError(#[from] SourceError),
    #[error("Processor failed due to fragment framing error: {0}")]
    FragmentError(#[from] FragmentError),
    #[error("Processor failed due to validation error: {0}")]
    ValidationError(#[from] ValidationError),
    #[error("Processor failed due to Dispatch error: {0}")]
    DispatchError(#[from] DispatchError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<IngestStatus>),
    #[error("Processor failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}
