// DMA framing
pub const DMA_WORD_BYTES: usize = 32;
pub const DMA_WORD_U32S: usize = DMA_WORD_BYTES / 4;
pub const DMA_HEADER_MAGIC_A: u32 = 0xEEEE_EEEE;
pub const DMA_HEADER_MAGIC_B: u32 = 0xAAAA_5555;
pub const DMA_HEADER_SIZE_CONST: u32 = DMA_WORD_BYTES as u32;
/// Hard ceiling on the declared word count of a single fragment
pub const DMA_MAX_WORD_COUNT: u32 = 0x8000;

pub const DMA_POS_WORD_COUNT: usize = 0;
pub const DMA_POS_MAGIC_A: usize = 1;
pub const DMA_POS_BYTE_SIZE: usize = 2;
pub const DMA_POS_SIZE_CONST: usize = 3;
pub const DMA_POS_MAGIC_B: usize = 4;
pub const DMA_POS_PAGES: usize = 5;

// Event header
pub const MAX_CHANNELS: usize = 48;
pub const EVENT_HEADER_FIXED_WORDS: usize = 8;
pub const EVENT_HEADER_WORDS: usize = EVENT_HEADER_FIXED_WORDS + MAX_CHANNELS;
pub const EVENT_TRAILER_WORDS: usize = 2;
pub const EVENT_MAX_WORDS: u32 = 0x10_0000;

pub const POS_LENGTH: usize = 0;
pub const POS_FORMAT: usize = 1;
pub const POS_EXP_RUN: usize = 2;
pub const POS_EVENT_NUMBER: usize = 3;
pub const POS_TT_CTIME: usize = 4;
pub const POS_TT_UTIME: usize = 5;
pub const POS_NODE_ID: usize = 6;
pub const POS_ERROR_BITS: usize = 7;
pub const POS_OFFSET_TABLE: usize = EVENT_HEADER_FIXED_WORDS;

pub const EVENT_MAGIC: u32 = 0x7F7F_0000;
pub const MAGIC_MASK: u32 = 0xFFFF_0000;
/// Set by the hardware when the event still carries the diagnostic channel layout
pub const FORMAT_NOT_REDUCED_BIT: u32 = 0x0000_8000;
pub const FORMAT_VERSION: u32 = 0x04;

pub const EVENT_TRAILER_MAGIC: u32 = 0x7FFF_0006;
pub const TRAILER_ERROR_MASK: u32 = 0xFFFF_0000;

// Channel blocks
pub const CHANNEL_HEADER_MAGIC: u32 = 0xFFAA_0000;
pub const CHANNEL_TRAILER_MAGIC: u32 = 0xFF55_0000;

// CRC
pub const CRC16_POLY: u16 = 0x1021;
pub const CRC16_INITIAL: u16 = 0xFFFF;

// Outbound send frame
pub const SEND_HEADER_WORDS: usize = 6;
pub const SEND_TRAILER_WORDS: usize = 2;
pub const SEND_PROTOCOL_TAG: u32 = 0x0000_0006;
pub const SEND_TRAILER_MAGIC: u32 = 0x7FFF_0007;

// Worker pool
pub const DEFAULT_N_WORKERS: usize = 5;
pub const SLOTS_PER_WORKER: usize = 2;
/// Initial capacity of a worker slot in bytes; slots grow for larger events
pub const DEFAULT_SLOT_CAPACITY: usize = 64 * 1024;
