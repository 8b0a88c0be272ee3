use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::error::ValidationError;

/// The two channel-block layouts an event can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFormat {
    Reduced,
    NotReduced,
}

impl EventFormat {
    pub fn from_format_word(word: u32) -> Self {
        if word & FORMAT_NOT_REDUCED_BIT != 0 {
            Self::NotReduced
        } else {
            Self::Reduced
        }
    }

    pub fn layout(&self) -> &'static BlockLayout {
        match self {
            Self::Reduced => &REDUCED_LAYOUT,
            Self::NotReduced => &NOT_REDUCED_LAYOUT,
        }
    }
}

/// Word positions within a channel block for one format.
///
/// Positions are relative to the start of the block. `trailer_back` is the
/// distance of the sub-trailer word from the end of the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub header_words: usize,
    pub trailer_words: usize,
    pub ctime_pos: usize,
    pub utime_pos: usize,
    pub crc_start: usize,
    pub trailer_back: usize,
    pub non_crc_words: usize,
}

impl BlockLayout {
    pub const fn min_words(&self) -> usize {
        self.header_words + self.trailer_words
    }
}

/// `[subhdr, ctime, utime, payload..., subtrl]`
pub const REDUCED_LAYOUT: BlockLayout = BlockLayout {
    header_words: 3,
    trailer_words: 1,
    ctime_pos: 1,
    utime_pos: 2,
    crc_start: 3,
    trailer_back: 1,
    non_crc_words: 4,
};

/// `[subhdr, event number, ctime, utime, exp/run, payload..., subtrl, diagnostic]`
pub const NOT_REDUCED_LAYOUT: BlockLayout = BlockLayout {
    header_words: 5,
    trailer_words: 2,
    ctime_pos: 2,
    utime_pos: 3,
    crc_start: 1,
    trailer_back: 2,
    non_crc_words: 3,
};

/// Copies of the header event number and exp/run carried by each not-reduced block
pub const NOT_REDUCED_EVENT_NUMBER_POS: usize = 1;
pub const NOT_REDUCED_EXP_RUN_POS: usize = 4;

pub fn channel_header_word(channel: usize, event_number: u32) -> u32 {
    CHANNEL_HEADER_MAGIC | ((channel as u32 & 0xFF) << 8) | (event_number & 0xFF)
}

pub fn format_word(format: EventFormat) -> u32 {
    let flag = match format {
        EventFormat::Reduced => 0,
        EventFormat::NotReduced => FORMAT_NOT_REDUCED_BIT,
    };
    EVENT_MAGIC | flag | (FORMAT_VERSION << 8) | EVENT_HEADER_WORDS as u32
}

/// Bounds-checked, read-only view of an event buffer.
///
/// Every accessor returns `ValidationError::OutOfBounds` rather than reading past
/// the end of the buffer.
#[derive(Debug, Clone, Copy)]
pub struct EventView<'a> {
    bytes: &'a [u8],
}

impl<'a> EventView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn n_words(&self) -> usize {
        self.bytes.len() / 4
    }

    pub fn n_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn word(&self, index: usize) -> Result<u32, ValidationError> {
        let start = index
            .checked_mul(4)
            .filter(|start| start.checked_add(4).is_some())
            .ok_or(ValidationError::OutOfBounds(index))?;
        self.bytes
            .get(start..start + 4)
            .map(LittleEndian::read_u32)
            .ok_or(ValidationError::OutOfBounds(index))
    }

    /// A run of `count` words starting at `start`, as raw bytes
    pub fn word_bytes(&self, start: usize, count: usize) -> Result<&'a [u8], ValidationError> {
        let end = start + count;
        self.bytes
            .get(start * 4..end * 4)
            .ok_or(ValidationError::OutOfBounds(end))
    }

    pub fn length(&self) -> Result<u32, ValidationError> {
        self.word(POS_LENGTH)
    }

    pub fn format_word(&self) -> Result<u32, ValidationError> {
        self.word(POS_FORMAT)
    }

    pub fn exp_run(&self) -> Result<u32, ValidationError> {
        self.word(POS_EXP_RUN)
    }

    pub fn event_number(&self) -> Result<u32, ValidationError> {
        self.word(POS_EVENT_NUMBER)
    }

    pub fn error_bits(&self) -> Result<u32, ValidationError> {
        self.word(POS_ERROR_BITS)
    }

    pub fn channel_offset(&self, channel: usize) -> Result<u32, ValidationError> {
        self.word(POS_OFFSET_TABLE + channel)
    }

    /// Offset and size, in words, of a channel's block. A size of zero means the
    /// channel is absent.
    pub fn channel_span(
        &self,
        channel: usize,
        trailer_start: usize,
    ) -> Result<(usize, usize), ValidationError> {
        let offset = self.channel_offset(channel)? as usize;
        let end = if channel + 1 < MAX_CHANNELS {
            self.channel_offset(channel + 1)? as usize
        } else {
            trailer_start
        };
        let size = end
            .checked_sub(offset)
            .ok_or(ValidationError::NonMonotonicOffset(channel))?;
        Ok((offset, size))
    }
}

/// One logical trigger's data, stitched together from one or more fragments.
///
/// The buffer may carry DMA padding past the declared length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledEvent {
    bytes: Vec<u8>,
}

impl AssembledEvent {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn view(&self) -> EventView<'_> {
        EventView::new(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The bytes covered by the declared length, or the whole buffer if the
    /// length is unreadable or larger than the buffer
    pub fn payload(&self) -> &[u8] {
        match self.view().length() {
            Ok(len) if (len as usize) * 4 <= self.bytes.len() => &self.bytes[..len as usize * 4],
            _ => &self.bytes,
        }
    }

    /// Replace the contents with a new word sequence, reusing the allocation
    pub fn replace_words(&mut self, words: &[u32]) {
        self.bytes.resize(words.len() * 4, 0);
        LittleEndian::write_u32_into(words, &mut self.bytes);
    }
}
