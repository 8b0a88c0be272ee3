use super::constants::EVENT_MAX_WORDS;
use super::error::FragmentError;
use super::event::AssembledEvent;
use super::fragment::{validate_fragment_framing, RawFragment};

/// Largest event, in bytes, that may be accumulated from pages
const MAX_EVENT_BYTES: usize = EVENT_MAX_WORDS as usize * 4;

/// Reassembler takes RawFragments and composes them into AssembledEvents.
///
/// Single-page events are handed downstream directly. Multi-page events are
/// accumulated page by page, and the event is only emitted once the final page
/// has been appended.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    expected_total: u16,
    next_page: u16,
    soft_corrections: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment.
    ///
    /// Returns a `Result<Option<AssembledEvent>>`. If the Option is None, the event
    /// being built is not complete.
    pub fn push(&mut self, fragment: &RawFragment) -> Result<Option<AssembledEvent>, FragmentError> {
        let framing = validate_fragment_framing(fragment)?;
        if framing.soft_corrected {
            self.soft_corrections += 1;
        }
        let payload = &fragment.bytes[framing.payload_range()];

        if self.next_page == 0 && framing.total_pages == 1 && framing.page_index == 0 {
            return Ok(Some(AssembledEvent::new(payload.to_vec())));
        }

        let expected_total = if self.next_page == 0 {
            framing.total_pages
        } else {
            self.expected_total
        };
        if framing.page_index != self.next_page || framing.total_pages != expected_total {
            let error = FragmentError::PageOutOfOrder {
                page: framing.page_index,
                total: framing.total_pages,
                expected: self.next_page,
                expected_total,
            };
            self.reset();
            return Err(error);
        }

        if self.next_page == 0 {
            self.buffer.clear();
            self.expected_total = framing.total_pages;
        }
        let assembled = self.buffer.len() + payload.len();
        if assembled > MAX_EVENT_BYTES {
            self.reset();
            return Err(FragmentError::EventTooLarge(assembled));
        }
        self.buffer.extend_from_slice(payload);
        self.next_page += 1;

        if framing.is_last_page() {
            let event = AssembledEvent::new(std::mem::take(&mut self.buffer));
            self.reset();
            Ok(Some(event))
        } else {
            Ok(None)
        }
    }

    /// True if pages of an event have been received but not the final one
    pub fn is_mid_event(&self) -> bool {
        self.next_page != 0
    }

    pub fn soft_corrections(&self) -> u64 {
        self.soft_corrections
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.next_page = 0;
        self.expected_total = 0;
    }
}
