use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::crc::{crc16, reduced_seed};
use super::event::{channel_header_word, format_word, EventFormat};

const DIAGNOSTIC_TAG: u32 = 0xD1A6_0000;

/// Builder for well-formed events in either channel layout.
///
/// Used to generate replay files and by the tests. Individual defects (a bad
/// checksum) can be injected per channel.
#[derive(Debug, Clone)]
pub struct SyntheticEvent {
    pub event_number: u32,
    pub exp_run: u32,
    pub node_id: u32,
    pub ctime: u32,
    pub utime: u32,
    pub format: EventFormat,
    pub error_bits: u32,
    channels: BTreeMap<usize, Vec<u32>>,
    corrupt_crc: Vec<usize>,
}

impl SyntheticEvent {
    pub fn new(event_number: u32, exp_run: u32) -> Self {
        Self {
            event_number,
            exp_run,
            node_id: 0,
            ctime: 0x0100_0000 | event_number,
            utime: 0x6500_0000,
            format: EventFormat::Reduced,
            error_bits: 0,
            channels: BTreeMap::new(),
            corrupt_crc: Vec::new(),
        }
    }

    pub fn with_channel(mut self, channel: usize, payload: Vec<u32>) -> Self {
        self.channels.insert(channel, payload);
        self
    }

    pub fn with_node_id(mut self, node_id: u32) -> Self {
        self.node_id = node_id;
        self
    }

    /// Use the diagnostic layout and raise the header error bits, as the hardware
    /// does when it suspects a fault
    pub fn not_reduced(mut self) -> Self {
        self.format = EventFormat::NotReduced;
        self.error_bits = 0x1;
        self
    }

    pub fn with_corrupted_crc(mut self, channel: usize) -> Self {
        self.corrupt_crc.push(channel);
        self
    }

    fn channel_ctime(&self, channel: usize) -> u32 {
        self.ctime.wrapping_add(channel as u32)
    }

    fn checksum(&self, channel: usize, payload: &[u32]) -> u16 {
        let ctime = self.channel_ctime(channel);
        let crc = crc16(
            reduced_seed(self.event_number, ctime, self.utime, self.exp_run),
            payload,
        );
        if self.corrupt_crc.contains(&channel) {
            crc ^ 0x0001
        } else {
            crc
        }
    }

    fn push_block(&self, words: &mut Vec<u32>, channel: usize, payload: &[u32]) {
        let crc_word = CHANNEL_TRAILER_MAGIC | self.checksum(channel, payload) as u32;
        words.push(channel_header_word(channel, self.event_number));
        match self.format {
            EventFormat::Reduced => {
                words.push(self.channel_ctime(channel));
                words.push(self.utime);
                words.extend_from_slice(payload);
                words.push(crc_word);
            }
            EventFormat::NotReduced => {
                words.push(self.event_number);
                words.push(self.channel_ctime(channel));
                words.push(self.utime);
                words.push(self.exp_run);
                words.extend_from_slice(payload);
                words.push(crc_word);
                words.push(DIAGNOSTIC_TAG | channel as u32);
            }
        }
    }

    pub fn build_words(&self) -> Vec<u32> {
        let mut words = vec![0u32; EVENT_HEADER_WORDS];
        words[POS_FORMAT] = format_word(self.format);
        words[POS_EXP_RUN] = self.exp_run;
        words[POS_EVENT_NUMBER] = self.event_number;
        words[POS_TT_CTIME] = self.ctime;
        words[POS_TT_UTIME] = self.utime;
        words[POS_NODE_ID] = self.node_id;
        words[POS_ERROR_BITS] = self.error_bits;

        for channel in 0..MAX_CHANNELS {
            words[POS_OFFSET_TABLE + channel] = words.len() as u32;
            if let Some(payload) = self.channels.get(&channel) {
                self.push_block(&mut words, channel, payload);
            }
        }

        words.push(self.error_bits << 16);
        words.push(EVENT_TRAILER_MAGIC);
        words[POS_LENGTH] = words.len() as u32;
        words
    }

    pub fn build(&self) -> Vec<u8> {
        let words = self.build_words();
        let mut bytes = vec![0u8; words.len() * 4];
        LittleEndian::write_u32_into(&words, &mut bytes);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduced_length() {
        let words = SyntheticEvent::new(1, 0x100)
            .with_channel(2, vec![7; 5])
            .with_channel(0, vec![])
            .build_words();
        let expected = EVENT_HEADER_WORDS + (4 + 5) + 4 + EVENT_TRAILER_WORDS;
        assert_eq!(words.len(), expected);
        assert_eq!(words[POS_LENGTH] as usize, expected);
        assert_eq!(words[POS_OFFSET_TABLE], EVENT_HEADER_WORDS as u32);
        assert_eq!(words[POS_OFFSET_TABLE + 1], EVENT_HEADER_WORDS as u32 + 4);
        assert_eq!(words[POS_OFFSET_TABLE + 2], EVENT_HEADER_WORDS as u32 + 4);
        assert_eq!(words[POS_OFFSET_TABLE + 3], EVENT_HEADER_WORDS as u32 + 13);
    }

    #[test]
    fn test_not_reduced_length() {
        let words = SyntheticEvent::new(1, 0x100)
            .with_channel(4, vec![7; 5])
            .not_reduced()
            .build_words();
        assert_eq!(
            words.len(),
            EVENT_HEADER_WORDS + 7 + 5 + EVENT_TRAILER_WORDS
        );
        assert_ne!(words[POS_FORMAT] & FORMAT_NOT_REDUCED_BIT, 0);
    }
}
