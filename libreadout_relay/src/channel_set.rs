use bitvec::prelude::*;

use super::constants::MAX_CHANNELS;

type ChannelMask = BitArray<[u64; 1], Lsb0>;

const VALID_MASK: u64 = (1u64 << MAX_CHANNELS) - 1;

/// The ordered set of channels expected in every event, derived from the
/// hardware channel mask registers.
///
/// Bit `n` of the mask enables channel `n`. Bits beyond the last channel are
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveChannelSet {
    mask: ChannelMask,
    channels: Vec<usize>,
}

impl ActiveChannelSet {
    pub fn from_mask(mask: u64) -> Self {
        if mask & !VALID_MASK != 0 {
            spdlog::warn!(
                "Channel mask {:#x} enables channels beyond {}; ignoring them",
                mask,
                MAX_CHANNELS - 1
            );
        }
        let mask = ChannelMask::new([mask & VALID_MASK]);
        let channels = mask.iter_ones().collect();
        Self { mask, channels }
    }

    pub fn from_channels(channels: &[usize]) -> Self {
        let mut mask = ChannelMask::ZERO;
        for channel in channels.iter().filter(|ch| **ch < MAX_CHANNELS) {
            mask.set(*channel, true);
        }
        Self {
            channels: mask.iter_ones().collect(),
            mask,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// The channel expected at position `index` within an event
    pub fn get(&self, index: usize) -> Option<usize> {
        self.channels.get(index).copied()
    }

    pub fn contains(&self, channel: usize) -> bool {
        channel < MAX_CHANNELS && self.mask[channel]
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.channels.iter().copied()
    }

    pub fn mask(&self) -> u64 {
        self.mask.data[0]
    }
}
