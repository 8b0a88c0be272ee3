use super::constants::*;
use super::error::ValidationError;
use super::event::{AssembledEvent, EventFormat, NOT_REDUCED_LAYOUT, REDUCED_LAYOUT};

/// Rewrite a not-reduced event into the canonical reduced layout.
///
/// Each channel block keeps its sub-header, timing words, payload and sub-trailer
/// (checksum included); the duplicated event tags and the diagnostic word are
/// dropped. The offset table, total length, format flag and error bits are
/// rewritten to match. Events that are already reduced are left untouched.
///
/// Only the structure needed to locate blocks is checked here. The result must be
/// validated again before it is forwarded.
pub fn reduce_event(event: &mut AssembledEvent) -> Result<(), ValidationError> {
    let view = event.view();
    let format_word = view.format_word()?;
    if EventFormat::from_format_word(format_word) == EventFormat::Reduced {
        return Ok(());
    }

    let length = view.length()? as usize;
    if length < EVENT_HEADER_WORDS + EVENT_TRAILER_WORDS || length > view.n_words() {
        return Err(ValidationError::BadLength(length as u32));
    }
    let trailer_start = length - EVENT_TRAILER_WORDS;

    let mut words: Vec<u32> = Vec::with_capacity(length);
    for idx in 0..EVENT_HEADER_WORDS {
        words.push(view.word(idx)?);
    }

    let from = NOT_REDUCED_LAYOUT;
    for channel in 0..MAX_CHANNELS {
        let (offset, size) = view.channel_span(channel, trailer_start)?;
        words[POS_OFFSET_TABLE + channel] = words.len() as u32;
        if size == 0 {
            continue;
        }
        if size < from.min_words() {
            return Err(ValidationError::BlockTooSmall { channel, size });
        }
        let end = offset + size;
        if end > trailer_start {
            return Err(ValidationError::ChannelOverrun {
                channel,
                end,
                trailer_start,
            });
        }

        words.push(view.word(offset)?);
        words.push(view.word(offset + from.ctime_pos)?);
        words.push(view.word(offset + from.utime_pos)?);
        for idx in (offset + from.header_words)..(end - from.trailer_words) {
            words.push(view.word(idx)?);
        }
        words.push(view.word(end - from.trailer_back)?);
    }

    words.push(view.word(trailer_start)? & !TRAILER_ERROR_MASK);
    words.push(view.word(trailer_start + 1)?);

    words[POS_LENGTH] = words.len() as u32;
    words[POS_FORMAT] = format_word & !FORMAT_NOT_REDUCED_BIT;
    words[POS_ERROR_BITS] = 0;

    spdlog::debug!(
        "Reduced event {} from {} to {} words",
        words[POS_EVENT_NUMBER],
        length,
        words.len()
    );
    event.replace_words(&words);
    Ok(())
}

/// Words dropped from one channel block by reduction
pub const fn words_dropped_per_channel() -> usize {
    NOT_REDUCED_LAYOUT.min_words() - REDUCED_LAYOUT.min_words()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_set::ActiveChannelSet;
    use crate::event::EventView;
    use crate::synthetic::SyntheticEvent;
    use crate::telemetry::{Scope, Telemetry};
    use crate::validator::{ValidationOutcome, Validator};
    use std::sync::Arc;

    const EXP_RUN: u32 = 0x0040_0200;

    fn payloads() -> Vec<(usize, Vec<u32>)> {
        vec![
            (1, (0..11).map(|x| x * 0x0101_0101).collect()),
            (4, vec![]),
            (47, vec![0xFFFF_FFFF, 0, 0x8000_0001]),
        ]
    }

    fn build(event_number: u32) -> SyntheticEvent {
        payloads()
            .into_iter()
            .fold(SyntheticEvent::new(event_number, EXP_RUN), |ev, (ch, payload)| {
                ev.with_channel(ch, payload)
            })
    }

    fn validator() -> Validator {
        Validator::new(
            Arc::new(ActiveChannelSet::from_channels(&[1, 4, 47])),
            Arc::new(Telemetry::new(1)),
            Scope::Ingest,
            1,
        )
    }

    fn channel_payload(view: &EventView, channel: usize) -> Vec<u32> {
        let length = view.length().unwrap() as usize;
        let (offset, size) = view
            .channel_span(channel, length - EVENT_TRAILER_WORDS)
            .unwrap();
        (offset + REDUCED_LAYOUT.header_words..offset + size - REDUCED_LAYOUT.trailer_words)
            .map(|idx| view.word(idx).unwrap())
            .collect()
    }

    #[test]
    fn test_round_trip() {
        let mut validator = validator();
        let mut event = AssembledEvent::new(build(7).not_reduced().build());
        assert_eq!(
            validator.validate(event.as_bytes()),
            ValidationOutcome::Recoverable(None)
        );

        reduce_event(&mut event).unwrap();
        assert_eq!(validator.validate(event.as_bytes()), ValidationOutcome::Ok);

        let view = event.view();
        for (channel, payload) in payloads() {
            assert_eq!(channel_payload(&view, channel), payload);
        }
        assert_eq!(view.error_bits().unwrap(), 0);
    }

    #[test]
    fn test_matches_native_reduced_event() {
        let mut event = AssembledEvent::new(build(7).not_reduced().build());
        reduce_event(&mut event).unwrap();
        assert_eq!(event.as_bytes(), &build(7).build()[..]);
    }

    #[test]
    fn test_length_shrinks() {
        let original = build(3).not_reduced().build_words();
        let mut event = AssembledEvent::new(build(3).not_reduced().build());
        reduce_event(&mut event).unwrap();
        assert_eq!(
            event.view().length().unwrap() as usize,
            original.len() - 3 * words_dropped_per_channel()
        );
    }

    #[test]
    fn test_reduced_is_untouched() {
        let bytes = build(3).build();
        let mut event = AssembledEvent::new(bytes.clone());
        reduce_event(&mut event).unwrap();
        assert_eq!(event.as_bytes(), &bytes[..]);
    }

    #[test]
    fn test_crc_failure_survives_reduction() {
        let mut validator = validator();
        let mut event = AssembledEvent::new(build(7).with_corrupted_crc(4).not_reduced().build());
        assert!(matches!(
            validator.validate(event.as_bytes()),
            ValidationOutcome::Recoverable(Some(ValidationError::CrcMismatch { channel: 4, .. }))
        ));
        reduce_event(&mut event).unwrap();
        assert!(matches!(
            validator.validate(event.as_bytes()),
            ValidationOutcome::Fatal(ValidationError::CrcMismatch { channel: 4, .. })
        ));
    }

    #[test]
    fn test_block_too_small() {
        // A reduced-size block in an event flagged not-reduced
        let mut words = build(3).build_words();
        words[POS_FORMAT] |= FORMAT_NOT_REDUCED_BIT;
        let mut event = AssembledEvent::default();
        event.replace_words(&words);
        assert_eq!(
            reduce_event(&mut event),
            Err(ValidationError::BlockTooSmall {
                channel: 4,
                size: REDUCED_LAYOUT.min_words()
            })
        );
    }
}
