use std::sync::Arc;

use super::channel_set::ActiveChannelSet;
use super::constants::*;
use super::crc::{crc16_le_bytes, reduced_seed};
use super::error::ValidationError;
use super::event::{
    EventFormat, EventView, NOT_REDUCED_EVENT_NUMBER_POS, NOT_REDUCED_EXP_RUN_POS,
};
use super::telemetry::{Scope, Telemetry};

/// Continuity state carried from one event to the next.
///
/// `last_event` is cleared on a run change, so the first event of a run is never
/// checked against its predecessor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunState {
    pub run: u32,
    pub last_event: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Canonical and intact; ready to forward
    Ok,
    /// Flagged not-reduced by the hardware. Must go through the reducer once.
    /// Carries the first structural failure seen, if any.
    Recoverable(Option<ValidationError>),
    Fatal(ValidationError),
}

impl ValidationOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[derive(Debug, Clone, Copy)]
struct HeaderFields {
    length: usize,
    exp_run: u32,
    event_number: u32,
}

/// Structural and CRC validation of assembled events.
///
/// Each thread that validates owns its own Validator (and so its own RunState);
/// the channel set and telemetry are shared.
#[derive(Debug)]
pub struct Validator {
    channels: Arc<ActiveChannelSet>,
    telemetry: Arc<Telemetry>,
    scope: Scope,
    stride: u32,
    state: RunState,
}

impl Validator {
    /// `stride` is the expected event number increment between two events seen
    /// by this validator.
    pub fn new(
        channels: Arc<ActiveChannelSet>,
        telemetry: Arc<Telemetry>,
        scope: Scope,
        stride: u32,
    ) -> Self {
        Self {
            channels,
            telemetry,
            scope,
            stride,
            state: RunState::default(),
        }
    }

    pub fn run_state(&self) -> RunState {
        self.state
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Validate one event. Failures are logged and counted here.
    pub fn validate(&mut self, bytes: &[u8]) -> ValidationOutcome {
        let view = EventView::new(bytes);
        match self.check(&view) {
            Ok(ValidationOutcome::Recoverable(Some(reason))) => {
                spdlog::warn!(
                    "{}: not-reduced event {} failed a structural check: {}",
                    self.scope,
                    view.event_number().unwrap_or(0),
                    reason
                );
                self.telemetry.record_failure(self.scope, reason.kind());
                ValidationOutcome::Recoverable(Some(reason))
            }
            Ok(outcome) => outcome,
            Err(e) => {
                spdlog::error!(
                    "{}: event {} rejected: {}",
                    self.scope,
                    view.event_number().unwrap_or(0),
                    e
                );
                self.telemetry.record_failure(self.scope, e.kind());
                ValidationOutcome::Fatal(e)
            }
        }
    }

    fn check(&mut self, view: &EventView) -> Result<ValidationOutcome, ValidationError> {
        let length = view.length()?;
        if length == 0
            || length > EVENT_MAX_WORDS
            || (length as usize) < EVENT_HEADER_WORDS + EVENT_TRAILER_WORDS
        {
            return Err(ValidationError::BadLength(length));
        }
        let length = length as usize;
        if length * 4 > view.n_bytes() {
            return Err(ValidationError::Truncated {
                declared: length * 4,
                available: view.n_bytes(),
            });
        }

        let format_word = view.format_word()?;
        if format_word & MAGIC_MASK != EVENT_MAGIC {
            if cfg!(feature = "permissive") {
                spdlog::warn!(
                    "{}: ignoring bad event magic {:#010x} in permissive mode",
                    self.scope,
                    format_word
                );
            } else {
                return Err(ValidationError::BadMagic(format_word));
            }
        }
        let format = EventFormat::from_format_word(format_word);

        let exp_run = view.exp_run()?;
        let run = exp_run >> 8;
        let event_number = view.event_number()?;

        if let Some(last) = self.state.last_event {
            if self.state.run == run && run != 0 {
                let expected = last.wrapping_add(self.stride);
                if expected != event_number {
                    return Err(ValidationError::EventNumberJump {
                        expected,
                        found: event_number,
                    });
                }
            }
        }

        if run != self.state.run {
            if self.state.run != 0 {
                spdlog::info!(
                    "{}: run changed {:#x} -> {:#x}",
                    self.scope,
                    self.state.run,
                    run
                );
            }
            self.state = RunState {
                run,
                last_event: None,
            };
            self.telemetry.reset_for_run(self.scope, run);
        }

        let header = HeaderFields {
            length,
            exp_run,
            event_number,
        };
        match (self.check_channels(view, header, format), format) {
            (Ok(()), EventFormat::Reduced) => {
                self.state.last_event = Some(event_number);
                Ok(ValidationOutcome::Ok)
            }
            (Ok(()), EventFormat::NotReduced) => Ok(ValidationOutcome::Recoverable(None)),
            (Err(e), EventFormat::NotReduced) => Ok(ValidationOutcome::Recoverable(Some(e))),
            (Err(e), EventFormat::Reduced) => Err(e),
        }
    }

    fn check_channels(
        &self,
        view: &EventView,
        header: HeaderFields,
        format: EventFormat,
    ) -> Result<(), ValidationError> {
        let layout = format.layout();
        let trailer_start = header.length - EVENT_TRAILER_WORDS;
        let mut cursor = EVENT_HEADER_WORDS;
        let mut observed = 0;

        for channel in 0..MAX_CHANNELS {
            let (offset, size) = view.channel_span(channel, trailer_start)?;
            if size == 0 {
                continue;
            }

            let expected = self.channels.get(observed);
            if expected != Some(channel) {
                return Err(ValidationError::UnexpectedChannel {
                    found: channel,
                    expected,
                });
            }
            if offset != cursor {
                return Err(ValidationError::ChannelGap {
                    channel,
                    offset,
                    cursor,
                });
            }
            if size < layout.min_words() {
                return Err(ValidationError::BlockTooSmall { channel, size });
            }

            let subheader = view.word(offset)?;
            if subheader & MAGIC_MASK != CHANNEL_HEADER_MAGIC {
                return Err(ValidationError::BadChannelMagic {
                    channel,
                    word: subheader,
                });
            }
            let event_tag = (subheader & 0xFF) as u8;
            if event_tag != header.event_number as u8 {
                return Err(ValidationError::EventTagMismatch {
                    channel,
                    found: event_tag,
                    expected: header.event_number as u8,
                });
            }
            let channel_tag = ((subheader >> 8) & 0xFF) as u8;
            if channel_tag as usize != channel {
                return Err(ValidationError::ChannelTagMismatch {
                    channel,
                    found: channel_tag,
                });
            }

            if format == EventFormat::NotReduced {
                for (pos, expected) in [
                    (NOT_REDUCED_EVENT_NUMBER_POS, header.event_number),
                    (NOT_REDUCED_EXP_RUN_POS, header.exp_run),
                ] {
                    let found = view.word(offset + pos)?;
                    if found != expected {
                        return Err(ValidationError::EmbeddedHeaderMismatch {
                            channel,
                            found,
                            expected,
                        });
                    }
                }
            }

            let end = offset + size;
            if end > trailer_start {
                return Err(ValidationError::ChannelOverrun {
                    channel,
                    end,
                    trailer_start,
                });
            }

            let subtrailer = view.word(end - layout.trailer_back)?;
            if subtrailer & MAGIC_MASK != CHANNEL_TRAILER_MAGIC {
                return Err(ValidationError::BadChannelTrailer {
                    channel,
                    word: subtrailer,
                });
            }

            let seed = match format {
                EventFormat::Reduced => reduced_seed(
                    header.event_number,
                    view.word(offset + layout.ctime_pos)?,
                    view.word(offset + layout.utime_pos)?,
                    header.exp_run,
                ),
                EventFormat::NotReduced => CRC16_INITIAL,
            };
            let computed = crc16_le_bytes(
                seed,
                view.word_bytes(offset + layout.crc_start, size - layout.non_crc_words)?,
            );
            let embedded = (subtrailer & 0xFFFF) as u16;
            if format == EventFormat::Reduced {
                self.telemetry
                    .record_crc(self.scope, channel, computed == embedded);
            }
            if computed != embedded {
                return Err(ValidationError::CrcMismatch {
                    channel,
                    computed,
                    embedded,
                });
            }

            cursor = end;
            observed += 1;
        }

        if cursor != trailer_start {
            return Err(ValidationError::TrailerPosition {
                cursor,
                expected: trailer_start,
            });
        }
        let trailer_magic = view.word(trailer_start + 1)?;
        if trailer_magic != EVENT_TRAILER_MAGIC {
            return Err(ValidationError::BadTrailerMagic(trailer_magic));
        }
        if observed != self.channels.len() {
            return Err(ValidationError::ChannelCount {
                observed,
                expected: self.channels.len(),
            });
        }
        Ok(())
    }
}
