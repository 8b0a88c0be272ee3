use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::error::FragmentError;

/// One hardware-delivered DMA chunk. Owned by the ingest path until it is
/// released back to the source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFragment {
    pub bytes: Vec<u8>,
}

impl RawFragment {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    fn u32_at(&self, index: usize) -> Option<u32> {
        self.bytes
            .get(index * 4..index * 4 + 4)
            .map(LittleEndian::read_u32)
    }
}

/// The framing fields of a validated fragment.
///
/// `word_count` is in DMA words and already carries the trailer soft correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentFraming {
    pub word_count: u32,
    pub total_pages: u16,
    pub page_index: u16,
    pub soft_corrected: bool,
}

impl FragmentFraming {
    /// Byte range of the payload, with the DMA header and trailer stripped
    pub fn payload_range(&self) -> std::ops::Range<usize> {
        DMA_WORD_BYTES..(self.word_count as usize - 1) * DMA_WORD_BYTES
    }

    pub fn is_last_page(&self) -> bool {
        self.page_index + 1 == self.total_pages
    }
}

/// Check the DMA framing of a fragment.
///
/// Every failure is fatal except a trailer that sits one DMA word early, which is
/// corrected by shrinking the word count by one.
pub fn validate_fragment_framing(fragment: &RawFragment) -> Result<FragmentFraming, FragmentError> {
    if fragment.bytes.is_empty() {
        return Err(FragmentError::NoData);
    }
    if fragment.bytes.len() < DMA_WORD_BYTES {
        return Err(FragmentError::ShortHeader(fragment.bytes.len()));
    }

    let mut word_count = fragment.u32_at(DMA_POS_WORD_COUNT).unwrap_or(0);
    let magic_a = fragment.u32_at(DMA_POS_MAGIC_A).unwrap_or(0);
    let magic_b = fragment.u32_at(DMA_POS_MAGIC_B).unwrap_or(0);
    let size_const = fragment.u32_at(DMA_POS_SIZE_CONST).unwrap_or(0);
    if magic_a != DMA_HEADER_MAGIC_A
        || magic_b != DMA_HEADER_MAGIC_B
        || size_const != DMA_HEADER_SIZE_CONST
    {
        let error = FragmentError::BadHeader {
            magic_a,
            magic_b,
            size_const,
        };
        if cfg!(feature = "permissive") {
            spdlog::warn!("Ignoring in permissive mode: {error}");
        } else {
            return Err(error);
        }
    }

    if word_count >= DMA_MAX_WORD_COUNT {
        return Err(FragmentError::WordCountTooLarge(word_count));
    }

    let byte_size = fragment.u32_at(DMA_POS_BYTE_SIZE).unwrap_or(0);
    if byte_size != word_count * DMA_WORD_BYTES as u32 {
        return Err(FragmentError::BadWordSize {
            declared: byte_size,
            expected: word_count * DMA_WORD_BYTES as u32,
        });
    }

    // Need at least a header and a trailer
    if word_count < 2 {
        return Err(FragmentError::BadTrailer {
            word_count,
            trailer: None,
        });
    }

    let mut soft_corrected = false;
    let trailer = fragment.u32_at(word_count as usize * DMA_WORD_U32S - 1);
    if trailer != Some(word_count) {
        let preceding = fragment.u32_at((word_count as usize - 1) * DMA_WORD_U32S - 1);
        if word_count > 2 && preceding == Some(word_count) {
            spdlog::warn!(
                "DMA trailer found one word early; correcting word count {} -> {}",
                word_count,
                word_count - 1
            );
            word_count -= 1;
            soft_corrected = true;
        } else {
            return Err(FragmentError::BadTrailer {
                word_count,
                trailer,
            });
        }
    }

    let pages = fragment.u32_at(DMA_POS_PAGES).unwrap_or(0);
    let total_pages = ((pages >> 16) as u16).max(1);
    let page_index = (pages & 0xFFFF) as u16;

    Ok(FragmentFraming {
        word_count,
        total_pages,
        page_index,
        soft_corrected,
    })
}

/// Frame one page of payload. The payload is zero padded to a whole DMA word.
pub fn encode_fragment(payload: &[u8], total_pages: u16, page_index: u16) -> RawFragment {
    let payload_dma_words = payload.len().div_ceil(DMA_WORD_BYTES);
    let word_count = (payload_dma_words + 2) as u32;
    let mut bytes = vec![0u8; word_count as usize * DMA_WORD_BYTES];

    let mut header = [0u32; DMA_WORD_U32S];
    header[DMA_POS_WORD_COUNT] = word_count;
    header[DMA_POS_MAGIC_A] = DMA_HEADER_MAGIC_A;
    header[DMA_POS_BYTE_SIZE] = word_count * DMA_WORD_BYTES as u32;
    header[DMA_POS_SIZE_CONST] = DMA_HEADER_SIZE_CONST;
    header[DMA_POS_MAGIC_B] = DMA_HEADER_MAGIC_B;
    header[DMA_POS_PAGES] = ((total_pages as u32) << 16) | page_index as u32;
    LittleEndian::write_u32_into(&header, &mut bytes[..DMA_WORD_BYTES]);

    bytes[DMA_WORD_BYTES..DMA_WORD_BYTES + payload.len()].copy_from_slice(payload);

    let trailer_pos = bytes.len() - 4;
    LittleEndian::write_u32(&mut bytes[trailer_pos..], word_count);
    RawFragment::new(bytes)
}

/// Split an event into DMA pages of at most `max_payload_dma_words` payload each.
pub fn encode_fragments(event: &[u8], max_payload_dma_words: usize) -> Vec<RawFragment> {
    let page_bytes = max_payload_dma_words.max(1) * DMA_WORD_BYTES;
    let chunks: Vec<&[u8]> = if event.is_empty() {
        vec![event]
    } else {
        event.chunks(page_bytes).collect()
    };
    let total_pages = chunks.len() as u16;
    chunks
        .into_iter()
        .enumerate()
        .map(|(idx, chunk)| encode_fragment(chunk, total_pages, idx as u16))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n_dma_words: usize) -> Vec<u8> {
        (0..n_dma_words * DMA_WORD_BYTES).map(|b| b as u8).collect()
    }

    #[test]
    fn test_valid_fragment() {
        let fragment = encode_fragment(&payload(3), 1, 0);
        let framing = validate_fragment_framing(&fragment).unwrap();
        assert_eq!(framing.word_count, 5);
        assert_eq!(framing.total_pages, 1);
        assert_eq!(framing.page_index, 0);
        assert!(framing.is_last_page());
        assert!(!framing.soft_corrected);
        assert_eq!(&fragment.bytes[framing.payload_range()], &payload(3)[..]);
    }

    #[test]
    fn test_no_data() {
        assert_eq!(
            validate_fragment_framing(&RawFragment::default()),
            Err(FragmentError::NoData)
        );
    }

    #[test]
    fn test_short_header() {
        let fragment = RawFragment::new(vec![0xFF; DMA_WORD_BYTES - 4]);
        let error = validate_fragment_framing(&fragment).unwrap_err();
        assert_eq!(error, FragmentError::ShortHeader(DMA_WORD_BYTES - 4));
        assert_eq!(error.kind(), "bad_header");
    }

    #[cfg(not(feature = "permissive"))]
    #[test]
    fn test_bad_magic() {
        let mut fragment = encode_fragment(&payload(1), 1, 0);
        LittleEndian::write_u32(&mut fragment.bytes[DMA_POS_MAGIC_B * 4..], 0x1234_5678);
        assert!(matches!(
            validate_fragment_framing(&fragment),
            Err(FragmentError::BadHeader {
                magic_b: 0x1234_5678,
                ..
            })
        ));
    }

    #[test]
    fn test_word_count_ceiling() {
        let mut fragment = encode_fragment(&payload(1), 1, 0);
        LittleEndian::write_u32(&mut fragment.bytes[0..], DMA_MAX_WORD_COUNT);
        assert_eq!(
            validate_fragment_framing(&fragment),
            Err(FragmentError::WordCountTooLarge(DMA_MAX_WORD_COUNT))
        );
    }

    #[test]
    fn test_bad_byte_size() {
        let mut fragment = encode_fragment(&payload(2), 1, 0);
        LittleEndian::write_u32(&mut fragment.bytes[DMA_POS_BYTE_SIZE * 4..], 100);
        assert_eq!(
            validate_fragment_framing(&fragment),
            Err(FragmentError::BadWordSize {
                declared: 100,
                expected: 4 * DMA_WORD_BYTES as u32
            })
        );
    }

    #[test]
    fn test_trailer_soft_correction() {
        // Hardware declared one DMA word more than it delivered
        let mut fragment = encode_fragment(&payload(2), 1, 0);
        let declared = 5u32;
        LittleEndian::write_u32(&mut fragment.bytes[0..], declared);
        LittleEndian::write_u32(
            &mut fragment.bytes[DMA_POS_BYTE_SIZE * 4..],
            declared * DMA_WORD_BYTES as u32,
        );
        let last = fragment.bytes.len() - 4;
        LittleEndian::write_u32(&mut fragment.bytes[last..], declared);

        let framing = validate_fragment_framing(&fragment).unwrap();
        assert!(framing.soft_corrected);
        assert_eq!(framing.word_count, 4);
        assert_eq!(&fragment.bytes[framing.payload_range()], &payload(2)[..]);
    }

    #[test]
    fn test_bad_trailer() {
        let mut fragment = encode_fragment(&payload(2), 1, 0);
        let last = fragment.bytes.len() - 4;
        LittleEndian::write_u32(&mut fragment.bytes[last..], 77);
        assert_eq!(
            validate_fragment_framing(&fragment),
            Err(FragmentError::BadTrailer {
                word_count: 4,
                trailer: Some(77)
            })
        );
    }

    #[test]
    fn test_encode_pages() {
        let event = payload(5);
        let fragments = encode_fragments(&event, 2);
        assert_eq!(fragments.len(), 3);
        for (idx, fragment) in fragments.iter().enumerate() {
            let framing = validate_fragment_framing(fragment).unwrap();
            assert_eq!(framing.total_pages, 3);
            assert_eq!(framing.page_index as usize, idx);
        }
    }
}
