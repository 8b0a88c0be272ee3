use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};

use super::constants::{DMA_MAX_WORD_COUNT, DMA_WORD_BYTES};
use super::error::SourceError;
use super::fragment::RawFragment;

/// Upstream supplier of DMA fragments.
///
/// Fragments are handed out one at a time and given back with `release` once
/// their payload has been consumed, so the source can recycle its buffers.
pub trait FragmentSource {
    /// Arm the transfer. Called once before the first `next_fragment`.
    fn start_transfer(&mut self) -> Result<(), SourceError>;

    /// The next ready fragment, or None once the source is exhausted
    fn next_fragment(&mut self) -> Result<Option<RawFragment>, SourceError>;

    /// Return a consumed fragment
    fn release(&mut self, fragment: RawFragment);

    /// Fraction of the source consumed, if the source knows its size
    fn progress(&self) -> Option<f32> {
        None
    }
}

/// Replays a raw DMA dump: fragments stored back to back, each exactly as long as
/// the word count in its own DMA header.
#[derive(Debug)]
pub struct DumpFileSource {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    total_bytes: u64,
    read_bytes: u64,
    spare: Vec<Vec<u8>>,
}

impl DumpFileSource {
    pub fn new(path: &Path) -> Result<Self, SourceError> {
        if !path.exists() {
            return Err(SourceError::BadFilePath(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            reader: None,
            total_bytes: path.metadata()?.len(),
            read_bytes: 0,
            spare: Vec::new(),
        })
    }
}

impl FragmentSource for DumpFileSource {
    fn start_transfer(&mut self) -> Result<(), SourceError> {
        self.reader = Some(BufReader::new(File::open(&self.path)?));
        self.read_bytes = 0;
        spdlog::info!(
            "Replaying DMA dump {:?} ({})",
            self.path,
            human_bytes::human_bytes(self.total_bytes as f64)
        );
        Ok(())
    }

    fn next_fragment(&mut self) -> Result<Option<RawFragment>, SourceError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        let word_count = match reader.read_u32::<LittleEndian>() {
            Ok(wc) => wc,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(SourceError::IOError(e)),
        };

        // A nonsense word count still gets one DMA word read so that framing
        // validation reports it.
        let n_bytes = if word_count == 0 || word_count >= DMA_MAX_WORD_COUNT {
            DMA_WORD_BYTES
        } else {
            word_count as usize * DMA_WORD_BYTES
        };

        let mut bytes = self.spare.pop().unwrap_or_default();
        bytes.clear();
        bytes.resize(n_bytes, 0);
        bytes[..4].copy_from_slice(&word_count.to_le_bytes());
        match reader.read_exact(&mut bytes[4..]) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(SourceError::Truncated),
            Err(e) => return Err(SourceError::IOError(e)),
        }
        self.read_bytes += n_bytes as u64;

        Ok(Some(RawFragment::new(bytes)))
    }

    fn release(&mut self, fragment: RawFragment) {
        self.spare.push(fragment.bytes);
    }

    fn progress(&self) -> Option<f32> {
        if self.total_bytes == 0 {
            return None;
        }
        Some(self.read_bytes as f32 / self.total_bytes as f32)
    }
}

/// In-memory fragment source.
#[derive(Debug, Default)]
pub struct MemorySource {
    fragments: VecDeque<RawFragment>,
    started: bool,
    handed_out: usize,
    released: usize,
}

impl MemorySource {
    pub fn new(fragments: Vec<RawFragment>) -> Self {
        Self {
            fragments: fragments.into(),
            ..Default::default()
        }
    }

    pub fn released(&self) -> usize {
        self.released
    }

    pub fn handed_out(&self) -> usize {
        self.handed_out
    }
}

impl FragmentSource for MemorySource {
    fn start_transfer(&mut self) -> Result<(), SourceError> {
        self.started = true;
        Ok(())
    }

    fn next_fragment(&mut self) -> Result<Option<RawFragment>, SourceError> {
        if !self.started {
            return Ok(None);
        }
        let fragment = self.fragments.pop_front();
        if fragment.is_some() {
            self.handed_out += 1;
        }
        Ok(fragment)
    }

    fn release(&mut self, _fragment: RawFragment) {
        self.released += 1;
    }

    fn progress(&self) -> Option<f32> {
        let total = self.handed_out + self.fragments.len();
        if total == 0 {
            return None;
        }
        Some(self.handed_out as f32 / total as f32)
    }
}

/// Write fragments back to back in the dump format read by `DumpFileSource`
pub fn write_dump<W: Write>(writer: &mut W, fragments: &[RawFragment]) -> Result<(), SourceError> {
    for fragment in fragments {
        writer.write_all(&fragment.bytes)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{encode_fragment, validate_fragment_framing};

    fn dump_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("readout_relay_{}_{}.dma", name, std::process::id()))
    }

    #[test]
    fn test_dump_replay() {
        let fragments = vec![
            encode_fragment(&[1; 40], 1, 0),
            encode_fragment(&[2; 64], 2, 0),
            encode_fragment(&[3; 8], 2, 1),
        ];
        let path = dump_path("replay");
        write_dump(&mut File::create(&path).unwrap(), &fragments).unwrap();

        let mut source = DumpFileSource::new(&path).unwrap();
        assert!(source.next_fragment().unwrap().is_none());
        source.start_transfer().unwrap();
        let mut replayed = Vec::new();
        while let Some(fragment) = source.next_fragment().unwrap() {
            validate_fragment_framing(&fragment).unwrap();
            replayed.push(fragment.clone());
            source.release(fragment);
        }
        assert_eq!(replayed, fragments);
        assert_eq!(source.progress(), Some(1.0));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_truncated_dump() {
        let fragment = encode_fragment(&[7; 64], 1, 0);
        let path = dump_path("truncated");
        std::fs::write(&path, &fragment.bytes[..fragment.bytes.len() - 10]).unwrap();

        let mut source = DumpFileSource::new(&path).unwrap();
        source.start_transfer().unwrap();
        assert!(matches!(source.next_fragment(), Err(SourceError::Truncated)));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_dump() {
        assert!(matches!(
            DumpFileSource::new(Path::new("/definitely/not/here.dma")),
            Err(SourceError::BadFilePath(_))
        ));
    }

    #[test]
    fn test_memory_source() {
        let mut source = MemorySource::new(vec![RawFragment::new(vec![1]), RawFragment::new(vec![2])]);
        assert_eq!(source.progress(), Some(0.0));
        source.start_transfer().unwrap();
        while let Some(fragment) = source.next_fragment().unwrap() {
            source.release(fragment);
        }
        assert_eq!(source.handed_out(), 2);
        assert_eq!(source.released(), 2);
        assert_eq!(source.progress(), Some(1.0));
    }
}
