use byteorder::{ByteOrder, LittleEndian};

use super::constants::{CRC16_INITIAL, CRC16_POLY};

const fn make_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut idx = 0;
    while idx < 256 {
        let mut crc = (idx as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[idx] = crc;
        idx += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = make_table();

#[inline]
fn update(crc: u16, byte: u8) -> u16 {
    (crc << 8) ^ CRC16_TABLE[(((crc >> 8) as u8) ^ byte) as usize]
}

#[inline]
fn update_word(crc: u16, word: u32) -> u16 {
    // Most significant byte first
    let crc = update(crc, (word >> 24) as u8);
    let crc = update(crc, (word >> 16) as u8);
    let crc = update(crc, (word >> 8) as u8);
    update(crc, word as u8)
}

/// Compute the 16-bit channel checksum over a run of words, starting from `seed`.
pub fn crc16(seed: u16, words: &[u32]) -> u16 {
    words.iter().fold(seed, |crc, word| update_word(crc, *word))
}

/// Same as [crc16], but over a little-endian byte slice of whole words.
///
/// Trailing bytes that do not make a whole word are ignored.
pub fn crc16_le_bytes(seed: u16, bytes: &[u8]) -> u16 {
    bytes
        .chunks_exact(4)
        .fold(seed, |crc, chunk| update_word(crc, LittleEndian::read_u32(chunk)))
}

/// The seed used for reduced channel blocks. It folds in the words the
/// reduced layout drops, in the order the not-reduced layout carries them.
pub fn reduced_seed(event_number: u32, ctime: u32, utime: u32, exp_run: u32) -> u16 {
    crc16(CRC16_INITIAL, &[event_number, ctime, utime, exp_run])
}
