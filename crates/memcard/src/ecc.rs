//! Page error-correcting code.
//!
//! Each 128-byte chunk of a page carries a 3-byte Hamming code in the
//! page's spare area: a column parity byte and two 7-bit line parities.
//! The code corrects any single flipped data bit and tolerates a single
//! flipped code bit.

pub const CHUNK_LEN: usize = 128;
pub const CODE_LEN: usize = 3;

const COLUMN_MASKS: [u8; 7] = [0x55, 0x33, 0x0F, 0x00, 0xAA, 0xCC, 0xF0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkCheck {
    Clean,
    /// A single data bit was flipped back.
    CorrectedData,
    /// The stored code itself had a single bad bit; data untouched.
    CorrectedCode,
    Uncorrectable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCheck {
    Clean,
    /// Spare area is erased: the page was never written.
    Blank,
    /// Number of chunks that needed correction.
    Corrected(usize),
    /// Index of the first chunk that could not be corrected.
    Uncorrectable(usize),
}

fn parity(byte: u8) -> u8 {
    (byte.count_ones() & 1) as u8
}

fn column_parity_mask(byte: u8) -> u8 {
    COLUMN_MASKS
        .iter()
        .enumerate()
        .fold(0, |mask, (bit, &columns)| mask | (parity(byte & columns) << bit))
}

pub fn chunk_code(chunk: &[u8]) -> [u8; CODE_LEN] {
    let mut column = 0x77u8;
    let mut line_odd = 0x7Fu8;
    let mut line_even = 0x7Fu8;
    for (index, &byte) in chunk.iter().enumerate() {
        column ^= column_parity_mask(byte);
        if parity(byte) == 1 {
            line_odd ^= !(index as u8);
            line_even ^= index as u8;
        }
    }
    [column, line_odd & 0x7F, line_even]
}

pub fn check_chunk(chunk: &mut [u8], stored: &[u8]) -> ChunkCheck {
    let computed = chunk_code(chunk);
    if computed[..] == stored[..CODE_LEN] {
        return ChunkCheck::Clean;
    }

    let column_diff = (computed[0] ^ stored[0]) & 0x77;
    let odd_diff = (computed[1] ^ stored[1]) & 0x7F;
    let even_diff = (computed[2] ^ stored[2]) & 0x7F;
    let line_comp = odd_diff ^ even_diff;
    let column_comp = (column_diff >> 4) ^ (column_diff & 0x07);

    if line_comp == 0x7F && column_comp == 0x07 {
        chunk[usize::from(even_diff)] ^= 1 << (column_diff >> 4);
        return ChunkCheck::CorrectedData;
    }
    let stray_bits = line_comp.count_ones() + column_comp.count_ones();
    if (column_diff == 0 && odd_diff == 0 && even_diff == 0) || stray_bits == 1 {
        return ChunkCheck::CorrectedCode;
    }
    ChunkCheck::Uncorrectable
}

/// Builds the spare area for a page: chunk codes in order, zero padded.
pub fn page_spare(data: &[u8], spare_len: usize) -> Vec<u8> {
    let mut spare = Vec::with_capacity(spare_len);
    for chunk in data.chunks(CHUNK_LEN) {
        spare.extend_from_slice(&chunk_code(chunk));
    }
    spare.resize(spare_len, 0);
    spare
}

/// Verifies and corrects `data` in place against its spare area.
pub fn check_page(data: &mut [u8], spare: &[u8], erased: u8) -> PageCheck {
    let chunks = data.len() / CHUNK_LEN;
    if spare.len() < chunks * CODE_LEN {
        return PageCheck::Clean;
    }
    if spare.iter().all(|&byte| byte == erased) {
        return PageCheck::Blank;
    }

    let mut corrected = 0;
    for (index, chunk) in data.chunks_mut(CHUNK_LEN).enumerate() {
        let stored = &spare[index * CODE_LEN..(index + 1) * CODE_LEN];
        match check_chunk(chunk, stored) {
            ChunkCheck::Clean => {}
            ChunkCheck::CorrectedData | ChunkCheck::CorrectedCode => corrected += 1,
            ChunkCheck::Uncorrectable => return PageCheck::Uncorrectable(index),
        }
    }
    if corrected == 0 {
        PageCheck::Clean
    } else {
        PageCheck::Corrected(corrected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> Vec<u8> {
        (0..CHUNK_LEN).map(|i| (i * 37 + 11) as u8).collect()
    }

    #[test]
    fn zero_chunk_has_the_reset_code() {
        assert_eq!(chunk_code(&[0u8; CHUNK_LEN]), [0x77, 0x7F, 0x7F]);
    }

    #[test]
    fn every_single_data_bit_error_is_corrected() {
        let original = sample_chunk();
        let code = chunk_code(&original);
        for byte in [0usize, 1, 63, 64, 127] {
            for bit in 0..8 {
                let mut damaged = original.clone();
                damaged[byte] ^= 1 << bit;
                assert_eq!(check_chunk(&mut damaged, &code), ChunkCheck::CorrectedData);
                assert_eq!(damaged, original, "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn single_code_bit_error_leaves_data_alone() {
        let mut chunk = sample_chunk();
        let mut code = chunk_code(&chunk);
        code[1] ^= 0x04;
        assert_eq!(check_chunk(&mut chunk, &code), ChunkCheck::CorrectedCode);
        assert_eq!(chunk, sample_chunk());
    }

    #[test]
    fn double_bit_error_is_uncorrectable() {
        let original = sample_chunk();
        let code = chunk_code(&original);
        let mut damaged = original.clone();
        damaged[3] ^= 0x01;
        damaged[90] ^= 0x10;
        assert_eq!(check_chunk(&mut damaged, &code), ChunkCheck::Uncorrectable);
    }

    #[test]
    fn page_spare_is_padded_and_checks_clean() {
        let mut page: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        let spare = page_spare(&page, 16);
        assert_eq!(spare.len(), 16);
        assert_eq!(&spare[12..], &[0, 0, 0, 0]);
        assert_eq!(check_page(&mut page, &spare, 0xFF), PageCheck::Clean);
    }

    #[test]
    fn erased_spare_marks_a_blank_page() {
        let mut page = vec![0xFFu8; 512];
        assert_eq!(check_page(&mut page, &[0xFF; 16], 0xFF), PageCheck::Blank);
    }

    #[test]
    fn page_reports_failing_chunk() {
        let mut page: Vec<u8> = (0..512).map(|i| (i % 13) as u8).collect();
        let spare = page_spare(&page, 16);
        page[300] ^= 0x81;
        assert_eq!(check_page(&mut page, &spare, 0xFF), PageCheck::Uncorrectable(2));
    }
}
