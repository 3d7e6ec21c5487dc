//! Scan data reassembly.
//!
//! During a scan the head streams `TotalScanPoints` little-endian `u32`
//! values. Chunks arrive with arbitrary boundaries; [`ScanAssembler`] queues
//! the bytes and peels off complete 4-byte words. The final word is the
//! total-pressure reading.

use byteorder::{ByteOrder, LittleEndian};
use std::collections::VecDeque;

const WORD: usize = 4;

/// Upper bound on values preallocated for one scan.
const MAX_PREALLOCATED: usize = 1 << 16;

/// A completed scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    values: Vec<u32>,
    start_amu: u32,
    points_per_amu: u32,
}

impl ScanResult {
    /// Wrap the raw values of a completed scan.
    pub fn new(values: Vec<u32>, start_amu: u32, points_per_amu: u32) -> Self {
        Self {
            values,
            start_amu,
            points_per_amu,
        }
    }

    /// All values, pressure word included.
    pub fn values(&self) -> &[u32] {
        &self.values
    }

    /// Number of values, pressure word included.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the scan holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Ion currents, one per scan step.
    pub fn intensities(&self) -> &[u32] {
        match self.values.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }

    /// Trailing total-pressure reading. Zero means "do not normalise".
    pub fn total_pressure(&self) -> u32 {
        self.values.last().copied().unwrap_or(0)
    }

    /// First AMU of the scan.
    pub fn start_amu(&self) -> u32 {
        self.start_amu
    }

    /// Steps per AMU.
    pub fn points_per_amu(&self) -> u32 {
        self.points_per_amu
    }
}

/// Byte queue and value accumulator for one scan.
#[derive(Debug, Default)]
pub struct ScanAssembler {
    buffer: VecDeque<u8>,
    values: Vec<u32>,
    expected: usize,
}

impl ScanAssembler {
    /// Create an idle assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear everything and expect `expected` values.
    pub fn reset(&mut self, expected: usize) {
        self.clear();
        self.expected = expected;
        self.values.reserve(expected.min(MAX_PREALLOCATED));
    }

    /// Drop buffered bytes and accumulated values.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.values.clear();
    }

    /// Append a chunk. Returns `true` once the expected count is reached.
    ///
    /// Bytes left over after the final value are discarded.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        self.buffer.extend(chunk.iter().copied());

        while self.buffer.len() >= WORD {
            let mut word = [0u8; WORD];
            for (slot, byte) in word.iter_mut().zip(self.buffer.drain(..WORD)) {
                *slot = byte;
            }
            self.values.push(LittleEndian::read_u32(&word));

            if self.values.len() == self.expected {
                self.buffer.clear();
            }
        }

        self.is_complete()
    }

    /// Whether the expected count has been reached.
    pub fn is_complete(&self) -> bool {
        self.expected > 0 && self.values.len() >= self.expected
    }

    /// Take the accumulated values and clear the assembler.
    pub fn take(&mut self) -> Vec<u32> {
        self.buffer.clear();
        std::mem::take(&mut self.values)
    }

    /// Bytes not yet forming a whole value.
    pub fn buffered(&self) -> &VecDeque<u8> {
        &self.buffer
    }

    /// Values assembled so far.
    pub fn values(&self) -> &[u32] {
        &self.values
    }

    /// Values the scan should produce.
    pub fn expected(&self) -> usize {
        self.expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(values: &[u32]) -> Vec<u8> {
        let mut bytes = vec![0u8; values.len() * WORD];
        LittleEndian::write_u32_into(values, &mut bytes);
        bytes
    }

    #[test]
    fn test_single_chunk() {
        let mut asm = ScanAssembler::new();
        asm.reset(3);
        assert!(asm.push(&encode(&[1, 0x0102_0304, 7])));
        assert_eq!(asm.values(), &[1, 0x0102_0304, 7]);
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let values: Vec<u32> = (0..97).map(|i| i * 65_537 + 3).collect();
        let bytes = encode(&values);

        for split in [1usize, 3, 5, 7, 64, 1000] {
            let mut asm = ScanAssembler::new();
            asm.reset(values.len());
            let mut complete = false;
            for chunk in bytes.chunks(split) {
                complete = asm.push(chunk);
            }
            assert!(complete, "split {split}");
            assert_eq!(asm.values(), values.as_slice(), "split {split}");
        }
    }

    #[test]
    fn test_partial_word_stays_buffered() {
        let mut asm = ScanAssembler::new();
        asm.reset(2);
        assert!(!asm.push(&[0xAA, 0xBB]));
        assert_eq!(asm.buffered().len(), 2);
        assert!(asm.values().is_empty());
        assert!(!asm.push(&[0xCC, 0xDD, 0x01]));
        assert_eq!(asm.values(), &[0xDDCC_BBAA]);
        assert_eq!(asm.buffered().len(), 1);
    }

    #[test]
    fn test_trailing_bytes_discarded() {
        let mut asm = ScanAssembler::new();
        asm.reset(1);
        assert!(asm.push(&[5, 0, 0, 0, 9, 9]));
        assert!(asm.buffered().is_empty());
        assert_eq!(asm.take(), vec![5]);
        assert!(asm.values().is_empty());
    }

    #[test]
    fn test_reset_with_huge_expectation_does_not_preallocate_it() {
        let mut asm = ScanAssembler::new();
        asm.reset(usize::MAX);
        assert_eq!(asm.expected(), usize::MAX);
        assert!(!asm.push(&[1, 0, 0, 0]));
        assert_eq!(asm.values(), &[1]);
    }

    #[test]
    fn test_idle_assembler_never_completes() {
        let mut asm = ScanAssembler::new();
        assert!(!asm.push(&[0, 0, 0, 0]));
    }

    #[test]
    fn test_scan_result_splits_pressure() {
        let result = ScanResult::new(vec![10, 20, 30, 400], 1, 10);
        assert_eq!(result.intensities(), &[10, 20, 30]);
        assert_eq!(result.total_pressure(), 400);
        assert_eq!(result.len(), 4);

        let empty = ScanResult::new(Vec::new(), 1, 10);
        assert!(empty.intensities().is_empty());
        assert_eq!(empty.total_pressure(), 0);
    }
}
