//! Counter frame source for the daemon
//!
//! Stands in for a bus interface: every record carries its sequence number so
//! clients can spot gaps. Record `i` holds `i & 0x7FF` (an 11-bit identifier)
//! big-endian in bytes 0..4 and `i` little-endian in bytes 8..12. Fields that
//! do not fit the record size are truncated.

use crate::config::SourceConfig;
use std::time::Duration;

/// Mask of a standard 11-bit frame identifier
const ID_MASK: u64 = 0x7FF;

/// Generator of numbered records
#[derive(Debug, Clone)]
pub struct CounterSource {
    record_size: usize,
    interval: Duration,
    limit: u64,
    next: u64,
}

impl CounterSource {
    pub fn new(record_size: usize, config: &SourceConfig) -> Self {
        Self {
            record_size,
            interval: Duration::from_millis(config.interval_ms),
            limit: config.limit,
            next: 0,
        }
    }

    /// Time between two records
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Records produced so far
    pub fn produced(&self) -> u64 {
        self.next
    }

    /// Whether the configured limit has been reached
    pub fn is_exhausted(&self) -> bool {
        self.limit != 0 && self.next >= self.limit
    }

    /// Build record number `index`
    pub fn frame(&self, index: u64) -> Vec<u8> {
        let mut record = vec![0u8; self.record_size];
        put(&mut record, 0, &((index & ID_MASK) as u32).to_be_bytes());
        put(&mut record, 8, &(index as u32).to_le_bytes());
        record
    }
}

impl Iterator for CounterSource {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.is_exhausted() {
            return None;
        }
        let record = self.frame(self.next);
        self.next += 1;
        Some(record)
    }
}

fn put(record: &mut [u8], offset: usize, bytes: &[u8]) {
    if offset >= record.len() {
        return;
    }
    let end = (offset + bytes.len()).min(record.len());
    record[offset..end].copy_from_slice(&bytes[..end - offset]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(record_size: usize, limit: u64) -> CounterSource {
        CounterSource::new(
            record_size,
            &SourceConfig {
                interval_ms: 10,
                limit,
            },
        )
    }

    #[test]
    fn test_frame_layout() {
        let frame = source(16, 0).frame(0x1234_5801);
        assert_eq!(frame.len(), 16);
        // 0x12345801 & 0x7FF = 0x001
        assert_eq!(&frame[0..4], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&frame[4..8], &[0; 4]);
        assert_eq!(&frame[8..12], &[0x01, 0x58, 0x34, 0x12]);
        assert_eq!(&frame[12..16], &[0; 4]);
    }

    #[test]
    fn test_small_record_truncates() {
        let frame = source(10, 0).frame(0x7FF);
        assert_eq!(frame, vec![0x00, 0x00, 0x07, 0xFF, 0, 0, 0, 0, 0xFF, 0x07]);
        assert_eq!(source(2, 0).frame(5), vec![0x00, 0x00]);
    }

    #[test]
    fn test_limit_stops_iteration() {
        let mut src = source(16, 3);
        assert_eq!(src.interval(), Duration::from_millis(10));
        assert_eq!(src.by_ref().count(), 3);
        assert!(src.is_exhausted());
        assert_eq!(src.produced(), 3);
        assert!(src.next().is_none());
    }

    #[test]
    fn test_unlimited_source() {
        let mut src = source(16, 0);
        let last = src.by_ref().take(1000).last().unwrap();
        assert_eq!(&last[8..12], &999u32.to_le_bytes());
        assert!(!src.is_exhausted());
    }
}
