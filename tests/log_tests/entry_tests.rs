//! Tests for log entry framing
//!
//! These tests verify:
//! - Entry serialization and integrity checks
//! - Cursor advancement over DATA, NOP and SWITCH_LOG entries
//! - Buffer parsing and range scanning
//! - Aligned batch construction

use commitlog::log::{
    nop_padding_len, parse_log_buffer, scan_log_range, EntryIter, LogBatch, LogCommand, LogCursor,
    LogEntry, DIRECT_IO_ALIGN, HEADER_SIZE,
};
use commitlog::LogError;

// =============================================================================
// Helper Functions
// =============================================================================

/// Frame `payloads` as consecutive DATA entries without padding
fn raw_entries(start_id: u64, payloads: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (i, p) in payloads.iter().enumerate() {
        LogEntry::data(start_id + i as u64, p.to_vec()).serialize_into(&mut buf);
    }
    buf
}

// =============================================================================
// Entry Serialization Tests
// =============================================================================

#[test]
fn test_entry_roundtrip() {
    let entry = LogEntry::data(42, b"hello".to_vec());
    let bytes = entry.serialize();
    assert_eq!(bytes.len(), HEADER_SIZE + 5);
    assert_eq!(entry.serialized_len(), bytes.len());

    let (decoded, len) = LogEntry::deserialize(&bytes).unwrap();
    assert_eq!(decoded, entry);
    assert_eq!(len, bytes.len());
}

#[test]
fn test_payload_corruption_detected() {
    let mut bytes = LogEntry::data(1, b"payload".to_vec()).serialize();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;

    let result = LogEntry::deserialize(&bytes);
    assert!(matches!(result, Err(LogError::CorruptEntry(_))));
}

#[test]
fn test_header_corruption_detected() {
    let mut bytes = LogEntry::data(1, b"payload".to_vec()).serialize();
    // Flip a bit in the sequence number
    bytes[9] ^= 0x01;

    let result = LogEntry::deserialize(&bytes);
    assert!(matches!(result, Err(LogError::CorruptEntry(_))));
}

#[test]
fn test_bad_magic_detected() {
    let mut bytes = LogEntry::data(1, b"x".to_vec()).serialize();
    bytes[0] = 0;

    assert!(matches!(
        LogEntry::decode(&bytes),
        Err(LogError::CorruptEntry(_))
    ));
}

#[test]
fn test_truncated_entry_is_incomplete() {
    let bytes = LogEntry::data(1, vec![7u8; 100]).serialize();

    assert!(LogEntry::decode(&bytes[..10]).unwrap().is_none());
    assert!(LogEntry::decode(&bytes[..HEADER_SIZE + 50]).unwrap().is_none());
    assert!(matches!(
        LogEntry::deserialize(&bytes[..HEADER_SIZE + 50]),
        Err(LogError::CorruptEntry(_))
    ));
}

#[test]
fn test_peek_sequence() {
    let bytes = LogEntry::data(77, b"abc".to_vec()).serialize();
    assert_eq!(LogEntry::peek_sequence(&bytes).unwrap(), Some(77));
    assert_eq!(LogEntry::peek_sequence(&bytes[..HEADER_SIZE]).unwrap(), Some(77));
    assert_eq!(LogEntry::peek_sequence(&bytes[..4]).unwrap(), None);
}

#[test]
fn test_switch_log_target() {
    let entry = LogEntry::switch_log(10, 3);
    assert_eq!(entry.command, LogCommand::SwitchLog);
    assert_eq!(entry.switch_target().unwrap(), 3);

    let data = LogEntry::data(10, b"x".to_vec());
    assert!(matches!(
        data.switch_target(),
        Err(LogError::InvalidArgument(_))
    ));
}

#[test]
fn test_nop_has_exact_length() {
    let nop = LogEntry::nop(5, 200);
    assert_eq!(nop.serialized_len(), 200);
    assert_eq!(nop.serialize().len(), 200);
}

// =============================================================================
// Cursor Tests
// =============================================================================

#[test]
fn test_cursor_validity() {
    assert!(!LogCursor::default().is_valid());
    assert!(LogCursor::at_file(1).is_valid());
    assert!(!LogCursor::at_file(1).is_established());
    assert!(LogCursor::new(1, 1, 0).is_established());
}

#[test]
fn test_cursor_advance_data() {
    let mut cursor = LogCursor::new(1, 5, 100);
    let entry = LogEntry::data(5, b"abcd".to_vec());
    cursor.advance(&entry).unwrap();

    assert_eq!(cursor, LogCursor::new(1, 6, 100 + HEADER_SIZE as u64 + 4));
}

#[test]
fn test_cursor_advance_rejects_gap() {
    let mut cursor = LogCursor::new(1, 5, 0);
    let entry = LogEntry::data(7, b"x".to_vec());

    let result = cursor.advance(&entry);
    assert!(matches!(
        result,
        Err(LogError::DiscontinuousLog {
            expected: 5,
            actual: 7
        })
    ));
    assert_eq!(cursor, LogCursor::new(1, 5, 0));
}

#[test]
fn test_cursor_unestablished_accepts_any_start() {
    let mut cursor = LogCursor::at_file(3);
    cursor.advance(&LogEntry::data(900, b"x".to_vec())).unwrap();
    assert_eq!(cursor.log_id, 901);
    assert_eq!(cursor.file_id, 3);
}

#[test]
fn test_cursor_switch_moves_to_next_file() {
    let mut cursor = LogCursor::new(4, 20, 4096);
    cursor.advance(&LogEntry::switch_log(20, 5)).unwrap();
    assert_eq!(cursor, LogCursor::new(5, 21, 0));
}

#[test]
fn test_cursor_switch_wrong_target() {
    let mut cursor = LogCursor::new(4, 20, 4096);
    let result = cursor.advance(&LogEntry::switch_log(20, 6));
    assert!(matches!(result, Err(LogError::CorruptEntry(_))));
}

// =============================================================================
// Buffer Parsing Tests
// =============================================================================

#[test]
fn test_parse_advances_by_entry_count() {
    let buf = raw_entries(10, &[b"a", b"bb", b"ccc"]);
    let start = LogCursor::new(2, 10, 512);

    let end = parse_log_buffer(&buf, &start).unwrap();
    assert_eq!(end.log_id, 13);
    assert_eq!(end.file_id, 2);
    assert_eq!(end.offset, 512 + buf.len() as u64);

    // Same inputs, same answer
    assert_eq!(parse_log_buffer(&buf, &start).unwrap(), end);
}

#[test]
fn test_parse_rejects_wrong_start() {
    let buf = raw_entries(10, &[b"a", b"b"]);
    let result = parse_log_buffer(&buf, &LogCursor::new(1, 11, 0));
    assert!(matches!(
        result,
        Err(LogError::DiscontinuousLog {
            expected: 11,
            actual: 10
        })
    ));
}

#[test]
fn test_parse_rejects_internal_gap() {
    let mut buf = raw_entries(10, &[b"a"]);
    LogEntry::data(12, b"b".to_vec()).serialize_into(&mut buf);

    let result = parse_log_buffer(&buf, &LogCursor::new(1, 10, 0));
    assert!(matches!(result, Err(LogError::DiscontinuousLog { .. })));
}

#[test]
fn test_parse_rejects_trailing_partial_entry() {
    let mut buf = raw_entries(1, &[b"a", b"b"]);
    buf.truncate(buf.len() - 1);

    let result = parse_log_buffer(&buf, &LogCursor::new(1, 1, 0));
    assert!(matches!(result, Err(LogError::CorruptEntry(_))));
}

#[test]
fn test_parse_rejects_empty_and_invalid_cursor() {
    let buf = raw_entries(1, &[b"a"]);
    assert!(matches!(
        parse_log_buffer(&[], &LogCursor::new(1, 1, 0)),
        Err(LogError::InvalidArgument(_))
    ));
    assert!(matches!(
        parse_log_buffer(&buf, &LogCursor::default()),
        Err(LogError::InvalidArgument(_))
    ));
}

#[test]
fn test_parse_follows_switch() {
    let (switch, next_id) = LogBatch::switch_log(7, 2);
    let mut buf = switch;
    let (data, end_id) = {
        let mut batch = LogBatch::new(next_id);
        batch.push_data(b"after switch");
        batch.finish()
    };
    buf.extend_from_slice(&data);

    let end = parse_log_buffer(&buf, &LogCursor::new(1, 7, 1024)).unwrap();
    assert_eq!(end, LogCursor::new(2, end_id, data.len() as u64));
}

#[test]
fn test_scan_log_range() {
    let buf = raw_entries(100, &[b"a", b"b", b"c"]);
    assert_eq!(scan_log_range(&buf).unwrap(), (100, 103));
}

#[test]
fn test_scan_log_range_rejects_gap_and_empty() {
    let mut buf = raw_entries(100, &[b"a"]);
    LogEntry::data(105, b"b".to_vec()).serialize_into(&mut buf);

    assert!(matches!(
        scan_log_range(&buf),
        Err(LogError::DiscontinuousLog {
            expected: 101,
            actual: 105
        })
    ));
    assert!(matches!(
        scan_log_range(&[]),
        Err(LogError::InvalidArgument(_))
    ));
}

#[test]
fn test_entry_iter_positions() {
    let buf = raw_entries(1, &[b"aaaa", b"bb"]);
    let items: Vec<_> = EntryIter::new(&buf).map(|r| r.unwrap()).collect();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].1, 0);
    assert_eq!(items[1].1, HEADER_SIZE + 4);
    assert_eq!(items[1].0.sequence, 2);
}

// =============================================================================
// Batch Construction Tests
// =============================================================================

#[test]
fn test_nop_padding_len() {
    assert_eq!(nop_padding_len(0), 0);
    assert_eq!(nop_padding_len(DIRECT_IO_ALIGN), 0);
    assert_eq!(nop_padding_len(28), DIRECT_IO_ALIGN - 28);

    // 12 bytes left is too small for a header; pad into the next block
    assert_eq!(nop_padding_len(500), 12 + DIRECT_IO_ALIGN);
}

#[test]
fn test_batch_is_aligned_and_padded() {
    let mut batch = LogBatch::new(1);
    batch.push_data(b"hello");
    let (buf, end_id) = batch.finish();

    assert_eq!(buf.len(), DIRECT_IO_ALIGN);
    assert_eq!(end_id, 3);

    let entries: Vec<_> = EntryIter::new(&buf).map(|r| r.unwrap().0).collect();
    assert_eq!(entries[0].command, LogCommand::Data);
    assert_eq!(entries[1].command, LogCommand::Nop);
    assert_eq!(entries[1].sequence, 2);
}

#[test]
fn test_batch_exactly_aligned_needs_no_nop() {
    let mut batch = LogBatch::new(1);
    batch.push_data(&vec![0u8; DIRECT_IO_ALIGN - HEADER_SIZE]);
    let (buf, end_id) = batch.finish();

    assert_eq!(buf.len(), DIRECT_IO_ALIGN);
    assert_eq!(end_id, 2);
}

#[test]
fn test_switch_batch_layout() {
    let (buf, end_id) = LogBatch::switch_log(50, 4);
    assert_eq!(buf.len(), DIRECT_IO_ALIGN);
    assert_eq!(end_id, 52);

    let entries: Vec<_> = EntryIter::new(&buf).map(|r| r.unwrap().0).collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].command, LogCommand::Nop);
    assert_eq!(entries[1].command, LogCommand::SwitchLog);
    assert_eq!(entries[1].switch_target().unwrap(), 4);
}
