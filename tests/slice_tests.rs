use std::fs;
use std::path::Path;

use slice_recorder::codec::DType;
use slice_recorder::slice::{AnalyzeOutcome, Axis, CompressOutcome, Compression, Slice, SliceIo};
use slice_recorder::{Error, Role};

fn io(dir: &Path) -> SliceIo<'_> {
    SliceIo { dir, role: Role::Producer, consistent: true, closed: false, reclaim_memory: true }
}

fn closed(dir: &Path) -> SliceIo<'_> {
    SliceIo { closed: true, ..io(dir) }
}

fn slice(dtype: DType, capacity: usize) -> Slice {
    Slice::new("00c0ffee".into(), "test", Axis::Value, dtype, capacity)
}

/// Round-trips the metadata, dropping every in-memory buffer.
fn reloaded(slice: &Slice) -> Slice {
    serde_json::from_value(serde_json::to_value(slice).unwrap()).unwrap()
}

#[test]
fn test_flush_writes_encoded_samples() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = slice(DType::I16, 16);
    for v in [-2.0, 300.0, 7.0] {
        s.append(v).unwrap();
    }
    assert_eq!(s.write_pointer(), 0);
    assert!(s.has_pending());

    assert_eq!(s.flush(&io(dir.path())).unwrap(), 3);
    assert_eq!(s.write_pointer(), 3);
    assert!(!s.has_pending());
    assert_eq!(fs::metadata(s.path(dir.path())).unwrap().len(), 6);
    assert_eq!(s.flush(&io(dir.path())).unwrap(), 0);

    let mut fresh = reloaded(&s);
    assert!(!fresh.is_loaded());
    assert_eq!(fresh.load(&io(dir.path())).unwrap(), &[-2.0, 300.0, 7.0]);
}

#[test]
fn test_load_detects_truncated_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = slice(DType::U16, 16);
    for v in 0..4 {
        s.append(v as f64).unwrap();
    }
    s.flush(&io(dir.path())).unwrap();
    fs::write(s.path(dir.path()), [1, 0, 2]).unwrap();

    let mut producer = reloaded(&s);
    assert!(producer.load(&io(dir.path())).unwrap_err().is_consistency());

    // A consumer keeps what it can decode.
    let mut consumer = reloaded(&s);
    let consumer_io = SliceIo { role: Role::Consumer, ..io(dir.path()) };
    assert_eq!(consumer.load(&consumer_io).unwrap(), &[1.0]);
}

#[test]
fn test_compress_only_when_full_or_closed() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = slice(DType::U8, 8);
    for v in 0..5 {
        s.append(v as f64).unwrap();
    }
    assert_eq!(s.compress(&io(dir.path()), Compression::Lz4, 4).unwrap(), CompressOutcome::NotEligible);

    let outcome = s.compress(&closed(dir.path()), Compression::Lz4, 4).unwrap();
    assert!(matches!(outcome, CompressOutcome::Compressed { raw: 5, .. }));
    assert_eq!(s.file_name(), "00c0ffee.bin.lz4");
    assert!(!dir.path().join("00c0ffee.bin").exists());
    assert!(s.append(9.0).is_err());

    assert_eq!(
        s.compress(&closed(dir.path()), Compression::Lz4, 4).unwrap(),
        CompressOutcome::AlreadyCompressed
    );
    assert_eq!(
        s.compress(&closed(dir.path()), Compression::Lz4Frame, 4).unwrap(),
        CompressOutcome::Conflict { existing: Compression::Lz4 }
    );

    let mut fresh = reloaded(&s);
    assert_eq!(fresh.load(&io(dir.path())).unwrap(), &[0.0, 1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_partial_payloads_advance() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = slice(DType::U8, 4);
    assert!(s.partial_payload(&io(dir.path())).unwrap().is_none());

    s.append(1.0).unwrap();
    s.append(2.0).unwrap();
    s.flush(&io(dir.path())).unwrap();
    let first = s.partial_payload(&io(dir.path())).unwrap().unwrap();
    assert_eq!((first.offset, first.bytes.as_slice()), (0, &[1u8, 2][..]));
    s.confirm_transfer(&first, false);
    assert_eq!(s.send_pointer(), 2);
    assert!(!s.is_sent());
    assert!(s.full_payload(&io(dir.path())).unwrap().is_none());

    s.append(3.0).unwrap();
    s.append(4.0).unwrap();
    s.flush(&io(dir.path())).unwrap();
    let second = s.partial_payload(&io(dir.path())).unwrap().unwrap();
    assert_eq!((second.offset, second.bytes.as_slice()), (2, &[3u8, 4][..]));
    s.confirm_transfer(&second, false);
    assert!(s.is_sent());
    assert!(s.partial_payload(&io(dir.path())).unwrap().is_none());
}

#[test]
fn test_compression_clears_sent() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = slice(DType::U8, 2);
    s.append(1.0).unwrap();
    s.append(2.0).unwrap();
    s.flush(&io(dir.path())).unwrap();
    let raw = s.full_payload(&io(dir.path())).unwrap().unwrap();
    s.confirm_transfer(&raw, false);
    assert!(s.is_sent());

    s.compress(&io(dir.path()), Compression::Lz4Frame, 9).unwrap();
    assert!(!s.is_sent());
    assert!(s.partial_payload(&io(dir.path())).unwrap().is_none());
    let packed = s.full_payload(&io(dir.path())).unwrap().unwrap();
    assert_eq!(packed.filename, "00c0ffee.bin.lz4f");

    // A confirmation for the old raw form does not count.
    s.confirm_transfer(&raw, false);
    assert!(!s.is_sent());
    s.confirm_transfer(&packed, false);
    assert!(s.is_sent());
}

#[test]
fn test_binary_analysis_is_deferred() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = slice(DType::U16, 6);
    s.append_raw(&[1, 0, 2, 0]).unwrap();
    assert_eq!(s.analyze(&io(dir.path()), false).unwrap(), AnalyzeOutcome::Deferred);

    s.append_raw(&[9, 0]).unwrap();
    assert!(s.is_full());
    // Still pending on disk.
    assert_eq!(s.analyze(&io(dir.path()), false).unwrap(), AnalyzeOutcome::Deferred);

    s.flush(&io(dir.path())).unwrap();
    assert_eq!(s.analyze(&io(dir.path()), false).unwrap(), AnalyzeOutcome::Analyzed);
    assert!(s.is_finally_analyzed());
    assert_eq!(s.stats().count, 3);
    assert_eq!(s.stats().max, Some(9.0));
    // The decoded buffer was reclaimed but can be rebuilt.
    assert!(!s.is_loaded());
    assert_eq!(s.max_value(&io(dir.path())).unwrap(), Some(9.0));
    assert_eq!(s.analyze(&io(dir.path()), false).unwrap(), AnalyzeOutcome::Skipped);
}

#[test]
fn test_raw_append_respects_capacity() {
    let mut s = slice(DType::I24, 6);
    assert!(matches!(s.append_raw(&[0; 9]), Err(Error::InvalidInput(_))));
    assert_eq!(s.append_raw(&[0; 6]).unwrap(), 2);
    assert_eq!(s.remaining(), 0);
}

#[test]
fn test_values_in_clips() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = slice(DType::F32, 32);
    for v in [0.5, 1.5, 2.5] {
        s.append(v).unwrap();
    }
    assert_eq!(s.values_in(&io(dir.path()), 1, 10).unwrap(), vec![1.5, 2.5]);
    assert!(s.values_in(&io(dir.path()), 5, 10).unwrap().is_empty());
}
