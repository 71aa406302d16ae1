use flux_stream::{
    BlockSizePolicy, MemoryObject, MultipartWriter, PrefetchReader, RemoteObject, StreamError,
    WorkerPool, WriterOptions, WriterState,
};
use flux_testing::assertions::{assert_non_decreasing, assert_pool_idle, assert_same_bytes};
use flux_testing::fixtures::{chunk_sizes, patterned, random_bytes};
use flux_testing::helpers::{fast_retry, fixed_writer_options, reader_options, test_pool};
use flux_testing::{init_tracing, Fault, FlakyObject};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

fn open(
    object: Arc<dyn RemoteObject>,
    pool: &Arc<WorkerPool>,
    opts: WriterOptions,
) -> MultipartWriter {
    MultipartWriter::new(object, pool.clone(), opts).unwrap()
}

fn read_back(object: Arc<dyn RemoteObject>, pool: &Arc<WorkerPool>) -> Vec<u8> {
    let mut reader = PrefetchReader::new(object, pool.clone(), reader_options(64, 512)).unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    out
}

#[test]
fn test_write_close_read_back() {
    init_tracing();
    let pool = test_pool(4);

    for seed in 0..4u64 {
        let data = random_bytes(5_000, seed);
        let object = Arc::new(MemoryObject::new("mem://written"));
        let mut writer = open(object.clone(), &pool, fixed_writer_options(128, 512));

        let mut offset = 0;
        for size in chunk_sizes(data.len(), 400, seed) {
            assert_eq!(writer.write(&data[offset..offset + size]).unwrap(), size);
            offset += size;
        }
        assert_eq!(writer.tell(), data.len() as u64);
        writer.close().unwrap();

        assert_eq!(writer.state(), WriterState::Closed);
        assert_same_bytes(&read_back(object, &pool), &data);
    }
}

#[test]
fn test_zero_length_writes() {
    let pool = test_pool(2);
    let object = Arc::new(MemoryObject::new("mem://zeros"));
    let mut writer = open(object.clone(), &pool, fixed_writer_options(4, 16));

    writer.write_all(b"").unwrap();
    writer.write_all(b"abcd").unwrap();
    writer.write_all(b"").unwrap();
    writer.write_all(b"efg").unwrap();
    writer.close().unwrap();

    assert_eq!(object.contents().unwrap(), &b"abcdefg"[..]);
}

#[test]
fn test_parts_complete_in_index_order() {
    init_tracing();
    let pool = test_pool(4);
    let flaky = Arc::new(
        FlakyObject::new(Arc::new(MemoryObject::new("mem://ordered")))
            .delay_part(1, Duration::from_millis(100)),
    );
    let data = patterned(25);

    let mut writer = open(flaky.clone(), &pool, fixed_writer_options(10, 100));
    writer.write_all(&data).unwrap();
    writer.close().unwrap();

    let order = flaky.upload_order();
    let first = order.iter().position(|index| *index == 1).unwrap();
    let second = order.iter().position(|index| *index == 2).unwrap();
    assert!(second < first, "part 2 should finish before part 1: {:?}", order);

    assert_eq!(flaky.completed_parts(), Some(vec![1, 2, 3]));
    assert_same_bytes(&read_back(flaky, &pool), &data);
}

#[test]
fn test_autoscale_part_size_only_grows() {
    let pool = test_pool(4);
    let object = Arc::new(MemoryObject::new("mem://autoscale"));
    let options = WriterOptions {
        block_size: BlockSizePolicy::autoscale(8, 1024),
        max_buffer_size: 256,
        retry: fast_retry(3),
    };
    let mut writer = open(object.clone(), &pool, options);
    let data = patterned(1000);

    let mut sizes = vec![writer.next_block_size()];
    for chunk in data.chunks(7) {
        writer.write_all(chunk).unwrap();
        sizes.push(writer.next_block_size());
    }
    writer.close().unwrap();

    assert_non_decreasing(&sizes);
    assert!(*sizes.last().unwrap() > 8);
    assert_same_bytes(&object.contents().unwrap(), &data);
}

#[test]
fn test_buffer_bound_applies_backpressure() {
    let pool = test_pool(2);
    let flaky = Arc::new(
        FlakyObject::new(Arc::new(MemoryObject::new("mem://slow")))
            .with_random_delay(Duration::from_millis(1), Duration::from_millis(3)),
    );
    let mut writer = open(flaky.clone(), &pool, fixed_writer_options(10, 30));
    let data = patterned(500);

    for chunk in data.chunks(13) {
        writer.write_all(chunk).unwrap();
        assert!(writer.buffered_bytes() <= 30);
    }
    writer.close().unwrap();
    assert_same_bytes(&read_back(flaky, &pool), &data);
}

#[test]
fn test_transient_part_failure_is_retried() {
    let pool = test_pool(2);
    let flaky = Arc::new(
        FlakyObject::new(Arc::new(MemoryObject::new("mem://retried")))
            .fail_part(2, Fault::Transient(2))
            .fail_complete(Fault::Transient(1)),
    );
    let data = patterned(35);

    let mut writer = open(flaky.clone(), &pool, fixed_writer_options(10, 100));
    writer.write_all(&data).unwrap();
    writer.close().unwrap();

    assert_eq!(flaky.completed_parts(), Some(vec![1, 2, 3, 4]));
    assert_eq!(flaky.abort_count(), 0);
    assert_same_bytes(&read_back(flaky, &pool), &data);
}

#[test]
fn test_failed_part_aborts_upload() {
    init_tracing();
    let pool = test_pool(2);
    let memory = Arc::new(MemoryObject::new("mem://failing"));
    let flaky = Arc::new(
        FlakyObject::new(memory.clone())
            .fail_part(2, Fault::Fatal)
            .delay_part(2, Duration::from_millis(20)),
    );

    let mut writer = open(flaky.clone(), &pool, fixed_writer_options(10, 100));
    writer.write_all(&patterned(25)).unwrap();
    let err = writer.close().unwrap_err();

    match err {
        StreamError::Aborted {
            source, abort_error, ..
        } => {
            assert!(matches!(*source, StreamError::Backend(_)));
            assert!(abort_error.is_none());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(writer.state(), WriterState::Aborted);
    assert_eq!(flaky.abort_count(), 1);
    assert_eq!(flaky.completed_parts(), None);
    assert!(memory.contents().is_none());
    assert_eq!(memory.staged_parts(), 0);
    assert_pool_idle(&pool, Duration::from_secs(5)).unwrap();

    assert!(writer.write_bytes(b"more").unwrap_err().is_logical());
}

#[test]
fn test_abort_failure_is_reported_alongside() {
    let pool = test_pool(2);
    let flaky = Arc::new(
        FlakyObject::new(Arc::new(MemoryObject::new("mem://double-fault")))
            .fail_part(1, Fault::Fatal)
            .fail_abort(Fault::Fatal),
    );

    let mut writer = open(flaky.clone(), &pool, fixed_writer_options(10, 100));
    writer.write_all(&patterned(5)).unwrap();
    let err = writer.close().unwrap_err();

    match &err {
        StreamError::Aborted { abort_error, .. } => assert!(abort_error.is_some()),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("abort also failed"));
}

#[test]
fn test_too_many_parts() {
    let pool = test_pool(2);
    let flaky = Arc::new(
        FlakyObject::new(Arc::new(MemoryObject::new("mem://limited"))).with_max_parts(2),
    );

    let mut writer = open(flaky.clone(), &pool, fixed_writer_options(4, 64));
    let err = writer.write_bytes(&patterned(12)).unwrap_err();

    match err {
        StreamError::Aborted { source, .. } => {
            assert!(matches!(*source, StreamError::TooManyParts { max_parts: 2, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(flaky.abort_count(), 1);
}

#[test]
fn test_drop_without_close_aborts() {
    let pool = test_pool(2);
    let memory = Arc::new(MemoryObject::new("mem://forgotten"));
    let flaky = Arc::new(FlakyObject::new(memory.clone()));
    {
        let mut writer = open(flaky.clone(), &pool, fixed_writer_options(4, 64));
        writer.write_all(&patterned(10)).unwrap();
    }
    assert_eq!(flaky.abort_count(), 1);
    assert_eq!(flaky.completed_parts(), None);
    assert!(memory.contents().is_none());
}

#[test]
fn test_write_only_seek() {
    let pool = test_pool(1);
    let object = Arc::new(MemoryObject::new("mem://tell"));
    let mut writer = open(object, &pool, fixed_writer_options(8, 64));

    writer.write_all(b"0123456789").unwrap();
    assert_eq!(writer.stream_position().unwrap(), 10);
    assert_eq!(writer.seek(SeekFrom::Start(10)).unwrap(), 10);

    let err = writer.seek(SeekFrom::Start(2)).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    writer.close().unwrap();
}

#[test]
fn test_flush_dispatches_without_waiting() {
    let pool = test_pool(2);
    let flaky = Arc::new(
        FlakyObject::new(Arc::new(MemoryObject::new("mem://flushed")))
            .delay_part(1, Duration::from_millis(50)),
    );
    let mut writer = open(flaky.clone(), &pool, fixed_writer_options(100, 1000));

    writer.write_all(b"short").unwrap();
    writer.flush().unwrap();
    assert_eq!(writer.parts_dispatched(), 1);
    assert!(flaky.upload_order().is_empty());

    writer.write_all(b" tail").unwrap();
    writer.close().unwrap();
    assert_eq!(flaky.completed_parts(), Some(vec![1, 2]));
    assert_eq!(read_back(flaky, &pool), b"short tail");
}
