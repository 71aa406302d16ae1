use flux_stream::{
    MultipartWriter, ObjectStoreObject, PrefetchReader, RemoteObject, StreamConfig, StreamEngine,
};
use flux_testing::assertions::assert_same_bytes;
use flux_testing::fixtures::patterned;
use flux_testing::helpers::{fixed_writer_options, read_in_chunks, reader_options, test_pool};
use flux_testing::{init_tracing, FlakyObject, TestDir};
use object_store::memory::InMemory;
use object_store::path::Path;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

fn in_memory_object(store: &Arc<InMemory>, key: &str) -> Arc<ObjectStoreObject<InMemory>> {
    Arc::new(ObjectStoreObject::new(store.clone(), Path::from(key)).unwrap())
}

#[test]
fn test_object_store_round_trip() {
    init_tracing();
    let store = Arc::new(InMemory::new());
    let pool = test_pool(4);
    let data = patterned(10_000);

    let object = in_memory_object(&store, "data/blob.bin");
    let mut writer = MultipartWriter::new(object, pool.clone(), fixed_writer_options(1024, 4096))
        .unwrap();
    writer.write_all(&data).unwrap();
    writer.close().unwrap();

    // A fresh handle, as another process would open it.
    let object = in_memory_object(&store, "data/blob.bin");
    assert_eq!(object.object_size().unwrap(), Some(10_000));

    let mut reader = PrefetchReader::new(object, pool, reader_options(700, 2800)).unwrap();
    let out = read_in_chunks(&mut reader, &[1, 699, 1400, 3]).unwrap();
    assert_same_bytes(&out, &data);

    reader.seek(SeekFrom::Start(9_990)).unwrap();
    let mut tail = Vec::new();
    reader.read_to_end(&mut tail).unwrap();
    assert_same_bytes(&tail, &data[9_990..]);
}

#[test]
fn test_object_store_empty_object() {
    let store = Arc::new(InMemory::new());
    let pool = test_pool(2);

    let mut writer = MultipartWriter::new(
        in_memory_object(&store, "empty"),
        pool.clone(),
        fixed_writer_options(64, 256),
    )
    .unwrap();
    writer.close().unwrap();

    let mut reader =
        PrefetchReader::new(in_memory_object(&store, "empty"), pool, reader_options(64, 256))
            .unwrap();
    assert_eq!(reader.size(), Some(0));
    assert!(reader.read_bytes(10).unwrap().is_empty());
}

#[test]
fn test_object_store_missing_object() {
    let store = Arc::new(InMemory::new());
    let err = PrefetchReader::new(
        in_memory_object(&store, "nope"),
        test_pool(1),
        reader_options(64, 256),
    )
    .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_engine_with_object_store_and_faults() {
    let store = Arc::new(InMemory::new());
    let dir = TestDir::new().unwrap();

    let mut config = StreamConfig::default();
    config.max_workers = 3;
    config.retry_base_delay_ms = 1;
    config.retry_max_delay_ms = 2;
    config.reader.block_size = 512;
    config.reader.max_buffer_size = 2048;
    config.writer.block_size = Some(256);
    config.writer.max_buffer_size = 1024;
    let path = dir.write_config("stream.toml", &config).unwrap();

    let engine = StreamEngine::new(StreamConfig::load(&path).unwrap()).unwrap();
    assert_eq!(engine.pool().workers(), 3);

    let data = patterned(5_000);
    let flaky = Arc::new(
        FlakyObject::new(in_memory_object(&store, "engine/out.bin"))
            .with_random_delay(Duration::ZERO, Duration::from_millis(2))
            .fail_part(3, flux_testing::Fault::Transient(1)),
    );
    let mut writer = engine.writer(flaky.clone()).unwrap();
    writer.write_all(&data).unwrap();
    writer.close().unwrap();
    assert_eq!(flaky.completed_parts().map(|parts| parts.len()), Some(20));

    let mut reader = engine
        .reader(in_memory_object(&store, "engine/out.bin"))
        .unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    assert_same_bytes(&out, &data);
}
