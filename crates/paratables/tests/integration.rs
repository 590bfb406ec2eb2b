//! End-to-end tests: reader, worker pool, and streamer against a container
//! file on disk, with real forked worker processes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use rand::seq::SliceRandom;

use paratables::colfile::{ColFile, ColFileBuilder};
use paratables::{
    DType, Error, Field, IndexKey, QueueOptions, Reader, ScalarKind, ScalarValue, StreamItem,
    Streamer,
};
use tempfile::TempDir;

const ARRAY_PATH: &str = "/test_array";
const TABLE_PATH: &str = "/test_table";
const ARRAY_ROWS: usize = 1000;
const TABLE_ROWS: usize = 300;

/// Worker pools fork; run the multi-process tests one at a time.
fn fork_lock() -> MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn table_row_type() -> DType {
    DType::Compound(vec![
        Field {
            name: "col_a".into(),
            dtype: ScalarKind::UInt8.into(),
            shape: vec![4, 3],
        },
        Field {
            name: "col_b".into(),
            dtype: ScalarKind::Float64.into(),
            shape: vec![2],
        },
        Field {
            name: "col_c".into(),
            dtype: ScalarKind::Float32.into(),
            shape: vec![],
        },
    ])
}

fn col_c_value(row: usize) -> f32 {
    ((row * 919) % 1000) as f32 / 1000.0
}

fn col_a_values(row: usize) -> Vec<u8> {
    (0..12).map(|k| ((row + k) % 251) as u8).collect()
}

/// The array dataset holds 0..100000 as i64, shaped (1000, 10, 10); row `r`
/// begins with the value `100 * r`.
fn array_values(start_row: usize, stop_row: usize) -> Vec<i64> {
    ((start_row * 100) as i64..(stop_row * 100) as i64).collect()
}

fn write_fixture(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("test.ptc");

    let array: Vec<u8> = array_values(0, ARRAY_ROWS)
        .iter()
        .flat_map(|v| v.to_ne_bytes())
        .collect();

    let mut table = Vec::new();
    for row in 0..TABLE_ROWS {
        table.extend_from_slice(&col_a_values(row));
        table.extend_from_slice(&(row as f64).to_ne_bytes());
        table.extend_from_slice(&(row as f64 / 2.0).to_ne_bytes());
        table.extend_from_slice(&col_c_value(row).to_ne_bytes());
    }

    let mut builder = ColFileBuilder::new();
    builder
        .add_array(ARRAY_PATH, ScalarKind::Int64, &[ARRAY_ROWS, 10, 10], &array)
        .unwrap()
        .add_table(TABLE_PATH, &table_row_type(), TABLE_ROWS, &table, &["col_c"])
        .unwrap()
        .write(&path)
        .unwrap();
    path
}

#[test]
fn random_access_round_trips_every_slice() {
    let _serial = fork_lock();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir);

    let reader = Reader::<ColFile>::open(&path).unwrap();
    let dataset = reader.get_dataset(ARRAY_PATH).unwrap();
    let stage = dataset.create_stage(&[2]).unwrap();

    let mut indices: Vec<usize> = (0..ARRAY_ROWS).step_by(2).collect();
    indices.shuffle(&mut rand::thread_rng());

    for idx in indices {
        let req = reader
            .request(dataset.slice(idx as i64..idx as i64 + 2), &stage)
            .unwrap();
        let out = req.copy().unwrap();
        assert_eq!(out.shape(), &[2, 10, 10]);
        assert_eq!(out.to_vec::<i64>().unwrap(), array_values(idx, idx + 2));
    }

    reader.close(true);
}

#[test]
fn oversize_result_raises_shared_memory() {
    let _serial = fork_lock();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir);

    let reader = Reader::<ColFile>::open(&path).unwrap();
    let dataset = reader.get_dataset(ARRAY_PATH).unwrap();
    // A stage for 10 rows cannot host the whole dataset.
    let stage = dataset.create_stage(&[10]).unwrap();

    let req = reader
        .request(dataset.read(None, None, None), &stage)
        .unwrap();
    let err = req.copy().unwrap_err();
    assert!(err.is_shared_memory(), "got {err}");

    // The failure is local to its request; the reader keeps serving.
    let req = reader.request(dataset.slice(0..10), &stage).unwrap();
    assert_eq!(req.copy().unwrap().to_vec::<i64>().unwrap(), array_values(0, 10));

    reader.close(true);
}

#[test]
fn index_fusion_spellings_read_the_same_bytes() {
    let _serial = fork_lock();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir);

    let reader = Reader::<ColFile>::open(&path).unwrap();
    let table = reader.get_dataset(TABLE_PATH).unwrap();
    let stage = table.create_stage(&[5]).unwrap();

    let spellings = [
        table.col("col_a").slice(30..35),
        table.slice(30..35).field("col_a"),
        table
            .index(IndexKey::Field("col_a".into()))
            .unwrap()
            .slice(30..35),
    ];

    let mut results = Vec::new();
    for spelling in spellings {
        let op = spelling.build();
        assert!(
            matches!(op, paratables::Op::Read { ref col, .. } if col.as_deref() == Some("col_a")),
            "spelling did not fuse to a column read: {op:?}"
        );
        let req = reader.request(op, &stage).unwrap();
        results.push(req.copy().unwrap());
    }

    let expected: Vec<u8> = (30..35).flat_map(col_a_values).collect();
    for out in &results {
        assert_eq!(out.shape(), &[5, 4, 3]);
        assert_eq!(out.data(), &expected[..]);
    }

    reader.close(true);
}

#[test]
fn unordered_generator_covers_the_dataset() {
    let _serial = fork_lock();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir);

    let streamer = Streamer::<ColFile>::new(&path);
    let rows = streamer
        .get_generator(ARRAY_PATH, &QueueOptions::default())
        .unwrap();

    let mut firsts: Vec<i64> = rows
        .map(|row| row.unwrap().scalar_at::<i64>(0).unwrap())
        .collect();
    assert_eq!(firsts.len(), ARRAY_ROWS);

    firsts.sort_unstable();
    let expected: Vec<i64> = (0..ARRAY_ROWS as i64).map(|r| r * 100).collect();
    assert_eq!(firsts, expected);
}

#[test]
fn ordered_generator_is_disk_ordered() {
    let _serial = fork_lock();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir);

    let streamer = Streamer::<ColFile>::new(&path);
    let rows = streamer
        .get_generator(ARRAY_PATH, &QueueOptions::default().ordered(true))
        .unwrap();

    let firsts: Vec<i64> = rows
        .map(|row| row.unwrap().scalar_at::<i64>(0).unwrap())
        .collect();
    assert_eq!(firsts.len(), ARRAY_ROWS);
    assert!(firsts.windows(2).all(|w| w[0] < w[1]), "not disk-ordered");
}

#[test]
fn cyclic_stream_repeats_the_dataset() {
    let _serial = fork_lock();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir);

    let num_cycles = 2;
    let streamer = Streamer::<ColFile>::new(&path);
    let rows = streamer
        .get_generator(
            ARRAY_PATH,
            &QueueOptions::default().cyclic(true).with_block_size(45),
        )
        .unwrap();

    let mut counts: HashMap<i64, usize> = HashMap::new();
    for row in rows.take(num_cycles * ARRAY_ROWS) {
        *counts.entry(row.unwrap().scalar_at::<i64>(0).unwrap()).or_default() += 1;
    }

    assert_eq!(counts.len(), ARRAY_ROWS);
    assert!(counts.values().all(|&n| n == num_cycles));
}

#[test]
fn concurrent_consumers_partition_the_stream() {
    let _serial = fork_lock();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir);

    let streamer = Streamer::<ColFile>::new(&path);
    let queue = Arc::new(
        streamer
            .get_queue(ARRAY_PATH, &QueueOptions::default().with_block_size(50))
            .unwrap(),
    );

    let collected = Arc::new(Mutex::new(Vec::new()));
    std::thread::scope(|s| {
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            let collected = Arc::clone(&collected);
            s.spawn(move || loop {
                match queue.get() {
                    StreamItem::Closed => break,
                    StreamItem::Block(req) => {
                        let block = req.copy().unwrap();
                        let mut firsts: Vec<i64> = block
                            .rows()
                            .map(|row| row.scalar_at::<i64>(0).unwrap())
                            .collect();
                        collected.lock().unwrap().append(&mut firsts);
                    }
                }
            });
        }
    });

    let mut firsts = collected.lock().unwrap().clone();
    assert_eq!(firsts.len(), ARRAY_ROWS);
    firsts.sort_unstable();
    let expected: Vec<i64> = (0..ARRAY_ROWS as i64).map(|r| r * 100).collect();
    assert_eq!(firsts, expected);
}

#[test]
fn worker_crash_does_not_hang_the_stream() {
    let _serial = fork_lock();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir);

    let streamer = Streamer::<ColFile>::new(&path);
    let queue = streamer
        .get_queue(ARRAY_PATH, &QueueOptions::default().with_block_size(50))
        .unwrap();

    let mut firsts: Vec<i64> = Vec::new();
    let mut consume = |req: paratables::Request| {
        let block = req.copy().unwrap();
        firsts.extend(block.rows().map(|row| row.scalar_at::<i64>(0).unwrap()));
    };

    // Take one block, then kill a worker mid-scan.
    match queue.get() {
        StreamItem::Block(req) => consume(req),
        StreamItem::Closed => panic!("stream closed before the first block"),
    }
    let victim = queue.worker_pids()[0];
    // SAFETY: victim is one of our own worker children.
    unsafe { libc::kill(victim, libc::SIGKILL) };

    // The remaining workers finish the stream and the queue terminates.
    loop {
        match queue.get() {
            StreamItem::Closed => break,
            StreamItem::Block(req) => consume(req),
        }
    }

    // At most the crashed worker's in-flight block is missing, and nothing
    // is duplicated.
    let unique: std::collections::HashSet<i64> = firsts.iter().copied().collect();
    assert_eq!(unique.len(), firsts.len(), "duplicated rows after crash");
    assert!(firsts.len() >= ARRAY_ROWS - 2 * 50, "lost too many rows: {}", firsts.len());
    assert!(firsts.iter().all(|v| v % 100 == 0));
}

#[test]
fn copy_equals_scoped_view() {
    let _serial = fork_lock();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir);

    let reader = Reader::<ColFile>::open(&path).unwrap();
    let dataset = reader.get_dataset(ARRAY_PATH).unwrap();
    let stage = dataset.create_stage(&[3]).unwrap();

    let copied = reader
        .request(dataset.slice(21..24), &stage)
        .unwrap()
        .copy()
        .unwrap();

    let guard = reader
        .request(dataset.slice(21..24), &stage)
        .unwrap()
        .scoped_unsafe()
        .unwrap();
    assert_eq!(guard.to_owned_array(), copied);
    assert_eq!(guard.shape(), &[3, 10, 10]);
    drop(guard);

    let proxy = reader
        .request(dataset.slice(21..24), &stage)
        .unwrap()
        .scoped_proxy()
        .unwrap();
    assert_eq!(proxy.copy().unwrap(), copied);
    proxy.release();
    assert!(matches!(proxy.copy(), Err(Error::Released)));

    reader.close(true);
}

#[test]
fn sorted_and_predicate_reads() {
    let _serial = fork_lock();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir);

    let reader = Reader::<ColFile>::open(&path).unwrap();
    let table = reader.get_dataset(TABLE_PATH).unwrap();
    let stage = table.create_stage(&[TABLE_ROWS as i64]).unwrap();

    // Sorted scan, restricted to the sort column itself.
    let sorted = reader
        .request(
            table.read_sorted("col_c", true, None, None, None).field("col_c"),
            &stage,
        )
        .unwrap()
        .copy()
        .unwrap();
    let values = sorted.to_f64_vec().unwrap();
    assert_eq!(values.len(), TABLE_ROWS);
    assert!(values.windows(2).all(|w| w[0] <= w[1]));

    // Predicate scan with a typed condition variable.
    let threshold = 0.5f32;
    let hits = reader
        .request(
            table.where_(
                "col_c > x",
                &[("x", ScalarValue::Float32(threshold))],
                None,
                None,
                None,
            ),
            &stage,
        )
        .unwrap()
        .copy()
        .unwrap();
    let expected = (0..TABLE_ROWS)
        .filter(|&row| col_c_value(row) > threshold)
        .count();
    assert_eq!(hits.len(), expected);

    // Point selection of one column.
    let picked = reader
        .request(table.read_coordinates(&[10, 3, 7]).field("col_a"), &stage)
        .unwrap()
        .copy()
        .unwrap();
    let expected: Vec<u8> = [10usize, 3, 7].iter().flat_map(|&r| col_a_values(r)).collect();
    assert_eq!(picked.data(), &expected[..]);

    reader.close(true);
}

#[test]
fn oversize_keys_travel_in_the_stage() {
    let _serial = fork_lock();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir);

    let reader = Reader::<ColFile>::open(&path).unwrap();
    let dataset = reader.get_dataset(ARRAY_PATH).unwrap();

    // 200 coordinates serialize past the queue's slot size, so the key is
    // staged in the result buffer's trailing bytes.
    let coords: Vec<i64> = (0..200).map(|k| (k * 5) % ARRAY_ROWS as i64).collect();
    let stage = dataset.create_stage(&[200]).unwrap();

    let out = reader
        .request(dataset.read_coordinates(&coords), &stage)
        .unwrap()
        .copy()
        .unwrap();
    assert_eq!(out.shape(), &[200, 10, 10]);
    let expected: Vec<i64> = coords
        .iter()
        .flat_map(|&r| array_values(r as usize, r as usize + 1))
        .collect();
    assert_eq!(out.to_vec::<i64>().unwrap(), expected);

    reader.close(true);
}

#[test]
fn remainder_rows_are_recoverable() {
    let _serial = fork_lock();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir);

    let streamer = Streamer::<ColFile>::new(&path);
    let tail = streamer.get_remainder(ARRAY_PATH, Some(64)).unwrap();
    // 1000 = 15 * 64 + 40.
    assert_eq!(tail.shape(), &[40, 10, 10]);
    assert_eq!(tail.to_vec::<i64>().unwrap(), array_values(960, 1000));
}

#[test]
fn closed_reader_refuses_new_requests() {
    let _serial = fork_lock();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir);

    let reader = Reader::<ColFile>::open(&path).unwrap();
    let dataset = reader.get_dataset(ARRAY_PATH).unwrap();
    let stage = dataset.create_stage(&[1]).unwrap();

    // In-flight work still completes across close.
    let req = reader.request(dataset.slice(5..6), &stage).unwrap();
    reader.close(false);
    assert_eq!(req.copy().unwrap().to_vec::<i64>().unwrap(), array_values(5, 6));

    let err = reader.request(dataset.slice(0..1), &stage).unwrap_err();
    assert!(matches!(err, Error::ReaderClosed));
    reader.close(true);
}
