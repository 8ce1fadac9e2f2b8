use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::Fixture;
use crate::errors::PoolError;
use crate::layout::Record;
use crate::reader::{fetch, MessageReader};
use crate::writer::{insert, release, MessageWriter};

/// Both halves of the record derive from the same generation number, so a
/// reader can tell a whole record from a mix of two.
fn stamped(generation: u32) -> Record {
    Record::new(generation, ((generation as u64) << 32) | (!generation) as u64)
}

fn is_whole(record: &Record) -> bool {
    *record == Record::default() || *record == stamped(record.id)
}

#[test]
fn test_stamped_records_detect_mixing() {
    assert!(is_whole(&Record::default()));
    assert!(is_whole(&stamped(7)));
    assert!(is_whole(&stamped(u32::MAX)));
    assert!(!is_whole(&Record::new(7, stamped(8).data)));
}

#[test]
fn test_readers_never_observe_torn_records() {
    const CAPACITY: u32 = 64;
    const WRITERS: usize = 4;
    const READERS: usize = 4;

    let fixture = Fixture::new(CAPACITY);
    let stop = Arc::new(AtomicBool::new(false));
    let generation = Arc::new(AtomicUsize::new(1));

    let mut writers = Vec::new();
    for _ in 0..WRITERS {
        let writer = MessageWriter::attach(fixture.segment.clone());
        let stop = stop.clone();
        let generation = generation.clone();
        writers.push(thread::spawn(move || {
            let mut held = Vec::new();
            let mut written = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let g = generation.fetch_add(1, Ordering::Relaxed) as u32;
                match writer.insert(&stamped(g)) {
                    Ok(index) => {
                        held.push(index);
                        written += 1;
                    }
                    Err(PoolError::PoolExhausted { .. }) => {}
                    Err(e) => panic!("insert failed: {}", e),
                }
                if held.len() > (CAPACITY as usize / WRITERS) / 2 {
                    for index in held.drain(..) {
                        writer.release(index).expect("release");
                    }
                }
            }
            for index in held {
                writer.release(index).expect("release");
            }
            written
        }));
    }

    let mut readers = Vec::new();
    for r in 0..READERS {
        let reader = MessageReader::attach(fixture.segment.clone());
        let stop = stop.clone();
        readers.push(thread::spawn(move || {
            let mut torn = 0usize;
            let mut reads = 0usize;
            let mut index = r as u32;
            while !stop.load(Ordering::Relaxed) {
                let record = reader.fetch(index % CAPACITY).expect("fetch");
                if !is_whole(&record) {
                    torn += 1;
                }
                reads += 1;
                index = index.wrapping_add(7);
            }
            (reads, torn)
        }));
    }

    thread::sleep(Duration::from_millis(500));
    stop.store(true, Ordering::Relaxed);

    let written: usize = writers.into_iter().map(|w| w.join().expect("writer panicked")).sum();
    let mut reads = 0;
    for reader in readers {
        let (r, torn) = reader.join().expect("reader panicked");
        assert_eq!(torn, 0, "reader observed a torn record");
        reads += r;
    }
    assert!(written > 0 && reads > 0);

    let segment = &fixture.segment;
    assert_eq!(segment.free_count().unwrap(), CAPACITY);
    segment.verify().unwrap();
    for index in 0..CAPACITY {
        assert!(is_whole(&fetch(segment, index).unwrap()));
    }
}

#[test]
fn test_interleaved_threads_keep_the_free_list_whole() {
    const CAPACITY: u32 = 32;
    let fixture = Fixture::new(CAPACITY);

    let workers: Vec<_> = (0..8u32)
        .map(|t| {
            let segment = fixture.segment.clone();
            thread::spawn(move || {
                for round in 0..200u32 {
                    let g = t * 1_000 + round;
                    match insert(&segment, &stamped(g)) {
                        Ok(index) => {
                            assert_eq!(fetch(&segment, index).unwrap(), stamped(g));
                            release(&segment, index).unwrap();
                        }
                        Err(PoolError::PoolExhausted { .. }) => {}
                        Err(e) => panic!("insert failed: {}", e),
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(fixture.segment.free_count().unwrap(), CAPACITY);
    fixture.segment.verify().unwrap();
}
