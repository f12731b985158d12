//! Cross-mapping scenarios: producer and consumer on independent handles
//! of the same segment, the way separate processes run the queue.

use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crate::queue::ShmQueue;
use crate::segment::Segment;

static TEST_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(tag: &str) -> String {
    format!(
        "/shmq-ipc-{}-{}-{}",
        tag,
        process::id(),
        TEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Payload {
    words: [u64; 8],
}

impl Payload {
    fn filled(value: u64) -> Payload {
        Payload { words: [value; 8] }
    }
}

/// The sequenced stress run: one producer and one consumer on their own
/// mappings, every payload carrying its sequence number in all eight
/// words, growth left enabled. Nothing may be lost, reordered or torn,
/// however many grows happen along the way.
#[test]
fn fifo_sequence_across_mappings() {
    // Keeps the worst-case grown segment well under the small /dev/shm
    // some containers mount.
    const MESSAGES: u64 = 200_000;

    let name = unique_name("fifo");

    // Initialize the header from here so the worker threads never race to
    // be the first attacher.
    let mut segment = Segment::open(&name).unwrap();
    {
        let _queue = ShmQueue::<Payload>::attach(&mut segment, 64).unwrap();
    }

    let producer = {
        let name = name.clone();
        thread::spawn(move || {
            let mut segment = Segment::open(&name).unwrap();
            let mut queue = ShmQueue::<Payload>::attach(&mut segment, 64).unwrap();
            for seq in 0..MESSAGES {
                assert!(queue.push(Payload::filled(seq), true));
            }
        })
    };

    let consumer = {
        let name = name.clone();
        thread::spawn(move || {
            let mut segment = Segment::open(&name).unwrap();
            let mut queue = ShmQueue::<Payload>::attach(&mut segment, 64).unwrap();
            let mut out = Payload::filled(0);
            for seq in 0..MESSAGES {
                while !queue.pop(&mut out) {
                    std::hint::spin_loop();
                }
                assert_eq!(out, Payload::filled(seq));
            }
            assert!(queue.empty());
            assert!(queue.capacity().is_power_of_two());
        })
    };

    producer.join().unwrap();
    consumer.join().unwrap();
    segment.unlink();
}

/// With growth disabled the queue degrades to a bounded channel: the
/// producer backs off on false and nothing is lost.
#[test]
fn bounded_fifo_without_growth() {
    const MESSAGES: u64 = 100_000;

    let name = unique_name("bounded");
    let mut segment = Segment::open(&name).unwrap();
    {
        let _queue = ShmQueue::<Payload>::attach(&mut segment, 64).unwrap();
    }

    let producer = {
        let name = name.clone();
        thread::spawn(move || {
            let mut segment = Segment::open(&name).unwrap();
            let mut queue = ShmQueue::<Payload>::attach(&mut segment, 64).unwrap();
            for seq in 0..MESSAGES {
                while !queue.push(Payload::filled(seq), false) {
                    std::hint::spin_loop();
                }
            }
            assert_eq!(queue.capacity(), 64);
        })
    };

    let consumer = {
        let name = name.clone();
        thread::spawn(move || {
            let mut segment = Segment::open(&name).unwrap();
            let mut queue = ShmQueue::<Payload>::attach(&mut segment, 64).unwrap();
            let mut out = Payload::filled(0);
            for seq in 0..MESSAGES {
                while !queue.pop(&mut out) {
                    std::hint::spin_loop();
                }
                assert_eq!(out, Payload::filled(seq));
            }
        })
    };

    producer.join().unwrap();
    consumer.join().unwrap();

    assert_eq!(segment.size(), 8192);
    segment.unlink();
}
