use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use atbus_channel::{MemRing, RingConf, RingError};
use rand::Rng;

const MAX_PAYLOAD: usize = 1024;

fn now_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn encode(producer: u32, seq: u32, len: usize) -> Vec<u8> {
    let mut msg = vec![0u8; len.max(8)];
    msg[..4].copy_from_slice(&producer.to_le_bytes());
    msg[4..8].copy_from_slice(&seq.to_le_bytes());
    for (i, b) in msg[8..].iter_mut().enumerate() {
        *b = (seq as usize + i) as u8;
    }
    msg
}

fn check_body(msg: &[u8]) -> (u32, u32) {
    let producer = u32::from_le_bytes(msg[..4].try_into().unwrap());
    let seq = u32::from_le_bytes(msg[4..8].try_into().unwrap());
    for (i, b) in msg[8..].iter().enumerate() {
        assert_eq!(*b, (seq as usize + i) as u8, "payload corrupted at {i}");
    }
    (producer, seq)
}

/// One producer, one consumer: every message arrives, in order, intact.
#[test]
fn single_producer_single_consumer() {
    const MESSAGES: u32 = 1_000_000;

    let conf = RingConf { write_timeout_ms: 60_000, ..RingConf::default() };
    let ring = MemRing::create(1 << 20, Some(conf)).unwrap();
    let chan = ring.channel();
    let start = Instant::now();

    std::thread::scope(|s| {
        s.spawn(|| {
            let mut rng = rand::rng();
            for seq in 0..MESSAGES {
                let len = rng.random_range(8..=MAX_PAYLOAD);
                let msg = encode(0, seq, len);
                loop {
                    match chan.send(&msg) {
                        Ok(()) => break,
                        Err(RingError::BuffLimit { .. }) => std::thread::yield_now(),
                        Err(other) => panic!("producer hit {other}"),
                    }
                }
            }
        });

        let mut out = vec![0u8; MAX_PAYLOAD];
        let mut expect = 0u32;
        while expect < MESSAGES {
            match chan.recv(&mut out, now_ms(start)) {
                Ok(n) => {
                    let (producer, seq) = check_body(&out[..n]);
                    assert_eq!(producer, 0);
                    assert_eq!(seq, expect, "out of order");
                    expect += 1;
                }
                Err(RingError::NoData) => std::thread::yield_now(),
                Err(other) => panic!("consumer hit {other}"),
            }
        }
    });

    let stats = chan.stats();
    assert_eq!(stats.block_bad_count, 0);
    assert_eq!(stats.node_bad_count, 0);
}

/// Several producers, one consumer: per-producer sequences arrive
/// strictly increasing; recovery errors show up only as counted stats.
#[test]
fn multi_producer_single_consumer() {
    const WRITERS: usize = 4;
    const PER_WRITER: u32 = 40_000;

    let conf = RingConf { write_timeout_ms: 50, ..RingConf::default() };
    let ring = MemRing::create(1 << 20, Some(conf)).unwrap();
    let chan = ring.channel();
    let start = Instant::now();
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        let mut handles = Vec::new();
        for producer in 0..WRITERS as u32 {
            let chan = &chan;
            handles.push(s.spawn(move || {
                let mut rng = rand::rng();
                let mut delivered = 0u32;
                for seq in 0..PER_WRITER {
                    let len = rng.random_range(8..=MAX_PAYLOAD);
                    let msg = encode(producer, seq, len);
                    loop {
                        match chan.send(&msg) {
                            Ok(()) => {
                                delivered += 1;
                                break;
                            }
                            Err(RingError::BuffLimit { .. }) => std::thread::yield_now(),
                            // conflicting write detected, message dropped
                            Err(RingError::BadBlockWriteSeqId) => break,
                            Err(other) => panic!("producer {producer} hit {other}"),
                        }
                    }
                }
                delivered
            }));
        }

        let consumer = s.spawn(|| {
            let mut out = vec![0u8; MAX_PAYLOAD];
            let mut last_seq = [None::<u32>; WRITERS];
            let mut received = 0u64;
            let mut idle_since = None::<u64>;
            loop {
                match chan.recv(&mut out, now_ms(start)) {
                    Ok(n) => {
                        idle_since = None;
                        let (producer, seq) = check_body(&out[..n]);
                        let slot = &mut last_seq[producer as usize];
                        if let Some(prev) = *slot {
                            assert!(seq > prev, "producer {producer}: {seq} after {prev}");
                        }
                        *slot = Some(seq);
                        received += 1;
                    }
                    Err(RingError::NoData) => {
                        // after producers stop, linger long enough for the
                        // write-timeout salvage to release any stuck slot
                        if done.load(Ordering::Acquire) {
                            let now = now_ms(start);
                            match idle_since {
                                None => idle_since = Some(now),
                                Some(t) if now - t > 200 => break,
                                Some(_) => {}
                            }
                        }
                        std::thread::yield_now();
                    }
                    Err(
                        RingError::NodeTimeout
                        | RingError::BadBlockFastCheck
                        | RingError::BadBlockNodeNum
                        | RingError::BadBlockBuffSize,
                    ) => {
                        // salvaged corruption is fine, it is counted
                        idle_since = None;
                    }
                    Err(other) => panic!("consumer hit {other}"),
                }
            }
            received
        });

        let mut delivered_total = 0u64;
        for h in handles {
            delivered_total += u64::from(h.join().unwrap());
        }
        done.store(true, Ordering::Release);

        let received = consumer.join().unwrap();
        assert!(received <= delivered_total);
        assert!(
            received + chan.stats().block_bad_count as u64 >= delivered_total,
            "lost messages beyond counted salvage: received {received}, \
             delivered {delivered_total}, stats {:?}",
            chan.stats()
        );
    });
}
