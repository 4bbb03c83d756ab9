//! End-to-end ingest tests: a local TCP sender streaming synthetic chunks
//! through the queue into the parser and worker pool, the same wiring the
//! binary uses.

use servalrx_core::packet::make_chunk_header;
use servalrx_io::{BufferQueue, TcpConfig, TcpIngress};
use servalrx_pipeline::{Aggregator, DecodeDispatcher, FrameParser};
use std::io::Write;
use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

fn make_hit(timestamp: u32, tot: u16) -> u64 {
    let toa = u64::from(timestamp & 0x3FFF);
    let spidr = u64::from(timestamp >> 14);
    0xB000_0000_0000_0000 | (toa << 30) | (u64::from(tot) << 20) | spidr
}

fn make_tdc(coarse: u64) -> u64 {
    0x6F00_0000_0000_0000 | (coarse << 9) | (1 << 5)
}

// One chunk per chip per round; the size field counts the header word.
fn synthetic_stream(rounds: u32, hits_per_chunk: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    for round in 0..rounds {
        for chip in 0..4u8 {
            let data_words = hits_per_chunk + 1;
            let header = make_chunk_header(((data_words + 1) * 8) as u16, chip);
            bytes.extend_from_slice(&header.to_le_bytes());
            bytes.extend_from_slice(&make_tdc(u64::from(round) * 10_000).to_le_bytes());
            for i in 0..hits_per_chunk {
                let ts = round * 10_000 + i * 16;
                bytes.extend_from_slice(&make_hit(ts, 4).to_le_bytes());
            }
        }
    }
    bytes
}

#[test]
fn test_tcp_stream_end_to_end() {
    let rounds = 20;
    let hits_per_chunk = 50;
    let stream = synthetic_stream(rounds, hits_per_chunk);
    let expected_hits = u64::from(rounds) * 4 * u64::from(hits_per_chunk);
    let total_bytes = stream.len() as u64;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let sender = std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        // Deliberately awkward write sizes, including mid-word splits.
        let mut offset = 0;
        for size in [7usize, 64, 333, 8, 1024].iter().cycle() {
            if offset >= stream.len() {
                break;
            }
            let end = (offset + size).min(stream.len());
            conn.write_all(&stream[offset..end]).unwrap();
            offset = end;
        }
    });

    let stop = Arc::new(AtomicBool::new(false));
    let config = TcpConfig {
        host: "127.0.0.1".to_string(),
        port,
        exit_on_disconnect: true,
        read_buffer_bytes: 4096,
        recv_buffer_bytes: 1024 * 1024,
    };
    let ingress = TcpIngress::new(config, stop);
    let counters = ingress.counters();
    let queue = Arc::new(BufferQueue::new(64));

    let receiver = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || ingress.run(&queue))
    };

    let aggregator = Arc::new(Aggregator::new(10));
    let dispatcher = Arc::new(DecodeDispatcher::new(4, Arc::clone(&aggregator)));
    let mut parser = FrameParser::new(aggregator.clone()).with_dispatcher(dispatcher.clone());

    let mut words = 0u64;
    loop {
        match queue.pop_timeout(Duration::from_millis(100)) {
            Some(buffer) => words += parser.process(&buffer) as u64,
            None => {
                if queue.is_finished() {
                    break;
                }
            }
        }
    }
    parser.finish();
    dispatcher.wait_until_idle();
    dispatcher.shutdown();
    receiver.join().unwrap().unwrap();
    sender.join().unwrap();

    let snap = aggregator.snapshot();
    assert_eq!(snap.total_hits, expected_hits);
    assert_eq!(snap.total_chunks, u64::from(rounds) * 4);
    assert_eq!(snap.total_tdc1, u64::from(rounds) * 4);
    assert_eq!(words * 8, total_bytes);
    assert_eq!(snap.total_bytes_accounted, total_bytes);
    for chip in 0..4 {
        assert_eq!(
            snap.chips[chip].hits,
            u64::from(rounds) * u64::from(hits_per_chunk)
        );
    }

    let conn_stats = counters.snapshot();
    assert_eq!(conn_stats.connections, 1);
    assert_eq!(conn_stats.bytes_received, total_bytes);
    assert_eq!(conn_stats.bytes_dropped_incomplete, 0);
    assert!(!snap.started_mid_stream);
}

#[test]
fn test_queue_overflow_sheds_whole_buffers() {
    // A tiny queue with a stalled consumer drops oldest buffers; what the
    // parser finally sees still decodes without falling out of sync,
    // because drops happen on whole delivered buffers.
    let queue = BufferQueue::new(2);
    for round in 0..10u32 {
        let mut chunk = Vec::new();
        let header = make_chunk_header(16, 0);
        chunk.extend_from_slice(&header.to_le_bytes());
        chunk.extend_from_slice(&make_hit(round, 1).to_le_bytes());
        queue.push(chunk);
    }
    queue.close();
    assert_eq!(queue.dropped(), 8);

    let aggregator = Arc::new(Aggregator::new(0));
    let mut parser = FrameParser::new(aggregator.clone());
    while let Some(buffer) = queue.pop_timeout(Duration::from_millis(1)) {
        parser.process(&buffer);
    }
    parser.finish();

    let snap = aggregator.snapshot();
    assert_eq!(snap.total_chunks, 2);
    assert_eq!(snap.total_hits, 2);
    assert!(!snap.started_mid_stream);
}
