//! Human-readable statistics blocks.
//!
//! This output is for operators watching a run; it is not a stable API.

use servalrx_core::{PacketClass, PixelMode};
use servalrx_io::{ConnectionStats, IngressSummary};
use servalrx_pipeline::{StatsSnapshot, NUM_CHIPS};

/// Prints the periodic statistics block.
pub fn periodic(snap: &StatsSnapshot) {
    println!("\n[Periodic Statistics Update]");
    statistics(snap);
    println!();
}

/// Prints the short status line.
pub fn status(hits_delta: u64, seconds: u64) {
    println!("[Status] Processed {hits_delta} hits in last {seconds}s");
}

/// Prints the final summary, always emitted at shutdown.
pub fn final_summary(
    snap: &StatsSnapshot,
    connection: Option<ConnectionStats>,
    file: Option<&IngressSummary>,
    queue_dropped: Option<u64>,
) {
    println!("\n=== FINAL SUMMARY ===");
    statistics(snap);
    byte_accounting(snap);

    if let Some(conn) = connection {
        println!("Connection statistics:");
        println!("  Connections:        {}", conn.connections);
        println!("  Disconnects:        {}", conn.disconnects);
        println!("  Bytes received:     {}", conn.bytes_received);
        println!(
            "  Incomplete dropped: {} bytes",
            conn.bytes_dropped_incomplete
        );
        if let Some(dropped) = queue_dropped {
            println!("  Buffers dropped:    {dropped}");
        }
    }
    if let Some(file) = file {
        println!("File statistics:");
        println!("  Bytes delivered:    {}", file.bytes_delivered);
        println!("  Words delivered:    {}", file.words_delivered);
        println!(
            "  Incomplete dropped: {} bytes",
            file.bytes_dropped_incomplete
        );
    }

    recent_hits(snap);
}

fn statistics(snap: &StatsSnapshot) {
    println!("Total hits: {}", snap.total_hits);
    println!("Total chunks: {}", snap.total_chunks);
    println!(
        "Total TDC events: {} (TDC1 {}, TDC2 {})",
        snap.total_tdc_events, snap.total_tdc1, snap.total_tdc2
    );
    println!("Total decode errors: {}", snap.total_decode_errors);
    println!("Total fractional errors: {}", snap.total_fractional_errors);
    println!("Total unknown packets: {}", snap.total_unknown_packets);
    if snap.started_mid_stream {
        println!("Note: stream started mid-chunk");
    }

    println!(
        "Hit rate: {:.2} Hz (cumulative {:.2} Hz)",
        snap.hit_rate_hz, snap.cumulative_hit_rate_hz
    );
    println!(
        "TDC1 rate: {:.2} Hz (cumulative {:.2} Hz), TDC2 rate: {:.2} Hz",
        snap.tdc1_rate_hz, snap.cumulative_tdc1_rate_hz, snap.tdc2_rate_hz
    );

    // Per-chip rates need not sum to the detector-wide rate when chips
    // have different active windows.
    let any_chip = snap.chips.iter().any(|c| c.seen);
    if any_chip {
        println!("Per-chip rates:");
        for chip in 0..NUM_CHIPS {
            if !snap.chips[chip].seen {
                continue;
            }
            println!(
                "  Chip {chip}: {} hits ({:.2} Hz), {} TDC1 ({:.2} Hz)",
                snap.chips[chip].hits,
                snap.chip_hit_rates_hz[chip],
                snap.chips[chip].tdc1,
                snap.chip_tdc1_rates_hz[chip],
            );
        }
    }

    if snap.reorder.total_packets > 0 {
        println!("Reorder statistics:");
        println!("  Packets seen:       {}", snap.reorder.total_packets);
        println!("  In order:           {}", snap.reorder.packets_in_order);
        println!("  Reordered:          {}", snap.reorder.packets_reordered);
        println!(
            "  Max distance:       {}",
            snap.reorder.max_reorder_distance
        );
        println!("  Overflows:          {}", snap.reorder.buffer_overflows);
        println!(
            "  Dropped (too old):  {}",
            snap.reorder.packets_dropped_too_old
        );
    }
}

fn byte_accounting(snap: &StatsSnapshot) {
    println!("Byte accounting ({} bytes total):", snap.total_bytes_accounted);
    for class in PacketClass::ALL {
        let count = snap.packet_counts[class as usize];
        if count == 0 {
            continue;
        }
        println!(
            "  {:<18} {:>12} packets {:>14} bytes",
            class.label(),
            count,
            snap.packet_bytes[class as usize]
        );
    }
}

fn recent_hits(snap: &StatsSnapshot) {
    if snap.recent_hits.is_empty() {
        return;
    }
    println!("=== Recent Hits (last {}) ===", snap.recent_hits.len());
    for hit in &snap.recent_hits {
        let mode = match hit.mode {
            PixelMode::CountFb => "count_fb",
            PixelMode::Standard => "standard",
        };
        println!(
            "Chip {}, X={}, Y={}, ToA={} (1.5625ns units), ToT={} ns [{mode}]",
            hit.chip_index, hit.x, hit.y, hit.toa_ticks, hit.tot_ns
        );
    }
}
