//! Per-stream uplink metrics engine.
//!
//! The relay datapath owns one `UplinkMetrics` per media stream and offers
//! it every received media message. From a sliding window of samples the
//! engine derives expected-vs-received packet counts, duplicate counts and
//! an uplink bandwidth estimate, and periodically answers with an RTT probe
//! so the sending client can measure round-trip time. Both results are
//! emitted as small binary frames the datapath appends to its egress.
//!
//! Sequence numbers are signed 16-bit with wraparound: ordering is decided
//! by the sign of the 16-bit difference, never by widening first.

use tracing::{error, info};

use crate::message::Message;

/// Capacity of the per-stream sample buffer.
pub const STAT_BUFFER_SIZE: usize = 120;

/// Extra-type byte identifying a metrics frame.
pub const EXTRA_TYPE_METRICS: u8 = 0x02;

/// Data-type byte of an RTT probe frame.
pub const METRICS_DATA_TYPE_RTT: u8 = 0x01;

/// Data-type byte of an uplink summary frame.
pub const METRICS_DATA_TYPE_UPLINK: u8 = 0x02;

/// Size of an RTT probe frame.
pub const RTT_FRAME_SIZE: usize = 7;

/// Size of an uplink summary frame.
pub const UPLINK_FRAME_SIZE: usize = 19;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A window closes when the buffer fills or this much time has passed.
const WINDOW_INTERVAL_NS: i64 = NANOS_PER_SEC;

/// Minimum spacing between RTT probe replies.
const RTT_INTERVAL_NS: i64 = 100_000_000;

/// How many successors are examined when pairing duplicate-path samples.
const PAIR_SCAN_WINDOW: usize = 9;

/// Samples carried over into the next window after a close. Keeping the
/// tail lets bandwidth estimation work across bursty, gappy arrival.
const CARRY_OVER: usize = 20;

/// One observed media descriptor.
#[derive(Debug, Clone, Copy, Default)]
struct SampleStat {
    paired: bool,
    tid: u8,
    tseq: i16,
    bytes: u16,
    timestamp_ns: i64,
}

/// Sliding-window estimator for one media stream.
pub struct UplinkMetrics {
    stat: [SampleStat; STAT_BUFFER_SIZE],
    pos: usize,
    last_window_ns: i64,
    last_rtt_ns: i64,
    /// Per-pair throughput gate in kbit/s; pairs measured faster than this
    /// are excluded from the bandwidth estimate. `None` lets every pair
    /// contribute.
    pair_rate_gate_kbps: Option<i64>,
}

impl UplinkMetrics {
    pub fn new(now_ns: i64) -> Self {
        Self {
            stat: [SampleStat::default(); STAT_BUFFER_SIZE],
            pos: 0,
            last_window_ns: now_ns,
            last_rtt_ns: now_ns,
            pair_rate_gate_kbps: None,
        }
    }

    /// Like [`UplinkMetrics::new`] with a per-pair throughput gate.
    pub fn with_pair_rate_gate(now_ns: i64, gate_kbps: i64) -> Self {
        let mut metrics = Self::new(now_ns);
        metrics.pair_rate_gate_kbps = Some(gate_kbps);
        metrics
    }

    /// Observe one media message. Returns an uplink summary frame when a
    /// window closes with data worth reporting, an RTT probe frame when
    /// one is due, and `None` otherwise.
    pub fn process(&mut self, msg: &Message, now_ns: i64) -> Option<Vec<u8>> {
        self.stat[self.pos] = SampleStat {
            paired: false,
            tid: msg.tid,
            tseq: msg.tseq,
            bytes: msg.net_traffic_size(),
            timestamp_ns: now_ns,
        };
        self.pos += 1;

        if self.pos >= STAT_BUFFER_SIZE || now_ns - self.last_window_ns > WINDOW_INTERVAL_NS {
            self.last_window_ns = now_ns;
            self.close_window(msg)
        } else if now_ns - self.last_rtt_ns > RTT_INTERVAL_NS {
            self.last_rtt_ns = now_ns;
            Some(Self::rtt_frame(msg))
        } else {
            None
        }
    }

    fn close_window(&mut self, msg: &Message) -> Option<Vec<u8>> {
        let mut min_seq: i16 = 0;
        let mut max_seq: i16 = 0;
        let mut packet_dup: usize = 0;
        let mut acc_pairs: u32 = 0;
        let mut acc_bytes: u32 = 0;
        let mut acc_times: i64 = 0;
        let mut total_bytes: u64 = 0;

        for p in 0..self.pos {
            let sample = self.stat[p];
            total_bytes += u64::from(sample.bytes);

            // (0, 0) doubles as the uninitialised marker.
            if min_seq == 0 && max_seq == 0 {
                min_seq = sample.tseq;
                max_seq = sample.tseq;
            } else {
                if sample.tseq.wrapping_sub(max_seq) > 0 {
                    max_seq = sample.tseq;
                }
                if sample.tseq.wrapping_sub(min_seq) < 0 {
                    min_seq = sample.tseq;
                }
            }

            for q in (p + 1)..(p + 1 + PAIR_SCAN_WINDOW).min(self.pos) {
                if sample.tid != self.stat[q].tid {
                    error!(
                        tid = sample.tid,
                        other = self.stat[q].tid,
                        "inconsistent track id inside one stream window"
                    );
                }
                if sample.tseq == self.stat[q].tseq {
                    if !sample.paired {
                        // First match of an unpaired sample: the legitimate
                        // second-path copy. It feeds the bandwidth estimate.
                        self.stat[q].paired = true;
                        let delta_ns = self.stat[q].timestamp_ns - sample.timestamp_ns;
                        if self.pair_within_gate(self.stat[q].bytes, delta_ns) {
                            acc_pairs += 1;
                            acc_bytes += u32::from(self.stat[q].bytes);
                            acc_times += delta_ns;
                        }
                        break;
                    } else if !self.stat[q].paired {
                        // Surplus copy beyond the expected pair.
                        self.stat[q].paired = true;
                        packet_dup += 1;
                    }
                }
            }
        }

        let packet_recv = self.pos - packet_dup;
        let total_time_ms =
            (self.stat[self.pos - 1].timestamp_ns - self.stat[0].timestamp_ns) / 1_000_000;

        // Expected count doubles the sequence span: the datapath sends one
        // forward-error-correction copy per packet.
        let mut packet_should = max_seq.wrapping_sub(min_seq).wrapping_mul(2);
        if packet_should < 0 || (min_seq == 0 && max_seq == 0) {
            packet_should = 0;
        }

        let mut bandwidth_kbps: i64 = -1;
        if acc_pairs > 0 && acc_times > 0 {
            bandwidth_kbps = 8 * i64::from(acc_bytes) * NANOS_PER_SEC / acc_times / 1024;
        }

        info!(
            from = msg.from,
            tid = msg.tid,
            should = packet_should,
            recv = packet_recv,
            dup = packet_dup,
            bandwidth_kbps,
            pairs = acc_pairs,
            "uplink window closed"
        );

        let frame = (packet_should > 0).then(|| {
            let mut data = vec![0u8; UPLINK_FRAME_SIZE];
            data[0] = EXTRA_TYPE_METRICS;
            data[1..3].copy_from_slice(&16u16.to_be_bytes());
            data[3] = METRICS_DATA_TYPE_UPLINK;
            data[4] = msg.tid;
            data[5..9].copy_from_slice(&(total_bytes as u32).to_be_bytes());
            data[9..11].copy_from_slice(&(total_time_ms as u16).to_be_bytes());
            data[11..15].copy_from_slice(&(bandwidth_kbps as u32).to_be_bytes());
            data[15..17].copy_from_slice(&(packet_should as u16).to_be_bytes());
            data[17..19].copy_from_slice(&(packet_recv as u16).to_be_bytes());
            data
        });

        // Keep the trailing samples for the next window so estimation
        // keeps working when packets arrive in separated bursts.
        if CARRY_OVER < self.pos {
            for i in 0..CARRY_OVER {
                self.stat[i] = self.stat[self.pos - CARRY_OVER + i];
                self.stat[i].paired = false;
            }
            self.pos = CARRY_OVER;
        }

        frame
    }

    fn pair_within_gate(&self, bytes: u16, delta_ns: i64) -> bool {
        match self.pair_rate_gate_kbps {
            None => true,
            Some(gate) => {
                // bytes/ns scaled to kbit/s: bytes * 1e9 / delta / 128.
                delta_ns != 0 && i64::from(bytes) * NANOS_PER_SEC / delta_ns / 128 < gate
            }
        }
    }

    fn rtt_frame(msg: &Message) -> Vec<u8> {
        let mut data = vec![0u8; RTT_FRAME_SIZE];
        data[0] = EXTRA_TYPE_METRICS;
        data[1..3].copy_from_slice(&4u16.to_be_bytes());
        data[3] = METRICS_DATA_TYPE_RTT;
        data[4] = msg.tid;
        data[5..7].copy_from_slice(&msg.timestamp.to_be_bytes());
        data
    }
}
