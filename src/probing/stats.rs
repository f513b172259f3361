use crate::probing::types::{Sequence, Window};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

/// The transient send failure classes tallied per interval.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendFailure {
    BufferFull,
    Refused,
}

/// One entry of the optional per-packet time-series (`-r`).
#[derive(Debug, Clone, Copy)]
pub enum SeqEvent {
    Sent(Sequence, SystemTime),
    Received(Sequence, SystemTime),
    Boundary(SystemTime),
}

impl SeqEvent {
    const fn time(&self) -> SystemTime {
        match self {
            Self::Sent(_, t) | Self::Received(_, t) | Self::Boundary(t) => *t,
        }
    }
}

/// Minimum, maximum and mean of the inferred round-trip times.
#[derive(Debug, Default, Clone, Copy)]
pub struct RttSummary {
    min: Option<Duration>,
    max: Option<Duration>,
    total: Duration,
    count: usize,
}

impl RttSummary {
    fn record(&mut self, rtt: Duration) {
        self.min = Some(self.min.map_or(rtt, |min| min.min(rtt)));
        self.max = Some(self.max.map_or(rtt, |max| max.max(rtt)));
        self.total += rtt;
        self.count += 1;
    }

    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        if self.count == 0 {
            None
        } else {
            Some(self.total / self.count as u32)
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Counters {
    sent: usize,
    buffer_full: usize,
    refused: usize,
    received: usize,
    duplicates: usize,
    out_of_order: usize,
    rtt: RttSummary,
}

/// Per-sequence accounting for one destination attempt.
///
/// Send and receive timestamps are kept keyed by sequence so loss, duplication, reordering and
/// round-trip times can be inferred; counters are kept per 1-second interval and in aggregate.
#[derive(Debug)]
pub struct ProbeStatistics {
    target: IpAddr,
    window: Window,
    send_times: HashMap<u32, SystemTime>,
    recv_counts: HashMap<u32, usize>,
    max_recv_seq: Sequence,
    interval: Counters,
    total: Counters,
    time_series: Option<Vec<SeqEvent>>,
    started: Option<SystemTime>,
}

impl ProbeStatistics {
    #[must_use]
    pub fn new(target: IpAddr, window: Window, record_seq_time: bool) -> Self {
        Self {
            target,
            window,
            send_times: HashMap::new(),
            recv_counts: HashMap::new(),
            max_recv_seq: Sequence(0),
            interval: Counters::default(),
            total: Counters::default(),
            time_series: record_seq_time.then(Vec::new),
            started: None,
        }
    }

    pub fn record_send(&mut self, sequence: Sequence, sent: SystemTime) {
        self.started.get_or_insert(sent);
        self.send_times.insert(sequence.0, sent);
        self.interval.sent += 1;
        self.total.sent += 1;
        if let Some(series) = self.time_series.as_mut() {
            series.push(SeqEvent::Sent(sequence, sent));
        }
    }

    pub fn record_send_failure(&mut self, failure: SendFailure) {
        match failure {
            SendFailure::BufferFull => {
                self.interval.buffer_full += 1;
                self.total.buffer_full += 1;
            }
            SendFailure::Refused => {
                self.interval.refused += 1;
                self.total.refused += 1;
            }
        }
    }

    pub fn record_recv(&mut self, sequence: Sequence, received: SystemTime) {
        self.interval.received += 1;
        self.total.received += 1;
        let seen = self.recv_counts.entry(sequence.0).or_insert(0);
        *seen += 1;
        let duplicate = *seen > 1;
        if duplicate {
            self.interval.duplicates += 1;
            self.total.duplicates += 1;
        }
        if sequence < self.max_recv_seq {
            self.interval.out_of_order += 1;
            self.total.out_of_order += 1;
        } else {
            self.max_recv_seq = sequence;
        }
        if !duplicate {
            if let Some(sent) = self.send_times.get(&sequence.0) {
                let rtt = received.duration_since(*sent).unwrap_or_default();
                self.interval.rtt.record(rtt);
                self.total.rtt.record(rtt);
            }
        }
        if let Some(series) = self.time_series.as_mut() {
            series.push(SeqEvent::Received(sequence, received));
        }
    }

    pub fn record_interval_boundary(&mut self, time: SystemTime) {
        if let Some(series) = self.time_series.as_mut() {
            series.push(SeqEvent::Boundary(time));
        }
    }

    /// Print and reset the counters of the interval that just ended.
    pub fn print_interval(&mut self) {
        let c = &self.interval;
        println!(
            "sent {} ({} buffer-full, {} refused) recv {} dup {} out-of-order {} rtt {}",
            c.sent,
            c.buffer_full,
            c.refused,
            c.received,
            c.duplicates,
            c.out_of_order,
            format_rtt(c.rtt),
        );
        self.interval = Counters::default();
    }

    /// Print the aggregate report for the destination attempt.
    pub fn print_summary(&self) {
        let c = &self.total;
        println!("--- {} mping statistics ---", self.target);
        println!(
            "{} packets transmitted (window {}), {} received, {} duplicates, {} out-of-order, {:.1}% loss",
            c.sent,
            self.window.0,
            c.received,
            c.duplicates,
            c.out_of_order,
            self.loss_percent(),
        );
        if c.buffer_full > 0 || c.refused > 0 {
            println!(
                "send failures: {} buffer-full, {} refused",
                c.buffer_full, c.refused
            );
        }
        println!("rtt min/avg/max = {}", format_rtt(c.rtt));
    }

    /// Dump the per-packet time-series recorded with `-r`.
    ///
    /// Times are relative to the first recorded event; a negative sequence denotes a receive and
    /// sequence 0 (never assigned to a probe) marks an interval boundary.
    pub fn print_sequence_times(&self) {
        let Some(series) = self.time_series.as_ref() else {
            return;
        };
        let Some(base) = series.first().map(SeqEvent::time) else {
            return;
        };
        for event in series {
            let rel = event.time().duration_since(base).unwrap_or_default();
            match event {
                SeqEvent::Sent(sequence, _) => {
                    println!("{}.{:06} {}", rel.as_secs(), rel.subsec_micros(), sequence.0);
                }
                SeqEvent::Received(sequence, _) => {
                    println!(
                        "{}.{:06} -{}",
                        rel.as_secs(),
                        rel.subsec_micros(),
                        sequence.0
                    );
                }
                SeqEvent::Boundary(_) => {
                    println!("{}.{:06} 0", rel.as_secs(), rel.subsec_micros());
                }
            }
        }
    }

    /// Percentage of transmitted probes for which no reply was ever paired.
    #[must_use]
    pub fn loss_percent(&self) -> f64 {
        if self.total.sent == 0 {
            return 0.0;
        }
        let paired = self
            .recv_counts
            .keys()
            .filter(|seq| self.send_times.contains_key(seq))
            .count();
        (self.total.sent.saturating_sub(paired)) as f64 * 100.0 / self.total.sent as f64
    }

    #[must_use]
    pub fn total_sent(&self) -> usize {
        self.total.sent
    }

    #[must_use]
    pub fn total_received(&self) -> usize {
        self.total.received
    }

    #[must_use]
    pub fn duplicates(&self) -> usize {
        self.total.duplicates
    }

    #[must_use]
    pub fn out_of_order(&self) -> usize {
        self.total.out_of_order
    }

    #[must_use]
    pub fn send_failures(&self) -> (usize, usize) {
        (self.total.buffer_full, self.total.refused)
    }

    #[must_use]
    pub fn aggregate_rtt(&self) -> RttSummary {
        self.total.rtt
    }
}

fn format_rtt(rtt: RttSummary) -> String {
    match (rtt.min, rtt.mean(), rtt.max) {
        (Some(min), Some(mean), Some(max)) => format!(
            "{:.3}/{:.3}/{:.3} ms",
            min.as_secs_f64() * 1e3,
            mean.as_secs_f64() * 1e3,
            max.as_secs_f64() * 1e3
        ),
        _ => String::from("-/-/- ms"),
    }
}
