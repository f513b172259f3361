use crate::probing::config::ProbeConfig;
use crate::probing::error::{ProbeError, ProbeResult, SendError};
use crate::probing::net::Network;
use crate::probing::signal::SessionFlags;
use crate::probing::stats::{ProbeStatistics, SendFailure};
use crate::probing::types::{TimeToLive, Window};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

/// Most new in-flight slots opened in a single tick step.
///
/// Caps catch-up aggressiveness so one very late reply cannot trigger a send storm.
const MAX_OPEN_PER_TICK: i64 = 10;

/// New in-flight slots per tick step under TCP-style slow start.
const SLOW_START_OPEN_PER_TICK: i64 = 2;

/// The receive budget armed at the start of every tick.
///
/// A blocked receive never waits past this; expiry sets the `timedout` flag and forces a
/// re-alignment to the wall clock, the same observable effect as the 2-second alarm of a
/// signal-driven design.
const RECV_GUARD: Duration = Duration::from_secs(2);

/// Drives probes toward one destination.
///
/// Four nested loops turn the immutable config into send/receive calls: TTL sweep, packet-size
/// sweep, window ramp/steady-state and the 1-second tick that maintains the in-flight window.
pub struct Prober<N: Network> {
    config: ProbeConfig,
    network: N,
    stats: ProbeStatistics,
    flags: Arc<SessionFlags>,
    state: state::EngineState,
}

impl<N: Network> Prober<N> {
    pub fn new(config: ProbeConfig, network: N, flags: Arc<SessionFlags>) -> Self {
        let stats = ProbeStatistics::new(config.dest_addr, config.win_size, config.record_seq_time);
        Self {
            config,
            network,
            stats,
            flags,
            state: state::EngineState::new(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &ProbeStatistics {
        &self.stats
    }

    /// Run one destination attempt to completion.
    pub fn run(&mut self) -> ProbeResult<()> {
        self.state.reset();
        self.flags.set_timedout();
        self.ttl_loop()
    }

    /// Outermost loop: probe at a fixed TTL, or sweep TTLs 1..=max.
    ///
    /// A first interrupt ends the current TTL iteration (cleared below so a sweep continues); a
    /// second unwinds the whole run.
    fn ttl_loop(&mut self) -> ProbeResult<()> {
        let max_ttl = self.config.ttl.0;
        let first_ttl = if self.config.sweep_ttl { 1 } else { max_ttl };
        for ttl in first_ttl..=max_ttl {
            if self.flags.halt_count() > 1 {
                break;
            }
            if max_ttl > 0 {
                self.network.set_ttl(TimeToLive(ttl))?;
            }
            info!(ttl, "probing");
            self.size_loop()?;
            if self.config.sweep_ttl {
                info!(ttl, from = ?self.network.from_addr(), "ttl done");
            }
            self.flags.clear_halt();
        }
        Ok(())
    }

    /// Second loop: visit each packet size (a single size unless sweeping).
    ///
    /// Sequence state is deliberately not reset between sizes; late replies to the previous size
    /// still advance `mrseq`.
    fn size_loop(&mut self) -> ProbeResult<()> {
        for size in self.config.probe_sizes() {
            if self.flags.halt_count() > 0 {
                break;
            }
            self.state.set_cur_size(size);
            info!(packet_size = size.0, "packet size");
            self.window_loop()?;
            info!(packet_size = size.0, "packet size done");
        }
        Ok(())
    }

    /// Third loop: drive the in-flight target through its schedule.
    ///
    /// Without `-f` the window ramps 1,2,..,win and finishes with a drain tick at 0 to collect
    /// trailing replies. With `-f` the window is held at win: indefinitely when this is the only
    /// loop, for a single tick when nested inside a TTL or size sweep.
    fn window_loop(&mut self) -> ProbeResult<()> {
        let win = u32::from(self.config.win_size.0);
        if self.config.loop_forever {
            info!(window = win, "window");
        }
        let mut intran: u32 = if self.config.loop_forever { win } else { 1 };
        loop {
            if self.flags.halt_count() > 0 {
                intran = 0;
            }
            if intran > win {
                if self.config.loop_forever {
                    if self.config.sweep_ttl || self.config.size_sweep.is_some() {
                        break;
                    }
                    intran = win;
                } else {
                    intran = 0;
                }
            }
            if intran > 0 && self.flags.take_timedout() {
                self.state.force_send();
            }
            if !self.config.loop_forever {
                info!(window = intran, "window");
            }
            self.interval_loop(Window(intran as u16))?;
            self.stats.record_interval_boundary(SystemTime::now());
            self.stats.print_interval();
            if intran == 0 {
                break;
            }
            intran += 1;
        }
        if self.config.loop_forever {
            info!(window = win, "window done");
        }
        Ok(())
    }

    /// Innermost loop: one ~1-second tick.
    ///
    /// Aligned to the wall-clock second; each step tops the window up, receives one reply and
    /// re-checks the clock. The tick ends when the second advances or the receive budget expires.
    fn interval_loop(&mut self, intran: Window) -> ProbeResult<()> {
        let mut now = SystemTime::now();
        if self.state.tick() == 0 {
            let second = epoch_secs(now);
            while epoch_secs(now) <= second {
                now = SystemTime::now();
            }
            self.state.set_tick(second);
        }
        self.state.advance_tick();
        let deadline = Instant::now() + RECV_GUARD;
        loop {
            now = SystemTime::now();
            if epoch_secs(now) > self.state.tick() {
                break;
            }
            if self.flags.halt_count() > 1 {
                break;
            }
            let mut need_send = compute_need_send(
                self.state.in_flight(),
                i64::from(intran.0),
                i64::from(self.config.burst),
                self.state.burst_started(),
                self.config.slow_start,
                self.state.take_mustsend(),
            );
            let mut interrupted = false;
            while need_send > 0 {
                let sequence = self.state.next_sequence();
                match self.network.send_probe(sequence, self.state.cur_size()) {
                    Ok(_) => {
                        let sent_at = SystemTime::now();
                        self.stats.record_send(sequence, sent_at);
                        if self.config.burst > 0
                            && intran.0 >= self.config.burst
                            && !self.state.burst_started()
                            && self.state.in_flight() == i64::from(intran.0)
                        {
                            debug!(window = intran.0, burst = self.config.burst, "burst armed");
                            self.state.latch_burst();
                        }
                        need_send -= 1;
                    }
                    Err(SendError::Interrupted) => {
                        interrupted = true;
                        break;
                    }
                    Err(SendError::BufferFull) => {
                        error!("kernel send buffer exhausted");
                        self.state.retract();
                        self.stats.record_send_failure(SendFailure::BufferFull);
                        break;
                    }
                    Err(SendError::Refused) => {
                        self.state.retract();
                        self.stats.record_send_failure(SendFailure::Refused);
                    }
                    Err(SendError::Fatal(err)) => {
                        error!(%err, "send failed");
                        return Err(ProbeError::Io(err));
                    }
                }
            }
            if interrupted {
                error!("send interrupted");
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.timed_out();
                break;
            }
            match self.network.recv_probe(remaining)? {
                Some(reply) => {
                    let received_at = SystemTime::now();
                    self.stats.record_recv(reply.sequence, received_at);
                    if reply.sequence.0 > self.state.sseq() {
                        warn!(
                            mrseq = self.state.mrseq(),
                            rseq = reply.sequence.0,
                            sseq = self.state.sseq(),
                            "received sequence beyond anything sent"
                        );
                    } else {
                        self.state.set_mrseq(reply.sequence.0);
                    }
                }
                None => {
                    self.timed_out();
                    break;
                }
            }
        }
        Ok(())
    }

    /// The receive budget expired without traffic: flag it and force clock re-alignment.
    fn timed_out(&mut self) {
        self.flags.set_timedout();
        self.state.clear_tick();
    }

    #[cfg(test)]
    fn burst_latched(&self) -> bool {
        self.state.burst_started()
    }

    #[cfg(test)]
    fn sequence_state(&self) -> (u32, u32) {
        (self.state.sseq(), self.state.mrseq())
    }
}

/// How many probes this step must send to honor the window and burst schedule.
///
/// Before the burst latch: close the gap to the window, capped per tick (2 in slow start, 10
/// otherwise); at or over the window, send only a forced keep-alive probe. After the latch:
/// send a full burst whenever the in-flight count has fallen a burst below the window.
fn compute_need_send(
    in_flight: i64,
    intran: i64,
    burst: i64,
    burst_started: bool,
    slow_start: bool,
    mustsend: bool,
) -> i64 {
    if burst == 0 || !burst_started {
        let maxopen = if slow_start {
            SLOW_START_OPEN_PER_TICK
        } else {
            MAX_OPEN_PER_TICK
        };
        let diff = in_flight - intran;
        if diff < 0 {
            maxopen.min(-diff)
        } else {
            i64::from(mustsend)
        }
    } else {
        let diff = in_flight + burst - intran;
        if diff > 0 {
            i64::from(mustsend)
        } else {
            burst
        }
    }
}

fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Mutable engine state, reset at the start of each destination attempt.
///
/// Contained in a sub-module so mutations only happen via methods.
mod state {
    use crate::probing::types::{PacketSize, Sequence};

    #[derive(Debug)]
    pub struct EngineState {
        /// Highest sequence handed out for a send attempt.
        sseq: u32,
        /// Highest in-order reply sequence observed; never exceeds `sseq`.
        mrseq: u32,
        /// Send at least one probe this tick even if the window is closed.
        mustsend: bool,
        /// Latched once the window has filled with burst configured; never cleared until reset.
        start_burst: bool,
        cur_size: PacketSize,
        /// Wall-clock second at which the current tick ends; 0 means unaligned.
        tick: u64,
    }

    impl EngineState {
        pub fn new() -> Self {
            Self {
                sseq: 0,
                mrseq: 0,
                mustsend: false,
                start_burst: false,
                cur_size: PacketSize(0),
                tick: 0,
            }
        }

        pub fn reset(&mut self) {
            *self = Self::new();
        }

        pub fn next_sequence(&mut self) -> Sequence {
            self.sseq += 1;
            Sequence(self.sseq)
        }

        /// Undo the last sequence increment after a retractable send failure.
        pub fn retract(&mut self) {
            self.sseq -= 1;
        }

        pub fn in_flight(&self) -> i64 {
            i64::from(self.sseq) - i64::from(self.mrseq)
        }

        pub fn sseq(&self) -> u32 {
            self.sseq
        }

        pub fn mrseq(&self) -> u32 {
            self.mrseq
        }

        /// Record a reply sequence; a late reply below the current high-water mark is kept
        /// out-of-order in the accounting but never walks `mrseq` backward.
        pub fn set_mrseq(&mut self, mrseq: u32) {
            self.mrseq = self.mrseq.max(mrseq);
        }

        pub fn force_send(&mut self) {
            self.mustsend = true;
        }

        pub fn take_mustsend(&mut self) -> bool {
            std::mem::take(&mut self.mustsend)
        }

        pub fn latch_burst(&mut self) {
            self.start_burst = true;
        }

        pub fn burst_started(&self) -> bool {
            self.start_burst
        }

        pub fn cur_size(&self) -> PacketSize {
            self.cur_size
        }

        pub fn set_cur_size(&mut self, size: PacketSize) {
            self.cur_size = size;
        }

        pub fn tick(&self) -> u64 {
            self.tick
        }

        pub fn set_tick(&mut self, tick: u64) {
            self.tick = tick;
        }

        pub fn advance_tick(&mut self) {
            self.tick += 1;
        }

        pub fn clear_tick(&mut self) {
            self.tick = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probing::config::SizeSweep;
    use crate::probing::net::{MockNetwork, Reply};
    use crate::probing::types::{PacketSize, Sequence};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(win: u16) -> ProbeConfig {
        ProbeConfig {
            win_size: Window(win),
            packet_size: PacketSize(64),
            ..Default::default()
        }
    }

    fn reply(sequence: u32) -> Reply {
        Reply {
            sequence: Sequence(sequence),
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    /// A receive that never yields traffic and honors a shortened timeout.
    fn silent_recv(network: &mut MockNetwork) {
        network.expect_recv_probe().returning(|_| {
            std::thread::sleep(Duration::from_millis(5));
            Ok(None)
        });
    }

    #[test]
    fn test_need_send_closes_window_gap() {
        assert_eq!(1, compute_need_send(0, 1, 0, false, false, true));
        assert_eq!(4, compute_need_send(0, 4, 0, false, false, false));
        assert_eq!(10, compute_need_send(0, 24, 0, false, false, false));
        assert_eq!(3, compute_need_send(5, 8, 0, false, false, false));
    }

    #[test]
    fn test_need_send_at_or_over_window_is_mustsend_only() {
        assert_eq!(0, compute_need_send(4, 4, 0, false, false, false));
        assert_eq!(1, compute_need_send(4, 4, 0, false, false, true));
        assert_eq!(0, compute_need_send(6, 4, 0, false, false, false));
    }

    #[test]
    fn test_need_send_slow_start_caps_opens() {
        assert_eq!(2, compute_need_send(0, 24, 0, false, true, false));
        assert_eq!(1, compute_need_send(3, 4, 0, false, true, false));
    }

    #[test]
    fn test_need_send_burst_fires_when_window_has_room_for_it() {
        // burst configured but not yet latched: normal window arithmetic
        assert_eq!(4, compute_need_send(0, 4, 2, false, false, false));
        // latched: a full burst once in-flight has dropped a burst below the window
        assert_eq!(4, compute_need_send(6, 10, 4, true, false, false));
        assert_eq!(4, compute_need_send(0, 10, 4, true, false, false));
        // latched but no room: only a forced probe
        assert_eq!(0, compute_need_send(8, 10, 4, true, false, false));
        assert_eq!(1, compute_need_send(8, 10, 4, true, false, true));
    }

    #[test]
    fn test_ramp_sends_one_probe_per_window_step() {
        let mut network = MockNetwork::new();
        network
            .expect_send_probe()
            .times(2)
            .returning(|_, _| Ok(64));
        silent_recv(&mut network);
        let flags = SessionFlags::new();
        let mut prober = Prober::new(config(2), network, flags);
        prober.run().unwrap();
        // windows 1 and 2 each open one slot; the drain tick sends nothing
        assert_eq!(2, prober.stats().total_sent());
        assert_eq!(0, prober.stats().total_received());
        assert_eq!(100.0, prober.stats().loss_percent());
    }

    #[test]
    fn test_steady_window_fills_then_sends_forced_probe() {
        let mut network = MockNetwork::new();
        network.expect_send_probe().returning(|_, _| Ok(64));
        let flags = SessionFlags::new();
        let halt = Arc::clone(&flags);
        let recvs = AtomicUsize::new(0);
        network.expect_recv_probe().returning(move |_| {
            if recvs.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                halt.set_halt_count(1);
            }
            std::thread::sleep(Duration::from_millis(5));
            Ok(None)
        });
        let mut config = config(4);
        config.loop_forever = true;
        let mut prober = Prober::new(config, network, flags);
        prober.run().unwrap();
        // tick 1 opens the full window, tick 2 adds only the forced keep-alive probe
        assert_eq!(5, prober.stats().total_sent());
        assert_eq!((5, 0), prober.sequence_state());
    }

    #[test]
    fn test_burst_latches_once_window_filled() {
        let mut network = MockNetwork::new();
        network.expect_send_probe().returning(|_, _| Ok(64));
        let flags = SessionFlags::new();
        let halt = Arc::clone(&flags);
        let recvs = AtomicUsize::new(0);
        network.expect_recv_probe().returning(move |_| {
            if recvs.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                halt.set_halt_count(1);
            }
            std::thread::sleep(Duration::from_millis(5));
            Ok(None)
        });
        let mut config = config(2);
        config.loop_forever = true;
        config.burst = 2;
        let mut prober = Prober::new(config, network, flags);
        prober.run().unwrap();
        assert!(prober.burst_latched());
        assert_eq!(3, prober.stats().total_sent());
    }

    #[test]
    fn test_reply_beyond_sseq_never_advances_mrseq() {
        let mut network = MockNetwork::new();
        network.expect_send_probe().returning(|_, _| Ok(64));
        let flags = SessionFlags::new();
        let halt = Arc::clone(&flags);
        let recvs = AtomicUsize::new(0);
        network.expect_recv_probe().returning(move |_| {
            match recvs.fetch_add(1, Ordering::SeqCst) + 1 {
                1 => Ok(Some(reply(99))),
                2 => Ok(Some(reply(1))),
                _ => {
                    halt.set_halt_count(1);
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(None)
                }
            }
        });
        let mut config = config(1);
        config.loop_forever = true;
        let mut prober = Prober::new(config, network, flags);
        prober.run().unwrap();
        let (sseq, mrseq) = prober.sequence_state();
        // the anomalous 99 was recorded but mrseq only tracks real sends
        assert_eq!(1, mrseq);
        assert!(sseq < 99);
        assert_eq!(2, prober.stats().total_received());
        assert_eq!(1, prober.stats().out_of_order());
    }

    #[test]
    fn test_out_of_order_reply_never_regresses_mrseq() {
        let mut network = MockNetwork::new();
        network.expect_send_probe().returning(|_, _| Ok(64));
        let flags = SessionFlags::new();
        let halt = Arc::clone(&flags);
        let recvs = AtomicUsize::new(0);
        network.expect_recv_probe().returning(move |_| {
            match recvs.fetch_add(1, Ordering::SeqCst) + 1 {
                1 => Ok(Some(reply(2))),
                2 => Ok(Some(reply(1))),
                _ => {
                    halt.set_halt_count(1);
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(None)
                }
            }
        });
        let mut config = config(2);
        config.loop_forever = true;
        let mut prober = Prober::new(config, network, flags);
        prober.run().unwrap();
        let (sseq, mrseq) = prober.sequence_state();
        // the late reply for 1 is within range (<= sseq) yet must not undo progress
        assert_eq!(2, mrseq);
        assert_eq!(4, sseq);
        assert_eq!(2, prober.stats().total_received());
        assert_eq!(1, prober.stats().out_of_order());
    }

    #[test]
    fn test_buffer_full_retracts_sequence() {
        let mut network = MockNetwork::new();
        let sends = AtomicUsize::new(0);
        network
            .expect_send_probe()
            .returning(move |_, _| match sends.fetch_add(1, Ordering::SeqCst) + 1 {
                1 => Ok(64),
                _ => Err(SendError::BufferFull),
            });
        let flags = SessionFlags::new();
        let halt = Arc::clone(&flags);
        network.expect_recv_probe().returning(move |_| {
            halt.set_halt_count(1);
            std::thread::sleep(Duration::from_millis(5));
            Ok(None)
        });
        let mut config = config(3);
        config.loop_forever = true;
        let mut prober = Prober::new(config, network, flags);
        prober.run().unwrap();
        assert_eq!(1, prober.stats().total_sent());
        assert_eq!((1, 0), prober.stats().send_failures());
        assert_eq!((1, 0), prober.sequence_state());
    }

    #[test]
    fn test_second_interrupt_aborts_without_probing() {
        let network = MockNetwork::new();
        let flags = SessionFlags::new();
        flags.set_halt_count(2);
        let mut prober = Prober::new(config(4), network, flags);
        prober.run().unwrap();
        assert_eq!(0, prober.stats().total_sent());
    }

    #[test]
    fn test_size_sweep_visits_each_size_once_with_forever_window() {
        let mut network = MockNetwork::new();
        let sizes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&sizes);
        network.expect_send_probe().returning(move |_, size| {
            seen.lock().unwrap().push(size.0);
            Ok(64)
        });
        silent_recv(&mut network);
        let mut config = config(1);
        config.loop_forever = true;
        config.size_sweep = Some(SizeSweep::Selected);
        config.packet_size = PacketSize(0);
        let mut prober = Prober::new(config, network, SessionFlags::new());
        prober.run().unwrap();
        let seen = sizes.lock().unwrap();
        // one single-tick window iteration per swept size, in table order
        assert_eq!(&[64, 100, 500, 1000, 1500, 2000, 3000, 4000][..], &seen[..]);
    }
}
