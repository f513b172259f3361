use signal_hook::consts::SIGINT;
use signal_hook::iterator::Signals;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Process-wide flags polled by the probe engine.
///
/// `halt` counts operator interrupts: 1 ends the current iteration and drains, 2 unwinds all
/// loops. `timedout` is the alarm of the original design: it is set when the receive deadline
/// expires without traffic and forces at least one send on the next tick.
///
/// Handlers perform no work beyond flag writes; every read happens on the engine control flow.
#[derive(Debug, Default)]
pub struct SessionFlags {
    timedout: AtomicBool,
    halt: AtomicUsize,
}

impl SessionFlags {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install the `SIGINT` handling for this process.
    ///
    /// The first two interrupts bump the halt counter; once two have been seen the default
    /// disposition is restored, so a third interrupt terminates the process.
    pub fn register(self: &Arc<Self>) -> io::Result<()> {
        let escalate = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register_conditional_default(SIGINT, Arc::clone(&escalate))?;
        let flags = Arc::clone(self);
        let mut signals = Signals::new([SIGINT])?;
        thread::spawn(move || {
            for _ in signals.forever() {
                let count = flags.halt.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(count, "interrupt");
                if count >= 2 {
                    escalate.store(true, Ordering::SeqCst);
                }
            }
        });
        Ok(())
    }

    pub fn halt_count(&self) -> usize {
        self.halt.load(Ordering::SeqCst)
    }

    /// Clear a single halt request once the current iteration has been wound down.
    pub fn clear_halt(&self) {
        let _ = self
            .halt
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn set_timedout(&self) {
        self.timedout.store(true, Ordering::SeqCst);
    }

    /// Read and consume the timeout flag.
    pub fn take_timedout(&self) -> bool {
        self.timedout.swap(false, Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn set_halt_count(&self, count: usize) {
        self.halt.store(count, Ordering::SeqCst);
    }
}
