use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::linking::publish_patch;
use crate::runtime::PluginRuntime;

struct SavedPatch {
    addr: usize,
    original: [u8; 4],
}

/// Steals preemption points from running code by retargeting backward
/// branches at their recorded loop edges. The host drives `trigger_timeout`
/// from a timer of its choosing; generated timeout thunks call back through
/// `notify_timeout_received` when the preemption lands.
#[derive(Default)]
pub struct WatchdogTimer {
    timeout_pending: AtomicBool,
    patched: Mutex<Vec<SavedPatch>>,
}

impl WatchdogTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a timeout has been raised but not yet taken by a thunk.
    pub fn timeout_pending(&self) -> bool {
        self.timeout_pending.load(Ordering::Acquire)
    }

    /// Called before compiling from a thunk. Returns `false` while a timeout
    /// is pending: freshly compiled code would lack the loop-edge patches
    /// the rest of the runtime is carrying.
    pub fn handle_interrupt(&self) -> bool {
        !self.timeout_pending()
    }

    /// Redirects every loop edge of every compiled function in `runtime` to
    /// its timeout thunk.
    pub fn trigger_timeout(&self, runtime: &PluginRuntime) {
        if self.timeout_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut patched = self.patched.lock().expect("watchdog lock poisoned");
        runtime.for_each_compiled(|fun| {
            let base = fun.chunk().address() as usize;
            for edge in fun.loop_edges() {
                let addr = (base + edge.offset as usize - 4) as *mut u8;
                let mut original = [0u8; 4];
                unsafe {
                    std::ptr::copy_nonoverlapping(addr, original.as_mut_ptr(), 4);
                    publish_patch(addr, &edge.disp32.to_le_bytes());
                }
                patched.push(SavedPatch { addr: addr as usize, original });
            }
        });
        tracing::warn!(edges = patched.len(), "watchdog timeout raised");
    }

    /// Called by the generated timeout path once the preemption has been
    /// taken: restores the original branch targets and clears the state.
    pub fn notify_timeout_received(&self) {
        let mut patched = self.patched.lock().expect("watchdog lock poisoned");
        for patch in patched.drain(..) {
            unsafe {
                publish_patch(patch.addr as *mut u8, &patch.original);
            }
        }
        self.timeout_pending.store(false, Ordering::Release);
        tracing::debug!("watchdog timeout acknowledged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_blocks_while_pending() {
        let watchdog = WatchdogTimer::new();
        assert!(watchdog.handle_interrupt());
        watchdog.timeout_pending.store(true, Ordering::Release);
        assert!(!watchdog.handle_interrupt());
        watchdog.notify_timeout_received();
        assert!(watchdog.handle_interrupt());
    }
}
