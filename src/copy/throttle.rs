//! Approximate cap on I/O operations per second across all copy workers.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

#[derive(Debug)]
struct TokenState {
    tokens: u64,
    enabled: bool,
}

/// Token bucket refilled by a [`Ticker`]. Each batch read takes one token.
#[derive(Debug)]
pub struct Throttle {
    per_tick: u64,
    state: Mutex<TokenState>,
    refilled: Condvar,
    waits: AtomicU64,
}

impl Throttle {
    pub fn new(per_tick: u64) -> Self {
        Self {
            per_tick,
            state: Mutex::new(TokenState {
                tokens: per_tick,
                enabled: per_tick > 0,
            }),
            refilled: Condvar::new(),
            waits: AtomicU64::new(0),
        }
    }

    /// Take a token, blocking until the next refill when none are left.
    pub fn acquire(&self) {
        let mut state = self.state.lock();
        while state.enabled && state.tokens == 0 {
            self.waits.fetch_add(1, Ordering::Relaxed);
            self.refilled.wait(&mut state);
        }
        if state.enabled {
            state.tokens -= 1;
        }
    }

    pub fn refill(&self) {
        let mut state = self.state.lock();
        state.tokens = self.per_tick;
        self.refilled.notify_all();
    }

    /// Turn throttling off and release every waiter.
    pub fn disable(&self) {
        let mut state = self.state.lock();
        state.enabled = false;
        self.refilled.notify_all();
    }

    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }
}

/// Background thread refilling a [`Throttle`] once per interval.
#[derive(Debug)]
pub struct Ticker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn start(throttle: Arc<Throttle>, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("io-throttle".into())
            .spawn(move || {
                let (flag, cv) = &*thread_stop;
                let mut stopped = flag.lock();
                loop {
                    cv.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                    throttle.refill();
                }
                throttle.disable();
                debug!("throttle ticker stopped");
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        {
            let (flag, cv) = &*self.stop;
            *flag.lock() = true;
            cv.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
