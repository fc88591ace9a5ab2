// Global logging ring for the virtual disk engine

use spin::Mutex;

const MAX_LOG_ENTRIES: usize = 64;

struct LogRing {
    entries: [Option<&'static str>; MAX_LOG_ENTRIES],
    count: usize,
}

static LOG: Mutex<LogRing> = Mutex::new(LogRing {
    entries: [None; MAX_LOG_ENTRIES],
    count: 0,
});

/// Record a message. Once the ring is full the oldest entry is overwritten.
pub fn log(message: &'static str) {
    let mut ring = LOG.lock();
    let idx = ring.count % MAX_LOG_ENTRIES;
    ring.entries[idx] = Some(message);
    ring.count += 1;
}

/// Copy the retained messages, oldest first, into `out`.
///
/// Returns the number of messages written.
pub fn get_logs(out: &mut [&'static str]) -> usize {
    let ring = LOG.lock();
    let retained = ring.count.min(MAX_LOG_ENTRIES);
    let first = ring.count - retained;
    let mut written = 0;
    for seq in first..ring.count {
        if written == out.len() {
            break;
        }
        if let Some(msg) = ring.entries[seq % MAX_LOG_ENTRIES] {
            out[written] = msg;
            written += 1;
        }
    }
    written
}

pub fn log_count() -> usize {
    LOG.lock().count.min(MAX_LOG_ENTRIES)
}

/// Total messages logged since boot (or the last `clear`), including overwritten ones.
pub fn total_logged() -> usize {
    LOG.lock().count
}

pub fn clear() {
    let mut ring = LOG.lock();
    ring.entries = [None; MAX_LOG_ENTRIES];
    ring.count = 0;
}

// Macro for easier logging
#[macro_export]
macro_rules! log_info {
    ($msg:expr) => {
        $crate::logger::log($msg)
    };
}

/// Per-read diagnostics, compiled out unless the `trace` feature is on.
#[cfg(feature = "trace")]
#[macro_export]
macro_rules! log_trace {
    ($msg:expr) => {
        $crate::logger::log($msg)
    };
}

#[cfg(not(feature = "trace"))]
#[macro_export]
macro_rules! log_trace {
    ($msg:expr) => {{
        let _ = $msg;
    }};
}
