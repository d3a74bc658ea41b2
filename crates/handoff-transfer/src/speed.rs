/// Byte-rate counter shared between the network task and the stats tick.
/// Lock-free so the writer can count every frame without contention.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct SpeedInspector {
    window_bytes: AtomicU64,
}

impl SpeedInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: usize) {
        self.window_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Reset the window and render its rate over `elapsed`.
    pub fn drain(&self, elapsed: Duration) -> String {
        let bytes = self.window_bytes.swap(0, Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
        format_speed(rate)
    }
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    if bytes_per_sec >= MB {
        format!("{:.2} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= KB {
        format!("{:.2} KB/s", bytes_per_sec / KB)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}
