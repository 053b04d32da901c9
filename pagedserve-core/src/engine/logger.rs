#![allow(clippy::cast_precision_loss)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::info;

#[derive(Default)]
struct Counters {
    tokens_processed: AtomicUsize,
    num_running: AtomicUsize,
    num_waiting: AtomicUsize,
    num_swapped: AtomicUsize,
    num_preemptions: AtomicUsize,
    // Per mille, atomics have no float.
    gpu_usage: AtomicUsize,
}

/// Periodically reports throughput and queue depths from a background thread.
pub struct IntervalLogger {
    enable_logging: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl IntervalLogger {
    /// Starts an interval logger. Call `enable_logging` to begin the logging process.
    pub fn new(interval: Duration) -> Self {
        let enable_logging = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let t_enable_logging = enable_logging.clone();
        let t_stop = stop.clone();
        let t_counters = counters.clone();
        thread::spawn(move || loop {
            thread::sleep(interval);
            if t_stop.load(Ordering::Relaxed) {
                break;
            }
            if !t_enable_logging.load(Ordering::Relaxed) {
                continue;
            }

            let tokens_processed = t_counters.tokens_processed.swap(0, Ordering::Relaxed);
            let num_running = t_counters.num_running.load(Ordering::Relaxed);
            let num_waiting = t_counters.num_waiting.load(Ordering::Relaxed);
            let num_swapped = t_counters.num_swapped.load(Ordering::Relaxed);
            let num_preemptions = t_counters.num_preemptions.load(Ordering::Relaxed);
            let gpu_usage = t_counters.gpu_usage.load(Ordering::Relaxed);
            if tokens_processed == 0 && num_running + num_waiting + num_swapped == 0 {
                continue;
            }
            info!(
                "Throughput (T/s) {:.2}, GPU KV cache usage {:.1}%, {num_running} running, {num_waiting} waiting, {num_swapped} swapped, {num_preemptions} preemptions",
                tokens_processed as f64 / interval.as_secs_f64(),
                gpu_usage as f64 / 10.,
            );
        });

        Self {
            enable_logging,
            stop,
            counters,
        }
    }

    pub fn enable_logging(&self) {
        self.enable_logging.store(true, Ordering::Relaxed);
    }

    pub fn add_tokens_processed(&self, num_tokens: usize) {
        self.counters
            .tokens_processed
            .fetch_add(num_tokens, Ordering::Relaxed);
    }

    pub fn add_preemptions(&self, num_preemptions: usize) {
        self.counters
            .num_preemptions
            .fetch_add(num_preemptions, Ordering::Relaxed);
    }

    pub fn set_queues(&self, running: usize, waiting: usize, swapped: usize) {
        self.counters.num_running.store(running, Ordering::Relaxed);
        self.counters.num_waiting.store(waiting, Ordering::Relaxed);
        self.counters.num_swapped.store(swapped, Ordering::Relaxed);
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn set_gpu_usage(&self, usage: f64) {
        self.counters
            .gpu_usage
            .store((usage * 1000.).round() as usize, Ordering::Relaxed);
    }
}

impl Drop for IntervalLogger {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
