use std::collections::VecDeque;

use log::{debug, warn};

use crate::frame::DecodedFrame;

const DEFAULT_FRAME_DURATION_US: i64 = 20_000;
/// Consecutive timestamp deltas outside (0, 100 ms) don't update the
/// frame-duration estimate.
const FRAME_DELTA_MAX_US: i64 = 100_000;
const PACKET_HISTORY_SIZE: usize = 300;
const LATENCY_HISTORY_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The buffer was at capacity, or the scheduler was cleared.
    Overflow,
    /// The frame could no longer be shown on time.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Bypass,
    Empty,
    Priming,
    Steady,
    OverflowResync,
}

/// Per-frame timing captured at enqueue time.
#[derive(Debug, Clone, Copy)]
pub struct FrameTiming {
    pub arrival_us: i64,
    pub decode_us: i64,
    pub keyframe: bool,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Target buffering in milliseconds. 0 enables bypass mode.
    pub buffer_delay_ms: u32,
    /// Hard capacity. When `None` it is derived from the delay:
    /// `max(30, ceil(buffer_delay_ms / 1000 · 60 · 2))`.
    pub max_buffer: Option<usize>,
    /// Check drift every this many dequeued frames.
    pub drift_check_interval: u32,
    pub drift_threshold_ms: u32,
    pub debug_logging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            buffer_delay_ms: 100,
            max_buffer: None,
            drift_check_interval: 150,
            drift_threshold_ms: 30,
            debug_logging: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PacketTimingEntry {
    pub arrival_us: i64,
    pub interval_ms: f64,
    pub stream_ts_us: i64,
    pub keyframe: bool,
    pub decode_latency_ms: f64,
    pub dropped: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyTelemetry {
    pub decode_ms: f64,
    pub buffer_wait_ms: f64,
    pub total_ms: f64,
    pub avg_decode_ms: f64,
    pub avg_buffer_wait_ms: f64,
    pub avg_total_ms: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerTelemetry {
    pub state: SchedulerState,
    pub current_buffer_size: usize,
    pub current_buffer_ms: f64,
    pub avg_buffer_ms: f64,
    pub target_buffer_ms: f64,
    pub stream_frame_duration_us: i64,
    pub dropped_frames: u64,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub drift_corrections: u64,
    pub latency: LatencyTelemetry,
}

pub type DropCallback = Box<dyn FnMut(DecodedFrame, DropReason) + Send>;

#[derive(Debug, Clone, Copy)]
struct SyncPoint {
    start_real_us: i64,
    start_stream_us: i64,
}

struct Entry {
    frame: DecodedFrame,
    stream_ts_us: i64,
    arrival_us: i64,
    decode_us: i64,
}

#[derive(Clone, Copy)]
struct Latency {
    decode_ms: f64,
    buffer_wait_ms: f64,
    total_ms: f64,
}

/// The jitter buffer between decode and display. Absorbs delivery jitter,
/// maps stream time onto the caller's clock, drops frames that cannot be
/// shown any more and keeps live telemetry.
///
/// All clocks are caller-supplied microseconds; the scheduler never reads
/// wall time itself.
pub struct FrameScheduler {
    buffer_delay_ms: u32,
    explicit_max_buffer: Option<usize>,
    max_buffer: usize,
    drift_check_interval: u32,
    drift_threshold_ms: u32,
    debug_logging: bool,
    on_drop: Option<DropCallback>,

    entries: VecDeque<Entry>,
    sync: Option<SyncPoint>,
    overflowed: bool,
    frame_duration_us: i64,
    last_arrival_us: Option<i64>,

    size_samples: VecDeque<usize>,
    dequeues_since_drift_check: u32,
    latency_history: VecDeque<Latency>,
    last_latency: Option<Latency>,
    packet_history: VecDeque<PacketTimingEntry>,

    total_enqueued: u64,
    total_dequeued: u64,
    dropped_frames: u64,
    drift_corrections: u64,
}

fn derived_max_buffer(buffer_delay_ms: u32) -> usize {
    // Two seconds' worth of 60 fps frames per second of delay, at least 30.
    (buffer_delay_ms as usize * 120).div_ceil(1000).max(30)
}

impl FrameScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let max_buffer = config
            .max_buffer
            .unwrap_or_else(|| derived_max_buffer(config.buffer_delay_ms));

        Self {
            buffer_delay_ms: config.buffer_delay_ms,
            explicit_max_buffer: config.max_buffer,
            max_buffer,
            drift_check_interval: config.drift_check_interval.max(1),
            drift_threshold_ms: config.drift_threshold_ms,
            debug_logging: config.debug_logging,
            on_drop: None,
            entries: VecDeque::new(),
            sync: None,
            overflowed: false,
            frame_duration_us: DEFAULT_FRAME_DURATION_US,
            last_arrival_us: None,
            size_samples: VecDeque::new(),
            dequeues_since_drift_check: 0,
            latency_history: VecDeque::new(),
            last_latency: None,
            packet_history: VecDeque::new(),
            total_enqueued: 0,
            total_dequeued: 0,
            dropped_frames: 0,
            drift_corrections: 0,
        }
    }

    /// Receives every dropped frame together with the reason, exactly once
    /// per frame. Without a callback dropped frames are released directly.
    pub fn set_on_drop(&mut self, on_drop: DropCallback) {
        self.on_drop = Some(on_drop);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn buffer_delay_ms(&self) -> u32 {
        self.buffer_delay_ms
    }

    pub fn state(&self) -> SchedulerState {
        if self.buffer_delay_ms == 0 {
            SchedulerState::Bypass
        } else if self.sync.is_some() {
            SchedulerState::Steady
        } else if self.overflowed {
            SchedulerState::OverflowResync
        } else if self.entries.is_empty() {
            SchedulerState::Empty
        } else {
            SchedulerState::Priming
        }
    }

    pub fn enqueue(&mut self, frame: DecodedFrame, stream_ts_us: i64, timing: FrameTiming) {
        let interval_ms = self
            .last_arrival_us
            .map(|previous| (timing.arrival_us - previous) as f64 / 1000.0)
            .unwrap_or(0.0);
        self.last_arrival_us = Some(timing.arrival_us);

        self.packet_history.push_back(PacketTimingEntry {
            arrival_us: timing.arrival_us,
            interval_ms,
            stream_ts_us,
            keyframe: timing.keyframe,
            decode_latency_ms: (timing.decode_us - timing.arrival_us) as f64 / 1000.0,
            dropped: false,
        });
        if self.packet_history.len() > PACKET_HISTORY_SIZE {
            self.packet_history.pop_front();
        }

        if let Some(last) = self.entries.back() {
            let delta = stream_ts_us - last.stream_ts_us;
            if delta > 0 && delta < FRAME_DELTA_MAX_US {
                self.frame_duration_us = delta;
            }
        }

        if self.entries.len() >= self.max_buffer {
            if let Some(oldest) = self.entries.pop_front() {
                if self.debug_logging {
                    debug!(
                        "[Scheduler]: buffer full, dropping frame at {}",
                        oldest.stream_ts_us
                    );
                }
                self.drop_entry(oldest, DropReason::Overflow);
            }
            // The buffer may only resync once fresh frames have arrived.
            self.sync = None;
            self.overflowed = true;
            self.size_samples.clear();
        }

        self.entries.push_back(Entry {
            frame,
            stream_ts_us,
            arrival_us: timing.arrival_us,
            decode_us: timing.decode_us,
        });
        self.total_enqueued += 1;
    }

    pub fn dequeue(&mut self, now_us: i64) -> Option<DecodedFrame> {
        if self.entries.is_empty() {
            return None;
        }

        if self.buffer_delay_ms == 0 {
            return self.dequeue_bypass(now_us);
        }

        let frame_duration_ms = self.frame_duration_us as f64 / 1000.0;
        let priming_ms = (f64::from(self.buffer_delay_ms) * 0.5).min(frame_duration_ms);
        if self.buffered_ms() < priming_ms {
            return None;
        }

        let delay_us = i64::from(self.buffer_delay_ms) * 1000;
        let sync = match self.sync {
            Some(sync) => sync,
            None => {
                let sync = SyncPoint {
                    start_real_us: now_us,
                    start_stream_us: self.entries.front()?.stream_ts_us + delay_us,
                };
                self.sync = Some(sync);
                self.overflowed = false;
                sync
            }
        };

        let expected = sync.start_stream_us + (now_us - sync.start_real_us) - delay_us;

        // Highest buffered index that is already due. The buffer is sorted,
        // and equal timestamps keep the older entry in front (FIFO).
        let mut due = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.stream_ts_us <= expected {
                due = Some(index);
            } else {
                break;
            }
        }
        let due = due?;

        // Catch up, retaining a one-frame tolerance.
        if due > 1 {
            for _ in 0..due - 1 {
                if let Some(stale) = self.entries.pop_front() {
                    self.drop_entry(stale, DropReason::Skip);
                }
            }
        }

        let entry = self.entries.pop_front()?;
        self.record_latency(&entry, now_us);
        self.total_dequeued += 1;

        self.size_samples.push_back(self.entries.len());
        if self.size_samples.len() > self.drift_check_interval as usize {
            self.size_samples.pop_front();
        }
        self.maybe_correct_drift();

        Some(entry.frame)
    }

    /// Bypass mode: the newest frame wins, everything older is skipped.
    fn dequeue_bypass(&mut self, now_us: i64) -> Option<DecodedFrame> {
        let latest = self.entries.pop_back()?;

        while let Some(stale) = self.entries.pop_front() {
            self.drop_entry(stale, DropReason::Skip);
        }

        self.record_latency(&latest, now_us);
        self.total_dequeued += 1;

        Some(latest.frame)
    }

    /// Drops every buffered frame and forgets the sync point.
    pub fn clear(&mut self) {
        while let Some(entry) = self.entries.pop_front() {
            self.drop_entry(entry, DropReason::Overflow);
        }
        self.sync = None;
        self.overflowed = false;
        self.size_samples.clear();
        self.last_arrival_us = None;
    }

    pub fn set_buffer_delay(&mut self, buffer_delay_ms: u32) {
        let crossed_bypass = (self.buffer_delay_ms == 0) != (buffer_delay_ms == 0);

        self.buffer_delay_ms = buffer_delay_ms;
        if self.explicit_max_buffer.is_none() {
            self.max_buffer = derived_max_buffer(buffer_delay_ms);
        }

        if crossed_bypass {
            self.sync = None;
            self.size_samples.clear();
        }
    }

    pub fn reset_stats(&mut self) {
        self.total_enqueued = 0;
        self.total_dequeued = 0;
        self.dropped_frames = 0;
        self.drift_corrections = 0;
        self.dequeues_since_drift_check = 0;
        self.size_samples.clear();
        self.latency_history.clear();
        self.last_latency = None;
        self.packet_history.clear();
        self.last_arrival_us = None;
    }

    pub fn telemetry(&self) -> SchedulerTelemetry {
        let frame_duration_ms = self.frame_duration_us as f64 / 1000.0;
        let avg_buffer_ms = if self.size_samples.is_empty() {
            self.entries.len() as f64 * frame_duration_ms
        } else {
            let avg_size =
                self.size_samples.iter().sum::<usize>() as f64 / self.size_samples.len() as f64;
            avg_size * frame_duration_ms
        };

        let mut latency = LatencyTelemetry::default();
        if let Some(last) = self.last_latency.as_ref() {
            latency.decode_ms = last.decode_ms;
            latency.buffer_wait_ms = last.buffer_wait_ms;
            latency.total_ms = last.total_ms;
        }
        if !self.latency_history.is_empty() {
            let count = self.latency_history.len() as f64;
            latency.avg_decode_ms =
                self.latency_history.iter().map(|entry| entry.decode_ms).sum::<f64>() / count;
            latency.avg_buffer_wait_ms =
                self.latency_history.iter().map(|entry| entry.buffer_wait_ms).sum::<f64>() / count;
            latency.avg_total_ms =
                self.latency_history.iter().map(|entry| entry.total_ms).sum::<f64>() / count;
        }

        SchedulerTelemetry {
            state: self.state(),
            current_buffer_size: self.entries.len(),
            current_buffer_ms: self.buffered_ms(),
            avg_buffer_ms,
            target_buffer_ms: f64::from(self.buffer_delay_ms),
            stream_frame_duration_us: self.frame_duration_us,
            dropped_frames: self.dropped_frames,
            total_enqueued: self.total_enqueued,
            total_dequeued: self.total_dequeued,
            drift_corrections: self.drift_corrections,
            latency,
        }
    }

    /// Ordered window of recent packet timing, oldest first, at most 300
    /// entries.
    pub fn packet_timing(&self) -> impl Iterator<Item = &PacketTimingEntry> {
        self.packet_history.iter()
    }

    fn buffered_ms(&self) -> f64 {
        match (self.entries.front(), self.entries.back()) {
            (Some(front), Some(back)) => (back.stream_ts_us - front.stream_ts_us) as f64 / 1000.0,
            _ => 0.0,
        }
    }

    fn drop_entry(&mut self, entry: Entry, reason: DropReason) {
        if let Some(timing) = self
            .packet_history
            .iter_mut()
            .rev()
            .find(|timing| timing.stream_ts_us == entry.stream_ts_us && !timing.dropped)
        {
            timing.dropped = true;
        }

        self.dropped_frames += 1;

        match self.on_drop.as_mut() {
            Some(on_drop) => on_drop(entry.frame, reason),
            None => entry.frame.close(),
        }
    }

    fn record_latency(&mut self, entry: &Entry, now_us: i64) {
        let latency = Latency {
            decode_ms: (entry.decode_us - entry.arrival_us) as f64 / 1000.0,
            buffer_wait_ms: (now_us - entry.decode_us) as f64 / 1000.0,
            total_ms: (now_us - entry.arrival_us) as f64 / 1000.0,
        };

        self.latency_history.push_back(latency);
        if self.latency_history.len() > LATENCY_HISTORY_SIZE {
            self.latency_history.pop_front();
        }
        self.last_latency = Some(latency);
    }

    fn maybe_correct_drift(&mut self) {
        self.dequeues_since_drift_check += 1;
        if self.dequeues_since_drift_check < self.drift_check_interval {
            return;
        }
        self.dequeues_since_drift_check = 0;

        if self.size_samples.is_empty() {
            return;
        }

        let avg_size =
            self.size_samples.iter().sum::<usize>() as f64 / self.size_samples.len() as f64;
        let frame_duration_ms = self.frame_duration_us as f64 / 1000.0;
        let avg_buffer_ms = avg_size * frame_duration_ms;
        let drift_ms = avg_buffer_ms - f64::from(self.buffer_delay_ms);

        let effective_threshold =
            f64::from(self.drift_threshold_ms).min(f64::from(self.buffer_delay_ms) * 0.5);

        if drift_ms.abs() > effective_threshold {
            if let Some(sync) = self.sync.as_mut() {
                // Positive drift: the buffer is growing, consume faster.
                sync.start_stream_us += (drift_ms * 1000.0) as i64;
                self.size_samples.clear();
                self.drift_corrections += 1;

                warn!(
                    "[Scheduler]: corrected {drift_ms:.1} ms of drift ({} total)",
                    self.drift_corrections
                );
            }
        }
    }
}
