//! Per-document outcome records and aggregate statistics
//!
//! A [`TimedEvent`] is created for every originally non-null batch slot and
//! finalized exactly once. The [`Timer`] folds finalized events into
//! cumulative counters; it may retain the individual events for percentile
//! queries or discard them to bound memory, per configuration.

use std::time::{Duration, Instant};

/// Outcome record for one synchronized document.
#[derive(Debug, Clone)]
pub struct TimedEvent {
    description: String,
    start: Instant,
    duration: Option<Duration>,
    bytes: u64,
    error: bool,
}

impl TimedEvent {
    /// Starts the clock for one document.
    pub fn begin(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            start: Instant::now(),
            duration: None,
            bytes: 0,
            error: false,
        }
    }

    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    /// Finalizes the event as a success. Consumes self so an event cannot be
    /// finalized twice.
    pub fn finish(mut self) -> Self {
        assert!(self.duration.is_none(), "event finalized twice");
        self.duration = Some(self.start.elapsed());
        self
    }

    /// Finalizes the event as a failure.
    pub fn finish_error(mut self) -> Self {
        assert!(self.duration.is_none(), "event finalized twice");
        self.duration = Some(self.start.elapsed());
        self.error = true;
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn duration(&self) -> Duration {
        self.duration.unwrap_or_default()
    }

    pub fn is_finalized(&self) -> bool {
        self.duration.is_some()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_error(&self) -> bool {
        self.error
    }
}

/// Mutable aggregate of finalized events.
#[derive(Debug)]
pub struct Timer {
    started: Instant,
    count: u64,
    errors: u64,
    bytes: u64,
    events: Option<Vec<TimedEvent>>,
}

impl Timer {
    /// `retain_events` keeps every event for percentile queries; leave it off
    /// for unbounded runs.
    pub fn new(retain_events: bool) -> Self {
        Self {
            started: Instant::now(),
            count: 0,
            errors: 0,
            bytes: 0,
            events: retain_events.then(Vec::new),
        }
    }

    pub fn record(&mut self, event: TimedEvent) {
        debug_assert!(event.is_finalized(), "recording an unfinalized event");
        self.count += 1;
        if event.is_error() {
            self.errors += 1;
        }
        self.bytes += event.bytes();
        if let Some(events) = &mut self.events {
            events.push(event);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn events_per_sec(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 { self.count as f64 / secs } else { 0.0 }
    }

    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 { self.bytes as f64 / secs } else { 0.0 }
    }

    /// Duration at the given percentile over retained events, `None` when
    /// events are discarded or nothing was recorded.
    pub fn duration_percentile(&self, percentile: f64) -> Option<Duration> {
        let events = self.events.as_ref()?;
        if events.is_empty() {
            return None;
        }
        let mut durations: Vec<Duration> = events.iter().map(TimedEvent::duration).collect();
        durations.sort();
        let rank = ((percentile / 100.0) * durations.len() as f64).ceil() as usize;
        Some(durations[rank.clamp(1, durations.len()) - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalized(bytes: u64, error: bool) -> TimedEvent {
        let mut event = TimedEvent::begin("doc");
        event.add_bytes(bytes);
        if error { event.finish_error() } else { event.finish() }
    }

    #[test]
    fn aggregates_counts_bytes_and_errors() {
        let mut timer = Timer::new(false);
        timer.record(finalized(10, false));
        timer.record(finalized(20, true));
        timer.record(finalized(0, false));
        assert_eq!(timer.count(), 3);
        assert_eq!(timer.errors(), 1);
        assert_eq!(timer.bytes(), 30);
        // events were discarded, so no percentiles
        assert!(timer.duration_percentile(50.0).is_none());
    }

    #[test]
    fn retained_events_allow_percentiles() {
        let mut timer = Timer::new(true);
        for bytes in 0..10 {
            timer.record(finalized(bytes, false));
        }
        assert!(timer.duration_percentile(50.0).is_some());
        assert!(timer.duration_percentile(99.0).is_some());
    }

    #[test]
    #[should_panic(expected = "event finalized twice")]
    fn double_finalize_panics() {
        let event = TimedEvent::begin("doc").finish();
        let _ = event.finish();
    }
}
