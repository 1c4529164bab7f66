use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub percent: Option<f64>,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            percent: None,
            elapsed: None,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Share of `processed` in `total`, clamped to 0..=100. An empty job is complete.
pub fn percent(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    processed.min(total) as f64 / total as f64 * 100.0
}

/// Throttles percentage updates so a sink sees at most one per interval.
///
/// Jobs with at most `small_total` items report every tick instead.
pub struct ProgressReporter<'a> {
    sink: &'a dyn ProgressSink,
    label: &'static str,
    total: u64,
    started: Instant,
    last_emit: Option<Instant>,
    interval: Duration,
    small_total: u64,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(sink: &'a dyn ProgressSink, label: &'static str, total: u64) -> Self {
        Self {
            sink,
            label,
            total,
            started: Instant::now(),
            last_emit: None,
            interval: Duration::from_secs(1),
            small_total: 100,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Returns whether an event was emitted.
    pub fn tick(&mut self, processed: u64) -> bool {
        let now = Instant::now();
        let due = self.total <= self.small_total
            || self
                .last_emit
                .is_none_or(|last| now.duration_since(last) >= self.interval);
        if due {
            self.emit(processed, now);
        }
        due
    }

    pub fn finish(&mut self, processed: u64) {
        self.emit(processed, Instant::now());
    }

    fn emit(&mut self, processed: u64, now: Instant) {
        let pct = percent(processed, self.total);
        self.sink.event(ProgressEvent {
            message: format!(
                "{} {processed} of {} ({pct:.1}%)",
                self.label, self.total
            ),
            percent: Some(pct),
            elapsed: Some(now.duration_since(self.started)),
        });
        self.last_emit = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[derive(Default)]
    struct Collect(RefCell<Vec<ProgressEvent>>);

    impl ProgressSink for Collect {
        fn event(&self, event: ProgressEvent) {
            self.0.borrow_mut().push(event);
        }
    }

    #[test]
    fn zero_total_reports_complete() {
        assert_eq!(percent(0, 0), 100.0);
        let sink = Collect::default();
        let mut reporter = ProgressReporter::new(&sink, "taxa", 0);
        reporter.finish(0);
        assert_eq!(sink.0.borrow()[0].percent, Some(100.0));
    }

    #[test]
    fn large_jobs_are_throttled() {
        let sink = Collect::default();
        let mut reporter =
            ProgressReporter::new(&sink, "taxa", 1_000).with_interval(Duration::from_secs(3600));
        for processed in 0..500 {
            reporter.tick(processed);
        }
        assert_eq!(sink.0.borrow().len(), 1);
    }

    #[test]
    fn small_jobs_report_every_item() {
        let sink = Collect::default();
        let mut reporter =
            ProgressReporter::new(&sink, "taxa", 10).with_interval(Duration::from_secs(3600));
        for processed in 0..10 {
            reporter.tick(processed);
        }
        assert_eq!(sink.0.borrow().len(), 10);
    }
}
