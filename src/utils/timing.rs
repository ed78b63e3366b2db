use std::time::{Duration, Instant};

/// Logs how long the enclosing scope took when dropped.
pub struct ScopedExecutionTimer<'a> {
    task_name: &'a str,
    started_at: Instant,
}

impl<'a> ScopedExecutionTimer<'a> {
    pub fn new(task_name: &'a str) -> Self {
        Self {
            task_name,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Drop for ScopedExecutionTimer<'_> {
    fn drop(&mut self) {
        tracing::debug!(
            target: "jobgate::timing",
            task = self.task_name,
            elapsed = %format_duration_human_friendly(self.elapsed()),
            "task finished"
        );
    }
}

pub fn format_duration_human_friendly(duration: Duration) -> String {
    let total_ms = duration.as_secs_f64() * 1000.0;
    if total_ms < 1_000.0 {
        return format!("{total_ms:.2} ms");
    }

    let total_seconds = total_ms / 1_000.0;
    if total_seconds < 60.0 {
        return format!("{total_ms:.2} ms ({total_seconds:.2} s)");
    }

    let minutes = (total_seconds / 60.0).floor();
    let seconds_remainder = total_seconds - (minutes * 60.0);
    format!("{total_ms:.2} ms ({minutes:.0}m {seconds_remainder:.2}s)")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{format_duration_human_friendly, ScopedExecutionTimer};

    #[test]
    fn formats_sub_second_duration_in_milliseconds() {
        assert_eq!(format_duration_human_friendly(Duration::from_millis(250)), "250.00 ms");
    }

    #[test]
    fn formats_seconds_and_minutes() {
        assert_eq!(
            format_duration_human_friendly(Duration::from_millis(1_500)),
            "1500.00 ms (1.50 s)"
        );
        assert_eq!(
            format_duration_human_friendly(Duration::from_secs(90)),
            "90000.00 ms (1m 30.00s)"
        );
    }

    #[test]
    fn timer_reports_monotonic_elapsed_time() {
        let timer = ScopedExecutionTimer::new("jobs.activate");
        let first = timer.elapsed();
        assert!(timer.elapsed() >= first);
    }
}
