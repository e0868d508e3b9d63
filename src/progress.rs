//! Progress reporting towards the user interface

/// Receives overall progress of a backup or restore, in percent (0-100)
pub trait ProgressSink: Send + Sync {
    fn set_progress(&self, percent: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(f64) + Send + Sync,
{
    fn set_progress(&self, percent: f64) {
        self(percent)
    }
}

/// Sink that drops every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn set_progress(&self, _percent: f64) {}
}

/// Percentage of `done` over `total`, clamped to 0-100
pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Format bytes as whole mebibytes, the unit backups are listed in
pub fn format_mib(bytes: u64) -> String {
    format!("{} MiB", (bytes as f64 / 1024.0 / 1024.0).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
        assert_eq!(percent(300, 200), 100.0);
    }

    #[test]
    fn test_format_mib() {
        assert_eq!(format_mib(0), "0 MiB");
        assert_eq!(format_mib(1024 * 1024), "1 MiB");
        assert_eq!(format_mib(7_818_182_656), "7456 MiB");
    }

    #[test]
    fn test_closure_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |p: f64| seen.lock().unwrap().push(p);
        sink.set_progress(12.5);
        sink.set_progress(100.0);
        assert_eq!(*seen.lock().unwrap(), vec![12.5, 100.0]);
    }
}
