use std::time::Duration;

/// Frames between two FPS reports.
pub const REPORT_EVERY: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsReport {
    pub frames: u64,
    pub elapsed: Duration,
    pub fps: f64,
}

/// Running totals since the last report. Each cycle takes the value and gets
/// the updated one back.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    frames: u64,
    elapsed: Duration,
    total_frames: u64,
}

impl SessionStats {
    pub fn record(self, frames: u64, elapsed: Duration) -> (Self, Option<FpsReport>) {
        let stats = Self {
            frames: self.frames + frames,
            elapsed: self.elapsed + elapsed,
            total_frames: self.total_frames + frames,
        };
        if stats.frames < REPORT_EVERY {
            return (stats, None);
        }

        let seconds = stats.elapsed.as_secs_f64();
        let report = FpsReport {
            frames: stats.frames,
            elapsed: stats.elapsed,
            fps: if seconds > 0.0 {
                stats.frames as f64 / seconds
            } else {
                0.0
            },
        };
        let reset = Self {
            total_frames: stats.total_frames,
            ..Self::default()
        };
        (reset, Some(report))
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_every_ten_frames() {
        let mut stats = SessionStats::default();
        for _ in 0..9 {
            let (next, report) = stats.record(1, Duration::from_millis(100));
            assert!(report.is_none());
            stats = next;
        }

        let (stats, report) = stats.record(1, Duration::from_millis(100));
        let report = report.unwrap();
        assert_eq!(report.frames, 10);
        assert!((report.fps - 10.0).abs() < 1e-9);
        assert_eq!(stats.total_frames(), 10);

        let (_, report) = stats.record(4, Duration::from_millis(100));
        assert!(report.is_none());
    }

    #[test]
    fn test_batches_cross_the_cadence() {
        let (stats, report) = SessionStats::default().record(16, Duration::from_secs(2));
        assert_eq!(report.unwrap().fps, 8.0);
        assert_eq!(stats.total_frames(), 16);
    }

    #[test]
    fn test_no_elapsed_time_reports_zero() {
        let (_, report) = SessionStats::default().record(10, Duration::ZERO);
        assert_eq!(report.unwrap().fps, 0.0);
    }
}
