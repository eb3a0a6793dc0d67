//! Per-stage wall-clock accounting for a pipeline run.

use std::time::{Duration, Instant};

use crate::pipeline::Stage;

/// Tracks which stage is running and how long every finished stage took.
///
/// Terminal stages are never timed; entering one closes the stage before it.
#[derive(Debug, Default)]
pub struct StageClock {
    current: Option<(Stage, Instant)>,
    spent: Vec<(Stage, Duration)>,
}

impl StageClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the running stage and start `stage`. Returns the closed stage
    /// with its duration.
    pub fn enter(&mut self, stage: Stage) -> Option<(Stage, Duration)> {
        let now = Instant::now();
        let closed = self
            .current
            .take()
            .map(|(prev, started)| (prev, now.duration_since(started)));
        if let Some(entry) = closed {
            self.spent.push(entry);
        }
        if !stage.is_terminal() {
            self.current = Some((stage, now));
        }
        closed
    }

    /// Finished stages in the order they ran.
    pub fn durations(&self) -> &[(Stage, Duration)] {
        &self.spent
    }

    /// Sum of every finished stage.
    pub fn total(&self) -> Duration {
        self.spent.iter().map(|(_, d)| *d).sum()
    }
}

/// `12.3s`, or minutes once past a minute.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs >= 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}s", secs)
    }
}
