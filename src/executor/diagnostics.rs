use std::fmt::Write;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;

use crate::frames::FrameList;

/// One `execute` call made during a dispatch.
#[derive(Debug, Clone)]
pub struct BatchExecution {
    pub node: String,
    pub frames: FrameList,
    pub start: Instant,
    pub duration: Duration,
    /// Ran in the immediate pass rather than on the backend.
    pub immediate: bool,
}

/// What a dispatch did.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Number of batches in the dispatched graph.
    pub batches: usize,
    pub executions: Vec<BatchExecution>,
    pub job_directory: Option<Utf8PathBuf>,
    /// A pre-dispatch hook stopped the dispatch.
    pub cancelled: bool,
}

impl Diagnostics {
    pub(crate) fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }

    pub(crate) fn record(&mut self, execution: BatchExecution) {
        self.executions.push(execution);
    }

    /// Sum of the time spent inside `execute`.
    pub fn busy(&self) -> Duration {
        self.executions.iter().map(|e| e.duration).sum()
    }

    /// Renders the executions as a text waterfall, one row per call.
    pub fn render_waterfall(&self) -> String {
        const WIDTH: f64 = 40.0;

        let mut rows: Vec<&BatchExecution> = self.executions.iter().collect();
        if rows.is_empty() {
            return String::from("No tasks ran\n");
        }

        rows.sort_by_key(|e| e.start);

        let origin = rows[0].start;
        let end = rows
            .iter()
            .map(|e| e.start + e.duration)
            .max()
            .unwrap_or(origin);
        let total = end.duration_since(origin).as_micros().max(1) as f64;

        let labels: Vec<String> = rows
            .iter()
            .map(|e| format!("{} [{}]", e.node, e.frames))
            .collect();
        let label_width = labels.iter().map(String::len).max().unwrap_or(0);

        let mut output = String::new();
        for (row, label) in rows.iter().zip(&labels) {
            let offset = row.start.duration_since(origin).as_micros() as f64;
            let from = (offset / total * WIDTH) as usize;
            let len = ((row.duration.as_micros() as f64 / total * WIDTH) as usize).max(1);
            let to = (from + len).min(WIDTH as usize);

            let bar: String = (0..WIDTH as usize)
                .map(|i| if (from..to).contains(&i) { '#' } else { ' ' })
                .collect();

            let marker = if row.immediate { '!' } else { ' ' };
            let _ = writeln!(
                output,
                "{label:<label_width$} {marker}|{bar}| {:.2}ms",
                row.duration.as_secs_f64() * 1000.0
            );
        }

        output
    }
}
