//! Terminal rendering of the engine's progress counters.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use frz_repo::{Counter, Progress, Task};

/// Renders each task as a group of indicatif spinners, one per counter.
pub struct CliProgress {
    multi: MultiProgress,
}

impl CliProgress {
    pub fn new() -> Self {
        Self { multi: MultiProgress::new() }
    }
}

impl Default for CliProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for CliProgress {
    fn task(&self, title: &str) -> Box<dyn Task> {
        Box::new(CliTask {
            multi: self.multi.clone(),
            title: title.to_string(),
            bars: Vec::new(),
        })
    }
}

struct CliTask {
    multi: MultiProgress,
    title: String,
    bars: Vec<ProgressBar>,
}

impl Task for CliTask {
    fn counter(&mut self, unit: &str) -> Counter {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::with_template("{prefix}: {human_pos} {msg}")
                .expect("static template"),
        );
        bar.set_prefix(self.title.clone());
        bar.set_message(unit.to_string());
        self.bars.push(bar.clone());
        Counter::new(move |n| bar.inc(n))
    }
}

impl Drop for CliTask {
    fn drop(&mut self) {
        for bar in &self.bars {
            bar.finish_and_clear();
        }
    }
}
