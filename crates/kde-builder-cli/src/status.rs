//! Single-line TTY status view.
//!
//! One line on the controlling terminal, redrawn in place:
//! `<percentage or spinner> <verb> <project> (<built>/<total> built,
//! <failed> failed)`. When some other text must stream past, the line is
//! released first so output never interleaves mid-line. Falls back to
//! plain line output when stdout is not a terminal.

use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use kde_builder::phases::Phase;
use kde_builder::report::Reporter;

pub struct StatusReporter {
    bar: Option<ProgressBar>,
    total: usize,
    built: usize,
    failed: usize,
    current: String,
    verb: String,
    fraction: Option<f32>,
}

impl StatusReporter {
    pub fn new() -> Self {
        let bar = if std::io::stdout().is_terminal() {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::with_template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_chars("-\\|/"),
            );
            pb.enable_steady_tick(Duration::from_millis(200));
            Some(pb)
        } else {
            None
        };
        StatusReporter {
            bar,
            total: 0,
            built: 0,
            failed: 0,
            current: String::new(),
            verb: String::new(),
            fraction: None,
        }
    }

    fn redraw(&self) {
        let Some(bar) = &self.bar else { return };
        let mut msg = String::new();
        if let Some(fraction) = self.fraction {
            msg.push_str(&format!("{:.1}% ", fraction * 100.0));
        }
        msg.push_str(&format!("{} {}", self.verb, self.current));
        if self.total > 1 {
            let mut tallies = format!("{} projects", self.total);
            if self.failed > 0 {
                tallies = format!("{} failed, {tallies}", self.failed);
            }
            if self.built > 0 {
                tallies = format!("{} built, {tallies}", self.built);
            }
            msg.push_str(&format!(" ({tallies})"));
        }
        bar.set_message(msg);
    }

    /// Print a full line without corrupting the status line.
    fn line(&self, text: &str) {
        match &self.bar {
            Some(bar) => bar.println(text),
            None => eprintln!("{text}"),
        }
    }

    /// Clear the status line and print the final tally.
    pub fn finish(self) {
        let (built, failed) = (self.built, self.failed);
        if let Some(bar) = self.bar {
            bar.finish_and_clear();
        }
        if failed > 0 {
            eprintln!("<<<  BUILD DONE: {built} built, {failed} failed  >>>");
        } else if built > 0 {
            eprintln!("<<<  BUILD DONE: {built} built  >>>");
        }
    }
}

impl Reporter for StatusReporter {
    fn info(&mut self, msg: &str) {
        self.line(msg);
    }

    fn warn(&mut self, msg: &str) {
        self.line(&format!("warning: {msg}"));
    }

    fn error(&mut self, msg: &str) {
        self.line(&format!("error: {msg}"));
    }

    fn begin_phase(&mut self, project: &str, phase: Phase, idx: usize, total: usize) {
        self.total = total;
        self.current = format!("{project} [{idx}/{total}]");
        self.verb = match phase {
            Phase::Update => "Updating".to_string(),
            Phase::Build => "Building".to_string(),
            Phase::Test => "Testing".to_string(),
            Phase::Install => "Installing".to_string(),
            Phase::Uninstall => "Uninstalling".to_string(),
        };
        self.fraction = None;
        self.redraw();
    }

    fn phase_progress(&mut self, _project: &str, _phase: Phase, fraction: Option<f32>) {
        self.fraction = fraction;
        self.redraw();
    }

    fn end_project(&mut self, project: &str, success: bool, elapsed: Duration) {
        if success {
            self.built += 1;
        } else {
            self.failed += 1;
        }
        // Release the line with a terminal outcome before the next project
        // takes it over.
        let verdict = if success { "succeeded" } else { "failed" };
        // Sub-second precision is noise here.
        let elapsed = Duration::from_secs(elapsed.as_secs());
        self.line(&format!(
            "{project} {verdict} after {}",
            humantime::format_duration(elapsed)
        ));
        self.fraction = None;
        self.redraw();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tallies_count_outcomes() {
        let mut reporter = StatusReporter::new();
        reporter.begin_phase("kcalc", Phase::Build, 1, 3);
        reporter.end_project("kcalc", true, Duration::from_secs(2));
        reporter.end_project("kate", false, Duration::from_secs(5));
        assert_eq!(reporter.built, 1);
        assert_eq!(reporter.failed, 1);
    }
}
