//! Operator feedback on stdout, separate from the tracing diagnostics.
//!
//! Quiet mode prints one `.` per image so a busy night still shows progress
//! at a glance; verbose mode names every file.

use colored::Colorize;
use std::io::Write;
use std::path::Path;

const BELL: &str = "\x07";

#[derive(Debug, Clone, Copy, Default)]
pub struct Announcer {
    pub verbose: bool,
    pub beep: bool,
}

impl Announcer {
    pub fn new(verbose: bool, beep: bool) -> Self {
        Self { verbose, beep }
    }

    /// Line printed when a transfer starts.
    pub fn receiving_line(&self, path: &Path, size: u64, overwrite: Option<bool>) -> String {
        let mut line = format!("Receiving file {}; size {}", path.display(), size);
        if let Some(overwrite) = overwrite {
            line.push_str(&format!("; overwrite {}", u8::from(overwrite)));
        }
        line
    }

    /// Full console text for one transfer, bell included.
    pub fn feedback(&self, path: &Path, size: u64, overwrite: Option<bool>) -> String {
        let bell = if self.beep { BELL } else { "" };
        if self.verbose {
            format!(
                "{}{}",
                self.receiving_line(path, size, overwrite).green(),
                bell
            )
        } else {
            format!("{}.", bell)
        }
    }

    /// Blocking stdout write, called from the session task once per image.
    pub fn receiving(&self, path: &Path, size: u64, overwrite: Option<bool>) {
        let text = self.feedback(path, size, overwrite);
        let mut out = std::io::stdout().lock();
        if writeln!(out, "{}", text).and_then(|_| out.flush()).is_err() {
            tracing::debug!("console feedback dropped, stdout closed");
        }
    }
}
