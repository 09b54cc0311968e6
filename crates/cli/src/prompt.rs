//! Terminal-backed interactive chooser

use async_trait::async_trait;
use colored::Colorize;

use crate::output;
use ptp_lib::cleanup::{parse_selection, Chooser, RetainCandidate, Selection};

/// What to do with supported instances without asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Ask interactively (the default).
    Prompt,
    KeepAll,
    TerminateAll,
}

/// Chooser backed by the terminal. `assume_yes` answers every
/// confirmation prompt affirmatively; the retention policy can bypass the
/// selection prompt for non-interactive runs.
pub struct TerminalChooser {
    assume_yes: bool,
    retention: RetentionPolicy,
}

impl TerminalChooser {
    pub fn new(assume_yes: bool, retention: RetentionPolicy) -> Self {
        Self {
            assume_yes,
            retention,
        }
    }
}

async fn read_line() -> Option<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).ok()?;
        Some(line)
    })
    .await
    .ok()
    .flatten()
}

#[async_trait]
impl Chooser for TerminalChooser {
    async fn confirm(&self, message: &str) -> bool {
        if self.assume_yes {
            return true;
        }

        println!("{}", message.yellow());
        print!("Continue? [y/N] ");
        use std::io::Write;
        let _ = std::io::stdout().flush();

        match read_line().await {
            Some(line) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            None => false,
        }
    }

    async fn select(&self, candidates: &[RetainCandidate]) -> Selection {
        match self.retention {
            RetentionPolicy::KeepAll => return Selection::All,
            RetentionPolicy::TerminateAll => return Selection::None,
            RetentionPolicy::Prompt => {}
        }

        output::print_candidates(candidates);
        println!(
            "Select instances to keep; the rest will be terminated.\n\
             Enter 'all', 'none', or indices like '1,3,5-7'."
        );

        loop {
            print!("> ");
            use std::io::Write;
            let _ = std::io::stdout().flush();

            let Some(line) = read_line().await else {
                // Input closed; keep nothing rather than leak instances.
                output::print_warning("input closed, terminating all supported instances");
                return Selection::None;
            };

            match parse_selection(&line, candidates.len()) {
                Ok(selection) => return selection,
                Err(error) => output::print_error(&error),
            }
        }
    }
}
