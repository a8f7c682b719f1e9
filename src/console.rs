//! Operator-facing output: step spinners, prompts and the final summary.

use std::cell::RefCell;
use std::io;
use std::time::Duration;

use colored::Colorize;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Password};
use indicatif::{ProgressBar, ProgressStyle};

use crate::workflow::{Confirmation, SyncProgress, WorkflowReport, WorkflowStatus};

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Renders workflow progress on stderr, one spinner per running step.
pub struct Console {
    json: bool,
    current: RefCell<Option<ProgressBar>>,
}

impl Console {
    /// With `json` set, nothing but the final report is printed.
    pub fn new(json: bool) -> Self {
        Self {
            json,
            current: RefCell::new(None),
        }
    }

    pub fn progress(&self, progress: SyncProgress) {
        self.finish_step();
        if self.json {
            return;
        }

        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        spinner.set_message(format!("{}...", progress.message));
        spinner.enable_steady_tick(Duration::from_millis(120));
        *self.current.borrow_mut() = Some(spinner);
    }

    /// Mark the running step done.
    pub fn finish_step(&self) {
        if let Some(spinner) = self.current.borrow_mut().take() {
            let message = spinner.message();
            let message = message.trim_end_matches("...");
            spinner.finish_with_message(format!("{message} {}", "done".green()));
        }
    }

    /// Mark the running step failed.
    pub fn fail_step(&self) {
        if let Some(spinner) = self.current.borrow_mut().take() {
            let message = spinner.message();
            let message = message.trim_end_matches("...");
            spinner.abandon_with_message(format!("{message} {}", "failed".red()));
        }
    }

    /// Print the outcome, as JSON when requested.
    pub fn report(&self, report: &WorkflowReport) -> anyhow::Result<()> {
        self.finish_step();
        if self.json {
            println!("{}", serde_json::to_string_pretty(report)?);
            return Ok(());
        }

        match report.status {
            WorkflowStatus::Completed => {
                eprintln!("{}", "Done.".green().bold());
            }
            WorkflowStatus::SkippedEmptyLocal => {
                eprintln!("{}", "Local database is empty, nothing to push.".yellow());
            }
            WorkflowStatus::Declined => {
                eprintln!("{}", "Cancelled, remote database left untouched.".yellow());
            }
        }
        for (label, value) in [
            ("remote dump", &report.remote_dump),
            ("local dump", &report.local_dump),
            ("transferred", &report.transferred),
            ("extracted", &report.extracted),
        ] {
            if let Some(value) = value {
                eprintln!("  {} {}", format!("{label}:").dimmed(), value);
            }
        }
        Ok(())
    }
}

/// Confirmation answered on the terminal.
pub struct TerminalConfirmation<'c> {
    console: &'c Console,
}

impl<'c> TerminalConfirmation<'c> {
    pub fn new(console: &'c Console) -> Self {
        Self { console }
    }
}

impl Confirmation for TerminalConfirmation<'_> {
    fn confirm(&mut self, question: &str) -> io::Result<bool> {
        self.console.finish_step();
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(question)
            .default(false)
            .interact()
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

/// Read a secret without echo.
pub fn prompt_secret(prompt: &str) -> io::Result<String> {
    Password::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .allow_empty_password(true)
        .interact()
        .map_err(|e| io::Error::other(e.to_string()))
}
