use std::io::IsTerminal;
use std::time::Duration;

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};

use crate::envelope::Envelope;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

pub(crate) struct Spinner {
    progress_bar: Option<ProgressBar>,
}

impl TerminalRenderer {
    pub fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub fn print_envelope(self, envelope: &Envelope) {
        let status = if envelope.success { "ok" } else { "err" };
        let line = render_status_line(self.style, status, &envelope.message);
        let rendered = match self.style {
            OutputStyle::Plain => line,
            OutputStyle::Rich => colorize_badge(status, &line),
        };
        if envelope.success {
            println!("{rendered}");
        } else {
            eprintln!("{rendered}");
        }
        for detail in &envelope.details {
            println!("  {detail}");
        }
    }

    /// Spinner on stderr while a long operation runs; silent in plain mode.
    pub fn start_spinner(self, message: &str) -> Spinner {
        if self.style != OutputStyle::Rich {
            return Spinner { progress_bar: None };
        }

        let progress_bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}") {
            progress_bar.set_style(style.tick_chars("|/-\\ "));
        }
        progress_bar.set_message(message.to_string());
        progress_bar.enable_steady_tick(Duration::from_millis(80));
        Spinner {
            progress_bar: Some(progress_bar),
        }
    }
}

impl Spinner {
    pub fn finish(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

pub(crate) fn resolve_output_style(stdout_is_terminal: bool, no_color: bool) -> OutputStyle {
    if stdout_is_terminal && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::env::var_os("NO_COLOR").is_some(),
    )
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

fn badge_style(status: &str) -> Style {
    let color = match status {
        "ok" => AnsiColor::BrightGreen,
        "warn" => AnsiColor::BrightYellow,
        "err" => AnsiColor::BrightRed,
        _ => AnsiColor::BrightBlue,
    };
    Style::new()
        .fg_color(Some(color.into()))
        .effects(Effects::BOLD)
}

fn colorize_badge(status: &str, line: &str) -> String {
    let badge = status_badge(status);
    match line.strip_prefix(badge) {
        Some(rest) => format!(
            "{}{}{}{rest}",
            badge_style(status).render(),
            badge,
            badge_style(status).render_reset()
        ),
        None => line.to_string(),
    }
}
