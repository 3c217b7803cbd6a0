//! Operator-facing `### ` status lines.
//!
//! These are distinct from `tracing` diagnostics: they are always shown,
//! and colored when the stream is a terminal.

use anstyle::{AnsiColor, Style};

const PREFIX: &str = "###";

fn style_info() -> Style {
    Style::new()
        .bold()
        .fg_color(Some(AnsiColor::BrightWhite.into()))
}

fn style_notice() -> Style {
    Style::new().fg_color(Some(AnsiColor::Yellow.into()))
}

fn style_warn() -> Style {
    Style::new()
        .bold()
        .fg_color(Some(AnsiColor::Yellow.into()))
}

fn style_error() -> Style {
    Style::new().bold().fg_color(Some(AnsiColor::Red.into()))
}

/// A stage banner.
pub(crate) fn info(msg: &str) {
    let s = style_info();
    anstream::println!("{s}{PREFIX} {msg}{s:#}");
}

/// Something the operator should read, such as the final result.
pub(crate) fn notice(msg: &str) {
    let s = style_notice();
    anstream::println!("{s}{PREFIX} {msg}{s:#}");
}

/// A problem which does not stop the build.
pub(crate) fn warn(msg: &str) {
    let s = style_warn();
    anstream::eprintln!("{s}{PREFIX} {msg}{s:#}");
}

/// The labeled failure line.
pub(crate) fn error(msg: &str) {
    let s = style_error();
    anstream::eprintln!("{s}{PREFIX} {msg}{s:#}");
}
