//! Display formatting for CLI output
//!
//! Results go to stdout; spinners and warnings go to stderr.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use pkr_driver::{BuildReport, DeployReport, FileChange};
use pkr_engine::ApplyReport;
use std::io::IsTerminal as _;
use std::path::Path;
use std::time::Duration;

pub fn success(message: impl std::fmt::Display) {
    println!("{} {}", style("✓").green().bold(), message);
}

pub fn warning(message: impl std::fmt::Display) {
    eprintln!("{} {}", style("⚠").yellow().bold(), message);
}

/// `title:` then one ` - item` line each, or `empty` when there are none
pub fn print_list(title: &str, items: &[String], empty: &str) {
    if items.is_empty() {
        println!("{empty}");
        return;
    }
    println!("{}", style(title).bold());
    for item in items {
        println!(" - {item}");
    }
}

/// Spinner on stderr, hidden when stderr is not a terminal
pub fn spinner(message: impl Into<String>, quiet: bool) -> ProgressBar {
    if quiet || !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    if let Ok(spinner_style) = ProgressStyle::with_template("{spinner:.cyan} {msg} {elapsed:.dim}") {
        bar.set_style(spinner_style);
    }
    bar.set_message(message.into());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

pub fn pluralize(count: usize, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("{count} {singular}")
    } else {
        format!("{count} {plural}")
    }
}

fn relative<'a>(path: &'a Path, base: &Path) -> std::borrow::Cow<'a, str> {
    path.strip_prefix(base).unwrap_or(path).to_string_lossy()
}

pub fn print_apply_report(report: &ApplyReport, kard_path: &Path) {
    if report.is_noop() {
        success(format!(
            "kard up to date ({} unchanged)",
            pluralize(report.unchanged, "file", "files")
        ));
        return;
    }
    for path in &report.written {
        println!("  {} {}", style("+").green(), relative(path, kard_path));
    }
    for path in &report.removed {
        println!("  {} {}", style("-").red(), relative(path, kard_path));
    }
    success(format!(
        "{} written, {} removed, {} unchanged",
        report.written.len(),
        report.removed.len(),
        report.unchanged
    ));
}

pub fn print_build_report(report: &BuildReport) {
    for image in &report.built {
        println!("  {} {}", style("built").green(), image);
    }
    for image in &report.skipped {
        println!("  {} {}", style("skipped").dim(), image);
    }
    success(format!(
        "{} built, {} skipped",
        pluralize(report.built.len(), "image", "images"),
        report.skipped.len()
    ));
}

pub fn print_changes(changes: &[FileChange]) {
    for change in changes.iter().filter(|c| c.is_change()) {
        match change {
            FileChange::Added { name } => println!("{} {}", style("added").green(), name),
            FileChange::Removed { name } => println!("{} {}", style("removed").red(), name),
            FileChange::Modified { name, diff } => {
                println!("{} {}", style("modified").yellow(), name);
                for line in diff.lines() {
                    let styled = if line.starts_with('+') && !line.starts_with("+++") {
                        style(line).green()
                    } else if line.starts_with('-') && !line.starts_with("---") {
                        style(line).red()
                    } else {
                        style(line).dim()
                    };
                    println!("  {styled}");
                }
            }
            FileChange::Unchanged { .. } => {}
        }
    }
}

pub fn print_deploy_report(report: &DeployReport, verb: &str) {
    if let Some(build) = &report.build {
        print_build_report(build);
    }
    print_changes(&report.changes);
    for name in &report.deleted {
        println!("  {} {}", style("deleted").red(), name);
    }
    if report.services.is_empty() {
        success(format!("nothing to {verb}"));
    } else {
        success(format!("{verb}: {}", report.services.join(", ")));
    }
}
