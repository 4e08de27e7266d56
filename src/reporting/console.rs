//! # Console Reporting Module / 控制台报告模块
//!
//! A [`MessageSink`] that prints one colored line per finished test and, when
//! the assembly finishes, a summary followed by the details of every failure.
//!
//! 一个消息接收器：每个测试结束时打印一行彩色结果，
//! 程序集结束时打印摘要以及每个失败的详细信息。

use colored::*;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::core::bus::MessageSink;
use crate::core::failure::ExceptionInfo;
use crate::core::messages::{MessageBody, RunnerMessage};
use crate::core::models::RunSummary;

/// A failure kept for the details section printed at the end of the run.
struct FailureDetail {
    heading: String,
    name: String,
    error: ExceptionInfo,
    output: String,
}

#[derive(Default)]
struct ReporterState {
    /// Display names of started tests, by unique ID.
    names: HashMap<String, String>,
    failures: Vec<FailureDetail>,
}

/// Prints progress and a final summary to a writer (stdout by default).
///
/// Output format:
/// ```text
///   - Passed           | Calculator.adds(a: 1, b: 2)              |     1.23ms
///   - Failed           | Calculator.divides                       |     0.45ms
///   - Skipped          | Calculator.slow                          |        N/A
///
/// --- Test Summary ---
///   Total: 3, Passed: 1, Failed: 1, Skipped: 1, Not run: 0, Time: 12.3ms
/// ```
pub struct ConsoleReporter {
    out: Mutex<Box<dyn Write + Send>>,
    state: Mutex<ReporterState>,
    show_output: bool,
}

impl ConsoleReporter {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(writer)),
            state: Mutex::new(ReporterState::default()),
            show_output: true,
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Whether captured test output is included in the failure details.
    pub fn show_output(mut self, show: bool) -> Self {
        self.show_output = show;
        self
    }

    fn write(&self, text: impl AsRef<str>) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        // A closed pipe must not fail the run.
        let _ = writeln!(out, "{}", text.as_ref());
    }

    fn test_line(&self, status: ColoredString, name: &str, duration: Option<Duration>) {
        let duration_str = duration
            .map(|d| format!("{:.2?}", d))
            .unwrap_or_else(|| "N/A".to_string());
        self.write(format!(
            "  - {:<18} | {:<40} | {:>10}",
            status, name, duration_str
        ));
    }

    fn print_summary(&self, summary: &RunSummary) {
        self.write(format!("\n{}", "--- Test Summary ---".bold()));
        let failed = if summary.failed > 0 {
            summary.failed.to_string().red()
        } else {
            summary.failed.to_string().green()
        };
        self.write(format!(
            "  Total: {}, Passed: {}, Failed: {}, Skipped: {}, Not run: {}, Time: {:.2?}",
            summary.total,
            summary.passed(),
            failed,
            summary.skipped,
            summary.not_run,
            summary.time
        ));
    }

    fn print_failure_details(&self, failures: &[FailureDetail]) {
        if failures.is_empty() {
            return;
        }
        self.write(format!("\n{}", "--- Failure Details ---".red().bold()));
        self.write("-".repeat(80));
        for (i, failure) in failures.iter().enumerate() {
            self.write(format!(
                "[{}/{}] {} '{}'",
                i + 1,
                failures.len(),
                failure.heading.red(),
                failure.name.cyan()
            ));
            self.write(format_exception(&failure.error));
            if self.show_output && !failure.output.is_empty() {
                self.write(format!("\n--- {} ---\n", "Test output".yellow()));
                self.write(failure.output.trim_end());
            }
            self.write(format!("\n{}", "-".repeat(80)));
        }
    }
}

impl MessageSink for ConsoleReporter {
    fn on_message(&self, message: &RunnerMessage) -> bool {
        let test_id = message.ids.test.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let name = |state: &ReporterState| {
            state
                .names
                .get(&test_id)
                .cloned()
                .unwrap_or_else(|| message.ids.leaf().to_string())
        };

        match &message.body {
            MessageBody::AssemblyStarting { assembly_name, .. } => {
                self.write(format!("{} {}", "Running".green().bold(), assembly_name));
            }
            MessageBody::TestStarting { display_name, .. } => {
                state.names.insert(test_id.clone(), display_name.clone());
            }
            MessageBody::TestPassed { execution_time, .. } => {
                self.test_line("Passed".green(), &name(&*state), Some(*execution_time));
            }
            MessageBody::TestFailed {
                execution_time,
                output,
                error,
                ..
            } => {
                let name = name(&*state);
                self.test_line("Failed".red(), &name, Some(*execution_time));
                state.failures.push(FailureDetail {
                    heading: "Test failed".to_string(),
                    name,
                    error: error.clone(),
                    output: output.clone(),
                });
            }
            MessageBody::TestSkipped { reason } => {
                let label = format!("{} ({})", name(&*state), reason);
                self.test_line("Skipped".dimmed(), &label, None);
            }
            MessageBody::TestNotRun => {
                self.test_line("Not run".dimmed(), &name(&*state), None);
            }
            MessageBody::TestFinished { .. } => {
                state.names.remove(&test_id);
            }
            MessageBody::Error { error } => {
                self.write(format!(
                    "  {} {}",
                    "Error:".red().bold(),
                    error.message().unwrap_or("unknown error")
                ));
                state.failures.push(FailureDetail {
                    heading: "Error".to_string(),
                    name: message.ids.leaf().to_string(),
                    error: error.clone(),
                    output: String::new(),
                });
            }
            MessageBody::AssemblyFinished { summary } => {
                self.print_summary(summary);
                let failures = std::mem::take(&mut state.failures);
                self.print_failure_details(&failures);
            }
            body => {
                if let Some(error) = body.error() {
                    let name = name(&*state);
                    self.write(format!(
                        "  {} {} ({:?})",
                        "Cleanup failure:".yellow().bold(),
                        name,
                        body.level()
                    ));
                    state.failures.push(FailureDetail {
                        heading: "Cleanup failure".to_string(),
                        name,
                        error: error.clone(),
                        output: String::new(),
                    });
                }
            }
        }
        true
    }
}

/// Renders exception metadata as an indented cause tree.
///
/// 将异常元数据渲染为缩进的原因树。
pub fn format_exception(error: &ExceptionInfo) -> String {
    let mut depth = vec![0usize; error.types.len()];
    let mut lines = Vec::with_capacity(error.types.len());
    for (i, type_name) in error.types.iter().enumerate() {
        let parent = error.parent_indices.get(i).copied().unwrap_or(-1);
        if parent >= 0 {
            depth[i] = depth.get(parent as usize).copied().unwrap_or(0) + 1;
        }
        let message = error.messages.get(i).map(String::as_str).unwrap_or_default();
        lines.push(format!("{}{}: {}", "    ".repeat(depth[i] + 1), type_name, message));
        if let Some(Some(trace)) = error.traces.get(i) {
            for line in trace.lines() {
                lines.push(format!("{}  {}", "    ".repeat(depth[i] + 1), line.dimmed()));
            }
        }
    }
    lines.join("\n")
}
