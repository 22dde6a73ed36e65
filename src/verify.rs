//! Verification engine.
//!
//! Checks are matched as an ordered subsequence: each `# CHECK:` pattern is
//! searched for from the line where the previous one matched, so output that
//! appears in a different order than the directives fails.

use crate::directive::Directive;
use crate::executor::{ProcessOutcome, Termination};
use std::fmt;

/// Outcome of verifying one test case run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(Failure),
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Why a run did not satisfy its directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// No output line at or after the cursor contains the pattern.
    CheckNotFound { line: usize, pattern: String },
    /// The subject exited non-zero while exit 0 was expected (the default).
    UnexpectedExit { actual: i32, output: Vec<String> },
    /// An explicit `# EXIT` expectation was not met.
    ExitMismatch { actual: i32, expected: i32 },
    /// The subject was killed by a signal.
    Signaled {
        signal: i32,
        expected: i32,
        output: Vec<String>,
    },
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::CheckNotFound { line, .. } => write!(f, "CHECK on line {line} not found"),
            Failure::UnexpectedExit { actual, output } => {
                write!(f, "Process exited with code {actual}; output:")?;
                write_output(f, output)
            }
            Failure::ExitMismatch { actual, expected } => write!(
                f,
                "Exit code {actual} does not match expected value of {expected}"
            ),
            Failure::Signaled {
                signal,
                expected,
                output,
            } => {
                write!(
                    f,
                    "Process terminated by signal {signal} (expected exit code {expected}); output:"
                )?;
                write_output(f, output)
            }
        }
    }
}

fn write_output(f: &mut fmt::Formatter<'_>, output: &[String]) -> fmt::Result {
    for line in output {
        write!(f, "\n{line}")?;
    }
    Ok(())
}

/// Match state threaded through the directive fold.
#[derive(Debug, Clone, Copy)]
struct Progress {
    cursor: usize,
    expected_exit: i32,
}

/// Verify a run's outcome against the test case directives.
pub fn verify(directives: &[Directive], outcome: &ProcessOutcome) -> Verdict {
    let start = Progress {
        cursor: 0,
        expected_exit: 0,
    };
    let progress = directives
        .iter()
        .try_fold(start, |progress, directive| {
            step(progress, directive, &outcome.lines)
        });

    let expected = match progress {
        Ok(progress) => progress.expected_exit,
        Err(failure) => return Verdict::Fail(failure),
    };

    match check_exit(outcome, expected) {
        Some(failure) => Verdict::Fail(failure),
        None => Verdict::Pass,
    }
}

fn step(progress: Progress, directive: &Directive, output: &[String]) -> Result<Progress, Failure> {
    match directive {
        Directive::Check { pattern, line } => {
            let found = find_from(output, progress.cursor, pattern).ok_or_else(|| {
                Failure::CheckNotFound {
                    line: *line,
                    pattern: pattern.clone(),
                }
            })?;
            tracing::debug!(check_line = line, output_line = found + 1, "CHECK matched");
            Ok(Progress {
                cursor: found,
                ..progress
            })
        }
        Directive::ExpectExit { code, .. } => Ok(Progress {
            expected_exit: *code,
            ..progress
        }),
    }
}

/// Index of the first line at or after `cursor` that contains `pattern`.
fn find_from(output: &[String], cursor: usize, pattern: &str) -> Option<usize> {
    output
        .iter()
        .enumerate()
        .skip(cursor)
        .find(|(_, line)| line.contains(pattern))
        .map(|(idx, _)| idx)
}

fn check_exit(outcome: &ProcessOutcome, expected: i32) -> Option<Failure> {
    match outcome.termination {
        Termination::Exited(actual) if actual == expected => None,
        Termination::Exited(actual) if expected == 0 => Some(Failure::UnexpectedExit {
            actual,
            output: full_output(outcome),
        }),
        Termination::Exited(actual) => Some(Failure::ExitMismatch { actual, expected }),
        Termination::Signaled(signal) => Some(Failure::Signaled {
            signal,
            expected,
            output: full_output(outcome),
        }),
    }
}

fn full_output(outcome: &ProcessOutcome) -> Vec<String> {
    outcome
        .lines
        .iter()
        .chain(&outcome.stderr)
        .cloned()
        .collect()
}
