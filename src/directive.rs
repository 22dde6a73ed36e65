//! Directive parser.
//!
//! A test case is an ordinary text file that doubles as the subject's input.
//! Lines starting with one of the directive prefixes carry expectations; every
//! other line is ignored here.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Prefix of an ordered substring check.
pub const CHECK_PREFIX: &str = "# CHECK: ";

/// Prefix of an expected exit code declaration.
pub const EXIT_PREFIX: &str = "# EXIT ";

/// A single expectation embedded in a test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `pattern` must occur in some output line at or after the match cursor.
    Check { pattern: String, line: usize },
    /// The subject is expected to exit with `code`.
    ExpectExit { code: i32, line: usize },
}

/// A loaded test case file.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub path: PathBuf,
    pub lines: Vec<String>,
    pub directives: Vec<Directive>,
}

impl TestCase {
    /// Read and parse a test case from disk.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::InputNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        let directives = parse_directives(&content)?;
        tracing::debug!(
            path = %path.display(),
            directives = directives.len(),
            "loaded test case"
        );

        Ok(Self {
            path: path.to_path_buf(),
            lines: content.lines().map(String::from).collect(),
            directives,
        })
    }

    /// The exit code the subject must return. The last `# EXIT` wins; 0 when absent.
    pub fn expected_exit(&self) -> i32 {
        self.directives
            .iter()
            .rev()
            .find_map(|d| match d {
                Directive::ExpectExit { code, .. } => Some(*code),
                Directive::Check { .. } => None,
            })
            .unwrap_or(0)
    }
}

/// Extract directives from test case content, in file order.
pub fn parse_directives(content: &str) -> Result<Vec<Directive>> {
    let mut directives = Vec::new();
    let mut exit_line: Option<usize> = None;

    for (idx, text) in content.lines().enumerate() {
        let line = idx + 1;

        if let Some(pattern) = text.strip_prefix(CHECK_PREFIX) {
            directives.push(Directive::Check {
                pattern: pattern.to_string(),
                line,
            });
        } else if let Some(payload) = text.strip_prefix(EXIT_PREFIX) {
            let code = payload
                .trim()
                .parse::<i32>()
                .map_err(|_| Error::MalformedDirective {
                    line,
                    payload: payload.to_string(),
                })?;
            if let Some(previous) = exit_line.replace(line) {
                tracing::warn!(
                    previous,
                    line,
                    "multiple EXIT directives; the one on line {line} takes effect"
                );
            }
            directives.push(Directive::ExpectExit { code, line });
        }
    }

    Ok(directives)
}
