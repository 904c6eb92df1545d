//! Regex pattern-set probe
//!
//! Administrator-defined byte patterns matched against the accumulated prefix.
//! Whether a pattern may hit anywhere in the prefix or only at offset zero is an
//! explicit option of the probe.

use std::fmt;
use std::str::FromStr;

use regex::bytes::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::detector::ProbeResult;

/// Where a pattern is allowed to match inside the probe buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Search the whole accumulated prefix
    #[default]
    Anywhere,
    /// Only accept matches starting at the first byte
    Start,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anywhere => write!(f, "anywhere"),
            Self::Start => write!(f, "start"),
        }
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anywhere" => Ok(Self::Anywhere),
            "start" => Ok(Self::Start),
            _ => Err(format!("Invalid match mode: {}. Valid values are: anywhere, start", s)),
        }
    }
}

/// A compiled pattern that failed
#[derive(Debug, Clone)]
pub struct PatternError {
    /// Source of the offending pattern
    pub pattern: String,
    /// Compiler message
    pub message: String,
}

/// Compiled set of byte patterns
///
/// Patterns see raw bytes: `\xNN` is a byte and `.` matches any byte but
/// `\n`. Unicode classes are opt-in with `(?u)`.
#[derive(Debug, Clone)]
pub struct PatternProbe {
    patterns: Vec<Regex>,
    sources: Vec<String>,
    mode: MatchMode,
    min_length: usize,
}

impl PatternProbe {
    /// Compile a pattern set
    ///
    /// When `min_length` is `None` the probe waits until the buffer is at least as
    /// long as the longest minimal match of any pattern before rejecting.
    pub fn new(
        patterns: &[String],
        mode: MatchMode,
        min_length: Option<usize>,
    ) -> Result<Self, PatternError> {
        let mut compiled = Vec::with_capacity(patterns.len());
        let mut longest_minimum = 0;

        for pattern in patterns {
            let source = match mode {
                MatchMode::Anywhere => pattern.clone(),
                MatchMode::Start => format!(r"\A(?:{})", pattern),
            };
            let regex = RegexBuilder::new(&source)
                .unicode(false)
                .build()
                .map_err(|e| PatternError {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?;
            longest_minimum = longest_minimum.max(minimum_match_len(&source));
            compiled.push(regex);
        }

        Ok(Self {
            patterns: compiled,
            sources: patterns.to_vec(),
            mode,
            min_length: min_length.unwrap_or(longest_minimum),
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.sources
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Buffer length at which a missing hit becomes a rejection
    pub fn min_length(&self) -> usize {
        self.min_length
    }

    pub fn probe(&self, data: &[u8]) -> ProbeResult {
        if self.patterns.iter().any(|re| re.is_match(data)) {
            ProbeResult::Matched
        } else if data.len() < self.min_length {
            ProbeResult::NeedMoreData
        } else {
            ProbeResult::Rejected
        }
    }
}

/// Shortest input any match of `pattern` can span, zero when unknown
fn minimum_match_len(pattern: &str) -> usize {
    regex_syntax::ParserBuilder::new()
        .utf8(false)
        .unicode(false)
        .build()
        .parse(pattern)
        .ok()
        .and_then(|hir| hir.properties().minimum_len())
        .unwrap_or(0)
}
