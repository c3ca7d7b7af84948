// File: src/errors.rs
//
// Error handling and reporting for the Strand programming language.
// Compile errors carry source location information and render as
// pretty-printed diagnostics. Internal VM faults are a separate tier:
// they indicate a compiler/VM bug or a fatal condition, never a
// language-level error (those are ordinary runtime values).

use colored::Colorize;
use std::fmt;
use thiserror::Error;

/// A fatal compile (or lex) error with location information
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub file: String,
    pub message: String,
    pub line: usize,
    pub column: usize,
    pub source_line: Option<String>,
    pub suggestion: Option<String>,
    pub help: Option<String>,
}

impl CompileError {
    pub fn new(file: String, message: String, line: usize, column: usize) -> Self {
        Self { file, message, line, column, source_line: None, suggestion: None, help: None }
    }

    pub fn with_source(mut self, source_line: String) -> Self {
        self.source_line = Some(source_line);
        self
    }

    pub fn with_suggestion(mut self, suggestion: String) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}: {}", "Compile Error".red().bold(), self.message.bold())?;

        let location_str = format!("  --> {}:{}:{}", self.file, self.line, self.column);
        writeln!(f, "{}", location_str.bright_blue())?;

        // Source code context
        if let Some(ref source) = self.source_line {
            writeln!(f, "   {}", "|".bright_blue())?;
            writeln!(
                f,
                "{} {} {}",
                format!("{:3}", self.line).bright_blue(),
                "|".bright_blue(),
                source
            )?;
            writeln!(
                f,
                "   {} {}{}",
                "|".bright_blue(),
                " ".repeat(self.column.saturating_sub(1)),
                "^".red().bold()
            )?;
            writeln!(f, "   {}", "|".bright_blue())?;
        }

        if let Some(ref help) = self.help {
            writeln!(f, "   {} {}", "=".bright_yellow(), format!("help: {}", help).bright_yellow())?;
        }

        if let Some(ref suggestion) = self.suggestion {
            writeln!(
                f,
                "   {} {}",
                "=".bright_green(),
                format!("Did you mean '{}'?", suggestion).bright_green()
            )?;
        }

        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Internal faults: the fiber (and the run) is aborted, nothing is swallowed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmFault {
    #[error("invalid opcode 0x{byte:02x} at offset {offset} in '{function}'")]
    InvalidOpcode { byte: u8, offset: usize, function: String },

    #[error("truncated operand at offset {offset} in '{function}'")]
    TruncatedOperand { offset: usize, function: String },

    #[error("stack underflow in '{function}'")]
    StackUnderflow { function: String },

    #[error("call stack exhausted ({max} frames)")]
    FrameOverflow { max: usize },

    #[error("value of type {type_name} is not callable")]
    NotCallable { type_name: String },

    #[error("cannot iterate over a value of type {type_name}")]
    NotIterable { type_name: String },

    #[error("superclass or mixin of '{class}' is a {type_name}, not a class")]
    NotAClass { class: String, type_name: String },

    #[error("class '{class}' cannot extend final class '{superclass}'")]
    FinalSuperclass { class: String, superclass: String },

    #[error("constant #{index} is missing or has the wrong kind in '{function}'")]
    BadConstant { index: usize, function: String },

    #[error("upvalue #{index} does not exist in '{function}'")]
    BadUpvalue { index: usize, function: String },

    #[error("undefined global '{name}'")]
    UndefinedGlobal { name: String },

    #[error("yield outside of a fiber")]
    YieldFromRoot,

    #[error("async native completion channel closed")]
    CompletionLost,
}

/// Any failure surfaced by the high-level `run` helpers
#[derive(Debug, Error)]
pub enum StrandError {
    #[error("{0}")]
    Compile(#[from] CompileError),

    #[error("internal fault: {0}")]
    Fault(#[from] VmFault),

    #[error("bytecode load error: {0}")]
    Load(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Computes the Levenshtein distance between two strings
/// Used for "Did you mean?" suggestions
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();
    let (len1, len2) = (s1_chars.len(), s2_chars.len());

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    // Two-row variant of the classic matrix
    let mut prev: Vec<usize> = (0..=len2).collect();
    let mut row = vec![0; len2 + 1];

    for i in 1..=len1 {
        row[0] = i;
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };
            row[j] = (prev[j] + 1).min(row[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut row);
    }

    prev[len2]
}

/// Find the closest match from a list of candidates using Levenshtein distance
/// Returns None if no good match is found (distance > 3)
pub fn find_closest_match<'a>(target: &str, candidates: &'a [String]) -> Option<&'a str> {
    candidates
        .iter()
        .map(|candidate| (levenshtein_distance(target, candidate), candidate))
        .filter(|(distance, _)| *distance <= 3)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("same", "same"), 0);
    }

    #[test]
    fn test_closest_match() {
        let names = vec!["print".to_string(), "len".to_string(), "Fiber".to_string()];
        assert_eq!(find_closest_match("prnt", &names), Some("print"));
        assert_eq!(find_closest_match("completely_different", &names), None);
    }

    #[test]
    fn test_compile_error_display_has_context() {
        colored::control::set_override(false);
        let err = CompileError::new("main.sd".into(), "Unexpected token".into(), 2, 5)
            .with_source("x = = 1".into())
            .with_suggestion("y".into());
        let rendered = err.to_string();
        assert!(rendered.contains("Compile Error: Unexpected token"));
        assert!(rendered.contains("--> main.sd:2:5"));
        assert!(rendered.contains("x = = 1"));
        assert!(rendered.contains("Did you mean 'y'?"));
    }
}
