// File: src/debug.rs
//
// Breakpoint inspection interface. A debugger front-end implements
// `Inspector`; the VM hands it a read-only snapshot at every BREAKPOINT.

use crate::value::Value;
use std::io::Write;

/// One call frame as seen from a breakpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub function: String,
    pub line: Option<u32>,
}

/// Snapshot of VM state at a breakpoint
#[derive(Debug, Clone)]
pub struct BreakpointView {
    /// Bytecode offset of the BREAKPOINT instruction
    pub offset: usize,
    pub line: Option<u32>,
    /// Outermost first
    pub frames: Vec<FrameInfo>,
    /// Live locals of the innermost frame, in slot order
    pub locals: Vec<(String, Value)>,
    /// Operand stack depth of the innermost frame, relative to its base
    pub stack_depth: usize,
}

impl BreakpointView {
    /// The innermost visible binding for `name`
    pub fn local(&self, name: &str) -> Option<&Value> {
        self.locals.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

pub trait Inspector {
    fn on_breakpoint(&mut self, view: &BreakpointView);
}

/// Prints each breakpoint to a writer (stderr for the CLI)
pub struct PrintInspector<W: Write> {
    out: W,
}

impl<W: Write> PrintInspector<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> Inspector for PrintInspector<W> {
    fn on_breakpoint(&mut self, view: &BreakpointView) {
        let line = view.line.map(|l| l.to_string()).unwrap_or_else(|| "?".into());
        let _ = writeln!(self.out, "breakpoint at line {} (offset {}, stack depth {})", line, view.offset, view.stack_depth);
        for frame in view.frames.iter().rev() {
            let line = frame.line.map(|l| l.to_string()).unwrap_or_else(|| "?".into());
            let _ = writeln!(self.out, "  in {} at line {}", frame.function, line);
        }
        for (name, value) in view.locals.iter().filter(|(name, _)| !name.starts_with('(')) {
            let _ = writeln!(self.out, "    {} = {}", name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_inspector_output() {
        let view = BreakpointView {
            offset: 12,
            line: Some(3),
            frames: vec![
                FrameInfo { function: "<script>".into(), line: Some(7) },
                FrameInfo { function: "f".into(), line: Some(3) },
            ],
            locals: vec![("(seq)".into(), Value::Nil), ("x".into(), Value::Int(1))],
            stack_depth: 2,
        };
        let mut out = Vec::new();
        PrintInspector::new(&mut out).on_breakpoint(&view);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("breakpoint at line 3 (offset 12, stack depth 2)"));
        assert!(text.contains("  in f at line 3\n  in <script> at line 7"));
        assert!(text.contains("    x = 1"));
        assert!(!text.contains("(seq)"));
        assert!(matches!(view.local("x"), Some(Value::Int(1))));
    }
}
