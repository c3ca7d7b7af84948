// File: src/lib.rs
//
// Library interface for the Strand language.
// Exposes the compiler, the VM and the runtime for embedding and for
// integration tests, plus one-call helpers for running source text.

pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod debug;
pub mod errors;
pub mod fiber;
pub mod lexer;
pub mod runtime;
pub mod value;
pub mod vm;

use crate::bytecode::Function;
use crate::config::VmConfig;
use crate::errors::{CompileError, StrandError};
use crate::lexer::{LexOptions, SourceFile};
use crate::runtime::RuntimeContext;
use crate::value::Value;
use crate::vm::Vm;
use std::rc::Rc;

/// Compiles source text against the globals of `ctx`
pub fn compile_source(
    name: &str,
    text: &str,
    ctx: &RuntimeContext,
    config: &VmConfig,
) -> Result<Rc<Function>, CompileError> {
    let source = SourceFile::new(name, text);
    compiler::compile_with(&source, ctx, LexOptions { breakpoints: config.breakpoints })
}

/// Compiles and runs a script on a fresh VM writing to stdout
pub fn run_source(name: &str, text: &str) -> Result<Value, StrandError> {
    let mut vm = Vm::new(VmConfig::default());
    run_on(&mut vm, name, text)
}

/// Compiles and runs a script on an existing VM
pub fn run_on(vm: &mut Vm, name: &str, text: &str) -> Result<Value, StrandError> {
    let function = compile_source(name, text, vm.context(), vm.config())?;
    Ok(vm.interpret(function)?)
}
