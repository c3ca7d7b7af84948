// File: src/vm.rs
//
// Virtual Machine for executing Strand bytecode.
// Stack-based, single-threaded interpreter with an explicit frame stack per
// fiber: calls push a CallFrame and the dispatch loop continues, so deep
// language-level recursion never grows the host stack. Closures share an
// arena of upvalue cells; fibers transfer control cooperatively through
// `call` and `yield`.

use crate::bytecode::{ClassKind, Constant, Function, OpCode};
use crate::config::VmConfig;
use crate::debug::{BreakpointView, FrameInfo, Inspector};
use crate::errors::VmFault;
use crate::fiber::{CallFrame, Closure, Fiber, FiberId, FiberState, UpvalueCell, UpvalueId};
use crate::runtime::natives::{new_map, Intrinsic, GLOBAL_MODULE};
use crate::runtime::{AsyncBridge, ErrorKind, Instance, MapKey, NativeCtx, NativeFunction, NativeKind, RuntimeContext, SClass, Storage};
use crate::value::{arithmetic, compare, negate, ArithOp, BoundMethod, BoundNative, CompareOp, Value};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// Sequential little-endian operand reader. The instruction's full size is
/// validated before decoding, so reads stay in bounds.
struct Operands<'a> {
    code: &'a [u8],
    at: usize,
}

impl<'a> Operands<'a> {
    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.code[self.at..self.at + N]);
        self.at += N;
        buf
    }

    fn u8(&mut self) -> u8 {
        u8::from_le_bytes(self.bytes())
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.bytes())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.bytes())
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.bytes())
    }

    fn f64(&mut self) -> f64 {
        f64::from_le_bytes(self.bytes())
    }
}

/// Converts a compile-time constant into a runtime value
fn constant_value(constant: &Constant) -> Value {
    match constant {
        Constant::Nil => Value::Nil,
        Constant::Int(n) => Value::Int(*n),
        Constant::Double(d) => Value::Double(*d),
        Constant::Str(s) => Value::Str(Rc::clone(s)),
        Constant::Function(f) => Value::Closure(Rc::new(Closure::new(Rc::clone(f), Vec::new()))),
    }
}

/// The element at `cursor` and the cursor of the one after it. The cursor
/// is an element index, except for strings where it is a byte offset.
fn iteration_step(sequence: &Value, cursor: usize) -> Result<Option<(Value, usize)>, VmFault> {
    let step = match sequence {
        Value::Instance(inst) => {
            let inst = inst.borrow();
            let element = match &inst.storage {
                Storage::List(items) => items.get(cursor).cloned(),
                Storage::Map(entries) => entries.get_index(cursor).map(|(key, _)| key.to_value()),
                Storage::Plain => return Err(VmFault::NotIterable { type_name: inst.class.name.to_string() }),
            };
            element.map(|value| (value, cursor + 1))
        }
        Value::Range(start, end) => i64::try_from(cursor)
            .ok()
            .and_then(|offset| start.checked_add(offset))
            .filter(|value| value < end)
            .map(|value| (Value::Int(value), cursor + 1)),
        Value::Str(s) => s
            .get(cursor..)
            .and_then(|rest| rest.chars().next())
            .map(|c| (Value::Str(Rc::from(c.to_string())), cursor + c.len_utf8())),
        other => return Err(VmFault::NotIterable { type_name: other.type_name() }),
    };
    Ok(step)
}

fn constant_at(function: &Function, index: u32) -> Result<&Constant, VmFault> {
    function
        .constants
        .get(index as usize)
        .ok_or_else(|| VmFault::BadConstant { index: index as usize, function: function.name.clone() })
}

fn name_at(function: &Function, index: u32) -> Result<Rc<str>, VmFault> {
    match constant_at(function, index)? {
        Constant::Str(s) => Ok(Rc::clone(s)),
        _ => Err(VmFault::BadConstant { index: index as usize, function: function.name.clone() }),
    }
}

/// Virtual Machine for executing bytecode
pub struct Vm {
    /// Well-known classes, natives and globals of this VM instance
    ctx: RuntimeContext,

    config: VmConfig,

    /// Every fiber created by this VM; `FiberId` indexes it
    fibers: Vec<Fiber>,

    /// Arena of capture cells shared between closures
    upvalues: Vec<UpvalueCell>,

    /// The fiber currently executing
    current: FiberId,

    /// Completion channel for async natives
    bridge: AsyncBridge,

    /// Destination of `print`
    out: Box<dyn Write>,

    /// Receives breakpoint snapshots when set
    inspector: Option<Box<dyn Inspector>>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Self::with_output(config, Box::new(std::io::stdout()))
    }

    pub fn with_output(config: VmConfig, out: Box<dyn Write>) -> Self {
        Self::with_context(RuntimeContext::new(), config, out)
    }

    /// VM over a caller-prepared context (extra natives, globals)
    pub fn with_context(ctx: RuntimeContext, config: VmConfig, out: Box<dyn Write>) -> Self {
        Self {
            ctx,
            config,
            fibers: Vec::new(),
            upvalues: Vec::new(),
            current: FiberId(0),
            bridge: AsyncBridge::new(),
            out,
            inspector: None,
        }
    }

    pub fn set_inspector(&mut self, inspector: Box<dyn Inspector>) {
        self.inspector = Some(inspector);
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RuntimeContext {
        &mut self.ctx
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Runs a compiled script on a fresh root fiber until it returns or halts
    pub fn interpret(&mut self, function: Rc<Function>) -> Result<Value, VmFault> {
        let closure = Rc::new(Closure::new(function, Vec::new()));
        let mut fiber = Fiber::new(Rc::clone(&closure), self.config.initial_stack);
        fiber.push(Value::Closure(Rc::clone(&closure)));
        fiber.frames.push(CallFrame::new(closure, 0));
        fiber.state = FiberState::Running;

        let id = FiberId(self.fibers.len());
        self.fibers.push(fiber);
        self.current = id;
        tracing::debug!(fiber = id.0, "interpret");

        let result = self.run();
        if let Err(fault) = &result {
            tracing::debug!(%fault, "execution aborted");
        }
        result
    }

    // ---------------------------------------------------------------
    // Stack and frame access
    // ---------------------------------------------------------------

    fn fiber(&self) -> &Fiber {
        &self.fibers[self.current.0]
    }

    fn fiber_mut(&mut self) -> &mut Fiber {
        &mut self.fibers[self.current.0]
    }

    fn function_name(&self) -> String {
        self.fiber()
            .frames
            .last()
            .map(|f| f.closure.function.name.clone())
            .unwrap_or_else(|| "<none>".to_string())
    }

    fn underflow(&self) -> VmFault {
        VmFault::StackUnderflow { function: self.function_name() }
    }

    fn frame(&self) -> Result<&CallFrame, VmFault> {
        self.fiber().frames.last().ok_or_else(|| self.underflow())
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame, VmFault> {
        let fault = self.underflow();
        self.fiber_mut().frames.last_mut().ok_or(fault)
    }

    fn base(&self) -> Result<usize, VmFault> {
        Ok(self.frame()?.base)
    }

    fn push(&mut self, value: Value) {
        self.fiber_mut().push(value);
    }

    fn pop(&mut self) -> Result<Value, VmFault> {
        let base = self.base()?;
        if self.fiber().sp <= base {
            return Err(self.underflow());
        }
        self.fiber_mut().pop().ok_or_else(|| self.underflow())
    }

    fn peek(&self, distance: usize) -> Result<&Value, VmFault> {
        self.fiber().peek(distance).ok_or_else(|| self.underflow())
    }

    /// Pops `count` values, returned in stack order
    fn pop_n(&mut self, count: usize) -> Result<Vec<Value>, VmFault> {
        let base = self.base()?;
        let sp = self.fiber().sp;
        if sp < base + count {
            return Err(self.underflow());
        }
        let fiber = self.fiber_mut();
        let values = fiber.stack[sp - count..sp].iter_mut().map(std::mem::take).collect();
        fiber.sp = sp - count;
        Ok(values)
    }

    fn slot(&self, index: usize) -> Result<Value, VmFault> {
        let fiber = self.fiber();
        if index >= fiber.sp {
            return Err(self.underflow());
        }
        Ok(fiber.stack[index].clone())
    }

    fn set_slot(&mut self, index: usize, value: Value) -> Result<(), VmFault> {
        if index >= self.fiber().sp {
            return Err(self.underflow());
        }
        self.fiber_mut().stack[index] = value;
        Ok(())
    }

    fn error(&self, kind: ErrorKind, message: impl Into<String>) -> Value {
        self.ctx.error(kind, message)
    }

    // ---------------------------------------------------------------
    // Dispatch loop
    // ---------------------------------------------------------------

    fn run(&mut self) -> Result<Value, VmFault> {
        loop {
            let (function, ip) = {
                let frame = self.frame()?;
                (Rc::clone(&frame.closure.function), frame.ip)
            };
            let code = &function.code;
            let Some(&byte) = code.get(ip) else {
                return Err(VmFault::TruncatedOperand { offset: ip, function: function.name.clone() });
            };
            let op = OpCode::from_byte(byte)
                .ok_or_else(|| VmFault::InvalidOpcode { byte, offset: ip, function: function.name.clone() })?;
            let next = ip + op.size();
            if next > code.len() {
                return Err(VmFault::TruncatedOperand { offset: ip, function: function.name.clone() });
            }
            self.frame_mut()?.ip = next;

            if self.config.trace_execution {
                tracing::trace!(
                    fiber = self.current.0,
                    function = %function.name,
                    offset = ip,
                    op = op.mnemonic(),
                    sp = self.fiber().sp,
                    "exec"
                );
            }

            let mut operands = Operands { code, at: ip + 1 };
            match op {
                OpCode::Halt => {
                    if let Some(result) = self.finish_fiber(Value::Nil)? {
                        return Ok(result);
                    }
                }
                OpCode::ConstInt => self.push(Value::Int(operands.i64())),
                OpCode::ConstDouble => self.push(Value::Double(operands.f64())),
                OpCode::Const => {
                    let value = constant_value(constant_at(&function, operands.u32())?);
                    self.push(value);
                }
                OpCode::ConstNil => self.push(Value::Nil),
                OpCode::ConstId => {
                    let name = name_at(&function, operands.u32())?;
                    let value = self
                        .ctx
                        .global(&name)
                        .ok_or_else(|| VmFault::UndefinedGlobal { name: name.to_string() })?;
                    self.push(value);
                }
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::PopUnder => {
                    let count = operands.u16() as usize;
                    let top = self.pop()?;
                    self.pop_n(count)?;
                    self.push(top);
                }
                OpCode::Dup => {
                    let top = self.peek(0)?.clone();
                    self.push(top);
                }
                OpCode::GetLocal => {
                    let index = self.base()? + operands.u16() as usize;
                    let value = self.slot(index)?;
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let index = self.base()? + operands.u16() as usize;
                    let value = self.peek(0)?.clone();
                    self.set_slot(index, value)?;
                }
                OpCode::GetUpvalue => {
                    let id = self.upvalue_id(operands.u16())?;
                    let value = self.read_upvalue(id);
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let id = self.upvalue_id(operands.u16())?;
                    let value = self.peek(0)?.clone();
                    self.write_upvalue(id, value);
                }
                OpCode::Closure => {
                    let index = operands.u32();
                    let Constant::Function(target) = constant_at(&function, index)? else {
                        return Err(VmFault::BadConstant { index: index as usize, function: function.name.clone() });
                    };
                    let closure = self.make_closure(Rc::clone(target))?;
                    self.push(Value::Closure(closure));
                }
                OpCode::CloseUpvalues => {
                    let from = self.base()? + operands.u16() as usize;
                    self.close_upvalues(from);
                }

                OpCode::Add => self.arithmetic_op(ArithOp::Add)?,
                OpCode::Sub => self.arithmetic_op(ArithOp::Sub)?,
                OpCode::Mul => self.arithmetic_op(ArithOp::Mul)?,
                OpCode::Div => self.arithmetic_op(ArithOp::Div)?,
                OpCode::Mod => self.arithmetic_op(ArithOp::Mod)?,
                OpCode::Neg => {
                    let value = self.pop()?;
                    let result = negate(&value).unwrap_or_else(|message| self.error(ErrorKind::IllegalArgument, message));
                    self.push(result);
                }
                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::bool(!value.is_truthy()));
                }
                OpCode::Eq | OpCode::Ne => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    let equal = left.structural_eq(&right);
                    self.push(Value::bool(if op == OpCode::Eq { equal } else { !equal }));
                }
                OpCode::Lt => self.compare_op(CompareOp::Lt)?,
                OpCode::Le => self.compare_op(CompareOp::Le)?,
                OpCode::Gt => self.compare_op(CompareOp::Gt)?,
                OpCode::Ge => self.compare_op(CompareOp::Ge)?,
                OpCode::Is => {
                    let class = self.pop()?;
                    let value = self.pop()?;
                    let result = match &class {
                        Value::Class(class) => Value::bool(self.ctx.class_of(&value).check_is(class)),
                        other => self.error(
                            ErrorKind::IllegalArgument,
                            format!("right side of 'is' must be a class, got {}", other.type_name()),
                        ),
                    };
                    self.push(result);
                }

                OpCode::Jump => self.frame_mut()?.ip = operands.u32() as usize,
                OpCode::JumpIfFalse => {
                    let target = operands.u32() as usize;
                    if !self.pop()?.is_truthy() {
                        self.frame_mut()?.ip = target;
                    }
                }
                OpCode::JumpIfFalseKeep | OpCode::JumpIfTrueKeep | OpCode::JumpIfNotNilKeep => {
                    let target = operands.u32() as usize;
                    let top = self.peek(0)?;
                    let jump = match op {
                        OpCode::JumpIfFalseKeep => !top.is_truthy(),
                        OpCode::JumpIfTrueKeep => top.is_truthy(),
                        _ => !top.is_nil(),
                    };
                    if jump {
                        self.frame_mut()?.ip = target;
                    } else {
                        self.pop()?;
                    }
                }

                OpCode::Call => self.call_value(operands.u8() as usize)?,
                OpCode::Invoke => {
                    let name = name_at(&function, operands.u32())?;
                    let argc = operands.u8() as usize;
                    self.invoke(name, argc)?;
                }
                OpCode::Return => {
                    let value = self.pop()?;
                    if let Some(result) = self.return_from_frame(value)? {
                        return Ok(result);
                    }
                }

                OpCode::GetProp => {
                    let name = name_at(&function, operands.u32())?;
                    let object = self.pop()?;
                    self.get_property(object, name)?;
                }
                OpCode::SetProp => {
                    let name = name_at(&function, operands.u32())?;
                    let value = self.pop()?;
                    let object = self.pop()?;
                    self.set_property(object, name, value)?;
                }
                OpCode::GetIndex => {
                    let index = self.pop()?;
                    let object = self.pop()?;
                    let value = self.get_index(object, index)?;
                    self.push(value);
                }
                OpCode::SetIndex => {
                    let value = self.pop()?;
                    let index = self.pop()?;
                    let object = self.pop()?;
                    let result = self.set_index(object, index, value)?;
                    self.push(result);
                }
                OpCode::List => {
                    let items = self.pop_n(operands.u16() as usize)?;
                    let list = self.ctx.new_list(items);
                    self.push(list);
                }
                OpCode::Map => {
                    let flat = self.pop_n(2 * operands.u16() as usize)?;
                    let map = self.build_map(flat);
                    self.push(map);
                }
                OpCode::Range => {
                    let end = self.pop()?;
                    let start = self.pop()?;
                    let range = match (&start, &end) {
                        (Value::Int(a), Value::Int(b)) => Value::Range(*a, *b),
                        _ => self.error(
                            ErrorKind::IllegalArgument,
                            format!("range bounds must be Int, got {} and {}", start.type_name(), end.type_name()),
                        ),
                    };
                    self.push(range);
                }
                OpCode::Class => self.declare_class(&function, ip, &mut operands)?,
                OpCode::ForIter => {
                    let seq_slot = self.base()? + operands.u16() as usize;
                    let exit = operands.u32() as usize;
                    let sequence = self.slot(seq_slot)?;
                    let cursor = match self.slot(seq_slot + 1)? {
                        Value::Int(i) if i >= 0 => i as usize,
                        _ => usize::MAX,
                    };
                    match iteration_step(&sequence, cursor)? {
                        Some((element, next)) => {
                            self.set_slot(seq_slot + 1, Value::Int(next as i64))?;
                            self.push(element);
                        }
                        None => self.frame_mut()?.ip = exit,
                    }
                }
                OpCode::Yield => {
                    let value = self.pop()?;
                    self.yield_value(value)?;
                }
                OpCode::Breakpoint => self.hit_breakpoint(ip)?,
            }
        }
    }

    fn arithmetic_op(&mut self, op: ArithOp) -> Result<(), VmFault> {
        let right = self.pop()?;
        let left = self.pop()?;
        let result =
            arithmetic(op, &left, &right).unwrap_or_else(|message| self.error(ErrorKind::IllegalArgument, message));
        self.push(result);
        Ok(())
    }

    fn compare_op(&mut self, op: CompareOp) -> Result<(), VmFault> {
        let right = self.pop()?;
        let left = self.pop()?;
        self.push(compare(op, &left, &right));
        Ok(())
    }

    fn build_map(&self, flat: Vec<Value>) -> Value {
        let mut entries = IndexMap::with_capacity(flat.len() / 2);
        let mut values = flat.into_iter();
        while let (Some(key), Some(value)) = (values.next(), values.next()) {
            match MapKey::from_value(&key) {
                Some(key) => {
                    entries.insert(key, value);
                }
                None => {
                    return self.error(
                        ErrorKind::IllegalArgument,
                        format!("map keys must be Int or String, got {}", key.type_name()),
                    )
                }
            }
        }
        new_map(&self.ctx, entries)
    }

    fn declare_class(&mut self, function: &Function, offset: usize, operands: &mut Operands) -> Result<(), VmFault> {
        let name = name_at(function, operands.u32())?;
        let kind_byte = operands.u8();
        let supers = operands.u8() as usize;
        let mixins = operands.u8() as usize;
        let members = operands.u16() as usize;
        let kind = ClassKind::from_byte(kind_byte)
            .ok_or_else(|| VmFault::InvalidOpcode { byte: kind_byte, offset, function: function.name.clone() })?;

        let values = self.pop_n(supers + mixins + 2 * members)?;
        let (parents, member_values) = values.split_at(supers + mixins);

        let mut superclasses = Vec::with_capacity(supers);
        for value in &parents[..supers] {
            let class = Self::expect_class(&name, value)?;
            if class.kind == ClassKind::Final {
                return Err(VmFault::FinalSuperclass { class: name.to_string(), superclass: class.name.to_string() });
            }
            superclasses.push(class);
        }
        let mut mixin_classes = Vec::with_capacity(mixins);
        for value in &parents[supers..] {
            mixin_classes.push(Self::expect_class(&name, value)?);
        }

        let mut fields = IndexMap::with_capacity(members);
        for pair in member_values.chunks(2) {
            let Value::Str(member) = &pair[0] else {
                return Err(VmFault::BadConstant { index: 0, function: function.name.clone() });
            };
            fields.insert(Rc::clone(member), pair[1].clone());
        }

        let class = SClass::new(name, kind, fields, superclasses, mixin_classes);
        class.finalize_declr();
        self.push(Value::Class(Rc::new(class)));
        Ok(())
    }

    fn expect_class(class_name: &str, value: &Value) -> Result<Rc<SClass>, VmFault> {
        match value {
            Value::Class(class) => Ok(Rc::clone(class)),
            other => Err(VmFault::NotAClass { class: class_name.to_string(), type_name: other.type_name() }),
        }
    }

    // ---------------------------------------------------------------
    // Upvalues
    // ---------------------------------------------------------------

    fn upvalue_id(&self, index: u16) -> Result<UpvalueId, VmFault> {
        let frame = self.frame()?;
        frame.closure.upvalues.get(index as usize).copied().ok_or_else(|| VmFault::BadUpvalue {
            index: index as usize,
            function: frame.closure.function.name.clone(),
        })
    }

    fn read_upvalue(&self, id: UpvalueId) -> Value {
        match &self.upvalues[id.0] {
            UpvalueCell::Open { fiber, slot } => self.fibers[fiber.0].stack.get(*slot).cloned().unwrap_or_default(),
            UpvalueCell::Closed(value) => value.clone(),
        }
    }

    fn write_upvalue(&mut self, id: UpvalueId, value: Value) {
        match &mut self.upvalues[id.0] {
            UpvalueCell::Open { fiber, slot } => {
                if let Some(target) = self.fibers[fiber.0].stack.get_mut(*slot) {
                    *target = value;
                }
            }
            UpvalueCell::Closed(cell) => *cell = value,
        }
    }

    /// Returns the open cell for an absolute slot of the current fiber,
    /// creating it on first capture so closures share one cell per local
    fn capture_upvalue(&mut self, slot: usize) -> UpvalueId {
        let fiber_id = self.current;
        let existing = self.fibers[fiber_id.0]
            .open_upvalues
            .iter()
            .copied()
            .find(|id| self.upvalues[id.0].location() == Some((fiber_id, slot)));
        if let Some(id) = existing {
            return id;
        }
        let id = UpvalueId(self.upvalues.len());
        self.upvalues.push(UpvalueCell::Open { fiber: fiber_id, slot });
        self.fibers[fiber_id.0].open_upvalues.push(id);
        id
    }

    /// Closes every open cell of the current fiber at or above `from`
    fn close_upvalues(&mut self, from: usize) {
        let fiber = &mut self.fibers[self.current.0];
        let mut still_open = Vec::with_capacity(fiber.open_upvalues.len());
        for id in std::mem::take(&mut fiber.open_upvalues) {
            match self.upvalues[id.0].location() {
                Some((_, slot)) if slot >= from => {
                    let value = fiber.stack.get(slot).cloned().unwrap_or_default();
                    self.upvalues[id.0] = UpvalueCell::Closed(value);
                }
                _ => still_open.push(id),
            }
        }
        fiber.open_upvalues = still_open;
    }

    fn make_closure(&mut self, function: Rc<Function>) -> Result<Rc<Closure>, VmFault> {
        let base = self.base()?;
        let mut cells = Vec::with_capacity(function.upvalues.len());
        for desc in &function.upvalues {
            let id = if desc.is_local {
                self.capture_upvalue(base + desc.index as usize)
            } else {
                self.upvalue_id(desc.index)?
            };
            cells.push(id);
        }
        Ok(Rc::new(Closure::new(function, cells)))
    }

    // ---------------------------------------------------------------
    // Calls
    // ---------------------------------------------------------------

    fn callee_index(&self, argc: usize) -> Result<usize, VmFault> {
        let base = self.base()?;
        match self.fiber().sp.checked_sub(argc + 1) {
            Some(index) if index >= base => Ok(index),
            _ => Err(self.underflow()),
        }
    }

    /// Drops a failed call's callee and arguments and leaves `result` in their place
    fn replace_call(&mut self, callee_index: usize, result: Value) {
        self.fiber_mut().truncate(callee_index);
        self.push(result);
    }

    /// `CALL argc`: the callee sits below its arguments
    fn call_value(&mut self, argc: usize) -> Result<(), VmFault> {
        let callee_index = self.callee_index(argc)?;
        let callee = self.fiber().stack[callee_index].clone();
        match callee {
            Value::Closure(closure) => self.call_closure(closure, argc).map(|_| ()),
            Value::Method(bound) => {
                self.fiber_mut().stack[callee_index] = bound.receiver.clone();
                self.call_closure(Rc::clone(&bound.closure), argc).map(|_| ())
            }
            Value::Native(bound) => self.call_native(&bound.native, bound.receiver.clone(), argc),
            Value::Class(class) => self.construct(class, argc),
            other => Err(VmFault::NotCallable { type_name: other.type_name() }),
        }
    }

    /// Pushes a frame for `closure` over the top `argc` values. Returns false
    /// when the argument count is wrong and an error value was produced instead.
    fn call_closure(&mut self, closure: Rc<Closure>, argc: usize) -> Result<bool, VmFault> {
        let callee_index = self.callee_index(argc)?;
        let function = Rc::clone(&closure.function);
        if !function.accepts(argc) {
            let expected = if function.optional_params_start == function.arity {
                function.arity.to_string()
            } else {
                format!("{} to {}", function.optional_params_start, function.arity)
            };
            let error = self.error(
                ErrorKind::IllegalArgument,
                format!("{}() expects {} arguments, got {}", function.name, expected, argc),
            );
            self.replace_call(callee_index, error);
            return Ok(false);
        }

        for param in argc..function.arity as usize {
            let default = param
                .checked_sub(function.optional_params_start as usize)
                .and_then(|i| function.default_values.get(i))
                .map(constant_value)
                .unwrap_or_default();
            self.push(default);
        }

        if self.fiber().frames.len() >= self.config.max_frames {
            return Err(VmFault::FrameOverflow { max: self.config.max_frames });
        }
        tracing::debug!(function = %function.name, depth = self.fiber().frames.len(), "call");
        self.fiber_mut().frames.push(CallFrame::new(closure, callee_index));
        Ok(true)
    }

    /// Collects the arguments above `callee_index` and drops them with the callee
    fn take_args(&mut self, callee_index: usize) -> Vec<Value> {
        let fiber = self.fiber_mut();
        let args = fiber.stack[callee_index + 1..fiber.sp].iter_mut().map(std::mem::take).collect();
        fiber.truncate(callee_index);
        args
    }

    fn call_native(&mut self, native: &Rc<NativeFunction>, receiver: Value, argc: usize) -> Result<(), VmFault> {
        let callee_index = self.callee_index(argc)?;
        if !native.accepts(argc) {
            let error = self.error(
                ErrorKind::IllegalArgument,
                format!("{}.{}() expects {} arguments, got {}", native.class_name, native.name, native.arity, argc),
            );
            self.replace_call(callee_index, error);
            return Ok(());
        }
        let mut args = self.take_args(callee_index);
        native.fill_defaults(&mut args);
        if let Some(result) = self.invoke_native(native, receiver, args)? {
            self.push(result);
        }
        Ok(())
    }

    /// Runs a native. `None` means control moved to another fiber and the
    /// result will be delivered later.
    fn invoke_native(
        &mut self,
        native: &Rc<NativeFunction>,
        receiver: Value,
        args: Vec<Value>,
    ) -> Result<Option<Value>, VmFault> {
        match native.kind {
            NativeKind::Sync(f) => {
                let mut cx = NativeCtx { ctx: &self.ctx, out: &mut *self.out };
                Ok(Some(f(&mut cx, &receiver, &args)))
            }
            NativeKind::Async(f) => {
                let completion = self.bridge.completion();
                let ticket = completion.ticket();
                tracing::debug!(native = %native.name, ticket, "awaiting async native");
                {
                    let mut cx = NativeCtx { ctx: &self.ctx, out: &mut *self.out };
                    f(&mut cx, &receiver, &args, completion);
                }
                let value = self.bridge.wait(ticket)?;
                Ok(Some(value.into_value(&self.ctx)))
            }
            NativeKind::Intrinsic(intrinsic) => self.intrinsic(intrinsic, receiver, args),
        }
    }

    /// Calling a class: copy fields into a new instance, then run `init`
    fn construct(&mut self, class: Rc<SClass>, argc: usize) -> Result<(), VmFault> {
        let callee_index = self.callee_index(argc)?;
        if Rc::ptr_eq(&class, &self.ctx.classes.fiber) {
            let native = self
                .ctx
                .natives
                .lookup(GLOBAL_MODULE, "Fiber")
                .ok_or_else(|| VmFault::NotCallable { type_name: "Class".to_string() })?;
            return self.call_native(&native, Value::Nil, argc);
        }

        let instance = Rc::new(RefCell::new(Instance::new(Rc::clone(&class))));
        let receiver = Value::Instance(Rc::clone(&instance));

        if let Some(Value::Closure(init)) = class.find_member("init") {
            self.fiber_mut().stack[callee_index] = receiver.clone();
            if self.call_closure(init, argc)? {
                self.frame_mut()?.result_override = Some(receiver);
            }
            return Ok(());
        }

        if let Some(native) = self.ctx.find_native(&class, "init") {
            if !native.accepts(argc) {
                let error = self.error(
                    ErrorKind::IllegalArgument,
                    format!("{}() expects at most {} arguments, got {}", class.name, native.arity, argc),
                );
                self.replace_call(callee_index, error);
                return Ok(());
            }
            let mut args = self.take_args(callee_index);
            native.fill_defaults(&mut args);
            let result = self.invoke_native(&native, receiver.clone(), args)?.unwrap_or_default();
            let result = match result {
                Value::Instance(err) if err.borrow().is_error() && !Rc::ptr_eq(&err, &instance) => Value::Instance(err),
                _ => {
                    if instance.borrow().is_error() {
                        instance.borrow_mut().lock();
                    }
                    receiver
                }
            };
            self.push(result);
            return Ok(());
        }

        let result = if argc > 0 {
            self.error(
                ErrorKind::IllegalArgument,
                format!("{}() takes no constructor arguments, got {}", class.name, argc),
            )
        } else {
            receiver
        };
        self.replace_call(callee_index, result);
        Ok(())
    }

    /// `INVOKE name argc`: method call on the receiver below the arguments
    fn invoke(&mut self, name: Rc<str>, argc: usize) -> Result<(), VmFault> {
        let receiver_index = self.callee_index(argc)?;
        let receiver = self.fiber().stack[receiver_index].clone();

        let class = match &receiver {
            Value::Instance(inst) => {
                let field = inst.borrow().fields.get(&*name).cloned();
                if let Some(field) = field.filter(Value::is_callable) {
                    self.fiber_mut().stack[receiver_index] = field;
                    return self.call_value(argc);
                }
                Some(Rc::clone(&inst.borrow().class))
            }
            Value::Class(class) => Some(Rc::clone(class)),
            _ => None,
        };

        if let Some(class) = &class {
            match class.find_member(&name) {
                Some(Value::Closure(method)) if method.function.is_method => {
                    return self.call_closure(method, argc).map(|_| ());
                }
                Some(member) if member.is_callable() => {
                    self.fiber_mut().stack[receiver_index] = member;
                    return self.call_value(argc);
                }
                _ => {}
            }
            if let Some(native) = self.ctx.find_native(class, &name) {
                return self.call_native(&native, receiver, argc);
            }
        }

        let value_class = self.ctx.class_of(&receiver);
        if let Some(native) = self.ctx.find_native(&value_class, &name) {
            return self.call_native(&native, receiver, argc);
        }

        let error = self.error(
            ErrorKind::IllegalArgument,
            format!("{} has no method '{}'", receiver.type_name(), name),
        );
        self.replace_call(receiver_index, error);
        Ok(())
    }

    fn return_from_frame(&mut self, value: Value) -> Result<Option<Value>, VmFault> {
        let frame = self.fiber_mut().frames.pop().ok_or_else(|| self.underflow())?;
        let result = frame.result_override.unwrap_or(value);
        self.close_upvalues(frame.base);
        tracing::debug!(function = %frame.closure.function.name, "return");

        if self.fiber().frames.is_empty() {
            return self.finish_fiber(result);
        }
        self.fiber_mut().truncate(frame.base);
        self.push(result);
        Ok(None)
    }

    // ---------------------------------------------------------------
    // Properties and indexing
    // ---------------------------------------------------------------

    /// Whether the current frame is an accessor override running for `inst`
    fn in_accessor_of(&self, inst: &Rc<RefCell<Instance>>) -> Result<bool, VmFault> {
        Ok(self.frame()?.accessor_receiver.as_ref().is_some_and(|r| Rc::ptr_eq(r, inst)))
    }

    fn get_property(&mut self, object: Value, name: Rc<str>) -> Result<(), VmFault> {
        if let Value::Instance(inst) = &object {
            let class = Rc::clone(&inst.borrow().class);
            if !self.in_accessor_of(inst)? {
                if let Some(getter) = class.overridden_get() {
                    self.push(object.clone());
                    self.push(Value::Str(name));
                    if self.call_closure(getter, 1)? {
                        self.frame_mut()?.accessor_receiver = Some(Rc::clone(inst));
                    }
                    return Ok(());
                }
            }

            let field = inst.borrow().fields.get(&*name).cloned();
            if let Some(value) = field {
                self.push(value);
                return Ok(());
            }
            if let Some(member) = class.find_member(&name) {
                let value = match member {
                    Value::Closure(method) if method.function.is_method => {
                        Value::Method(Rc::new(BoundMethod { receiver: object.clone(), closure: method }))
                    }
                    other => other,
                };
                self.push(value);
                return Ok(());
            }
        }

        if let Value::Class(class) = &object {
            if let Some(member) = class.find_member(&name) {
                self.push(member);
                return Ok(());
            }
        }

        let class = self.ctx.class_of(&object);
        let value = match self.ctx.find_native(&class, &name) {
            Some(native) => Value::Native(Rc::new(BoundNative { receiver: object, native })),
            None => Value::Nil,
        };
        self.push(value);
        Ok(())
    }

    fn set_property(&mut self, object: Value, name: Rc<str>, value: Value) -> Result<(), VmFault> {
        let Value::Instance(inst) = &object else {
            let error = self.error(
                ErrorKind::IllegalArgument,
                format!("cannot set property '{}' on {}", name, object.type_name()),
            );
            self.push(error);
            return Ok(());
        };

        let class = Rc::clone(&inst.borrow().class);
        if inst.borrow().is_locked() {
            let error = self.ctx.locked_error(&class.name);
            self.push(error);
            return Ok(());
        }

        if !self.in_accessor_of(inst)? {
            if let Some(setter) = class.overridden_set() {
                self.push(object.clone());
                self.push(Value::Str(name));
                self.push(value.clone());
                if self.call_closure(setter, 2)? {
                    let frame = self.frame_mut()?;
                    frame.accessor_receiver = Some(Rc::clone(inst));
                    frame.result_override = Some(value);
                }
                return Ok(());
            }
        }

        let stored = {
            let mut instance = inst.borrow_mut();
            if instance.fields.contains_key(&*name) || class.kind == ClassKind::Open {
                instance.fields.insert(Rc::clone(&name), value.clone());
                true
            } else {
                false
            }
        };
        let result = if stored {
            value
        } else {
            self.error(ErrorKind::IllegalArgument, format!("class {} has no field '{}'", class.name, name))
        };
        self.push(result);
        Ok(())
    }

    /// Runs a collection native synchronously on behalf of an index opcode
    fn collection_native(&mut self, object: &Value, name: &str, args: Vec<Value>) -> Result<Option<Value>, VmFault> {
        let class = self.ctx.class_of(object);
        match self.ctx.find_native(&class, name) {
            Some(native) => self.invoke_native(&native, object.clone(), args),
            None => Ok(None),
        }
    }

    fn get_index(&mut self, object: Value, index: Value) -> Result<Value, VmFault> {
        let result = match (&object, &index) {
            (Value::Instance(inst), _) if !matches!(inst.borrow().storage, Storage::Plain) => {
                self.collection_native(&object, "get", vec![index.clone()])?
            }
            // Indexed by character, not byte
            (Value::Str(s), Value::Int(i)) => usize::try_from(*i)
                .ok()
                .and_then(|i| s.chars().nth(i))
                .map(|c| Value::Str(Rc::from(c.to_string()))),
            (Value::Range(start, end), Value::Int(i)) => {
                start.checked_add(*i).filter(|v| *i >= 0 && v < end).map(Value::Int)
            }
            _ => None,
        };
        Ok(result.unwrap_or_else(|| {
            self.error(
                ErrorKind::IllegalArgument,
                format!("cannot index {} with {}", object.type_name(), index.type_name()),
            )
        }))
    }

    fn set_index(&mut self, object: Value, index: Value, value: Value) -> Result<Value, VmFault> {
        let setter = match &object {
            Value::Instance(inst) => match inst.borrow().storage {
                Storage::List(_) => Some("set"),
                Storage::Map(_) => Some("put"),
                Storage::Plain => None,
            },
            _ => None,
        };
        let result = match setter {
            Some(name) => self.collection_native(&object, name, vec![index.clone(), value])?,
            None => None,
        };
        Ok(result.unwrap_or_else(|| {
            self.error(
                ErrorKind::IllegalArgument,
                format!("cannot assign an element of {}", object.type_name()),
            )
        }))
    }

    // ---------------------------------------------------------------
    // Fibers
    // ---------------------------------------------------------------

    fn intrinsic(&mut self, intrinsic: Intrinsic, receiver: Value, args: Vec<Value>) -> Result<Option<Value>, VmFault> {
        let arg = args.into_iter().next().unwrap_or_default();
        match (intrinsic, receiver) {
            (Intrinsic::FiberNew, _) => match arg {
                Value::Closure(entry) if entry.function.arity <= 1 => {
                    let id = FiberId(self.fibers.len());
                    self.fibers.push(Fiber::new(entry, self.config.initial_stack));
                    tracing::debug!(fiber = id.0, "fiber created");
                    Ok(Some(Value::Fiber(id)))
                }
                other => Ok(Some(self.error(
                    ErrorKind::IllegalArgument,
                    format!("Fiber() expects a function taking at most one argument, got {}", other.type_name()),
                ))),
            },
            (Intrinsic::FiberIsDone, Value::Fiber(id)) => {
                Ok(Some(Value::bool(self.fibers.get(id.0).is_some_and(Fiber::is_done))))
            }
            (Intrinsic::FiberCall, Value::Fiber(id)) => self.resume_fiber(id, arg),
            (_, other) => Ok(Some(self.error(
                ErrorKind::IllegalArgument,
                format!("expected a Fiber receiver, got {}", other.type_name()),
            ))),
        }
    }

    /// Transfers control to `id`; its next yield (or its return) becomes the
    /// result of the caller's pending `call`
    fn resume_fiber(&mut self, id: FiberId, arg: Value) -> Result<Option<Value>, VmFault> {
        let Some(state) = self.fibers.get(id.0).map(|f| f.state) else {
            return Ok(Some(self.error(ErrorKind::IllegalArgument, "unknown fiber")));
        };
        let caller = self.current;
        match state {
            FiberState::Done => {
                return Ok(Some(self.error(ErrorKind::IllegalArgument, "cannot call a fiber that has finished")));
            }
            FiberState::Running => {
                return Ok(Some(self.error(ErrorKind::IllegalArgument, "cannot call a fiber that is already running")));
            }
            FiberState::New => {
                let fiber = &mut self.fibers[id.0];
                let entry = Rc::clone(&fiber.entry);
                fiber.push(Value::Closure(Rc::clone(&entry)));
                if entry.function.arity >= 1 {
                    fiber.push(arg);
                }
                fiber.frames.push(CallFrame::new(entry, 0));
            }
            FiberState::Suspended => self.fibers[id.0].push(arg),
        }

        let fiber = &mut self.fibers[id.0];
        fiber.state = FiberState::Running;
        fiber.caller = Some(caller);
        self.current = id;
        tracing::debug!(from = caller.0, to = id.0, "fiber resumed");
        Ok(None)
    }

    fn yield_value(&mut self, value: Value) -> Result<(), VmFault> {
        let fiber = self.fiber_mut();
        let caller = fiber.caller.take().ok_or(VmFault::YieldFromRoot)?;
        fiber.state = FiberState::Suspended;
        tracing::debug!(from = self.current.0, to = caller.0, "fiber yielded");
        self.current = caller;
        self.push(value);
        Ok(())
    }

    /// Marks the current fiber done. Returns the result when it was the
    /// outermost fiber, otherwise hands it to the caller.
    fn finish_fiber(&mut self, result: Value) -> Result<Option<Value>, VmFault> {
        self.close_upvalues(0);
        let fiber = self.fiber_mut();
        fiber.frames.clear();
        fiber.truncate(0);
        fiber.state = FiberState::Done;
        match fiber.caller.take() {
            Some(caller) => {
                tracing::debug!(from = self.current.0, to = caller.0, "fiber finished");
                self.current = caller;
                self.push(result);
                Ok(None)
            }
            None => Ok(Some(result)),
        }
    }

    // ---------------------------------------------------------------
    // Debugging
    // ---------------------------------------------------------------

    fn hit_breakpoint(&mut self, offset: usize) -> Result<(), VmFault> {
        if !self.config.breakpoints || self.inspector.is_none() {
            return Ok(());
        }
        let view = self.breakpoint_view(offset)?;
        if let Some(inspector) = self.inspector.as_mut() {
            inspector.on_breakpoint(&view);
        }
        Ok(())
    }

    fn breakpoint_view(&self, offset: usize) -> Result<BreakpointView, VmFault> {
        let fiber = self.fiber();
        let frame = self.frame()?;
        let function = &frame.closure.function;

        let mut locals: Vec<(u16, String, Value)> = function
            .debug
            .locals_at(offset)
            .map(|info| {
                let value = fiber.stack.get(frame.base + info.slot as usize).cloned().unwrap_or_default();
                (info.slot, info.name.clone(), value)
            })
            .collect();
        locals.sort_by_key(|(slot, _, _)| *slot);

        Ok(BreakpointView {
            offset,
            line: function.debug.line_for(offset),
            frames: fiber
                .frames
                .iter()
                .map(|f| FrameInfo { function: f.closure.function.name.clone(), line: f.line() })
                .collect(),
            locals: locals.into_iter().map(|(_, name, value)| (name, value)).collect(),
            stack_depth: fiber.sp - frame.base,
        })
    }
}

/// Shared in-memory sink for `print` output, for embedding and tests
#[derive(Clone, Default)]
pub struct CapturedOutput(Rc<RefCell<Vec<u8>>>);

impl CapturedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{DebugInfo, UpvalueDesc};
    use crate::compiler::compile;
    use crate::lexer::SourceFile;

    fn run_vm_code(code: &str) -> Result<(Value, String), String> {
        let output = CapturedOutput::new();
        let mut vm = Vm::with_output(VmConfig::default(), Box::new(output.clone()));
        let function = compile(&SourceFile::new("test.sd", code), vm.context()).map_err(|e| e.message)?;
        let value = vm.interpret(function).map_err(|e| e.to_string())?;
        Ok((value, output.contents()))
    }

    fn eval(code: &str) -> String {
        match run_vm_code(code) {
            Ok((value, _)) => value.to_string(),
            Err(err) => panic!("{} failed: {}", code, err),
        }
    }

    fn raw_function(code: Vec<u8>, constants: Vec<Constant>) -> Rc<Function> {
        Rc::new(Function {
            name: "raw".into(),
            arity: 0,
            optional_params_start: 0,
            default_values: vec![],
            is_method: false,
            upvalues: vec![],
            code,
            constants,
            debug: DebugInfo::default(),
        })
    }

    #[test]
    fn test_arithmetic_results() {
        assert_eq!(eval("1 + 2"), "3");
        assert_eq!(eval("5 / 2"), "2.5");
        assert_eq!(eval("4 / 2"), "2");
        assert_eq!(eval("nil + 5"), "nil");
        assert_eq!(eval("\"a\" + 1"), "a1");
        assert_eq!(eval("7 % 0"), "IllegalArgumentException: Modulo by zero");
    }

    #[test]
    fn test_if_and_when_expressions() {
        assert_eq!(eval("let r = if true { 1 } else { 2 }\nr"), "1");
        assert_eq!(eval("let x = 3\nlet r = when x { 1, 2 -> \"low\"\n 3 -> \"three\"\n else -> \"high\" }\nr"), "three");
        assert_eq!(eval("let x = 10\nlet r = when { x < 5 -> 1\n else -> 2 }\nr"), "2");
    }

    #[test]
    fn test_while_with_break_and_continue() {
        let code = "
            let total = 0
            let i = 0
            while i < 10 {
                i = i + 1
                let half = i % 2
                if half == 0 { continue }
                if i > 7 { let stop = i\n break }
                total = total + i
            }
            total
        ";
        assert_eq!(eval(code), "16");
    }

    #[test]
    fn test_for_loops() {
        assert_eq!(eval("let s = 0\nfor i in 1..5 { s = s + i }\ns"), "10");
        assert_eq!(eval("let s = \"\"\nfor c in \"abc\" { s = c + s }\ns"), "cba");
        assert_eq!(eval("let n = 0\nfor k in [\"a\": 1, \"b\": 2] { n = n + 1 }\nn"), "2");
    }

    #[test]
    fn test_for_over_multibyte_string() {
        let code = "
            let text = \"h\u{e9}llo\u{2192}\u{fc}\"
            let out = []
            for c in text { out.add(c) }
            [len(out), out[1], out[5], out[6], text[5]]
        ";
        assert_eq!(eval(code), "[7, \"\u{e9}\", \"\u{2192}\", \"\u{fc}\", \"\u{2192}\"]");
    }

    #[test]
    fn test_for_over_non_iterable_is_fault() {
        let err = run_vm_code("for i in 5 { print(i) }").unwrap_err();
        assert_eq!(err, VmFault::NotIterable { type_name: "Int".to_string() }.to_string());
        let err = run_vm_code("class Plain { }\nfor i in Plain() { }").unwrap_err();
        assert!(err.contains("cannot iterate over a value of type Plain"), "{}", err);
    }

    #[test]
    fn test_recursion_and_defaults() {
        assert_eq!(eval("fn fib(n) = if n < 2 { n } else { fib(n - 1) + fib(n - 2) }\nfib(15)"), "610");
        assert_eq!(eval("fn add(a, b = 10) = a + b\nadd(1) + add(1, 1)"), "13");
        assert!(eval("fn f(a) = a\nf()").starts_with("IllegalArgumentException"));
    }

    #[test]
    fn test_closures_share_captured_local() {
        let code = "
            fn counter() {
                let n = 0
                let inc = fn() { n = n + 1 }
                let get = fn() = n
                [inc, get]
            }
            let pair = counter()
            pair[0]()
            pair[0]()
            pair[1]()
        ";
        assert_eq!(eval(code), "2");
    }

    #[test]
    fn test_loop_closures_capture_each_iteration() {
        let code = "
            let fns = []
            for i in 0..3 { fns.add(fn() = i * 10) }
            fns[0]() + fns[1]() + fns[2]()
        ";
        assert_eq!(eval(code), "30");
    }

    #[test]
    fn test_classes_and_methods() {
        let code = "
            class Point {
                x = 0
                y = 0
                fn init(x, y) { self.x = x\n self.y = y }
                fn sum() = self.x + self.y
            }
            let p = Point(3, 4)
            p.sum()
        ";
        assert_eq!(eval(code), "7");
        assert_eq!(eval("class A { v = 1 }\nlet a = A()\nlet r = a.missing = 2\nr"), "IllegalArgumentException: class A has no field 'missing'");
        assert_eq!(eval("open class A { v = 1 }\nlet a = A()\na.extra = 2\na.extra"), "2");
    }

    #[test]
    fn test_getter_override_from_second_superclass() {
        let code = "
            class A { a = 1 }
            class B { fn get(name) = \"B:\" + name }
            class C : A, B { }
            let c = C()
            [c.anything, c is A, c is B]
        ";
        assert_eq!(eval(code), "[\"B:anything\", 1, 1]");
    }

    #[test]
    fn test_accessor_bypass_inside_override() {
        let code = "
            class Logged {
                value = 0
                writes = 0
                fn set(name, v) { self.writes = self.writes + 1\n self.value = v }
            }
            let l = Logged()
            l.value = 5
            l.value = 6
            [l.value, l.writes]
        ";
        assert_eq!(eval(code), "[6, 2]");
    }

    #[test]
    fn test_locked_instance_rejects_mutation() {
        let code = "
            class Box { v = 1 }
            let b = Box().lock()
            let r = b.v = 2
            [r is MutabilityLockException, b.v]
        ";
        assert_eq!(eval(code), "[1, 1]");
        assert_eq!(eval("let l = [1].lock()\nl[0] = 5\nl"), "[1]");
    }

    #[test]
    fn test_fibers_yield_and_resume() {
        let code = "
            let f = Fiber(fn(start) {
                let got = yield start + 1
                let again = yield got * 2
                again + 100
            })
            let a = f.call(1)
            let b = f.call(10)
            let c = f.call(5)
            [a, b, c, f.isDone()]
        ";
        assert_eq!(eval(code), "[2, 20, 105, 1]");
        assert!(eval("let f = Fiber(fn() = 1)\nf.call()\nf.call()").starts_with("IllegalArgumentException"));
    }

    #[test]
    fn test_yield_from_root_is_fault() {
        assert_eq!(run_vm_code("yield 1").unwrap_err(), VmFault::YieldFromRoot.to_string());
    }

    #[test]
    fn test_print_and_natives() {
        let (_, out) = run_vm_code("print(\"hi\")\nprint(len([1, 2, 3]))\nprint(\"abc\".upper())\nprint()").unwrap();
        assert_eq!(out, "hi\n3\nABC\n\n");
    }

    #[test]
    fn test_async_native_result() {
        assert_eq!(eval("Sys.sleep(1)"), "nil");
        assert!(eval("File.readAsync(\"/definitely/not/here.sd\")").starts_with("IOException"));
    }

    #[test]
    fn test_call_non_callable_is_fault() {
        let err = run_vm_code("let x = 1\nx()").unwrap_err();
        assert!(err.contains("not callable"), "{}", err);
    }

    #[test]
    fn test_frame_overflow_is_fault() {
        let mut vm = Vm::with_output(VmConfig { max_frames: 64, ..VmConfig::default() }, Box::new(CapturedOutput::new()));
        let function = compile(&SourceFile::new("t.sd", "fn f(n) = f(n + 1)\nf(0)"), vm.context()).unwrap();
        assert_eq!(vm.interpret(function).unwrap_err(), VmFault::FrameOverflow { max: 64 });
    }

    #[test]
    fn test_invalid_bytecode_faults() {
        let mut vm = Vm::with_output(VmConfig::default(), Box::new(CapturedOutput::new()));
        let err = vm.interpret(raw_function(vec![0xff], vec![])).unwrap_err();
        assert!(matches!(err, VmFault::InvalidOpcode { byte: 0xff, offset: 0, .. }));

        let err = vm.interpret(raw_function(vec![OpCode::ConstInt as u8, 1, 2], vec![])).unwrap_err();
        assert!(matches!(err, VmFault::TruncatedOperand { offset: 0, .. }));

        let err = vm.interpret(raw_function(vec![OpCode::Pop as u8, OpCode::Pop as u8], vec![])).unwrap_err();
        assert!(matches!(err, VmFault::StackUnderflow { .. }));

        let mut function = (*raw_function(vec![OpCode::GetUpvalue as u8, 0, 0], vec![])).clone();
        function.upvalues = vec![UpvalueDesc { is_local: true, index: 0 }];
        let err = vm.interpret(Rc::new(function)).unwrap_err();
        assert!(matches!(err, VmFault::BadUpvalue { index: 0, .. }));
    }
}
