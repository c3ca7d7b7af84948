// File: src/fiber.rs
//
// Execution contexts for the Strand VM.
// A Fiber owns one operand stack and one frame stack and is the unit of
// cooperative scheduling. Closures pair a compiled Function with handles into
// the VM's upvalue arena; a cell is open while it aliases a live stack slot
// and closed once the owning frame has returned.

use crate::bytecode::Function;
use crate::runtime::object::Instance;
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// Index of a fiber in the VM's fiber arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub usize);

/// Index of a cell in the VM's upvalue arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpvalueId(pub usize);

/// A compiled function plus its captured upvalue cells
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: Vec<UpvalueId>,
}

impl Closure {
    pub fn new(function: Rc<Function>, upvalues: Vec<UpvalueId>) -> Self {
        Self { function, upvalues }
    }
}

/// Shared capture cell
#[derive(Debug, Clone)]
pub enum UpvalueCell {
    /// Aliases an absolute stack slot of a fiber
    Open { fiber: FiberId, slot: usize },
    /// Holds the value copied out when the owning frame returned
    Closed(Value),
}

impl UpvalueCell {
    /// Stack location of an open cell; `None` once the cell has been closed
    pub fn location(&self) -> Option<(FiberId, usize)> {
        match self {
            UpvalueCell::Open { fiber, slot } => Some((*fiber, *slot)),
            UpvalueCell::Closed(_) => None,
        }
    }
}

/// One active function invocation
pub struct CallFrame {
    pub closure: Rc<Closure>,
    pub ip: usize,
    /// Absolute stack index of slot 0 (the callee or receiver)
    pub base: usize,
    /// Replaces the function's return value (constructors and setters)
    pub result_override: Option<Value>,
    /// Set while running an overriding get/set for this receiver
    pub accessor_receiver: Option<Rc<RefCell<Instance>>>,
}

impl CallFrame {
    pub fn new(closure: Rc<Closure>, base: usize) -> Self {
        Self { closure, ip: 0, base, result_override: None, accessor_receiver: None }
    }

    /// Offset of the instruction currently being executed
    pub fn current_offset(&self) -> usize {
        self.ip.saturating_sub(1)
    }

    pub fn line(&self) -> Option<u32> {
        self.closure.function.debug.line_for(self.current_offset())
    }
}

/// Fiber lifecycle: `New` is left exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    New,
    /// Executing, or waiting on a fiber it called
    Running,
    /// Parked at a yield, waiting for `call`
    Suspended,
    Done,
}

pub struct Fiber {
    pub stack: Vec<Value>,
    pub sp: usize,
    pub frames: Vec<CallFrame>,
    /// The fiber that transferred control here; set only while in the yield chain
    pub caller: Option<FiberId>,
    pub state: FiberState,
    pub open_upvalues: Vec<UpvalueId>,
    pub entry: Rc<Closure>,
}

impl Fiber {
    pub fn new(entry: Rc<Closure>, initial_stack: usize) -> Self {
        Self {
            stack: vec![Value::Nil; initial_stack.max(4)],
            sp: 0,
            frames: Vec::new(),
            caller: None,
            state: FiberState::New,
            open_upvalues: Vec::new(),
            entry,
        }
    }

    pub fn push(&mut self, value: Value) {
        if self.sp == self.stack.len() {
            let grown = self.stack.len() * 4;
            self.stack.resize(grown, Value::Nil);
        }
        self.stack[self.sp] = value;
        self.sp += 1;
    }

    pub fn pop(&mut self) -> Option<Value> {
        if self.sp == 0 {
            return None;
        }
        self.sp -= 1;
        Some(std::mem::take(&mut self.stack[self.sp]))
    }

    /// Value `distance` slots below the top
    pub fn peek(&self, distance: usize) -> Option<&Value> {
        if distance >= self.sp {
            return None;
        }
        self.stack.get(self.sp - 1 - distance)
    }

    /// Drops everything at or above `height`
    pub fn truncate(&mut self, height: usize) {
        while self.sp > height {
            self.sp -= 1;
            self.stack[self.sp] = Value::Nil;
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == FiberState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::DebugInfo;

    fn empty_closure() -> Rc<Closure> {
        let function = Function {
            name: "test".into(),
            arity: 0,
            optional_params_start: 0,
            default_values: vec![],
            is_method: false,
            upvalues: vec![],
            code: vec![],
            constants: vec![],
            debug: DebugInfo::default(),
        };
        Rc::new(Closure::new(Rc::new(function), vec![]))
    }

    #[test]
    fn test_stack_grows_by_four() {
        let mut fiber = Fiber::new(empty_closure(), 4);
        for i in 0..5 {
            fiber.push(Value::Int(i));
        }
        assert_eq!(fiber.stack.len(), 16);
        assert_eq!(fiber.sp, 5);
        assert!(matches!(fiber.peek(0), Some(Value::Int(4))));
        assert!(matches!(fiber.peek(4), Some(Value::Int(0))));
        assert!(fiber.peek(5).is_none());
    }

    #[test]
    fn test_pop_and_truncate_clear_slots() {
        let mut fiber = Fiber::new(empty_closure(), 4);
        fiber.push(Value::Int(1));
        fiber.push(Value::Int(2));
        fiber.push(Value::Int(3));
        assert!(matches!(fiber.pop(), Some(Value::Int(3))));
        assert!(fiber.stack[2].is_nil());
        fiber.truncate(0);
        assert_eq!(fiber.sp, 0);
        assert!(fiber.stack[0].is_nil());
        assert!(fiber.pop().is_none());
    }

    #[test]
    fn test_closed_cell_has_no_location() {
        let open = UpvalueCell::Open { fiber: FiberId(0), slot: 3 };
        assert_eq!(open.location(), Some((FiberId(0), 3)));
        assert_eq!(UpvalueCell::Closed(Value::Int(1)).location(), None);
    }
}
