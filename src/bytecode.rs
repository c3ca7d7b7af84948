// File: src/bytecode.rs
//
// Bytecode instruction definitions and structures for the Strand VM.
// Defines the OpCode table (one byte per opcode followed by fixed-width
// little-endian operands), the immutable compiled `Function` unit with its
// constant pool and debug info, a disassembler, and the serialized bytecode
// file format.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::rc::Rc;

/// Operand encodings. Widths are fixed per opcode and never vary at runtime.
/// All multi-byte operands are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    U8,
    U16,
    U32,
    I64,
    F64,
}

impl Operand {
    pub const fn width(self) -> usize {
        match self {
            Operand::U8 => 1,
            Operand::U16 => 2,
            Operand::U32 => 4,
            Operand::I64 | Operand::F64 => 8,
        }
    }
}

macro_rules! opcodes {
    ($( $(#[$doc:meta])* $name:ident = $byte:literal, $mnemonic:literal, [$($operand:ident),*]; )*) => {
        /// Bytecode instruction opcodes for the Strand VM
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum OpCode {
            $( $(#[$doc])* $name = $byte, )*
        }

        impl OpCode {
            /// Decodes an opcode byte; `None` for undefined bytes
            pub fn from_byte(byte: u8) -> Option<OpCode> {
                match byte {
                    $( $byte => Some(OpCode::$name), )*
                    _ => None,
                }
            }

            /// Assembly mnemonic used by the disassembler
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( OpCode::$name => $mnemonic, )*
                }
            }

            /// Operand layout following the opcode byte
            pub fn operands(self) -> &'static [Operand] {
                match self {
                    $( OpCode::$name => &[$(Operand::$operand),*], )*
                }
            }
        }
    };
}

opcodes! {
    /// Stop the current fiber; the result is nil
    Halt = 0x00, "HALT", [];
    /// Push an 8-byte integer operand
    ConstInt = 0x01, "CONST_INT", [I64];
    /// Push an 8-byte double operand
    ConstDouble = 0x02, "CONST_DOUBLE", [F64];
    /// Push constant pool entry
    Const = 0x03, "CONST", [U32];
    ConstNil = 0x04, "CONST_NIL", [];
    /// Push the runtime global bound to the name constant
    ConstId = 0x05, "CONST_ID", [U32];
    Pop = 0x06, "POP", [];
    /// Discard N values beneath the top of stack, keeping the top
    PopUnder = 0x07, "POP_UNDER", [U16];
    Dup = 0x08, "DUP", [];
    GetLocal = 0x09, "GET_LOCAL", [U16];
    SetLocal = 0x0a, "SET_LOCAL", [U16];
    GetUpvalue = 0x0b, "GET_UPVALUE", [U16];
    SetUpvalue = 0x0c, "SET_UPVALUE", [U16];
    /// Wrap a function constant in a closure; capture descriptors live in the function
    Closure = 0x0d, "CLOSURE", [U32];
    /// Close every open upvalue at or above the frame-relative slot
    CloseUpvalues = 0x0e, "CLOSE_UPVALUES", [U16];
    Add = 0x10, "ADD", [];
    Sub = 0x11, "SUB", [];
    Mul = 0x12, "MUL", [];
    Div = 0x13, "DIV", [];
    Mod = 0x14, "MOD", [];
    Neg = 0x15, "NEG", [];
    Not = 0x16, "NOT", [];
    Eq = 0x18, "EQ", [];
    Ne = 0x19, "NE", [];
    Lt = 0x1a, "LT", [];
    Le = 0x1b, "LE", [];
    Gt = 0x1c, "GT", [];
    Ge = 0x1d, "GE", [];
    Is = 0x1e, "IS", [];
    /// Absolute jump (forward or loop-repeat)
    Jump = 0x20, "JUMP", [U32];
    /// Pop the condition, jump if falsy
    JumpIfFalse = 0x21, "JUMP_IF_FALSE", [U32];
    /// Short-circuit `and`: keep the value and jump if falsy, else pop it
    JumpIfFalseKeep = 0x22, "JUMP_IF_FALSE_KEEP", [U32];
    /// Short-circuit `or`: keep the value and jump if truthy, else pop it
    JumpIfTrueKeep = 0x23, "JUMP_IF_TRUE_KEEP", [U32];
    /// Nil-coalescing `?:`: keep the value and jump if not nil, else pop it
    JumpIfNotNilKeep = 0x24, "JUMP_IF_NOT_NIL_KEEP", [U32];
    Call = 0x28, "CALL", [U8];
    /// Method call: name constant, argument count
    Invoke = 0x29, "INVOKE", [U32, U8];
    Return = 0x2a, "RETURN", [];
    GetProp = 0x30, "GET_PROP", [U32];
    SetProp = 0x31, "SET_PROP", [U32];
    GetIndex = 0x32, "GET_INDEX", [];
    SetIndex = 0x33, "SET_INDEX", [];
    List = 0x34, "LIST", [U16];
    Map = 0x35, "MAP", [U16];
    Range = 0x36, "RANGE", [];
    /// name constant, kind, superclass count, mixin count, member count
    Class = 0x38, "CLASS", [U32, U8, U8, U8, U16];
    /// Sequence slot (index lives in the next slot), exit offset
    ForIter = 0x3a, "FOR_ITER", [U16, U32];
    Yield = 0x3c, "YIELD", [];
    Breakpoint = 0x3e, "BREAKPOINT", [];
}

impl OpCode {
    /// Size of the full instruction in bytes, opcode included
    pub fn size(self) -> usize {
        1 + self.operands().iter().map(|o| o.width()).sum::<usize>()
    }
}

/// Decoded operand value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperandValue {
    U8(u8),
    U16(u16),
    U32(u32),
    I64(i64),
    F64(f64),
}

/// Reads the operand of the given encoding at `at`; `None` when truncated
pub fn read_operand(code: &[u8], at: usize, operand: Operand) -> Option<OperandValue> {
    let bytes = code.get(at..at + operand.width())?;
    Some(match operand {
        Operand::U8 => OperandValue::U8(bytes[0]),
        Operand::U16 => OperandValue::U16(u16::from_le_bytes(bytes.try_into().ok()?)),
        Operand::U32 => OperandValue::U32(u32::from_le_bytes(bytes.try_into().ok()?)),
        Operand::I64 => OperandValue::I64(i64::from_le_bytes(bytes.try_into().ok()?)),
        Operand::F64 => OperandValue::F64(f64::from_le_bytes(bytes.try_into().ok()?)),
    })
}

/// Class kinds as encoded in the `CLASS` operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ClassKind {
    Final = 0,
    Regular = 1,
    Open = 2,
}

impl ClassKind {
    pub fn from_byte(byte: u8) -> Option<ClassKind> {
        match byte {
            0 => Some(ClassKind::Final),
            1 => Some(ClassKind::Regular),
            2 => Some(ClassKind::Open),
            _ => None,
        }
    }
}

/// Constants that can be stored in the constant pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Nil,
    Int(i64),
    #[serde(with = "exact_double")]
    Double(f64),
    Str(Rc<str>),
    /// A nested compiled function
    Function(Rc<Function>),
}

/// JSON has no NaN or infinity, so non-finite doubles are written as their
/// raw bits (`"bits:7ff0000000000000"`). Finite values stay plain numbers.
mod exact_double {
    use serde::{Deserialize, Deserializer, Serializer};

    const BITS_PREFIX: &str = "bits:";

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_str(&format!("{}{:016x}", BITS_PREFIX, value.to_bits()))
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Number(f64),
        Bits(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Encoded::deserialize(deserializer)? {
            Encoded::Number(value) => Ok(value),
            Encoded::Bits(text) => text
                .strip_prefix(BITS_PREFIX)
                .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                .map(f64::from_bits)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid double encoding {:?}", text))),
        }
    }
}

/// How a closure obtains one of its upvalues when it is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpvalueDesc {
    /// true: a slot of the enclosing frame; false: an upvalue of the enclosing closure
    pub is_local: bool,
    pub index: u16,
}

/// Debug metadata for one local variable's live range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalInfo {
    pub name: String,
    pub slot: u16,
    pub start: u32,
    pub end: u32,
}

/// Line table, breakpoint offsets and local ranges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugInfo {
    /// (source line, first bytecode offset on that line), offsets ascending
    pub lines: Vec<(u32, u32)>,
    /// Offsets of BREAKPOINT instructions
    pub breakpoints: Vec<u32>,
    pub locals: Vec<LocalInfo>,
}

impl DebugInfo {
    /// Source line of the instruction at `offset`
    pub fn line_for(&self, offset: usize) -> Option<u32> {
        let idx = self.lines.partition_point(|&(_, start)| start as usize <= offset);
        idx.checked_sub(1).map(|i| self.lines[i].0)
    }

    /// First bytecode offset emitted for a source line
    pub fn offset_for_line(&self, line: u32) -> Option<u32> {
        self.lines.iter().find(|(l, _)| *l == line).map(|(_, offset)| *offset)
    }

    /// Locals whose live range covers `offset`
    pub fn locals_at(&self, offset: usize) -> impl Iterator<Item = &LocalInfo> {
        self.locals
            .iter()
            .filter(move |l| (l.start as usize) <= offset && offset < l.end as usize)
    }
}

/// An immutable compiled unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    /// Declared parameters, excluding a method's implicit receiver
    pub arity: u8,
    /// Index of the first optional parameter (== arity when there are none)
    pub optional_params_start: u8,
    /// Defaults for parameters `optional_params_start..arity`
    pub default_values: Vec<Constant>,
    /// Methods receive their receiver in slot 0
    pub is_method: bool,
    pub upvalues: Vec<UpvalueDesc>,
    pub code: Vec<u8>,
    pub constants: Vec<Constant>,
    pub debug: DebugInfo,
}

impl Function {
    pub fn upvalue_count(&self) -> usize {
        self.upvalues.len()
    }

    /// Whether `argc` arguments satisfy this function's signature
    pub fn accepts(&self, argc: usize) -> bool {
        argc >= self.optional_params_start as usize && argc <= self.arity as usize
    }
}

/// Serialized bytecode file format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BytecodeFile {
    pub format: String,
    pub version: u32,
    pub entry: Rc<Function>,
}

pub const BYTECODE_FORMAT: &str = "strand-bytecode";
pub const BYTECODE_VERSION: u32 = 1;

/// Serializes a compiled entry function (and everything it references)
pub fn serialize(entry: &Rc<Function>) -> Result<String, serde_json::Error> {
    let file = BytecodeFile {
        format: BYTECODE_FORMAT.to_string(),
        version: BYTECODE_VERSION,
        entry: Rc::clone(entry),
    };
    serde_json::to_string(&file)
}

/// Loads a serialized entry function
pub fn deserialize(text: &str) -> Result<Rc<Function>, serde_json::Error> {
    let file: BytecodeFile = serde_json::from_str(text)?;
    if file.format != BYTECODE_FORMAT || file.version != BYTECODE_VERSION {
        return Err(serde::de::Error::custom(format!(
            "unsupported bytecode format {} v{}",
            file.format, file.version
        )));
    }
    Ok(file.entry)
}

/// Renders a function and all nested functions as assembly text
pub fn disassemble(function: &Function) -> String {
    let mut out = String::new();
    disassemble_into(function, &mut out);
    out
}

fn disassemble_into(function: &Function, out: &mut String) {
    let _ = writeln!(
        out,
        "== {} (arity {}, upvalues {}) ==",
        function.name,
        function.arity,
        function.upvalue_count()
    );

    let mut offset = 0;
    let mut last_line = None;
    while offset < function.code.len() {
        let line = function.debug.line_for(offset);
        let line_col = if line.is_some() && line != last_line {
            format!("{:4}", line.unwrap_or_default())
        } else {
            "   |".to_string()
        };
        last_line = line;

        let byte = function.code[offset];
        let Some(op) = OpCode::from_byte(byte) else {
            let _ = writeln!(out, "{:04} {} <invalid 0x{:02x}>", offset, line_col, byte);
            offset += 1;
            continue;
        };

        let mut text = format!("{:04} {} {:<20}", offset, line_col, op.mnemonic());
        let mut at = offset + 1;
        for operand in op.operands() {
            match read_operand(&function.code, at, *operand) {
                Some(value) => {
                    let _ = match value {
                        OperandValue::U8(v) => write!(text, " {}", v),
                        OperandValue::U16(v) => write!(text, " {}", v),
                        OperandValue::U32(v) => write!(text, " {}", v),
                        OperandValue::I64(v) => write!(text, " {}", v),
                        OperandValue::F64(v) => write!(text, " {:?}", v),
                    };
                }
                None => text.push_str(" <truncated>"),
            }
            at += operand.width();
        }

        if matches!(op, OpCode::Const | OpCode::ConstId | OpCode::Closure | OpCode::GetProp | OpCode::SetProp | OpCode::Invoke | OpCode::Class) {
            if let Some(OperandValue::U32(index)) = read_operand(&function.code, offset + 1, Operand::U32) {
                if let Some(constant) = function.constants.get(index as usize) {
                    let _ = write!(text, "    ; {}", describe_constant(constant));
                }
            }
        }

        let _ = writeln!(out, "{}", text.trim_end());
        offset += op.size();
    }

    for constant in &function.constants {
        if let Constant::Function(nested) = constant {
            out.push('\n');
            disassemble_into(nested, out);
        }
    }
}

fn describe_constant(constant: &Constant) -> String {
    match constant {
        Constant::Nil => "nil".to_string(),
        Constant::Int(n) => n.to_string(),
        Constant::Double(d) => format!("{:?}", d),
        Constant::Str(s) => format!("{:?}", s),
        Constant::Function(f) => format!("<fn {}>", f.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_bytes_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(op) = OpCode::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(OpCode::from_byte(0xff), None);
    }

    #[test]
    fn test_fixed_operand_widths() {
        assert_eq!(OpCode::ConstInt.size(), 9);
        assert_eq!(OpCode::Jump.size(), 5);
        assert_eq!(OpCode::PopUnder.size(), 3);
        assert_eq!(OpCode::Invoke.size(), 6);
        assert_eq!(OpCode::Class.size(), 10);
        assert_eq!(OpCode::Return.size(), 1);
    }

    #[test]
    fn test_read_operand_little_endian() {
        let code = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(read_operand(&code, 0, Operand::U16), Some(OperandValue::U16(0x0201)));
        assert_eq!(read_operand(&code, 0, Operand::U32), Some(OperandValue::U32(0x04030201)));
        assert_eq!(read_operand(&code, 2, Operand::U32), None);
    }

    #[test]
    fn test_line_table_lookup() {
        let debug = DebugInfo { lines: vec![(1, 0), (3, 9), (4, 12)], ..Default::default() };
        assert_eq!(debug.line_for(0), Some(1));
        assert_eq!(debug.line_for(10), Some(3));
        assert_eq!(debug.line_for(100), Some(4));
        assert_eq!(debug.offset_for_line(3), Some(9));
        assert_eq!(debug.offset_for_line(2), None);
    }

    fn constant_function(constants: Vec<Constant>) -> Rc<Function> {
        Rc::new(Function {
            name: "<script>".to_string(),
            arity: 0,
            optional_params_start: 0,
            default_values: Vec::new(),
            is_method: false,
            upvalues: Vec::new(),
            code: vec![OpCode::Return as u8],
            constants,
            debug: DebugInfo::default(),
        })
    }

    #[test]
    fn test_non_finite_doubles_survive_serialization() {
        let nan_bits = 0x7ff8_0000_0000_0001_u64;
        let entry = constant_function(vec![
            Constant::Double(f64::INFINITY),
            Constant::Double(f64::NEG_INFINITY),
            Constant::Double(f64::from_bits(nan_bits)),
            Constant::Double(-0.0),
            Constant::Double(0.1),
        ]);
        let text = serialize(&entry).unwrap();
        assert!(text.contains("\"bits:7ff0000000000000\""), "{}", text);

        let reloaded = deserialize(&text).unwrap();
        let bits: Vec<u64> = reloaded
            .constants
            .iter()
            .map(|c| match c {
                Constant::Double(d) => d.to_bits(),
                other => panic!("unexpected constant {:?}", other),
            })
            .collect();
        assert_eq!(
            bits,
            vec![
                f64::INFINITY.to_bits(),
                f64::NEG_INFINITY.to_bits(),
                nan_bits,
                (-0.0_f64).to_bits(),
                0.1_f64.to_bits()
            ]
        );
    }

    #[test]
    fn test_malformed_double_is_rejected() {
        let entry = constant_function(vec![Constant::Double(f64::INFINITY)]);
        let text = serialize(&entry).unwrap().replace("bits:", "bots:");
        assert!(deserialize(&text).is_err());
    }
}
