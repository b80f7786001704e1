use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::Display;

use crate::value::{Value, ValueArray};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, TryFromPrimitive)]
pub enum OpCode {
    Constant,
    Null,
    True,
    False,
    Pop,
    Dup,
    Dup2,
    GetLocal,
    SetLocal,
    DefineGlobal,
    GetGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    GetField,
    SetField,
    GetIndex,
    SetIndex,
    Equal,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Pow,
    Not,
    Negate,
    Length,
    Is,
    Jump,
    JumpIfFalse,
    JumpIfTrue,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    GetSuper,
    Closure,
    CloseUpvalue,
    Return,
    Class,
    Subclass,
    DefMethod,
    NativeLookup,
    BuildList,
    BuildTuple,
    Raise,
    SetupTry,
    PopTry,
    ImportModule,
    ImportName,
    ImportEnd,
    PushModule,
}

impl OpCode {
    pub fn to_byte(self) -> u8 {
        self.into()
    }

    pub fn from_byte(byte: u8) -> Option<OpCode> {
        OpCode::try_from(byte).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Except,
    Ensure,
}

/// One try-region descriptor. `start..end` is the protected bytecode range,
/// `handler_pc` the resume point, `slot` the frame-relative local the
/// exception is bound into, and `stack_slots` the number of live locals to
/// truncate the frame back to on catch.
#[derive(Debug, Clone, Copy)]
pub struct HandlerDesc {
    pub kind: HandlerKind,
    pub start: usize,
    pub end: usize,
    pub handler_pc: usize,
    pub slot: u8,
    pub stack_slots: u8,
}

/// A compiled unit: opcode bytes, the constant pool and a parallel
/// source-line entry per byte, plus the try-handler descriptors.
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: Vec<usize>,
    pub constants: ValueArray,
    pub handlers: Vec<HandlerDesc>,
}

impl Chunk {
    pub fn new() -> Chunk {
        Chunk {
            code: vec![],
            lines: vec![],
            constants: vec![],
            handlers: vec![],
        }
    }

    pub fn write(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_by_offset(&mut self, offset: usize, byte: u8) {
        self.code[offset] = byte;
    }

    pub fn read_from_offset(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn line_at(&self, offset: usize) -> usize {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    /// Adds to the constant pool, reusing an existing slot when an equal
    /// constant is already present.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn find_constant(&self, value: &Value) -> Option<usize> {
        self.constants.iter().position(|existing| existing == value)
    }

    pub fn get_constant(&self, index: usize) -> &Value {
        &self.constants[index]
    }

    pub fn iter_constants(&self) -> impl Iterator<Item = &Value> {
        self.constants.iter()
    }

    pub fn add_handler(&mut self, desc: HandlerDesc) -> usize {
        self.handlers.push(desc);
        self.handlers.len() - 1
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::make_number_value;

    #[test]
    fn test_opcode_round_trip() {
        assert_eq!(OpCode::from_byte(OpCode::Constant.to_byte()), Some(OpCode::Constant));
        assert_eq!(OpCode::from_byte(OpCode::PushModule.to_byte()), Some(OpCode::PushModule));
        assert_eq!(OpCode::from_byte(0xff), None);
    }

    #[test]
    fn test_write_tracks_lines() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Null.to_byte(), 3);
        chunk.write(OpCode::Pop.to_byte(), 4);
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.line_at(0), 3);
        assert_eq!(chunk.line_at(1), 4);
    }

    #[test]
    fn test_constant_dedup_via_find() {
        let mut chunk = Chunk::new();
        let first = chunk.add_constant(make_number_value(1.5));
        assert_eq!(chunk.find_constant(&make_number_value(1.5)), Some(first));
        assert_eq!(chunk.find_constant(&make_number_value(2.0)), None);
    }
}
