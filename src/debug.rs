use crate::chunk::{Chunk, OpCode};
use crate::value::value_to_repr;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset);
    }
    for (index, handler) in chunk.handlers.iter().enumerate() {
        println!(
            "handler {:>2} {:?} [{}, {}) -> {} slot {}",
            index, handler.kind, handler.start, handler.end, handler.handler_pc, handler.slot
        );
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        print!("   | ");
    } else {
        print!("{:>4} ", chunk.line_at(offset));
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_byte(byte) else {
        println!("Unknown opcode {}", byte);
        return offset + 1;
    };

    match op {
        OpCode::Constant
        | OpCode::DefineGlobal
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::GetField
        | OpCode::SetField
        | OpCode::Class
        | OpCode::DefMethod
        | OpCode::GetSuper
        | OpCode::NativeLookup
        | OpCode::ImportModule
        | OpCode::ImportName => constant_instruction(op, chunk, offset),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::BuildList
        | OpCode::BuildTuple
        | OpCode::SetupTry
        | OpCode::PopTry => byte_instruction(op, chunk, offset),
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            jump_instruction(op, 1, chunk, offset)
        }
        OpCode::Loop => jump_instruction(op, -1, chunk, offset),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(op, chunk, offset),
        OpCode::Closure => closure_instruction(chunk, offset),
        _ => simple_instruction(op, offset),
    }
}

fn simple_instruction(op: OpCode, offset: usize) -> usize {
    println!("{}", op);
    offset + 1
}

fn constant_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    println!(
        "{:<16} {:>4} '{}'",
        op.to_string(),
        constant,
        value_to_repr(chunk.get_constant(constant as usize))
    );
    offset + 2
}

fn byte_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let operand = chunk.code[offset + 1];
    println!("{:<16} {:>4}", op.to_string(), operand);
    offset + 2
}

fn jump_instruction(op: OpCode, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let jump = ((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16;
    let target = offset as i64 + 3 + sign as i64 * jump as i64;
    println!("{:<16} {:>4} -> {}", op.to_string(), offset, target);
    offset + 3
}

fn invoke_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    println!(
        "{:<16} ({} args) {:>4} '{}'",
        op.to_string(),
        arg_count,
        constant,
        value_to_repr(chunk.get_constant(constant as usize))
    );
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let mut offset = offset + 1;
    let constant = chunk.code[offset];
    offset += 1;
    println!(
        "{:<16} {:>4} {}",
        "Closure",
        constant,
        value_to_repr(chunk.get_constant(constant as usize))
    );

    let function = chunk.get_constant(constant as usize);
    let upvalue_count = unsafe {
        let object = crate::value::as_object(function);
        (*object).as_function().upvalue_count
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        println!(
            "{:04}      |                     {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }
    offset
}
