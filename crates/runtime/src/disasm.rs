//! Disassembler façade
//!
//! Renders instruction words back to mnemonic text for the `disasm` RPC and
//! trace displays. Purely presentational; decoding truth lives in
//! `vm::opcode`.

use crate::vm::opcode::{self, Fields};

/// One rendered line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisasmLine {
    pub addr: u32,
    pub word: u32,
    pub text: String,
}

/// Render a single word; `literal` supplies the following word for `LDI32`.
/// Returns the text and the number of words consumed (1 or 2).
pub fn disassemble_word(word: u32, literal: Option<u32>) -> (String, usize) {
    let f = Fields::decode(word);
    let Some(m) = opcode::mnemonic(f.op) else {
        return (format!(".word 0x{word:08X}"), 1);
    };
    let text = match f.op {
        opcode::OP_NOP | opcode::OP_HALT | opcode::OP_RET => m.to_string(),
        opcode::OP_LDI => format!("{m} R{}, #{}", f.rd, f.simm()),
        opcode::OP_LDI32 => match literal {
            Some(lit) => return (format!("{m} R{}, #0x{lit:08X}", f.rd), 2),
            None => return (format!("{m} R{}, <truncated>", f.rd), 2),
        },
        opcode::OP_MOV | opcode::OP_NOT | opcode::OP_I2F | opcode::OP_F2I => {
            format!("{m} R{}, R{}", f.rd, f.rs)
        }
        opcode::OP_CMP => format!("{m} R{}, R{}", f.rs, f.rt),
        opcode::OP_CMPI => format!("{m} R{}, #{}", f.rs, f.simm()),
        opcode::OP_ADDI => format!("{m} R{}, R{}, #{}", f.rd, f.rs, f.simm()),
        opcode::OP_LDW | opcode::OP_LDH | opcode::OP_LDB => {
            format!("{m} R{}, [R{}{:+}]", f.rd, f.rs, f.simm())
        }
        opcode::OP_STW | opcode::OP_STH | opcode::OP_STB => {
            format!("{m} [R{}{:+}], R{}", f.rs, f.simm(), f.rd)
        }
        opcode::OP_JMP | opcode::OP_JZ | opcode::OP_JNZ => {
            format!("{m} 0x{:04X}", (f.imm as u32) << 2)
        }
        opcode::OP_CALL => format!("{m} {:+}", f.simm() << 2),
        opcode::OP_PUSH => format!("{m} R{}", f.rs),
        opcode::OP_POP => format!("{m} R{}", f.rd),
        opcode::OP_SVC => format!("{m} 0x{:02X}, 0x{:02X}", f.imm >> 8, f.imm & 0xFF),
        _ => format!("{m} R{}, R{}, R{}", f.rd, f.rs, f.rt),
    };
    (text, 1)
}

/// Disassemble up to `count` instructions starting at `addr` within `code`.
pub fn disassemble_range(code: &[u8], addr: u32, count: usize) -> Vec<DisasmLine> {
    let mut out = Vec::new();
    let mut at = addr as usize & !3;
    while out.len() < count && at + 4 <= code.len() {
        let word = u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]]);
        let literal = if at + 8 <= code.len() {
            Some(u32::from_le_bytes([
                code[at + 4],
                code[at + 5],
                code[at + 6],
                code[at + 7],
            ]))
        } else {
            None
        };
        let (text, words) = disassemble_word(word, literal);
        out.push(DisasmLine { addr: at as u32, word, text });
        at += words * 4;
    }
    out
}
