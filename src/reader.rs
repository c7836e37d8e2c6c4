use crate::bytecode::{decode_instruction, read_cell, Instruction, OpCode};

/// Visitor for decoded instructions. The compile driver implements this; the
/// return value aborts the decode loop on `false`.
pub trait PcodeVisitor {
    fn visit(&mut self, cip: u32, instr: &Instruction) -> bool;
}

/// Forward-only cursor over one function's p-code. The reader does not know
/// function boundaries; the driver's loop enforces them via `peek_opcode`.
pub struct PcodeReader<'a> {
    code: &'a [u8],
    start: u32,
    cip: u32,
}

impl<'a> PcodeReader<'a> {
    pub fn new(code: &'a [u8], start: u32) -> Self {
        Self { code, start, cip: start }
    }

    pub fn begin(&mut self) {
        self.cip = self.start;
    }

    pub fn more(&self) -> bool {
        (self.cip as usize) < self.code.len()
    }

    /// Current instruction's byte address within the code segment.
    pub fn cip(&self) -> u32 {
        self.cip
    }

    pub fn peek_opcode(&self) -> Option<OpCode> {
        read_cell(self.code, self.cip).and_then(OpCode::from_cell)
    }

    /// Decodes the next instruction, advances past it, and dispatches to the
    /// visitor. Returns `false` on undecodable input or visitor failure.
    pub fn visit_next<V: PcodeVisitor>(&mut self, visitor: &mut V) -> bool {
        let cip = self.cip;
        let Some(instr) = decode_instruction(self.code, cip) else {
            return false;
        };
        self.cip += instr.size_in_bytes() as u32;
        visitor.visit(cip, &instr)
    }
}
