use std::sync::Arc;

use crate::bytecode::{Cell, CELL_SIZE};
use crate::environment::Environment;
use crate::errors::ErrorCode;
use crate::runtime::PluginRuntime;

/// Free space kept between the stack and the heap so helper-driven pushes
/// have headroom beyond the checks emitted at `STACK`/`HEAP` sites.
pub const STACK_MARGIN: u32 = 64;

/// Machine-visible execution state. Generated code addresses these fields by
/// displacement from the context register, so the layout is fixed and all
/// offsets are taken with `offset_of!`.
#[repr(C)]
#[derive(Debug)]
pub struct ContextRegs {
    pub pri: Cell,
    pub alt: Cell,
    /// Stack pointer, byte offset into plugin memory. Grows down.
    pub sp: u32,
    /// Frame pointer, byte offset into plugin memory.
    pub frm: u32,
    /// Heap pointer, byte offset into plugin memory. Grows up.
    pub hp: u32,
    pub mem_size: u32,
    pub data_size: u32,
    /// Base of the plugin memory block.
    pub data: *mut u8,
    /// One bound-flag byte per native, indexed by native id.
    pub natives_bound: *const u8,
    /// Native `rbp` of the innermost generated frame at the last helper call.
    pub exit_fp: *mut u8,
    /// Native `rsp` saved around aligned helper calls.
    pub scratch_rsp: u64,
    /// Native pc of the cip-map site that raised the in-flight error.
    pub code_pc: u64,
    /// Error code stored by a bridge that reports failure via its return
    /// value (the thunk-compile path).
    pub pending_err: i32,
    /// Return value of the last native dispatch.
    pub native_result: Cell,
}

/// Field displacements for emitted `[ctx + disp]` operands.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CtxLayout {
    pub pri: i32,
    pub alt: i32,
    pub sp: i32,
    pub frm: i32,
    pub hp: i32,
    pub mem_size: i32,
    pub data: i32,
    pub natives_bound: i32,
    pub exit_fp: i32,
    pub scratch_rsp: i32,
    pub code_pc: i32,
    pub pending_err: i32,
    pub native_result: i32,
}

pub(crate) fn ctx_layout() -> CtxLayout {
    let regs = std::mem::offset_of!(PluginContext, regs);
    CtxLayout {
        pri: (regs + std::mem::offset_of!(ContextRegs, pri)) as i32,
        alt: (regs + std::mem::offset_of!(ContextRegs, alt)) as i32,
        sp: (regs + std::mem::offset_of!(ContextRegs, sp)) as i32,
        frm: (regs + std::mem::offset_of!(ContextRegs, frm)) as i32,
        hp: (regs + std::mem::offset_of!(ContextRegs, hp)) as i32,
        mem_size: (regs + std::mem::offset_of!(ContextRegs, mem_size)) as i32,
        data: (regs + std::mem::offset_of!(ContextRegs, data)) as i32,
        natives_bound: (regs + std::mem::offset_of!(ContextRegs, natives_bound)) as i32,
        exit_fp: (regs + std::mem::offset_of!(ContextRegs, exit_fp)) as i32,
        scratch_rsp: (regs + std::mem::offset_of!(ContextRegs, scratch_rsp)) as i32,
        code_pc: (regs + std::mem::offset_of!(ContextRegs, code_pc)) as i32,
        pending_err: (regs + std::mem::offset_of!(ContextRegs, pending_err)) as i32,
        native_result: (regs + std::mem::offset_of!(ContextRegs, native_result)) as i32,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReportedError {
    pub code: ErrorCode,
    /// The faulting p-code instruction, recovered through the cip map.
    pub cip: Option<u32>,
}

/// Per-invocation execution context: one plugin memory block plus the
/// machine-visible register file. The owning runtime outlives every context
/// created from it.
pub struct PluginContext {
    pub(crate) regs: ContextRegs,
    memory: Vec<u8>,
    runtime: Arc<PluginRuntime>,
    env: Arc<Environment>,
    last_error: Option<ReportedError>,
}

impl PluginContext {
    pub fn new(env: Arc<Environment>, runtime: Arc<PluginRuntime>) -> Self {
        let image = runtime.image();
        let mem_size = image.mem_size();
        let data_size = image.data().len() as u32;
        let mut memory = vec![0u8; mem_size as usize];
        memory[..data_size as usize].copy_from_slice(image.data());

        let regs = ContextRegs {
            pri: 0,
            alt: 0,
            sp: mem_size,
            frm: mem_size,
            hp: data_size,
            mem_size,
            data_size,
            data: memory.as_mut_ptr(),
            natives_bound: runtime.natives_bound_ptr(),
            exit_fp: std::ptr::null_mut(),
            scratch_rsp: 0,
            code_pc: 0,
            pending_err: 0,
            native_result: 0,
        };

        Self { regs, memory, runtime, env, last_error: None }
    }

    pub fn runtime(&self) -> &Arc<PluginRuntime> {
        &self.runtime
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn last_error(&self) -> Option<ReportedError> {
        self.last_error
    }

    pub(crate) fn record_error(&mut self, code: ErrorCode, cip: Option<u32>) {
        self.last_error = Some(ReportedError { code, cip });
    }

    pub(crate) fn clear_last_error(&mut self) {
        self.last_error = None;
    }

    /// Pushes a cell onto the plugin stack (host-side; used to marshal
    /// invocation arguments).
    pub(crate) fn push_cell(&mut self, value: Cell) -> Result<(), ErrorCode> {
        let new_sp = self
            .regs
            .sp
            .checked_sub(CELL_SIZE as u32)
            .ok_or(ErrorCode::StackLow)?;
        if new_sp < self.regs.hp + STACK_MARGIN {
            return Err(ErrorCode::StackLow);
        }
        self.regs.sp = new_sp;
        self.write_cell(new_sp, value)
    }

    pub fn read_cell(&self, addr: u32) -> Result<Cell, ErrorCode> {
        let at = addr as usize;
        if at % CELL_SIZE != 0 || at + CELL_SIZE > self.memory.len() {
            return Err(ErrorCode::MemAccess);
        }
        let bytes = [
            self.memory[at],
            self.memory[at + 1],
            self.memory[at + 2],
            self.memory[at + 3],
        ];
        Ok(Cell::from_le_bytes(bytes))
    }

    pub fn write_cell(&mut self, addr: u32, value: Cell) -> Result<(), ErrorCode> {
        let at = addr as usize;
        if at % CELL_SIZE != 0 || at + CELL_SIZE > self.memory.len() {
            return Err(ErrorCode::MemAccess);
        }
        self.memory[at..at + CELL_SIZE].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Arguments of the current native dispatch: the caller pushed the
    /// argument block then its byte count, so `[sp]` holds the count.
    pub(crate) fn native_args(&self) -> Result<Vec<Cell>, ErrorCode> {
        let nargs_bytes = self.read_cell(self.regs.sp)?;
        if nargs_bytes < 0 || nargs_bytes as usize % CELL_SIZE != 0 {
            return Err(ErrorCode::MemAccess);
        }
        let count = nargs_bytes as usize / CELL_SIZE;
        let mut args = Vec::with_capacity(count);
        for index in 0..count {
            args.push(self.read_cell(self.regs.sp + ((index + 1) * CELL_SIZE) as u32)?);
        }
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{Environment, JitConfig};
    use crate::image::ImageBuilder;

    fn test_context() -> PluginContext {
        let env = Environment::new(JitConfig::default()).expect("environment should build");
        let mut builder = ImageBuilder::new();
        builder
            .op(crate::bytecode::OpCode::Proc)
            .op(crate::bytecode::OpCode::Retn)
            .op(crate::bytecode::OpCode::EndProc);
        let image = builder.finish().expect("image should build");
        let runtime = PluginRuntime::new(env.clone(), image).expect("runtime should build");
        PluginContext::new(env, runtime)
    }

    #[test]
    fn layout_offsets_are_in_declaration_order() {
        let layout = ctx_layout();
        assert!(layout.pri < layout.alt);
        assert!(layout.alt < layout.sp);
        assert!(layout.data < layout.natives_bound);
        assert_eq!(layout.alt - layout.pri, CELL_SIZE as i32);
    }

    #[test]
    fn push_cell_grows_down_and_checks_the_margin() {
        let mut ctx = test_context();
        let top = ctx.regs.sp;
        ctx.push_cell(7).expect("push should fit");
        assert_eq!(ctx.regs.sp, top - CELL_SIZE as u32);
        assert_eq!(ctx.read_cell(ctx.regs.sp).expect("read should succeed"), 7);

        ctx.regs.sp = ctx.regs.hp + STACK_MARGIN;
        assert_eq!(ctx.push_cell(1).unwrap_err(), ErrorCode::StackLow);
    }

    #[test]
    fn cell_access_rejects_unaligned_and_out_of_range() {
        let mut ctx = test_context();
        assert_eq!(ctx.read_cell(2).unwrap_err(), ErrorCode::MemAccess);
        assert_eq!(
            ctx.write_cell(ctx.regs.mem_size, 0).unwrap_err(),
            ErrorCode::MemAccess
        );
    }
}
