use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::bytecode::{Cell, CELL_SIZE};
use crate::context::{ctx_layout, PluginContext};
use crate::errors::ErrorCode;
use crate::frames::JitFrameType;
use crate::linking::{link_code, CodePool};
use crate::masm::{MacroAssembler, Reg};
use crate::runtime::CompiledFunction;
use crate::watchdog::WatchdogTimer;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JitConfig {
    /// Upper bound on one function's emitted code; the assembler-overflow
    /// latch trips past it.
    pub max_code_size: usize,
    /// Size of the shared executable region all chunks are carved from.
    pub code_pool_size: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            max_code_size: 1 << 20,
            code_pool_size: 8 << 20,
        }
    }
}

type InvokeStubFn = unsafe extern "C" fn(*mut PluginContext, *const u8) -> i32;

/// Process-wide services for compiled code: the executable-memory pool, the
/// watchdog, the invoke stub, and compile accounting. Threaded explicitly
/// rather than held in a global.
pub struct Environment {
    config: JitConfig,
    pool: CodePool,
    watchdog: WatchdogTimer,
    invoke_stub: OnceLock<Result<usize, ErrorCode>>,
    compiles: AtomicU64,
}

impl Environment {
    pub fn new(config: JitConfig) -> Result<Arc<Self>, ErrorCode> {
        let pool = CodePool::new(config.code_pool_size)?;
        Ok(Arc::new(Self {
            config,
            pool,
            watchdog: WatchdogTimer::new(),
            invoke_stub: OnceLock::new(),
            compiles: AtomicU64::new(0),
        }))
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn watchdog(&self) -> &WatchdogTimer {
        &self.watchdog
    }

    pub(crate) fn pool(&self) -> &CodePool {
        &self.pool
    }

    /// Number of successful compiles in this environment's lifetime.
    pub fn compile_count(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }

    pub(crate) fn note_compile(&self) {
        self.compiles.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs a compiled function on a context. Arguments are marshalled onto
    /// the plugin stack (argument block, then its byte count) the way
    /// scripted callers push them.
    pub fn invoke(
        &self,
        ctx: &mut PluginContext,
        fun: &CompiledFunction,
        args: &[Cell],
    ) -> Result<Cell, ErrorCode> {
        let stub = self.invoke_stub()?;

        let saved_sp = ctx.regs.sp;
        let saved_frm = ctx.regs.frm;
        let saved_hp = ctx.regs.hp;
        ctx.clear_last_error();

        for arg in args.iter().rev() {
            if let Err(err) = ctx.push_cell(*arg) {
                ctx.regs.sp = saved_sp;
                return Err(err);
            }
        }
        if let Err(err) = ctx.push_cell((args.len() * CELL_SIZE) as Cell) {
            ctx.regs.sp = saved_sp;
            return Err(err);
        }

        let status = unsafe { stub(ctx as *mut PluginContext, fun.entry()) };
        if status == ErrorCode::None as i32 {
            debug_assert_eq!(ctx.regs.sp, saved_sp, "retn must drop the argument block");
            return Ok(ctx.regs.pri);
        }

        ctx.regs.sp = saved_sp;
        ctx.regs.frm = saved_frm;
        ctx.regs.hp = saved_hp;
        Err(ErrorCode::from_i32(status).unwrap_or(ErrorCode::InvalidInstruction))
    }

    fn invoke_stub(&self) -> Result<InvokeStubFn, ErrorCode> {
        let entry = self
            .invoke_stub
            .get_or_init(|| {
                let chunk = link_code(&self.pool, &emit_invoke_stub())?;
                Ok(chunk.address() as usize)
            })
            .clone()?;
        Ok(unsafe { std::mem::transmute::<usize, InvokeStubFn>(entry) })
    }
}

#[cfg(windows)]
const ARG0: Reg = Reg::Rcx;
#[cfg(windows)]
const ARG1: Reg = Reg::Rdx;
#[cfg(not(windows))]
const ARG0: Reg = Reg::Rdi;
#[cfg(not(windows))]
const ARG1: Reg = Reg::Rsi;

/// The trampoline between the host and generated code. It builds the entry
/// frame the error unwinder searches for, loads the VM registers, and calls
/// the function entry. The generated error tail re-enters the epilogue half
/// by resetting `rsp` relative to this frame, so the shape here and the
/// unwind sequence in the compiler must agree.
fn emit_invoke_stub() -> MacroAssembler {
    let layout = ctx_layout();
    let mut masm = MacroAssembler::new(4096);

    masm.push_r(Reg::Rbp);
    masm.movq_rr(Reg::Rbp, Reg::Rsp);
    masm.push_i32(JitFrameType::Entry as i32);
    masm.push_i32(0);
    masm.push_r(Reg::Rbx);
    masm.push_r(Reg::R12);
    masm.push_r(Reg::R13);
    masm.push_r(Reg::R14);
    masm.push_r(Reg::R15);

    masm.movq_rr(Reg::R15, ARG0);
    masm.movq_rr(Reg::R11, ARG1);

    masm.movq_rm(Reg::Rbx, Reg::R15, layout.data);
    masm.movl_rm(Reg::R13, Reg::R15, layout.sp);
    masm.addq_rr(Reg::R13, Reg::Rbx);
    masm.movl_rm(Reg::R14, Reg::R15, layout.frm);
    masm.addq_rr(Reg::R14, Reg::Rbx);
    masm.movl_rm(Reg::Rax, Reg::R15, layout.pri);
    masm.movl_rm(Reg::Rdx, Reg::R15, layout.alt);

    masm.subq_ri(Reg::Rsp, 8);
    masm.call_r(Reg::R11);
    masm.addq_ri(Reg::Rsp, 8);

    masm.movl_mr(Reg::R15, layout.pri, Reg::Rax);
    masm.movl_mr(Reg::R15, layout.alt, Reg::Rdx);
    masm.movq_rr(Reg::R11, Reg::R13);
    masm.subq_rr(Reg::R11, Reg::Rbx);
    masm.movl_mr(Reg::R15, layout.sp, Reg::R11);
    masm.movq_rr(Reg::R11, Reg::R14);
    masm.subq_rr(Reg::R11, Reg::Rbx);
    masm.movl_mr(Reg::R15, layout.frm, Reg::R11);

    masm.xorl_rr(Reg::Rax, Reg::Rax);
    masm.pop_r(Reg::R15);
    masm.pop_r(Reg::R14);
    masm.pop_r(Reg::R13);
    masm.pop_r(Reg::R12);
    masm.pop_r(Reg::Rbx);
    masm.addq_ri(Reg::Rsp, 16);
    masm.pop_r(Reg::Rbp);
    masm.ret();

    masm
}

/// Byte distance from the entry frame pointer down to the last callee-saved
/// slot the stub pushes. The generated unwind sequence restores `rsp` to
/// `entry_fp - ENTRY_FRAME_SAVE_BYTES` before popping.
pub(crate) const ENTRY_FRAME_SAVE_BYTES: i32 = 16 + 40;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_stub_assembles() {
        let masm = emit_invoke_stub();
        assert!(!masm.out_of_memory());
        assert!(masm.pc() > 0);
        assert_eq!(*masm.bytes().last().expect("stub has bytes"), 0xC3);
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = JitConfig::default();
        assert!(config.max_code_size <= config.code_pool_size);
    }
}
