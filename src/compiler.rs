//! The per-function compile driver.
//!
//! One `Compiler` translates one p-code function into native code: decode
//! loop over the reader, out-of-line paths after the hot body, one timeout
//! thunk per backward jump, then the shared error paths and the report/unwind
//! tail. The finished buffer is published through the environment's code
//! pool and wrapped in a `CompiledFunction`.

use std::sync::Arc;

use crate::bytecode::{Cell, Instruction, OpCode, CELL_SIZE};
use crate::context::{ctx_layout, CtxLayout, PluginContext, STACK_MARGIN};
use crate::environment::{Environment, ENTRY_FRAME_SAVE_BYTES};
use crate::errors::{ErrorCode, MAX_ERROR_CODES};
use crate::frames::{find_entry_fp, JitFrameType};
use crate::linking::{link_code, patch_call_thunk};
use crate::masm::{Cond, Label, MacroAssembler, Reg};
use crate::reader::{PcodeReader, PcodeVisitor};
use crate::runtime::{CipMapEntry, CompiledFunction, LoopEdge, MethodInfo, PluginRuntime};

// Register assignment for generated code. pri/alt are the cell accumulators;
// the rest are callee-saved so they survive bridge calls.
const PRI: Reg = Reg::Rax;
const ALT: Reg = Reg::Rdx;
const DAT: Reg = Reg::Rbx;
const STK: Reg = Reg::R13;
const FRM: Reg = Reg::R14;
const CTX: Reg = Reg::R15;
const TMP: Reg = Reg::Rcx;
const SCRATCH: Reg = Reg::R11;
const ERR_STASH: Reg = Reg::R12;

#[cfg(windows)]
const ARG0: Reg = Reg::Rcx;
#[cfg(windows)]
const ARG1: Reg = Reg::Rdx;
#[cfg(windows)]
const ARG2: Reg = Reg::R8;
#[cfg(not(windows))]
const ARG0: Reg = Reg::Rdi;
#[cfg(not(windows))]
const ARG1: Reg = Reg::Rsi;
#[cfg(not(windows))]
const ARG2: Reg = Reg::Rdx;

/// Error kinds with a dedicated shared throw path. Each is emitted at most
/// once per function, and only if some in-line site referenced it.
const THROWN_ERRORS: [ErrorCode; 9] = [
    ErrorCode::DivideByZero,
    ErrorCode::StackLow,
    ErrorCode::StackMin,
    ErrorCode::ArrayBounds,
    ErrorCode::MemAccess,
    ErrorCode::HeapLow,
    ErrorCode::HeapMin,
    ErrorCode::IntegerOverflow,
    ErrorCode::InvalidNative,
];

struct BackwardJump {
    /// Native pc just past the branch; its rel32 field is at `pc - 4`.
    pc: u32,
    /// Source cip of the branch, for the thunk's cip-map entry.
    cip: u32,
    /// Native pc of the timeout thunk, filled in at finalization.
    timeout_offset: u32,
}

/// A deferred emission whose body lands after the main function body. New
/// paths may register during the decode loop but not while the registry
/// itself is being drained.
enum OolPath {
    Error(ErrorPath),
    OutOfBounds(OutOfBoundsPath),
    CallThunk(CallThunkPath),
}

impl OolPath {
    fn label_mut(&mut self) -> &mut Label {
        match self {
            OolPath::Error(path) => &mut path.label,
            OolPath::OutOfBounds(path) => &mut path.label,
            OolPath::CallThunk(path) => &mut path.label,
        }
    }
}

/// `err == None` means the code is already in the error-code register and
/// the path calls the generic report routine directly.
struct ErrorPath {
    label: Label,
    err: Option<ErrorCode>,
    cip: u32,
}

struct OutOfBoundsPath {
    label: Label,
    bounds: Cell,
    cip: u32,
}

/// Lazy call site: the body resolves (or compiles) the callee at runtime,
/// patches the inline call, and tail-jumps to the entry.
struct CallThunkPath {
    label: Label,
    target: u32,
    cip: u32,
}

pub struct Compiler<'a> {
    env: &'a Environment,
    rt: &'a PluginRuntime,
    masm: MacroAssembler,
    layout: CtxLayout,
    pcode_start: u32,
    mem_size: u32,
    data_size: u32,
    op_cip: u32,
    error: ErrorCode,
    jump_map: Vec<Label>,
    ool_paths: Vec<OolPath>,
    ool_paths_emitted: usize,
    backward_jumps: Vec<BackwardJump>,
    cip_map: Vec<CipMapEntry>,
    throw_error_code: Vec<Label>,
    report_error: Label,
    throw_timeout: Label,
    return_reported_error: Label,
}

/// Compiles `method` if needed and installs the result on it. At most one
/// compile runs per method; racing callers observe the winner's function.
pub fn compile(
    env: &Arc<Environment>,
    rt: &Arc<PluginRuntime>,
    method: &MethodInfo,
) -> Result<Arc<CompiledFunction>, ErrorCode> {
    let mut state = method.state.lock().expect("method lock poisoned");
    rt.validate_locked(method, &mut state)?;
    if let Some(fun) = &state.compiled {
        return Ok(fun.clone());
    }
    let mut compiler = Compiler::new(env, rt, method.pcode_offset());
    let fun = Arc::new(compiler.emit()?);
    state.compiled = Some(fun.clone());
    env.note_compile();
    Ok(fun)
}

/// Called at runtime from an untranslated call site. Resolves or compiles
/// the callee, stores the entry address, and rewrites the call site so later
/// calls bypass the patcher. The entry address is written before the site is
/// patched; a failed compile leaves the site untouched so later calls retry.
pub fn compile_from_thunk(
    ctx: &mut PluginContext,
    pcode_offset: u32,
    entry_out: &mut *const u8,
    patch_pc: *mut u8,
) -> ErrorCode {
    let env = ctx.env().clone();
    let rt = ctx.runtime().clone();

    // A pending preemption must win: code compiled now would lack the
    // loop-edge patches the rest of the runtime is carrying.
    if !env.watchdog().handle_interrupt() {
        return ErrorCode::Timeout;
    }

    let Some(method) = rt.acquire_method(pcode_offset) else {
        return ErrorCode::InvalidAddress;
    };

    let fun = match compile(&env, &rt, &method) {
        Ok(fun) => fun,
        Err(err) => return err,
    };

    *entry_out = fun.entry();

    if !patch_pc.is_null() {
        tracing::debug!(
            plugin = rt.name(),
            function = %rt.image().lookup_function(pcode_offset),
            "patching thunk"
        );
        unsafe {
            patch_call_thunk(patch_pc, fun.entry());
        }
    }
    ErrorCode::None
}

impl<'a> Compiler<'a> {
    pub fn new(env: &'a Environment, rt: &'a PluginRuntime, pcode_offset: u32) -> Self {
        let image = rt.image();
        let nmaxops = image.code().len() / CELL_SIZE + 1;
        Self {
            env,
            rt,
            masm: MacroAssembler::new(env.config().max_code_size),
            layout: ctx_layout(),
            pcode_start: pcode_offset,
            mem_size: image.mem_size(),
            data_size: image.data().len() as u32,
            op_cip: pcode_offset,
            error: ErrorCode::None,
            jump_map: (0..nmaxops).map(|_| Label::new()).collect(),
            ool_paths: Vec::new(),
            ool_paths_emitted: 0,
            backward_jumps: Vec::new(),
            cip_map: Vec::new(),
            throw_error_code: (0..MAX_ERROR_CODES).map(|_| Label::new()).collect(),
            report_error: Label::new(),
            throw_timeout: Label::new(),
            return_reported_error: Label::new(),
        }
    }

    pub fn error(&self) -> ErrorCode {
        self.error
    }

    /// Number of out-of-line paths the finished compile emitted.
    pub fn ool_paths_emitted(&self) -> usize {
        self.ool_paths_emitted
    }

    pub fn emit(&mut self) -> Result<CompiledFunction, ErrorCode> {
        let rt = self.rt;
        let code = rt.image().code();

        tracing::debug!(
            plugin = rt.name(),
            function = %rt.image().lookup_function(self.pcode_start),
            "compiling function"
        );

        self.emit_prologue();

        let mut reader = PcodeReader::new(code, self.pcode_start);
        reader.begin();
        while reader.more() {
            // Stop at the end of this function or the start of the next.
            match reader.peek_opcode() {
                Some(OpCode::Proc) if reader.cip() != self.pcode_start => break,
                Some(OpCode::EndProc) => break,
                _ => {}
            }

            // Every instruction boundary is assumed to be a jump target, so
            // its label is bound before the opcode emits.
            let idx = (reader.cip() as usize) / CELL_SIZE;
            self.masm.bind(&mut self.jump_map[idx]);

            if !reader.visit_next(&mut *self) || self.error != ErrorCode::None {
                return Err(self.latched_error());
            }
            if self.masm.out_of_memory() {
                return Err(self.latch(ErrorCode::OutOfMemory));
            }
        }

        // Out-of-line paths, in registration order. The list is snapshot-
        // iterated: registering paths while they drain is a driver bug.
        let mut paths = std::mem::take(&mut self.ool_paths);
        self.ool_paths_emitted = paths.len();
        for path in &mut paths {
            self.masm.bind(path.label_mut());
            self.emit_ool_path(path);
        }
        debug_assert!(
            self.ool_paths.is_empty(),
            "out-of-line paths must not register during out-of-line emission"
        );

        // One thunk per backward jump, so a timeout can exit the loop. The
        // watchdog retargets the branch here when preemption is required.
        for index in 0..self.backward_jumps.len() {
            self.backward_jumps[index].timeout_offset = self.masm.pc() as u32;
            let cip = self.backward_jumps[index].cip;
            self.masm.call(&mut self.throw_timeout);
            self.emit_cip_mapping(cip);
        }

        for err in THROWN_ERRORS {
            self.emit_throw_path_if_needed(err);
        }

        // Last, since it checks which return paths were used.
        self.emit_error_handlers();

        if self.masm.out_of_memory() {
            return Err(self.latch(ErrorCode::OutOfMemory));
        }
        if self.error != ErrorCode::None {
            return Err(self.error);
        }

        let chunk = link_code(self.env.pool(), &self.masm)?;

        let edges: Box<[LoopEdge]> = self
            .backward_jumps
            .iter()
            .map(|jump| LoopEdge {
                offset: jump.pc,
                disp32: jump.timeout_offset as i32 - jump.pc as i32,
            })
            .collect();
        let cip_map: Box<[CipMapEntry]> = self.cip_map.clone().into_boxed_slice();

        debug_assert_eq!(self.error, ErrorCode::None);
        Ok(CompiledFunction::new(chunk, self.pcode_start, edges, cip_map))
    }

    fn latched_error(&mut self) -> ErrorCode {
        if self.error == ErrorCode::None {
            self.error = ErrorCode::InvalidInstruction;
        }
        self.error
    }

    fn latch(&mut self, err: ErrorCode) -> ErrorCode {
        self.error = err;
        err
    }

    // -- inline emission helpers -------------------------------------------

    fn emit_prologue(&mut self) {
        self.masm.push_r(Reg::Rbp);
        self.masm.movq_rr(Reg::Rbp, Reg::Rsp);
        self.masm.push_i32(JitFrameType::Scripted as i32);
        self.masm.push_i32(self.pcode_start as i32);
    }

    /// Records a (native pc → cip) pair at the current pc. Every site that
    /// can trap or call a helper maps back to its source instruction.
    fn emit_cip_mapping(&mut self, cip: u32) {
        let pcoffs = self.masm.pc() as u32;
        if let Some(last) = self.cip_map.last() {
            if last.pcoffs == pcoffs {
                return;
            }
            debug_assert!(last.pcoffs < pcoffs);
        }
        self.cip_map.push(CipMapEntry { pcoffs, cipoffs: cip });
    }

    /// Branches to a freshly registered out-of-line error stub when `cond`
    /// holds. The stub raises `err` against this instruction's cip.
    fn jump_on_error(&mut self, cond: Cond, err: ErrorCode) {
        let mut path = ErrorPath {
            label: Label::new(),
            err: Some(err),
            cip: self.op_cip,
        };
        self.masm.jcc(cond, &mut path.label);
        self.ool_paths.push(OolPath::Error(path));
    }

    /// As `jump_on_error`, for errors whose code is computed at runtime and
    /// already sits in the error-code register.
    fn jump_on_computed_error(&mut self, cond: Cond) {
        let mut path = ErrorPath {
            label: Label::new(),
            err: None,
            cip: self.op_cip,
        };
        self.masm.jcc(cond, &mut path.label);
        self.ool_paths.push(OolPath::Error(path));
    }

    fn emit_align_stack(&mut self) {
        self.masm.andq_ri8(Reg::Rsp, -16);
    }

    /// Publishes the machine state a helper needs: the exit frame for the
    /// unwinder and the sp/frm cells for anything inspecting the stack.
    fn emit_helper_frame(&mut self) {
        self.masm.movq_mr(CTX, self.layout.exit_fp, Reg::Rbp);
        self.masm.movq_rr(SCRATCH, STK);
        self.masm.subq_rr(SCRATCH, DAT);
        self.masm.movl_mr(CTX, self.layout.sp, SCRATCH);
        self.masm.movq_rr(SCRATCH, FRM);
        self.masm.subq_rr(SCRATCH, DAT);
        self.masm.movl_mr(CTX, self.layout.frm, SCRATCH);
    }

    /// Calls into the runtime with the native stack aligned. `rsp` is saved
    /// in the context because the alignment is irreversible.
    fn emit_helper_call(&mut self, helper: usize) {
        self.masm.movq_ri64(SCRATCH, helper as u64);
        self.masm.movq_mr(CTX, self.layout.scratch_rsp, Reg::Rsp);
        self.emit_align_stack();
        #[cfg(windows)]
        self.masm.subq_ri(Reg::Rsp, 32);
        self.masm.call_r(SCRATCH);
        self.masm.movq_rm(Reg::Rsp, CTX, self.layout.scratch_rsp);
    }

    // -- opcode emitters ----------------------------------------------------

    fn emit_proc(&mut self) {
        self.masm.subq_ri(STK, CELL_SIZE as i32);
        self.masm.movq_rr(SCRATCH, FRM);
        self.masm.subq_rr(SCRATCH, DAT);
        self.masm.movl_mr(STK, 0, SCRATCH);
        self.masm.movq_rr(FRM, STK);
    }

    fn emit_retn(&mut self) {
        self.masm.movq_rr(STK, FRM);
        self.masm.movl_rm(TMP, STK, 0);
        self.masm.addq_ri(STK, CELL_SIZE as i32);
        self.masm.movl_rr(FRM, TMP);
        self.masm.addq_rr(FRM, DAT);
        // Drop the argument block: its byte count sits above the saved frm.
        self.masm.movl_rm(TMP, STK, 0);
        self.masm.addq_ri(STK, CELL_SIZE as i32);
        self.masm.addq_rr(STK, TMP);
        self.emit_cip_mapping(self.op_cip);
        self.masm.movq_rr(Reg::Rsp, Reg::Rbp);
        self.masm.pop_r(Reg::Rbp);
        self.masm.ret();
    }

    fn emit_break(&mut self) {
        // Debugger anchor: a distinct pc with a cip-map entry.
        self.masm.nop();
        self.emit_cip_mapping(self.op_cip);
    }

    fn emit_sdiv(&mut self) {
        self.masm.movl_rr(TMP, ALT);
        self.masm.testl_rr(TMP, TMP);
        self.jump_on_error(Cond::Equal, ErrorCode::DivideByZero);
        self.masm.cmpl_ri(PRI, i32::MIN);
        let mut ok = Label::new();
        self.masm.jcc(Cond::NotEqual, &mut ok);
        self.masm.cmpl_ri(TMP, -1);
        self.jump_on_error(Cond::Equal, ErrorCode::IntegerOverflow);
        self.masm.bind(&mut ok);
        self.masm.cdq();
        self.masm.idivl_r(TMP);
    }

    fn emit_load_i(&mut self) {
        self.masm.cmpl_ri(PRI, self.mem_size as i32 - CELL_SIZE as i32);
        self.jump_on_error(Cond::Above, ErrorCode::MemAccess);
        self.masm.movl_rr(TMP, PRI);
        self.masm.movl_rm_index(PRI, DAT, TMP);
    }

    fn emit_stor_i(&mut self) {
        self.masm.cmpl_ri(ALT, self.mem_size as i32 - CELL_SIZE as i32);
        self.jump_on_error(Cond::Above, ErrorCode::MemAccess);
        self.masm.movl_rr(TMP, ALT);
        self.masm.movl_mr_index(DAT, TMP, PRI);
    }

    fn emit_bounds(&mut self, limit: Cell) {
        self.masm.cmpl_ri(PRI, limit);
        let mut path = OutOfBoundsPath {
            label: Label::new(),
            bounds: limit,
            cip: self.op_cip,
        };
        self.masm.jcc(Cond::Above, &mut path.label);
        self.ool_paths.push(OolPath::OutOfBounds(path));
    }

    fn emit_stack(&mut self, amount: Cell) {
        self.masm.addq_ri(STK, amount);
        if amount < 0 {
            // Growing down: keep clear of the heap plus margin.
            self.masm.movl_rm(TMP, CTX, self.layout.hp);
            self.masm.addq_rr(TMP, DAT);
            self.masm.addq_ri(TMP, STACK_MARGIN as i32);
            self.masm.cmpq_rr(STK, TMP);
            self.jump_on_error(Cond::Below, ErrorCode::StackLow);
        } else {
            self.masm.movl_rm(TMP, CTX, self.layout.mem_size);
            self.masm.addq_rr(TMP, DAT);
            self.masm.cmpq_rr(STK, TMP);
            self.jump_on_error(Cond::Above, ErrorCode::StackMin);
        }
    }

    fn emit_heap(&mut self, amount: Cell) {
        self.masm.movl_rm(ALT, CTX, self.layout.hp);
        self.masm.movl_rr(TMP, ALT);
        self.masm.addl_ri(TMP, amount);
        if amount >= 0 {
            // Growing up: keep clear of the stack minus margin.
            self.masm.movq_rr(SCRATCH, STK);
            self.masm.subq_rr(SCRATCH, DAT);
            self.masm.subq_ri(SCRATCH, STACK_MARGIN as i32);
            self.masm.cmpq_rr(TMP, SCRATCH);
            self.jump_on_error(Cond::Greater, ErrorCode::HeapLow);
        } else {
            self.masm.cmpl_ri(TMP, self.data_size as i32);
            self.jump_on_error(Cond::Less, ErrorCode::HeapMin);
        }
        self.masm.movl_mr(CTX, self.layout.hp, TMP);
    }

    fn emit_jump(&mut self, target: u32) {
        let idx = target as usize / CELL_SIZE;
        self.masm.jmp(&mut self.jump_map[idx]);
        self.note_backward_jump(target);
    }

    fn emit_jcc(&mut self, cond: Cond, target: u32) {
        let idx = target as usize / CELL_SIZE;
        self.masm.testl_rr(PRI, PRI);
        self.masm.jcc(cond, &mut self.jump_map[idx]);
        self.note_backward_jump(target);
    }

    fn note_backward_jump(&mut self, target: u32) {
        if target <= self.op_cip {
            self.backward_jumps.push(BackwardJump {
                pc: self.masm.pc() as u32,
                cip: self.op_cip,
                timeout_offset: 0,
            });
        }
    }

    fn emit_sysreq(&mut self, index: Cell) {
        // Unbound natives fail through the shared invalid-native path.
        self.masm.movq_rm(TMP, CTX, self.layout.natives_bound);
        self.masm.cmpb_mi(TMP, index, 0);
        self.jump_on_error(Cond::Equal, ErrorCode::InvalidNative);

        self.masm.movl_mr(CTX, self.layout.pri, PRI);
        self.masm.movl_mr(CTX, self.layout.alt, ALT);
        self.emit_helper_frame();
        self.masm.movq_rr(ARG0, CTX);
        self.masm.movl_ri(ARG1, index);
        self.emit_helper_call(invoke_native_bridge as usize);

        // Nonzero status is the error code, already in the right register.
        self.masm.testl_rr(PRI, PRI);
        self.jump_on_computed_error(Cond::NotEqual);

        self.masm.movl_rm(PRI, CTX, self.layout.native_result);
        self.masm.movl_rm(ALT, CTX, self.layout.alt);
    }

    fn emit_call(&mut self, target: u32) {
        let mut path = CallThunkPath {
            label: Label::new(),
            target,
            cip: self.op_cip,
        };
        self.masm.call(&mut path.label);
        self.ool_paths.push(OolPath::CallThunk(path));
        self.emit_cip_mapping(self.op_cip);
    }

    // -- out-of-line bodies -------------------------------------------------

    fn emit_ool_path(&mut self, path: &mut OolPath) {
        match path {
            OolPath::Error(path) => self.emit_error_path(path),
            OolPath::OutOfBounds(path) => self.emit_out_of_bounds_path(path),
            OolPath::CallThunk(path) => self.emit_call_thunk_path(path),
        }
    }

    /// The error detour: one call instruction into the shared block for this
    /// error kind (or the generic report routine when the code is computed),
    /// plus the cip-map entry that identifies the offending instruction.
    fn emit_error_path(&mut self, path: &ErrorPath) {
        self.emit_align_stack();
        match path.err {
            None => self.masm.call(&mut self.report_error),
            Some(err) => self.masm.call(&mut self.throw_error_code[err as usize]),
        }
        self.emit_cip_mapping(path.cip);
    }

    fn emit_out_of_bounds_path(&mut self, path: &OutOfBoundsPath) {
        // The failing bound rides along in alt for the error sink.
        self.masm.movl_ri(ALT, path.bounds);
        self.emit_align_stack();
        self.masm
            .call(&mut self.throw_error_code[ErrorCode::ArrayBounds as usize]);
        self.emit_cip_mapping(path.cip);
    }

    fn emit_call_thunk_path(&mut self, path: &CallThunkPath) {
        tracing::trace!(cip = path.cip, target = path.target, "emitting call thunk");
        // The return address of the inline call identifies the patch site:
        // the call instruction starts five bytes before it.
        self.masm.movq_rm(ARG2, Reg::Rsp, 0);
        self.masm.subq_ri(ARG2, 5);
        self.emit_helper_frame();
        self.masm.movq_rr(ARG0, CTX);
        self.masm.movl_ri(ARG1, path.target as i32);
        self.emit_helper_call(compile_from_thunk_bridge as usize);

        self.masm.testq_rr(Reg::Rax, Reg::Rax);
        let mut fail = Label::new();
        self.masm.jcc(Cond::Equal, &mut fail);
        // Tail-jump into the callee; it returns straight to the inline site.
        self.masm.jmp_r(Reg::Rax);

        self.masm.bind(&mut fail);
        self.masm.movl_rm(PRI, CTX, self.layout.pending_err);
        self.masm.jmp(&mut self.report_error);
    }

    // -- shared tails -------------------------------------------------------

    fn emit_throw_path_if_needed(&mut self, err: ErrorCode) {
        if !self.throw_error_code[err as usize].used() {
            return;
        }
        self.masm.bind(&mut self.throw_error_code[err as usize]);
        self.masm.movl_ri(PRI, err as i32);
        self.masm.jmp(&mut self.report_error);
    }

    /// The generic report-error routine and the shared unwind. Emitted only
    /// for the return paths that were actually used, which is why this block
    /// comes after every possible caller.
    fn emit_error_handlers(&mut self) {
        if self.report_error.used() {
            self.masm.bind(&mut self.report_error);
            // [rsp] is the return address of the detour call: the cip-map
            // site for the faulting instruction.
            self.masm.movq_rm(SCRATCH, Reg::Rsp, 0);
            self.masm.movq_mr(CTX, self.layout.code_pc, SCRATCH);
            self.masm.movl_rr(ERR_STASH, PRI);
            self.masm.movq_mr(CTX, self.layout.exit_fp, Reg::Rbp);
            self.masm.movq_rr(ARG0, CTX);
            self.masm.movl_rr(ARG1, ERR_STASH);
            self.emit_helper_call(invoke_report_error_bridge as usize);
            self.masm.jmp(&mut self.return_reported_error);
        }

        if self.throw_timeout.used() {
            self.masm.bind(&mut self.throw_timeout);
            self.masm.movq_rm(SCRATCH, Reg::Rsp, 0);
            self.masm.movq_mr(CTX, self.layout.code_pc, SCRATCH);
            self.masm.movq_mr(CTX, self.layout.exit_fp, Reg::Rbp);
            self.masm.movq_rr(ARG0, CTX);
            self.emit_helper_call(invoke_report_timeout_bridge as usize);
            self.masm.movl_ri(ERR_STASH, ErrorCode::Timeout as i32);
            self.masm.jmp(&mut self.return_reported_error);
        }

        if self.return_reported_error.used() {
            self.masm.bind(&mut self.return_reported_error);
            // Unwind the whole scripted stack in one shot: reset rsp into
            // the entry stub's frame and run its epilogue.
            self.masm.movq_rr(ARG0, CTX);
            self.emit_helper_call(find_entry_fp_bridge as usize);
            self.masm.movq_rr(TMP, Reg::Rax);
            self.masm.movl_rr(Reg::Rax, ERR_STASH);
            self.masm.movq_rr(Reg::Rsp, TMP);
            self.masm.subq_ri(Reg::Rsp, ENTRY_FRAME_SAVE_BYTES);
            self.masm.pop_r(Reg::R15);
            self.masm.pop_r(Reg::R14);
            self.masm.pop_r(Reg::R13);
            self.masm.pop_r(Reg::R12);
            self.masm.pop_r(Reg::Rbx);
            self.masm.addq_ri(Reg::Rsp, 16);
            self.masm.pop_r(Reg::Rbp);
            self.masm.ret();
        }
    }
}

impl PcodeVisitor for Compiler<'_> {
    fn visit(&mut self, cip: u32, instr: &Instruction) -> bool {
        // Helpers that add cip-map entries for this instruction use op_cip.
        self.op_cip = cip;
        match instr.op {
            OpCode::Proc => self.emit_proc(),
            // The driver stops before function boundaries.
            OpCode::EndProc => return false,
            OpCode::Retn => self.emit_retn(),
            OpCode::Break => self.emit_break(),
            OpCode::ConstPri => self.masm.movl_ri(PRI, instr.operand),
            OpCode::ConstAlt => self.masm.movl_ri(ALT, instr.operand),
            OpCode::LoadPri => self.masm.movl_rm(PRI, DAT, instr.operand),
            OpCode::LoadAlt => self.masm.movl_rm(ALT, DAT, instr.operand),
            OpCode::StorPri => self.masm.movl_mr(DAT, instr.operand, PRI),
            OpCode::LoadSPri => self.masm.movl_rm(PRI, FRM, instr.operand),
            OpCode::StorSPri => self.masm.movl_mr(FRM, instr.operand, PRI),
            OpCode::LoadI => self.emit_load_i(),
            OpCode::StorI => self.emit_stor_i(),
            OpCode::PushPri => {
                self.masm.subq_ri(STK, CELL_SIZE as i32);
                self.masm.movl_mr(STK, 0, PRI);
            }
            OpCode::PushAlt => {
                self.masm.subq_ri(STK, CELL_SIZE as i32);
                self.masm.movl_mr(STK, 0, ALT);
            }
            OpCode::PushC => {
                self.masm.subq_ri(STK, CELL_SIZE as i32);
                self.masm.movl_mi(STK, 0, instr.operand);
            }
            OpCode::PopPri => {
                self.masm.movl_rm(PRI, STK, 0);
                self.masm.addq_ri(STK, CELL_SIZE as i32);
            }
            OpCode::PopAlt => {
                self.masm.movl_rm(ALT, STK, 0);
                self.masm.addq_ri(STK, CELL_SIZE as i32);
            }
            OpCode::Stack => self.emit_stack(instr.operand),
            OpCode::Heap => self.emit_heap(instr.operand),
            OpCode::Add => self.masm.addl_rr(PRI, ALT),
            OpCode::Sub => self.masm.subl_rr(PRI, ALT),
            OpCode::Smul => self.masm.imull_rr(PRI, ALT),
            OpCode::Sdiv => self.emit_sdiv(),
            OpCode::And => self.masm.andl_rr(PRI, ALT),
            OpCode::Or => self.masm.orl_rr(PRI, ALT),
            OpCode::Xor => self.masm.xorl_rr(PRI, ALT),
            OpCode::Shl => {
                self.masm.movl_rr(TMP, ALT);
                self.masm.shll_cl(PRI);
            }
            OpCode::Not => {
                self.masm.testl_rr(PRI, PRI);
                self.masm.setcc(Cond::Equal, PRI);
                self.masm.movzxb_rr(PRI, PRI);
            }
            OpCode::Neg => self.masm.negl_r(PRI),
            OpCode::Eq => {
                self.masm.cmpl_rr(PRI, ALT);
                self.masm.setcc(Cond::Equal, PRI);
                self.masm.movzxb_rr(PRI, PRI);
            }
            OpCode::Sless => {
                self.masm.cmpl_rr(PRI, ALT);
                self.masm.setcc(Cond::Less, PRI);
                self.masm.movzxb_rr(PRI, PRI);
            }
            OpCode::Jump => self.emit_jump(instr.operand as u32),
            OpCode::Jzer => self.emit_jcc(Cond::Equal, instr.operand as u32),
            OpCode::Jnz => self.emit_jcc(Cond::NotEqual, instr.operand as u32),
            OpCode::Bounds => self.emit_bounds(instr.operand),
            OpCode::SysreqC => self.emit_sysreq(instr.operand),
            OpCode::Call => self.emit_call(instr.operand as u32),
        }
        true
    }
}

// -- helpers generated code calls into -------------------------------------

fn resolve_fault_cip(ctx: &PluginContext) -> Option<u32> {
    let pc = ctx.regs.code_pc as usize;
    let fun = ctx.runtime().find_compiled_by_pc(pc)?;
    let pcoffs = (pc - fun.chunk().address() as usize) as u32;
    fun.cip_for_pc(pcoffs)
}

/// Exit frame is live; called from the generated report-error routine.
unsafe extern "C" fn invoke_report_error_bridge(ctx: *mut PluginContext, err: i32) {
    let ctx = &mut *ctx;
    let code = ErrorCode::from_i32(err).unwrap_or(ErrorCode::InvalidInstruction);
    let cip = resolve_fault_cip(ctx);
    tracing::debug!(error = %code, ?cip, "runtime error reported");
    ctx.record_error(code, cip);
}

/// As above, for timeouts: the watchdog must learn the preemption landed
/// before the error is recorded.
unsafe extern "C" fn invoke_report_timeout_bridge(ctx: *mut PluginContext) {
    let ctx = &mut *ctx;
    ctx.env().watchdog().notify_timeout_received();
    let cip = resolve_fault_cip(ctx);
    ctx.record_error(ErrorCode::Timeout, cip);
}

unsafe extern "C" fn find_entry_fp_bridge(ctx: *mut PluginContext) -> *mut u8 {
    let ctx = &*ctx;
    find_entry_fp(ctx.regs.exit_fp)
}

/// Returns the callee entry, or null with the status parked in the context
/// for the generated failure path.
unsafe extern "C" fn compile_from_thunk_bridge(
    ctx: *mut PluginContext,
    pcode_offset: u32,
    patch_pc: *mut u8,
) -> *const u8 {
    let ctx = &mut *ctx;
    let mut entry: *const u8 = std::ptr::null();
    let status = compile_from_thunk(ctx, pcode_offset, &mut entry, patch_pc);
    if status != ErrorCode::None {
        ctx.regs.pending_err = status as i32;
        return std::ptr::null();
    }
    entry
}

/// Dispatches a native call. Returns an error code; the result cell travels
/// through the context.
unsafe extern "C" fn invoke_native_bridge(ctx: *mut PluginContext, index: u32) -> i32 {
    let ctx = &mut *ctx;
    let args = match ctx.native_args() {
        Ok(args) => args,
        Err(err) => return err as i32,
    };
    match ctx.runtime().clone().invoke_native(index as usize, &args) {
        Ok(value) => {
            ctx.regs.native_result = value;
            ErrorCode::None as i32
        }
        Err(err) => err as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::JitConfig;
    use crate::image::{ImageBuilder, PluginImage};

    fn env_with(config: JitConfig) -> Arc<Environment> {
        Environment::new(config).expect("environment should build")
    }

    fn runtime_for(image: PluginImage) -> (Arc<Environment>, Arc<PluginRuntime>) {
        let env = env_with(JitConfig::default());
        let rt = PluginRuntime::new(env.clone(), image).expect("runtime should build");
        (env, rt)
    }

    fn minimal_image() -> PluginImage {
        let mut builder = ImageBuilder::new();
        builder.public("main").expect("public");
        builder.op(OpCode::Proc).op(OpCode::Retn).op(OpCode::EndProc);
        builder.finish().expect("image")
    }

    #[test]
    fn minimal_function_compiles() {
        let (env, rt) = runtime_for(minimal_image());
        let method = rt.acquire_method(0).expect("method");
        let fun = compile(&env, &rt, &method).expect("compile should succeed");

        assert_eq!(fun.pcode_offset(), 0);
        assert!(fun.loop_edges().is_empty());
        // The retn site is mapped.
        assert!(fun.cip_map().iter().any(|entry| entry.cipoffs == 4));
        assert!(method.jit().is_some());
        assert_eq!(env.compile_count(), 1);
    }

    #[test]
    fn compile_is_idempotent_per_method() {
        let (env, rt) = runtime_for(minimal_image());
        let method = rt.acquire_method(0).expect("method");
        let first = compile(&env, &rt, &method).expect("compile should succeed");
        let second = compile(&env, &rt, &method).expect("recompile request");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(env.compile_count(), 1);
    }

    #[test]
    fn bounds_check_registers_one_ool_path_and_uses_the_shared_slot() {
        let mut builder = ImageBuilder::new();
        builder.public("main").expect("public");
        builder.op(OpCode::Proc);
        builder.op1(OpCode::ConstPri, 3);
        builder.op1(OpCode::Bounds, 7);
        builder.op(OpCode::Retn).op(OpCode::EndProc);
        let (env, rt) = runtime_for(builder.finish().expect("image"));

        let mut compiler = Compiler::new(&env, &rt, 0);
        let fun = compiler.emit().expect("compile should succeed");

        assert_eq!(compiler.ool_paths_emitted(), 1);
        assert!(compiler.throw_error_code[ErrorCode::ArrayBounds as usize].used());
        assert!(!compiler.throw_error_code[ErrorCode::DivideByZero as usize].bound());
        assert!(compiler.report_error.used());
        // The bounds-check site is in the cip map (cip 12 is the bounds op).
        assert!(fun.cip_map().iter().any(|entry| entry.cipoffs == 12));
    }

    #[test]
    fn unused_error_paths_are_not_emitted() {
        let (env, rt) = runtime_for(minimal_image());
        let mut compiler = Compiler::new(&env, &rt, 0);
        compiler.emit().expect("compile should succeed");
        for err in THROWN_ERRORS {
            assert!(!compiler.throw_error_code[err as usize].used());
            assert!(!compiler.throw_error_code[err as usize].bound());
        }
        assert!(!compiler.report_error.used());
        assert!(!compiler.throw_timeout.used());
    }

    #[test]
    fn backward_jump_produces_a_loop_edge_into_the_tail() {
        let mut builder = ImageBuilder::new();
        builder.public("main").expect("public");
        builder.op(OpCode::Proc);
        builder.label("loop").expect("label");
        builder.op1(OpCode::ConstPri, 1);
        builder.jump(OpCode::Jump, "loop");
        let image = {
            // Unreachable tail so validation sees a terminator.
            builder.op(OpCode::Retn).op(OpCode::EndProc);
            builder.finish().expect("image")
        };
        let (env, rt) = runtime_for(image);

        let mut compiler = Compiler::new(&env, &rt, 0);
        let fun = compiler.emit().expect("compile should succeed");

        assert_eq!(fun.loop_edges().len(), 1);
        let edge = fun.loop_edges()[0];
        assert!(edge.disp32 > 0, "thunk lies forward of the branch");
        assert_eq!(
            edge.offset as i32 + edge.disp32,
            compiler.backward_jumps[0].timeout_offset as i32
        );
        assert!(compiler.throw_timeout.used());
        // The thunk site has a cip-map entry for the jump instruction.
        let timeout_offset = compiler.backward_jumps[0].timeout_offset;
        let thunk_entry = fun
            .cip_map()
            .iter()
            .find(|entry| entry.pcoffs > timeout_offset)
            .expect("thunk cip entry");
        assert_eq!(thunk_entry.cipoffs, 12);
    }

    #[test]
    fn function_boundary_stops_the_decode_loop() {
        let mut builder = ImageBuilder::new();
        builder.public("first").expect("public");
        builder.op(OpCode::Proc).op(OpCode::Retn).op(OpCode::EndProc);
        builder.public("second").expect("public");
        builder.op(OpCode::Proc);
        builder.op1(OpCode::ConstPri, 99);
        builder.op(OpCode::Retn).op(OpCode::EndProc);
        let (env, rt) = runtime_for(builder.finish().expect("image"));

        let method = rt.acquire_method(0).expect("method");
        let first = compile(&env, &rt, &method).expect("compile should succeed");

        let method = rt.acquire_method(12).expect("method");
        let second = compile(&env, &rt, &method).expect("compile should succeed");

        // The first function must not contain the second's body.
        assert!(first.chunk().len() < second.chunk().len());
    }

    #[test]
    fn assembler_overflow_fails_the_compile_and_leaves_no_state() {
        let mut builder = ImageBuilder::new();
        builder.public("main").expect("public");
        builder.op(OpCode::Proc);
        for _ in 0..64 {
            builder.op1(OpCode::ConstPri, 1);
        }
        builder.op(OpCode::Retn).op(OpCode::EndProc);
        let image = builder.finish().expect("image");

        let env = env_with(JitConfig { max_code_size: 64, ..JitConfig::default() });
        let rt = PluginRuntime::new(env.clone(), image).expect("runtime should build");
        let method = rt.acquire_method(0).expect("method");

        assert_eq!(
            compile(&env, &rt, &method).unwrap_err(),
            ErrorCode::OutOfMemory
        );
        assert!(method.jit().is_none());
        assert_eq!(env.compile_count(), 0);
    }

    #[test]
    fn compile_from_thunk_refuses_while_preemption_pending() {
        let (env, rt) = runtime_for(minimal_image());
        let mut ctx = PluginContext::new(env.clone(), rt.clone());
        env.watchdog().trigger_timeout(&rt);

        let mut entry = std::ptr::null();
        let status = compile_from_thunk(&mut ctx, 0, &mut entry, std::ptr::null_mut());
        assert_eq!(status, ErrorCode::Timeout);
        assert!(rt.acquire_method(0).expect("method").jit().is_none());

        env.watchdog().notify_timeout_received();
        let status = compile_from_thunk(&mut ctx, 0, &mut entry, std::ptr::null_mut());
        assert_eq!(status, ErrorCode::None);
        assert!(!entry.is_null());
    }

    #[test]
    fn thunk_resolution_is_idempotent() {
        let (env, rt) = runtime_for(minimal_image());
        let mut ctx = PluginContext::new(env.clone(), rt.clone());

        let mut first = std::ptr::null();
        assert_eq!(
            compile_from_thunk(&mut ctx, 0, &mut first, std::ptr::null_mut()),
            ErrorCode::None
        );
        let mut second = std::ptr::null();
        assert_eq!(
            compile_from_thunk(&mut ctx, 0, &mut second, std::ptr::null_mut()),
            ErrorCode::None
        );

        assert_eq!(first, second, "both callers observe the same entry");
        assert_eq!(env.compile_count(), 1);
    }

    #[test]
    fn compile_from_thunk_rejects_bad_offsets() {
        let (env, rt) = runtime_for(minimal_image());
        let mut ctx = PluginContext::new(env, rt);
        let mut entry = std::ptr::null();
        let status = compile_from_thunk(&mut ctx, 2, &mut entry, std::ptr::null_mut());
        assert_eq!(status, ErrorCode::InvalidAddress);
    }

    #[test]
    fn cip_map_is_strictly_monotonic() {
        let mut builder = ImageBuilder::new();
        builder.public("main").expect("public");
        builder.op(OpCode::Proc);
        builder.op(OpCode::Break);
        builder.op(OpCode::Break);
        builder.op1(OpCode::ConstPri, 4);
        builder.op1(OpCode::ConstAlt, 2);
        builder.op(OpCode::Sdiv);
        builder.op(OpCode::Retn).op(OpCode::EndProc);
        let (env, rt) = runtime_for(builder.finish().expect("image"));

        let mut compiler = Compiler::new(&env, &rt, 0);
        let fun = compiler.emit().expect("compile should succeed");
        assert!(fun
            .cip_map()
            .windows(2)
            .all(|pair| pair[0].pcoffs < pair[1].pcoffs));
        assert!(fun.cip_map().len() >= 3, "two breaks and a retn at least");
    }
}
