use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::bytecode::{decode_instruction, read_cell, Cell, OpCode, CELL_SIZE};
use crate::environment::Environment;
use crate::errors::ErrorCode;
use crate::image::PluginImage;
use crate::linking::CodeChunk;

/// A backward branch the watchdog may retarget. `offset` is the native pc
/// just past the branch instruction; its rel32 field sits at `offset - 4`.
/// `disp32` is the displacement that redirects the branch to its timeout
/// thunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopEdge {
    pub offset: u32,
    pub disp32: i32,
}

/// One (native pc → p-code cip) pair. Strictly monotonic in native pc.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CipMapEntry {
    pub pcoffs: u32,
    pub cipoffs: u32,
}

/// An owned handle over one function's published native code. Immutable
/// after construction; shared references stay valid for in-flight
/// invocations.
#[derive(Debug)]
pub struct CompiledFunction {
    chunk: CodeChunk,
    pcode_offset: u32,
    loop_edges: Box<[LoopEdge]>,
    cip_map: Box<[CipMapEntry]>,
}

impl CompiledFunction {
    pub(crate) fn new(
        chunk: CodeChunk,
        pcode_offset: u32,
        loop_edges: Box<[LoopEdge]>,
        cip_map: Box<[CipMapEntry]>,
    ) -> Self {
        debug_assert!(cip_map.windows(2).all(|pair| pair[0].pcoffs < pair[1].pcoffs));
        Self { chunk, pcode_offset, loop_edges, cip_map }
    }

    pub fn entry(&self) -> *const u8 {
        self.chunk.address()
    }

    pub fn chunk(&self) -> &CodeChunk {
        &self.chunk
    }

    pub fn pcode_offset(&self) -> u32 {
        self.pcode_offset
    }

    pub fn loop_edges(&self) -> &[LoopEdge] {
        &self.loop_edges
    }

    pub fn cip_map(&self) -> &[CipMapEntry] {
        &self.cip_map
    }

    pub fn contains_pc(&self, pc: usize) -> bool {
        self.chunk.contains(pc)
    }

    /// Recovers the p-code cip for a native pc offset inside this chunk:
    /// the nearest mapped site at or before the pc.
    pub fn cip_for_pc(&self, pcoffs: u32) -> Option<u32> {
        let idx = self.cip_map.partition_point(|entry| entry.pcoffs <= pcoffs);
        if idx == 0 {
            return None;
        }
        Some(self.cip_map[idx - 1].cipoffs)
    }
}

/// Per-function record: validation status and the compiled-function
/// reference, both written at most once under the method lock.
pub struct MethodInfo {
    pcode_offset: u32,
    pub(crate) state: Mutex<MethodState>,
}

#[derive(Default)]
pub(crate) struct MethodState {
    pub(crate) validated: Option<Result<(), ErrorCode>>,
    pub(crate) compiled: Option<Arc<CompiledFunction>>,
}

impl MethodInfo {
    fn new(pcode_offset: u32) -> Self {
        Self { pcode_offset, state: Mutex::new(MethodState::default()) }
    }

    pub fn pcode_offset(&self) -> u32 {
        self.pcode_offset
    }

    pub fn jit(&self) -> Option<Arc<CompiledFunction>> {
        self.state.lock().expect("method lock poisoned").compiled.clone()
    }
}

/// Host callback bound to a native slot.
pub trait NativeHandler: Send {
    fn invoke(&mut self, args: &[Cell]) -> Result<Cell, ErrorCode>;
}

impl<F> NativeHandler for F
where
    F: FnMut(&[Cell]) -> Result<Cell, ErrorCode> + Send,
{
    fn invoke(&mut self, args: &[Cell]) -> Result<Cell, ErrorCode> {
        self(args)
    }
}

/// The owner of one code image and the functions compiled from it. Lifetime
/// bounds every compiled function it produced.
pub struct PluginRuntime {
    env: Arc<Environment>,
    image: PluginImage,
    name: String,
    methods: Mutex<HashMap<u32, Arc<MethodInfo>>>,
    natives: Mutex<Vec<Option<Box<dyn NativeHandler>>>>,
    natives_bound: Box<[AtomicU8]>,
}

impl PluginRuntime {
    pub fn new(env: Arc<Environment>, image: PluginImage) -> Result<Arc<Self>, ErrorCode> {
        Self::with_name(env, image, "plugin")
    }

    pub fn with_name(
        env: Arc<Environment>,
        image: PluginImage,
        name: &str,
    ) -> Result<Arc<Self>, ErrorCode> {
        if image.code().is_empty() {
            return Err(ErrorCode::InvalidAddress);
        }
        let native_count = image.natives().len();
        let mut natives = Vec::with_capacity(native_count);
        natives.resize_with(native_count, || None);
        let natives_bound = (0..native_count).map(|_| AtomicU8::new(0)).collect();
        Ok(Arc::new(Self {
            env,
            image,
            name: name.to_string(),
            methods: Mutex::new(HashMap::new()),
            natives: Mutex::new(natives),
            natives_bound,
        }))
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn image(&self) -> &PluginImage {
        &self.image
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up (or creates) the method record at a p-code offset. Returns
    /// `None` unless the offset is a plausible function start.
    pub fn acquire_method(&self, pcode_offset: u32) -> Option<Arc<MethodInfo>> {
        let at = pcode_offset as usize;
        if at % CELL_SIZE != 0 || at >= self.image.code().len() {
            return None;
        }
        if read_cell(self.image.code(), pcode_offset) != Some(OpCode::Proc as Cell) {
            return None;
        }
        let mut methods = self.methods.lock().expect("method table lock poisoned");
        Some(
            methods
                .entry(pcode_offset)
                .or_insert_with(|| Arc::new(MethodInfo::new(pcode_offset)))
                .clone(),
        )
    }

    /// Validates a method once and caches the verdict. Must be called with
    /// the method state lock held.
    pub(crate) fn validate_locked(
        &self,
        method: &MethodInfo,
        state: &mut MethodState,
    ) -> Result<(), ErrorCode> {
        if let Some(cached) = state.validated {
            return cached;
        }
        let verdict = validate_method_body(&self.image, method.pcode_offset());
        if let Err(err) = verdict {
            tracing::debug!(
                method = %self.image.lookup_function(method.pcode_offset()),
                %err,
                "method failed validation"
            );
        }
        state.validated = Some(verdict);
        verdict
    }

    pub fn bind_native(
        &self,
        name: &str,
        handler: Box<dyn NativeHandler>,
    ) -> Result<usize, ErrorCode> {
        let index = self
            .image
            .natives()
            .iter()
            .position(|native| native == name)
            .ok_or(ErrorCode::InvalidNative)?;
        let mut natives = self.natives.lock().expect("native table lock poisoned");
        natives[index] = Some(handler);
        self.natives_bound[index].store(1, Ordering::Release);
        Ok(index)
    }

    pub(crate) fn natives_bound_ptr(&self) -> *const u8 {
        self.natives_bound.as_ptr() as *const u8
    }

    pub(crate) fn invoke_native(&self, index: usize, args: &[Cell]) -> Result<Cell, ErrorCode> {
        let mut natives = self.natives.lock().expect("native table lock poisoned");
        let handler = natives
            .get_mut(index)
            .and_then(|slot| slot.as_mut())
            .ok_or(ErrorCode::InvalidNative)?;
        handler.invoke(args)
    }

    /// Finds the compiled function whose chunk contains an absolute native
    /// pc. Used to resolve trap sites back to p-code.
    pub fn find_compiled_by_pc(&self, pc: usize) -> Option<Arc<CompiledFunction>> {
        let methods = self.methods.lock().expect("method table lock poisoned");
        for method in methods.values() {
            if let Some(fun) = method.jit() {
                if fun.contains_pc(pc) {
                    return Some(fun);
                }
            }
        }
        None
    }

    pub(crate) fn for_each_compiled(&self, mut f: impl FnMut(&CompiledFunction)) {
        let methods = self.methods.lock().expect("method table lock poisoned");
        for method in methods.values() {
            if let Some(fun) = method.jit() {
                f(&fun);
            }
        }
    }
}

/// Structural validation of one method, in two passes: discover instruction
/// boundaries and the terminator, then check every operand against them.
fn validate_method_body(image: &PluginImage, pcode_offset: u32) -> Result<(), ErrorCode> {
    let code = image.code();
    let data_size = image.data().len() as u32;

    if read_cell(code, pcode_offset) != Some(OpCode::Proc as Cell) {
        return Err(ErrorCode::InvalidAddress);
    }

    let mut boundaries = HashSet::new();
    let mut cip = pcode_offset;
    let mut last_op = OpCode::Proc;
    let end;
    loop {
        if cip as usize >= code.len() {
            end = cip;
            break;
        }
        let Some(instr) = decode_instruction(code, cip) else {
            return Err(ErrorCode::InvalidInstruction);
        };
        if instr.op == OpCode::EndProc || (instr.op == OpCode::Proc && cip != pcode_offset) {
            end = cip;
            break;
        }
        boundaries.insert(cip);
        last_op = instr.op;
        cip += instr.size_in_bytes() as u32;
    }

    // Execution must never run off the end of the emitted body.
    if !matches!(last_op, OpCode::Retn | OpCode::Jump) {
        return Err(ErrorCode::InvalidInstruction);
    }

    let mut cip = pcode_offset;
    while cip < end {
        let instr = decode_instruction(code, cip).ok_or(ErrorCode::InvalidInstruction)?;
        match instr.op {
            OpCode::LoadPri | OpCode::LoadAlt | OpCode::StorPri => {
                let addr = instr.operand as u32;
                if instr.operand < 0
                    || addr % CELL_SIZE as u32 != 0
                    || addr + CELL_SIZE as u32 > data_size
                {
                    return Err(ErrorCode::MemAccess);
                }
            }
            OpCode::LoadSPri | OpCode::StorSPri | OpCode::Stack | OpCode::Heap => {
                if instr.operand % CELL_SIZE as Cell != 0 {
                    return Err(ErrorCode::InvalidInstruction);
                }
            }
            OpCode::Jump | OpCode::Jzer | OpCode::Jnz => {
                let target = instr.operand as u32;
                if instr.operand < 0 || !boundaries.contains(&target) {
                    return Err(ErrorCode::InvalidInstruction);
                }
            }
            OpCode::Bounds => {
                if instr.operand < 0 {
                    return Err(ErrorCode::InvalidInstruction);
                }
            }
            OpCode::SysreqC => {
                let index = instr.operand as usize;
                if instr.operand < 0 || index >= image.natives().len() {
                    return Err(ErrorCode::InvalidNative);
                }
            }
            OpCode::Call => {
                let target = instr.operand as u32;
                if instr.operand < 0
                    || read_cell(code, target) != Some(OpCode::Proc as Cell)
                {
                    return Err(ErrorCode::InvalidAddress);
                }
            }
            _ => {}
        }
        cip += instr.size_in_bytes() as u32;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::JitConfig;
    use crate::image::ImageBuilder;

    fn runtime_for(image: PluginImage) -> Arc<PluginRuntime> {
        let env = Environment::new(JitConfig::default()).expect("environment should build");
        PluginRuntime::new(env, image).expect("runtime should build")
    }

    fn validate(image: &PluginImage, offset: u32) -> Result<(), ErrorCode> {
        validate_method_body(image, offset)
    }

    #[test]
    fn minimal_method_validates() {
        let mut builder = ImageBuilder::new();
        builder.public("main").expect("public");
        builder.op(OpCode::Proc).op(OpCode::Retn).op(OpCode::EndProc);
        let image = builder.finish().expect("image");
        assert_eq!(validate(&image, 0), Ok(()));
    }

    #[test]
    fn non_proc_start_is_invalid() {
        let mut builder = ImageBuilder::new();
        builder.op(OpCode::Retn).op(OpCode::EndProc);
        let image = builder.finish().expect("image");
        assert_eq!(validate(&image, 0), Err(ErrorCode::InvalidAddress));
    }

    #[test]
    fn jump_into_operand_cell_is_invalid() {
        let mut builder = ImageBuilder::new();
        builder.op(OpCode::Proc);
        // jump targets the operand cell of const.pri.
        builder.op1(OpCode::Jump, 16);
        builder.op1(OpCode::ConstPri, 5);
        builder.op(OpCode::Retn).op(OpCode::EndProc);
        let image = builder.finish().expect("image");
        assert_eq!(validate(&image, 0), Err(ErrorCode::InvalidInstruction));
    }

    #[test]
    fn jump_past_the_terminator_is_invalid() {
        let mut builder = ImageBuilder::new();
        builder.op(OpCode::Proc);
        builder.op1(OpCode::Jump, 28);
        builder.op(OpCode::Retn).op(OpCode::EndProc);
        builder.op(OpCode::Proc).op(OpCode::Retn).op(OpCode::EndProc);
        let image = builder.finish().expect("image");
        assert_eq!(validate(&image, 0), Err(ErrorCode::InvalidInstruction));
    }

    #[test]
    fn data_address_out_of_range_is_invalid() {
        let mut builder = ImageBuilder::new();
        builder.data_cell(11);
        builder.op(OpCode::Proc);
        builder.op1(OpCode::LoadPri, 4);
        builder.op(OpCode::Retn).op(OpCode::EndProc);
        let image = builder.finish().expect("image");
        assert_eq!(validate(&image, 0), Err(ErrorCode::MemAccess));
    }

    #[test]
    fn native_index_out_of_range_is_invalid() {
        let mut builder = ImageBuilder::new();
        builder.op(OpCode::Proc);
        builder.op1(OpCode::SysreqC, 0);
        builder.op(OpCode::Retn).op(OpCode::EndProc);
        let image = builder.finish().expect("image");
        assert_eq!(validate(&image, 0), Err(ErrorCode::InvalidNative));
    }

    #[test]
    fn trailing_fallthrough_is_invalid() {
        let mut builder = ImageBuilder::new();
        builder.op(OpCode::Proc);
        builder.op1(OpCode::ConstPri, 1);
        builder.op(OpCode::EndProc);
        let image = builder.finish().expect("image");
        assert_eq!(validate(&image, 0), Err(ErrorCode::InvalidInstruction));
    }

    #[test]
    fn acquire_method_rejects_non_function_offsets() {
        let mut builder = ImageBuilder::new();
        builder.op(OpCode::Proc).op(OpCode::Retn).op(OpCode::EndProc);
        let runtime = runtime_for(builder.finish().expect("image"));
        assert!(runtime.acquire_method(0).is_some());
        assert!(runtime.acquire_method(2).is_none(), "unaligned");
        assert!(runtime.acquire_method(4).is_none(), "not a proc");
        assert!(runtime.acquire_method(400).is_none(), "out of range");
    }

    #[test]
    fn acquire_method_returns_the_same_record() {
        let mut builder = ImageBuilder::new();
        builder.op(OpCode::Proc).op(OpCode::Retn).op(OpCode::EndProc);
        let runtime = runtime_for(builder.finish().expect("image"));
        let first = runtime.acquire_method(0).expect("method");
        let second = runtime.acquire_method(0).expect("method");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn cip_for_pc_picks_the_nearest_prior_site() {
        let entries = vec![
            CipMapEntry { pcoffs: 10, cipoffs: 4 },
            CipMapEntry { pcoffs: 30, cipoffs: 12 },
            CipMapEntry { pcoffs: 50, cipoffs: 24 },
        ];
        let idx = entries.partition_point(|entry| entry.pcoffs <= 30);
        assert_eq!(entries[idx - 1].cipoffs, 12);
        let idx = entries.partition_point(|entry| entry.pcoffs <= 9);
        assert_eq!(idx, 0);
    }
}
