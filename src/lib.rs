pub mod bytecode;
pub mod compiler;
pub mod context;
pub mod environment;
pub mod errors;
pub mod frames;
pub mod image;
pub mod linking;
pub mod masm;
pub mod reader;
pub mod runtime;
pub mod watchdog;

pub use bytecode::{decode_instruction, disassemble, Cell, Instruction, OpCode, CELL_SIZE};
pub use compiler::{compile, compile_from_thunk, Compiler};
pub use context::{PluginContext, ReportedError};
pub use environment::{Environment, JitConfig};
pub use errors::{ErrorCode, MAX_ERROR_CODES};
pub use frames::{find_entry_fp, FrameLayout, JitFrameIterator, JitFrameType};
pub use image::{
    decode_image, encode_image, BuildError, ImageBuilder, ImageError, PluginImage, Public,
};
pub use masm::{Cond, Label, MacroAssembler, Reg};
pub use reader::{PcodeReader, PcodeVisitor};
pub use runtime::{
    CipMapEntry, CompiledFunction, LoopEdge, MethodInfo, NativeHandler, PluginRuntime,
};
pub use watchdog::WatchdogTimer;
