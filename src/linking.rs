//! Executable memory and code patching.
//!
//! Compiled functions are carved out of one reserved RWX region so every
//! chunk stays within rel32 range of every other (call-site patching and
//! loop-edge retargeting both write 32-bit displacements). Pages stay RWX for
//! the life of the pool; deployments that enforce W^X would need a W→X flip
//! between `link_code` and first execution.

use std::sync::Mutex;

use crate::errors::ErrorCode;
use crate::masm::MacroAssembler;

/// One reserved executable region, bump-allocated into chunks.
pub struct CodePool {
    base: *mut u8,
    size: usize,
    used: Mutex<usize>,
}

unsafe impl Send for CodePool {}
unsafe impl Sync for CodePool {}

impl CodePool {
    pub fn new(size: usize) -> Result<Self, ErrorCode> {
        let base = alloc_executable_region(size)?;
        Ok(Self { base, size, used: Mutex::new(0) })
    }

    fn allocate(&self, len: usize) -> Option<*mut u8> {
        let mut used = self.used.lock().expect("code pool lock poisoned");
        let at = (*used + 15) & !15;
        if at + len > self.size {
            return None;
        }
        *used = at + len;
        Some(unsafe { self.base.add(at) })
    }
}

impl Drop for CodePool {
    fn drop(&mut self) {
        free_executable_region(self.base, self.size);
    }
}

/// A published block of executable code. Non-owning; the pool outlives it.
/// Once published its bytes are only rewritten through `patch_call_thunk`
/// and the watchdog's loop-edge writes.
#[derive(Clone, Copy, Debug)]
pub struct CodeChunk {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for CodeChunk {}
unsafe impl Sync for CodeChunk {}

impl CodeChunk {
    pub fn address(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, pc: usize) -> bool {
        let base = self.base as usize;
        pc >= base && pc < base + self.len
    }
}

/// Publishes the assembler buffer as executable code.
pub fn link_code(pool: &CodePool, masm: &MacroAssembler) -> Result<CodeChunk, ErrorCode> {
    let bytes = masm.bytes();
    let base = pool.allocate(bytes.len()).ok_or(ErrorCode::OutOfMemory)?;
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), base, bytes.len());
    }
    Ok(CodeChunk { base, len: bytes.len() })
}

/// Rewrites already-published instruction bytes. x86 keeps instruction
/// fetch coherent with stores from the same core; weakly-ordered targets
/// would need an explicit instruction-cache flush here.
///
/// # Safety
/// `addr..addr+bytes.len()` must lie inside a published chunk, and no other
/// thread may be executing the rewritten instruction.
pub unsafe fn publish_patch(addr: *mut u8, bytes: &[u8]) {
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr, bytes.len());
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Retargets the `call rel32` at `patch_pc` to reach `entry` directly.
/// Only the displacement is rewritten; the instruction stays in place.
///
/// # Safety
/// `patch_pc` must point at the opcode byte of a `call rel32` inside a
/// published chunk.
pub unsafe fn patch_call_thunk(patch_pc: *mut u8, entry: *const u8) {
    debug_assert_eq!(*patch_pc, 0xE8, "patch site is not a call rel32");
    let rel = entry as i64 - (patch_pc as i64 + 5);
    let rel = i32::try_from(rel).expect("call target out of rel32 range");
    publish_patch(patch_pc.add(1), &rel.to_le_bytes());
}

#[cfg(target_os = "windows")]
fn alloc_executable_region(len: usize) -> Result<*mut u8, ErrorCode> {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        ) as *mut u8
    };
    if ptr.is_null() {
        return Err(ErrorCode::OutOfMemory);
    }
    Ok(ptr)
}

#[cfg(target_os = "windows")]
fn free_executable_region(ptr: *mut u8, _len: usize) {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

    if !ptr.is_null() {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
fn alloc_executable_region(len: usize) -> Result<*mut u8, ErrorCode> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(ErrorCode::OutOfMemory);
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "macos")]
fn alloc_executable_region(len: usize) -> Result<*mut u8, ErrorCode> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(ErrorCode::OutOfMemory);
    }
    Ok(ptr as *mut u8)
}

#[cfg(unix)]
fn free_executable_region(ptr: *mut u8, len: usize) {
    if !ptr.is_null() {
        unsafe {
            libc::munmap(ptr as *mut _, len);
        }
    }
}

#[cfg(not(any(unix, target_os = "windows")))]
fn alloc_executable_region(_len: usize) -> Result<*mut u8, ErrorCode> {
    Err(ErrorCode::OutOfMemory)
}

#[cfg(not(any(unix, target_os = "windows")))]
fn free_executable_region(_ptr: *mut u8, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_aligned_disjoint_chunks() {
        let pool = CodePool::new(1 << 16).expect("pool should map");
        let mut masm = MacroAssembler::new(1 << 12);
        masm.ret();
        let first = link_code(&pool, &masm).expect("first link should succeed");
        let second = link_code(&pool, &masm).expect("second link should succeed");
        assert_eq!(first.address() as usize % 16, 0);
        assert_eq!(second.address() as usize % 16, 0);
        assert!(!first.contains(second.address() as usize));
        assert_eq!(unsafe { *first.address() }, 0xC3);
    }

    #[test]
    fn exhausted_pool_reports_out_of_memory() {
        let pool = CodePool::new(32).expect("pool should map");
        let mut masm = MacroAssembler::new(1 << 12);
        for _ in 0..64 {
            masm.ret();
        }
        assert_eq!(link_code(&pool, &masm).unwrap_err(), ErrorCode::OutOfMemory);
    }

    #[test]
    fn patch_call_thunk_rewrites_displacement() {
        let pool = CodePool::new(1 << 16).expect("pool should map");
        let mut masm = MacroAssembler::new(1 << 12);
        // call +0; ret
        masm.emit(&[0xE8, 0, 0, 0, 0, 0xC3]);
        let chunk = link_code(&pool, &masm).expect("link should succeed");
        let target = unsafe { chunk.address().add(5) };
        unsafe {
            patch_call_thunk(chunk.address(), target);
        }
        let rel = unsafe {
            let mut raw = [0u8; 4];
            std::ptr::copy_nonoverlapping(chunk.address().add(1), raw.as_mut_ptr(), 4);
            i32::from_le_bytes(raw)
        };
        assert_eq!(rel, 0, "call should now land on the ret after it");
    }
}
