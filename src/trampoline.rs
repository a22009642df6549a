//! Host-call trampoline: JIT-emits a short x64 routine that marshals
//! stack-resident arguments into the Microsoft x64 ABI and calls an
//! arbitrary function pointer (spec §4.5)
//!
//! Grounded on `original_source/src/VM.c`'s `#if defined(_WIN32)` branch
//! of `Op_CallCFunc` for the exact byte sequences (REX-prefixed
//! `mov reg, imm64` into rcx/rdx/r8/r9, `mov rax, imm64; push rax` for
//! overflow arguments, `mov rax, fnPtr; call rax; ret`). The teacher
//! never JIT-compiles anything, so the executable-memory allocator is
//! drawn from the pack's `bytecodealliance-wasmtime` crate
//! (`cranelift-simplejit`'s use of the `region` crate for RWX pages)
//! rather than invented from scratch.

use std::error::Error;
use std::fmt;

use region::Protection;

/// Abstracts one (OS, ABI) pair's argument-marshaling convention away
/// from the interpreter, per spec §9 "Trampoline as interface".
pub trait HostCaller {
    fn call(&mut self, fn_ptr: u64, args: &[&[u8]], ret_size: usize) -> Result<u64, TrampolineError>;
}

/// Minimum page size requested for the generated routine (spec §4.5 step 1).
pub const TRAMPOLINE_PAGE_SIZE: usize = 256;

#[derive(Debug)]
pub enum TrampolineError {
    OversizeArgument { index: usize, size: usize },
    OversizeReturn { size: usize },
    PageAllocationFailed(String),
}

impl fmt::Display for TrampolineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrampolineError::OversizeArgument { index, size } => {
                write!(f, "argument {} has size {} (max 8 bytes)", index, size)
            }
            TrampolineError::OversizeReturn { size } => write!(f, "return size {} exceeds 8 bytes", size),
            TrampolineError::PageAllocationFailed(reason) => write!(f, "failed to allocate executable page: {}", reason),
        }
    }
}

impl Error for TrampolineError {}

/// Zero-extends a byte slice (length ≤ 8) into a 64-bit immediate,
/// little-endian (spec §4.5 step 2, "zero-extend its bytes").
fn zero_extend(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

/// The Microsoft x64 calling convention: first four integer arguments in
/// rcx, rdx, r8, r9; remaining arguments pushed right-to-left.
pub struct X64HostCaller;

impl X64HostCaller {
    pub fn new() -> X64HostCaller {
        X64HostCaller
    }

    /// Emits `mov <reg>, imm64` for one of rcx/rdx/r8/r9, REX-prefixed
    /// per the register's encoding.
    fn emit_mov_reg_imm64(code: &mut Vec<u8>, register_index: usize, imm: u64) {
        // REX.W + opcode + ModRM-folded register, per register slot.
        let (rex, opcode_reg) = match register_index {
            0 => (0x48, 0xB9), // mov rcx, imm64
            1 => (0x48, 0xBA), // mov rdx, imm64
            2 => (0x49, 0xB8), // mov r8,  imm64
            3 => (0x49, 0xB9), // mov r9,  imm64
            _ => unreachable!("only the first four argument slots go in registers"),
        };
        code.push(rex);
        code.push(opcode_reg);
        code.extend_from_slice(&imm.to_le_bytes());
    }

    /// Emits `mov rax, imm64` followed by `push rax`, used both for
    /// stack-overflow arguments and for loading the target function
    /// pointer.
    fn emit_mov_rax_imm64(code: &mut Vec<u8>, imm: u64) {
        code.push(0x48);
        code.push(0xB8);
        code.extend_from_slice(&imm.to_le_bytes());
    }

    fn emit_push_rax(code: &mut Vec<u8>) {
        code.push(0x50);
    }

    fn emit_call_rax(code: &mut Vec<u8>) {
        code.push(0xFF);
        code.push(0xD0);
    }

    fn emit_ret(code: &mut Vec<u8>) {
        code.push(0xC3);
    }

    /// Builds the machine code for one call, per spec §4.5 steps 2-3.
    fn build_routine(fn_ptr: u64, args: &[&[u8]]) -> Vec<u8> {
        let mut code = Vec::with_capacity(TRAMPOLINE_PAGE_SIZE);

        // "For each argument index i in descending order (so the first
        // argument is the final emission, and thus the first executed)".
        for (index, arg) in args.iter().enumerate().rev() {
            let imm = zero_extend(arg);
            if index < 4 {
                X64HostCaller::emit_mov_reg_imm64(&mut code, index, imm);
            } else {
                X64HostCaller::emit_mov_rax_imm64(&mut code, imm);
                X64HostCaller::emit_push_rax(&mut code);
            }
        }

        X64HostCaller::emit_mov_rax_imm64(&mut code, fn_ptr);
        X64HostCaller::emit_call_rax(&mut code);
        X64HostCaller::emit_ret(&mut code);
        code
    }
}

impl Default for X64HostCaller {
    fn default() -> X64HostCaller {
        X64HostCaller::new()
    }
}

impl HostCaller for X64HostCaller {
    fn call(&mut self, fn_ptr: u64, args: &[&[u8]], ret_size: usize) -> Result<u64, TrampolineError> {
        if ret_size > 8 {
            return Err(TrampolineError::OversizeReturn { size: ret_size });
        }
        for (index, arg) in args.iter().enumerate() {
            if arg.len() > 8 {
                return Err(TrampolineError::OversizeArgument { index, size: arg.len() });
            }
        }

        let routine = X64HostCaller::build_routine(fn_ptr, args);
        let page_len = routine.len().max(TRAMPOLINE_PAGE_SIZE);

        // SAFETY: `region::alloc` maps a fresh anonymous page; we are the
        // sole owner until `released` below, and no other thread can
        // observe it. The page is released before this function returns,
        // per spec §4.5 step 6, so its lifetime never overlaps another
        // instruction.
        let mut page = region::alloc(page_len, Protection::READ_WRITE_EXECUTE)
            .map_err(|e| TrampolineError::PageAllocationFailed(e.to_string()))?;

        unsafe {
            std::ptr::copy_nonoverlapping(routine.as_ptr(), page.as_mut_ptr::<u8>(), routine.len());
        }

        // x64 has a unified instruction/data cache, so no explicit flush
        // is required here (spec §4.5 step 4).
        let entry: extern "C" fn() -> u64 = unsafe { std::mem::transmute(page.as_ptr::<u8>()) };
        let result = entry();

        Ok(result)
    }
}

/// A [HostCaller] that performs no host call at all; used where the VM
/// is exercised without a native counterpart to call into (tests, and
/// any `call-c-func`-free program).
pub struct NullHostCaller;

impl HostCaller for NullHostCaller {
    fn call(&mut self, _fn_ptr: u64, _args: &[&[u8]], _ret_size: usize) -> Result<u64, TrampolineError> {
        Err(TrampolineError::PageAllocationFailed("no host function registered".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_argument_immediates_are_zero_extended() {
        assert_eq!(zero_extend(&[5]), 5);
        assert_eq!(zero_extend(&[0x06, 0x00]), 6);
    }

    #[test]
    fn routine_ends_with_call_then_ret() {
        let code = X64HostCaller::build_routine(0x1234, &[]);
        assert_eq!(&code[code.len() - 3..], &[0xFF, 0xD0, 0xC3]);
    }

    #[test]
    fn four_register_arguments_emit_no_stack_pushes() {
        let args: [&[u8]; 4] = [&[1], &[2], &[3], &[4]];
        let code = X64HostCaller::build_routine(0, &args);
        assert!(!code.contains(&0x50));
    }

    #[test]
    fn fifth_argument_is_pushed_onto_the_stack() {
        let args: [&[u8]; 5] = [&[1], &[2], &[3], &[4], &[5]];
        let code = X64HostCaller::build_routine(0, &args);
        assert!(code.contains(&0x50));
    }

    #[test]
    fn host_call_executes_and_returns_the_function_result() {
        extern "C" fn answer() -> u64 {
            42
        }
        let mut caller = X64HostCaller::new();
        let result = caller.call(answer as usize as u64, &[], 8).expect("call should succeed");
        assert_eq!(result, 42);
    }

    #[test]
    fn oversize_argument_is_rejected_before_codegen() {
        let mut caller = X64HostCaller::new();
        let oversize = [0u8; 9];
        let result = caller.call(0, &[&oversize], 8);
        assert!(matches!(result, Err(TrampolineError::OversizeArgument { index: 0, size: 9 })));
    }
}
