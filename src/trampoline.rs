//! Trampoline synthesis - AArch64 stubs for the Swift calling convention
//!
//! A trampoline only injects the implicit registers a generic native call
//! cannot set up: the context pointer (x20), a cleared error slot (x21),
//! and the hidden indirect-result address (x8). Explicit arguments fall
//! through untouched, so the stub is a handful of instructions regardless
//! of the argument list.

use core::ffi::c_void;

use crate::abi::NativeReturn;
use crate::arena::ExecArena;
use crate::call::BindError;
use crate::logging;

/// Context register of the target convention
pub const CONTEXT_REGISTER: u8 = 20;

/// Error-indicator register of the target convention
pub const ERROR_REGISTER: u8 = 21;

/// Hidden indirect-result register of the target convention
pub const INDIRECT_RESULT_REGISTER: u8 = 8;

/// Intra-procedure-call scratch register used for the final branch
const SCRATCH_REGISTER: u8 = 16;

/// An immutable, address-stable stub installed in the arena
///
/// Bound at creation to one (target, context, throws, indirect-result)
/// tuple; emitted exactly once and never re-patched.
#[derive(Debug)]
pub struct Trampoline {
    entry: *const u8,
    len: usize,
}

impl Trampoline {
    /// Entry address suitable for a native branch-and-link
    #[inline]
    pub fn entry(&self) -> usize {
        self.entry as usize
    }

    /// Emitted code size in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// The stub is immutable once installed; sharing the address is sound.
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

/// Synthesize a trampoline for `target` into `arena`
///
/// An indirect-result address may only accompany a shim whose declared
/// native return is a single pointer word; any other combination is a
/// bind-time contract violation, rejected before any memory is allocated.
pub fn synthesize(
    arena: &mut ExecArena,
    target: usize,
    context: Option<*const c_void>,
    indirect_result: Option<*mut u8>,
    throws: bool,
    native_return: NativeReturn,
) -> Result<Trampoline, BindError> {
    if indirect_result.is_some() && native_return != NativeReturn::Pointer {
        return Err(BindError::IndirectResultRequiresPointer);
    }

    let code = emit_stub(
        target as u64,
        context.map(|p| p as u64),
        indirect_result.map(|p| p as u64),
        throws,
    );
    let entry = arena.install(&code)?;

    logging::log_trampoline_synthesized(target, entry as usize, code.len(), throws);
    Ok(Trampoline {
        entry,
        len: code.len(),
    })
}

/// Emit the full stub into a growable buffer, without installing it
///
/// Emitting first and allocating the exact size afterwards means no
/// heuristic upper bound is needed.
pub fn emit_stub(
    target: u64,
    context: Option<u64>,
    indirect_result: Option<u64>,
    throws: bool,
) -> Vec<u8> {
    let mut code = Vec::with_capacity(64);

    if let Some(context) = context {
        emit_mov_imm64(&mut code, CONTEXT_REGISTER, context);
    }
    if throws {
        // Clear any stale error left in x21 by a prior call on this
        // hardware thread. Gated on `throws`: callees that reuse the
        // register for another purpose must not see it zeroed.
        emit_mov_imm64(&mut code, ERROR_REGISTER, 0);
    }
    if let Some(buffer) = indirect_result {
        emit_mov_imm64(&mut code, INDIRECT_RESULT_REGISTER, buffer);
    }
    emit_mov_imm64(&mut code, SCRATCH_REGISTER, target);
    emit_br(&mut code, SCRATCH_REGISTER);

    code
}

fn emit_u32(code: &mut Vec<u8>, insn: u32) {
    code.extend_from_slice(&insn.to_le_bytes());
}

/// Materialize a 64-bit constant: `movz` on the first non-zero half-word,
/// `movk` on the rest
pub(crate) fn emit_mov_imm64(code: &mut Vec<u8>, dst: u8, value: u64) {
    let parts = [
        (value & 0xFFFF) as u32,
        ((value >> 16) & 0xFFFF) as u32,
        ((value >> 32) & 0xFFFF) as u32,
        ((value >> 48) & 0xFFFF) as u32,
    ];

    let first = parts.iter().position(|part| *part != 0);
    let Some(first) = first else {
        emit_u32(code, 0xD280_0000 | dst as u32);
        return;
    };

    emit_u32(
        code,
        0xD280_0000 | ((first as u32) << 21) | (parts[first] << 5) | dst as u32,
    );
    for (hw, part) in parts.iter().enumerate().skip(first + 1) {
        if *part != 0 {
            emit_u32(
                code,
                0xF280_0000 | ((hw as u32) << 21) | (part << 5) | dst as u32,
            );
        }
    }
}

/// Unconditional register branch
pub(crate) fn emit_br(code: &mut Vec<u8>, rn: u8) {
    emit_u32(code, 0xD61F_0000 | ((rn as u32) << 5));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::NativeReturn;
    use crate::arena::ExecArena;

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_mov_imm64_zero_is_single_movz() {
        let mut code = Vec::new();
        emit_mov_imm64(&mut code, 21, 0);
        assert_eq!(words(&code), vec![0xD280_0000 | 21]);
    }

    #[test]
    fn test_mov_imm64_small_constant() {
        let mut code = Vec::new();
        emit_mov_imm64(&mut code, 0, 0x1234);
        assert_eq!(words(&code), vec![0xD280_0000 | (0x1234 << 5)]);
    }

    #[test]
    fn test_mov_imm64_skips_zero_halves() {
        let mut code = Vec::new();
        emit_mov_imm64(&mut code, 16, 0x0001_0000_0000_BEEF);
        assert_eq!(
            words(&code),
            vec![
                // movz x16, #0xBEEF
                0xD280_0000 | (0xBEEF << 5) | 16,
                // movk x16, #0x1, lsl #48
                0xF280_0000 | (3 << 21) | (0x1 << 5) | 16,
            ]
        );
    }

    #[test]
    fn test_br_encoding() {
        let mut code = Vec::new();
        emit_br(&mut code, 16);
        assert_eq!(words(&code), vec![0xD61F_0200]);
    }

    #[test]
    fn test_minimal_stub_is_load_and_branch() {
        let code = emit_stub(0x4000, None, None, false);
        assert_eq!(
            words(&code),
            vec![
                // movz x16, #0x4000
                0xD280_0000 | (0x4000 << 5) | 16,
                0xD61F_0200,
            ]
        );
    }

    #[test]
    fn test_throwing_stub_zeroes_error_register_before_branch() {
        let code = emit_stub(0x4000, None, None, true);
        let insns = words(&code);
        // movz x21, #0 first, branch last
        assert_eq!(insns[0], 0xD280_0000 | 21);
        assert_eq!(*insns.last().unwrap(), 0xD61F_0200);
    }

    #[test]
    fn test_full_stub_register_order() {
        let context = 0x1111_0000_2222_0001u64;
        let buffer = 0x0000_7777_0000_0004u64;
        let code = emit_stub(0x9000, Some(context), Some(buffer), true);
        let insns = words(&code);

        // Context first (movz writes x20), then the error clear, then the
        // indirect-result address (x8), then the branch sequence.
        assert_eq!(insns[0] & 0x1F, 20);
        assert_eq!(insns[0] & 0xFF80_0000, 0xD280_0000);

        let error_clear = 0xD280_0000 | 21;
        let pos_error = insns.iter().position(|i| *i == error_clear).unwrap();
        let pos_x8 = insns
            .iter()
            .position(|i| (*i & 0x1F) == 8 && (*i & 0xFF80_0000) == 0xD280_0000)
            .unwrap();
        assert!(pos_error < pos_x8);
        assert_eq!(*insns.last().unwrap(), 0xD61F_0200);
    }

    #[test]
    fn test_synthesize_rejects_indirect_without_pointer_return() {
        let mut arena = ExecArena::new();
        let mut buffer = [0u8; 16];
        let err = synthesize(
            &mut arena,
            0x4000,
            None,
            Some(buffer.as_mut_ptr()),
            false,
            NativeReturn::Words(1),
        )
        .unwrap_err();
        assert!(matches!(err, BindError::IndirectResultRequiresPointer));
        // Rejected before any memory was allocated.
        assert_eq!(arena.page_count(), 0);
    }

    #[test]
    fn test_synthesize_installs_exact_bytes() {
        let mut arena = ExecArena::new();
        let trampoline =
            synthesize(&mut arena, 0xABCD_EF01_2345, None, None, true, NativeReturn::Words(1))
                .unwrap();
        let expected = emit_stub(0xABCD_EF01_2345, None, None, true);
        assert_eq!(trampoline.len(), expected.len());
        let installed =
            unsafe { core::slice::from_raw_parts(trampoline.entry() as *const u8, trampoline.len()) };
        assert_eq!(installed, expected.as_slice());
    }

    #[test]
    fn test_trampolines_are_address_stable_and_disjoint() {
        let mut arena = ExecArena::new();
        let a = synthesize(&mut arena, 0x1000, None, None, false, NativeReturn::Words(1)).unwrap();
        let b = synthesize(&mut arena, 0x2000, None, None, false, NativeReturn::Words(1)).unwrap();
        assert_ne!(a.entry(), b.entry());
        assert!(a.entry() + a.len() <= b.entry() || b.entry() + b.len() <= a.entry());
    }
}
