//! x86_64 context switching
//!
//! Inline naked assembly, stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved register save area (System V AMD64)
///
/// Field order is fixed: the assembly below addresses this struct by
/// byte offset.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Registers {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Registers {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Initialize a fresh fiber context
///
/// The first switch into `regs` begins execution in the entry
/// trampoline, which calls `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `regs` must point to writable `Registers` memory and `stack_top` must
/// be the top of a mapped stack.
#[inline]
pub unsafe fn init_context(
    regs: *mut Registers,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // 16-byte aligned per the SysV ABI; the trampoline's `call` then
    // leaves the entry function with the alignment it expects.
    let sp = stack_top as usize;
    let aligned_sp = sp & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = fiber_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First instruction stream of every fiber: fetch the entry argument and
/// call the entry function. The entry function performs the terminating
/// switch itself and never returns.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Swap contexts: save callee-saved state into `old_regs`, restore from
/// `new_regs` and jump.
///
/// Returns (to the caller's frame) only when something later switches
/// back into `old_regs`.
///
/// # Safety
///
/// `old_regs` must be writable; `new_regs` must hold a context produced
/// by `init_context` or a previous save. Switching into a freed or
/// zeroed context is fatal.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old_regs: *mut Registers, _new_regs: *const Registers) {
    naked_asm!(
        // Save callee-saved registers into old_regs (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load the target context from new_regs (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
