//! Architecture-specific context switching
//!
//! Each backend exposes the same surface:
//! - `Registers`: the callee-saved register save area
//! - `init_context`: prepare a fresh fiber so the first switch lands in
//!   the entry trampoline with the entry argument in place
//! - `context_switch`: save the callee-saved state of the caller and
//!   restore the target's, transferring control
//!
//! Only callee-saved registers are preserved; a switch is a function
//! call from the compiler's point of view, so everything else is dead.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{init_context, context_switch, Registers};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{init_context, context_switch, Registers};
    } else {
        compile_error!("unsupported architecture for fiber context switching");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_zeroed() {
        let regs = Registers::zeroed();
        // A zeroed save area must never be jumped into; init_context or a
        // save-side switch has to fill it first.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &regs as *const Registers as *const u8,
                std::mem::size_of::<Registers>(),
            )
        };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
