//! Saved execution context.
//!
//! There are no coroutines here: preemption works by swapping a trap frame
//! in place. The trap delivery layer saves the interrupted register file
//! into a frame, the scheduler exchanges it for the next thread's frame, and
//! the hardware restores whatever the frame holds when the trap returns.

/// The register image saved at trap entry and restored at trap exit.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

impl TrapFrame {
    pub const fn zero() -> TrapFrame {
        TrapFrame {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip: 0,
            rsp: 0,
            rflags: 0,
        }
    }
}

impl Default for TrapFrame {
    fn default() -> Self {
        TrapFrame::zero()
    }
}
