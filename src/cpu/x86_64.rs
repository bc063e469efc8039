//! 64-bit toolstack register file.

use super::{hvm_trap_table, CpuContext, TrapInfo, NR_TRAPS, VGCF_HVM_GUEST};

/// General purpose and segment registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserRegs64 {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X86_64Context {
    pub fpu_ctxt: [u8; 512],
    pub flags: u64,
    pub user_regs: UserRegs64,
    pub trap_ctxt: [TrapInfo; NR_TRAPS],
    pub ldt_base: u64,
    pub ldt_ents: u64,
    pub gdt_frames: [u64; 16],
    pub gdt_ents: u64,
    pub kernel_ss: u64,
    pub kernel_sp: u64,
    pub ctrlreg: [u64; 8],
    pub debugreg: [u64; 8],
    pub event_callback_eip: u64,
    pub failsafe_callback_eip: u64,
    pub syscall_callback_eip: u64,
    pub vm_assist: u64,
}

impl CpuContext for X86_64Context {
    const ARCH: &'static str = "x86_64";
    const FLAT_KERNEL_CS: u16 = 0xE033;

    fn new_hvm(entry: u64) -> Self {
        Self {
            fpu_ctxt: [0; 512],
            flags: u64::from(VGCF_HVM_GUEST),
            user_regs: UserRegs64 {
                rip: entry,
                ..Default::default()
            },
            trap_ctxt: hvm_trap_table(Self::FLAT_KERNEL_CS),
            ldt_base: 0,
            ldt_ents: 0,
            gdt_frames: [0; 16],
            gdt_ents: 0,
            kernel_ss: 0,
            kernel_sp: 0,
            ctrlreg: [0; 8],
            debugreg: [0; 8],
            event_callback_eip: 0,
            failsafe_callback_eip: 0,
            syscall_callback_eip: 0,
            vm_assist: 0,
        }
    }

    fn entry(&self) -> u64 {
        self.user_regs.rip
    }

    fn flags(&self) -> u32 {
        self.flags as u32
    }
}
