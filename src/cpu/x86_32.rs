//! 32-bit toolstack register file.

use super::{hvm_trap_table, CpuContext, TrapInfo, NR_TRAPS, VGCF_HVM_GUEST};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserRegs32 {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X86_32Context {
    pub fpu_ctxt: [u8; 512],
    pub flags: u32,
    pub user_regs: UserRegs32,
    pub trap_ctxt: [TrapInfo; NR_TRAPS],
    pub ldt_base: u32,
    pub ldt_ents: u32,
    pub gdt_frames: [u32; 16],
    pub gdt_ents: u32,
    pub kernel_ss: u32,
    pub kernel_sp: u32,
    pub ctrlreg: [u32; 8],
    pub debugreg: [u32; 8],
    pub event_callback_cs: u32,
    pub event_callback_eip: u32,
    pub failsafe_callback_cs: u32,
    pub failsafe_callback_eip: u32,
    pub vm_assist: u32,
}

impl CpuContext for X86_32Context {
    const ARCH: &'static str = "x86_32";
    const FLAT_KERNEL_CS: u16 = 0xE019;

    fn new_hvm(entry: u64) -> Self {
        Self {
            fpu_ctxt: [0; 512],
            flags: VGCF_HVM_GUEST,
            user_regs: UserRegs32 {
                // The loader entry always lies below 4 GiB.
                eip: entry as u32,
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
            // Callbacks carry a selector on 32-bit, but no handler.
            event_callback_cs: u32::from(Self::FLAT_KERNEL_CS),
            event_callback_eip: 0,
            failsafe_callback_cs: u32::from(Self::FLAT_KERNEL_CS),
            failsafe_callback_eip: 0,
            vm_assist: 0,
        }
    }

    fn entry(&self) -> u64 {
        u64::from(self.user_regs.eip)
    }

    fn flags(&self) -> u32 {
        self.flags
    }
}
