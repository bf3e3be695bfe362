mod diff;

pub use diff::GeneralRegistersDiff;

/// General-purpose registers, in the order the save macros push them.
///
/// The `rsp` slot is a placeholder: the guest stack pointer lives in the VMCS
/// (and in [`GuestContext::rsp`]).
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

macro_rules! define_legacy_accessors {
    ($($reg: ident => $e: ident, $x: ident, $l: ident, $h: ident;)*) => {
        paste::paste! {
            $(
                #[doc = "Returns the low 32 bits of `" $reg "`."]
                pub fn $e(&self) -> u32 {
                    self.$reg as u32
                }

                #[doc = "Writes `" $e "`, zero-extending into `" $reg "` like a 32-bit `mov`."]
                pub fn [<set_ $e>](&mut self, value: u32) {
                    self.$reg = value as u64;
                }

                #[doc = "Returns the low 16 bits of `" $reg "`."]
                pub fn $x(&self) -> u16 {
                    self.$reg as u16
                }

                #[doc = "Writes the low 16 bits of `" $reg "`, preserving the rest."]
                pub fn [<set_ $x>](&mut self, value: u16) {
                    self.$reg = (self.$reg & !0xffff) | value as u64;
                }

                #[doc = "Returns the low 8 bits of `" $reg "`."]
                pub fn $l(&self) -> u8 {
                    self.$reg as u8
                }

                #[doc = "Writes the low 8 bits of `" $reg "`, preserving the rest."]
                pub fn [<set_ $l>](&mut self, value: u8) {
                    self.$reg = (self.$reg & !0xff) | value as u64;
                }

                #[doc = "Returns bits 15:8 of `" $reg "`."]
                pub fn $h(&self) -> u8 {
                    (self.$reg >> 8) as u8
                }

                #[doc = "Writes bits 15:8 of `" $reg "`, preserving the rest."]
                pub fn [<set_ $h>](&mut self, value: u8) {
                    self.$reg = (self.$reg & !0xff00) | ((value as u64) << 8);
                }
            )*
        }
    };
}

macro_rules! define_extended_accessors {
    ($($reg: ident),*) => {
        paste::paste! {
            $(
                #[doc = "Returns the low 32 bits of `" $reg "`."]
                pub fn [<$reg d>](&self) -> u32 {
                    self.$reg as u32
                }

                #[doc = "Writes the low 32 bits of `" $reg "`, zero-extending."]
                pub fn [<set_ $reg d>](&mut self, value: u32) {
                    self.$reg = value as u64;
                }

                #[doc = "Returns the low 16 bits of `" $reg "`."]
                pub fn [<$reg w>](&self) -> u16 {
                    self.$reg as u16
                }

                #[doc = "Returns the low 8 bits of `" $reg "`."]
                pub fn [<$reg b>](&self) -> u8 {
                    self.$reg as u8
                }
            )*
        }
    };
}

impl GeneralRegisters {
    /// Register names, indexed by the encoding used in instruction operands
    /// and exit qualifications.
    pub const REGISTER_NAMES: [&'static str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    /// Returns the name of the register with the given encoding.
    pub fn register_name(index: u8) -> &'static str {
        Self::REGISTER_NAMES[index as usize]
    }

    /// Reads a register by its encoding.
    ///
    /// # Panics
    ///
    /// Panics on `rsp` (index 4) and on indices above 15.
    pub fn get_reg_of_index(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => panic!("Illegal index of GeneralRegisters: {}", index),
        }
    }

    /// Writes a register by its encoding.
    ///
    /// # Panics
    ///
    /// Panics on `rsp` (index 4) and on indices above 15.
    pub fn set_reg_of_index(&mut self, index: u8, value: u64) {
        match index {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            15 => self.r15 = value,
            _ => panic!("Illegal index of GeneralRegisters: {}", index),
        }
    }

    /// `EDX:EAX` as one 64-bit value, the operand of `WRMSR` and `XSETBV`.
    pub fn get_edx_eax(&self) -> u64 {
        (self.edx() as u64) << 32 | self.eax() as u64
    }

    /// Splits `value` into `EDX:EAX`, zero-extending both halves.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.set_eax(value as u32);
        self.set_edx((value >> 32) as u32);
    }

    define_legacy_accessors! {
        rax => eax, ax, al, ah;
        rcx => ecx, cx, cl, ch;
        rdx => edx, dx, dl, dh;
        rbx => ebx, bx, bl, bh;
    }

    define_extended_accessors!(r8, r9, r10, r11, r12, r13, r14, r15);
}

/// Guest state captured by the VM-exit landing point on the host stack.
///
/// The trailing five fields form an `iretq` frame: when a session ends, the
/// landing point returns to the guest's `rip`/`rsp` through it, in root
/// operation.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestContext {
    /// General-purpose registers.
    pub regs: GeneralRegisters,
    /// Guest `RIP`, loaded from and stored back to the VMCS by the exit handler.
    pub rip: u64,
    /// Code selector for the terminating `iretq`.
    pub cs: u64,
    /// Guest `RFLAGS`.
    pub rflags: u64,
    /// Guest `RSP`.
    pub rsp: u64,
    /// Stack selector for the terminating `iretq`.
    pub ss: u64,
}

impl GuestContext {
    /// Size of the `iretq` frame at the end of the structure.
    pub const IRET_FRAME_SIZE: usize = 5 * core::mem::size_of::<u64>();
}

macro_rules! save_regs_to_stack {
    () => {
        "
        push r15
        push r14
        push r13
        push r12
        push r11
        push r10
        push r9
        push r8
        push rdi
        push rsi
        push rbp
        sub rsp, 8
        push rbx
        push rdx
        push rcx
        push rax"
    };
}

macro_rules! restore_regs_from_stack {
    () => {
        "
        pop rax
        pop rcx
        pop rdx
        pop rbx
        add rsp, 8
        pop rbp
        pop rsi
        pop rdi
        pop r8
        pop r9
        pop r10
        pop r11
        pop r12
        pop r13
        pop r14
        pop r15"
    };
}
