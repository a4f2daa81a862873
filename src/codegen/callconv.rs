//! Calling conventions between the dispatch trampoline and translated code.
//!
//! A freshly lifted function always has the C convention `void f(state*)`: guest registers live
//! in register storage. The fast convention instead passes the hottest guest registers in host
//! argument registers and returns them in host return registers, so the trampoline can keep them
//! in registers across chained blocks. [`change_call_conv`] bridges the two with a wrapper whose
//! marshalling is described by a [`MarshalPlan`].

use std::error::Error;

use crate::codegen::target::Arch;

/// Most integer arguments the HHVM convention passes in registers on x86-64.
pub const HHVM_MAX_ARGS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallConv {
    /// `void f(state*)`, registers in memory.
    #[default]
    Cdecl,
    /// Register-heavy convention (LLVM `hhvmcc`).
    Hhvm,
}

impl CallConv {
    /// LLVM calling convention id.
    pub const fn llvm_id(self) -> u32 {
        match self {
            Self::Cdecl => 0,
            Self::Hhvm => 81,
        }
    }

    /// Number announced to the client so its trampoline matches the server's code.
    pub const fn client_number(self) -> i32 {
        match self {
            Self::Cdecl => 0,
            Self::Hhvm => 1,
        }
    }

    pub const fn from_client_number(number: i32) -> Option<Self> {
        match number {
            0 => Some(Self::Cdecl),
            1 => Some(Self::Hhvm),
            _ => None,
        }
    }

    /// Only one fast convention exists per host; hosts without one use C.
    pub const fn fast_for(host: Arch, _guest: Arch) -> Self {
        match host {
            Arch::X86_64 => Self::Hhvm,
            Arch::Aarch64 | Arch::Riscv64 => Self::Cdecl,
        }
    }

    /// Maps a requested convention number, including the retired per-pair numbers 1 to 5, onto a
    /// convention available for this host/guest pair.
    pub const fn from_request(requested: i32, host: Arch, guest: Arch) -> Self {
        if requested >= 1 && requested < 6 {
            Self::fast_for(host, guest)
        } else {
            Self::Cdecl
        }
    }
}

/// A guest register at a fixed offset into register storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegSlot {
    pub name: &'static str,
    pub offset: u32,
}

const fn reg(name: &'static str, offset: u32) -> RegSlot {
    RegSlot { name, offset }
}

// Register storage layouts: program counter first, then the general-purpose registers.
const X86_64_FAST_REGS: &[RegSlot] = &[
    reg("rip", 0x00),
    reg("rax", 0x08),
    reg("rcx", 0x10),
    reg("rdx", 0x18),
    reg("rbx", 0x20),
    reg("rsp", 0x28),
    reg("rbp", 0x30),
    reg("rsi", 0x38),
    reg("rdi", 0x40),
    reg("r8", 0x48),
    reg("r9", 0x50),
    reg("r10", 0x58),
    reg("r11", 0x60),
    reg("r12", 0x68),
];

const RISCV64_FAST_REGS: &[RegSlot] = &[
    reg("pc", 0x00),
    reg("ra", 0x08),
    reg("sp", 0x10),
    reg("t0", 0x28),
    reg("s0", 0x40),
    reg("s1", 0x48),
    reg("a0", 0x50),
    reg("a1", 0x58),
    reg("a2", 0x60),
    reg("a3", 0x68),
    reg("a4", 0x70),
    reg("a5", 0x78),
    reg("a6", 0x80),
    reg("a7", 0x88),
];

const AARCH64_FAST_REGS: &[RegSlot] = &[
    reg("pc", 0x00),
    reg("x0", 0x08),
    reg("x1", 0x10),
    reg("x2", 0x18),
    reg("x3", 0x20),
    reg("x4", 0x28),
    reg("x5", 0x30),
    reg("x6", 0x38),
    reg("x7", 0x40),
    reg("x8", 0x48),
    reg("x16", 0x88),
    reg("x29", 0xf0),
    reg("x30", 0xf8),
    reg("sp", 0x100),
];

const _: () = {
    // The state pointer takes the first argument register.
    assert!(X86_64_FAST_REGS.len() < HHVM_MAX_ARGS);
    assert!(RISCV64_FAST_REGS.len() < HHVM_MAX_ARGS);
    assert!(AARCH64_FAST_REGS.len() < HHVM_MAX_ARGS);
};

/// How a function with convention `call_conv` exchanges guest registers.
///
/// Argument 0 is always the state pointer; argument `i + 1` and return field `i` carry
/// `registers[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarshalPlan {
    pub call_conv: CallConv,
    pub registers: Vec<RegSlot>,
}

impl MarshalPlan {
    pub fn new(call_conv: CallConv, guest: Arch) -> Self {
        let registers = match call_conv {
            CallConv::Cdecl => Vec::new(),
            CallConv::Hhvm => fast_registers(guest).to_vec(),
        };
        Self {
            call_conv,
            registers,
        }
    }

    pub fn cdecl() -> Self {
        Self {
            call_conv: CallConv::Cdecl,
            registers: Vec::new(),
        }
    }

    pub fn param_count(&self) -> usize {
        1 + self.registers.len()
    }

    pub fn return_count(&self) -> usize {
        self.registers.len()
    }
}

fn fast_registers(guest: Arch) -> &'static [RegSlot] {
    match guest {
        Arch::X86_64 => X86_64_FAST_REGS,
        Arch::Riscv64 => RISCV64_FAST_REGS,
        Arch::Aarch64 => AARCH64_FAST_REGS,
    }
}

/// A translated function whose convention can be changed by wrapping.
pub trait AdaptableFunction: Sized {
    type Error: Error + Send + Sync + 'static;

    fn call_conv(&self) -> CallConv;

    /// Builds a function exposing `outer` that stores its register arguments into register
    /// storage, calls `self` according to `inner`, and returns the registers `outer` names.
    fn wrap(self, outer: &MarshalPlan, inner: &MarshalPlan) -> Result<Self, Self::Error>;
}

/// Returns `function` unchanged if it already uses `call_conv`, otherwise a wrapper exposing it.
pub fn change_call_conv<F: AdaptableFunction>(
    function: F,
    call_conv: CallConv,
    guest: Arch,
) -> Result<F, F::Error> {
    let current = function.call_conv();
    if current == call_conv {
        return Ok(function);
    }
    let outer = MarshalPlan::new(call_conv, guest);
    let inner = MarshalPlan::new(current, guest);
    function.wrap(&outer, &inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_numbers_round_trip() {
        for cc in [CallConv::Cdecl, CallConv::Hhvm] {
            assert_eq!(CallConv::from_client_number(cc.client_number()), Some(cc));
        }
        assert_eq!(CallConv::from_client_number(7), None);
    }

    #[test]
    fn legacy_requests_map_to_the_host_fast_convention() {
        for requested in 1..6 {
            assert_eq!(
                CallConv::from_request(requested, Arch::X86_64, Arch::X86_64),
                CallConv::Hhvm
            );
            assert_eq!(
                CallConv::from_request(requested, Arch::Aarch64, Arch::X86_64),
                CallConv::Cdecl
            );
        }
        assert_eq!(
            CallConv::from_request(0, Arch::X86_64, Arch::X86_64),
            CallConv::Cdecl
        );
        assert_eq!(
            CallConv::from_request(6, Arch::X86_64, Arch::X86_64),
            CallConv::Cdecl
        );
    }

    #[test]
    fn cdecl_plan_only_passes_the_state_pointer() {
        let plan = MarshalPlan::new(CallConv::Cdecl, Arch::X86_64);
        assert_eq!(plan.param_count(), 1);
        assert_eq!(plan.return_count(), 0);
        assert_eq!(plan, MarshalPlan::cdecl());
    }

    #[test]
    fn fast_plans_fit_the_argument_registers() {
        for guest in [Arch::X86_64, Arch::Aarch64, Arch::Riscv64] {
            let plan = MarshalPlan::new(CallConv::Hhvm, guest);
            assert!(plan.param_count() <= HHVM_MAX_ARGS, "{guest}");
            assert_eq!(plan.registers[0].offset, 0, "{guest} passes its pc first");

            let mut offsets: Vec<u32> = plan.registers.iter().map(|slot| slot.offset).collect();
            offsets.sort_unstable();
            offsets.dedup();
            assert_eq!(offsets.len(), plan.registers.len(), "{guest} has duplicate slots");
            assert!(offsets.iter().all(|offset| offset % 8 == 0));
        }
    }
}
