//! Backend-neutral representation of a translated function.
//!
//! Backends that do not go through LLVM (and the tests) describe lifted code as a closure over
//! register storage. Wrappers produced by the calling-convention adapter are explicit thunks, so
//! [`TranslatedFunction::invoke`] can execute either form and observe the marshalling.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use crate::codegen::callconv::{AdaptableFunction, CallConv, MarshalPlan, RegSlot};

/// Lifted guest code operating on register storage.
pub type LiftedBody = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FnAttribute {
    AlwaysInline,
    NoInline,
    NoUnwind,
}

#[derive(Clone)]
enum Body {
    Lifted(LiftedBody),
    Thunk {
        outer: MarshalPlan,
        inner: MarshalPlan,
        callee: Box<TranslatedFunction>,
    },
}

#[derive(Clone)]
pub struct TranslatedFunction {
    name: String,
    guest_addr: u64,
    call_conv: CallConv,
    attributes: BTreeSet<FnAttribute>,
    body: Body,
}

impl TranslatedFunction {
    /// A freshly lifted function, always `void f(state*)`.
    pub fn lifted(name: impl Into<String>, guest_addr: u64, body: LiftedBody) -> Self {
        Self {
            name: name.into(),
            guest_addr,
            call_conv: CallConv::Cdecl,
            attributes: BTreeSet::new(),
            body: Body::Lifted(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guest_addr(&self) -> u64 {
        self.guest_addr
    }

    pub fn attributes(&self) -> &BTreeSet<FnAttribute> {
        &self.attributes
    }

    pub fn has_attribute(&self, attribute: FnAttribute) -> bool {
        self.attributes.contains(&attribute)
    }

    pub fn add_attribute(&mut self, attribute: FnAttribute) {
        self.attributes.insert(attribute);
    }

    /// The wrapped function, if this is an adapter thunk.
    pub fn callee(&self) -> Option<&TranslatedFunction> {
        match &self.body {
            Body::Lifted(_) => None,
            Body::Thunk { callee, .. } => Some(callee),
        }
    }

    /// Marshalling this function expects from its caller.
    pub fn plan(&self) -> MarshalPlan {
        match &self.body {
            Body::Lifted(_) => MarshalPlan::cdecl(),
            Body::Thunk { outer, .. } => outer.clone(),
        }
    }

    pub fn param_count(&self) -> usize {
        self.plan().param_count()
    }

    pub fn return_count(&self) -> usize {
        self.plan().return_count()
    }

    /// Executes the function the way the trampoline would call it.
    ///
    /// `args[0]` stands for the state pointer and is ignored; the remaining arguments must match
    /// [`plan`](Self::plan).
    pub fn invoke(&self, regs: &mut [u8], args: &[u64]) -> Vec<u64> {
        match &self.body {
            Body::Lifted(body) => {
                body(regs);
                Vec::new()
            }
            Body::Thunk {
                outer,
                inner,
                callee,
            } => {
                for (slot, value) in outer.registers.iter().zip(args.iter().skip(1)) {
                    store(regs, *slot, *value);
                }

                let mut inner_args = Vec::with_capacity(inner.param_count());
                inner_args.push(0);
                inner_args.extend(inner.registers.iter().map(|slot| load(regs, *slot)));
                let results = callee.invoke(regs, &inner_args);
                for (slot, value) in inner.registers.iter().zip(results) {
                    store(regs, *slot, value);
                }

                outer.registers.iter().map(|slot| load(regs, *slot)).collect()
            }
        }
    }
}

fn load(regs: &[u8], slot: RegSlot) -> u64 {
    let offset = slot.offset as usize;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&regs[offset..offset + 8]);
    u64::from_ne_bytes(bytes)
}

fn store(regs: &mut [u8], slot: RegSlot, value: u64) {
    let offset = slot.offset as usize;
    regs[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}

impl AdaptableFunction for TranslatedFunction {
    type Error = Infallible;

    fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    fn wrap(mut self, outer: &MarshalPlan, inner: &MarshalPlan) -> Result<Self, Self::Error> {
        let name = std::mem::take(&mut self.name);
        self.name = format!("{name}.inner");
        self.attributes.remove(&FnAttribute::NoInline);
        self.attributes.insert(FnAttribute::AlwaysInline);

        Ok(Self {
            name,
            guest_addr: self.guest_addr,
            call_conv: outer.call_conv,
            attributes: BTreeSet::from([FnAttribute::NoUnwind]),
            body: Body::Thunk {
                outer: outer.clone(),
                inner: inner.clone(),
                callee: Box::new(self),
            },
        })
    }
}

impl fmt::Debug for TranslatedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslatedFunction")
            .field("name", &self.name)
            .field("guest_addr", &format_args!("{:#x}", self.guest_addr))
            .field("call_conv", &self.call_conv)
            .field("attributes", &self.attributes)
            .field("callee", &self.callee())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::callconv::change_call_conv;
    use crate::codegen::target::Arch;

    // rax += rcx; rip += 3
    fn add_rax_rcx() -> TranslatedFunction {
        TranslatedFunction::lifted(
            "S0",
            0x40_1000,
            Arc::new(|regs: &mut [u8]| {
                let rax = load(regs, RegSlot { name: "rax", offset: 0x08 });
                let rcx = load(regs, RegSlot { name: "rcx", offset: 0x10 });
                store(regs, RegSlot { name: "rax", offset: 0x08 }, rax.wrapping_add(rcx));
                let rip = load(regs, RegSlot { name: "rip", offset: 0x00 });
                store(regs, RegSlot { name: "rip", offset: 0x00 }, rip + 3);
            }),
        )
    }

    #[test]
    fn conforming_function_is_returned_unchanged() {
        let function = change_call_conv(add_rax_rcx(), CallConv::Cdecl, Arch::X86_64)
            .expect("infallible");
        assert!(function.callee().is_none());
        assert_eq!(function.name(), "S0");
        assert_eq!(function.param_count(), 1);
    }

    #[test]
    fn fast_wrapper_exposes_register_signature() {
        let wrapper =
            change_call_conv(add_rax_rcx(), CallConv::Hhvm, Arch::X86_64).expect("infallible");
        assert_eq!(wrapper.call_conv(), CallConv::Hhvm);
        assert_eq!(wrapper.name(), "S0");
        assert!(wrapper.has_attribute(FnAttribute::NoUnwind));
        assert_eq!(wrapper.param_count(), 15);
        assert_eq!(wrapper.return_count(), 14);

        let callee = wrapper.callee().expect("wrapper has a callee");
        assert_eq!(callee.name(), "S0.inner");
        assert_eq!(callee.call_conv(), CallConv::Cdecl);
        assert!(callee.has_attribute(FnAttribute::AlwaysInline));
    }

    #[test]
    fn fast_wrapper_preserves_semantics() {
        let original = add_rax_rcx();
        let wrapper = change_call_conv(original.clone(), CallConv::Hhvm, Arch::X86_64)
            .expect("infallible");

        // Reference: registers in memory.
        let mut expected = vec![0u8; 0x400];
        store(&mut expected, RegSlot { name: "rip", offset: 0 }, 0x40_1000);
        store(&mut expected, RegSlot { name: "rax", offset: 8 }, 40);
        store(&mut expected, RegSlot { name: "rcx", offset: 16 }, 2);
        original.invoke(&mut expected, &[0]);

        // Fast convention: registers in arguments, memory holds stale values.
        let mut regs = vec![0u8; 0x400];
        let mut args = vec![0u64; wrapper.param_count()];
        args[1] = 0x40_1000;
        args[2] = 40;
        args[3] = 2;
        let results = wrapper.invoke(&mut regs, &args);

        assert_eq!(results.len(), 14);
        assert_eq!(results[0], 0x40_1003);
        assert_eq!(results[1], 42);
        assert_eq!(results[2], 2);
        assert_eq!(&regs[..0x18], &expected[..0x18]);
    }

    #[test]
    fn wrapping_back_to_cdecl_reloads_from_memory() {
        let fast = change_call_conv(add_rax_rcx(), CallConv::Hhvm, Arch::X86_64)
            .expect("infallible");
        let slow = change_call_conv(fast, CallConv::Cdecl, Arch::X86_64).expect("infallible");
        assert_eq!(slow.call_conv(), CallConv::Cdecl);

        let mut regs = vec![0u8; 0x400];
        store(&mut regs, RegSlot { name: "rax", offset: 8 }, 1);
        store(&mut regs, RegSlot { name: "rcx", offset: 16 }, 1);
        assert!(slow.invoke(&mut regs, &[0]).is_empty());
        assert_eq!(load(&regs, RegSlot { name: "rax", offset: 8 }), 2);
        assert_eq!(load(&regs, RegSlot { name: "rip", offset: 0 }), 3);
    }
}
