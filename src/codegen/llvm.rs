//! Calling-convention adapter for functions lifted into LLVM IR.

use inkwell::AddressSpace;
use inkwell::attributes::{Attribute, AttributeLoc};
use inkwell::builder::{Builder, BuilderError};
use inkwell::module::{Linkage, Module};
use inkwell::types::{BasicMetadataTypeEnum, BasicTypeEnum, FunctionType};
use inkwell::values::{BasicMetadataValueEnum, BasicValueEnum, FunctionValue, PointerValue};
use thiserror::Error;

use crate::codegen::callconv::{AdaptableFunction, CallConv, MarshalPlan, RegSlot};

#[derive(Debug, Error)]
pub enum AdaptError {
    #[error("failed to build wrapper IR")]
    Builder(#[from] BuilderError),
    #[error("function `{0}` has no state pointer parameter")]
    MissingStatePointer(String),
    #[error("call to `{0}` produced no register values")]
    MissingReturn(String),
    #[error("unsupported calling convention id {0}")]
    UnknownCallConv(u32),
}

/// A lifted function together with the module it lives in.
#[derive(Debug, Clone, Copy)]
pub struct LlvmFunction<'m, 'ctx> {
    module: &'m Module<'ctx>,
    value: FunctionValue<'ctx>,
}

impl<'m, 'ctx> LlvmFunction<'m, 'ctx> {
    pub fn new(module: &'m Module<'ctx>, value: FunctionValue<'ctx>) -> Self {
        Self { module, value }
    }

    pub fn value(&self) -> FunctionValue<'ctx> {
        self.value
    }

    fn signature(&self, plan: &MarshalPlan) -> FunctionType<'ctx> {
        let context = self.module.get_context();
        let i64_type = context.i64_type();
        let ptr_type = context.ptr_type(AddressSpace::default());

        let mut params: Vec<BasicMetadataTypeEnum<'ctx>> = Vec::with_capacity(plan.param_count());
        params.push(ptr_type.into());
        params.extend(plan.registers.iter().map(|_| BasicMetadataTypeEnum::from(i64_type)));

        if plan.return_count() == 0 {
            context.void_type().fn_type(&params, false)
        } else {
            let fields: Vec<BasicTypeEnum<'ctx>> =
                plan.registers.iter().map(|_| i64_type.into()).collect();
            context.struct_type(&fields, false).fn_type(&params, false)
        }
    }

    fn add_enum_attribute(&self, function: FunctionValue<'ctx>, name: &str) {
        let context = self.module.get_context();
        let kind = Attribute::get_named_enum_kind_id(name);
        function.add_attribute(AttributeLoc::Function, context.create_enum_attribute(kind, 0));
    }

    fn build_wrapper(
        &self,
        wrapper: FunctionValue<'ctx>,
        outer: &MarshalPlan,
        inner: &MarshalPlan,
    ) -> Result<(), AdaptError> {
        let context = self.module.get_context();
        let builder = context.create_builder();
        let i64_type = context.i64_type();
        let entry = context.append_basic_block(wrapper, "entry");
        builder.position_at_end(entry);

        let name = wrapper.get_name().to_string_lossy().into_owned();
        let state = wrapper
            .get_nth_param(0)
            .ok_or_else(|| AdaptError::MissingStatePointer(name.clone()))?
            .into_pointer_value();

        for (index, slot) in (1u32..).zip(outer.registers.iter()) {
            let value = wrapper
                .get_nth_param(index)
                .ok_or_else(|| AdaptError::MissingStatePointer(name.clone()))?;
            let ptr = reg_ptr(&builder, context.i8_type(), state, *slot)?;
            builder.build_store(ptr, value)?;
        }

        let mut args: Vec<BasicMetadataValueEnum<'ctx>> = Vec::with_capacity(inner.param_count());
        args.push(state.into());
        for slot in &inner.registers {
            let ptr = reg_ptr(&builder, context.i8_type(), state, *slot)?;
            args.push(builder.build_load(i64_type, ptr, slot.name)?.into());
        }
        let call = builder.build_call(self.value, &args, "")?;
        call.set_call_convention(inner.call_conv.llvm_id());

        if inner.return_count() > 0 {
            let result = call
                .try_as_basic_value()
                .left()
                .ok_or_else(|| AdaptError::MissingReturn(name.clone()))?
                .into_struct_value();
            for (index, slot) in (0u32..).zip(inner.registers.iter()) {
                let value = builder.build_extract_value(result, index, slot.name)?;
                let ptr = reg_ptr(&builder, context.i8_type(), state, *slot)?;
                builder.build_store(ptr, value)?;
            }
        }

        if outer.return_count() == 0 {
            builder.build_return(None)?;
        } else {
            let mut values: Vec<BasicValueEnum<'ctx>> = Vec::with_capacity(outer.return_count());
            for slot in &outer.registers {
                let ptr = reg_ptr(&builder, context.i8_type(), state, *slot)?;
                values.push(builder.build_load(i64_type, ptr, slot.name)?);
            }
            builder.build_aggregate_return(&values)?;
        }
        Ok(())
    }
}

fn reg_ptr<'ctx>(
    builder: &Builder<'ctx>,
    i8_type: inkwell::types::IntType<'ctx>,
    state: PointerValue<'ctx>,
    slot: RegSlot,
) -> Result<PointerValue<'ctx>, BuilderError> {
    let offset = i8_type
        .get_context()
        .i64_type()
        .const_int(u64::from(slot.offset), false);
    // SAFETY: register slots lie inside the register storage the state pointer refers to.
    unsafe { builder.build_in_bounds_gep(i8_type, state, &[offset], slot.name) }
}

fn call_conv_from_llvm(id: u32) -> Result<CallConv, AdaptError> {
    match id {
        0 => Ok(CallConv::Cdecl),
        81 => Ok(CallConv::Hhvm),
        other => Err(AdaptError::UnknownCallConv(other)),
    }
}

impl AdaptableFunction for LlvmFunction<'_, '_> {
    type Error = AdaptError;

    fn call_conv(&self) -> CallConv {
        call_conv_from_llvm(self.value.get_call_conventions()).unwrap_or_default()
    }

    fn wrap(self, outer: &MarshalPlan, inner: &MarshalPlan) -> Result<Self, Self::Error> {
        call_conv_from_llvm(self.value.get_call_conventions())?;

        let name = self.value.get_name().to_string_lossy().into_owned();
        self.value
            .as_global_value()
            .as_pointer_value()
            .set_name(&format!("{name}.inner"));
        self.value.set_linkage(Linkage::Internal);
        self.value.remove_enum_attribute(
            AttributeLoc::Function,
            Attribute::get_named_enum_kind_id("noinline"),
        );
        self.add_enum_attribute(self.value, "alwaysinline");

        let wrapper = self
            .module
            .add_function(&name, self.signature(outer), Some(Linkage::External));
        wrapper.set_call_conventions(outer.call_conv.llvm_id());
        self.add_enum_attribute(wrapper, "nounwind");
        self.build_wrapper(wrapper, outer, inner)?;

        Ok(Self::new(self.module, wrapper))
    }
}
