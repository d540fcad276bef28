use std::collections::HashSet;

use inkwell::{
    basic_block::BasicBlock,
    builder::{Builder, BuilderError},
    context::Context,
    execution_engine::JitFunction,
    module::Module,
    targets::{InitializationConfig, Target},
    types::BasicMetadataTypeEnum,
    values::{
        BasicMetadataValueEnum, BasicValueEnum, FloatValue, FunctionValue, InstructionOpcode,
        InstructionValue, IntValue,
    },
    FloatPredicate, OptimizationLevel,
};

use crate::codegen::Backend;
use crate::error::{BackendError, ExecutionError};
use crate::ir;

type EntryFunc = unsafe extern "C" fn() -> f64;

const ANONYMOUS_NAME: &str = "__anon_expr";

impl From<BuilderError> for BackendError {
    fn from(err: BuilderError) -> Self {
        BackendError::Builder(err.to_string())
    }
}

/// Lowers into an LLVM module through inkwell.
pub struct LlvmBackend<'ctx> {
    pub context: &'ctx Context,
    pub module: Module<'ctx>,
    pub builder: Builder<'ctx>,
}

impl<'ctx> LlvmBackend<'ctx> {
    pub fn new(context: &'ctx Context, name: &str) -> Self {
        let module = context.create_module(name);
        let builder = context.create_builder();

        LlvmBackend {
            context,
            module,
            builder,
        }
    }

    fn callee(&self, call: InstructionValue<'ctx>) -> Option<FunctionValue<'ctx>> {
        // the callee is the last operand of a call
        let last = call.get_num_operands().checked_sub(1)?;
        match call.get_operand(last)?.left()? {
            BasicValueEnum::PointerValue(ptr) => {
                let name = ptr.get_name().to_str().ok()?;
                self.module.get_function(name)
            }
            _ => None,
        }
    }

    /// Names of every function `entry` reaches through calls. Each extern
    /// reached must bind to a builtin, since the jit cannot survive an
    /// unresolved symbol.
    fn reachable(&self, entry: FunctionValue<'ctx>) -> Result<HashSet<String>, ExecutionError> {
        let mut seen = HashSet::new();
        let mut pending = vec![entry];

        while let Some(function) = pending.pop() {
            let name = self.function_name(function);
            if !seen.insert(name.clone()) {
                continue;
            }

            if self.is_declaration(function) {
                let arity = function.count_params() as usize;
                if !ir::is_builtin(&name, arity) {
                    return Err(ExecutionError::UnresolvedExtern(name, arity));
                }
                continue;
            }

            for block in function.get_basic_blocks() {
                let mut inst = block.get_first_instruction();
                while let Some(current) = inst {
                    if current.get_opcode() == InstructionOpcode::Call {
                        pending.extend(self.callee(current));
                    }
                    inst = current.get_next_instruction();
                }
            }
        }

        Ok(seen)
    }
}

fn strip_body(function: FunctionValue<'_>) -> Result<(), BackendError> {
    for block in function.get_basic_blocks() {
        // blocks only reference values inside the function being stripped
        unsafe { block.delete() }.map_err(|()| {
            BackendError::Builder(format!(
                "failed to delete a block of {}",
                function.get_name().to_string_lossy()
            ))
        })?;
    }
    Ok(())
}

impl<'ctx> Backend for LlvmBackend<'ctx> {
    type Value = FloatValue<'ctx>;
    type Flag = IntValue<'ctx>;
    type Block = BasicBlock<'ctx>;
    type Function = FunctionValue<'ctx>;

    fn const_float(&mut self, value: f64) -> FloatValue<'ctx> {
        self.context.f64_type().const_float(value)
    }

    fn get_function(&self, name: &str) -> Option<FunctionValue<'ctx>> {
        if name.is_empty() {
            return None;
        }
        self.module.get_function(name)
    }

    fn declare_function(&mut self, name: &str, params: &[String]) -> FunctionValue<'ctx> {
        let f64_type = self.context.f64_type();
        let args_types: Vec<BasicMetadataTypeEnum> = vec![f64_type.into(); params.len()];
        let fn_type = f64_type.fn_type(&args_types, false);

        // LLVM uniquifies repeated anonymous names as __anon_expr.1, .2, ...
        let name = if name.is_empty() { ANONYMOUS_NAME } else { name };
        let fn_val = self.module.add_function(name, fn_type, None);

        for (arg, param) in fn_val.get_param_iter().zip(params) {
            arg.into_float_value().set_name(param);
        }

        fn_val
    }

    fn params(&self, function: FunctionValue<'ctx>) -> Vec<FloatValue<'ctx>> {
        function
            .get_param_iter()
            .map(|arg| arg.into_float_value())
            .collect()
    }

    fn is_declaration(&self, function: FunctionValue<'ctx>) -> bool {
        function.count_basic_blocks() == 0
    }

    fn function_name(&self, function: FunctionValue<'ctx>) -> String {
        function.get_name().to_string_lossy().into_owned()
    }

    fn append_basic_block(
        &mut self,
        function: FunctionValue<'ctx>,
        name: &str,
    ) -> Result<BasicBlock<'ctx>, BackendError> {
        Ok(self.context.append_basic_block(function, name))
    }

    fn position_at_end(&mut self, block: BasicBlock<'ctx>) {
        self.builder.position_at_end(block);
    }

    fn build_float_add(
        &mut self,
        lhs: FloatValue<'ctx>,
        rhs: FloatValue<'ctx>,
        name: &str,
    ) -> Result<FloatValue<'ctx>, BackendError> {
        Ok(self.builder.build_float_add(lhs, rhs, name)?)
    }

    fn build_float_sub(
        &mut self,
        lhs: FloatValue<'ctx>,
        rhs: FloatValue<'ctx>,
        name: &str,
    ) -> Result<FloatValue<'ctx>, BackendError> {
        Ok(self.builder.build_float_sub(lhs, rhs, name)?)
    }

    fn build_float_mul(
        &mut self,
        lhs: FloatValue<'ctx>,
        rhs: FloatValue<'ctx>,
        name: &str,
    ) -> Result<FloatValue<'ctx>, BackendError> {
        Ok(self.builder.build_float_mul(lhs, rhs, name)?)
    }

    fn build_float_ult(
        &mut self,
        lhs: FloatValue<'ctx>,
        rhs: FloatValue<'ctx>,
        name: &str,
    ) -> Result<IntValue<'ctx>, BackendError> {
        Ok(self
            .builder
            .build_float_compare(FloatPredicate::ULT, lhs, rhs, name)?)
    }

    fn build_flag_to_float(
        &mut self,
        flag: IntValue<'ctx>,
        name: &str,
    ) -> Result<FloatValue<'ctx>, BackendError> {
        Ok(self
            .builder
            .build_unsigned_int_to_float(flag, self.context.f64_type(), name)?)
    }

    fn build_call(
        &mut self,
        function: FunctionValue<'ctx>,
        args: &[FloatValue<'ctx>],
        name: &str,
    ) -> Result<FloatValue<'ctx>, BackendError> {
        let argsv: Vec<BasicMetadataValueEnum> = args.iter().map(|&val| val.into()).collect();

        self.builder
            .build_call(function, argsv.as_slice(), name)?
            .try_as_basic_value()
            .left()
            .map(|value| value.into_float_value())
            .ok_or_else(|| BackendError::Builder("call produced no value".to_string()))
    }

    fn build_return(&mut self, value: FloatValue<'ctx>) -> Result<(), BackendError> {
        self.builder.build_return(Some(&value))?;
        Ok(())
    }

    fn verify_function(&self, function: FunctionValue<'ctx>) -> bool {
        function.verify(false)
    }

    fn discard_body(&mut self, function: FunctionValue<'ctx>) -> Result<(), BackendError> {
        strip_body(function)
    }

    fn delete_function(&mut self, function: FunctionValue<'ctx>) {
        unsafe {
            function.delete();
        }
    }

    fn print_function(&self, function: FunctionValue<'ctx>) -> String {
        function.print_to_string().to_string()
    }

    fn print_module(&self) -> String {
        self.module.print_to_string().to_string()
    }

    fn evaluate(&self, function: FunctionValue<'ctx>) -> Result<f64, ExecutionError> {
        let name = self.function_name(function);
        let arity = function.count_params() as usize;
        if arity != 0 {
            return Err(ExecutionError::NotNullary(name, arity));
        }

        let reachable = self.reachable(function)?;

        Target::initialize_native(&InitializationConfig::default())
            .map_err(ExecutionError::Engine)?;

        // the engine takes ownership of whatever module it runs, so jit a
        // snapshot holding only the bodies this call can reach
        let snapshot = self.module.clone();
        let mut next = snapshot.get_first_function();
        while let Some(func) = next {
            next = func.get_next_function();
            if !reachable.contains(&*func.get_name().to_string_lossy()) {
                strip_body(func).map_err(|e| ExecutionError::Engine(e.to_string()))?;
            }
        }

        let ee = snapshot
            .create_jit_execution_engine(OptimizationLevel::None)
            .map_err(|e| ExecutionError::Engine(e.to_string()))?;

        let entry: JitFunction<EntryFunc> = unsafe { ee.get_function(&name) }
            .map_err(|e| ExecutionError::Engine(e.to_string()))?;

        Ok(unsafe { entry.call() })
    }
}
