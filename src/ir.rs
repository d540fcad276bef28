//! A small in-memory IR with an LLVM-like shape: functions of doubles made of
//! named basic blocks holding straight-line instructions.
//!
//! [`Module`] is both the container and the builder, and implements
//! [`Backend`] so the code generator can lower into it without any native
//! toolchain. It can print itself, verify functions, and run them.

mod eval;
mod verify;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::codegen::Backend;
use crate::error::{BackendError, ExecutionError};

pub use eval::{is_builtin, MAX_CALL_DEPTH};
pub use verify::VerifyError;

/// Ids are handed out in declaration order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    function: FunctionId,
    index: usize,
}

/// An operand. `Param` and `Inst` index into the enclosing function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Const(f64),
    Param(usize),
    Inst(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    FAdd(Value, Value),
    FSub(Value, Value),
    FMul(Value, Value),
    FCmpUlt(Value, Value),
    UiToFp(Value),
    Call(FunctionId, Vec<Value>),
    Ret(Value),
}

impl Instruction {
    pub fn is_terminator(&self) -> bool {
        matches!(self, Instruction::Ret(_))
    }

    /// Whether the instruction produces an `i1` rather than a double.
    pub fn yields_flag(&self) -> bool {
        matches!(self, Instruction::FCmpUlt(..))
    }

    pub fn operands(&self) -> Vec<Value> {
        match self {
            Instruction::FAdd(l, r)
            | Instruction::FSub(l, r)
            | Instruction::FMul(l, r)
            | Instruction::FCmpUlt(l, r) => vec![*l, *r],
            Instruction::UiToFp(v) | Instruction::Ret(v) => vec![*v],
            Instruction::Call(_, args) => args.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub name: String,
    /// Indices into [`Function::instructions`], in program order.
    pub instructions: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub blocks: Vec<BasicBlock>,
    pub instructions: Vec<(String, Instruction)>,
}

impl Function {
    fn new(name: &str, params: &[String]) -> Self {
        let mut function = Function {
            name: name.to_string(),
            params: Vec::with_capacity(params.len()),
            blocks: Vec::new(),
            instructions: Vec::new(),
        };
        for param in params {
            let unique = function.unique_name(param);
            function.params.push(unique);
        }
        function
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    fn taken_names(&self) -> HashSet<&str> {
        self.params
            .iter()
            .map(String::as_str)
            .chain(self.instructions.iter().map(|(name, _)| name.as_str()))
            .chain(self.blocks.iter().map(|block| block.name.as_str()))
            .collect()
    }

    /// Suffixes `base` with a counter until it no longer clashes, the way LLVM does.
    fn unique_name(&self, base: &str) -> String {
        if base.is_empty() {
            return String::new();
        }
        let taken = self.taken_names();
        if !taken.contains(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{}{}", base, n))
            .find(|candidate| !taken.contains(candidate.as_str()))
            .unwrap_or_default()
    }
}

pub struct Module {
    name: String,
    functions: BTreeMap<FunctionId, Function>,
    next_id: usize,
    symbols: HashMap<String, FunctionId>,
    insert_point: Option<BlockId>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Module {
            name: name.to_string(),
            functions: BTreeMap::new(),
            next_id: 0,
            symbols: HashMap::new(),
            insert_point: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(&id)
    }

    fn function_mut(&mut self, id: FunctionId) -> Option<&mut Function> {
        self.functions.get_mut(&id)
    }

    /// Live functions in declaration order.
    pub fn functions(&self) -> impl Iterator<Item = (FunctionId, &Function)> {
        self.functions.iter().map(|(&id, f)| (id, f))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, name: &str, inst: Instruction) -> Result<Value, BackendError> {
        let point = self.insert_point.ok_or(BackendError::NoInsertionPoint)?;
        let function = self
            .function_mut(point.function)
            .ok_or(BackendError::MissingFunction)?;
        let name = if inst.is_terminator() {
            String::new()
        } else {
            function.unique_name(name)
        };

        let index = function.instructions.len();
        let block = function
            .blocks
            .get_mut(point.index)
            .ok_or(BackendError::NoInsertionPoint)?;
        block.instructions.push(index);
        function.instructions.push((name, inst));
        Ok(Value::Inst(index))
    }

    fn display_name(&self, id: FunctionId) -> String {
        match self.function(id) {
            Some(f) if !f.name.is_empty() => f.name.clone(),
            _ => id.0.to_string(),
        }
    }

    fn fmt_value(&self, function: &Function, value: Value) -> String {
        match value {
            Value::Const(v) => format!("{:?}", v),
            Value::Param(i) => match function.params.get(i) {
                Some(name) => format!("%{}", name),
                None => format!("%arg{}", i),
            },
            Value::Inst(i) => match function.instructions.get(i) {
                Some((name, _)) if !name.is_empty() => format!("%{}", name),
                _ => format!("%{}", i),
            },
        }
    }

    fn fmt_instruction(&self, function: &Function, index: usize) -> String {
        let (name, inst) = &function.instructions[index];
        let v = |value: &Value| self.fmt_value(function, *value);
        match inst {
            Instruction::FAdd(l, r) => format!("%{} = fadd double {}, {}", name, v(l), v(r)),
            Instruction::FSub(l, r) => format!("%{} = fsub double {}, {}", name, v(l), v(r)),
            Instruction::FMul(l, r) => format!("%{} = fmul double {}, {}", name, v(l), v(r)),
            Instruction::FCmpUlt(l, r) => {
                format!("%{} = fcmp ult double {}, {}", name, v(l), v(r))
            }
            Instruction::UiToFp(flag) => format!("%{} = uitofp i1 {} to double", name, v(flag)),
            Instruction::Call(callee, args) => {
                let args = args
                    .iter()
                    .map(|arg| format!("double {}", v(arg)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("%{} = call double @{}({})", name, self.display_name(*callee), args)
            }
            Instruction::Ret(value) => format!("ret double {}", v(value)),
        }
    }

    fn fmt_function(&self, id: FunctionId, function: &Function) -> String {
        let params = function
            .params
            .iter()
            .map(|p| format!("double %{}", p))
            .collect::<Vec<_>>()
            .join(", ");
        let header = format!("double @{}({})", self.display_name(id), params);

        if function.is_declaration() {
            return format!("declare {}\n", header);
        }

        let mut out = format!("define {} {{\n", header);
        for block in &function.blocks {
            out.push_str(&format!("{}:\n", block.name));
            for &index in &block.instructions {
                out.push_str("  ");
                out.push_str(&self.fmt_instruction(function, index));
                out.push('\n');
            }
        }
        out.push_str("}\n");
        out
    }

    pub fn verify(&self, id: FunctionId) -> Result<(), VerifyError> {
        verify::verify_function(self, id)
    }

    /// Calls a function by id with the given arguments.
    pub fn run(&self, id: FunctionId, args: &[f64]) -> Result<f64, ExecutionError> {
        eval::call(self, id, args, 0)
    }

    /// Calls a named function with the given arguments.
    pub fn run_named(&self, name: &str, args: &[f64]) -> Result<f64, ExecutionError> {
        let id = self
            .symbols
            .get(name)
            .copied()
            .ok_or(ExecutionError::MissingFunction)?;
        self.run(id, args)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;
        for (id, function) in self.functions() {
            write!(f, "\n{}", self.fmt_function(id, function))?;
        }
        Ok(())
    }
}

impl Backend for Module {
    type Value = Value;
    type Flag = Value;
    type Block = BlockId;
    type Function = FunctionId;

    fn const_float(&mut self, value: f64) -> Value {
        Value::Const(value)
    }

    fn get_function(&self, name: &str) -> Option<FunctionId> {
        if name.is_empty() {
            return None;
        }
        self.symbols.get(name).copied()
    }

    fn declare_function(&mut self, name: &str, params: &[String]) -> FunctionId {
        let id = FunctionId(self.next_id);
        self.next_id += 1;
        self.functions.insert(id, Function::new(name, params));
        if !name.is_empty() {
            self.symbols.insert(name.to_string(), id);
        }
        id
    }

    fn params(&self, function: FunctionId) -> Vec<Value> {
        self.function(function)
            .map(|f| (0..f.params.len()).map(Value::Param).collect())
            .unwrap_or_default()
    }

    fn is_declaration(&self, function: FunctionId) -> bool {
        self.function(function)
            .map(Function::is_declaration)
            .unwrap_or(true)
    }

    fn function_name(&self, function: FunctionId) -> String {
        self.display_name(function)
    }

    fn append_basic_block(&mut self, function: FunctionId, name: &str) -> Result<BlockId, BackendError> {
        let func = self
            .function_mut(function)
            .ok_or(BackendError::MissingFunction)?;
        let name = func.unique_name(name);
        func.blocks.push(BasicBlock {
            name,
            instructions: Vec::new(),
        });
        Ok(BlockId {
            function,
            index: func.blocks.len() - 1,
        })
    }

    fn position_at_end(&mut self, block: BlockId) {
        self.insert_point = Some(block);
    }

    fn build_float_add(&mut self, lhs: Value, rhs: Value, name: &str) -> Result<Value, BackendError> {
        self.push(name, Instruction::FAdd(lhs, rhs))
    }

    fn build_float_sub(&mut self, lhs: Value, rhs: Value, name: &str) -> Result<Value, BackendError> {
        self.push(name, Instruction::FSub(lhs, rhs))
    }

    fn build_float_mul(&mut self, lhs: Value, rhs: Value, name: &str) -> Result<Value, BackendError> {
        self.push(name, Instruction::FMul(lhs, rhs))
    }

    fn build_float_ult(&mut self, lhs: Value, rhs: Value, name: &str) -> Result<Value, BackendError> {
        self.push(name, Instruction::FCmpUlt(lhs, rhs))
    }

    fn build_flag_to_float(&mut self, flag: Value, name: &str) -> Result<Value, BackendError> {
        self.push(name, Instruction::UiToFp(flag))
    }

    fn build_call(
        &mut self,
        function: FunctionId,
        args: &[Value],
        name: &str,
    ) -> Result<Value, BackendError> {
        if self.function(function).is_none() {
            return Err(BackendError::MissingFunction);
        }
        self.push(name, Instruction::Call(function, args.to_vec()))
    }

    fn build_return(&mut self, value: Value) -> Result<(), BackendError> {
        self.push("", Instruction::Ret(value)).map(|_| ())
    }

    fn verify_function(&self, function: FunctionId) -> bool {
        self.verify(function).is_ok()
    }

    fn discard_body(&mut self, function: FunctionId) -> Result<(), BackendError> {
        let func = self
            .function_mut(function)
            .ok_or(BackendError::MissingFunction)?;
        func.blocks.clear();
        func.instructions.clear();
        if self.insert_point.map(|p| p.function) == Some(function) {
            self.insert_point = None;
        }
        Ok(())
    }

    fn delete_function(&mut self, function: FunctionId) {
        if let Some(removed) = self.functions.remove(&function) {
            if self.symbols.get(&removed.name) == Some(&function) {
                self.symbols.remove(&removed.name);
            }
        }
        if self.insert_point.map(|p| p.function) == Some(function) {
            self.insert_point = None;
        }
    }

    fn print_function(&self, function: FunctionId) -> String {
        match self.function(function) {
            Some(func) => self.fmt_function(function, func),
            None => String::new(),
        }
    }

    fn print_module(&self) -> String {
        self.to_string()
    }

    fn evaluate(&self, function: FunctionId) -> Result<f64, ExecutionError> {
        let func = self.function(function).ok_or(ExecutionError::MissingFunction)?;
        if !func.params.is_empty() {
            return Err(ExecutionError::NotNullary(
                self.display_name(function),
                func.params.len(),
            ));
        }
        self.run(function, &[])
    }
}
