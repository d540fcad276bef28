use super::{Function, FunctionId, Instruction, Module, Value};
use crate::error::ExecutionError;

pub const MAX_CALL_DEPTH: usize = 512;

#[derive(Debug, Clone, Copy)]
enum Scalar {
    Float(f64),
    Flag(bool),
}

/// libm functions an `extern` declaration can bind to.
fn builtin(name: &str, arity: usize) -> Option<fn(&[f64]) -> f64> {
    let f: fn(&[f64]) -> f64 = match (name, arity) {
        ("sin", 1) => |a| a[0].sin(),
        ("cos", 1) => |a| a[0].cos(),
        ("tan", 1) => |a| a[0].tan(),
        ("atan", 1) => |a| a[0].atan(),
        ("atan2", 2) => |a| a[0].atan2(a[1]),
        ("exp", 1) => |a| a[0].exp(),
        ("log", 1) => |a| a[0].ln(),
        ("sqrt", 1) => |a| a[0].sqrt(),
        ("fabs", 1) => |a| a[0].abs(),
        ("pow", 2) => |a| a[0].powf(a[1]),
        ("floor", 1) => |a| a[0].floor(),
        ("ceil", 1) => |a| a[0].ceil(),
        _ => return None,
    };
    Some(f)
}

/// Whether an `extern` with this name and arity binds to a libm function.
pub fn is_builtin(name: &str, arity: usize) -> bool {
    builtin(name, arity).is_some()
}

fn float(function: &Function, slots: &[Option<Scalar>], args: &[f64], value: Value) -> Result<f64, ExecutionError> {
    match operand(slots, args, value) {
        Some(Scalar::Float(v)) => Ok(v),
        _ => Err(ExecutionError::Malformed(function.name.clone())),
    }
}

fn operand(slots: &[Option<Scalar>], args: &[f64], value: Value) -> Option<Scalar> {
    match value {
        Value::Const(v) => Some(Scalar::Float(v)),
        Value::Param(i) => args.get(i).copied().map(Scalar::Float),
        Value::Inst(i) => slots.get(i).copied().flatten(),
    }
}

pub(super) fn call(module: &Module, id: FunctionId, args: &[f64], depth: usize) -> Result<f64, ExecutionError> {
    if depth >= MAX_CALL_DEPTH {
        return Err(ExecutionError::StackOverflow(MAX_CALL_DEPTH));
    }

    let function = module.function(id).ok_or(ExecutionError::MissingFunction)?;
    if function.is_declaration() {
        return match builtin(&function.name, args.len()) {
            Some(f) => Ok(f(args)),
            None => Err(ExecutionError::UnresolvedExtern(
                function.name.clone(),
                args.len(),
            )),
        };
    }

    // no branches in this language, so the entry block is the whole body
    let entry = &function.blocks[0];
    let mut slots: Vec<Option<Scalar>> = vec![None; function.instructions.len()];

    for &index in &entry.instructions {
        let get = |value| float(function, &slots, args, value);
        let result = match &function.instructions[index].1 {
            Instruction::FAdd(l, r) => Scalar::Float(get(*l)? + get(*r)?),
            Instruction::FSub(l, r) => Scalar::Float(get(*l)? - get(*r)?),
            Instruction::FMul(l, r) => Scalar::Float(get(*l)? * get(*r)?),
            Instruction::FCmpUlt(l, r) => {
                let (l, r) = (get(*l)?, get(*r)?);
                // unordered: true if either side is NaN
                Scalar::Flag(l.is_nan() || r.is_nan() || l < r)
            }
            Instruction::UiToFp(flag) => match operand(&slots, args, *flag) {
                Some(Scalar::Flag(b)) => Scalar::Float(if b { 1.0 } else { 0.0 }),
                _ => return Err(ExecutionError::Malformed(function.name.clone())),
            },
            Instruction::Call(callee, call_args) => {
                let values = call_args
                    .iter()
                    .map(|arg| get(*arg))
                    .collect::<Result<Vec<_>, _>>()?;
                Scalar::Float(call(module, *callee, &values, depth + 1)?)
            }
            Instruction::Ret(value) => return get(*value),
        };
        slots[index] = Some(result);
    }

    Err(ExecutionError::Malformed(function.name.clone()))
}
