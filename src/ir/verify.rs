use std::collections::HashSet;

use super::{Function, FunctionId, Instruction, Module, Value};

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum VerifyError {
    #[error("function does not exist")]
    MissingFunction,
    #[error("function {0} has no body")]
    NoBody(String),
    #[error("block {0} is empty")]
    EmptyBlock(String),
    #[error("block {0} does not end in a terminator")]
    MissingTerminator(String),
    #[error("terminator in the middle of block {0}")]
    EarlyTerminator(String),
    #[error("instruction {0} uses a value that is not defined before it")]
    UndefinedOperand(usize),
    #[error("instruction {0} uses an operand of the wrong type")]
    OperandType(usize),
    #[error("instruction {0} calls a function that no longer exists")]
    MissingCallee(usize),
    #[error("instruction {0} passes {1} arguments to a function taking {2}")]
    CallArity(usize, usize, usize),
}

fn check_operand(
    function: &Function,
    defined: &HashSet<usize>,
    index: usize,
    value: Value,
    want_flag: bool,
) -> Result<(), VerifyError> {
    let is_flag = match value {
        Value::Const(_) => false,
        Value::Param(i) if i < function.params.len() => false,
        Value::Param(_) => return Err(VerifyError::UndefinedOperand(index)),
        Value::Inst(i) => {
            if !defined.contains(&i) {
                return Err(VerifyError::UndefinedOperand(index));
            }
            let (_, inst) = &function.instructions[i];
            if inst.is_terminator() {
                return Err(VerifyError::OperandType(index));
            }
            inst.yields_flag()
        }
    };
    if is_flag != want_flag {
        return Err(VerifyError::OperandType(index));
    }
    Ok(())
}

pub(super) fn verify_function(module: &Module, id: FunctionId) -> Result<(), VerifyError> {
    let function = module.function(id).ok_or(VerifyError::MissingFunction)?;
    if function.blocks.is_empty() {
        return Err(VerifyError::NoBody(module.display_name(id)));
    }

    let mut defined = HashSet::new();
    for block in &function.blocks {
        let (last, body) = match block.instructions.split_last() {
            Some(split) => split,
            None => return Err(VerifyError::EmptyBlock(block.name.clone())),
        };

        for &index in body {
            if function.instructions[index].1.is_terminator() {
                return Err(VerifyError::EarlyTerminator(block.name.clone()));
            }
        }
        if !function.instructions[*last].1.is_terminator() {
            return Err(VerifyError::MissingTerminator(block.name.clone()));
        }

        for &index in &block.instructions {
            let inst = &function.instructions[index].1;
            let want_flag = matches!(inst, Instruction::UiToFp(_));
            for operand in inst.operands() {
                check_operand(function, &defined, index, operand, want_flag)?;
            }

            if let Instruction::Call(callee, args) = inst {
                let callee = module
                    .function(*callee)
                    .ok_or(VerifyError::MissingCallee(index))?;
                if callee.params.len() != args.len() {
                    return Err(VerifyError::CallArity(index, args.len(), callee.params.len()));
                }
            }

            defined.insert(index);
        }
    }

    Ok(())
}
