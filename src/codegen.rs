use std::collections::HashMap;

use crate::ast::{ASTNode, Expression, Function, Prototype};
use crate::error::{BackendError, ExecutionError};

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum CodegenError {
    #[error("unknown variable name {0}")]
    UnknownVariable(String),
    #[error("invalid binary operator {0}")]
    UnknownOperator(char),
    #[error("unknown function referenced {0}")]
    UnknownFunction(String),
    #[error("incorrect number of arguments in call to {0}: expected {1} found {2}")]
    InvalidCall(String, usize, usize),
    #[error("function {0} cannot be redefined")]
    Redefinition(String),
    #[error("definition of {0} takes {2} parameters but it was declared with {1}")]
    PrototypeMismatch(String, usize, usize),
    #[error("failed to verify function {0}")]
    InvalidFunction(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// The capabilities lowering needs from an IR library: constants, blocks,
/// float arithmetic, calls, function declaration and lookup, and verification.
pub trait Backend {
    type Value: Copy;
    /// Result of a comparison, before it is widened back to a float.
    type Flag: Copy;
    type Block: Copy;
    type Function: Copy;

    fn const_float(&mut self, value: f64) -> Self::Value;

    /// Looks a function up by name. The empty (anonymous) name never resolves.
    fn get_function(&self, name: &str) -> Option<Self::Function>;
    fn declare_function(&mut self, name: &str, params: &[String]) -> Self::Function;
    fn params(&self, function: Self::Function) -> Vec<Self::Value>;
    fn is_declaration(&self, function: Self::Function) -> bool;
    fn function_name(&self, function: Self::Function) -> String;

    fn append_basic_block(
        &mut self,
        function: Self::Function,
        name: &str,
    ) -> Result<Self::Block, BackendError>;
    fn position_at_end(&mut self, block: Self::Block);

    fn build_float_add(
        &mut self,
        lhs: Self::Value,
        rhs: Self::Value,
        name: &str,
    ) -> Result<Self::Value, BackendError>;
    fn build_float_sub(
        &mut self,
        lhs: Self::Value,
        rhs: Self::Value,
        name: &str,
    ) -> Result<Self::Value, BackendError>;
    fn build_float_mul(
        &mut self,
        lhs: Self::Value,
        rhs: Self::Value,
        name: &str,
    ) -> Result<Self::Value, BackendError>;
    /// Unordered less-than.
    fn build_float_ult(
        &mut self,
        lhs: Self::Value,
        rhs: Self::Value,
        name: &str,
    ) -> Result<Self::Flag, BackendError>;
    fn build_flag_to_float(&mut self, flag: Self::Flag, name: &str) -> Result<Self::Value, BackendError>;
    fn build_call(
        &mut self,
        function: Self::Function,
        args: &[Self::Value],
        name: &str,
    ) -> Result<Self::Value, BackendError>;
    fn build_return(&mut self, value: Self::Value) -> Result<(), BackendError>;

    fn verify_function(&self, function: Self::Function) -> bool;
    /// Strips every block from a function, leaving a bare declaration.
    fn discard_body(&mut self, function: Self::Function) -> Result<(), BackendError>;
    fn delete_function(&mut self, function: Self::Function);

    fn print_function(&self, function: Self::Function) -> String;
    fn print_module(&self) -> String;

    /// Runs a nullary function and returns its result.
    fn evaluate(&self, function: Self::Function) -> Result<f64, ExecutionError>;
}

/// Lowers the AST into a backend, keeping the parameters of the function
/// currently being defined in `named_values`.
pub struct Codegen<B: Backend> {
    pub backend: B,
    pub named_values: HashMap<String, B::Value>,
}

impl<B: Backend> Codegen<B> {
    pub fn new(backend: B) -> Self {
        Codegen {
            backend,
            named_values: HashMap::new(),
        }
    }

    pub fn codegen_expr(&mut self, expr: &Expression) -> Result<B::Value, CodegenError> {
        match expr {
            Expression::Literal(value) => Ok(self.backend.const_float(*value)),
            Expression::Variable(name) => match self.named_values.get(name) {
                Some(&var) => Ok(var),
                None => Err(CodegenError::UnknownVariable(name.clone())),
            },
            Expression::Binary(op, left, right) => {
                let lhs = self.codegen_expr(left)?;
                let rhs = self.codegen_expr(right)?;

                let value = match op {
                    '+' => self.backend.build_float_add(lhs, rhs, "addtmp")?,
                    '-' => self.backend.build_float_sub(lhs, rhs, "subtmp")?,
                    '*' => self.backend.build_float_mul(lhs, rhs, "multmp")?,
                    '<' => {
                        let cmp = self.backend.build_float_ult(lhs, rhs, "cmptmp")?;
                        self.backend.build_flag_to_float(cmp, "booltmp")?
                    }
                    _ => return Err(CodegenError::UnknownOperator(*op)),
                };
                Ok(value)
            }
            Expression::Call(callee, args) => {
                let func = self
                    .backend
                    .get_function(callee)
                    .ok_or_else(|| CodegenError::UnknownFunction(callee.clone()))?;

                let expected = self.backend.params(func).len();
                if expected != args.len() {
                    return Err(CodegenError::InvalidCall(
                        callee.clone(),
                        expected,
                        args.len(),
                    ));
                }

                let mut gened_args = Vec::with_capacity(args.len());
                for arg in args {
                    gened_args.push(self.codegen_expr(arg)?);
                }

                Ok(self.backend.build_call(func, &gened_args, "calltmp")?)
            }
        }
    }

    /// Declares the prototype, or returns the function already registered under its name.
    pub fn compile_proto(&mut self, proto: &Prototype) -> Result<B::Function, CodegenError> {
        if let Some(existing) = self.backend.get_function(&proto.name) {
            return Ok(existing);
        }
        Ok(self.backend.declare_function(&proto.name, &proto.args))
    }

    fn compile_body(&mut self, func: B::Function, function: &Function) -> Result<(), CodegenError> {
        let Function {
            prototype: proto,
            body,
        } = function;

        let entry = self.backend.append_basic_block(func, "entry")?;
        self.backend.position_at_end(entry);

        self.named_values.clear();
        self.named_values.reserve(proto.args.len());
        for (name, arg) in proto.args.iter().zip(self.backend.params(func)) {
            self.named_values.insert(name.clone(), arg);
        }

        let body = self.codegen_expr(body)?;
        self.backend.build_return(body)?;

        if self.backend.verify_function(func) {
            Ok(())
        } else {
            Err(CodegenError::InvalidFunction(proto.name.clone()))
        }
    }

    pub fn compile_fn(&mut self, function: &Function) -> Result<B::Function, CodegenError> {
        let proto = &function.prototype;
        let existing = self.backend.get_function(&proto.name);
        let func = match existing {
            Some(func) => func,
            None => self.compile_proto(proto)?,
        };

        if !self.backend.is_declaration(func) {
            return Err(CodegenError::Redefinition(proto.name.clone()));
        }

        let declared = self.backend.params(func).len();
        if declared != proto.args.len() {
            return Err(CodegenError::PrototypeMismatch(
                proto.name.clone(),
                declared,
                proto.args.len(),
            ));
        }

        match self.compile_body(func, function) {
            Ok(()) => Ok(func),
            Err(err) => {
                // an earlier extern stays callable, a fresh declaration goes away entirely
                if existing.is_some() {
                    self.backend.discard_body(func)?;
                } else {
                    self.backend.delete_function(func);
                }
                Err(err)
            }
        }
    }

    pub fn compile(&mut self, node: &ASTNode) -> Result<B::Function, CodegenError> {
        match node {
            ASTNode::Function(func) => self.compile_fn(func),
            ASTNode::Extern(proto) => self.compile_proto(proto),
        }
    }

    pub fn codegen(&mut self, ast_nodes: &[ASTNode]) -> Result<(), CodegenError> {
        for node in ast_nodes {
            self.compile(node)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Prototype;
    use crate::ir::Module;
    use pretty_assertions::assert_eq;

    fn proto(name: &str, args: &[&str]) -> Prototype {
        Prototype::new(name, args.iter().map(|a| a.to_string()).collect())
    }

    fn def(name: &str, args: &[&str], body: Expression) -> Function {
        Function {
            prototype: proto(name, args),
            body,
        }
    }

    fn codegen() -> Codegen<Module> {
        Codegen::new(Module::new("test"))
    }

    #[test]
    fn codegen_works() {
        let mut codegen = codegen();
        codegen
            .codegen(&[
                ASTNode::Extern(proto("sin", &["x"])),
                ASTNode::Function(def(
                    "thing",
                    &["x"],
                    Expression::binary(
                        '*',
                        Expression::call("sin", vec![Expression::variable("x")]),
                        Expression::variable("x"),
                    ),
                )),
            ])
            .unwrap();

        let thing = codegen.backend.get_function("thing").unwrap();
        assert!(!codegen.backend.is_declaration(thing));
        assert_eq!(
            codegen.backend.print_function(thing),
            "define double @thing(double %x) {\n\
             entry:\n  \
             %calltmp = call double @sin(double %x)\n  \
             %multmp = fmul double %calltmp, %x\n  \
             ret double %multmp\n\
             }\n"
        );
    }

    #[test]
    fn comparison_is_widened_to_float() {
        let mut codegen = codegen();
        let func = codegen
            .compile_fn(&def(
                "lt",
                &["a", "b"],
                Expression::binary('<', Expression::variable("a"), Expression::variable("b")),
            ))
            .unwrap();
        let text = codegen.backend.print_function(func);
        assert!(text.contains("%cmptmp = fcmp ult double %a, %b"), "{}", text);
        assert!(text.contains("%booltmp = uitofp i1 %cmptmp to double"), "{}", text);
    }

    #[test]
    fn unknown_variable_leaves_scope_alone() {
        let mut codegen = codegen();
        codegen.named_values.insert("x".to_string(), codegen.backend.const_float(1.0));
        assert_eq!(
            codegen.codegen_expr(&Expression::variable("z")),
            Err(CodegenError::UnknownVariable("z".to_string()))
        );
        assert_eq!(codegen.named_values.len(), 1);
        assert!(codegen.named_values.contains_key("x"));
    }

    #[test]
    fn invalid_operator() {
        let mut codegen = codegen();
        let res = codegen.compile_fn(&def(
            "f",
            &[],
            Expression::binary('/', Expression::Literal(1.0), Expression::Literal(2.0)),
        ));
        assert_eq!(res, Err(CodegenError::UnknownOperator('/')));
        assert!(codegen.backend.get_function("f").is_none());
    }

    #[test]
    fn redefinition_keeps_first_body() {
        let mut codegen = codegen();
        let first = def("f", &["x"], Expression::variable("x"));
        let func = codegen.compile_fn(&first).unwrap();
        let before = codegen.backend.print_function(func);

        let second = def(
            "f",
            &["x"],
            Expression::binary('+', Expression::variable("x"), Expression::Literal(1.0)),
        );
        assert_eq!(
            codegen.compile_fn(&second),
            Err(CodegenError::Redefinition("f".to_string()))
        );
        let func = codegen.backend.get_function("f").unwrap();
        assert_eq!(codegen.backend.print_function(func), before);
    }

    #[test]
    fn extern_may_be_completed_by_definition() {
        let mut codegen = codegen();
        let decl = codegen.compile_proto(&proto("f", &["x"])).unwrap();
        assert!(codegen.backend.is_declaration(decl));
        let again = codegen.compile_proto(&proto("f", &["y"])).unwrap();
        assert_eq!(decl, again);

        let func = codegen
            .compile_fn(&def("f", &["x"], Expression::variable("x")))
            .unwrap();
        assert_eq!(func, decl);
        assert!(!codegen.backend.is_declaration(func));
    }

    #[test]
    fn definition_must_match_declared_arity() {
        let mut codegen = codegen();
        codegen.compile_proto(&proto("f", &["x"])).unwrap();
        assert_eq!(
            codegen.compile_fn(&def("f", &["x", "y"], Expression::variable("x"))),
            Err(CodegenError::PrototypeMismatch("f".to_string(), 1, 2))
        );
    }

    #[test]
    fn failed_body_removes_fresh_function() {
        let mut codegen = codegen();
        let res = codegen.compile_fn(&def("f", &["x"], Expression::variable("y")));
        assert_eq!(res, Err(CodegenError::UnknownVariable("y".to_string())));
        assert!(codegen.backend.get_function("f").is_none());
        assert_eq!(codegen.backend.len(), 0);
    }

    #[test]
    fn failed_body_restores_earlier_extern() {
        let mut codegen = codegen();
        codegen.compile_proto(&proto("f", &["x"])).unwrap();
        let res = codegen.compile_fn(&def("f", &["x"], Expression::variable("y")));
        assert!(res.is_err());
        let func = codegen.backend.get_function("f").unwrap();
        assert!(codegen.backend.is_declaration(func));
    }

    #[test]
    fn call_arity_mismatch_does_not_touch_module() {
        let mut codegen = codegen();
        codegen
            .compile_fn(&def(
                "foo",
                &["x", "y"],
                Expression::binary('+', Expression::variable("x"), Expression::variable("y")),
            ))
            .unwrap();
        let before = codegen.backend.print_module();

        for args in vec![
            vec![Expression::Literal(1.0)],
            vec![Expression::Literal(1.0), Expression::Literal(2.0), Expression::Literal(3.0)],
        ] {
            let supplied = args.len();
            let res = codegen.compile_fn(&Function::top_level(Expression::call("foo", args)));
            assert_eq!(
                res,
                Err(CodegenError::InvalidCall("foo".to_string(), 2, supplied))
            );
            assert_eq!(codegen.backend.print_module(), before);
        }
    }

    #[test]
    fn unknown_function() {
        let mut codegen = codegen();
        assert_eq!(
            codegen.compile_fn(&Function::top_level(Expression::call("nope", vec![]))),
            Err(CodegenError::UnknownFunction("nope".to_string()))
        );
    }

    #[test]
    fn forward_references_fail() {
        let mut codegen = codegen();
        assert_eq!(
            codegen.compile_fn(&def("f", &["x"], Expression::call("g", vec![Expression::variable("x")]))),
            Err(CodegenError::UnknownFunction("g".to_string()))
        );
    }

    #[test]
    fn scope_is_reset_per_function() {
        let mut codegen = codegen();
        codegen
            .compile_fn(&def("f", &["x"], Expression::variable("x")))
            .unwrap();
        assert_eq!(
            codegen.compile_fn(&def("g", &["y"], Expression::variable("x"))),
            Err(CodegenError::UnknownVariable("x".to_string()))
        );
    }

    #[test]
    fn duplicate_parameters_bind_last() {
        let mut codegen = codegen();
        let func = codegen
            .compile_fn(&def("f", &["a", "a"], Expression::variable("a")))
            .unwrap();
        assert!(codegen.backend.print_function(func).contains("ret double %a1"));
    }

    /// Lowers into a [`Module`] but rejects every function at verification.
    struct Rejecting(Module);

    impl Backend for Rejecting {
        type Value = <Module as Backend>::Value;
        type Flag = <Module as Backend>::Flag;
        type Block = <Module as Backend>::Block;
        type Function = <Module as Backend>::Function;

        fn const_float(&mut self, value: f64) -> Self::Value {
            self.0.const_float(value)
        }

        fn get_function(&self, name: &str) -> Option<Self::Function> {
            self.0.get_function(name)
        }

        fn declare_function(&mut self, name: &str, params: &[String]) -> Self::Function {
            self.0.declare_function(name, params)
        }

        fn params(&self, function: Self::Function) -> Vec<Self::Value> {
            self.0.params(function)
        }

        fn is_declaration(&self, function: Self::Function) -> bool {
            self.0.is_declaration(function)
        }

        fn function_name(&self, function: Self::Function) -> String {
            self.0.function_name(function)
        }

        fn append_basic_block(
            &mut self,
            function: Self::Function,
            name: &str,
        ) -> Result<Self::Block, BackendError> {
            self.0.append_basic_block(function, name)
        }

        fn position_at_end(&mut self, block: Self::Block) {
            self.0.position_at_end(block)
        }

        fn build_float_add(
            &mut self,
            lhs: Self::Value,
            rhs: Self::Value,
            name: &str,
        ) -> Result<Self::Value, BackendError> {
            self.0.build_float_add(lhs, rhs, name)
        }

        fn build_float_sub(
            &mut self,
            lhs: Self::Value,
            rhs: Self::Value,
            name: &str,
        ) -> Result<Self::Value, BackendError> {
            self.0.build_float_sub(lhs, rhs, name)
        }

        fn build_float_mul(
            &mut self,
            lhs: Self::Value,
            rhs: Self::Value,
            name: &str,
        ) -> Result<Self::Value, BackendError> {
            self.0.build_float_mul(lhs, rhs, name)
        }

        fn build_float_ult(
            &mut self,
            lhs: Self::Value,
            rhs: Self::Value,
            name: &str,
        ) -> Result<Self::Flag, BackendError> {
            self.0.build_float_ult(lhs, rhs, name)
        }

        fn build_flag_to_float(&mut self, flag: Self::Flag, name: &str) -> Result<Self::Value, BackendError> {
            self.0.build_flag_to_float(flag, name)
        }

        fn build_call(
            &mut self,
            function: Self::Function,
            args: &[Self::Value],
            name: &str,
        ) -> Result<Self::Value, BackendError> {
            self.0.build_call(function, args, name)
        }

        fn build_return(&mut self, value: Self::Value) -> Result<(), BackendError> {
            self.0.build_return(value)
        }

        fn verify_function(&self, _: Self::Function) -> bool {
            false
        }

        fn discard_body(&mut self, function: Self::Function) -> Result<(), BackendError> {
            self.0.discard_body(function)
        }

        fn delete_function(&mut self, function: Self::Function) {
            self.0.delete_function(function)
        }

        fn print_function(&self, function: Self::Function) -> String {
            self.0.print_function(function)
        }

        fn print_module(&self) -> String {
            self.0.print_module()
        }

        fn evaluate(&self, function: Self::Function) -> Result<f64, ExecutionError> {
            self.0.evaluate(function)
        }
    }

    #[test]
    fn unverifiable_function_is_removed() {
        let mut codegen = Codegen::new(Rejecting(Module::new("test")));
        assert_eq!(
            codegen.compile_fn(&def("f", &["x"], Expression::variable("x"))),
            Err(CodegenError::InvalidFunction("f".to_string()))
        );
        assert!(codegen.backend.get_function("f").is_none());
        assert!(codegen.backend.0.is_empty());

        let res = codegen.compile_fn(&Function::top_level(Expression::Literal(1.0)));
        assert_eq!(res, Err(CodegenError::InvalidFunction(String::new())));
        assert!(codegen.backend.0.is_empty());
    }

    #[test]
    fn unverifiable_definition_restores_extern() {
        let mut codegen = Codegen::new(Rejecting(Module::new("test")));
        let decl = codegen.compile_proto(&proto("f", &["x"])).unwrap();
        assert_eq!(
            codegen.compile_fn(&def("f", &["x"], Expression::variable("x"))),
            Err(CodegenError::InvalidFunction("f".to_string()))
        );
        assert_eq!(codegen.backend.get_function("f"), Some(decl));
        assert!(codegen.backend.is_declaration(decl));
        assert_eq!(
            codegen.backend.print_function(decl),
            "declare double @f(double %x)\n"
        );
    }
}
