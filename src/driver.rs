use std::io::{self, Write};

use crate::codegen::{Backend, Codegen};
use crate::error::Error;
use crate::lexer::{CharSource, Token};
use crate::parser::Parser;

#[derive(Debug, Clone, PartialEq)]
pub struct DriverOptions {
    /// Written to the diagnostic sink before each top-level construct.
    pub prompt: Option<String>,
    /// Echo the IR of every lowered function to the diagnostic sink.
    pub print_ir: bool,
    /// Execute top-level expressions and write their values to the output sink.
    pub evaluate: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            prompt: Some("ready> ".to_string()),
            print_ir: false,
            evaluate: true,
        }
    }
}

/// The read-eval-print loop: dispatches each top-level construct to the
/// parser, lowers it, and reports the outcome.
pub struct Driver<B: Backend, I: CharSource, O: Write, E: Write> {
    parser: Parser<I>,
    codegen: Codegen<B>,
    options: DriverOptions,
    out: O,
    diag: E,
    failures: usize,
    input_failed: bool,
}

impl<B, I, O, E> Driver<B, I, O, E>
where
    B: Backend,
    I: CharSource,
    O: Write,
    E: Write,
{
    pub fn new(backend: B, chars: I, options: DriverOptions, out: O, diag: E) -> Self {
        Self {
            parser: Parser::new(chars),
            codegen: Codegen::new(backend),
            options,
            out,
            diag,
            failures: 0,
            input_failed: false,
        }
    }

    pub fn parser_mut(&mut self) -> &mut Parser<I> {
        &mut self.parser
    }

    pub fn backend(&self) -> &B {
        &self.codegen.backend
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Whether the input ended on a read error rather than a clean end of input.
    pub fn input_failed(&self) -> bool {
        self.input_failed
    }

    pub fn into_parts(self) -> (B, O, E) {
        (self.codegen.backend, self.out, self.diag)
    }

    fn prompt(&mut self) -> io::Result<()> {
        if let Some(prompt) = &self.options.prompt {
            write!(self.diag, "{}", prompt)?;
            self.diag.flush()?;
        }
        Ok(())
    }

    /// Runs until end of input. Only I/O errors on the sinks end the loop early.
    /// A read error on the input is reported like any failed construct.
    pub fn run(&mut self) -> io::Result<usize> {
        self.prompt()?;
        self.parser.advance();

        loop {
            match self.parser.current().clone() {
                Token::Eof => {
                    if let Some(err) = self.parser.source_mut().take_error() {
                        self.input_failed = true;
                        self.report(&Error::Io(err))?;
                    }
                    break;
                }
                Token::Symbol(';') => {
                    self.parser.advance();
                    continue;
                }
                Token::Def => self.handle_definition()?,
                Token::Extern => self.handle_extern()?,
                _ => self.handle_top_level_expression()?,
            }
            self.prompt()?;
        }

        Ok(self.failures)
    }

    fn report(&mut self, err: &Error) -> io::Result<()> {
        self.failures += 1;
        writeln!(self.diag, "Error: {}", err)?;

        // a lowering failure leaves the parser on the next construct already
        if let Error::Parse(_) = err {
            self.parser.advance();
        }
        Ok(())
    }

    fn print_ir(&mut self, function: B::Function) -> io::Result<()> {
        if self.options.print_ir {
            write!(self.diag, "{}", self.codegen.backend.print_function(function))?;
        }
        Ok(())
    }

    fn handle_definition(&mut self) -> io::Result<()> {
        let result = self
            .parser
            .parse_definition()
            .map_err(Error::from)
            .and_then(|func| self.codegen.compile_fn(&func).map_err(Error::from));

        match result {
            Ok(function) => {
                writeln!(self.diag, "Read function definition:")?;
                self.print_ir(function)
            }
            Err(err) => self.report(&err),
        }
    }

    fn handle_extern(&mut self) -> io::Result<()> {
        let result = self
            .parser
            .parse_extern()
            .map_err(Error::from)
            .and_then(|proto| self.codegen.compile_proto(&proto).map_err(Error::from));

        match result {
            Ok(function) => {
                writeln!(self.diag, "Read extern:")?;
                self.print_ir(function)
            }
            Err(err) => self.report(&err),
        }
    }

    fn handle_top_level_expression(&mut self) -> io::Result<()> {
        let result = self
            .parser
            .parse_top_level_expr()
            .map_err(Error::from)
            .and_then(|func| self.codegen.compile_fn(&func).map_err(Error::from));

        let function = match result {
            Ok(function) => function,
            Err(err) => return self.report(&err),
        };

        writeln!(self.diag, "Read top-level expression:")?;
        self.print_ir(function)?;

        if !self.options.evaluate {
            return Ok(());
        }

        let value = self.codegen.backend.evaluate(function);
        self.codegen.backend.delete_function(function);
        match value {
            Ok(value) => writeln!(self.out, "{}", value),
            Err(err) => self.report(&Error::from(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Module;
    use crate::lexer::ReadChars;
    use pretty_assertions::assert_eq;

    fn run(src: &str, options: DriverOptions) -> (Module, String, String, usize) {
        let mut driver = Driver::new(Module::new("test"), src.chars(), options, Vec::new(), Vec::new());
        let failures = driver.run().unwrap();
        let (module, out, diag) = driver.into_parts();
        (
            module,
            String::from_utf8(out).unwrap(),
            String::from_utf8(diag).unwrap(),
            failures,
        )
    }

    fn quiet() -> DriverOptions {
        DriverOptions {
            prompt: None,
            ..DriverOptions::default()
        }
    }

    #[test]
    fn evaluates_expressions() {
        let (module, out, diag, failures) = run("def foo(x y) x+y; foo(1,2); 2*3 < 7", quiet());
        assert_eq!(failures, 0);
        assert_eq!(out, "3\n1\n");
        assert_eq!(
            diag,
            "Read function definition:\nRead top-level expression:\nRead top-level expression:\n"
        );
        // evaluated anonymous functions are dropped again
        assert_eq!(module.len(), 1);
    }

    #[test]
    fn prompts_between_constructs() {
        let (_, _, diag, _) = run("1; 2", DriverOptions::default());
        assert_eq!(
            diag,
            "ready> Read top-level expression:\nready> Read top-level expression:\nready> "
        );
    }

    #[test]
    fn parse_errors_resynchronize() {
        let (module, out, diag, failures) = run("def ; def ok(x) x*2\nok(4)", quiet());
        assert_eq!(failures, 1);
        assert_eq!(out, "8\n");
        assert!(
            diag.starts_with("Error: expected function name in prototype but found ';'\n"),
            "{}",
            diag
        );
        assert!(module.get_function("ok").is_some());
    }

    #[test]
    fn lowering_errors_do_not_skip_next_construct() {
        let (module, out, _, failures) = run("def f(x) y def g(x) x+1 g(1)", quiet());
        assert_eq!(failures, 1);
        assert_eq!(out, "2\n");
        assert!(module.get_function("f").is_none());
    }

    #[test]
    fn without_evaluation_functions_stay() {
        let options = DriverOptions {
            prompt: None,
            print_ir: true,
            evaluate: false,
        };
        let (module, out, diag, _) = run("extern sin(a); sin(0)", options);
        assert_eq!(out, "");
        assert_eq!(module.len(), 2);
        assert!(diag.contains("declare double @sin(double %a)"), "{}", diag);
        assert!(diag.contains("%calltmp = call double @sin(double 0.0)"), "{}", diag);
    }

    #[test]
    fn execution_errors_are_reported() {
        let (_, out, diag, failures) = run("extern mystery(a) mystery(1)", quiet());
        assert_eq!(failures, 1);
        assert_eq!(out, "");
        assert!(diag.contains("Error: unresolved external function mystery with 1 arguments"));
    }

    #[test]
    fn read_errors_are_reported() {
        let input = ReadChars::new(io::Cursor::new(&b"1+1\n\xff\xfe\n2+2\n"[..]));
        let mut driver = Driver::new(Module::new("test"), input, quiet(), Vec::new(), Vec::new());
        assert_eq!(driver.run().unwrap(), 1);
        assert!(driver.input_failed());
        let (_, out, diag) = driver.into_parts();
        assert_eq!(String::from_utf8(out).unwrap(), "2\n");
        assert_eq!(
            String::from_utf8(diag).unwrap(),
            "Read top-level expression:\nError: stream did not contain valid UTF-8\n"
        );
    }

    #[test]
    fn clean_end_of_input_is_not_a_failure() {
        let input = ReadChars::new(io::Cursor::new(&b"1+1\n"[..]));
        let mut driver = Driver::new(Module::new("test"), input, quiet(), Vec::new(), Vec::new());
        assert_eq!(driver.run().unwrap(), 0);
        assert!(!driver.input_failed());
    }
}
