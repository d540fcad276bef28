use std::collections::HashMap;

use crate::ast::{Expression, Function, Prototype};
use crate::lexer::{Lexer, Token};

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum ParserError {
    #[error("unexpected token {0} when expecting an expression")]
    UnexpectedToken(Token),
    #[error("expected ')' but found {0}")]
    ExpectedCloseParen(Token),
    #[error("expected ')' or ',' in argument list but found {0}")]
    ExpectedArgumentDelimiter(Token),
    #[error("expected function name in prototype but found {0}")]
    ExpectedFunctionName(Token),
    #[error("expected '(' in prototype but found {0}")]
    ExpectedPrototypeOpen(Token),
    #[error("expected ')' in prototype but found {0}")]
    ExpectedPrototypeClose(Token),
    #[error("expected {expected} but found {found}")]
    ExpectedKeyword { expected: &'static str, found: Token },
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
}

pub type PartialParseResult = Result<Expression, ParserError>;

/// Default bound on both the height of a parsed expression tree and the
/// nesting of parentheses and argument lists.
pub const MAX_EXPRESSION_DEPTH: usize = 256;

// an expression together with the height of its tree
type DepthParseResult = Result<(Expression, usize), ParserError>;

/// Recursive descent parser with a single token of lookahead. Call
/// [`Parser::advance`] once to load the first token before parsing.
pub struct Parser<I: Iterator<Item = char>> {
    lexer: Lexer<I>,
    current: Token,
    pub operator_precedence: HashMap<char, i32>,
    pub max_depth: usize,
    nesting: usize,
}

impl<I: Iterator<Item = char>> Parser<I> {
    pub fn new(chars: I) -> Self {
        let mut operator_precedence = HashMap::new();
        operator_precedence.insert('<', 10);
        operator_precedence.insert('+', 20);
        operator_precedence.insert('-', 20);
        operator_precedence.insert('*', 40);
        Self {
            lexer: Lexer::new(chars),
            current: Token::Eof,
            operator_precedence,
            max_depth: MAX_EXPRESSION_DEPTH,
            nesting: 0,
        }
    }

    /// Registers (or, with a non-positive precedence, disables) a binary operator.
    pub fn set_precedence(&mut self, op: char, precedence: i32) {
        self.operator_precedence.insert(op, precedence);
    }

    pub fn source_mut(&mut self) -> &mut I {
        self.lexer.source_mut()
    }

    pub fn current(&self) -> &Token {
        &self.current
    }

    pub fn advance(&mut self) -> &Token {
        self.current = self.lexer.next_token();
        &self.current
    }

    fn current_is(&self, ch: char) -> bool {
        self.current == Token::Symbol(ch)
    }

    /// The operator under the cursor and its precedence, or -1 if it is not one.
    fn current_operator(&self) -> (char, i32) {
        match self.current {
            Token::Symbol(op) => match self.operator_precedence.get(&op) {
                Some(&pr) if pr > 0 => (op, pr),
                _ => (op, -1),
            },
            _ => ('\0', -1),
        }
    }

    fn check_depth(&self, depth: usize) -> Result<usize, ParserError> {
        if depth > self.max_depth {
            return Err(ParserError::TooDeep(self.max_depth));
        }
        Ok(depth)
    }

    fn parse_number(&mut self, num: f64) -> DepthParseResult {
        self.advance();
        Ok((Expression::Literal(num), 1))
    }

    fn parse_nested(&mut self) -> DepthParseResult {
        self.advance();
        let res = self.parse_nesting()?;
        if !self.current_is(')') {
            return Err(ParserError::ExpectedCloseParen(self.current.clone()));
        }
        self.advance();
        Ok(res)
    }

    fn parse_identifier(&mut self, ident: String) -> DepthParseResult {
        self.advance();
        if !self.current_is('(') {
            return Ok((Expression::Variable(ident), 1));
        }
        self.advance();

        let mut args = Vec::new();
        let mut deepest = 0;
        if !self.current_is(')') {
            loop {
                let (arg, depth) = self.parse_nesting()?;
                args.push(arg);
                deepest = deepest.max(depth);
                if self.current_is(')') {
                    break;
                }
                if !self.current_is(',') {
                    return Err(ParserError::ExpectedArgumentDelimiter(self.current.clone()));
                }
                self.advance();
            }
        }
        self.advance();

        let depth = self.check_depth(deepest + 1)?;
        Ok((Expression::Call(ident, args), depth))
    }

    fn parse_primary(&mut self) -> DepthParseResult {
        match self.current.clone() {
            Token::Number(num) => self.parse_number(num),
            Token::Ident(ident) => self.parse_identifier(ident),
            Token::Symbol('(') => self.parse_nested(),
            tok => Err(ParserError::UnexpectedToken(tok)),
        }
    }

    fn parse_rhs(&mut self, expr_precedence: i32, lhs: Expression, lhs_depth: usize) -> DepthParseResult {
        let mut result = lhs;
        let mut depth = lhs_depth;

        loop {
            let (operator, precedence) = self.current_operator();
            if precedence < expr_precedence {
                return Ok((result, depth));
            }
            self.advance();

            let (mut rhs, mut rhs_depth) = self.parse_primary()?;

            let (_, next_precedence) = self.current_operator();
            if precedence < next_precedence {
                let (folded, folded_depth) = self.parse_rhs(precedence + 1, rhs, rhs_depth)?;
                rhs = folded;
                rhs_depth = folded_depth;
            }

            // a flat chain folds iteratively but lowering walks it recursively
            depth = self.check_depth(depth.max(rhs_depth) + 1)?;
            result = Expression::Binary(operator, Box::new(result), Box::new(rhs));
        }
    }

    fn parse_nesting(&mut self) -> DepthParseResult {
        if self.nesting >= self.max_depth {
            return Err(ParserError::TooDeep(self.max_depth));
        }
        self.nesting += 1;
        let res = self
            .parse_primary()
            .and_then(|(lhs, depth)| self.parse_rhs(0, lhs, depth));
        self.nesting -= 1;
        res
    }

    pub fn parse_expression(&mut self) -> PartialParseResult {
        self.parse_nesting().map(|(expr, _)| expr)
    }

    pub fn parse_prototype(&mut self) -> Result<Prototype, ParserError> {
        let name = match &self.current {
            Token::Ident(name) => name.clone(),
            tok => return Err(ParserError::ExpectedFunctionName(tok.clone())),
        };
        self.advance();

        if !self.current_is('(') {
            return Err(ParserError::ExpectedPrototypeOpen(self.current.clone()));
        }

        let mut args = Vec::new();
        while let Token::Ident(arg) = self.advance() {
            args.push(arg.clone());
        }

        if !self.current_is(')') {
            return Err(ParserError::ExpectedPrototypeClose(self.current.clone()));
        }
        self.advance();

        Ok(Prototype { name, args })
    }

    fn expect_keyword(&mut self, keyword: Token, expected: &'static str) -> Result<(), ParserError> {
        if self.current != keyword {
            return Err(ParserError::ExpectedKeyword {
                expected,
                found: self.current.clone(),
            });
        }
        self.advance();
        Ok(())
    }

    pub fn parse_definition(&mut self) -> Result<Function, ParserError> {
        self.expect_keyword(Token::Def, "'def'")?;
        let prototype = self.parse_prototype()?;
        let body = self.parse_expression()?;
        Ok(Function { prototype, body })
    }

    pub fn parse_extern(&mut self) -> Result<Prototype, ParserError> {
        self.expect_keyword(Token::Extern, "'extern'")?;
        self.parse_prototype()
    }

    pub fn parse_top_level_expr(&mut self) -> Result<Function, ParserError> {
        let body = self.parse_expression()?;
        Ok(Function::top_level(body))
    }
}
