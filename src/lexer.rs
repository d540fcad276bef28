use std::{
    fmt,
    io::{self, BufRead},
    str::Chars,
    vec,
};

use lazy_static::lazy_static;
use regex::Regex;

#[derive(Debug, PartialEq, Clone)]
pub enum Token {
    Eof,
    Def,
    Extern,
    Ident(String),
    Number(f64),
    Symbol(char),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Eof => write!(f, "end of input"),
            Token::Def => write!(f, "'def'"),
            Token::Extern => write!(f, "'extern'"),
            Token::Ident(ident) => write!(f, "identifier '{}'", ident),
            Token::Number(num) => write!(f, "number {}", num),
            Token::Symbol(ch) => write!(f, "'{}'", ch),
        }
    }
}

lazy_static! {
    // longest prefix a strtod-style conversion would accept from a digit/dot run
    static ref NUMBER_PREFIX_RE: Regex = Regex::new(r"^\d*\.?\d*").unwrap();
}

/// Best-effort conversion of a run of digits and dots. Malformed text such as
/// `1.2.3` or `.` degrades to its longest valid prefix, or 0 if there is none.
fn parse_number(text: &str) -> f64 {
    NUMBER_PREFIX_RE
        .find(text)
        .and_then(|prefix| prefix.as_str().parse().ok())
        .unwrap_or(0.0)
}

/// A character stream that may end early because of an I/O failure.
pub trait CharSource: Iterator<Item = char> {
    /// The error that ended the stream, if any. Taking it clears it.
    fn take_error(&mut self) -> Option<io::Error> {
        None
    }
}

impl CharSource for Chars<'_> {}

/// Pulls tokens out of a character stream, one at a time, with a single
/// character of lookahead.
pub struct Lexer<I: Iterator<Item = char>> {
    chars: I,
    // `Some(None)` caches end of input so a console is not read twice
    peeked: Option<Option<char>>,
}

impl<I: Iterator<Item = char>> Lexer<I> {
    pub fn new(chars: I) -> Self {
        Self { chars, peeked: None }
    }

    /// The underlying character stream.
    pub fn source_mut(&mut self) -> &mut I {
        &mut self.chars
    }

    fn peek(&mut self) -> Option<char> {
        let chars = &mut self.chars;
        *self.peeked.get_or_insert_with(|| chars.next())
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek();
        if ch.is_some() {
            self.peeked = None;
        }
        ch
    }

    fn consume_while(&mut self, mut pred: impl FnMut(char) -> bool) -> String {
        let mut res = String::new();
        while let Some(ch) = self.peek() {
            if !pred(ch) {
                break;
            }
            res.push(ch);
            self.peeked = None;
        }
        res
    }

    pub fn next_token(&mut self) -> Token {
        loop {
            self.consume_while(char::is_whitespace);

            let first = match self.peek() {
                Some(ch) => ch,
                None => return Token::Eof,
            };

            // identifiers are ASCII only, any other letter is a symbol
            if first.is_ascii_alphabetic() {
                let ident = self.consume_while(|ch| ch.is_ascii_alphanumeric());
                return match ident.as_str() {
                    "def" => Token::Def,
                    "extern" => Token::Extern,
                    _ => Token::Ident(ident),
                };
            }

            if first.is_ascii_digit() || first == '.' {
                let text = self.consume_while(|ch| ch.is_ascii_digit() || ch == '.');
                return Token::Number(parse_number(&text));
            }

            if first == '#' {
                self.consume_while(|ch| ch != '\n' && ch != '\r');
                continue;
            }

            self.bump();
            return Token::Symbol(first);
        }
    }
}

impl<I: Iterator<Item = char>> Iterator for Lexer<I> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        match self.next_token() {
            Token::Eof => None,
            tok => Some(tok),
        }
    }
}

/// lex a whole string, dropping the trailing end-of-input token
pub fn lex(input: &str) -> Vec<Token> {
    Lexer::new(input.chars()).collect()
}

/// Character stream over a buffered reader, pulled one line at a time so an
/// interactive console only blocks when the scanner actually needs more input.
pub struct ReadChars<R> {
    reader: R,
    pending: vec::IntoIter<char>,
    error: Option<io::Error>,
}

impl<R: BufRead> ReadChars<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new().into_iter(),
            error: None,
        }
    }
}

impl<R: BufRead> CharSource for ReadChars<R> {
    fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }
}

impl<R: BufRead> Iterator for ReadChars<R> {
    type Item = char;

    fn next(&mut self) -> Option<char> {
        loop {
            if let Some(ch) = self.pending.next() {
                return Some(ch);
            }
            if self.error.is_some() {
                return None;
            }

            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => self.pending = line.chars().collect::<Vec<_>>().into_iter(),
                Err(e) => {
                    self.error = Some(e);
                    return None;
                }
            }
        }
    }
}
