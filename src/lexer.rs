//! Turns a source buffer into a lazy stream of [Token]s
//!
//! Grounded on `original_source/src/Lexer.c`'s `Lexer_NextToken`: a
//! single `Current` byte of lookahead, advanced one byte at a time, with
//! line/column tracked as we go. Lexical errors are recoverable: the
//! offending byte is reported and skipped, and scanning resumes.

use std::rc::Rc;

use crate::diagnostics::Diagnostic;
use crate::isa::keyword_kind;
use crate::token::{Literal, Span, Token, TokenKind};

/// A byte-at-a-time scanner over a source buffer. Does not own the
/// buffer; the caller keeps it alive for as long as tokens are pulled.
pub struct Lexer<'a> {
    path: Rc<str>,
    source: &'a [u8],
    position: usize,
    line: usize,
    column: usize,
    current: u8,
    had_error: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(path: Rc<str>, source: &'a [u8]) -> Lexer<'a> {
        let current = source.first().copied().unwrap_or(0);
        Lexer { path, source, position: 0, line: 1, column: 1, current, had_error: false }
    }

    /// Whether any lexical diagnostic has been reported so far. The
    /// assembler latches this into its own `had_error` flag so a
    /// recoverable lexer error still forces a non-zero exit (spec §6).
    pub fn had_error(&self) -> bool {
        self.had_error
    }

    pub fn path(&self) -> Rc<str> {
        self.path.clone()
    }

    fn next_char(&mut self) -> u8 {
        let current = self.current;
        self.position += 1;
        self.column += 1;
        if current == b'\n' {
            self.line += 1;
            self.column = 1;
        }
        self.current = self.source.get(self.position).copied().unwrap_or(0);
        current
    }

    fn at_end(&self) -> bool {
        self.position >= self.source.len()
    }

    /// Pull the next token, skipping whitespace and comments, and
    /// reporting (then skipping past) any byte that starts nothing
    /// recognized. Always terminates in [TokenKind::EndOfFile].
    pub fn next_token(&mut self) -> Token {
        loop {
            let start_offset = self.position;
            let start_line = self.line;
            let start_column = self.column;

            if self.at_end() {
                return Token::new(
                    TokenKind::EndOfFile,
                    Span::new(start_offset, start_line, start_column, 0),
                    Literal::None,
                );
            }

            match self.current {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.next_char();
                    continue;
                }
                b'/' if self.peek_next() == Some(b'/') => {
                    while !self.at_end() && self.current != b'\n' {
                        self.next_char();
                    }
                    continue;
                }
                b'0'..=b'9' => return self.lex_integer(start_offset, start_line, start_column),
                b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                    return self.lex_name(start_offset, start_line, start_column)
                }
                b':' => {
                    self.next_char();
                    return Token::new(
                        TokenKind::Colon,
                        Span::new(start_offset, start_line, start_column, 1),
                        Literal::None,
                    );
                }
                b'!' => {
                    self.next_char();
                    return Token::new(
                        TokenKind::Bang,
                        Span::new(start_offset, start_line, start_column, 1),
                        Literal::None,
                    );
                }
                b'(' => {
                    self.next_char();
                    return Token::new(
                        TokenKind::OpenParen,
                        Span::new(start_offset, start_line, start_column, 1),
                        Literal::None,
                    );
                }
                b')' => {
                    self.next_char();
                    return Token::new(
                        TokenKind::CloseParen,
                        Span::new(start_offset, start_line, start_column, 1),
                        Literal::None,
                    );
                }
                other => {
                    self.next_char();
                    self.had_error = true;
                    let span = Span::new(start_offset, start_line, start_column, 1);
                    Diagnostic::new(
                        self.path.clone(),
                        span,
                        format!("unexpected character '{}'", other as char),
                    )
                    .report();
                    continue;
                }
            }
        }
    }

    fn peek_next(&self) -> Option<u8> {
        self.source.get(self.position + 1).copied()
    }

    fn lex_integer(&mut self, start_offset: usize, start_line: usize, start_column: usize) -> Token {
        let mut value: u64 = 0;
        while matches!(self.current, b'0'..=b'9' | b'_') {
            if self.current == b'_' {
                self.next_char();
                continue;
            }
            let digit = (self.next_char() - b'0') as u64;
            value = value.wrapping_mul(10).wrapping_add(digit);
        }
        Token::new(
            TokenKind::Integer,
            Span::new(start_offset, start_line, start_column, self.position - start_offset),
            Literal::Integer(value),
        )
    }

    fn lex_name(&mut self, start_offset: usize, start_line: usize, start_column: usize) -> Token {
        while matches!(self.current, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-') {
            self.next_char();
        }
        let lexeme = &self.source[start_offset..self.position];
        let text = std::str::from_utf8(lexeme).unwrap_or("");
        let span = Span::new(start_offset, start_line, start_column, self.position - start_offset);

        if text == "macro" {
            return Token::new(TokenKind::Macro, span, Literal::None);
        }
        if let Some(kind) = keyword_kind(text) {
            return Token::new(kind, span, Literal::None);
        }
        Token::new(TokenKind::Name, span, Literal::Name(Rc::from(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(Rc::from("test.asm"), source.as_bytes());
        let mut kinds = Vec::new();
        loop {
            let token = lexer.next_token();
            let done = token.kind == TokenKind::EndOfFile;
            kinds.push(token.kind);
            if done {
                break;
            }
        }
        kinds
    }

    #[test]
    fn skips_whitespace_and_comments() {
        let kinds = tokenize("  // a comment\n\texit // trailing\n");
        assert_eq!(kinds, vec![TokenKind::Exit, TokenKind::EndOfFile]);
    }

    #[test]
    fn integers_ignore_underscores_and_track_value() {
        let mut lexer = Lexer::new(Rc::from("t"), b"1_000_000");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::Integer);
        assert_eq!(token.integer(), 1_000_000);
    }

    #[test]
    fn integer_overflow_wraps_silently() {
        let mut lexer = Lexer::new(Rc::from("t"), b"18446744073709551616"); // 2^64
        let token = lexer.next_token();
        assert_eq!(token.integer(), 0);
    }

    #[test]
    fn names_allow_hyphens_and_promote_keywords() {
        let kinds = tokenize("foo-bar jump-zero done");
        assert_eq!(
            kinds,
            vec![TokenKind::Name, TokenKind::JumpZero, TokenKind::Name, TokenKind::EndOfFile]
        );
    }

    #[test]
    fn punctuation_kinds() {
        let kinds = tokenize(": ! ( )");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Colon,
                TokenKind::Bang,
                TokenKind::OpenParen,
                TokenKind::CloseParen,
                TokenKind::EndOfFile
            ]
        );
    }

    #[test]
    fn unexpected_byte_is_skipped_and_recoverable() {
        let kinds = tokenize("push @ 1");
        assert_eq!(kinds, vec![TokenKind::Push, TokenKind::Integer, TokenKind::EndOfFile]);
    }

    #[test]
    fn line_and_column_tracking() {
        let mut lexer = Lexer::new(Rc::from("t"), b"exit\n  push");
        let first = lexer.next_token();
        assert_eq!((first.span.line, first.span.column), (1, 1));
        let second = lexer.next_token();
        assert_eq!((second.span.line, second.span.column), (2, 3));
    }
}
