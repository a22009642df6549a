//! Consumes tokens, produces a byte-addressed code image, resolves
//! labels and expands macros (spec §4.2)
//!
//! Grounded on `original_source/src/Emitter.c`'s `Emitter_Emit` state
//! machine (one token of lookahead pulled via `Emitter_NextToken`, a
//! label table plus an unknown-label list patched on definition) and the
//! teacher's `assembler.rs` top-level shape (a `WasError`-latching
//! driver that keeps going after a diagnostic so multiple errors surface
//! in one pass, reported via `Display`). The teacher's own tokenizer
//! (regex-splitting whole lines) is not reused; see `src/lexer.rs`.

pub mod macros;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::rc::Rc;

use crate::diagnostics::Diagnostic;
use crate::isa::Op;
use crate::lexer::Lexer;
use crate::token::{Span, Token, TokenKind};
use macros::MacroTable;

/// An unresolved use of a label: where to patch the 8-byte offset once
/// the label is defined, and the span of the reference (for the
/// "unresolved at end of input" diagnostic).
struct PendingReference {
    name: String,
    patch_site: usize,
    span: Span,
    resolved: bool,
}

/// Assembles a token stream into a code image. Owns the label table, the
/// pending-reference list, the macro table, and the in-progress code
/// image; the lexer is drained through a one-token lookahead plus a
/// macro-expansion deque (spec §4.2: "the assembler drains [the deque]
/// before pulling more tokens from the lexer").
pub struct Assembler<'a> {
    path: Rc<str>,
    lexer: Lexer<'a>,
    current: Token,
    lookahead: VecDeque<Token>,
    labels: HashMap<String, u64>,
    pending: Vec<PendingReference>,
    macros: MacroTable,
    code: Vec<u8>,
    had_error: bool,
}

/// Assemble a file into a code image
pub fn assemble_from_file(path: &str) -> Result<Vec<u8>, AssembleError> {
    let source = fs::read(path).map_err(|e| AssembleError::ReadError {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    assemble(path, &source)
}

/// Assemble a source buffer into a code image
pub fn assemble(path: &str, source: &[u8]) -> Result<Vec<u8>, AssembleError> {
    Assembler::new(path, source).run()
}

impl<'a> Assembler<'a> {
    fn new(path: &str, source: &'a [u8]) -> Assembler<'a> {
        let path: Rc<str> = Rc::from(path);
        let mut lexer = Lexer::new(path.clone(), source);
        let current = lexer.next_token();
        Assembler {
            path,
            lexer,
            current,
            lookahead: VecDeque::new(),
            labels: HashMap::new(),
            pending: Vec::new(),
            macros: MacroTable::new(),
            code: Vec::new(),
            had_error: false,
        }
    }

    fn run(mut self) -> Result<Vec<u8>, AssembleError> {
        loop {
            match self.current.kind {
                TokenKind::EndOfFile => {
                    self.check_unresolved();
                    break;
                }
                TokenKind::Colon => self.statement_label(),
                TokenKind::Macro => self.statement_macro_def(),
                TokenKind::Bang => self.statement_macro_use(),
                TokenKind::Exit => self.statement_simple(Op::Exit),
                TokenKind::Push => self.statement_push(),
                TokenKind::Pop => self.statement_sized(Op::Pop),
                TokenKind::AllocStack => self.statement_sized(Op::AllocStack),
                TokenKind::Dup => self.statement_sized(Op::Dup),
                TokenKind::Add => self.statement_sized(Op::Add),
                TokenKind::Sub => self.statement_sized(Op::Sub),
                TokenKind::Print => self.statement_sized(Op::Print),
                TokenKind::Jump => self.statement_jump(),
                TokenKind::JumpZero => self.statement_conditional_jump(Op::JumpZero),
                TokenKind::JumpNonZero => self.statement_conditional_jump(Op::JumpNonZero),
                TokenKind::GetStackTop => self.statement_simple(Op::GetStackTop),
                TokenKind::GetStackBottom => self.statement_simple(Op::GetStackBottom),
                TokenKind::Load => self.statement_sized(Op::Load),
                TokenKind::Store => self.statement_sized(Op::Store),
                TokenKind::CallCFunc => self.statement_call_c_func(),
                _ => {
                    self.fail(AssembleError::UnexpectedToken {
                        expected: None,
                        found: self.current.kind,
                        span: self.current.span,
                    });
                    self.advance();
                }
            }
        }

        // The lexer reports and recovers from its own errors inline; it
        // has no return channel for them, so latch its flag here too —
        // otherwise a stray lexical byte in an otherwise well-formed
        // program would still assemble and run (spec §6 requires a
        // non-zero exit for any lexer/assembler/VM diagnostic).
        if self.lexer.had_error() {
            self.had_error = true;
        }

        if self.had_error {
            Err(AssembleError::Failed)
        } else {
            Ok(self.code)
        }
    }

    // --- token stream plumbing -------------------------------------------------

    fn pull(&mut self) -> Token {
        match self.lookahead.pop_front() {
            Some(token) => token,
            None => self.lexer.next_token(),
        }
    }

    fn advance(&mut self) -> Token {
        let next = self.pull();
        std::mem::replace(&mut self.current, next)
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, AssembleError> {
        if self.current.kind == kind {
            Ok(self.advance())
        } else {
            Err(AssembleError::UnexpectedToken {
                expected: Some(kind),
                found: self.current.kind,
                span: self.current.span,
            })
        }
    }

    fn expect_integer(&mut self) -> Result<u64, AssembleError> {
        self.expect(TokenKind::Integer).map(|token| token.integer())
    }

    fn fail(&mut self, error: AssembleError) {
        self.had_error = true;
        Diagnostic::new(self.path.clone(), error.span(), error.to_string()).report();
    }

    // --- code image --------------------------------------------------------

    fn emit_op(&mut self, op: Op) {
        self.code.push(op as u8);
    }

    fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    // --- label resolution (spec §4.2 "Label resolution protocol") ----------

    fn define_label(&mut self, name: &str, span: Span) {
        if self.labels.contains_key(name) {
            self.fail(AssembleError::DuplicateLabel { name: name.to_string(), span });
            return;
        }
        let location = self.code.len() as u64;
        self.labels.insert(name.to_string(), location);
        let bytes = location.to_le_bytes();
        for reference in self.pending.iter_mut() {
            if !reference.resolved && reference.name == name {
                reference.resolved = true;
                self.code[reference.patch_site..reference.patch_site + 8].copy_from_slice(&bytes);
            }
        }
    }

    fn emit_label_reference(&mut self, name: &str, span: Span) {
        match self.labels.get(name) {
            Some(&offset) => self.emit_u64(offset),
            None => {
                let patch_site = self.code.len();
                self.pending.push(PendingReference { name: name.to_string(), patch_site, span, resolved: false });
                self.emit_u64(0);
            }
        }
    }

    fn check_unresolved(&mut self) {
        let unresolved: Vec<(String, Span)> = self
            .pending
            .iter()
            .filter(|reference| !reference.resolved)
            .map(|reference| (reference.name.clone(), reference.span))
            .collect();
        for (name, span) in unresolved {
            self.fail(AssembleError::UnresolvedLabel { name, span });
        }
    }

    // --- statements ----------------------------------------------------------

    fn statement_label(&mut self) {
        self.advance(); // ':'
        match self.expect(TokenKind::Name) {
            Ok(name_token) => {
                let name = name_token.name().to_string();
                self.define_label(&name, name_token.span);
            }
            Err(e) => self.fail(e),
        }
    }

    fn statement_macro_def(&mut self) {
        self.advance(); // 'macro'
        let name_token = match self.expect(TokenKind::Name) {
            Ok(t) => t,
            Err(e) => return self.fail(e),
        };
        if let Err(e) = self.expect(TokenKind::OpenParen) {
            return self.fail(e);
        }

        let mut body = Vec::new();
        loop {
            match self.current.kind {
                TokenKind::CloseParen => {
                    self.advance();
                    break;
                }
                TokenKind::EndOfFile => {
                    self.fail(AssembleError::UnexpectedToken {
                        expected: Some(TokenKind::CloseParen),
                        found: TokenKind::EndOfFile,
                        span: self.current.span,
                    });
                    break;
                }
                _ => {
                    body.push(self.current.clone());
                    self.advance();
                }
            }
        }

        self.macros.define(name_token.name().to_string(), body);
    }

    fn statement_macro_use(&mut self) {
        self.advance(); // '!'
        let name_token = match self.expect(TokenKind::Name) {
            Ok(t) => t,
            Err(e) => return self.fail(e),
        };

        let body = match self.macros.lookup(name_token.name()) {
            Some(body) => body,
            None => {
                return self.fail(AssembleError::UnknownMacro {
                    name: name_token.name().to_string(),
                    span: name_token.span,
                });
            }
        };

        // "pushes t1...tn to the front of the look-ahead deque, followed
        // by the current token, then continues normal dispatch" (spec §4.2)
        let following = std::mem::replace(&mut self.current, Token::new(TokenKind::EndOfFile, name_token.span, crate::token::Literal::None));
        let mut expanded: VecDeque<Token> = body.into_iter().collect();
        expanded.push_back(following);
        expanded.extend(self.lookahead.drain(..));
        self.lookahead = expanded;
        self.current = self.pull();
    }

    fn statement_simple(&mut self, op: Op) {
        self.advance();
        self.emit_op(op);
    }

    fn statement_sized(&mut self, op: Op) {
        self.advance();
        match self.expect_integer() {
            Ok(size) => {
                self.emit_op(op);
                self.emit_u64(size);
            }
            Err(e) => self.fail(e),
        }
    }

    fn statement_push(&mut self) {
        self.advance(); // 'push'
        let size = match self.expect_integer() {
            Ok(s) => s,
            Err(e) => return self.fail(e),
        };
        let value = match self.expect_integer() {
            Ok(v) => v,
            Err(e) => return self.fail(e),
        };

        self.emit_op(Op::Push);
        self.emit_u64(size);

        let mut bytes = vec![0u8; size as usize];
        let value_bytes = value.to_le_bytes();
        let n = (size as usize).min(8);
        bytes[..n].copy_from_slice(&value_bytes[..n]);
        self.emit_bytes(&bytes);
    }

    fn statement_jump(&mut self) {
        self.advance(); // 'jump'
        match self.expect(TokenKind::Name) {
            Ok(name_token) => {
                self.emit_op(Op::Jump);
                self.emit_label_reference(name_token.name(), name_token.span);
            }
            Err(e) => self.fail(e),
        }
    }

    fn statement_conditional_jump(&mut self, op: Op) {
        self.advance(); // 'jump-zero' | 'jump-non-zero'
        let size = match self.expect_integer() {
            Ok(s) => s,
            Err(e) => return self.fail(e),
        };
        match self.expect(TokenKind::Name) {
            Ok(name_token) => {
                self.emit_op(op);
                self.emit_u64(size);
                self.emit_label_reference(name_token.name(), name_token.span);
            }
            Err(e) => self.fail(e),
        }
    }

    fn statement_call_c_func(&mut self) {
        self.advance(); // 'call-c-func'
        let arg_count = match self.expect_integer() {
            Ok(n) => n,
            Err(e) => return self.fail(e),
        };

        let mut arg_sizes = Vec::with_capacity(arg_count as usize);
        for _ in 0..arg_count {
            match self.expect_integer() {
                Ok(size) => arg_sizes.push(size),
                Err(e) => return self.fail(e),
            }
        }

        let ret_size = match self.expect_integer() {
            Ok(size) => size,
            Err(e) => return self.fail(e),
        };

        self.emit_op(Op::CallCFunc);
        self.emit_u64(arg_count);
        for size in arg_sizes {
            self.emit_u64(size);
        }
        self.emit_u64(ret_size);
    }
}

/// Errors the assembler can raise, per spec §7's assembler-time rows
#[derive(Debug)]
pub enum AssembleError {
    /// Marker returned once the run loop has finished after one or more
    /// diagnostics were already printed (each is reported as it happens,
    /// per spec §4.2 "the assembler still attempts to continue").
    Failed,
    UnexpectedToken { expected: Option<TokenKind>, found: TokenKind, span: Span },
    UnresolvedLabel { name: String, span: Span },
    DuplicateLabel { name: String, span: Span },
    UnknownMacro { name: String, span: Span },
    ReadError { path: String, reason: String },
}

impl AssembleError {
    fn span(&self) -> Span {
        match self {
            AssembleError::Failed => Span::new(0, 0, 0, 0),
            AssembleError::UnexpectedToken { span, .. } => *span,
            AssembleError::UnresolvedLabel { span, .. } => *span,
            AssembleError::DuplicateLabel { span, .. } => *span,
            AssembleError::UnknownMacro { span, .. } => *span,
            AssembleError::ReadError { .. } => Span::new(0, 0, 0, 0),
        }
    }
}

impl fmt::Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssembleError::Failed => Ok(()),
            AssembleError::UnexpectedToken { expected: Some(expected), found, .. } => {
                write!(f, "expected token {}, got {}", expected, found)
            }
            AssembleError::UnexpectedToken { expected: None, found, .. } => {
                write!(f, "unexpected token {}", found)
            }
            AssembleError::UnresolvedLabel { name, .. } => write!(f, "unknown label '{}'", name),
            AssembleError::DuplicateLabel { name, .. } => write!(f, "label '{}' is already defined", name),
            AssembleError::UnknownMacro { name, .. } => write!(f, "unknown macro '{}'", name),
            AssembleError::ReadError { path, reason } => write!(f, "failed to read '{}': {}", path, reason),
        }
    }
}

impl std::error::Error for AssembleError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble_ok(source: &str) -> Vec<u8> {
        assemble("test.asm", source.as_bytes()).expect("expected assembly to succeed")
    }

    #[test]
    fn push_emits_op_size_and_truncated_value() {
        let code = assemble_ok("push 8 42 exit");
        assert_eq!(code[0], Op::Push as u8);
        assert_eq!(&code[1..9], &8u64.to_le_bytes());
        assert_eq!(&code[9..17], &42u64.to_le_bytes());
        assert_eq!(code[17], Op::Exit as u8);
    }

    #[test]
    fn push_truncates_value_to_size() {
        let code = assemble_ok("push 1 300 exit"); // 300 truncated to one byte = 44
        assert_eq!(code[0], Op::Push as u8);
        assert_eq!(&code[1..9], &1u64.to_le_bytes());
        assert_eq!(code[9], (300u64 & 0xFF) as u8);
    }

    #[test]
    fn backward_label_reference_resolves_immediately() {
        let code = assemble_ok(":start exit jump start");
        // jump op is after the single-byte Exit, at offset 1
        let jump_offset = 1 + 1; // Exit (1 byte) then Jump opcode byte
        assert_eq!(code[1], Op::Jump as u8);
        assert_eq!(&code[jump_offset..jump_offset + 8], &0u64.to_le_bytes());
    }

    #[test]
    fn forward_label_reference_is_patched_on_definition() {
        let code = assemble_ok("jump skip push 8 99 print 8 :skip exit");
        // jump(1) + location(8) = 9 bytes, then push(1)+size(8)+data(8)=17, print(1)+size(8)=9
        // skip label is defined at offset 9 + 17 + 9 = 35
        let location = u64::from_le_bytes(code[1..9].try_into().unwrap());
        assert_eq!(location, 35);
        assert_eq!(code[35], Op::Exit as u8);
    }

    #[test]
    fn unresolved_label_fails_assembly() {
        let result = assemble("test.asm", b"jump nowhere exit");
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_label_fails_assembly() {
        let result = assemble("test.asm", b":here exit :here exit");
        assert!(result.is_err());
    }

    #[test]
    fn macro_expansion_substitutes_captured_tokens() {
        let code = assemble_ok("macro PUSH42 ( push 8 42 ) !PUSH42 print 8 exit");
        assert_eq!(code[0], Op::Push as u8);
        assert_eq!(&code[9..17], &42u64.to_le_bytes());
    }

    #[test]
    fn unknown_macro_use_fails_assembly() {
        let result = assemble("test.asm", b"!nope exit");
        assert!(result.is_err());
    }

    #[test]
    fn call_c_func_encodes_argument_sizes_and_return_size() {
        let code = assemble_ok("call-c-func 2 1 2 8 exit");
        assert_eq!(code[0], Op::CallCFunc as u8);
        assert_eq!(&code[1..9], &2u64.to_le_bytes()); // arg count
        assert_eq!(&code[9..17], &1u64.to_le_bytes()); // arg size 0
        assert_eq!(&code[17..25], &2u64.to_le_bytes()); // arg size 1
        assert_eq!(&code[25..33], &8u64.to_le_bytes()); // ret size
    }

    #[test]
    fn stray_lexer_error_still_fails_an_otherwise_well_formed_program() {
        let result = assemble("test.asm", b"push 8 1 @ exit");
        assert!(result.is_err());
    }
}
