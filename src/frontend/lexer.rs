//! Hand-written lexer with byte-accurate position tracking.

use crate::error::{AlthreadError, AlthreadResult, ErrorKind, Pos};
use crate::frontend::token::{Token, TokenKind};

/// Lexer over one source file.
pub struct Lexer<'a> {
    file: String,
    input: &'a str,
    chars: Vec<char>,
    /// Byte offset of each element of `chars`.
    offsets: Vec<usize>,
    index: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    /// Create a lexer for `input`, attributing positions to `file`.
    pub fn new(file: &str, input: &'a str) -> Self {
        let mut chars = Vec::with_capacity(input.len());
        let mut offsets = Vec::with_capacity(input.len());
        for (offset, ch) in input.char_indices() {
            chars.push(ch);
            offsets.push(offset);
        }
        Lexer {
            file: file.to_string(),
            input,
            chars,
            offsets,
            index: 0,
            line: 1,
            column: 1,
        }
    }

    /// Tokenize the whole input, ending with an `Eof` token.
    pub fn tokenize(mut self) -> AlthreadResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            if self.at_end() {
                let pos = self.pos_here();
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    pos,
                });
                return Ok(tokens);
            }
            tokens.push(self.next_token()?);
        }
    }

    fn next_token(&mut self) -> AlthreadResult<Token> {
        let start_index = self.index;
        let start_line = self.line;
        let start_column = self.column;
        let ch = self.advance();

        let kind = match ch {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semi,
            ':' => TokenKind::Colon,
            '@' => TokenKind::At,
            '.' => {
                if self.eat('.') {
                    TokenKind::DotDot
                } else {
                    TokenKind::Dot
                }
            }
            '+' => {
                if self.eat('=') {
                    TokenKind::PlusAssign
                } else {
                    TokenKind::Plus
                }
            }
            '-' => {
                if self.eat('>') {
                    TokenKind::Arrow
                } else if self.eat('=') {
                    TokenKind::MinusAssign
                } else {
                    TokenKind::Minus
                }
            }
            '*' => {
                if self.eat('=') {
                    TokenKind::StarAssign
                } else {
                    TokenKind::Star
                }
            }
            '/' => {
                if self.eat('=') {
                    TokenKind::SlashAssign
                } else {
                    TokenKind::Slash
                }
            }
            '%' => {
                if self.eat('=') {
                    TokenKind::PercentAssign
                } else {
                    TokenKind::Percent
                }
            }
            '=' => {
                if self.eat('=') {
                    TokenKind::EqEq
                } else if self.eat('>') {
                    TokenKind::FatArrow
                } else {
                    TokenKind::Assign
                }
            }
            '!' => {
                if self.eat('=') {
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            '<' => {
                if self.eat('=') {
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.eat('=') {
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '&' => {
                if self.eat('&') {
                    TokenKind::AndAnd
                } else {
                    return Err(self.error(start_index, start_line, start_column, "expected '&&'"));
                }
            }
            '|' => {
                if self.eat('|') {
                    TokenKind::OrOr
                } else {
                    return Err(self.error(start_index, start_line, start_column, "expected '||'"));
                }
            }
            '"' => self.string_literal(start_index, start_line, start_column)?,
            c if c.is_ascii_digit() => self.number(start_index, start_line, start_column)?,
            c if c.is_alphabetic() || c == '_' => self.identifier(start_index),
            c => {
                return Err(self.error(
                    start_index,
                    start_line,
                    start_column,
                    format!("unexpected character '{}'", c),
                ));
            }
        };

        Ok(Token {
            kind,
            pos: self.span(start_index, start_line, start_column),
        })
    }

    fn string_literal(
        &mut self,
        start_index: usize,
        start_line: usize,
        start_column: usize,
    ) -> AlthreadResult<TokenKind> {
        let mut value = String::new();
        loop {
            if self.at_end() {
                return Err(self.error(start_index, start_line, start_column, "unterminated string"));
            }
            match self.advance() {
                '"' => return Ok(TokenKind::Str(value)),
                '\\' => {
                    if self.at_end() {
                        return Err(self.error(
                            start_index,
                            start_line,
                            start_column,
                            "unterminated string",
                        ));
                    }
                    match self.advance() {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '\\' => value.push('\\'),
                        '"' => value.push('"'),
                        c => {
                            return Err(self.error(
                                start_index,
                                start_line,
                                start_column,
                                format!("unknown escape '\\{}'", c),
                            ));
                        }
                    }
                }
                '\n' => {
                    return Err(self.error(
                        start_index,
                        start_line,
                        start_column,
                        "newline in string literal",
                    ));
                }
                c => value.push(c),
            }
        }
    }

    fn number(
        &mut self,
        start_index: usize,
        start_line: usize,
        start_column: usize,
    ) -> AlthreadResult<TokenKind> {
        while !self.at_end() && self.peek().is_ascii_digit() {
            self.advance();
        }
        // A digit run followed by ".." is a range bound, not a malformed
        // float; anything else after '.' is rejected since the language has
        // no floats.
        if !self.at_end() && self.peek() == '.' && self.peek_at(1) != Some('.') {
            return Err(self.error(
                start_index,
                start_line,
                start_column,
                "floating point literals are not supported",
            ));
        }
        let text = self.slice(start_index, self.index);
        match text.parse::<i64>() {
            Ok(n) => Ok(TokenKind::Int(n)),
            Err(_) => Err(self.error(
                start_index,
                start_line,
                start_column,
                format!("integer literal '{}' out of range", text),
            )),
        }
    }

    fn identifier(&mut self, start_index: usize) -> TokenKind {
        while !self.at_end() && (self.peek().is_alphanumeric() || self.peek() == '_') {
            self.advance();
        }
        let text = self.slice(start_index, self.index);
        if let Some(keyword) = TokenKind::keyword(&text) {
            return keyword;
        }
        let first = text.chars().next().unwrap_or('_');
        if first.is_uppercase() {
            TokenKind::UpperIdent(text)
        } else {
            TokenKind::Ident(text)
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            while !self.at_end() && self.peek().is_whitespace() {
                self.advance();
            }
            // Line comments
            if !self.at_end() && self.peek() == '/' && self.peek_at(1) == Some('/') {
                while !self.at_end() && self.peek() != '\n' {
                    self.advance();
                }
                continue;
            }
            break;
        }
    }

    fn advance(&mut self) -> char {
        let ch = self.chars[self.index];
        self.index += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        ch
    }

    fn eat(&mut self, expected: char) -> bool {
        if !self.at_end() && self.peek() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn peek(&self) -> char {
        self.chars[self.index]
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.index + ahead).copied()
    }

    fn at_end(&self) -> bool {
        self.index >= self.chars.len()
    }

    fn byte_offset(&self, index: usize) -> usize {
        self.offsets
            .get(index)
            .copied()
            .unwrap_or(self.input.len())
    }

    fn slice(&self, start: usize, end: usize) -> String {
        self.input[self.byte_offset(start)..self.byte_offset(end)].to_string()
    }

    fn span(&self, start_index: usize, line: usize, column: usize) -> Pos {
        Pos {
            file: self.file.clone(),
            start: self.byte_offset(start_index),
            end: self.byte_offset(self.index),
            line,
            column,
        }
    }

    fn pos_here(&self) -> Pos {
        Pos {
            file: self.file.clone(),
            start: self.byte_offset(self.index),
            end: self.byte_offset(self.index),
            line: self.line,
            column: self.column,
        }
    }

    fn error(
        &self,
        start_index: usize,
        line: usize,
        column: usize,
        message: impl Into<String>,
    ) -> AlthreadError {
        AlthreadError::new(ErrorKind::Lex, self.span_from(start_index, line, column), message)
    }

    fn span_from(&self, start_index: usize, line: usize, column: usize) -> Pos {
        Pos {
            file: self.file.clone(),
            start: self.byte_offset(start_index),
            end: self.byte_offset(self.index),
            line,
            column,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new("test.alt", src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_identifier_classes() {
        let tokens = kinds("counter Counter _x");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Ident("counter".into()),
                TokenKind::UpperIdent("Counter".into()),
                TokenKind::Ident("_x".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_operators() {
        let tokens = kinds("wait until C == 2;");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Wait,
                TokenKind::Until,
                TokenKind::UpperIdent("C".into()),
                TokenKind::EqEq,
                TokenKind::Int(2),
                TokenKind::Semi,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_range_is_not_a_float() {
        let tokens = kinds("0..10");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Int(0),
                TokenKind::DotDot,
                TokenKind::Int(10),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let tokens = kinds(r#""a\nb""#);
        assert_eq!(tokens[0], TokenKind::Str("a\nb".into()));
    }

    #[test]
    fn test_comments_skipped() {
        let tokens = kinds("1 // comment\n2");
        assert_eq!(
            tokens,
            vec![TokenKind::Int(1), TokenKind::Int(2), TokenKind::Eof]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = Lexer::new("test.alt", "let x = 1;").tokenize().unwrap();
        assert_eq!(tokens[1].pos.line, 1);
        assert_eq!(tokens[1].pos.column, 5);
        assert_eq!(tokens[1].pos.start, 4);
        assert_eq!(tokens[1].pos.end, 5);
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("test.alt", "\"abc").tokenize().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Lex);
    }
}
