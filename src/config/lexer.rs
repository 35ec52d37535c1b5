//! Tokenizer for the config grammar
//!
//! Splits on whitespace, `{`, `}` and `;`. `#` starts a comment that runs to
//! the end of the line. Single- and double-quoted strings may contain any of
//! those, with `\` escaping the next character.

use super::parser::ErrorMessage;

use std::iter::Peekable;
use std::str::Chars;

/// No single word or quoted string may be longer than this, in bytes
pub const MAX_TOKEN_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Word(String),
    OpenBrace,
    CloseBrace,
    Semicolon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
    column: usize,
}

/// Splits `source` into tokens, or reports the first lexical error
pub fn tokenize(source: &str) -> Result<Vec<Token>, ErrorMessage> {
    let mut lexer = Lexer {
        chars: source.chars().peekable(),
        line: 1,
        column: 1,
    };

    let mut tokens = Vec::new();
    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }

    Ok(tokens)
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || c == '{' || c == '}' || c == ';'
}

impl<'a> Lexer<'a> {
    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        }
        else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, line: usize, column: usize, desc: String) -> ErrorMessage {
        ErrorMessage {
            desc: desc,
            line: line,
            column: column,
        }
    }

    /// Rejects bytes that have no business in a config file
    fn check_char(&self, c: char) -> Result<(), ErrorMessage> {
        if c == '\0' {
            return Err(self.error(self.line, self.column,
                                  String::from("null byte detected in configuration")));
        }
        if c.is_control() && c != '\n' && c != '\r' && c != '\t' {
            return Err(self.error(self.line, self.column,
                                  format!("unexpected character 0x{:02x}", c as u32)));
        }
        Ok(())
    }

    fn next_token(&mut self) -> Result<Option<Token>, ErrorMessage> {
        loop {
            let c = match self.chars.peek() {
                Some(&c) => c,
                None => return Ok(None),
            };
            self.check_char(c)?;

            let (line, column) = (self.line, self.column);
            let simple = |kind| Ok(Some(Token { kind: kind, line: line, column: column }));

            match c {
                _ if c.is_whitespace() => { self.bump(); },
                '#' => {
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                },
                '{' => { self.bump(); return simple(TokenKind::OpenBrace); },
                '}' => { self.bump(); return simple(TokenKind::CloseBrace); },
                ';' => { self.bump(); return simple(TokenKind::Semicolon); },
                '"' | '\'' => {
                    let word = self.quoted(c)?;
                    return simple(TokenKind::Word(word));
                },
                _ => {
                    let word = self.bare()?;
                    return simple(TokenKind::Word(word));
                }
            }
        }
    }

    fn bare(&mut self) -> Result<String, ErrorMessage> {
        let (line, column) = (self.line, self.column);
        let mut word = String::new();

        while let Some(&c) = self.chars.peek() {
            if is_delimiter(c) {
                break;
            }
            self.check_char(c)?;
            if c == '#' {
                return Err(self.error(self.line, self.column, format!(
                    "unexpected '#' in '{}': a comment must be separated by whitespace", word)));
            }
            word.push(c);
            self.bump();

            if word.len() > MAX_TOKEN_LEN {
                return Err(too_long(line, column));
            }
        }

        Ok(word)
    }

    fn quoted(&mut self, quote: char) -> Result<String, ErrorMessage> {
        let (line, column) = (self.line, self.column);
        let mut word = String::new();
        self.bump();

        loop {
            let c = match self.chars.peek() {
                Some(&c) => c,
                None => return Err(self.error(line, column,
                                              String::from("unterminated quote"))),
            };
            self.check_char(c)?;
            self.bump();

            if c == quote {
                break;
            }

            if c == '\\' {
                match self.chars.peek() {
                    Some(&escaped) => {
                        self.check_char(escaped)?;
                        word.push(escaped);
                        self.bump();
                    },
                    None => return Err(self.error(line, column,
                                                  String::from("unterminated quote"))),
                }
            }
            else {
                word.push(c);
            }

            if word.len() > MAX_TOKEN_LEN {
                return Err(too_long(line, column));
            }
        }

        match self.chars.peek() {
            Some(&c) if !is_delimiter(c) && c != '#' => {
                Err(self.error(self.line, self.column,
                               format!("unexpected character '{}' after closing quote", c)))
            },
            _ => Ok(word),
        }
    }
}

fn too_long(line: usize, column: usize) -> ErrorMessage {
    ErrorMessage {
        desc: format!("value too long: exceeds the {} byte length limit", MAX_TOKEN_LEN),
        line: line,
        column: column,
    }
}
