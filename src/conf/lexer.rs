// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration tokenizer
//!
//! Splits a configuration source into words and structural tokens. Words are
//! whitespace-delimited; single and double quotes preserve whitespace and
//! support the escapes `\"`, `\'`, `\\`, `\t`, `\r`, `\n`. `#` starts a
//! comment running to end of line. `$name` and `${name}` pass through
//! verbatim; variables are somebody else's business.

use std::iter::Peekable;
use std::str::Chars;

use super::ConfError;

/// Quoted words may not exceed this many bytes.
pub const MAX_QUOTED: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A bare or quoted word.
    Word(String),
    /// `{`
    BlockStart,
    /// `}`
    BlockEnd,
    /// `;`
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub line: usize,
}

pub struct Lexer<'a> {
    input: Peekable<Chars<'a>>,
    file: String,
    line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str, file: &str) -> Self {
        Self {
            input: input.chars().peekable(),
            file: file.to_owned(),
            line: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.input.next();
        if c == Some('\n') {
            self.line += 1;
        }
        c
    }

    fn err(&self, line: usize, msg: impl Into<String>) -> ConfError {
        ConfError::Syntax {
            file: self.file.clone(),
            line,
            msg: msg.into(),
        }
    }

    /// Produce the whole token stream with source lines attached.
    pub fn tokenize(&mut self) -> Result<Vec<(Token, Located)>, ConfError> {
        let mut tokens = Vec::new();

        while let Some(&c) = self.input.peek() {
            let loc = Located { line: self.line };
            match c {
                '#' => {
                    while let Some(&c) = self.input.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '{' => {
                    self.bump();
                    tokens.push((Token::BlockStart, loc));
                }
                '}' => {
                    self.bump();
                    tokens.push((Token::BlockEnd, loc));
                }
                ';' => {
                    self.bump();
                    tokens.push((Token::End, loc));
                }
                '"' | '\'' => {
                    let word = self.quoted(c)?;
                    tokens.push((Token::Word(word), loc));
                }
                c if c.is_whitespace() => {
                    self.bump();
                }
                _ => {
                    let word = self.bare();
                    tokens.push((Token::Word(word), loc));
                }
            }
        }

        Ok(tokens)
    }

    fn quoted(&mut self, quote: char) -> Result<String, ConfError> {
        let start = self.line;
        self.bump();
        let mut word = String::new();

        loop {
            let Some(c) = self.bump() else {
                return Err(self.err(start, "unexpected end of file in quoted string"));
            };
            if c == quote {
                return Ok(word);
            }
            let resolved = if c == '\\' {
                match self.bump() {
                    Some('"') => '"',
                    Some('\'') => '\'',
                    Some('\\') => '\\',
                    Some('t') => '\t',
                    Some('r') => '\r',
                    Some('n') => '\n',
                    Some(other) => {
                        return Err(
                            self.err(self.line, format!("unknown escape \"\\{}\"", other))
                        );
                    }
                    None => {
                        return Err(self.err(start, "unexpected end of file in quoted string"));
                    }
                }
            } else {
                c
            };
            word.push(resolved);
            if word.len() > MAX_QUOTED {
                return Err(self.err(start, "quoted string is too long"));
            }
        }
    }

    fn bare(&mut self) -> String {
        let mut word = String::new();
        while let Some(&c) = self.input.peek() {
            if c.is_whitespace() || matches!(c, '{' | '}' | ';' | '#' | '"' | '\'') {
                break;
            }
            word.push(c);
            self.bump();
        }
        word
    }
}

#[cfg(test)]
mod test {
    use super::{Lexer, Token};

    fn words(input: &str) -> Vec<Token> {
        Lexer::new(input, "test.conf")
            .tokenize()
            .expect("valid input")
            .into_iter()
            .map(|(t, _)| t)
            .collect()
    }

    #[test]
    fn simple_directive_tokenizes_into_words_and_end() {
        assert_eq!(
            vec![
                Token::Word("listen".into()),
                Token::Word("8080".into()),
                Token::End
            ],
            words("listen 8080;")
        );
    }

    #[test]
    fn block_tokens_delimit_nested_directives() {
        let tokens = words("events { worker_connections 512; }");
        assert_eq!(Token::BlockStart, tokens[1]);
        assert_eq!(Token::BlockEnd, tokens[5]);
    }

    #[test]
    fn comments_run_to_end_of_line() {
        assert_eq!(
            vec![Token::Word("daemon".into()), Token::Word("off".into()), Token::End],
            words("# leading comment\ndaemon off; # trailing")
        );
    }

    #[test]
    fn quotes_preserve_whitespace_and_escapes() {
        assert_eq!(
            vec![Token::Word("return 204".into()), Token::End],
            words(r#""return 204";"#)
        );
        assert_eq!(
            vec![Token::Word("a\"b\tc\n".into()), Token::End],
            words(r#"'a\"b\tc\n';"#)
        );
    }

    #[test]
    fn variables_pass_through_verbatim() {
        assert_eq!(
            vec![
                Token::Word("log_format".into()),
                Token::Word("$remote_addr".into()),
                Token::Word("${host}x".into()),
                Token::End
            ],
            words("log_format $remote_addr ${host}x;")
        );
    }

    #[test]
    fn unterminated_quote_reports_starting_line() {
        let err = Lexer::new("a \"unterminated", "t.conf")
            .tokenize()
            .expect_err("must fail");
        assert!(err.to_string().contains("t.conf"));
    }

    #[test]
    fn overlong_quoted_string_is_rejected() {
        let input = format!("\"{}\";", "x".repeat(super::MAX_QUOTED + 1));
        assert!(Lexer::new(&input, "t.conf").tokenize().is_err());
    }
}
