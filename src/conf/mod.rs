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

//! Configuration tree
//!
//! A configuration file is a nested list of directives: a name, arguments,
//! and either a `;` or a `{ ... }` block. The parser produces a [`Directive`]
//! tree with `include` files spliced in place; the typed schema in
//! [`schema`] is built by walking the tree.

use thiserror::Error;

pub mod lexer;
pub mod parser;
pub mod schema;

pub use parser::{parse_file, parse_str};
pub use schema::Conf;

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("{file}:{line}: {msg}")]
    Syntax {
        file: String,
        line: usize,
        msg: String,
    },
    #[error("cannot read {file}: {source}")]
    Io {
        file: String,
        source: std::io::Error,
    },
    #[error("invalid include pattern \"{0}\"")]
    IncludePattern(String),
}

/// One parsed directive. `block` is `Some` for `name args { ... }` and
/// `None` for `name args;`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub args: Vec<String>,
    pub block: Option<Vec<Directive>>,
    pub file: String,
    pub line: usize,
}

impl Directive {
    /// First argument, when present.
    pub fn arg(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    fn err(&self, msg: impl Into<String>) -> ConfError {
        ConfError::Syntax {
            file: self.file.clone(),
            line: self.line,
            msg: msg.into(),
        }
    }

    /// Require exactly `n` arguments.
    pub fn expect_args(&self, n: usize) -> Result<(), ConfError> {
        if self.args.len() != n {
            return Err(self.err(format!(
                "directive \"{}\" takes {} argument{}",
                self.name,
                n,
                if n == 1 { "" } else { "s" }
            )));
        }
        Ok(())
    }

    /// Parse `on`/`off`.
    pub fn flag(&self) -> Result<bool, ConfError> {
        self.expect_args(1)?;
        match self.args[0].as_str() {
            "on" => Ok(true),
            "off" => Ok(false),
            other => Err(self.err(format!(
                "invalid value \"{}\" in \"{}\", it must be \"on\" or \"off\"",
                other, self.name
            ))),
        }
    }

    /// Parse a decimal count argument.
    pub fn uint(&self) -> Result<u64, ConfError> {
        self.expect_args(1)?;
        self.args[0]
            .parse()
            .map_err(|_| self.err(format!("invalid number \"{}\"", self.args[0])))
    }

    /// Parse a size with optional `k`/`m`/`g` suffix.
    pub fn size(&self) -> Result<u64, ConfError> {
        self.expect_args(1)?;
        parse_size(&self.args[0]).ok_or_else(|| self.err(format!("invalid size \"{}\"", self.args[0])))
    }

    /// Parse a duration in milliseconds; a bare number means seconds, with
    /// `ms`/`s`/`m`/`h`/`d` suffixes understood.
    pub fn msec(&self) -> Result<u64, ConfError> {
        self.expect_args(1)?;
        parse_msec(&self.args[0]).ok_or_else(|| self.err(format!("invalid time \"{}\"", self.args[0])))
    }
}

pub fn parse_size(s: &str) -> Option<u64> {
    let (digits, mult) = match s.as_bytes().last()? {
        b'k' | b'K' => (&s[..s.len() - 1], 1024),
        b'm' | b'M' => (&s[..s.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    digits.parse::<u64>().ok().map(|n| n * mult)
}

pub fn parse_msec(s: &str) -> Option<u64> {
    let (digits, mult) = if let Some(d) = s.strip_suffix("ms") {
        (d, 1)
    } else if let Some(d) = s.strip_suffix('s') {
        (d, 1000)
    } else if let Some(d) = s.strip_suffix('m') {
        (d, 60 * 1000)
    } else if let Some(d) = s.strip_suffix('h') {
        (d, 60 * 60 * 1000)
    } else if let Some(d) = s.strip_suffix('d') {
        (d, 24 * 60 * 60 * 1000)
    } else {
        (s, 1000)
    };
    digits.parse::<u64>().ok().map(|n| n * mult)
}

/// Render a directive tree back to re-parseable source. `vakt -T` prints
/// this; parsing the dump yields an equivalent tree.
pub fn dump(directives: &[Directive]) -> String {
    let mut out = String::new();
    dump_level(directives, 0, &mut out);
    out
}

fn dump_level(directives: &[Directive], depth: usize, out: &mut String) {
    for d in directives {
        for _ in 0..depth {
            out.push_str("    ");
        }
        out.push_str(&quote_word(&d.name));
        for arg in &d.args {
            out.push(' ');
            out.push_str(&quote_word(arg));
        }
        match &d.block {
            Some(inner) => {
                out.push_str(" {\n");
                dump_level(inner, depth + 1, out);
                for _ in 0..depth {
                    out.push_str("    ");
                }
                out.push_str("}\n");
            }
            None => out.push_str(";\n"),
        }
    }
}

fn quote_word(word: &str) -> String {
    let plain = !word.is_empty()
        && !word
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '{' | '}' | ';' | '#' | '"' | '\''));
    if plain {
        return word.to_owned();
    }

    let mut quoted = String::with_capacity(word.len() + 2);
    quoted.push('"');
    for c in word.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\t' => quoted.push_str("\\t"),
            '\r' => quoted.push_str("\\r"),
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sizes_understand_binary_suffixes() {
        assert_eq!(Some(512), parse_size("512"));
        assert_eq!(Some(512 * 1024), parse_size("512k"));
        assert_eq!(Some(2 * 1024 * 1024), parse_size("2M"));
        assert_eq!(None, parse_size("2x"));
    }

    #[test]
    fn times_default_to_seconds() {
        assert_eq!(Some(75_000), parse_msec("75"));
        assert_eq!(Some(250), parse_msec("250ms"));
        assert_eq!(Some(60_000), parse_msec("1m"));
    }

    #[test]
    fn dump_quotes_words_that_need_it() {
        let d = Directive {
            name: "return".into(),
            args: vec!["204".into(), "no content".into()],
            block: None,
            file: "t.conf".into(),
            line: 1,
        };
        assert_eq!("return 204 \"no content\";\n", dump(&[d]));
    }
}
