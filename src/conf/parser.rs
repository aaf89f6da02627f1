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

//! Directive parser
//!
//! Turns the token stream into a [`Directive`] tree. `include PATTERN;` is
//! expanded here, in place, so later consumers never see it: the pattern may
//! be a glob, matches are parsed in sorted order, and relative patterns
//! resolve against the including file's directory.

use std::path::{Path, PathBuf};

use super::lexer::{Lexer, Located, Token};
use super::{ConfError, Directive};

/// Parse directives given on the command line (`-g`). Includes resolve
/// against the working directory.
pub fn parse_str(source: &str, origin: &str) -> Result<Vec<Directive>, ConfError> {
    let tokens = Lexer::new(source, origin).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        file: origin.to_owned(),
        dir: PathBuf::from("."),
    };
    parser.block(0, false)
}

/// Parse a configuration file and all of its includes into a directive tree.
pub fn parse_file(path: &Path) -> Result<Vec<Directive>, ConfError> {
    let display = path.display().to_string();
    let source = std::fs::read_to_string(path).map_err(|source| ConfError::Io {
        file: display.clone(),
        source,
    })?;
    let tokens = Lexer::new(&source, &display).tokenize()?;

    let mut parser = Parser {
        tokens,
        pos: 0,
        file: display,
        dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    let directives = parser.block(0, false)?;
    Ok(directives)
}

struct Parser {
    tokens: Vec<(Token, Located)>,
    pos: usize,
    file: String,
    dir: PathBuf,
}

impl Parser {
    fn err(&self, line: usize, msg: impl Into<String>) -> ConfError {
        ConfError::Syntax {
            file: self.file.clone(),
            line,
            msg: msg.into(),
        }
    }

    fn next(&mut self) -> Option<(Token, Located)> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    /// Parse directives until end of input, or until the `}` closing the
    /// block this call was entered for.
    fn block(&mut self, open_line: usize, nested: bool) -> Result<Vec<Directive>, ConfError> {
        let mut directives = Vec::new();

        loop {
            let Some((token, loc)) = self.next() else {
                if nested {
                    return Err(self.err(open_line, "unexpected end of file, expecting \"}\""));
                }
                return Ok(directives);
            };

            let name = match token {
                Token::Word(w) => w,
                Token::BlockEnd if nested => return Ok(directives),
                Token::BlockEnd => {
                    return Err(self.err(loc.line, "unexpected \"}\""));
                }
                Token::BlockStart => {
                    return Err(self.err(loc.line, "unexpected \"{\""));
                }
                Token::End => {
                    return Err(self.err(loc.line, "unexpected \";\""));
                }
            };

            let mut args = Vec::new();
            let directive = loop {
                match self.next() {
                    Some((Token::Word(w), _)) => args.push(w),
                    Some((Token::End, _)) => {
                        break Directive {
                            name,
                            args,
                            block: None,
                            file: self.file.clone(),
                            line: loc.line,
                        };
                    }
                    Some((Token::BlockStart, inner_loc)) => {
                        let inner = self.block(inner_loc.line, true)?;
                        break Directive {
                            name,
                            args,
                            block: Some(inner),
                            file: self.file.clone(),
                            line: loc.line,
                        };
                    }
                    Some((Token::BlockEnd, l)) => {
                        return Err(self.err(l.line, format!("unexpected \"}}\" in \"{}\"", name)));
                    }
                    None => {
                        return Err(self
                            .err(loc.line, format!("unexpected end of file in \"{}\"", name)));
                    }
                }
            };

            if directive.name == "include" && directive.block.is_none() {
                self.include(&directive, &mut directives)?;
            } else {
                directives.push(directive);
            }
        }
    }

    /// Splice the files matched by an `include` pattern, order-preserving:
    /// matches are sorted, each file's directives land where the `include`
    /// stood.
    fn include(&self, d: &Directive, out: &mut Vec<Directive>) -> Result<(), ConfError> {
        d.expect_args(1)?;
        let pattern = self.dir.join(&d.args[0]);
        let pattern_str = pattern.to_string_lossy();

        if !pattern_str.contains(['*', '?', '[']) {
            out.extend(parse_file(&pattern)?);
            return Ok(());
        }

        let mut matches: Vec<PathBuf> = glob::glob(&pattern_str)
            .map_err(|_| ConfError::IncludePattern(d.args[0].clone()))?
            .filter_map(Result::ok)
            .collect();
        matches.sort();

        for path in matches {
            out.extend(parse_file(&path)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::parse_file;
    use crate::conf::{dump, Directive};

    fn write_conf(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).expect("create conf");
        f.write_all(body.as_bytes()).expect("write conf");
        path
    }

    fn strip_origin(mut directives: Vec<Directive>) -> Vec<Directive> {
        for d in &mut directives {
            d.file = String::new();
            d.line = 0;
            if let Some(block) = d.block.take() {
                d.block = Some(strip_origin(block));
            }
        }
        directives
    }

    #[test]
    fn nested_blocks_parse_into_a_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_conf(
            dir.path(),
            "vakt.conf",
            "events { worker_connections 512; }\nhttp { server { listen 8080; } }\n",
        );

        let tree = parse_file(&path).expect("parse");
        assert_eq!(2, tree.len());
        let http = &tree[1];
        let server = &http.block.as_ref().expect("block")[0];
        assert_eq!("server", server.name);
        assert_eq!(
            "listen",
            server.block.as_ref().expect("server block")[0].name
        );
    }

    #[test]
    fn include_glob_splices_in_sorted_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("conf.d")).expect("mkdir");
        write_conf(dir.path(), "conf.d/b.conf", "daemon off;\n");
        write_conf(dir.path(), "conf.d/a.conf", "worker_processes 2;\n");
        let path = write_conf(dir.path(), "vakt.conf", "include conf.d/*.conf;\npid run.pid;\n");

        let tree = parse_file(&path).expect("parse");
        let names: Vec<&str> = tree.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(vec!["worker_processes", "daemon", "pid"], names);
    }

    #[test]
    fn include_error_names_the_included_file_and_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("conf.d")).expect("mkdir");
        write_conf(
            dir.path(),
            "conf.d/broken.conf",
            "# one\n# two\n# three\n# four\n# five\n# six\nlisten 8080\n",
        );
        let path = write_conf(dir.path(), "vakt.conf", "include conf.d/*.conf;\n");

        let err = parse_file(&path).expect_err("must fail");
        let msg = err.to_string();
        assert!(msg.contains("broken.conf"), "got: {}", msg);
        assert!(msg.contains(":7"), "got: {}", msg);
    }

    #[test]
    fn dump_reparses_to_an_equivalent_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_conf(
            dir.path(),
            "vakt.conf",
            "error_log logs/error.log info;\nhttp {\n  server {\n    listen 8080;\n    location / { return 204 \"no content\"; }\n  }\n}\n",
        );

        let first = parse_file(&path).expect("parse");
        let dumped = write_conf(dir.path(), "dumped.conf", &dump(&first));
        let second = parse_file(&dumped).expect("reparse");

        assert_eq!(strip_origin(first), strip_origin(second));
    }

    #[test]
    fn stray_close_brace_is_a_syntax_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_conf(dir.path(), "vakt.conf", "events { }\n}\n");
        assert!(parse_file(&path).is_err());
    }
}
