//! Scans an input string (depfile contents) character by character.

use std::path::Path;

#[derive(Debug)]
pub struct ParseError {
    msg: String,
    ofs: usize,
}
pub type ParseResult<T> = Result<T, ParseError>;

/// A cursor over a string.  Reading past the end yields '\0', so callers can
/// treat end of input like a terminator without the buffer carrying one.
pub struct Scanner<'a> {
    buf: &'a str,
    pub ofs: usize,
    pub line: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(buf: &'a str) -> Self {
        Scanner {
            buf,
            ofs: 0,
            line: 1,
        }
    }

    /// Slice of the input; only ever called with offsets of ASCII delimiters,
    /// which are always on char boundaries.
    pub fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.buf[start.min(self.buf.len())..end.min(self.buf.len())]
    }

    pub fn peek(&self) -> char {
        match self.buf.as_bytes().get(self.ofs) {
            Some(&b) => b as char,
            None => '\0',
        }
    }

    pub fn at_end(&self) -> bool {
        self.ofs >= self.buf.len()
    }

    pub fn next(&mut self) {
        if self.peek() == '\n' {
            self.line += 1;
        }
        self.ofs += 1;
    }

    pub fn back(&mut self) {
        if self.ofs == 0 {
            panic!("back at start")
        }
        self.ofs -= 1;
        if self.peek() == '\n' {
            self.line -= 1;
        }
    }

    pub fn read(&mut self) -> char {
        let c = self.peek();
        self.next();
        c
    }

    pub fn skip(&mut self, ch: char) -> bool {
        if self.peek() == ch {
            self.next();
            return true;
        }
        false
    }

    pub fn expect(&mut self, ch: char) -> ParseResult<()> {
        let r = self.read();
        if r != ch {
            self.back();
            return self.parse_error(format!("expected {:?}, got {:?}", ch, r));
        }
        Ok(())
    }

    pub fn parse_error<T, S: Into<String>>(&self, msg: S) -> ParseResult<T> {
        Err(ParseError {
            msg: msg.into(),
            ofs: self.ofs,
        })
    }

    /// Render an error with the offending line and a caret under the column.
    pub fn format_parse_error(&self, filename: &Path, err: ParseError) -> String {
        let mut ofs = 0;
        for (line_number, line) in self.buf.split('\n').enumerate() {
            if ofs + line.len() >= err.ofs {
                let col = err.ofs - ofs;
                let prefix = format!("{}:{}: ", filename.display(), line_number + 1);
                let mut context: String = line.chars().take(60).collect();
                if context.len() < line.len() {
                    context.push_str("...");
                }
                return format!(
                    "{}\n{}{}\n{}^",
                    err.msg,
                    prefix,
                    context,
                    " ".repeat(prefix.len() + col.min(60))
                );
            }
            ofs += line.len() + 1;
        }
        format!("{}: {} (at end of input)", filename.display(), err.msg)
    }
}
