//! Push-style incremental JSON decoder.
//!
//! Bytes are fed in arbitrary chunks; events come out as soon as the tokens
//! that produce them are complete.  Every event carries the structural path
//! of its value: object keys joined with '.', with `item` standing for any
//! array element.  For the progress stream this yields paths like
//! `cmds.item.cmd`, `cmds.item.cache` and `result`.

use crate::error::Error;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StartMap { path: String },
    EndMap { path: String },
    /// A string, number, boolean or null.
    Value { path: String, value: Value },
}

#[derive(Debug, PartialEq)]
enum Token {
    BeginMap,
    EndMap,
    BeginArray,
    EndArray,
    Colon,
    Comma,
    Str(String),
    Scalar(Value),
}

enum Lex {
    Idle,
    Str(StrState),
    /// Number or literal, terminated by a delimiter.
    Bare(String),
}

#[derive(Default)]
struct StrState {
    buf: Vec<u8>,
    escape: Escape,
    /// High half of a surrogate pair awaiting its low half.
    high_surrogate: Option<u16>,
}

#[derive(Default, Clone, Copy)]
enum Escape {
    #[default]
    None,
    Backslash,
    /// Hex digits of a \u escape read so far, and their value.
    Unicode(u8, u16),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Expect {
    Value,
    ValueOrEndArray,
    KeyOrEndMap,
    Key,
    Colon,
    CommaOrEnd,
    Done,
}

enum Frame {
    Map(Option<String>),
    Array,
}

pub struct Decoder {
    lex: Lex,
    expect: Expect,
    stack: Vec<Frame>,
    /// Bytes consumed so far, for error messages.
    ofs: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new()
    }
}

fn push_char(buf: &mut Vec<u8>, c: char) {
    let mut tmp = [0u8; 4];
    buf.extend_from_slice(c.encode_utf8(&mut tmp).as_bytes());
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            lex: Lex::Idle,
            expect: Expect::Value,
            stack: Vec::new(),
            ofs: 0,
        }
    }

    /// Whether a complete top-level value has been decoded.
    pub fn is_done(&self) -> bool {
        self.expect == Expect::Done
    }

    fn error<T>(&self, msg: impl std::fmt::Display) -> Result<T, Error> {
        Err(Error::parse(
            "json stream",
            format!("at byte {}: {}", self.ofs, msg),
        ))
    }

    fn path(&self) -> String {
        let mut path = String::new();
        for frame in &self.stack {
            let segment = match frame {
                Frame::Map(Some(key)) => key.as_str(),
                Frame::Map(None) => continue,
                Frame::Array => "item",
            };
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(segment);
        }
        path
    }

    pub fn feed(&mut self, bytes: &[u8], mut emit: impl FnMut(Event)) -> Result<(), Error> {
        for &b in bytes {
            self.byte(b, &mut emit)?;
            self.ofs += 1;
        }
        Ok(())
    }

    /// Signal end of input: flushes a pending top-level number or literal and
    /// checks the document is complete.
    pub fn finish(&mut self, mut emit: impl FnMut(Event)) -> Result<(), Error> {
        if let Lex::Bare(_) = self.lex {
            self.end_bare(&mut emit)?;
        }
        if !matches!(self.lex, Lex::Idle) || !self.is_done() {
            return self.error("unexpected end of input");
        }
        Ok(())
    }

    fn byte(&mut self, b: u8, emit: &mut impl FnMut(Event)) -> Result<(), Error> {
        match self.lex {
            Lex::Str(_) => return self.string_byte(b, emit),
            Lex::Bare(_) => match b {
                b' ' | b'\t' | b'\r' | b'\n' | b',' | b':' | b'}' | b']' => {
                    self.end_bare(emit)?;
                }
                _ => {
                    if let Lex::Bare(bare) = &mut self.lex {
                        bare.push(b as char);
                    }
                    return Ok(());
                }
            },
            Lex::Idle => {}
        }
        let token = match b {
            b' ' | b'\t' | b'\r' | b'\n' => return Ok(()),
            b'{' => Token::BeginMap,
            b'}' => Token::EndMap,
            b'[' => Token::BeginArray,
            b']' => Token::EndArray,
            b':' => Token::Colon,
            b',' => Token::Comma,
            b'"' => {
                self.lex = Lex::Str(StrState::default());
                return Ok(());
            }
            b'-' | b'0'..=b'9' | b'a'..=b'z' => {
                self.lex = Lex::Bare((b as char).to_string());
                return Ok(());
            }
            _ => return self.error(format!("unexpected byte {:?}", b as char)),
        };
        self.token(token, emit)
    }

    fn end_bare(&mut self, emit: &mut impl FnMut(Event)) -> Result<(), Error> {
        let bare = match std::mem::replace(&mut self.lex, Lex::Idle) {
            Lex::Bare(bare) => bare,
            _ => return Ok(()),
        };
        let value = match bare.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" => Value::Null,
            _ => match serde_json::from_str::<serde_json::Number>(&bare) {
                Ok(n) => Value::Number(n),
                Err(_) => return self.error(format!("bad token {:?}", bare)),
            },
        };
        self.token(Token::Scalar(value), emit)
    }

    fn string_byte(&mut self, b: u8, emit: &mut impl FnMut(Event)) -> Result<(), Error> {
        let state = match &mut self.lex {
            Lex::Str(state) => state,
            _ => return Ok(()),
        };
        match state.escape {
            Escape::None => match b {
                b'"' => {
                    if state.high_surrogate.take().is_some() {
                        push_char(&mut state.buf, char::REPLACEMENT_CHARACTER);
                    }
                    let buf = std::mem::take(&mut state.buf);
                    self.lex = Lex::Idle;
                    let s = match String::from_utf8(buf) {
                        Ok(s) => s,
                        Err(_) => return self.error("invalid utf-8 in string"),
                    };
                    return self.token(Token::Str(s), emit);
                }
                b'\\' => state.escape = Escape::Backslash,
                _ => {
                    if state.high_surrogate.take().is_some() {
                        push_char(&mut state.buf, char::REPLACEMENT_CHARACTER);
                    }
                    state.buf.push(b);
                }
            },
            Escape::Backslash => {
                let c = match b {
                    b'"' => '"',
                    b'\\' => '\\',
                    b'/' => '/',
                    b'b' => '\u{8}',
                    b'f' => '\u{c}',
                    b'n' => '\n',
                    b'r' => '\r',
                    b't' => '\t',
                    b'u' => {
                        state.escape = Escape::Unicode(0, 0);
                        return Ok(());
                    }
                    _ => return self.error(format!("bad escape \\{}", b as char)),
                };
                if state.high_surrogate.take().is_some() {
                    push_char(&mut state.buf, char::REPLACEMENT_CHARACTER);
                }
                push_char(&mut state.buf, c);
                state.escape = Escape::None;
            }
            Escape::Unicode(n, acc) => {
                let digit = match (b as char).to_digit(16) {
                    Some(d) => d as u16,
                    None => return self.error("bad \\u escape"),
                };
                let acc = (acc << 4) | digit;
                if n < 3 {
                    state.escape = Escape::Unicode(n + 1, acc);
                    return Ok(());
                }
                state.escape = Escape::None;
                match acc {
                    0xD800..=0xDBFF => {
                        if state.high_surrogate.replace(acc).is_some() {
                            push_char(&mut state.buf, char::REPLACEMENT_CHARACTER);
                        }
                    }
                    0xDC00..=0xDFFF => {
                        let c = match state.high_surrogate.take() {
                            Some(high) => {
                                let code = 0x10000
                                    + (((high as u32) - 0xD800) << 10)
                                    + ((acc as u32) - 0xDC00);
                                char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER)
                            }
                            None => char::REPLACEMENT_CHARACTER,
                        };
                        push_char(&mut state.buf, c);
                    }
                    _ => {
                        if state.high_surrogate.take().is_some() {
                            push_char(&mut state.buf, char::REPLACEMENT_CHARACTER);
                        }
                        let c = char::from_u32(acc as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
                        push_char(&mut state.buf, c);
                    }
                }
            }
        }
        Ok(())
    }

    /// Finish a value: the enclosing container decides what comes next.
    fn after_value(&mut self) {
        self.expect = if self.stack.is_empty() {
            Expect::Done
        } else {
            Expect::CommaOrEnd
        };
    }

    fn begin_value(&mut self, token: Token, emit: &mut impl FnMut(Event)) -> Result<(), Error> {
        match token {
            Token::BeginMap => {
                emit(Event::StartMap { path: self.path() });
                self.stack.push(Frame::Map(None));
                self.expect = Expect::KeyOrEndMap;
            }
            Token::BeginArray => {
                self.stack.push(Frame::Array);
                self.expect = Expect::ValueOrEndArray;
            }
            Token::Str(s) => {
                emit(Event::Value {
                    path: self.path(),
                    value: Value::String(s),
                });
                self.after_value();
            }
            Token::Scalar(value) => {
                emit(Event::Value {
                    path: self.path(),
                    value,
                });
                self.after_value();
            }
            token => return self.error(format!("expected value, got {:?}", token)),
        }
        Ok(())
    }

    fn end_map(&mut self, emit: &mut impl FnMut(Event)) {
        self.stack.pop();
        emit(Event::EndMap { path: self.path() });
        self.after_value();
    }

    fn set_key(&mut self, key: String) {
        if let Some(Frame::Map(slot)) = self.stack.last_mut() {
            *slot = Some(key);
        }
        self.expect = Expect::Colon;
    }

    fn token(&mut self, token: Token, emit: &mut impl FnMut(Event)) -> Result<(), Error> {
        match (self.expect, token) {
            (Expect::Value, token) => self.begin_value(token, emit)?,
            (Expect::ValueOrEndArray, Token::EndArray) => {
                self.stack.pop();
                self.after_value();
            }
            (Expect::ValueOrEndArray, token) => self.begin_value(token, emit)?,
            (Expect::KeyOrEndMap, Token::EndMap) => self.end_map(emit),
            (Expect::KeyOrEndMap | Expect::Key, Token::Str(key)) => self.set_key(key),
            (Expect::Colon, Token::Colon) => self.expect = Expect::Value,
            (Expect::CommaOrEnd, Token::Comma) => {
                self.expect = match self.stack.last() {
                    Some(Frame::Map(_)) => Expect::Key,
                    _ => Expect::Value,
                };
            }
            (Expect::CommaOrEnd, Token::EndMap) if matches!(self.stack.last(), Some(Frame::Map(_))) => {
                self.end_map(emit)
            }
            (Expect::CommaOrEnd, Token::EndArray) if matches!(self.stack.last(), Some(Frame::Array)) => {
                self.stack.pop();
                self.after_value();
            }
            (expect, token) => {
                return self.error(format!("unexpected {:?} (expected {:?})", token, expect))
            }
        }
        Ok(())
    }
}
