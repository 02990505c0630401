//! Parser for the engine's "basic I/O" stanza format.
//!
//! ```text
//! new_manifest [0c5b...]
//!
//! patch "src/main.c"
//!  from [91a2...]
//!    to [e04f...]
//! ```
//!
//! Each line is a symbol followed by hex (`[...]`) or quoted-string values;
//! a blank line ends the stanza. Strings may span lines and escape `\` and
//! `"` with a backslash.

use std::iter::Peekable;
use std::str::Chars;

use mdsync_types::RecordId;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Hex(String),
    Str(String),
}

impl Value {
    pub fn as_str(&self) -> &str {
        match self {
            Value::Hex(s) | Value::Str(s) => s,
        }
    }

    /// The identifier held by a hex value; `None` for the empty `[]`.
    pub fn as_id(&self) -> EngineResult<Option<RecordId>> {
        match self {
            Value::Hex(s) if s.is_empty() => Ok(None),
            Value::Hex(s) => RecordId::from_hex(s)
                .map(Some)
                .map_err(|e| EngineError::BasicIo(format!("bad identifier [{s}]: {e}"))),
            Value::Str(s) => Err(EngineError::BasicIo(format!(
                "expected an identifier, found string {s:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub values: Vec<Value>,
}

impl Entry {
    pub fn first(&self) -> Option<&Value> {
        self.values.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stanza {
    pub entries: Vec<Entry>,
}

impl Stanza {
    /// Key of the first line, which names the stanza.
    pub fn kind(&self) -> &str {
        self.entries.first().map(|e| e.key.as_str()).unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn first_value(&self, key: &str) -> Option<&Value> {
        self.get(key).and_then(Entry::first)
    }

    /// The identifier stored under `key`, if the line is present and non-empty.
    pub fn id(&self, key: &str) -> EngineResult<Option<RecordId>> {
        match self.first_value(key) {
            Some(value) => value.as_id(),
            None => Ok(None),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Symbol(String),
    Value(Value),
    Break,
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
        }
    }

    fn tokens(mut self) -> EngineResult<Vec<Token>> {
        let mut tokens = Vec::new();
        let mut newlines = 0;
        while let Some(&c) = self.chars.peek() {
            match c {
                '\n' => {
                    self.chars.next();
                    newlines += 1;
                    if newlines == 2 {
                        tokens.push(Token::Break);
                    }
                }
                c if c.is_whitespace() => {
                    self.chars.next();
                }
                '[' => {
                    newlines = 0;
                    tokens.push(Token::Value(Value::Hex(self.hex()?)));
                }
                '"' => {
                    newlines = 0;
                    tokens.push(Token::Value(Value::Str(self.string()?)));
                }
                c if c.is_ascii_alphanumeric() || c == '_' => {
                    newlines = 0;
                    tokens.push(Token::Symbol(self.symbol()));
                }
                other => {
                    return Err(EngineError::BasicIo(format!("unexpected character {other:?}")));
                }
            }
        }
        Ok(tokens)
    }

    fn symbol(&mut self) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }
            out.push(c);
            self.chars.next();
        }
        out
    }

    fn hex(&mut self) -> EngineResult<String> {
        self.chars.next();
        let mut out = String::new();
        for c in self.chars.by_ref() {
            match c {
                ']' => return Ok(out),
                c if c.is_ascii_hexdigit() => out.push(c.to_ascii_lowercase()),
                other => {
                    return Err(EngineError::BasicIo(format!("non-hex character {other:?} in [...]")));
                }
            }
        }
        Err(EngineError::BasicIo("unterminated hex value".into()))
    }

    fn string(&mut self) -> EngineResult<String> {
        self.chars.next();
        let mut out = String::new();
        while let Some(c) = self.chars.next() {
            match c {
                '"' => return Ok(out),
                '\\' => match self.chars.next() {
                    Some(escaped @ ('\\' | '"')) => out.push(escaped),
                    Some(other) => {
                        return Err(EngineError::BasicIo(format!("bad escape \\{other}")));
                    }
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(EngineError::BasicIo("unterminated string".into()))
    }
}

/// Parse a whole basic I/O document into stanzas.
pub fn parse(text: &str) -> EngineResult<Vec<Stanza>> {
    let mut stanzas = Vec::new();
    let mut current = Stanza::default();
    for token in Lexer::new(text).tokens()? {
        match token {
            Token::Symbol(key) => current.entries.push(Entry {
                key,
                values: Vec::new(),
            }),
            Token::Value(value) => match current.entries.last_mut() {
                Some(entry) => entry.values.push(value),
                None => {
                    return Err(EngineError::BasicIo(format!(
                        "value {:?} without a key",
                        value.as_str()
                    )));
                }
            },
            Token::Break => {
                if !current.entries.is_empty() {
                    stanzas.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.entries.is_empty() {
        stanzas.push(current);
    }
    Ok(stanzas)
}

/// Render a string value with the format's escaping.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '\\' || c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
