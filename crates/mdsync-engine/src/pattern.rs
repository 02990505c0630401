use regex_lite::Regex;

use crate::error::{EngineError, EngineResult};

/// Shell-style branch glob (`*`, `?`, `[...]`, `[!...]`) matched against
/// whole branch names.
#[derive(Debug, Clone)]
pub struct BranchPattern {
    glob: String,
    regex: Regex,
}

impl BranchPattern {
    pub fn new(glob: &str) -> EngineResult<Self> {
        let regex = Regex::new(&translate(glob)).map_err(|e| EngineError::Pattern {
            pattern: glob.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn matches(&self, branch: &str) -> bool {
        self.regex.is_match(branch)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }
}

fn translate(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    out.push('[');
                    let mut body = &chars[i + 1..end];
                    if let Some(('!', rest)) = body.split_first() {
                        out.push('^');
                        body = rest;
                    }
                    for &c in body {
                        if matches!(c, '\\' | '[' | ']' | '^') {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push(']');
                    i = end;
                }
                None => out.push_str("\\["),
            },
            c => out.push_str(&regex_lite::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}

/// Index of the `]` closing the class opened at `start`. A `]` directly
/// after `[` or `[!` is a literal member.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    if chars.get(i) == Some(&'!') {
        i += 1;
    }
    if chars.get(i) == Some(&']') {
        i += 1;
    }
    (i..chars.len()).find(|&j| chars[j] == ']')
}
