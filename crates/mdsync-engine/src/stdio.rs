//! Framing of the engine's `automate stdio` channel.
//!
//! A request is `l<len>:<word><len>:<word>...e`. The answer arrives as one
//! or more chunks `<cmd>:<status>:<more>:<size>:<payload>`; a `more` flag
//! of `m` means another chunk of the same answer follows.

use std::io::BufRead;

use crate::error::{EngineError, EngineResult};

pub fn encode_request(words: &[&str]) -> Vec<u8> {
    let mut out = Vec::from(&b"l"[..]);
    for word in words {
        out.extend_from_slice(format!("{}:", word.len()).as_bytes());
        out.extend_from_slice(word.as_bytes());
    }
    out.push(b'e');
    out
}

/// One chunk of an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub cmd: u64,
    pub status: u32,
    pub more: bool,
    pub payload: Vec<u8>,
}

/// A complete answer: the final status and every chunk's payload joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub status: u32,
    pub payload: Vec<u8>,
}

fn read_field<R: BufRead>(reader: &mut R) -> EngineResult<String> {
    let mut buf = Vec::new();
    reader.read_until(b':', &mut buf)?;
    if buf.pop() != Some(b':') {
        return Err(EngineError::Stdio("output ended inside a chunk header".into()));
    }
    String::from_utf8(buf).map_err(|_| EngineError::Stdio("non-UTF-8 chunk header".into()))
}

fn number<T: std::str::FromStr>(field: &str, what: &str) -> EngineResult<T> {
    field
        .trim()
        .parse()
        .map_err(|_| EngineError::Stdio(format!("bad {what} field {field:?}")))
}

pub fn read_chunk<R: BufRead>(reader: &mut R) -> EngineResult<Chunk> {
    let cmd = number(&read_field(reader)?, "command number")?;
    let status = number(&read_field(reader)?, "status")?;
    let more = read_field(reader)? == "m";
    let size: usize = number(&read_field(reader)?, "size")?;
    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).map_err(|e| {
        EngineError::Stdio(format!("expected {size} payload bytes: {e}"))
    })?;
    Ok(Chunk {
        cmd,
        status,
        more,
        payload,
    })
}

pub fn read_answer<R: BufRead>(reader: &mut R) -> EngineResult<Answer> {
    let mut payload = Vec::new();
    loop {
        let chunk = read_chunk(reader)?;
        payload.extend_from_slice(&chunk.payload);
        if !chunk.more {
            return Ok(Answer {
                status: chunk.status,
                payload,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_is_length_prefixed() {
        assert_eq!(encode_request(&["heads", "net.example"]), b"l5:heads11:net.examplee");
        assert_eq!(encode_request(&["branches"]), b"l8:branchese");
    }

    #[test]
    fn single_chunk_answer() {
        let mut input = Cursor::new(b"0:0:l:7:abc\ndef".to_vec());
        let answer = read_answer(&mut input).unwrap();
        assert_eq!(answer.status, 0);
        assert_eq!(answer.payload, b"abc\ndef");
    }

    #[test]
    fn multi_chunk_answer_is_joined() {
        let mut input = Cursor::new(b"3:0:m:2:ab3:0:m:1:c3:0:l:0:".to_vec());
        let answer = read_answer(&mut input).unwrap();
        assert_eq!(answer.payload, b"abc");
    }

    #[test]
    fn payload_may_contain_colons() {
        let mut input = Cursor::new(b"1:2:l:5:a:b:c".to_vec());
        let answer = read_answer(&mut input).unwrap();
        assert_eq!(answer.status, 2);
        assert_eq!(answer.payload, b"a:b:c");
    }

    #[test]
    fn truncated_output_is_an_error() {
        let mut input = Cursor::new(b"1:0:l:10:short".to_vec());
        assert!(matches!(read_answer(&mut input), Err(EngineError::Stdio(_))));
        let mut input = Cursor::new(b"1:0".to_vec());
        assert!(matches!(read_answer(&mut input), Err(EngineError::Stdio(_))));
    }

    #[test]
    fn garbage_header_is_an_error() {
        let mut input = Cursor::new(b"x:0:l:0:".to_vec());
        assert!(matches!(read_chunk(&mut input), Err(EngineError::Stdio(_))));
    }
}
