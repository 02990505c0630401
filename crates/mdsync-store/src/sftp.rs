//! SFTP-style remote directory reached through the system `ssh` client.
//!
//! Every operation runs a short POSIX shell script on the remote host, so
//! the user's ssh configuration, agent, and known-hosts handling apply
//! unchanged. Remote renames are not assumed to replace atomically, so `put`
//! moves the previous file to a backup before installing the new one and
//! [`WriteFs::rollback_interrupted_puts`] restores that backup when a put
//! was cut off between the two renames.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

use mdsync_types::ByteRange;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::ranges::{self, DEFAULT_MAX_GAP};
use crate::traits::{AppendHandle, RangeStream, ReadFs, WriteFs};

/// Exit status the fetch script uses for "no such file".
const MISSING_STATUS: i32 = 44;

/// Exit status of the ssh client itself when the connection fails.
const SSH_FAILURE_STATUS: i32 = 255;

/// Names handled per rollback invocation, keeping the command line short.
const ROLLBACK_BATCH: usize = 64;

/// Spans fetched per ranged-read invocation.
const SPAN_BATCH: usize = 256;

/// Connection parameters for one remote host.
#[derive(Clone, Debug, Default)]
pub struct SshTarget {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub known_hosts: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

impl SshTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            connect_timeout_secs: 10,
            ..Self::default()
        }
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    /// Arguments for `ssh` running `script` on the remote host.
    pub fn ssh_args(&self, script: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        if let Some(port) = self.port {
            args.push("-p".into());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".into());
            args.push(identity.display().to_string());
        }
        if let Some(known_hosts) = &self.known_hosts {
            args.push("-o".into());
            args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
            args.push("-o".into());
            args.push("StrictHostKeyChecking=yes".into());
        }
        args.push(self.destination());
        args.push(script.to_string());
        args
    }

    fn run(&self, script: &str, stdin: Option<&[u8]>) -> StoreResult<Output> {
        debug!(host = %self.host, script, "ssh");
        let mut child = Command::new("ssh")
            .args(self.ssh_args(script))
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StoreError::Transport(format!("failed to start ssh: {e}")))?;
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data)?;
        }
        let output = child.wait_with_output()?;
        if output.status.code() == Some(SSH_FAILURE_STATUS) {
            return Err(StoreError::Transport(format!(
                "ssh to {} failed: {}",
                self.host,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    fn run_checked(&self, script: &str, stdin: Option<&[u8]>) -> StoreResult<Vec<u8>> {
        let output = self.run(script, stdin)?;
        check(script, output)
    }
}

fn check(script: &str, output: Output) -> StoreResult<Vec<u8>> {
    if output.status.success() {
        return Ok(output.stdout);
    }
    Err(StoreError::Remote {
        command: script.to_string(),
        status: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Quote a word for a POSIX shell.
pub fn quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

pub fn fetch_script(path: &str) -> String {
    let p = quote(path);
    format!("if [ -f {p} ]; then cat {p}; else exit {MISSING_STATUS}; fi")
}

/// Concatenate each span's bytes on stdout, in order.
pub fn ranges_script(path: &str, spans: &[ByteRange]) -> String {
    let p = quote(path);
    spans
        .iter()
        .map(|s| format!("tail -c +{} {p} | head -c {}", s.offset + 1, s.length))
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn exists_script(path: &str) -> String {
    format!("if [ -e {} ]; then echo yes; else echo no; fi", quote(path))
}

pub fn size_script(path: &str) -> String {
    let p = quote(path);
    format!("if [ -f {p} ]; then wc -c < {p}; else echo 0; fi")
}

/// Write stdin to `<path>.new`, move the old file to `<path>.old`, install
/// the new file, then drop the backup.
pub fn put_script(path: &str) -> String {
    let p = quote(path);
    let new = quote(&format!("{path}.new"));
    let old = quote(&format!("{path}.old"));
    format!(
        "cat > {new} && {{ [ ! -e {p} ] || mv -f {p} {old}; }} && mv -f {new} {p} && rm -f {old}"
    )
}

/// Restore `<path>.old` when the target is missing; clear leftovers. Prints
/// `restored <path>` for every repaired file.
pub fn rollback_script(paths: &[String]) -> String {
    paths
        .iter()
        .map(|path| {
            let p = quote(path);
            let new = quote(&format!("{path}.new"));
            let old = quote(&format!("{path}.old"));
            format!(
                "if [ -e {old} ] && [ ! -e {p} ]; then mv -f {old} {p} && echo restored {p}; fi; rm -f {new} {old}"
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn mkdir_script(path: &str) -> String {
    let p = quote(path);
    format!(
        "if mkdir {p} 2>/dev/null; then echo created; elif [ -d {p} ]; then echo exists; else mkdir {p}; fi"
    )
}

/// A remote directory addressed as `sftp://[user@]host[:port]/path`.
#[derive(Clone, Debug)]
pub struct SftpFs {
    target: SshTarget,
    dir: String,
}

impl SftpFs {
    pub fn new(target: SshTarget, dir: impl Into<String>) -> Self {
        Self {
            target,
            dir: dir.into(),
        }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn path(&self, name: &str) -> String {
        if self.dir.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.dir.trim_end_matches('/'))
        }
    }
}

impl ReadFs for SftpFs {
    fn fetch(&self, names: &[String]) -> StoreResult<BTreeMap<String, Option<Vec<u8>>>> {
        let mut out = BTreeMap::new();
        for name in names {
            let script = fetch_script(&self.path(name));
            let output = self.target.run(&script, None)?;
            let data = if output.status.code() == Some(MISSING_STATUS) {
                None
            } else {
                Some(check(&script, output)?)
            };
            out.insert(name.clone(), data);
        }
        Ok(out)
    }

    fn fetch_ranges<'a>(&'a self, name: &str, ranges: &[ByteRange]) -> StoreResult<RangeStream<'a>> {
        let spans = ranges::coalesce(ranges, DEFAULT_MAX_GAP);
        let path = self.path(name);
        let mut parts = Vec::with_capacity(ranges.len());
        for batch in spans.chunks(SPAN_BATCH) {
            let covers: Vec<ByteRange> = batch.iter().map(|s| s.range).collect();
            let blob = self.target.run_checked(&ranges_script(&path, &covers), None)?;
            let mut pos = 0usize;
            for span in batch {
                let end = (pos + span.range.length as usize).min(blob.len());
                parts.extend(ranges::slice_span(span, &blob[pos..end])?);
                pos = end;
            }
        }
        debug!(name, ranges = ranges.len(), spans = spans.len(), "sftp ranged read");
        Ok(Box::new(parts.into_iter().map(Ok)))
    }

    fn exists(&self, name: &str) -> StoreResult<bool> {
        let out = self.target.run_checked(&exists_script(&self.path(name)), None)?;
        Ok(String::from_utf8_lossy(&out).trim() == "yes")
    }

    fn describe(&self) -> String {
        format!("sftp://{}/{}", self.target.destination(), self.dir)
    }
}

impl WriteFs for SftpFs {
    fn open_append(&self, name: &str) -> StoreResult<Box<dyn AppendHandle>> {
        Ok(Box::new(SftpAppender {
            target: self.target.clone(),
            path: self.path(name),
            buffer: Vec::new(),
        }))
    }

    fn size(&self, name: &str) -> StoreResult<u64> {
        let out = self.target.run_checked(&size_script(&self.path(name)), None)?;
        let text = String::from_utf8_lossy(&out);
        text.trim()
            .parse()
            .map_err(|_| StoreError::Transport(format!("unexpected size output {text:?}")))
    }

    fn put(&self, files: &[(String, Vec<u8>)]) -> StoreResult<()> {
        for (name, data) in files {
            self.target.run_checked(&put_script(&self.path(name)), Some(data))?;
        }
        Ok(())
    }

    fn rollback_interrupted_puts(&self, names: &[String]) -> StoreResult<()> {
        let paths: Vec<String> = names.iter().map(|n| self.path(n)).collect();
        for batch in paths.chunks(ROLLBACK_BATCH) {
            let out = self.target.run_checked(&rollback_script(batch), None)?;
            for line in String::from_utf8_lossy(&out).lines() {
                warn!(host = %self.target.host, "{line}");
            }
        }
        Ok(())
    }

    fn mkdir(&self, name: &str) -> StoreResult<bool> {
        let out = self.target.run_checked(&mkdir_script(&self.path(name)), None)?;
        Ok(String::from_utf8_lossy(&out).trim() == "created")
    }

    fn rmdir(&self, name: &str) -> StoreResult<()> {
        let script = format!("rmdir {}", quote(&self.path(name)));
        self.target.run_checked(&script, None)?;
        Ok(())
    }

    fn ensure_dir_exists(&self) -> StoreResult<()> {
        if self.dir.is_empty() {
            return Ok(());
        }
        let script = format!("mkdir -p {}", quote(&self.dir));
        self.target.run_checked(&script, None)?;
        Ok(())
    }
}

/// Buffers appended bytes and ships them with `cat >>` on flush.
struct SftpAppender {
    target: SshTarget,
    path: String,
    buffer: Vec<u8>,
}

impl AppendHandle for SftpAppender {
    fn write_all(&mut self, data: &[u8]) -> StoreResult<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> StoreResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let script = format!("cat >> {}", quote(&self.path));
        self.target.run_checked(&script, Some(&self.buffer))?;
        self.buffer.clear();
        Ok(())
    }
}
