use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use mdsync_types::RecordId;
use tracing::{debug, info, warn};

use crate::engine::{Engine, KeyInfo, PacketSink};
use crate::error::{EngineError, EngineResult};
use crate::packet;
use crate::stdio;

/// Collect a child's stderr on a side thread so a chatty engine never
/// blocks on a full pipe.
fn drain<R: Read + Send + 'static>(mut stream: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        buf
    })
}

fn join_stderr(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).trim().to_string())
        .unwrap_or_default()
}

fn parse_ids(payload: &[u8]) -> EngineResult<Vec<RecordId>> {
    String::from_utf8_lossy(payload)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| RecordId::from_hex(l).map_err(|e| EngineError::BasicIo(format!("bad identifier {l:?}: {e}"))))
        .collect()
}

struct Automate {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl Automate {
    fn exchange(&mut self, words: &[&str]) -> EngineResult<stdio::Answer> {
        self.stdin.write_all(&stdio::encode_request(words))?;
        self.stdin.flush()?;
        stdio::read_answer(&mut self.stdout)
    }
}

/// Client for a `mtn`-compatible engine binary.
///
/// Queries go through one long-lived `automate stdio` process, started on
/// first use and stopped by [`MtnClient::stop`] or on drop. Commands that
/// are not available through automate run as separate processes; the
/// automate process is stopped first since both need the database.
pub struct MtnClient {
    executable: PathBuf,
    database: PathBuf,
    automate: Option<Automate>,
}

impl MtnClient {
    pub fn new(executable: impl Into<PathBuf>, database: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            database: database.into(),
            automate: None,
        }
    }

    pub fn database(&self) -> &Path {
        &self.database
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("--db").arg(&self.database);
        cmd
    }

    /// Create the database when it does not exist yet.
    pub fn ensure_db(&mut self) -> EngineResult<()> {
        if self.database.exists() {
            return Ok(());
        }
        info!(database = %self.database.display(), "creating database");
        self.run(&["db", "init"]).map(drop)
    }

    pub fn is_running(&self) -> bool {
        self.automate.is_some()
    }

    /// Start the automate process if it is not running.
    pub fn start(&mut self) -> EngineResult<()> {
        if self.automate.is_some() {
            return Ok(());
        }
        let mut child = self
            .command()
            .args(["automate", "stdio"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Process(format!("cannot start {}: {e}", self.executable.display())))?;
        let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            return Err(EngineError::Process("automate process without pipes".into()));
        };
        debug!(database = %self.database.display(), "started automate stdio");
        self.automate = Some(Automate {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr: Some(drain(stderr)),
        });
        Ok(())
    }

    /// Stop the automate process and wait for it to exit.
    pub fn stop(&mut self) -> EngineResult<()> {
        let Some(Automate {
            mut child,
            stdin,
            stdout,
            stderr,
        }) = self.automate.take()
        else {
            return Ok(());
        };
        drop(stdin);
        drop(stdout);
        let status = child.wait()?;
        let stderr = join_stderr(stderr);
        debug!(%status, "stopped automate stdio");
        if !status.success() {
            warn!(%status, %stderr, "automate process exited with an error");
        }
        Ok(())
    }

    /// One automate query; a non-zero status becomes [`EngineError::Command`].
    pub fn automate(&mut self, words: &[&str]) -> EngineResult<Vec<u8>> {
        self.start()?;
        let Some(automate) = self.automate.as_mut() else {
            return Err(EngineError::Process("automate process not running".into()));
        };
        let answer = match automate.exchange(words) {
            Ok(answer) => answer,
            Err(e) => {
                // The stream is out of step after a failed exchange.
                let _ = self.stop();
                return Err(e);
            }
        };
        if answer.status != 0 {
            return Err(EngineError::Command {
                command: words.join(" "),
                message: String::from_utf8_lossy(&answer.payload).trim().to_string(),
            });
        }
        Ok(answer.payload)
    }

    /// Run a one-off engine command and return its stdout.
    pub fn run(&mut self, args: &[&str]) -> EngineResult<Vec<u8>> {
        self.stop()?;
        let output = self
            .command()
            .args(args)
            .output()
            .map_err(|e| EngineError::Process(format!("cannot run {}: {e}", self.executable.display())))?;
        if !output.status.success() {
            return Err(EngineError::Command {
                command: args.join(" "),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn automate_ids(&mut self, words: &[&str]) -> EngineResult<Vec<RecordId>> {
        parse_ids(&self.automate(words)?)
    }

    fn with_ids(command: &str, ids: &[RecordId]) -> Vec<String> {
        std::iter::once(command.to_string())
            .chain(ids.iter().map(RecordId::to_hex))
            .collect()
    }
}

impl Drop for MtnClient {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "failed to stop automate process");
        }
    }
}

impl Engine for MtnClient {
    fn get_revision(&mut self, id: &RecordId) -> EngineResult<String> {
        let payload = self.automate(&["get_revision", &id.to_hex()])?;
        String::from_utf8(payload).map_err(|_| EngineError::BasicIo(format!("revision {id} is not UTF-8")))
    }

    fn revision_packet(&mut self, id: &RecordId) -> EngineResult<Vec<u8>> {
        self.automate(&["packet_for_rdata", &id.to_hex()])
    }

    fn file_packet(&mut self, id: &RecordId) -> EngineResult<Vec<u8>> {
        self.automate(&["packet_for_fdata", &id.to_hex()])
    }

    fn file_delta_packet(&mut self, old: &RecordId, new: &RecordId) -> EngineResult<Vec<u8>> {
        self.automate(&["packet_for_fdelta", &old.to_hex(), &new.to_hex()])
    }

    fn manifest_packet(&mut self, id: &RecordId) -> EngineResult<Vec<u8>> {
        self.automate(&["packet_for_mdata", &id.to_hex()])
    }

    fn manifest_delta_packet(&mut self, old: &RecordId, new: &RecordId) -> EngineResult<Vec<u8>> {
        self.automate(&["packet_for_mdelta", &old.to_hex(), &new.to_hex()])
    }

    fn cert_packets(&mut self, revision: &RecordId) -> EngineResult<Vec<Vec<u8>>> {
        let payload = self.automate(&["packets_for_certs", &revision.to_hex()])?;
        Ok(packet::split_packets(&payload))
    }

    fn pubkey_packet(&mut self, key: &str) -> EngineResult<Vec<u8>> {
        self.run(&["pubkey", key])
    }

    fn toposort(&mut self, ids: &[RecordId]) -> EngineResult<Vec<RecordId>> {
        let words = Self::with_ids("toposort", ids);
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        self.automate_ids(&words)
    }

    fn ancestors(&mut self, ids: &[RecordId]) -> EngineResult<Vec<RecordId>> {
        let words = Self::with_ids("ancestors", ids);
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        self.automate_ids(&words)
    }

    fn heads(&mut self, branch: &str) -> EngineResult<Vec<RecordId>> {
        self.automate_ids(&["heads", branch])
    }

    fn branches(&mut self) -> EngineResult<Vec<String>> {
        let payload = self.automate(&["branches"])?;
        Ok(String::from_utf8_lossy(&payload)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn select_all(&mut self) -> EngineResult<Vec<RecordId>> {
        self.automate_ids(&["select", "i:"])
    }

    fn keys(&mut self) -> EngineResult<Vec<KeyInfo>> {
        let payload = self.automate(&["keys"])?;
        KeyInfo::parse_listing(&String::from_utf8_lossy(&payload))
    }

    fn feeder(&mut self) -> EngineResult<Box<dyn PacketSink>> {
        self.stop()?;
        Ok(Box::new(MtnFeeder::new(self.executable.clone(), self.database.clone())))
    }
}

struct Reader {
    child: Child,
    stdin: ChildStdin,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

/// Streams packets into `mtn read`. The process starts with the first
/// packet, so an empty feed never touches the database.
pub struct MtnFeeder {
    executable: PathBuf,
    database: PathBuf,
    reader: Option<Reader>,
    written: u64,
}

impl MtnFeeder {
    pub fn new(executable: PathBuf, database: PathBuf) -> Self {
        Self {
            executable,
            database,
            reader: None,
            written: 0,
        }
    }

    fn reader(&mut self) -> EngineResult<&mut Reader> {
        if self.reader.is_none() {
            let mut child = Command::new(&self.executable)
                .arg("--db")
                .arg(&self.database)
                .arg("read")
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| EngineError::Process(format!("cannot start {} read: {e}", self.executable.display())))?;
            let (Some(stdin), Some(stderr)) = (child.stdin.take(), child.stderr.take()) else {
                let _ = child.kill();
                return Err(EngineError::Process("read process without pipes".into()));
            };
            debug!(database = %self.database.display(), "started engine read");
            self.reader = Some(Reader {
                child,
                stdin,
                stderr: Some(drain(stderr)),
            });
        }
        self.reader
            .as_mut()
            .ok_or_else(|| EngineError::Process("read process not running".into()))
    }
}

impl PacketSink for MtnFeeder {
    fn write(&mut self, packet: &[u8]) -> EngineResult<()> {
        self.reader()?.stdin.write_all(packet)?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> EngineResult<u64> {
        let Some(Reader {
            mut child,
            stdin,
            stderr,
        }) = self.reader.take()
        else {
            return Ok(0);
        };
        drop(stdin);
        let status = child.wait()?;
        let stderr = join_stderr(stderr);
        if !status.success() {
            return Err(EngineError::Process(format!("read exited with {status}: {stderr}")));
        }
        info!(packets = self.written, "engine read finished");
        Ok(self.written)
    }
}

impl Drop for MtnFeeder {
    fn drop(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            warn!("engine read dropped without finish, killing it");
            let _ = reader.child.kill();
            let _ = reader.child.wait();
        }
    }
}
