//! Subprocess Transport (C3): spawns and owns the assistant process, frames
//! its stdout into records, and serializes writes to its stdin (spec §4.3).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;

use crate::error::{Result, SdkError};
use crate::frame::{LineFramer, DEFAULT_MAX_BUFFER_BYTES};
use crate::process::{ProcessConfig, ProcessSupervisor, StderrCallback};
use crate::queue::{ConsumerQueue, QueueConsumer, DEFAULT_QUEUE_CAPACITY};

/// Configuration for a [`SubprocessTransport`].
pub struct TransportConfig {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub stderr_callback: Option<StderrCallback>,
    pub streaming: bool,
    pub sdk_version: String,
    pub minimum_version: Option<semver::Version>,
    pub max_buffer_bytes: usize,
    pub queue_capacity: usize,
}

impl TransportConfig {
    pub fn new(binary: impl Into<PathBuf>, sdk_version: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            stderr_callback: None,
            streaming: true,
            sdk_version: sdk_version.into(),
            minimum_version: None,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

struct Inner {
    config: TransportConfig,
    supervisor: Mutex<Option<ProcessSupervisor>>,
    stdin: Mutex<Option<ChildStdin>>,
    queue: ConsumerQueue,
    ready: AtomicBool,
    connecting: Mutex<()>,
    reader_taken: AtomicBool,
    closed: AtomicBool,
}

/// Owns the assistant child process end to end: spawn, line-framed reads,
/// serialized writes, and coordinated teardown.
pub struct SubprocessTransport {
    inner: Arc<Inner>,
}

impl SubprocessTransport {
    pub fn new(config: TransportConfig) -> Self {
        let queue = ConsumerQueue::new(config.queue_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                supervisor: Mutex::new(None),
                stdin: Mutex::new(None),
                queue,
                ready: AtomicBool::new(false),
                connecting: Mutex::new(()),
                reader_taken: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Spawns the child process and starts the background stdout reader.
    /// Idempotent: a second call while already connected is a no-op.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.inner.connecting.lock().await;
        if self.inner.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SdkError::IllegalState("transport already closed".into()));
        }

        crate::process::probe_version(
            &self.inner.config.binary,
            self.inner.config.minimum_version.as_ref(),
        )
        .await;

        let process_config = ProcessConfig {
            binary: self.inner.config.binary.clone(),
            args: self.inner.config.args.clone(),
            env: self.inner.config.env.clone(),
            working_dir: self.inner.config.working_dir.clone(),
            stderr_callback: self.inner.config.stderr_callback.clone(),
            streaming: self.inner.config.streaming,
            sdk_version: self.inner.config.sdk_version.clone(),
        };

        let mut supervisor = ProcessSupervisor::spawn(process_config).await?;
        let stdout = supervisor.take_stdout();
        let stdin = supervisor.take_stdin();

        *self.inner.stdin.lock().await = stdin;
        *self.inner.supervisor.lock().await = Some(supervisor);
        self.inner.ready.store(true, Ordering::SeqCst);

        if let Some(stdout) = stdout {
            let inner = self.inner.clone();
            let max_buffer_bytes = inner.config.max_buffer_bytes;
            tokio::spawn(async move {
                run_reader(inner, stdout, max_buffer_bytes).await;
            });
        } else {
            self.inner.queue.push_end().await;
        }

        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst) && !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Writes one line to the child's stdin, appending the newline.
    pub async fn write(&self, line: &str) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SdkError::ConnectionError("transport is closed".into()));
        }
        if !self.inner.ready.load(Ordering::SeqCst) {
            return Err(SdkError::ConnectionError("transport is not connected".into()));
        }

        use tokio::io::AsyncWriteExt;
        let mut guard = self.inner.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            SdkError::ConnectionError("stdin is not writable (closed or non-streaming)".into())
        })?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| SdkError::ConnectionError(format!("stdin write failed: {err}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|err| SdkError::ConnectionError(format!("stdin write failed: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| SdkError::ConnectionError(format!("stdin flush failed: {err}")))?;
        Ok(())
    }

    /// Closes stdin (e.g. after the last user turn in streaming mode).
    /// Idempotent.
    pub async fn end_input(&self) {
        let mut guard = self.inner.stdin.lock().await;
        if let Some(mut stdin) = guard.take() {
            use tokio::io::AsyncWriteExt;
            let _ = stdin.shutdown().await;
        }
    }

    /// Returns the single consumer handle for this transport's record
    /// stream. May only be called once per transport instance (spec §4.3's
    /// single-reader discipline).
    pub fn read_records(&self) -> Result<QueueConsumer> {
        if self.inner.reader_taken.swap(true, Ordering::SeqCst) {
            return Err(SdkError::IllegalState(
                "read_records already called on this transport".into(),
            ));
        }
        Ok(self.inner.queue.consumer())
    }

    /// Idempotent coordinated shutdown: closes stdin, marks the internal
    /// queue closed so a blocked reader unblocks promptly, then tears down
    /// the child process (which closes its stdout, unblocking our own
    /// background reader).
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.end_input().await;
        self.inner.queue.mark_closed();
        if let Some(mut supervisor) = self.inner.supervisor.lock().await.take() {
            supervisor.terminate().await;
        }
    }
}

async fn run_reader(inner: Arc<Inner>, mut stdout: tokio::process::ChildStdout, max_buffer_bytes: usize) {
    let mut framer = LineFramer::new(max_buffer_bytes);
    let mut buf = [0u8; 8192];

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                inner
                    .queue
                    .push_error(format!("stdout read error: {err}"))
                    .await;
                return;
            }
        };

        match framer.feed(&buf[..n]) {
            Ok(records) => {
                for record in records {
                    inner.queue.push_data(record).await;
                }
            }
            Err(err) => {
                inner.queue.push_error(err.to_string()).await;
                return;
            }
        }
    }

    let exit_code = {
        let mut guard = inner.supervisor.lock().await;
        match guard.as_mut() {
            Some(supervisor) => supervisor.wait_for_exit_code().await,
            None => None,
        }
    };

    match exit_code {
        Some(code) if code != 0 => {
            inner
                .queue
                .push_error(format!("process exited with code {code}"))
                .await;
        }
        _ => inner.queue.push_end().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(args: Vec<&str>) -> TransportConfig {
        let mut cfg = TransportConfig::new(
            PathBuf::from(if cfg!(windows) { "cmd" } else { "sh" }),
            "0.0.0-test",
        );
        cfg.args = args.into_iter().map(String::from).collect();
        std::env::set_var("CLI_VERSION_PROBE_SKIP", "1");
        cfg
    }

    #[tokio::test]
    async fn echoes_a_single_json_line_from_a_shell_child() {
        let cfg = if cfg!(windows) {
            test_config(vec!["/C", "echo {\"type\":\"hello\"}"])
        } else {
            test_config(vec!["-c", "echo '{\"type\":\"hello\"}'"])
        };
        let transport = SubprocessTransport::new(cfg);
        transport.connect().await.unwrap();
        let consumer = transport.read_records().unwrap();
        let record = consumer.recv().await.unwrap().unwrap();
        assert_eq!(record["type"], "hello");
        assert!(consumer.recv().await.unwrap().is_none());
        transport.close().await;
    }

    #[tokio::test]
    async fn second_read_records_call_is_rejected() {
        let cfg = test_config(vec!["-c", "true"]);
        let transport = SubprocessTransport::new(cfg);
        transport.connect().await.unwrap();
        let _first = transport.read_records().unwrap();
        assert!(matches!(
            transport.read_records(),
            Err(SdkError::IllegalState(_))
        ));
        transport.close().await;
    }
}
