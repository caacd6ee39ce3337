//! The execution bridge: one spawned process wired to one connection.
//!
//! A bridge owns the child, one reader task per output stream, one writer task
//! draining its input queue into stdin, and the exit supervision that reports
//! completion. Resources are released only after every task has finished.
//!
//! ```text
//! Created -> Running -> Completed(code)
//!         \-> StartFailed
//! ```

mod pipes;
#[cfg(unix)]
mod pty;
pub mod target;
pub mod terminal;
pub mod utf8;

pub use target::{resolve_target, Launch, Target};
pub use terminal::{StreamMode, WindowSize};

use crate::config::{Config, Tunables};
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use terminal::{HangupScope, InputWriter, OutputReader, WindowControl};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exit code reported when the process ended without one (signal death,
/// wait failure).
pub const ABNORMAL_EXIT: i32 = -1;

/// Which output stream a chunk came from. A pty has only `Stdout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Where a bridge reports what happens to its process.
///
/// Called concurrently from the bridge's tasks; each stream's chunks arrive
/// from a single task in read order.
pub trait Reporter: Send + Sync + 'static {
    fn output(&self, stream: StreamKind, chunk: &[u8]);

    fn stream_ended(&self, _stream: StreamKind) {}

    /// The bridge could not start. Sent at most once, never followed by
    /// `completed`.
    fn error(&self, message: String);

    /// The process exited. Sent exactly once for every started bridge.
    fn completed(&self, code: i32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Created,
    Running,
    /// Process exited and every task has drained.
    Completed(i32),
    StartFailed,
}

impl BridgeStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, BridgeStatus::Completed(_) | BridgeStatus::StartFailed)
    }
}

/// The connection's view of a bridge.
pub struct BridgeHandle {
    id: Uuid,
    input: mpsc::Sender<String>,
    resize: watch::Sender<Option<WindowSize>>,
    hangup: Arc<Notify>,
    superseded: Arc<AtomicBool>,
    status: watch::Receiver<BridgeStatus>,
}

impl BridgeHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> BridgeStatus {
        *self.status.borrow()
    }

    /// Queue input for the process. Waits while the queue is full; returns
    /// `false` once the bridge no longer accepts input.
    pub async fn send_input(&self, data: String) -> bool {
        self.input.send(data).await.is_ok()
    }

    /// Apply a new window size. Pipe-backed bridges ignore it.
    pub fn resize(&self, size: WindowSize) {
        self.resize.send_replace(Some(size));
    }

    /// Send the process a hang-up, as a closing terminal would.
    pub fn hang_up(&self) {
        self.hangup.notify_one();
    }

    /// Mark this bridge as no longer addressed by its connection. The process
    /// keeps running and its output keeps streaming.
    pub fn supersede(&self) {
        if !self.superseded.swap(true, Ordering::AcqRel) {
            info!(bridge = %self.id, "Bridge superseded; process left to finish unattended");
        }
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }

    /// Wait until the bridge failed to start or has fully wound down.
    pub async fn finished(&self) -> BridgeStatus {
        let mut status = self.status.clone();
        let _ = status.wait_for(BridgeStatus::is_finished).await;
        let current = *status.borrow();
        current
    }
}

/// A running bridge. Owned by its supervision task.
pub struct ExecutionBridge {
    id: Uuid,
    child: Child,
    stdin: InputWriter,
    outputs: Vec<(StreamKind, OutputReader)>,
    control: Box<dyn WindowControl>,
    hangup_scope: HangupScope,
    input_rx: mpsc::Receiver<String>,
    // Keeps the queue open while the process runs, even after the
    // connection drops its sender on supersede.
    input_hold: mpsc::Sender<String>,
    resize_rx: watch::Receiver<Option<WindowSize>>,
    hangup: Arc<Notify>,
    superseded: Arc<AtomicBool>,
    status: watch::Sender<BridgeStatus>,
    reporter: Arc<dyn Reporter>,
    read_chunk: usize,
    drain_grace: Duration,
}

impl ExecutionBridge {
    /// Validate `target`, spawn it with `mode` streams, and start the
    /// forwarding tasks. Never fails: a start failure is reported through
    /// `reporter` and reflected in the handle's status.
    pub fn start(
        config: &Config,
        target: Target,
        mode: StreamMode,
        reporter: Arc<dyn Reporter>,
    ) -> BridgeHandle {
        Self::start_sized(config, target, mode, WindowSize::default(), reporter)
    }

    pub fn start_sized(
        config: &Config,
        target: Target,
        mode: StreamMode,
        size: WindowSize,
        reporter: Arc<dyn Reporter>,
    ) -> BridgeHandle {
        let id = Uuid::new_v4();
        let Tunables {
            input_capacity,
            read_chunk,
            drain_grace,
            ..
        } = config.tunables;
        let (input_tx, input_rx) = mpsc::channel(input_capacity);
        let (resize_tx, resize_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(BridgeStatus::Created);
        let hangup = Arc::new(Notify::new());
        let superseded = Arc::new(AtomicBool::new(false));

        let handle = BridgeHandle {
            id,
            input: input_tx.clone(),
            resize: resize_tx,
            hangup: Arc::clone(&hangup),
            superseded: Arc::clone(&superseded),
            status: status_rx,
        };

        let backend = mode.backend(size);
        let spawned = target
            .launch(config)
            .and_then(|launch| {
                debug!(bridge = %id, command = %launch.display(), mode = ?backend.mode(), "Spawning");
                backend.spawn(launch.command(&config.root))
            });

        match spawned {
            Ok(attached) => {
                status_tx.send_replace(BridgeStatus::Running);
                let bridge = ExecutionBridge {
                    id,
                    child: attached.child,
                    stdin: attached.stdin,
                    outputs: attached.outputs,
                    control: attached.control,
                    hangup_scope: attached.hangup,
                    input_rx,
                    input_hold: input_tx,
                    resize_rx,
                    hangup,
                    superseded,
                    status: status_tx,
                    reporter,
                    read_chunk,
                    drain_grace,
                };
                tokio::spawn(bridge.run());
            }
            Err(e) => {
                warn!(bridge = %id, requested = ?target, "Start failed: {}", e);
                reporter.error(e.to_string());
                status_tx.send_replace(BridgeStatus::StartFailed);
            }
        }
        handle
    }

    async fn run(self) {
        let ExecutionBridge {
            id,
            mut child,
            stdin,
            outputs,
            control,
            hangup_scope,
            input_rx,
            input_hold,
            mut resize_rx,
            hangup,
            superseded,
            status,
            reporter,
            read_chunk,
            drain_grace,
        } = self;
        let pid = child.id();
        info!(bridge = %id, pid, "Process started");

        let mut streams = JoinSet::new();
        for (kind, reader) in outputs {
            streams.spawn(forward_output(kind, reader, Arc::clone(&reporter), read_chunk));
        }
        let (close_tx, close_rx) = oneshot::channel();
        let writer = tokio::spawn(forward_input(input_rx, stdin, close_rx));

        let mut resizable = true;
        let code = loop {
            tokio::select! {
                exit = child.wait() => break exit_code(exit),
                changed = resize_rx.changed(), if resizable => {
                    if changed.is_err() {
                        resizable = false;
                        continue;
                    }
                    let size = *resize_rx.borrow_and_update();
                    if let Some(size) = size {
                        if let Err(e) = control.resize(size) {
                            debug!(bridge = %id, "Resize failed: {}", e);
                        }
                    }
                }
                _ = hangup.notified() => send_hangup(id, pid, hangup_scope),
            }
        };

        // Give the streams a moment so completion follows the final chunk.
        let drained = tokio::time::timeout(drain_grace, join_all(&mut streams))
            .await
            .is_ok();
        reporter.completed(code);
        let _ = close_tx.send(());
        drop(input_hold);

        let _ = writer.await;
        if !drained {
            join_all(&mut streams).await;
        }
        drop(control);
        drop(child);

        info!(
            bridge = %id,
            pid,
            code,
            superseded = superseded.load(Ordering::Acquire),
            "Execution completed"
        );
        status.send_replace(BridgeStatus::Completed(code));
    }
}

async fn join_all(set: &mut JoinSet<()>) {
    while set.join_next().await.is_some() {}
}

fn exit_code(exit: io::Result<ExitStatus>) -> i32 {
    match exit {
        Ok(status) => status.code().unwrap_or(ABNORMAL_EXIT),
        Err(e) => {
            warn!("Waiting for process failed: {}", e);
            ABNORMAL_EXIT
        }
    }
}

#[cfg(unix)]
fn send_hangup(id: Uuid, pid: Option<u32>, scope: HangupScope) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let sent = match scope {
        HangupScope::Process => kill(Pid::from_raw(pid), Signal::SIGHUP),
        HangupScope::Group => killpg(Pid::from_raw(pid), Signal::SIGHUP),
    };
    match sent {
        Ok(()) => debug!(bridge = %id, pid, ?scope, "Sent SIGHUP"),
        Err(e) => debug!(bridge = %id, pid, ?scope, "SIGHUP failed: {}", e),
    }
}

#[cfg(not(unix))]
fn send_hangup(_id: Uuid, _pid: Option<u32>, _scope: HangupScope) {}

/// Copy one output stream to the reporter, chunk by chunk as read.
async fn forward_output(
    kind: StreamKind,
    mut reader: OutputReader,
    reporter: Arc<dyn Reporter>,
    chunk: usize,
) {
    let mut buf = vec![0u8; chunk];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => reporter.output(kind, &buf[..n]),
            // EIO from a pty master is how end of stream looks there.
            Err(e) => {
                debug!(stream = ?kind, "Stream closed: {}", e);
                break;
            }
        }
    }
    reporter.stream_ended(kind);
}

/// Drain the input queue into the process's stdin until the queue closes or
/// the process exits.
async fn forward_input(
    mut input: mpsc::Receiver<String>,
    mut stdin: InputWriter,
    mut exited: oneshot::Receiver<()>,
) {
    loop {
        let data = tokio::select! {
            biased;
            _ = &mut exited => break,
            data = input.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };
        let written = async {
            stdin.write_all(data.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            debug!("Writing to stdin failed: {}", e);
            break;
        }
    }
    input.close();
    let _ = stdin.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Out(StreamKind, String),
        Error(String),
        Completed(i32),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn text(&self, kind: StreamKind) -> String {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Out(k, s) if k == kind => Some(s),
                    _ => None,
                })
                .collect()
        }

        fn completions(&self) -> Vec<i32> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Completed(code) => Some(code),
                    _ => None,
                })
                .collect()
        }
    }

    impl Reporter for Recorder {
        fn output(&self, stream: StreamKind, chunk: &[u8]) {
            let text = String::from_utf8_lossy(chunk).into_owned();
            self.events.lock().unwrap().push(Event::Out(stream, text));
        }

        fn error(&self, message: String) {
            self.events.lock().unwrap().push(Event::Error(message));
        }

        fn completed(&self, code: i32) {
            self.events.lock().unwrap().push(Event::Completed(code));
        }
    }

    fn script_root(scripts: &[(&str, &str)]) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in scripts {
            fs::write(dir.path().join(name), body).unwrap();
        }
        let config = Config::for_root(dir.path()).unwrap();
        (dir, config)
    }

    fn start(config: &Config, file: &str, recorder: &Arc<Recorder>) -> BridgeHandle {
        ExecutionBridge::start(
            config,
            Target::Script(Some(file.into())),
            StreamMode::Pipes,
            Arc::clone(recorder) as Arc<dyn Reporter>,
        )
    }

    async fn finish(handle: &BridgeHandle) -> BridgeStatus {
        tokio::time::timeout(Duration::from_secs(10), handle.finished())
            .await
            .expect("bridge did not finish")
    }

    #[tokio::test]
    async fn reports_true_exit_code_once() {
        let (_dir, config) = script_root(&[("exit3.sh", "echo out\necho err >&2\nexit 3\n")]);
        let recorder = Arc::new(Recorder::default());
        let handle = start(&config, "exit3.sh", &recorder);

        assert_eq!(finish(&handle).await, BridgeStatus::Completed(3));
        assert_eq!(recorder.completions(), vec![3]);
        assert_eq!(recorder.text(StreamKind::Stdout), "out\n");
        assert_eq!(recorder.text(StreamKind::Stderr), "err\n");
        assert_eq!(recorder.events().last(), Some(&Event::Completed(3)));
    }

    #[tokio::test]
    async fn invalid_target_reports_single_error() {
        let (_dir, config) = script_root(&[]);
        for file in ["missing.sh", "", "../outside.sh"] {
            let recorder = Arc::new(Recorder::default());
            let handle = start(&config, file, &recorder);
            assert_eq!(handle.status(), BridgeStatus::StartFailed);
            assert_eq!(finish(&handle).await, BridgeStatus::StartFailed);

            let events = recorder.events();
            assert_eq!(events.len(), 1, "{:?}", events);
            assert!(matches!(events[0], Event::Error(_)));
            assert!(!handle.send_input("ignored\n".into()).await);
        }
    }

    #[tokio::test]
    async fn input_arrives_in_order_beyond_queue_capacity() {
        let (_dir, config) = script_root(&[(
            "echo.sh",
            "while IFS= read -r line; do echo \"got:$line\"; done\necho done\n",
        )]);
        let recorder = Arc::new(Recorder::default());
        let handle = start(&config, "echo.sh", &recorder);

        let n = config.tunables.input_capacity * 3;
        for i in 0..n {
            assert!(handle.send_input(format!("{}\n", i)).await);
        }
        let expected: String = (0..n).map(|i| format!("got:{}\n", i)).collect();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while recorder.text(StreamKind::Stdout) != expected {
            assert!(tokio::time::Instant::now() < deadline, "{:?}", recorder.events());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // The queue stays open while the process runs; end it explicitly.
        handle.hang_up();
        finish(&handle).await;
    }

    #[tokio::test]
    async fn signal_death_reports_sentinel() {
        let (_dir, config) = script_root(&[("sleepy.sh", "exec sleep 30\n")]);
        let recorder = Arc::new(Recorder::default());
        let handle = start(&config, "sleepy.sh", &recorder);
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.hang_up();

        assert_eq!(finish(&handle).await, BridgeStatus::Completed(ABNORMAL_EXIT));
        assert_eq!(recorder.completions(), vec![ABNORMAL_EXIT]);
    }

    #[tokio::test]
    async fn hang_up_reaches_foreground_job_in_pipe_mode() {
        let (_dir, config) = script_root(&[]);
        let recorder = Arc::new(Recorder::default());
        let handle = ExecutionBridge::start(
            &config,
            Target::Shell,
            StreamMode::Pipes,
            Arc::clone(&recorder) as Arc<dyn Reporter>,
        );
        assert!(handle.send_input("sleep 30\n".into()).await);
        tokio::time::sleep(Duration::from_millis(300)).await;

        handle.hang_up();
        let status = tokio::time::timeout(Duration::from_secs(3), handle.finished())
            .await
            .expect("orphaned job kept the bridge alive");
        assert_eq!(status, BridgeStatus::Completed(ABNORMAL_EXIT));
        assert_eq!(recorder.completions(), vec![ABNORMAL_EXIT]);
    }

    #[tokio::test]
    async fn superseded_bridge_still_streams_to_completion() {
        let (_dir, config) = script_root(&[("slow.sh", "sleep 0.3\necho late\n")]);
        let recorder = Arc::new(Recorder::default());
        let handle = start(&config, "slow.sh", &recorder);
        handle.supersede();
        assert!(handle.is_superseded());

        assert_eq!(finish(&handle).await, BridgeStatus::Completed(0));
        assert_eq!(recorder.text(StreamKind::Stdout), "late\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pty_merges_streams_and_resizes() {
        if StreamMode::probe() != StreamMode::Pty {
            return;
        }
        let (_dir, config) = script_root(&[(
            "tty.sh",
            "read -r _\nstty size\necho to-stderr >&2\n",
        )]);
        let recorder = Arc::new(Recorder::default());
        let handle = ExecutionBridge::start_sized(
            &config,
            Target::Script(Some("tty.sh".into())),
            StreamMode::Pty,
            WindowSize { rows: 24, cols: 80 },
            Arc::clone(&recorder) as Arc<dyn Reporter>,
        );
        handle.resize(WindowSize { rows: 40, cols: 120 });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.send_input("go\n".into()).await);

        assert_eq!(finish(&handle).await, BridgeStatus::Completed(0));
        let out = recorder.text(StreamKind::Stdout);
        assert!(out.contains("40 120"), "{:?}", out);
        assert!(out.contains("to-stderr"), "{:?}", out);
        assert_eq!(recorder.text(StreamKind::Stderr), "");
    }

    #[test]
    fn exit_code_mapping() {
        assert_eq!(exit_code(Err(io::Error::other("boom"))), ABNORMAL_EXIT);
    }
}
