//! Remote command execution on the connected device
//!
//! The engine never talks to a transport directly. Every device interaction
//! is a shell command sent through a [`RemoteChannel`], either buffered
//! (`run`) or as a live byte stream (`open`).

use crate::{Error, Result};
use std::io::{Read, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Timeout for ordinary remote queries
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for whole-device checksum commands
pub const CHECKSUM_TIMEOUT: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Options for a single remote command
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Also hand back a writable stdin (streaming commands only)
    pub with_stdin: bool,
    /// Upper bound for buffered commands
    pub timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            with_stdin: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Options for a command that consumes bytes written to its stdin
    pub fn writable() -> Self {
        Self {
            with_stdin: true,
            ..Self::default()
        }
    }
}

/// Buffered result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Stdout decoded as text with surrounding whitespace removed
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Non-empty stderr signals that the command failed
    pub fn has_error(&self) -> bool {
        !self.stderr.is_empty()
    }

    /// Turn a reported error stream into [`Error::DeviceQuery`]
    pub fn check(self, command: &str) -> Result<Self> {
        if self.has_error() {
            return Err(Error::DeviceQuery {
                command: command.to_string(),
                stderr: self.stderr_text(),
            });
        }
        Ok(self)
    }
}

/// Live handles of a streaming remote command
pub struct CommandStream {
    pub stdout: Box<dyn Read + Send>,
    pub stderr: Box<dyn Read + Send>,
    pub stdin: Option<Box<dyn Write + Send>>,
}

impl CommandStream {
    /// Close stdin, wait for the command to exit and return its error stream
    pub fn finish(mut self) -> Result<Vec<u8>> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush().map_err(Error::from_stream)?;
        }
        let mut stderr = Vec::new();
        self.stderr
            .read_to_end(&mut stderr)
            .map_err(Error::from_stream)?;
        Ok(stderr)
    }
}

/// A shell on the connected device
pub trait RemoteChannel: Send + Sync {
    /// Run a command to completion and collect its output
    fn run(&self, command: &str, options: &RunOptions) -> Result<CommandOutput>;

    /// Start a command and hand back its streams without reading them
    fn open(&self, command: &str, options: &RunOptions) -> Result<CommandStream>;

    /// Whether the device currently answers commands
    fn is_connected(&self) -> bool {
        match self.run("true", &RunOptions::default()) {
            Ok(output) => !output.has_error(),
            Err(_) => false,
        }
    }
}

/// Runs device commands through a local program such as `ssh root@host`
#[derive(Debug, Clone)]
pub struct ProcessChannel {
    program: String,
    args: Vec<String>,
}

impl ProcessChannel {
    /// Build a channel from an argv prefix; the remote command is appended
    pub fn new(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .filter(|(program, _)| !program.trim().is_empty())
            .ok_or_else(|| Error::Configuration {
                reason: "device command must start with a program".to_string(),
            })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(remote);
        cmd
    }
}

impl RemoteChannel for ProcessChannel {
    fn run(&self, command: &str, options: &RunOptions) -> Result<CommandOutput> {
        debug!("Running remote command: {}", command);

        let mut child = self
            .command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ConnectionLost {
                reason: format!("failed to start {}: {}", self.program, e),
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + options.timeout;
        loop {
            if child.try_wait()?.is_some() {
                break;
            }
            if Instant::now() >= deadline {
                warn!("Remote command timed out, killing it: {}", command);
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Timeout {
                    command: command.to_string(),
                    seconds: options.timeout.as_secs(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }

        Ok(CommandOutput {
            stdout: join_drain(stdout)?,
            stderr: join_drain(stderr)?,
        })
    }

    fn open(&self, command: &str, options: &RunOptions) -> Result<CommandStream> {
        debug!("Opening remote stream: {}", command);

        let stdin_mode = if options.with_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = self
            .command(command)
            .stdin(stdin_mode)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ConnectionLost {
                reason: format!("failed to start {}: {}", self.program, e),
            })?;

        let stdin = child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn Write + Send>);
        let stderr = child.stderr.take().ok_or_else(|| Error::ConnectionLost {
            reason: "remote command has no stderr".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::ConnectionLost {
            reason: "remote command has no stdout".to_string(),
        })?;

        Ok(CommandStream {
            stdout: Box::new(ChildReader { child, stdout }),
            stderr: Box::new(stderr),
            stdin,
        })
    }
}

type Drain = Option<thread::JoinHandle<std::io::Result<Vec<u8>>>>;

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> Drain {
    reader.map(|mut r| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn join_drain(handle: Drain) -> Result<Vec<u8>> {
    match handle {
        Some(handle) => handle
            .join()
            .map_err(|_| Error::ConnectionLost {
                reason: "output reader thread panicked".to_string(),
            })?
            .map_err(Error::from_stream),
        None => Ok(Vec::new()),
    }
}

/// Stdout of a spawned process that reaps the process when dropped
struct ChildReader {
    child: Child,
    stdout: ChildStdout,
}

impl Read for ChildReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for ChildReader {
    fn drop(&mut self) {
        // An unfinished reader means the transfer was abandoned.
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> ProcessChannel {
        ProcessChannel::new(&["sh".to_string(), "-c".to_string()]).unwrap()
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            ProcessChannel::new(&[]),
            Err(Error::Configuration { .. })
        ));
        assert!(matches!(
            ProcessChannel::new(&[String::new(), "ssh".to_string()]),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_check_maps_stderr_to_device_query() {
        let output = CommandOutput {
            stdout: Vec::new(),
            stderr: b"no such device\n".to_vec(),
        };
        match output.check("cat /dev/nope") {
            Err(Error::DeviceQuery { command, stderr }) => {
                assert_eq!(command, "cat /dev/nope");
                assert_eq!(stderr, "no such device");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_process_channel_buffered_run() {
        let output = shell()
            .run("echo hello; echo oops >&2", &RunOptions::default())
            .unwrap();
        assert_eq!(output.text(), "hello");
        assert_eq!(output.stderr_text(), "oops");
        assert!(output.has_error());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_channel_timeout() {
        let result = shell().run(
            "sleep 5",
            &RunOptions::with_timeout(Duration::from_millis(100)),
        );
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_channel_streaming_stdin() {
        let mut stream = shell().open("cat", &RunOptions::writable()).unwrap();
        stream
            .stdin
            .as_mut()
            .unwrap()
            .write_all(b"streamed bytes")
            .unwrap();
        drop(stream.stdin.take());

        let mut echoed = Vec::new();
        stream.stdout.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, b"streamed bytes");
        assert!(stream.finish().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_connected_probe() {
        assert!(shell().is_connected());
        let broken = ProcessChannel::new(&["/nonexistent/transport".to_string()]).unwrap();
        assert!(!broken.is_connected());
    }
}
