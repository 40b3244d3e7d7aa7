//! The opaque programmer primitive.
//!
//! The bootloader protocol itself lives in an external tool (`ktool`). This
//! module only defines the typed invocation handed to it and a runner that
//! executes the tool and streams its output.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::config::DEFAULT_KTOOL;

/// A single progress item surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A message from the provisioning core itself (resolver, drivers).
    Log(String),
    /// One frame of raw programmer output: a line, or one redraw of a
    /// `\r`-driven progress bar.
    Output(String),
}

impl ProgressEvent {
    pub fn text(&self) -> &str {
        match self {
            ProgressEvent::Log(text) | ProgressEvent::Output(text) => text,
        }
    }

    /// Drop carriage-return artifacts left by terminal progress bars.
    pub fn normalized(self) -> Self {
        match self {
            ProgressEvent::Log(text) => ProgressEvent::Log(normalize_output(&text)),
            ProgressEvent::Output(text) => ProgressEvent::Output(normalize_output(&text)),
        }
    }
}

/// Boxed progress sink owned by a driver.
pub type ProgressCallback = Box<dyn FnMut(ProgressEvent) + Send>;

/// Reduce a chunk of terminal output to what a terminal would show: the
/// last non-empty `\r`-separated frame, without line endings.
pub fn normalize_output(text: &str) -> String {
    text.split(['\r', '\n'])
        .filter(|frame| !frame.is_empty())
        .last()
        .unwrap_or("")
        .to_string()
}

/// Read `reader` to the end, calling `on_frame` for every non-blank frame.
/// Both `\r` and `\n` end a frame, so progress bar redraws arrive one by one.
pub fn read_frames<R, F>(reader: &mut R, mut on_frame: F) -> io::Result<()>
where
    R: BufRead,
    F: FnMut(String),
{
    let mut frame = Vec::new();
    loop {
        let buf = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if buf.is_empty() {
            break;
        }

        let len = buf.len();
        for &byte in buf {
            if byte == b'\r' || byte == b'\n' {
                emit_frame(&mut frame, &mut on_frame);
            } else {
                frame.push(byte);
            }
        }
        reader.consume(len);
    }
    emit_frame(&mut frame, &mut on_frame);
    Ok(())
}

fn emit_frame<F: FnMut(String)>(frame: &mut Vec<u8>, on_frame: &mut F) {
    if frame.iter().any(|b| !b.is_ascii_whitespace()) {
        on_frame(String::from_utf8_lossy(frame).into_owned());
    }
    frame.clear();
}

/// The programmer could not greet or program the device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ProgrammerError {
    pub reason: String,
}

impl ProgrammerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Everything one programmer run needs, passed explicitly.
pub struct ProgrammerInvocation<'a> {
    /// Interactive terminal after programming; always false for this core.
    pub terminal: bool,
    pub dev: String,
    pub baudrate: u32,
    pub board: String,
    /// Firmware image; `None` in erase mode.
    pub file: Option<PathBuf>,
    pub erase: bool,
    pub callback: &'a mut dyn FnMut(ProgressEvent),
}

impl ProgrammerInvocation<'_> {
    /// Command-line arguments for `ktool`.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-B".into(),
            self.board.clone().into(),
            "-b".into(),
            self.baudrate.to_string().into(),
            "-p".into(),
            self.dev.clone().into(),
        ];
        if self.terminal {
            args.push("-t".into());
        }
        if self.erase {
            args.push("-E".into());
        }
        if let Some(file) = &self.file {
            args.push(file.clone().into_os_string());
        }
        args
    }
}

impl std::fmt::Debug for ProgrammerInvocation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgrammerInvocation")
            .field("terminal", &self.terminal)
            .field("dev", &self.dev)
            .field("baudrate", &self.baudrate)
            .field("board", &self.board)
            .field("file", &self.file)
            .field("erase", &self.erase)
            .finish_non_exhaustive()
    }
}

/// Runs one programming (or erase) pass against a device.
pub trait Programmer: Send + Sync {
    fn program(&self, invocation: ProgrammerInvocation<'_>) -> Result<(), ProgrammerError>;
}

/// Runs the external `ktool` executable.
#[derive(Debug, Clone)]
pub struct KtoolProgrammer {
    program: PathBuf,
    leading_args: Vec<OsString>,
}

impl Default for KtoolProgrammer {
    fn default() -> Self {
        Self::new(DEFAULT_KTOOL)
    }
}

impl KtoolProgrammer {
    /// Use `path` as the tool. A `.py` script is run through `python3`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if path.extension().is_some_and(|ext| ext == "py") {
            Self::with_leading_args("python3", [path.as_os_str().to_os_string()])
        } else {
            Self {
                program: path.to_path_buf(),
                leading_args: Vec::new(),
            }
        }
    }

    pub fn with_leading_args<I>(program: impl Into<PathBuf>, leading_args: I) -> Self
    where
        I: IntoIterator<Item = OsString>,
    {
        Self {
            program: program.into(),
            leading_args: leading_args.into_iter().collect(),
        }
    }
}

impl Programmer for KtoolProgrammer {
    fn program(&self, invocation: ProgrammerInvocation<'_>) -> Result<(), ProgrammerError> {
        let args = invocation.args();
        info!(
            target: "programmer",
            "Running {} {:?}",
            self.program.display(),
            args
        );

        // stderr goes to an anonymous file so a chatty child can never block
        // on a full pipe while stdout is being drained.
        let mut stderr_file = tempfile::tempfile().map_err(|e| {
            ProgrammerError::new(format!("Failed to create stderr buffer: {}", e))
        })?;
        let stderr_sink = stderr_file.try_clone().map_err(|e| {
            ProgrammerError::new(format!("Failed to create stderr buffer: {}", e))
        })?;

        let mut child = Command::new(&self.program)
            .args(&self.leading_args)
            .args(&args)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr_sink))
            .spawn()
            .map_err(|e| {
                ProgrammerError::new(format!(
                    "Failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let mut last_output = None;
        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let streamed = read_frames(&mut reader, |frame| {
                last_output = Some(frame.clone());
                (invocation.callback)(ProgressEvent::Output(frame));
            });
            if let Err(e) = streamed {
                warn!(target: "programmer", "stdout read failed: {}", e);
            }
        }

        let status = child
            .wait()
            .map_err(|e| ProgrammerError::new(format!("Failed to wait for programmer: {}", e)))?;

        let stderr_text = match read_back(&mut stderr_file) {
            Ok(text) => text,
            Err(e) => {
                warn!(target: "programmer", "stderr read failed: {}", e);
                String::new()
            }
        };
        debug!(target: "programmer", "exited with {}", status);

        if status.success() {
            return Ok(());
        }

        let last_error = stderr_text
            .lines()
            .map(normalize_output)
            .filter(|line| !line.trim().is_empty())
            .last();

        Err(ProgrammerError::new(match last_error.or(last_output) {
            Some(reason) => reason,
            None => format!("{} exited with {}", self.program.display(), status),
        }))
    }
}

fn read_back(file: &mut File) -> io::Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
