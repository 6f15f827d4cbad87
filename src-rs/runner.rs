use crate::error::RunError;
use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

const TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Exit status plus the last lines of each stream. A non-zero code is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub code: Option<i32>,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run a command and forward every output line to the `log` facade under `prefix`.
pub fn run_logged<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    work_dir: Option<&Path>,
    prefix: &str,
) -> Result<ProcessOutcome, RunError> {
    run_with_sink(program, args, work_dir, &|stream, line| match stream {
        Stream::Stdout => log::info!("{prefix}{line}"),
        Stream::Stderr => log::warn!("{prefix}{line}"),
    })
}

pub fn run_with_sink<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    work_dir: Option<&Path>,
    sink: &(dyn Fn(Stream, &str) + Sync),
) -> Result<ProcessOutcome, RunError> {
    let program = program.as_ref();
    let display = command_line(program, args);

    let mut cmd = Command::new(program);
    cmd.args(args.iter().map(|a| a.as_ref()));
    if let Some(dir) = work_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
        command: display.clone(),
        source,
    })?;
    log::debug!("spawned pid {}: {display}", child.id());

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Both pipes are drained while the parent waits; the scope joins them before we look
    // at the status, so every line has been forwarded by the time the code is returned.
    let (status, stdout_tail, stderr_tail) = thread::scope(|scope| {
        let out = scope.spawn(move || drain(stdout, Stream::Stdout, sink));
        let err = scope.spawn(move || drain(stderr, Stream::Stderr, sink));
        let status = child.wait();
        let stdout_tail = out.join().unwrap_or_default();
        let stderr_tail = err.join().unwrap_or_default();
        (status, stdout_tail, stderr_tail)
    });

    let status = status.map_err(|source| RunError::Wait {
        command: display.clone(),
        source,
    })?;
    log::debug!("`{display}` exited with {status}");

    Ok(ProcessOutcome {
        code: status.code(),
        stdout_tail,
        stderr_tail,
    })
}

fn drain<R: Read>(
    reader: Option<R>,
    stream: Stream,
    sink: &(dyn Fn(Stream, &str) + Sync),
) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                sink(stream, line);
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            }
            Err(err) => {
                log::debug!("stopped reading {stream:?}: {err}");
                break;
            }
        }
    }
    tail.into_iter().collect()
}

pub fn command_line<S: AsRef<OsStr>>(program: &OsStr, args: &[S]) -> String {
    let mut parts: Vec<OsString> = vec![program.to_os_string()];
    parts.extend(args.iter().map(|a| a.as_ref().to_os_string()));
    parts
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
