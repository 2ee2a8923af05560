use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured output of a process that exited on its own.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub enum RunOutcome {
    Finished(ProcessOutput),
    /// The deadline passed; the child was killed and reaped.
    TimedOut,
}

/// Run `program args...`, feed `input` on stdin, and wait at most `timeout`.
///
/// Pipes are drained on background threads so a chatty child cannot block on
/// a full pipe. On timeout the child is killed and waited for before
/// returning, so no process outlives the call.
pub fn run_with_timeout(
    program: &Path,
    args: &[&str],
    input: &[u8],
    timeout: Duration,
) -> std::io::Result<RunOutcome> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout_rx = drain(child.stdout.take());
    let stderr_rx = drain(child.stderr.take());
    if let Some(mut stdin) = child.stdin.take() {
        let input = input.to_vec();
        std::thread::spawn(move || {
            // A child that exits without reading closes the pipe; that is not an error here.
            let _ = stdin.write_all(&input);
        });
    }

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            kill(&mut child);
            return Ok(RunOutcome::TimedOut);
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    // A grandchild may still hold the pipes open; never wait past the deadline for them.
    let remaining = deadline.saturating_duration_since(Instant::now());
    let (Ok(stdout), Ok(stderr)) = (
        stdout_rx.recv_timeout(remaining.max(POLL_INTERVAL)),
        stderr_rx.recv_timeout(remaining.max(POLL_INTERVAL)),
    ) else {
        return Ok(RunOutcome::TimedOut);
    };

    Ok(RunOutcome::Finished(ProcessOutput {
        status,
        stdout,
        stderr,
    }))
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
