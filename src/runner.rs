//! Running a BLAST program and decoding its XML output while it runs.
//!
//! Per invocation the runner owns one child process. Standard error is drained
//! on its own thread for the whole lifetime of the process, and the query is
//! fed to standard input from another, while the calling thread decodes
//! standard output. The decoded document is the success signal: a tool that
//! writes a complete report and then exits non-zero still succeeds, with the
//! exit code reported in [`SearchReport`].
//!
//! On Unix the tool runs in a process group of its own, so cancelling also
//! terminates any helper it forked that still holds one of the pipes.

use crate::blast_xml::decode_blast_xml;
use crate::error::BlastError;
use crate::query::Blaster;
use blastpipe_protocol::BlastReport;
use log::{debug, info, warn};
use std::{
    io::{self, BufReader, ErrorKind, Read},
    process::{Child, ChildStderr, ChildStdin, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
};

/// Output format switch appended to every invocation. Callers must not set it.
pub const OUTFMT_FLAG: &str = "-outfmt";
/// `-outfmt` value selecting BLAST XML.
pub const OUTFMT_XML: &str = "5";

#[derive(Debug, Clone)]
pub struct SearchReport {
    pub output: BlastReport,
    pub stderr: String,
    /// `None` when the process was ended by a signal or could not be reaped.
    pub exit_code: Option<i32>,
}

impl SearchReport {
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Cancels a running search by killing its process and everything it forked.
///
/// Clones share state. Cancelling before the search launches kills the
/// process as soon as it starts.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<Mutex<CancelState>>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: bool,
    /// Pid of the running tool, which is also its process group id on Unix.
    /// Only set while the process is unreaped, so the id cannot be reused.
    pid: Option<u32>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.cancelled = true;
        if let Some(pid) = state.pid {
            info!("Cancelling running BLAST search (pid {pid})");
            kill_process_tree(pid);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }

    fn attach(&self, pid: u32) {
        let mut state = lock(&self.state);
        if state.cancelled {
            kill_process_tree(pid);
        }
        state.pid = Some(pid);
    }

    fn detach(&self) {
        lock(&self.state).pid = None;
    }
}

/// Runs the search described by `blaster` and returns the decoded report.
pub fn run_blast(blaster: &dyn Blaster) -> Result<BlastReport, BlastError> {
    run_blast_with_cancel(blaster, &CancelHandle::new()).map(|report| report.output)
}

pub fn run_blast_with_cancel(
    blaster: &dyn Blaster,
    cancel: &CancelHandle,
) -> Result<SearchReport, BlastError> {
    let executable = blaster.executable().to_string();
    let mut args = blaster.cmd_args();
    if args.iter().any(|arg| arg == OUTFMT_FLAG) {
        return Err(BlastError::InvalidInvocation {
            executable,
            message: format!("'{OUTFMT_FLAG}' is set by the runner and must not be passed"),
        });
    }
    args.push(OUTFMT_FLAG.to_string());
    args.push(OUTFMT_XML.to_string());
    let input = blaster.stdin();

    info!("Running {} {}", executable, args.join(" "));
    let mut command = Command::new(&executable);
    command
        .args(&args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let mut child = command
        .spawn()
        .map_err(|e| launch_error(&executable, &args, e))?;

    let stream_error = |message: String| BlastError::StreamSetup {
        executable: executable.clone(),
        message,
        stderr: String::new(),
    };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        terminate(&mut child);
        return Err(stream_error("stdout or stderr pipe is missing".to_string()));
    };
    let stdin_pipe = child.stdin.take();
    if input.is_some() && stdin_pipe.is_none() {
        terminate(&mut child);
        return Err(stream_error("stdin pipe is missing".to_string()));
    }

    let stderr_drain = match spawn_stderr_drain(stderr) {
        Ok(handle) => handle,
        Err(e) => {
            terminate(&mut child);
            return Err(stream_error(format!("could not start stderr reader: {e}")));
        }
    };
    let stdin_feed = match (input, stdin_pipe) {
        (Some(source), Some(pipe)) => match spawn_stdin_feed(source, pipe) {
            Ok(handle) => Some(handle),
            Err(e) => {
                terminate(&mut child);
                let stderr = join_stderr(stderr_drain);
                return Err(BlastError::StreamSetup {
                    executable,
                    message: format!("could not start stdin writer: {e}"),
                    stderr,
                });
            }
        },
        _ => None,
    };

    cancel.attach(child.id());

    let mut stdout = BufReader::new(stdout);
    let decoded = decode_blast_xml(&mut stdout);
    // Consume anything left so the tool never blocks on a full pipe.
    match io::copy(&mut stdout, &mut io::sink()) {
        Ok(0) => {}
        Ok(bytes) => debug!("Discarded {bytes} bytes of stdout after the XML document"),
        Err(e) => debug!("Could not drain remaining stdout: {e}"),
    }

    let stderr = join_stderr(stderr_drain);
    if let Some(handle) = stdin_feed {
        if handle.join().is_err() {
            warn!("stdin writer thread panicked");
        }
    }
    let status = wait_for_exit(&mut child, cancel);

    let output = match decoded {
        Ok(output) => output,
        Err(e) if cancel.is_cancelled() => {
            debug!("Decoding stopped after cancellation: {e}");
            return Err(BlastError::Cancelled { executable, stderr });
        }
        Err(e) => {
            return Err(BlastError::Decode {
                executable,
                message: e.to_string(),
                stderr,
            });
        }
    };

    let exit_code = match status {
        Ok(status) => {
            if !status.success() {
                warn!(
                    "{} exited with {} after writing a complete report; keeping the decoded output",
                    executable, status
                );
            }
            status.code()
        }
        Err(e) => {
            warn!("Could not reap {executable}: {e}");
            None
        }
    };
    if !stderr.trim().is_empty() {
        debug!("{} stderr: {}", executable, stderr.trim());
    }
    Ok(SearchReport {
        output,
        stderr,
        exit_code,
    })
}

fn launch_error(executable: &str, args: &[String], e: io::Error) -> BlastError {
    if e.kind() == ErrorKind::NotFound {
        BlastError::ToolNotFound {
            executable: executable.to_string(),
        }
    } else {
        BlastError::Launch {
            executable: executable.to_string(),
            args: args.to_vec(),
            message: e.to_string(),
        }
    }
}

fn terminate(child: &mut Child) {
    kill_process_tree(child.id());
    let _ = child.wait();
}

/// Kills the process group led by `pid`.
#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        warn!("Pid {pid} does not fit a process group id");
        return;
    };
    // SAFETY: killpg only takes integers and does not touch our memory.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        debug!(
            "Could not kill BLAST process group {pgid}: {}",
            io::Error::last_os_error()
        );
    }
}

/// Kills `pid` and its descendants.
#[cfg(not(unix))]
fn kill_process_tree(pid: u32) {
    let pid = pid.to_string();
    match Command::new("taskkill")
        .args(["/T", "/F", "/PID", pid.as_str()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => debug!("taskkill for BLAST process {pid} exited with {status}"),
        Err(e) => debug!("Could not run taskkill for BLAST process {pid}: {e}"),
    }
}

fn spawn_stderr_drain(mut stderr: ChildStderr) -> io::Result<JoinHandle<String>> {
    thread::Builder::new()
        .name("blast-stderr".to_string())
        .spawn(move || {
            let mut bytes = Vec::new();
            if let Err(e) = stderr.read_to_end(&mut bytes) {
                warn!("Could not read BLAST stderr: {e}");
            }
            debug!("Drained {} bytes of stderr", bytes.len());
            String::from_utf8_lossy(&bytes).into_owned()
        })
}

fn join_stderr(handle: JoinHandle<String>) -> String {
    handle.join().unwrap_or_else(|_| {
        warn!("stderr reader thread panicked");
        String::new()
    })
}

fn spawn_stdin_feed(
    mut source: Box<dyn Read + Send>,
    mut pipe: ChildStdin,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("blast-stdin".to_string())
        .spawn(move || match io::copy(&mut source, &mut pipe) {
            Ok(bytes) => debug!("Fed {bytes} bytes of query input"),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!("BLAST closed stdin before reading the whole query")
            }
            Err(e) => warn!("Could not write query to BLAST stdin: {e}"),
        })
}

/// Waits for the tool to exit, then reaps it. The cancel handle is detached
/// while the exited tool is still an unreaped zombie, so a late cancel never
/// signals a recycled process group.
#[cfg(unix)]
fn wait_for_exit(child: &mut Child, cancel: &CancelHandle) -> io::Result<ExitStatus> {
    let exited = wait_without_reaping(child.id());
    cancel.detach();
    exited?;
    child.wait()
}

#[cfg(unix)]
fn wait_without_reaping(pid: u32) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain data for which all zeroes is valid, and
        // waitid only writes into the struct we pass.
        let rc = unsafe {
            let mut info: libc::siginfo_t = std::mem::zeroed();
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// The open process handle keeps the pid reserved until `child` is dropped.
#[cfg(not(unix))]
fn wait_for_exit(child: &mut Child, cancel: &CancelHandle) -> io::Result<ExitStatus> {
    let status = child.wait();
    cancel.detach();
    status
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::query::BlastQuery;
    use bio::io::fasta;
    use std::{
        fs,
        path::{Path, PathBuf},
        time::{Duration, Instant},
    };
    use tempfile::tempdir;

    /// Runs `sh <script> [flags]`, so the tests never exec a freshly written
    /// file.
    struct ScriptBlaster {
        script: PathBuf,
        query: BlastQuery,
    }

    impl ScriptBlaster {
        fn new(dir: &Path, body: &str) -> Self {
            Self::with_query(dir, body, BlastQuery::new("sh", vec![]))
        }

        fn with_query(dir: &Path, body: &str, query: BlastQuery) -> Self {
            let script = dir.join("stub_blast.sh");
            fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
            Self { script, query }
        }
    }

    impl Blaster for ScriptBlaster {
        fn executable(&self) -> &str {
            "sh"
        }

        fn cmd_args(&self) -> Vec<String> {
            let mut args = vec![self.script.to_string_lossy().to_string()];
            args.extend(self.query.cmd_args());
            args
        }

        fn stdin(&self) -> Option<Box<dyn Read + Send>> {
            self.query.stdin()
        }
    }

    const MINIMAL_XML: &str = "printf '<?xml version=\"1.0\"?>\\n<BlastOutput><BlastOutput_program>stub</BlastOutput_program></BlastOutput>\\n'";

    #[test]
    fn test_missing_tool_is_launch_failure() {
        let query = BlastQuery::new("blastpipe-no-such-blast-binary", vec![]);
        let start = Instant::now();
        let err = run_blast(&query).expect_err("missing tool");
        assert!(err.is_launch_failure(), "got: {err}");
        assert!(matches!(err, BlastError::ToolNotFound { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_outfmt_is_reserved() {
        let mut query = BlastQuery::new("blastp", vec![]);
        query.set_flag("outfmt", 6);
        let err = run_blast(&query).expect_err("reserved flag");
        assert!(matches!(err, BlastError::InvalidInvocation { .. }), "got: {err}");
    }

    #[test]
    fn test_query_reaches_stdin_and_outfmt_is_appended() {
        let td = tempdir().unwrap();
        let stdin_path = td.path().join("stdin.txt");
        let args_path = td.path().join("args.txt");
        let body = format!(
            "cat > '{}'\nprintf '%s\\n' \"$@\" > '{}'\n{MINIMAL_XML}",
            stdin_path.display(),
            args_path.display()
        );
        let mut query = BlastQuery::new(
            "sh",
            vec![fasta::Record::with_attrs("Q1", None, b"MKTAYIAK")],
        );
        query.set_flag("evalue", 0.1);
        let blaster = ScriptBlaster::with_query(td.path(), &body, query);

        let report = run_blast(&blaster).expect("stub run");
        assert_eq!(report.program, "stub");

        let fed = fs::read_to_string(&stdin_path).unwrap();
        let lines: Vec<&str> = fed.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('>') && lines[0].contains("Q1"));
        assert_eq!(lines[1], "MKTAYIAK");

        let args = fs::read_to_string(&args_path).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(args, vec!["-evalue", "0.1", "-outfmt", "5"]);
    }

    #[test]
    fn test_no_queries_means_null_stdin() {
        let td = tempdir().unwrap();
        let stdin_path = td.path().join("stdin.txt");
        let body = format!("cat > '{}'\n{MINIMAL_XML}", stdin_path.display());
        let blaster = ScriptBlaster::new(td.path(), &body);
        run_blast(&blaster).expect("stub run");
        assert_eq!(fs::read_to_string(&stdin_path).unwrap(), "");
    }

    #[test]
    fn test_large_interleaved_output_does_not_deadlock() {
        let td = tempdir().unwrap();
        let body = r#"printf '<?xml version="1.0"?>\n<BlastOutput>\n<BlastOutput_iterations>\n<Iteration>\n<Iteration_iter-num>1</Iteration_iter-num>\n<Iteration_hits>\n'
i=1
while [ "$i" -le 3000 ]; do
  echo "warning: stub diagnostic line $i padded so that stderr alone overflows a pipe buffer" >&2
  printf '<Hit><Hit_num>%d</Hit_num><Hit_id>hit_%d</Hit_id></Hit>\n' "$i" "$i"
  i=$((i + 1))
done
printf '</Iteration_hits>\n</Iteration>\n</BlastOutput_iterations>\n</BlastOutput>\n'"#;
        let blaster = ScriptBlaster::new(td.path(), body);

        let report = run_blast_with_cancel(&blaster, &CancelHandle::new()).expect("stub run");
        assert!(report.exited_cleanly());
        let hits = &report.output.iterations[0].hits;
        assert_eq!(hits.len(), 3000);
        assert!(hits.iter().enumerate().all(|(idx, hit)| hit.num == idx + 1));
        assert_eq!(hits[2999].id, "hit_3000");
        assert_eq!(report.stderr.lines().count(), 3000);
        assert!(report.stderr.starts_with("warning: stub diagnostic line 1 "));
    }

    #[test]
    fn test_nonzero_exit_with_complete_report_succeeds() {
        let td = tempdir().unwrap();
        let body = format!("echo 'Warning: [blastp] Query is empty' >&2\n{MINIMAL_XML}\nexit 3");
        let blaster = ScriptBlaster::new(td.path(), &body);
        let report = run_blast_with_cancel(&blaster, &CancelHandle::new()).expect("stub run");
        assert_eq!(report.output.program, "stub");
        assert_eq!(report.exit_code, Some(3));
        assert!(!report.exited_cleanly());
        assert!(report.stderr.contains("Query is empty"));
    }

    #[test]
    fn test_decode_failure_carries_stderr() {
        let td = tempdir().unwrap();
        let body = "echo 'BLAST Database error: No alias or index file found for protein database [nr]' >&2\nprintf '<BlastOutput><BlastOutput_query-len>twelve</BlastOutput_query-len></BlastOutput>'\nexit 2";
        let blaster = ScriptBlaster::new(td.path(), body);
        let err = run_blast(&blaster).expect_err("decode failure");
        assert!(matches!(err, BlastError::Decode { .. }), "got: {err}");
        assert!(err.stderr().contains("No alias or index file found"));
        let text = err.to_string();
        assert!(text.contains("<BlastOutput_query-len>"), "got: {text}");
        assert!(text.contains("\n\nstderr: BLAST Database error"), "got: {text}");
    }

    #[test]
    fn test_decode_failure_with_large_stderr_keeps_all_of_it() {
        let td = tempdir().unwrap();
        let body = r#"printf '<BlastOutput>\n<BlastOutput_iterations>\n'
i=1
while [ "$i" -le 3000 ]; do
  echo "Error: stub diagnostic line $i padded so that stderr alone overflows a pipe buffer" >&2
  printf '<Iteration><Iteration_iter-num>%d</Iteration_iter-num></Iteration>\n' "$i"
  i=$((i + 1))
done
printf '<Iteration><Iteration_iter-num>many</Iteration_iter-num></Iteration>\n'
exit 4"#;
        let blaster = ScriptBlaster::new(td.path(), body);
        let err = run_blast(&blaster).expect_err("malformed number");
        assert!(matches!(err, BlastError::Decode { .. }), "got: {err}");
        assert!(err.to_string().contains("'many'"), "got: {err}");
        assert_eq!(err.stderr().lines().count(), 3000);
        assert!(err.stderr().starts_with("Error: stub diagnostic line 1 "));
        assert!(
            err.stderr()
                .trim_end()
                .ends_with("line 3000 padded so that stderr alone overflows a pipe buffer")
        );
    }

    #[test]
    fn test_empty_stdout_is_decode_failure() {
        let td = tempdir().unwrap();
        let body = "echo 'Command line argument error: Argument \"db\". Mandatory' >&2\nexit 1";
        let blaster = ScriptBlaster::new(td.path(), body);
        let err = run_blast(&blaster).expect_err("no output");
        assert!(matches!(err, BlastError::Decode { .. }), "got: {err}");
        assert!(err.stderr().contains("Mandatory"));
    }

    #[test]
    fn test_early_decode_failure_drains_remaining_output() {
        let td = tempdir().unwrap();
        let body = r#"printf '<NotBlast/>\n'
i=0
while [ "$i" -lt 5000 ]; do
  echo "................................................................"
  i=$((i + 1))
done"#;
        let blaster = ScriptBlaster::new(td.path(), body);
        let err = run_blast(&blaster).expect_err("wrong root");
        assert!(matches!(err, BlastError::Decode { .. }), "got: {err}");
    }

    #[test]
    fn test_cancel_kills_running_search() {
        let td = tempdir().unwrap();
        let body = "printf '<BlastOutput><BlastOutput_iterations>'\necho 'searching' >&2\nexec sleep 30";
        let blaster = ScriptBlaster::new(td.path(), body);
        let cancel = CancelHandle::new();
        let remote = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            remote.cancel();
        });

        let start = Instant::now();
        let err = run_blast_with_cancel(&blaster, &cancel).expect_err("cancelled");
        canceller.join().unwrap();
        assert!(matches!(err, BlastError::Cancelled { .. }), "got: {err}");
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_cancel_kills_forked_helpers() {
        let td = tempdir().unwrap();
        // No exec: `sleep` is a grandchild holding both pipes open.
        let body = "printf '<BlastOutput><BlastOutput_iterations>'\nsleep 8\necho done";
        let blaster = ScriptBlaster::new(td.path(), body);
        let cancel = CancelHandle::new();
        let remote = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            remote.cancel();
        });

        let start = Instant::now();
        let err = run_blast_with_cancel(&blaster, &cancel).expect_err("cancelled");
        canceller.join().unwrap();
        assert!(matches!(err, BlastError::Cancelled { .. }), "got: {err}");
        assert!(
            start.elapsed() < Duration::from_secs(4),
            "took {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn test_cancel_after_finish_is_harmless() {
        let td = tempdir().unwrap();
        let blaster = ScriptBlaster::new(td.path(), MINIMAL_XML);
        let cancel = CancelHandle::new();
        run_blast_with_cancel(&blaster, &cancel).expect("stub run");
        cancel.cancel();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_cancel_before_launch() {
        let td = tempdir().unwrap();
        let blaster = ScriptBlaster::new(td.path(), "exec sleep 30");
        let cancel = CancelHandle::new();
        cancel.cancel();
        let start = Instant::now();
        let err = run_blast_with_cancel(&blaster, &cancel).expect_err("cancelled");
        assert!(matches!(err, BlastError::Cancelled { .. }), "got: {err}");
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
