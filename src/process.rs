//! Managed child processes.
//!
//! A [`ManagedProcess`] owns one OS child at a time. Each start spawns three
//! helper threads: a stdout pump, a stderr pump and a supervisor that polls the
//! child every [`SUPERVISOR_TICK`], refreshes its CPU affinity and stops it once
//! it has finished or outlived its timeout.
use serde::de::DeserializeOwned;
use std::{
    collections::HashSet,
    fmt,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex, OnceLock},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use rand::seq::SliceRandom;
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, info, warn};

#[cfg(unix)]
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
#[cfg(unix)]
use std::os::unix::process::CommandExt;

use crate::{
    codec,
    console::{Console, Stream},
    error::{DecodeError, ToolkitError},
};

/// Interval between supervisor polls.
pub const SUPERVISOR_TICK: Duration = Duration::from_millis(100);

/// Number of cores a process is pinned to unless told otherwise.
pub const DEFAULT_CORES: usize = 4;

/// How long `wait` lets the output pumps drain after the process exits.
/// Pumps still blocked afterwards (a backgrounded grandchild holding the pipe)
/// keep appending in the background.
const PUMP_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Strategy used to invoke the first argument of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum LaunchMode {
    /// Pick a mode from the target's file extension.
    #[default]
    Auto,
    /// Native command shell (`cmd /c` on Windows, `sh -c` elsewhere).
    Shell,
    /// POSIX shell script (`sh <file>`).
    Sh,
    /// `powershell -Command`.
    #[strum(serialize = "powershell")]
    PowerShell,
    /// `powershell -File`.
    #[strum(serialize = "powershell-file")]
    PowerShellFile,
    /// Python interpreter running a script file.
    Python,
    /// `python -m <module>`.
    PythonModule,
    /// Windows script host (`wscript`).
    ScriptHost,
    /// Execute the target itself.
    Direct,
}

impl LaunchMode {
    /// Maps a file extension to a mode. Unknown or missing extensions run directly.
    pub fn from_extension(ext: Option<&str>) -> Self {
        match ext.map(str::to_ascii_lowercase).as_deref() {
            Some("ps1") => LaunchMode::PowerShellFile,
            Some("py") => LaunchMode::Python,
            Some("exe") | Some("bat") => LaunchMode::Shell,
            Some("vbs") => LaunchMode::ScriptHost,
            Some("sh") => LaunchMode::Sh,
            _ => LaunchMode::Direct,
        }
    }

    /// Replaces `Auto` with the mode implied by `target`'s extension.
    pub fn resolve(self, target: &str) -> Self {
        match self {
            LaunchMode::Auto => {
                Self::from_extension(Path::new(target).extension().and_then(|e| e.to_str()))
            }
            mode => mode,
        }
    }

    /// Builds the full argument vector for `args` under this mode.
    pub fn command(self, args: &[String], interpreters: &Interpreters) -> Vec<String> {
        let first = args.first().map(String::as_str).unwrap_or_default();
        let prefix: Vec<String> = match self.resolve(first) {
            LaunchMode::Shell => shell_prefix(),
            LaunchMode::Sh => vec!["sh".into()],
            LaunchMode::PowerShell => vec!["powershell".into(), "-Command".into()],
            LaunchMode::PowerShellFile => vec!["powershell".into(), "-File".into()],
            LaunchMode::Python => vec![interpreters.python.clone()],
            LaunchMode::PythonModule => vec![interpreters.python.clone(), "-m".into()],
            LaunchMode::ScriptHost => vec!["wscript".into()],
            LaunchMode::Direct | LaunchMode::Auto => Vec::new(),
        };
        prefix.into_iter().chain(args.iter().cloned()).collect()
    }
}

#[cfg(windows)]
fn shell_prefix() -> Vec<String> {
    vec!["cmd".into(), "/c".into()]
}

// `"$0" "$@"` runs the first argument with the rest passed through verbatim.
#[cfg(not(windows))]
fn shell_prefix() -> Vec<String> {
    vec!["sh".into(), "-c".into(), "\"$0\" \"$@\"".into()]
}

/// Interpreter executables used by the interpreter launch modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreters {
    pub python: String,
}

impl Default for Interpreters {
    fn default() -> Self {
        Self {
            python: if cfg!(windows) { "python" } else { "python3" }.to_string(),
        }
    }
}

/// Everything needed to (re)start a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Target locator followed by its arguments.
    pub args: Vec<String>,
    pub mode: LaunchMode,
    /// Working directory; the caller's when `None`.
    pub working_dir: Option<PathBuf>,
    /// Keep output off the console (it is still buffered).
    pub hide: bool,
    /// Block in `launch`/`restart` until the process exits.
    pub wait: bool,
    pub timeout: Option<Duration>,
    /// Size of the CPU affinity set.
    pub cores: usize,
    /// Run with administrator rights.
    pub elevated: bool,
}

impl LaunchSpec {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            mode: LaunchMode::Auto,
            working_dir: None,
            hide: false,
            wait: false,
            timeout: None,
            cores: DEFAULT_CORES,
            elevated: false,
        }
    }

    pub fn mode(mut self, mode: LaunchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn hide(mut self, hide: bool) -> Self {
        self.hide = hide;
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    /// Resolves the argument vector that will actually be executed.
    pub fn command(&self, interpreters: &Interpreters) -> Result<Vec<String>, ToolkitError> {
        if self.args.is_empty() {
            return Err(ToolkitError::Spawn {
                command: String::new(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "no executable given",
                ),
            });
        }

        let mut command = self.mode.command(&self.args, interpreters);
        if self.elevated && needs_elevation() {
            command.insert(0, "sudo".to_string());
        }
        Ok(command)
    }
}

#[cfg(unix)]
fn needs_elevation() -> bool {
    !nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn needs_elevation() -> bool {
    warn!("Elevation requested but unsupported on this platform");
    false
}

/// How a process came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ExitReason {
    /// Exited on its own.
    Finished,
    /// Killed by `stop()`.
    Stopped,
    /// Killed by the supervisor after the timeout elapsed.
    TimedOut,
}

/// Decoding applied by [`ManagedProcess::output`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    /// Trimmed text.
    #[default]
    Raw,
    Json,
    Hex,
}

/// Decoded process output.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Text(String),
    Json(serde_json::Value),
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Text(text) => write!(f, "{text}"),
            Output::Json(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Stopwatch {
    started: Instant,
    stopped: Option<Instant>,
}

impl Stopwatch {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            stopped: None,
        }
    }

    fn stop(&mut self) {
        self.stopped.get_or_insert_with(Instant::now);
    }

    fn elapsed(&self) -> Duration {
        self.stopped
            .unwrap_or_else(Instant::now)
            .duration_since(self.started)
    }
}

/// State of one spawned OS process, shared with its helper threads.
#[derive(Debug)]
struct Run {
    pid: u32,
    child: Mutex<Child>,
    stdout: Mutex<String>,
    stderr: Mutex<String>,
    stopwatch: Mutex<Stopwatch>,
    timeout: Option<Duration>,
    exit_reason: Mutex<Option<ExitReason>>,
}

impl Run {
    fn finished(&self) -> bool {
        let Ok(mut child) = self.child.lock() else {
            return true;
        };
        match child.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(err) => {
                debug!("Unable to poll process {}: {err}", self.pid);
                true
            }
        }
    }

    fn timed_out(&self) -> Option<bool> {
        let timeout = self.timeout?;
        let elapsed = self.stopwatch.lock().ok()?.elapsed();
        Some(elapsed >= timeout)
    }

    fn elapsed(&self) -> Duration {
        self.stopwatch
            .lock()
            .map(|stopwatch| stopwatch.elapsed())
            .unwrap_or_default()
    }

    fn exit_code(&self) -> Option<i32> {
        let mut child = self.child.lock().ok()?;
        child.try_wait().ok().flatten().and_then(|status| status.code())
    }

    fn record_exit(&self, reason: ExitReason) {
        if let Ok(mut slot) = self.exit_reason.lock() {
            slot.get_or_insert(reason);
        }
    }

    /// Kills the process (and its group) unless it already exited, then reaps it.
    fn stop(&self, reason: ExitReason) -> Result<(), ToolkitError> {
        {
            let mut child = self.child.lock()?;
            if child.try_wait()?.is_none() {
                debug!("Killing process {} ({reason})", self.pid);
                kill(self.pid, &mut child)?;
                child.wait()?;
                self.record_exit(reason);
            } else {
                self.record_exit(ExitReason::Finished);
            }
        }

        self.stopwatch.lock()?.stop();
        live_groups_remove(self.pid);
        Ok(())
    }

    fn append(&self, stream: Stream, line: &str) {
        let buffer = match stream {
            Stream::Out => &self.stdout,
            Stream::Err => &self.stderr,
        };
        if let Ok(mut buffer) = buffer.lock() {
            buffer.push_str(line);
        }
    }

    fn reset_stdout(&self) {
        if let Ok(mut buffer) = self.stdout.lock() {
            buffer.clear();
        }
    }
}

#[cfg(unix)]
fn kill(pid: u32, child: &mut Child) -> std::io::Result<()> {
    match signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!("killpg({pid}) failed ({err}); killing the process directly");
            child.kill()
        }
    }
}

#[cfg(not(unix))]
fn kill(_pid: u32, child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

static LIVE_GROUPS: OnceLock<Mutex<HashSet<u32>>> = OnceLock::new();

fn live_groups() -> &'static Mutex<HashSet<u32>> {
    LIVE_GROUPS.get_or_init(|| Mutex::new(HashSet::new()))
}

fn live_groups_insert(pid: u32) {
    if let Ok(mut groups) = live_groups().lock() {
        groups.insert(pid);
    }
}

fn live_groups_remove(pid: u32) {
    if let Ok(mut groups) = live_groups().lock() {
        groups.remove(&pid);
    }
}

/// Kills every process group still owned by a `ManagedProcess` in this
/// process. Intended for signal handlers on the way out.
pub fn kill_all() {
    let pids: Vec<u32> = match live_groups().lock() {
        Ok(mut groups) => groups.drain().collect(),
        Err(_) => return,
    };

    for pid in pids {
        kill_group(pid);
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    if let Err(err) = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!("Failed to kill process group {pid}: {err}");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Randomly ordered `count` cores drawn from `pool`.
fn shuffled_cores(mut pool: Vec<usize>, count: usize) -> Vec<usize> {
    pool.shuffle(&mut rand::rng());
    pool.truncate(count.max(1));
    pool
}

#[cfg(target_os = "linux")]
fn apply_affinity(pid: u32, cores: usize) {
    use nix::sched::{CpuSet, sched_getaffinity, sched_setaffinity};

    let allowed = match sched_getaffinity(Pid::from_raw(0)) {
        Ok(set) => set,
        Err(err) => {
            debug!("Unable to read CPU affinity: {err}");
            return;
        }
    };
    let pool: Vec<usize> = (0..CpuSet::count())
        .filter(|&cpu| allowed.is_set(cpu).unwrap_or(false))
        .collect();

    let mut set = CpuSet::new();
    for cpu in shuffled_cores(pool, cores) {
        if let Err(err) = set.set(cpu) {
            debug!("Skipping CPU {cpu}: {err}");
        }
    }

    // The process may have exited since the last poll.
    if let Err(err) = sched_setaffinity(Pid::from_raw(pid as i32), &set) {
        debug!("Failed to set CPU affinity for {pid}: {err}");
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_affinity(_pid: u32, _cores: usize) {}

fn spawn_pump<R>(
    run: Arc<Run>,
    reader: R,
    stream: Stream,
    console: Console,
    hide: bool,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!("Output pump for {} stopped: {err}", run.pid);
                    break;
                }
            }

            let line = String::from_utf8_lossy(&raw);
            if stream == Stream::Out && codec::is_clear_marker(&line) {
                run.reset_stdout();
                if !hide {
                    console.clear();
                }
                continue;
            }

            run.append(stream, &line);
            if !hide {
                console.write_line(stream, &line);
            }
        }
    })
}

fn spawn_supervisor(run: Arc<Run>, cores: usize) -> JoinHandle<()> {
    thread::spawn(move || {
        loop {
            thread::sleep(SUPERVISOR_TICK);

            let reason = if run.finished() {
                Some(ExitReason::Finished)
            } else if run.timed_out() == Some(true) {
                info!("Process {} timed out after {:?}", run.pid, run.timeout);
                Some(ExitReason::TimedOut)
            } else {
                None
            };

            if let Some(reason) = reason {
                if let Err(err) = run.stop(reason) {
                    warn!("Failed to stop process {}: {err}", run.pid);
                }
                return;
            }

            apply_affinity(run.pid, cores);
        }
    })
}

#[derive(Debug, Default)]
struct Helpers {
    supervisor: Option<JoinHandle<()>>,
    pumps: Vec<JoinHandle<()>>,
}

/// A supervised OS process with buffered output.
#[derive(Debug)]
pub struct ManagedProcess {
    spec: LaunchSpec,
    command: Vec<String>,
    console: Console,
    run: Arc<Run>,
    helpers: Mutex<Helpers>,
}

impl ManagedProcess {
    /// Spawns the process described by `spec`, blocking until it exits when
    /// `spec.wait` is set.
    pub fn launch(
        spec: LaunchSpec,
        interpreters: &Interpreters,
        console: &Console,
    ) -> Result<Self, ToolkitError> {
        let command = spec.command(interpreters)?;
        let (run, helpers) = Self::spawn(&command, &spec, console)?;

        let process = Self {
            spec,
            command,
            console: console.clone(),
            run,
            helpers: Mutex::new(helpers),
        };

        if process.spec.wait {
            process.wait();
        }
        Ok(process)
    }

    fn spawn(
        command: &[String],
        spec: &LaunchSpec,
        console: &Console,
    ) -> Result<(Arc<Run>, Helpers), ToolkitError> {
        let command_line = command.join(" ");
        let (program, rest) = command.split_first().ok_or_else(|| ToolkitError::Spawn {
            command: command_line.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group so `stop` takes wrapper shells' children down too.
        #[cfg(unix)]
        cmd.process_group(0);

        debug!("Executing command: {cmd:?}");
        let mut child = cmd.spawn().map_err(|source| ToolkitError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let pid = child.id();
        debug!("Started `{command_line}` with PID {pid}");
        live_groups_insert(pid);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = Arc::new(Run {
            pid,
            child: Mutex::new(child),
            stdout: Mutex::new(String::new()),
            stderr: Mutex::new(String::new()),
            stopwatch: Mutex::new(Stopwatch::start()),
            timeout: spec.timeout,
            exit_reason: Mutex::new(None),
        });

        let mut pumps = Vec::with_capacity(2);
        if let Some(out) = stdout {
            pumps.push(spawn_pump(
                run.clone(),
                out,
                Stream::Out,
                console.clone(),
                spec.hide,
            ));
        }
        if let Some(err) = stderr {
            pumps.push(spawn_pump(
                run.clone(),
                err,
                Stream::Err,
                console.clone(),
                spec.hide,
            ));
        }
        let supervisor = spawn_supervisor(run.clone(), spec.cores);

        Ok((
            run,
            Helpers {
                supervisor: Some(supervisor),
                pumps,
            },
        ))
    }

    /// Blocks until the process has exited and its output has drained.
    pub fn wait(&self) {
        let helpers = match self.helpers.lock() {
            Ok(mut helpers) => std::mem::take(&mut *helpers),
            Err(_) => return,
        };

        if let Some(supervisor) = helpers.supervisor
            && supervisor.join().is_err()
        {
            warn!("Supervisor for process {} panicked", self.run.pid);
        }

        let deadline = Instant::now() + PUMP_DRAIN_GRACE;
        while !helpers.pumps.iter().all(JoinHandle::is_finished) && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }

        let mut detached = 0;
        for pump in helpers.pumps {
            if pump.is_finished() {
                let _ = pump.join();
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            debug!(
                "{detached} output pump(s) for process {} still held open by descendants",
                self.run.pid
            );
        }
    }

    /// True once the OS process has exited.
    pub fn finished(&self) -> bool {
        self.run.finished()
    }

    /// `Some(elapsed >= timeout)` when a timeout is configured.
    pub fn timed_out(&self) -> Option<bool> {
        self.run.timed_out()
    }

    /// Forcibly terminates the process and halts its stopwatch. Idempotent.
    pub fn stop(&self) -> Result<(), ToolkitError> {
        self.run.stop(ExitReason::Stopped)
    }

    /// Stops the current process and starts a fresh one with the same spec.
    /// Output buffers start empty again.
    pub fn restart(&mut self) -> Result<(), ToolkitError> {
        self.stop()?;
        self.wait();

        let (run, helpers) = Self::spawn(&self.command, &self.spec, &self.console)?;
        self.run = run;
        self.helpers = Mutex::new(helpers);

        if self.spec.wait {
            self.wait();
        }
        Ok(())
    }

    pub fn pid(&self) -> u32 {
        self.run.pid
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    /// The argument vector that was executed.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn elapsed(&self) -> Duration {
        self.run.elapsed()
    }

    /// Exit code once the process has exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.run.exit_code()
    }

    /// Why the process ended, `None` while it is running or not yet observed.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.run.exit_reason.lock().ok().and_then(|reason| *reason)
    }

    /// Everything captured on stdout so far.
    pub fn stdout(&self) -> String {
        self.run
            .stdout
            .lock()
            .map(|buffer| buffer.clone())
            .unwrap_or_default()
    }

    /// Everything captured on stderr so far.
    pub fn stderr(&self) -> String {
        self.run
            .stderr
            .lock()
            .map(|buffer| buffer.clone())
            .unwrap_or_default()
    }

    /// Captured stdout, trimmed and decoded as requested.
    pub fn output(&self, format: OutputFormat) -> Result<Output, ToolkitError> {
        let text = self.stdout();
        let trimmed = text.trim();
        match format {
            OutputFormat::Raw => Ok(Output::Text(trimmed.to_string())),
            OutputFormat::Json => {
                let value = serde_json::from_str(trimmed).map_err(DecodeError::from)?;
                Ok(Output::Json(value))
            }
            OutputFormat::Hex => Ok(Output::Text(codec::decode(trimmed)?)),
        }
    }

    /// Captured stdout parsed as JSON into `T`.
    pub fn output_json<T: DeserializeOwned>(&self) -> Result<T, ToolkitError> {
        let text = self.stdout();
        Ok(serde_json::from_str(text.trim()).map_err(DecodeError::from)?)
    }
}

/// Seam through which modules launch processes.
pub trait Launcher: Send + Sync + fmt::Debug {
    fn launch(
        &self,
        spec: LaunchSpec,
        console: &Console,
    ) -> Result<ManagedProcess, ToolkitError>;
}

/// Launcher that spawns real OS processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    interpreters: Interpreters,
}

impl ProcessLauncher {
    pub fn new(interpreters: Interpreters) -> Self {
        Self { interpreters }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(
        &self,
        spec: LaunchSpec,
        console: &Console,
    ) -> Result<ManagedProcess, ToolkitError> {
        ManagedProcess::launch(spec, &self.interpreters, console)
    }
}
