//! Fakes shared by unit and integration tests.
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex, MutexGuard, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use crate::command::{CommandOutput, CommandRunner};
use crate::error::CommandError;
use crate::privilege::PrivilegedExecutor;
use crate::status::warmup::Clock;

/// Global lock for environment variable modifications in tests.
/// All tests that modify environment variables (especially HOME) should acquire this lock
/// to prevent race conditions between parallel test executions.
pub static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// [`Clock`] that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.now) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *lock(&self.now)
    }
}

/// [`CommandRunner`] answering from a script keyed by the full command line
/// (`"program arg1 arg2"`). Queued answers are consumed in order and the last
/// one repeats. Unscripted commands exit 1 with no output.
#[derive(Default)]
pub struct FakeCommandRunner {
    responses: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `command` with `output` from now on.
    pub fn respond(&self, command: &str, output: CommandOutput) {
        lock(&self.responses).insert(command.to_string(), VecDeque::from([output]));
    }

    /// Answers `command` with each of `outputs` in turn, repeating the last.
    pub fn respond_sequence(&self, command: &str, outputs: Vec<CommandOutput>) {
        lock(&self.responses).insert(command.to_string(), outputs.into());
    }

    /// Scripts `launchctl print system/<label>` for `id`.
    pub fn service_status(&self, id: crate::descriptor::ServiceId, text: &str) {
        self.respond(
            &format!("launchctl print {}", id.target()),
            CommandOutput::success(text),
        );
    }

    /// Command lines run so far.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of recorded calls whose command line starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let command = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        lock(&self.calls).push(command.clone());

        let mut responses = lock(&self.responses);
        let output = match responses.get_mut(&command) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(output.unwrap_or_else(|| CommandOutput::failure(1, "")))
    }
}

/// One privileged call observed by [`RecordingExecutor`].
#[derive(Debug, Clone)]
pub struct Execution {
    pub script: String,
    pub prompt: String,
    pub started: Instant,
    pub finished: Instant,
}

type ExecuteHook = Box<dyn Fn(&str) + Send + Sync>;

/// [`PrivilegedExecutor`] that records every script instead of running it.
pub struct RecordingExecutor {
    output: CommandOutput,
    delay: Duration,
    hook: Option<ExecuteHook>,
    executions: Mutex<Vec<Execution>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::with_output(CommandOutput::success(""))
    }
}

impl RecordingExecutor {
    /// Executor whose every call returns `output`.
    pub fn with_output(output: CommandOutput) -> Self {
        Self {
            output,
            delay: Duration::ZERO,
            hook: None,
            executions: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Makes each call take `delay` before returning.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Runs `hook` with the script of each call, before it returns.
    pub fn on_execute(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn executions(&self) -> Vec<Execution> {
        lock(&self.executions).clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.executions().into_iter().map(|e| e.script).collect()
    }

    /// Highest number of calls that were ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrivilegedExecutor for RecordingExecutor {
    async fn execute(
        &self,
        script: &str,
        prompt: &str,
    ) -> Result<CommandOutput, CommandError> {
        let started = Instant::now();
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(hook) = &self.hook {
            hook(script);
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&self.executions).push(Execution {
            script: script.to_string(),
            prompt: prompt.to_string(),
            started,
            finished: Instant::now(),
        });
        Ok(self.output.clone())
    }
}

/// [`PrivilegedExecutor`] that runs scripts with `sh -c`, putting `bin_dir`
/// first on `PATH` so tests can stub privileged tools.
pub struct ShellExecutor {
    bin_dir: std::path::PathBuf,
}

impl ShellExecutor {
    pub fn new(bin_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
        }
    }
}

#[async_trait]
impl PrivilegedExecutor for ShellExecutor {
    async fn execute(
        &self,
        script: &str,
        _prompt: &str,
    ) -> Result<CommandOutput, CommandError> {
        let path = format!(
            "{}:{}",
            self.bin_dir.display(),
            std::env::var("PATH").unwrap_or_default()
        );
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .env("PATH", path)
            .output()
            .await
            .map_err(|source| CommandError::Launch {
                program: "sh".to_string(),
                source,
            })?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

