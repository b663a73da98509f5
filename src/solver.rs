//! Locating and running the cupSODA binary.
//!
//! The binary is looked up once per `SolverLocator`, in this order:
//!
//! 1. An explicit directory given with `SolverLocator::with_path`
//! 2. The directory named by the `CUPSODAPATH` environment variable
//! 3. The standard install locations in `DEFAULT_SEARCH_DIRS`
//!
//! A set but unusable `CUPSODAPATH` is an error; it does not fall through to
//! the standard locations.

use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::OnceLock;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use itertools::Itertools;
use log::{debug, info};

use crate::{config::MemoryUsage, errors::SimulatorError};

/// Environment variable naming the directory that holds the binary.
pub const CUPSODA_PATH_ENV: &str = "CUPSODAPATH";

/// File name of the solver executable.
pub const BINARY_NAME: &str = "cupSODA";

/// Standard install locations, searched in order.
pub const DEFAULT_SEARCH_DIRS: [&str; 2] = ["/usr/local/share/cupSODA", "c:/Program Files/cupSODA"];

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long the pipe readers get to finish after a timeout kill.
const KILL_GRACE: Duration = Duration::from_millis(100);

/// Finds the cupSODA executable and remembers where it is.
#[derive(Debug, Default)]
pub struct SolverLocator {
    explicit: Option<PathBuf>,
    resolved: OnceLock<PathBuf>,
}

impl SolverLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `dir/cupSODA`, skipping the environment and the standard locations.
    pub fn with_path(dir: impl Into<PathBuf>) -> Self {
        Self {
            explicit: Some(dir.into()),
            resolved: OnceLock::new(),
        }
    }

    /// Path of the executable, resolved on first use.
    pub fn locate(&self) -> Result<PathBuf, SimulatorError> {
        if let Some(path) = self.resolved.get() {
            return Ok(path.clone());
        }
        let env_dir = std::env::var_os(CUPSODA_PATH_ENV);
        let search: Vec<&Path> = DEFAULT_SEARCH_DIRS.iter().map(Path::new).collect();
        let path = resolve(self.explicit.as_deref(), env_dir.as_deref(), &search)?;
        debug!("Using cupSODA binary at {}", path.display());
        Ok(self.resolved.get_or_init(|| path).clone())
    }
}

/// Applies the lookup order to the given candidates.
pub fn resolve(
    explicit: Option<&Path>,
    env_dir: Option<&OsStr>,
    search_dirs: &[&Path],
) -> Result<PathBuf, SimulatorError> {
    if let Some(dir) = explicit {
        return check_bin_dir(dir);
    }
    if let Some(dir) = env_dir {
        return check_bin_dir(Path::new(dir)).map_err(|e| {
            SimulatorError::SolverNotFound(format!(
                "environment variable {CUPSODA_PATH_ENV} is set but unusable: {e}"
            ))
        });
    }
    search_dirs
        .iter()
        .find_map(|dir| check_bin_dir(dir).ok())
        .ok_or_else(|| {
            SimulatorError::SolverNotFound(format!(
                "could not find {BINARY_NAME} in any of:\n    {}\nput the executable (or a link to it) \
                 in one of these locations, set {CUPSODA_PATH_ENV}, or pass an explicit path",
                search_dirs.iter().map(|d| d.display()).join("\n    ")
            ))
        })
}

/// Full path of the executable in `dir`, if it is an executable regular file.
pub fn check_bin_dir(dir: &Path) -> Result<PathBuf, SimulatorError> {
    let path = dir.join(BINARY_NAME);
    let metadata = match std::fs::metadata(&path) {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => {
            return Err(SimulatorError::SolverNotFound(format!(
                "no {BINARY_NAME} binary in {}",
                dir.display()
            )))
        }
    };
    if !is_executable(&metadata) {
        return Err(SimulatorError::SolverNotFound(format!(
            "{BINARY_NAME} binary in {} does not have executable permissions",
            dir.display()
        )));
    }
    Ok(path)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

/// One cupSODA invocation.
#[derive(Debug, Clone)]
pub struct SolverCommand {
    pub binary: PathBuf,
    pub input_dir: PathBuf,
    pub n_blocks: usize,
    pub output_dir: PathBuf,
    pub prefix: String,
    pub gpu: usize,
    pub memory_usage: MemoryUsage,
    pub verbose: bool,
}

/// Captured process output.
#[derive(Debug, Clone, Default)]
pub struct SolverOutput {
    pub stdout: String,
    pub stderr: String,
}

impl SolverOutput {
    fn combined(&self) -> String {
        format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end())
    }
}

impl SolverCommand {
    /// Positional arguments, in the order cupSODA expects them:
    /// input dir, blocks, output dir, prefix, gpu, fitness flag, memory code, dump flag.
    pub fn args(&self) -> Vec<OsString> {
        vec![
            self.input_dir.clone().into_os_string(),
            self.n_blocks.to_string().into(),
            self.output_dir.clone().into_os_string(),
            self.prefix.clone().into(),
            self.gpu.to_string().into(),
            "0".into(),
            self.memory_usage.code().to_string().into(),
            if self.verbose { "1" } else { "0" }.into(),
        ]
    }

    /// Runs cupSODA to completion.
    ///
    /// stdout and stderr are drained on their own threads so neither pipe can
    /// fill up and stall the child. In verbose mode stdout lines are logged as
    /// they arrive.
    ///
    /// # Errors
    /// * `Io` if the process cannot be started
    /// * `SolverExecution` on a non-zero exit or when `timeout` elapses
    pub fn run(&self, timeout: Option<Duration>) -> Result<SolverOutput, SimulatorError> {
        let args = self.args();
        info!(
            "Running cupSODA: {} {}",
            self.binary.display(),
            args.iter().map(|a| a.to_string_lossy()).join(" ")
        );

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let verbose = self.verbose;
        let stdout = child.stdout.take().map(|pipe| {
            thread::spawn(move || {
                let mut captured = String::new();
                for line in BufReader::new(pipe).split(b'\n').map_while(Result::ok) {
                    let line = String::from_utf8_lossy(&line);
                    if verbose {
                        info!("cupSODA: {line}");
                    }
                    captured.push_str(&line);
                    captured.push('\n');
                }
                captured
            })
        });
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let status = wait(&mut child, timeout);
        let killed = matches!(status, Ok(None));
        let output = SolverOutput {
            stdout: join(stdout, killed),
            stderr: join(stderr, killed),
        };

        match status? {
            Some(status) if status.success() => Ok(output),
            Some(status) => Err(SimulatorError::SolverExecution {
                status: status.to_string(),
                output: output.combined(),
            }),
            None => Err(SimulatorError::SolverExecution {
                status: format!("killed after timeout of {:?}", timeout.unwrap_or_default()),
                output: output.combined(),
            }),
        }
    }
}

/// Waits for `child`; `None` means it was killed at the deadline.
fn wait(child: &mut Child, timeout: Option<Duration>) -> std::io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Collects a reader thread's output.
///
/// After a kill, descendants of the solver may still hold the pipe open, so the
/// reader only gets `KILL_GRACE` to finish and is otherwise left detached.
fn join(handle: Option<JoinHandle<String>>, killed: bool) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    if killed {
        let deadline = Instant::now() + KILL_GRACE;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                debug!("cupSODA output pipe still open after kill, not waiting for it");
                return String::new();
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
    handle.join().unwrap_or_default()
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Writes an executable `cupSODA` shell script into `dir`.
    pub(crate) fn fake_cupsoda(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join(BINARY_NAME);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn command(binary: PathBuf, verbose: bool) -> SolverCommand {
        SolverCommand {
            binary,
            input_dir: PathBuf::from("/tmp/in"),
            n_blocks: 3,
            output_dir: PathBuf::from("/tmp/out"),
            prefix: "model".to_string(),
            gpu: 1,
            memory_usage: MemoryUsage::SharedConstant,
            verbose,
        }
    }

    #[test]
    fn test_argument_protocol() {
        let args = command(PathBuf::from("cupSODA"), true).args();
        let args: Vec<_> = args.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            vec!["/tmp/in", "3", "/tmp/out", "model", "1", "0", "2", "1"]
        );
    }

    #[test]
    fn test_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cupsoda(dir.path(), "exit 0");
        let locator = SolverLocator::with_path(dir.path());
        assert_eq!(locator.locate().unwrap(), binary);
        // memoized
        std::fs::remove_file(&binary).unwrap();
        assert_eq!(locator.locate().unwrap(), binary);
    }

    #[test]
    fn test_explicit_path_wins_over_env_and_search_dirs() {
        let explicit = tempfile::tempdir().unwrap();
        let env_dir = tempfile::tempdir().unwrap();
        let search_dir = tempfile::tempdir().unwrap();
        let explicit_binary = fake_cupsoda(explicit.path(), "exit 0");
        fake_cupsoda(env_dir.path(), "exit 0");
        fake_cupsoda(search_dir.path(), "exit 0");

        let found = resolve(
            Some(explicit.path()),
            Some(env_dir.path().as_os_str()),
            &[search_dir.path()],
        )
        .unwrap();
        assert_eq!(found, explicit_binary);
    }

    #[test]
    fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_bin_dir(dir.path()).unwrap_err();
        assert!(matches!(err, SimulatorError::SolverNotFound(_)));

        std::fs::create_dir(dir.path().join(BINARY_NAME)).unwrap();
        assert!(check_bin_dir(dir.path()).is_err());
    }

    #[test]
    fn test_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BINARY_NAME);
        std::fs::write(&path, "").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let err = check_bin_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("executable permissions"));
    }

    #[test]
    fn test_env_takes_precedence_over_search_dirs() {
        let env_dir = tempfile::tempdir().unwrap();
        let search_dir = tempfile::tempdir().unwrap();
        let env_binary = fake_cupsoda(env_dir.path(), "exit 0");
        fake_cupsoda(search_dir.path(), "exit 0");

        let found = resolve(
            None,
            Some(env_dir.path().as_os_str()),
            &[search_dir.path()],
        )
        .unwrap();
        assert_eq!(found, env_binary);
    }

    #[test]
    fn test_unusable_env_does_not_fall_through() {
        let empty = tempfile::tempdir().unwrap();
        let search_dir = tempfile::tempdir().unwrap();
        fake_cupsoda(search_dir.path(), "exit 0");

        let err = resolve(None, Some(empty.path().as_os_str()), &[search_dir.path()]).unwrap_err();
        assert!(err.to_string().contains(CUPSODA_PATH_ENV));
    }

    #[test]
    fn test_search_dirs_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let binary = fake_cupsoda(second.path(), "exit 0");
        assert_eq!(
            resolve(None, None, &[first.path(), second.path()]).unwrap(),
            binary
        );
        assert!(matches!(
            resolve(None, None, &[first.path()]),
            Err(SimulatorError::SolverNotFound(_))
        ));
    }

    #[test]
    fn test_run_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cupsoda(dir.path(), "echo \"args: $*\"\necho warn >&2");
        let output = command(binary, true).run(None).unwrap();
        assert_eq!(output.stdout, "args: /tmp/in 3 /tmp/out model 1 0 2 1\n");
        assert_eq!(output.stderr, "warn\n");
    }

    #[test]
    fn test_run_failure_includes_output() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cupsoda(dir.path(), "echo partial\necho boom >&2\nexit 1");
        match command(binary, false).run(None) {
            Err(SimulatorError::SolverExecution { status, output }) => {
                assert!(status.contains('1'));
                assert_eq!(output, "partial\nboom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_run_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cupsoda(dir.path(), "exec sleep 10");
        let start = Instant::now();
        let err = command(binary, false)
            .run(Some(Duration::from_millis(200)))
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, SimulatorError::SolverExecution { status, .. } if status.contains("timeout")));
    }

    #[test]
    fn test_run_timeout_with_forked_child() {
        // the shell forks `sleep`, which keeps the pipes open after the shell is killed
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cupsoda(dir.path(), "sleep 4\necho done");
        let start = Instant::now();
        let err = command(binary, false)
            .run(Some(Duration::from_millis(200)))
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, SimulatorError::SolverExecution { status, .. } if status.contains("timeout")));
    }
}
