//! Sub-process execution for CGI-style scripts.
//!
//! The child's stdout is the response: every chunk is forwarded verbatim
//! to the client, so the script owns the Gemini header. stderr is drained
//! into the log. When the client disappears mid-stream the child is
//! terminated gracefully first and killed if it lingers.

use crate::prelude::*;
use std::ffi::OsString;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};

/// Grace period between the polite signal and the kill.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// A prepared sub-process: program, argv tail, environment and working
/// directory. Building one performs no I/O; [`Executor::run`] spawns.
#[derive(Debug)]
pub struct Executor {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(String, OsString)>,
    cwd: PathBuf,
}

impl Executor {
    /// Prepares to run `script`, through `interpreter` when one is
    /// configured for its extension. The working directory is the
    /// script's own.
    #[must_use]
    pub fn new(script: &Path, interpreter: Option<&Path>, env: Vec<(String, OsString)>) -> Self {
        let cwd = script
            .parent()
            .map_or_else(|| PathBuf::from("/"), Path::to_path_buf);
        let (program, args) = match interpreter {
            Some(interpreter) => (
                interpreter.to_path_buf(),
                vec![script.as_os_str().to_owned()],
            ),
            None => (script.to_path_buf(), Vec::new()),
        };
        Self {
            program,
            args,
            env,
            cwd,
        }
    }

    /// Spawns the child and streams its stdout to `client` in
    /// [`BUF_SIZE`] chunks until it exits or the client goes away.
    ///
    /// # Errors
    ///
    /// Only the spawn itself; the caller answers that with `42`. Runtime
    /// failures after the spawn are logged and end the stream.
    pub async fn run(self, client: &mut ClientConnection, pool: &BufferPool) -> io::Result<()> {
        debug!("spawning {} in {}", self.program.display(), self.cwd.display());
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_os_str())))
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let program = self.program.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("{}: {line}", program.display());
            }
        });

        let mut buf = pool.acquire();
        loop {
            let n = match stdout.read(&mut buf[..]).await {
                Ok(n) => n,
                Err(err) => {
                    warn!("reading {} output failed: {err}", self.program.display());
                    break;
                }
            };
            if n == 0 {
                break;
            }
            if client.send(&buf[..n]).await.is_err() {
                debug!("client left; terminating {}", self.program.display());
                terminate(&mut child).await;
                stderr_task.abort();
                return Ok(());
            }
        }

        match child.wait().await {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("{} exited with {status}", self.program.display()),
            Err(err) => warn!("waiting on {} failed: {err}", self.program.display()),
        }
        let _ = stderr_task.await;
        Ok(())
    }
}

/// Polite signal, then a kill once the grace period lapses.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if timeout(TERM_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

/// Resolves a configured interpreter against `PATH`. Called once per
/// configured extension at load time; this is the one sanctioned
/// synchronous filesystem touch outside startup file loading.
#[must_use]
pub fn find_program(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|joined| joined.is_file())
}
