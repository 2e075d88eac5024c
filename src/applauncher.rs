use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::thread;
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use crate::bottle::{Bottle, BottleId};
use crate::bottlemanager::BottleManager;
use crate::coordinator::{LaunchPermit, OperationCoordinator};
use crate::error::BottleError;
use crate::runner::RunnerRegistry;
use crate::util::find_case_insensitive_path;

/// How a launched program ended, as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    /// Killed by this signal number.
    Signal(i32),
    Unknown,
}

impl ExitStatus {
    #[must_use]
    pub fn success(self) -> bool {
        self == ExitStatus::Code(0)
    }

    #[must_use]
    pub fn code(self) -> Option<i32> {
        match self {
            ExitStatus::Code(code) => Some(code),
            _ => None,
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitStatus::Code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitStatus::Signal(signal);
            }
        }

        ExitStatus::Unknown
    }
}

impl Display for ExitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {code}"),
            ExitStatus::Signal(signal) => write!(f, "signal {signal}"),
            ExitStatus::Unknown => write!(f, "unknown status"),
        }
    }
}

struct Running {
    child: Child,
    _permit: LaunchPermit,
}

/// A program running inside a bottle.
///
/// Holds a launch permit on the bottle until the exit status has been collected. Dropping a
/// session that is still running does not stop the program; the permit is then released once it
/// exits on its own.
pub struct LaunchSession {
    bottle: BottleId,
    pid: u32,
    environment: BTreeMap<String, String>,
    started: DateTime<Utc>,
    running: Option<Running>,
    exit_status: Option<ExitStatus>,
}

impl LaunchSession {
    #[must_use]
    pub fn bottle_id(&self) -> BottleId {
        self.bottle
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The environment the program was started with. Inherited variables that are not valid
    /// UTF-8 are passed to the program but left out here.
    #[must_use]
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    #[must_use]
    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// The exit status, once [`LaunchSession::wait`] or [`LaunchSession::try_wait`] has seen it.
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Block the calling thread until the program exits.
    pub fn wait(&mut self) -> Result<ExitStatus, BottleError> {
        let Some(running) = self.running.as_mut() else {
            return Ok(self.exit_status.unwrap_or(ExitStatus::Unknown));
        };

        let status = ExitStatus::from(running.child.wait()?);
        Ok(self.finish(status))
    }

    /// Collect the exit status if the program has already exited.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, BottleError> {
        let Some(running) = self.running.as_mut() else {
            return Ok(self.exit_status);
        };

        Ok(running.child.try_wait()?.map(|status| self.finish(ExitStatus::from(status))))
    }

    fn finish(&mut self, status: ExitStatus) -> ExitStatus {
        self.running = None;
        self.exit_status = Some(status);
        info!("{} in bottle {} finished with {status}", self.pid, self.bottle);
        status
    }

    /// Ask the program to stop. It may take its time, or refuse; call
    /// [`LaunchSession::wait`] to see how it ended.
    pub fn terminate(&mut self) -> Result<(), BottleError> {
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };

        info!("asking {} in bottle {} to stop", self.pid, self.bottle);
        request_stop(&mut running.child)
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) -> Result<(), BottleError> {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return Err(BottleError::IOFailure(io::Error::from(io::ErrorKind::InvalidInput)));
    };

    // The child has not been reaped yet, so its pid cannot have been reused.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(BottleError::IOFailure(err))
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) -> Result<(), BottleError> {
    match child.kill() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(BottleError::IOFailure(e)),
    }
}

impl Drop for LaunchSession {
    fn drop(&mut self) {
        let Some(Running { mut child, _permit: permit }) = self.running.take() else {
            return;
        };

        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        debug!("session for {} dropped while running, reaping in the background", self.pid);
        let name = format!("reap-{}", self.pid);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            if let Err(e) = child.wait() {
                error!("failed to wait for {}: {e}", child.id());
            }
            drop(permit);
        });
        if let Err(e) = spawned {
            error!("failed to start reaper thread: {e}");
        }
    }
}

/// Starts programs inside bottles through their runner.
pub struct AppLauncher {
    bottles: Arc<BottleManager>,
    runners: Arc<RunnerRegistry>,
    coordinator: OperationCoordinator,
}

impl AppLauncher {
    pub fn new(bottles: Arc<BottleManager>, runners: Arc<RunnerRegistry>) -> Self {
        let coordinator = bottles.coordinator().clone();
        AppLauncher { bottles, runners, coordinator }
    }

    /// Start `executable` inside bottle `id` and return the running session.
    ///
    /// A relative `executable` is looked up under the bottle root, ignoring case. Spawn failures
    /// are reported as they happen and never retried.
    ///
    /// # Errors
    ///  - `Busy` while the bottle is being changed
    ///  - `NotFound` / `UnknownRunner` if the bottle or its runner is gone
    ///  - `Corrupt` if the bottle was left corrupt by a failed delete
    ///  - `ExecutableNotFound` if `executable` does not resolve to a file
    ///  - `SpawnFailed` if the OS could not start the runner
    pub fn launch<I, S>(&self, id: BottleId, executable: &Path, args: I) -> Result<LaunchSession, BottleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let permit = self.coordinator.begin_launch(id).map_err(|_| BottleError::Busy(id))?;

        let bottle = self.bottles.get(id)?;
        if bottle.is_corrupt() {
            return Err(BottleError::Corrupt { id, path: bottle.root().to_owned() });
        }

        let runner = self.runners.resolve(bottle.runner())?;

        // The child inherits the process environment as is; only these keys are replaced.
        let mut layered = runner.defaults(&bottle);
        bottle.overlay().layer_onto(&mut layered);
        trace!("environment for {id}: {layered:?}");

        let mut environment = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect::<BTreeMap<_, _>>();
        environment.extend(layered.clone());

        let target = resolve_executable(&bottle, executable)?;

        let mut cmd = Command::new(runner.executable());
        cmd.arg(&target)
            .args(args)
            .current_dir(bottle.root())
            .envs(&layered);
        debug!("{cmd:?}");

        let child = cmd.spawn().map_err(|source| {
            error!("failed to spawn {}: {source}", runner.executable().display());
            BottleError::SpawnFailed { path: runner.executable().to_owned(), source }
        })?;

        let pid = child.id();
        info!("started {} in bottle {} ({}) as {pid}", target.display(), bottle.name(), id);

        if let Err(e) = self.bottles.touch(id) {
            warn!("could not update last use of bottle {id}: {e}");
        }

        Ok(LaunchSession {
            bottle: id,
            pid,
            environment,
            started: Utc::now(),
            running: Some(Running { child, _permit: permit }),
            exit_status: None,
        })
    }

    pub fn wait(&self, session: &mut LaunchSession) -> Result<ExitStatus, BottleError> {
        session.wait()
    }

    pub fn terminate(&self, session: &mut LaunchSession) -> Result<(), BottleError> {
        session.terminate()
    }
}

fn resolve_executable(bottle: &Bottle, executable: &Path) -> Result<PathBuf, BottleError> {
    let path = if executable.is_absolute() {
        executable.to_owned()
    } else {
        let relative = find_case_insensitive_path(bottle.root(), executable)
            .ok_or_else(|| BottleError::ExecutableNotFound(executable.to_owned()))?;
        bottle.root().join(relative)
    };

    match path.metadata() {
        Ok(meta) if meta.is_file() => Ok(path),
        _ => Err(BottleError::ExecutableNotFound(executable.to_owned())),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};
    use crate::overlay::{Overlay, OverlayPatch};
    use crate::runner::Runner;
    use crate::store::EnvironmentStore;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        bottles: Arc<BottleManager>,
        launcher: AppLauncher,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let runners = Arc::new(RunnerRegistry::new());
        runners.register(Runner::new("wine-9.0", "9.0", "/bin/sh")
            .with_env("SHARED", "runner")
            .with_env("RUNNER_ONLY", "r")).unwrap();
        runners.register(Runner::new("broken", "0", tmp.path().join("no/such/wine"))).unwrap();

        let store = EnvironmentStore::open(tmp.path().join("bottles")).unwrap();
        let bottles = Arc::new(BottleManager::new(store, Arc::clone(&runners), OperationCoordinator::new(), true));
        let launcher = AppLauncher::new(Arc::clone(&bottles), runners);
        Fixture { tmp, bottles, launcher }
    }

    fn bottle_with_script(f: &Fixture, name: &str, script: &str) -> Bottle {
        let overlay: Overlay = [("SHARED", "bottle")].into_iter().collect();
        let bottle = f.bottles.create(name, "wine-9.0", overlay).unwrap();
        fs::write(bottle.root().join("setup.exe"), script).unwrap();
        bottle
    }

    fn no_args() -> [&'static str; 0] {
        []
    }

    #[test]
    fn launch_layers_environment_and_reports_the_real_exit_status() {
        let f = fixture();
        let bottle = bottle_with_script(&f, "Game1", "printf '%s %s' \"$SHARED\" \"$1\" > out.txt\nexit 3\n");

        let mut session = f.launcher.launch(bottle.id(), Path::new("setup.exe"), ["arg1"]).unwrap();
        let env = session.environment();
        assert_eq!(env["SHARED"], "bottle");
        assert_eq!(env["RUNNER_ONLY"], "r");
        assert_eq!(env["WINEPREFIX"], bottle.prefix().to_string_lossy());
        if let Ok(path) = std::env::var("PATH") {
            assert_eq!(env["PATH"], path);
        }

        assert_eq!(f.launcher.wait(&mut session).unwrap(), ExitStatus::Code(3));
        assert_eq!(session.exit_status(), Some(ExitStatus::Code(3)));
        assert_eq!(fs::read_to_string(bottle.root().join("out.txt")).unwrap(), "bottle arg1");
        assert!(f.bottles.coordinator().is_idle(bottle.id()));
    }

    #[test]
    fn relative_executables_resolve_without_regard_to_case() {
        let f = fixture();
        let bottle = bottle_with_script(&f, "Game1", "exit 0\n");

        let mut session = f.launcher.launch(bottle.id(), Path::new("SETUP.EXE"), no_args()).unwrap();
        assert!(session.wait().unwrap().success());
    }

    #[test]
    fn concurrent_launches_are_independent_and_block_configure() {
        let f = fixture();
        let bottle = bottle_with_script(&f, "Game1", "exec sleep 30\n");

        let mut first = f.launcher.launch(bottle.id(), Path::new("setup.exe"), no_args()).unwrap();
        let mut second = f.launcher.launch(bottle.id(), Path::new("setup.exe"), no_args()).unwrap();
        assert_ne!(first.pid(), second.pid());
        assert_eq!(f.bottles.coordinator().active_launches(bottle.id()), 2);

        let patch = OverlayPatch::new().set("A", "1");
        assert!(matches!(f.bottles.configure(bottle.id(), &patch), Err(BottleError::Busy(_))));
        assert!(matches!(f.bottles.delete(bottle.id()), Err(BottleError::InUse(_))));

        f.launcher.terminate(&mut first).unwrap();
        assert_eq!(first.wait().unwrap(), ExitStatus::Signal(libc::SIGTERM));
        assert!(matches!(f.bottles.configure(bottle.id(), &patch), Err(BottleError::Busy(_))));

        second.terminate().unwrap();
        assert!(!second.wait().unwrap().success());
        second.terminate().unwrap();

        assert!(f.bottles.configure(bottle.id(), &patch).is_ok());
    }

    #[test]
    fn launching_during_a_mutation_is_busy() {
        let f = fixture();
        let bottle = bottle_with_script(&f, "Game1", "exit 0\n");

        let _guard = f.bottles.coordinator().begin_mutation(bottle.id()).unwrap();
        let err = f.launcher.launch(bottle.id(), Path::new("setup.exe"), no_args()).err().unwrap();
        assert!(matches!(err, BottleError::Busy(_)));
    }

    #[test]
    fn missing_bottles_and_executables_are_reported() {
        let f = fixture();
        let bottle = bottle_with_script(&f, "Game1", "exit 0\n");

        let err = f.launcher.launch(BottleId::new(), Path::new("setup.exe"), no_args()).err().unwrap();
        assert!(matches!(err, BottleError::NotFound(_)));

        for exe in ["missing.exe", "../bottles", "pfx"] {
            let err = f.launcher.launch(bottle.id(), Path::new(exe), no_args()).err().unwrap();
            assert!(matches!(err, BottleError::ExecutableNotFound(_)), "{exe}");
        }
        assert!(f.bottles.coordinator().is_idle(bottle.id()));
    }

    #[test]
    fn absolute_executables_outside_the_bottle_are_allowed() {
        let f = fixture();
        let bottle = bottle_with_script(&f, "Game1", "exit 0\n");
        let outside = f.tmp.path().join("installer.sh");
        fs::write(&outside, "exit 7\n").unwrap();

        let mut session = f.launcher.launch(bottle.id(), &outside, no_args()).unwrap();
        assert_eq!(session.wait().unwrap().code(), Some(7));
    }

    #[test]
    fn spawn_failures_carry_the_os_error_and_release_the_bottle() {
        let f = fixture();
        let bottle = bottle_with_script(&f, "Game1", "exit 0\n");
        f.bottles.set_runner(bottle.id(), "broken").unwrap();

        let err = f.launcher.launch(bottle.id(), Path::new("setup.exe"), no_args()).err().unwrap();
        assert!(matches!(err, BottleError::SpawnFailed { .. }));
        assert_eq!(err.os_error_code(), Some(libc::ENOENT));
        assert!(f.bottles.coordinator().is_idle(bottle.id()));
    }

    #[test]
    fn launch_updates_last_used() {
        let f = fixture();
        let bottle = bottle_with_script(&f, "Game1", "exit 0\n");

        let mut session = f.launcher.launch(bottle.id(), Path::new("setup.exe"), no_args()).unwrap();
        session.wait().unwrap();
        assert!(f.bottles.get(bottle.id()).unwrap().last_used() >= bottle.last_used());
        assert!(session.started() >= bottle.created());
    }

    #[test]
    fn dropping_a_running_session_holds_the_bottle_until_exit() {
        let f = fixture();
        let bottle = bottle_with_script(&f, "Game1", "sleep 1\n");

        let session = f.launcher.launch(bottle.id(), Path::new("setup.exe"), no_args()).unwrap();
        drop(session);
        assert!(!f.bottles.coordinator().is_idle(bottle.id()));
        assert!(matches!(f.bottles.delete(bottle.id()), Err(BottleError::InUse(_))));
        assert!(matches!(f.bottles.configure(bottle.id(), &OverlayPatch::new()), Err(BottleError::Busy(_))));

        let deadline = Instant::now() + Duration::from_secs(10);
        while !f.bottles.coordinator().is_idle(bottle.id()) {
            assert!(Instant::now() < deadline, "bottle never became idle");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn inherited_variables_reach_the_program_even_when_not_utf8() {
        use std::os::unix::ffi::OsStrExt;

        std::env::set_var("BOTTLER_TEST_LATIN1", OsStr::from_bytes(b"caf\xe9"));
        let f = fixture();
        let bottle = bottle_with_script(&f, "Game1", "[ -n \"$BOTTLER_TEST_LATIN1\" ] && exit 0\nexit 9\n");

        let mut session = f.launcher.launch(bottle.id(), Path::new("setup.exe"), no_args()).unwrap();
        assert!(!session.environment().contains_key("BOTTLER_TEST_LATIN1"));
        assert_eq!(session.wait().unwrap(), ExitStatus::Code(0));
    }
}
