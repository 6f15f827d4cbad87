use crate::error::ProvisionError;
use crate::runner;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime};
use wait_timeout::ChildExt;

/// Dependency manifest installed into every environment.
pub const MANIFEST: &str = include_str!("../assets/requirements.txt");

const ENV_DIR: &str = "venv";
const STAMP_FILE: &str = "venv.ready";
const MANIFEST_COPY: &str = "requirements.txt";
const LOCK_FILE: &str = "provision.lock";
/// A lock older than this is left over from a crashed run.
pub const STALE_LOCK_AFTER: Duration = Duration::from_secs(2 * 60 * 60);

/// A complete isolated interpreter environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeEnvironment {
    pub root: PathBuf,
    pub python: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub base_dir: PathBuf,
    /// Candidate launchers in probe order, each a program plus leading arguments.
    pub launchers: Vec<Vec<String>>,
    pub min_python: (u32, u32),
    pub probe_timeout: Duration,
    pub manifest: String,
    pub stale_lock_after: Duration,
}

pub fn default_launchers() -> Vec<Vec<String>> {
    let list: &[&[&str]] = if cfg!(windows) {
        &[&["py", "-3"], &["py"], &["python"], &["python3"]]
    } else {
        &[&["python3"], &["python"]]
    };
    list.iter()
        .map(|l| l.iter().map(|s| (*s).to_string()).collect())
        .collect()
}

pub fn interpreter_in(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("Scripts").join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}

/// Exclusive marker held while an environment is being inspected or built.
struct ProvisionLock {
    path: PathBuf,
}

impl ProvisionLock {
    fn acquire(path: PathBuf, stale_after: Duration) -> Result<Self, ProvisionError> {
        if Self::create(&path)? {
            return Ok(Self { path });
        }
        if let Some(age) = lock_age(&path).filter(|age| *age >= stale_after) {
            log::warn!("[venv] removing stale lock {} ({}s old)", path.display(), age.as_secs());
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(ProvisionError::io(format!("failed to remove {}", path.display()), err)),
            }
            if Self::create(&path)? {
                return Ok(Self { path });
            }
        }
        Err(ProvisionError::Locked { path })
    }

    fn create(path: &Path) -> Result<bool, ProvisionError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(ProvisionError::io(format!("failed to create {}", path.display()), err)),
        }
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

impl Drop for ProvisionLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            log::warn!("[venv] could not remove {}: {err}", self.path.display());
        }
    }
}

pub struct Provisioner {
    settings: ProvisionSettings,
    cached: Option<RuntimeEnvironment>,
}

impl Provisioner {
    pub fn new(settings: ProvisionSettings) -> Self {
        Self {
            settings,
            cached: None,
        }
    }

    pub fn env_dir(&self) -> PathBuf {
        self.settings.base_dir.join(ENV_DIR)
    }

    fn stamp_path(&self) -> PathBuf {
        self.settings.base_dir.join(STAMP_FILE)
    }

    fn manifest_copy(&self) -> PathBuf {
        self.settings.base_dir.join(MANIFEST_COPY)
    }

    /// Interpreter present, stamp written, and the installed manifest is the current one.
    pub fn is_ready(&self) -> bool {
        let installed = fs::read_to_string(self.manifest_copy()).ok();
        interpreter_in(&self.env_dir()).is_file()
            && self.stamp_path().is_file()
            && installed.as_deref() == Some(self.settings.manifest.as_str())
    }

    fn environment(&self) -> RuntimeEnvironment {
        let root = self.env_dir();
        RuntimeEnvironment {
            python: interpreter_in(&root),
            root,
        }
    }

    fn reuse_ready(&mut self) -> Option<RuntimeEnvironment> {
        if !self.is_ready() {
            return None;
        }
        let env = self.environment();
        log::info!("[venv] using environment at {}", env.root.display());
        self.cached = Some(env.clone());
        Some(env)
    }

    pub fn ensure_environment(&mut self) -> Result<RuntimeEnvironment, ProvisionError> {
        if let Some(env) = &self.cached {
            if env.python.is_file() {
                return Ok(env.clone());
            }
        }
        if let Some(env) = self.reuse_ready() {
            return Ok(env);
        }
        let base = self.settings.base_dir.clone();
        fs::create_dir_all(&base)
            .map_err(|e| ProvisionError::io(format!("failed to create {}", base.display()), e))?;
        let _lock = ProvisionLock::acquire(base.join(LOCK_FILE), self.settings.stale_lock_after)?;
        // another run may have finished the build while we waited for the lock
        if let Some(env) = self.reuse_ready() {
            return Ok(env);
        }

        let env_dir = self.env_dir();
        let _ = fs::remove_file(self.stamp_path());
        if env_dir.exists() {
            log::warn!("[venv] incomplete environment at {}, recreating", env_dir.display());
            fs::remove_dir_all(&env_dir)
                .map_err(|e| ProvisionError::io(format!("failed to remove {}", env_dir.display()), e))?;
        }

        let launcher = self.choose_launcher().ok_or_else(|| {
            let (min_major, min_minor) = self.settings.min_python;
            let tried = self
                .settings
                .launchers
                .iter()
                .map(|l| l.join(" "))
                .collect::<Vec<_>>()
                .join(", ");
            ProvisionError::NoInterpreter {
                min_major,
                min_minor,
                tried,
            }
        })?;
        log::info!("[venv] creating environment with `{}`", launcher.join(" "));

        let env_arg = env_dir.display().to_string();
        let mut venv_args: Vec<&str> = launcher[1..].iter().map(String::as_str).collect();
        venv_args.extend(["-m", "venv", env_arg.as_str()]);
        let created = runner::run_logged(&launcher[0], &venv_args, None, "[venv] ")?;
        let env = self.environment();
        if !created.success() || !env.python.is_file() {
            return Err(ProvisionError::EnvironmentCreate {
                path: env_dir,
                code: created.code,
            });
        }

        let manifest = self.manifest_copy();
        fs::write(&manifest, &self.settings.manifest)
            .map_err(|e| ProvisionError::io(format!("failed to write {}", manifest.display()), e))?;

        let upgrade = runner::run_logged(
            &env.python,
            &["-m", "pip", "install", "--upgrade", "pip"],
            None,
            "[pip] ",
        )?;
        if !upgrade.success() {
            log::warn!("[pip] upgrading pip failed with {:?}; continuing", upgrade.code);
        }

        let manifest_arg = manifest.display().to_string();
        let install = runner::run_logged(
            &env.python,
            &["-m", "pip", "install", "-r", manifest_arg.as_str()],
            None,
            "[pip] ",
        )?;
        if !install.success() {
            return Err(ProvisionError::DependencyInstall { code: install.code });
        }

        let stamp = self.stamp_path();
        fs::write(&stamp, chrono::Utc::now().to_rfc3339())
            .map_err(|e| ProvisionError::io(format!("failed to write {}", stamp.display()), e))?;
        log::info!("[venv] environment ready at {}", env.root.display());
        self.cached = Some(env.clone());
        Ok(env)
    }

    fn choose_launcher(&self) -> Option<Vec<String>> {
        self.settings
            .launchers
            .iter()
            .filter(|l| !l.is_empty())
            .find(|l| {
                let ok = probe_launcher(l, self.settings.min_python, self.settings.probe_timeout);
                log::debug!("[venv] probe `{}`: {}", l.join(" "), if ok { "usable" } else { "rejected" });
                ok
            })
            .cloned()
    }
}

/// True when the launcher runs a new enough interpreter that has the `venv` module.
pub fn probe_launcher(launcher: &[String], min: (u32, u32), timeout: Duration) -> bool {
    let Some((program, leading)) = launcher.split_first() else {
        return false;
    };
    let check = format!(
        "import sys,importlib.util; sys.exit(0 if sys.version_info[:2]>=({},{}) and importlib.util.find_spec('venv') else 1)",
        min.0, min.1
    );
    let mut cmd = Command::new(program);
    cmd.args(leading).arg("-c").arg(check);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());

    let Ok(mut child) = cmd.spawn() else {
        return false;
    };
    match child.wait_timeout(timeout) {
        Ok(Some(status)) => status.success(),
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            log::warn!("[venv] `{}` did not answer within {}ms", launcher.join(" "), timeout.as_millis());
            false
        }
        Err(_) => {
            let _ = child.kill();
            let _ = child.wait();
            false
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // Stand-in interpreter: answers the probe and builds a venv whose python fails the
    // manifest install while PIP_FAIL exists next to the environment.
    const FAKE_PYTHON: &str = r#"
if [ "$1" = "-c" ]; then exit 0; fi
if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
  mkdir -p "$3/bin"
  printf '#!/bin/sh\necho "pip $*"\nif [ "$4" = "-r" ] && [ -f "%s/../PIP_FAIL" ]; then echo nope 1>&2; exit 1; fi\nexit 0\n' "$3" > "$3/bin/python"
  chmod +x "$3/bin/python"
  exit 0
fi
exit 2
"#;

    fn settings(base: &Path, launchers: Vec<Vec<String>>) -> ProvisionSettings {
        ProvisionSettings {
            base_dir: base.to_path_buf(),
            launchers,
            min_python: (3, 8),
            probe_timeout: Duration::from_secs(5),
            manifest: "numpy\n".to_string(),
            stale_lock_after: Duration::from_secs(60),
        }
    }

    fn fake_launcher(dir: &Path) -> Vec<Vec<String>> {
        let script = dir.join("fakepy.sh");
        fs::write(&script, FAKE_PYTHON).unwrap();
        vec![vec!["sh".to_string(), script.display().to_string()]]
    }

    fn seed_ready_env(base: &Path) {
        let py = interpreter_in(&base.join(ENV_DIR));
        fs::create_dir_all(py.parent().unwrap()).unwrap();
        fs::write(&py, "").unwrap();
        fs::write(base.join(STAMP_FILE), "stamp").unwrap();
        fs::write(base.join(MANIFEST_COPY), "numpy\n").unwrap();
    }

    #[test]
    fn ready_environment_is_reused_without_probing() {
        let dir = tempdir().unwrap();
        seed_ready_env(dir.path());
        let missing = vec![vec!["/nonexistent/python3".to_string()]];
        let mut prov = Provisioner::new(settings(dir.path(), missing));
        let first = prov.ensure_environment().unwrap();
        let second = prov.ensure_environment().unwrap();
        assert_eq!(first, second);
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn incomplete_environment_is_removed() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(ENV_DIR).join("lib")).unwrap();
        let missing = vec![vec!["/nonexistent/python3".to_string()]];
        let mut prov = Provisioner::new(settings(dir.path(), missing));
        let err = prov.ensure_environment().unwrap_err();
        assert!(matches!(err, ProvisionError::NoInterpreter { min_minor: 8, .. }));
        assert!(!dir.path().join(ENV_DIR).exists());
        assert!(err.to_string().contains("/nonexistent/python3"));
    }

    #[test]
    fn changed_manifest_forces_rebuild() {
        let dir = tempdir().unwrap();
        seed_ready_env(dir.path());
        let mut s = settings(dir.path(), Vec::new());
        s.manifest = "numpy\nscipy\n".to_string();
        let prov = Provisioner::new(s);
        assert!(!prov.is_ready());
    }

    #[test]
    fn builds_environment_with_launcher() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("home");
        let mut prov = Provisioner::new(settings(&base, fake_launcher(dir.path())));
        let env = prov.ensure_environment().unwrap();
        assert!(env.python.is_file());
        assert!(prov.is_ready());
        assert_eq!(fs::read_to_string(base.join(MANIFEST_COPY)).unwrap(), "numpy\n");
    }

    #[test]
    fn failed_install_leaves_environment_unstamped() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("home");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("PIP_FAIL"), "").unwrap();
        let mut prov = Provisioner::new(settings(&base, fake_launcher(dir.path())));
        let err = prov.ensure_environment().unwrap_err();
        assert!(matches!(err, ProvisionError::DependencyInstall { code: Some(1) }));
        assert!(!base.join(STAMP_FILE).exists());
        assert!(!base.join(LOCK_FILE).exists());
        assert!(!prov.is_ready());

        fs::remove_file(base.join("PIP_FAIL")).unwrap();
        let env = prov.ensure_environment().unwrap();
        assert!(env.python.is_file());
        assert!(base.join(STAMP_FILE).exists());
    }

    fn backdate(path: &Path, by: Duration) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn held_lock_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), "1").unwrap();
        let mut prov = Provisioner::new(settings(dir.path(), Vec::new()));
        assert!(matches!(prov.ensure_environment(), Err(ProvisionError::Locked { .. })));
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn leftover_lock_does_not_block_a_ready_environment() {
        let dir = tempdir().unwrap();
        seed_ready_env(dir.path());
        fs::write(dir.path().join(LOCK_FILE), "1").unwrap();
        let mut prov = Provisioner::new(settings(dir.path(), Vec::new()));
        let env = prov.ensure_environment().unwrap();
        assert_eq!(env.root, dir.path().join(ENV_DIR));
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("home");
        fs::create_dir_all(&base).unwrap();
        let lock = base.join(LOCK_FILE);
        fs::write(&lock, "99999").unwrap();
        backdate(&lock, Duration::from_secs(3600));
        let mut prov = Provisioner::new(settings(&base, fake_launcher(dir.path())));
        let env = prov.ensure_environment().unwrap();
        assert!(env.python.is_file());
        assert!(prov.is_ready());
        assert!(!lock.exists());
    }
}
