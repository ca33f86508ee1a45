//! Confinement for the interpreter process.
//!
//! Every interpreter gets a throwaway working directory, a scrubbed
//! environment, its own session and hard rlimits. When the service runs as
//! root it additionally enters private network and mount namespaces (fresh
//! tmpfs scratch directories) and switches to an unprivileged uid/gid before
//! exec. Namespaces are skipped when the kernel refuses them; the identity
//! switch is not optional.

use crate::config::ProcessLimits;
use std::ffi::CString;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};
use std::ptr;
use tempfile::TempDir;
use tracing::debug;

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const SCRATCH_DIRS: &[&str] = &["/tmp", "/var/tmp", "/dev/shm"];

/// Owns the working directory for one interpreter; removed on drop.
pub(crate) struct Confinement {
    workdir: TempDir,
    privileged: bool,
}

impl Confinement {
    pub fn new(limits: &ProcessLimits) -> io::Result<Self> {
        let workdir = tempfile::Builder::new().prefix("mastery-py-").tempdir()?;
        // SAFETY: geteuid has no preconditions
        let privileged = unsafe { libc::geteuid() } == 0;
        if privileged {
            std::os::unix::fs::chown(workdir.path(), Some(limits.uid), Some(limits.gid))?;
        }
        Ok(Self {
            workdir,
            privileged,
        })
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    /// Configure `command` to start inside the sandbox
    pub fn apply(&self, command: &mut Command, limits: &ProcessLimits) -> io::Result<()> {
        let path = std::env::var_os("PATH").unwrap_or_else(|| FALLBACK_PATH.into());
        command
            .env_clear()
            .env("PATH", path)
            .env("HOME", self.workdir())
            .env("LANG", "C.UTF-8")
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .current_dir(self.workdir());

        let entry = Entry::new(limits, self.privileged)?;
        debug!(
            workdir = %self.workdir().display(),
            privileged = self.privileged,
            "Confining interpreter"
        );
        // SAFETY: Entry::enter only issues raw syscalls on data prepared
        // before the fork; it neither allocates nor takes locks.
        unsafe {
            command.pre_exec(move || entry.enter());
        }
        Ok(())
    }
}

/// Kill the interpreter and everything it spawned.
pub(crate) fn kill_tree(child: &mut Child) -> io::Result<()> {
    if let Ok(None) = child.try_wait() {
        // the interpreter leads its own session, so its pid is the group id
        // SAFETY: plain kill(2) on a process group we created
        unsafe {
            libc::kill(-(child.id() as libc::pid_t), libc::SIGKILL);
        }
    }
    child.kill()
}

/// Everything the forked child needs, built before the fork.
struct Entry {
    rlimits: Vec<(libc::__rlimit_resource_t, u64)>,
    identity: Option<(libc::uid_t, libc::gid_t)>,
    root: CString,
    tmpfs: CString,
    scratch: Vec<CString>,
    scratch_options: CString,
}

impl Entry {
    fn new(limits: &ProcessLimits, privileged: bool) -> io::Result<Self> {
        let scratch = SCRATCH_DIRS
            .iter()
            .filter(|dir| Path::new(dir).is_dir())
            .map(|dir| cstring(dir))
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            rlimits: vec![
                (libc::RLIMIT_AS, limits.memory_bytes),
                (libc::RLIMIT_FSIZE, limits.file_size_bytes),
                (libc::RLIMIT_NPROC, limits.max_processes),
                (libc::RLIMIT_NOFILE, limits.open_files),
                (libc::RLIMIT_CPU, limits.cpu_seconds),
                (libc::RLIMIT_CORE, 0),
            ],
            identity: privileged.then_some((limits.uid, limits.gid)),
            root: cstring("/")?,
            tmpfs: cstring("tmpfs")?,
            scratch,
            scratch_options: cstring(&format!("size={},mode=1777", limits.scratch_bytes))?,
        })
    }

    /// Runs in the forked child between fork and exec
    fn enter(&self) -> io::Result<()> {
        // SAFETY: setsid has no preconditions
        check(unsafe { libc::setsid() })?;

        if self.identity.is_some() {
            self.isolate()?;
        }

        for &(resource, value) in &self.rlimits {
            let limit = libc::rlimit {
                rlim_cur: value as libc::rlim_t,
                rlim_max: value as libc::rlim_t,
            };
            // SAFETY: limit is a valid rlimit for the duration of the call
            check(unsafe { libc::setrlimit(resource, &limit) })?;
        }

        if let Some((uid, gid)) = self.identity {
            // groups, then gid, then uid; the reverse order loses the right to change gid
            // SAFETY: an empty group list with a null pointer is allowed
            check(unsafe { libc::setgroups(0, ptr::null()) })?;
            // SAFETY: plain credential syscalls
            check(unsafe { libc::setresgid(gid, gid, gid) })?;
            check(unsafe { libc::setresuid(uid, uid, uid) })?;
        }

        // SAFETY: PR_SET_NO_NEW_PRIVS takes integer arguments only
        check(unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) })?;
        // SAFETY: umask cannot fail
        unsafe {
            libc::umask(0o077);
        }
        Ok(())
    }

    /// Private network and mount namespaces with fresh scratch directories.
    /// Left out when the kernel or the container refuses new namespaces.
    fn isolate(&self) -> io::Result<()> {
        // SAFETY: unshare only affects the calling (child) process
        if unsafe { libc::unshare(libc::CLONE_NEWNS | libc::CLONE_NEWNET) } != 0 {
            return Ok(());
        }

        // SAFETY: every pointer is a NUL-terminated string owned by self, or null
        check(unsafe {
            libc::mount(
                ptr::null(),
                self.root.as_ptr(),
                ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                ptr::null(),
            )
        })?;
        for dir in &self.scratch {
            // SAFETY: as above
            check(unsafe {
                libc::mount(
                    self.tmpfs.as_ptr(),
                    dir.as_ptr(),
                    self.tmpfs.as_ptr(),
                    libc::MS_NOSUID | libc::MS_NODEV,
                    self.scratch_options.as_ptr().cast(),
                )
            })?;
        }
        Ok(())
    }
}

fn cstring(value: &str) -> io::Result<CString> {
    CString::new(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
