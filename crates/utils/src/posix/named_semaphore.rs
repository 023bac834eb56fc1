//! Named POSIX semaphores, the blocking primitive shared between processes.

use std::ffi::CString;
use std::fmt;
use std::ops::BitOr;
use std::ptr::NonNull;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::errno;
use super::file_name::is_valid_file_name;
use super::retry_on_interrupt;

/// Largest initial value a semaphore accepts.
#[cfg(target_os = "linux")]
pub const SEM_VALUE_MAX: u32 = i32::MAX as u32;
#[cfg(not(target_os = "linux"))]
pub const SEM_VALUE_MAX: u32 = 32_767;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreError {
    #[error("invalid semaphore name")]
    InvalidName,

    #[error("semaphore value would exceed SEM_VALUE_MAX")]
    SemaphoreOverflow,

    #[error("a semaphore with that name already exists")]
    AlreadyExist,

    #[error("file descriptor limit reached")]
    FileDescriptorLimitReached,

    #[error("no semaphore with that name exists")]
    NoSemaphoreWithThatNameExists,

    #[error("insufficient memory to create the semaphore")]
    OutOfMemory,

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid semaphore handle")]
    InvalidSemaphoreHandle,

    #[error("undefined semaphore error")]
    Undefined,
}

/// How [`NamedSemaphoreBuilder::create`] treats an existing semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Fails with [`SemaphoreError::AlreadyExist`] if the name is taken.
    Create,
    #[default]
    OpenExisting,
    /// Creates the semaphore unless it already exists.
    OpenOrCreate,
    /// Removes a stale semaphore of the same name first.
    PurgeAndCreate,
}

/// Access permission bits of a named OS object.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const OWNER_READ: Permissions = Permissions(0o400);
    pub const OWNER_WRITE: Permissions = Permissions(0o200);
    pub const OWNER_ALL: Permissions = Permissions(0o700);
    pub const GROUP_READ: Permissions = Permissions(0o040);
    pub const GROUP_WRITE: Permissions = Permissions(0o020);
    pub const OTHERS_READ: Permissions = Permissions(0o004);
    pub const OTHERS_WRITE: Permissions = Permissions(0o002);
    pub const ALL: Permissions = Permissions(0o777);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & 0o777)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Self) -> Self::Output {
        Permissions(self.0 | rhs.0)
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permissions({:#o})", self.0)
    }
}

/// Collects the parameters of a named semaphore before any OS call is made.
#[derive(Debug, Clone)]
pub struct NamedSemaphoreBuilder {
    name: String,
    open_mode: OpenMode,
    permissions: Permissions,
    initial_value: u32,
}

impl NamedSemaphoreBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            open_mode: OpenMode::default(),
            permissions: Permissions::OWNER_READ | Permissions::OWNER_WRITE,
            initial_value: 0,
        }
    }

    pub fn open_mode(mut self, open_mode: OpenMode) -> Self {
        self.open_mode = open_mode;
        self
    }

    pub fn permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// Only used when the semaphore is created.
    pub fn initial_value(mut self, initial_value: u32) -> Self {
        self.initial_value = initial_value;
        self
    }

    pub fn create(self) -> Result<NamedSemaphore, SemaphoreError> {
        if !is_valid_file_name(&self.name) {
            error!(name = %self.name, "not a valid semaphore name");
            return Err(SemaphoreError::InvalidName);
        }

        if self.initial_value > SEM_VALUE_MAX {
            error!(
                name = %self.name,
                initial_value = self.initial_value,
                max = SEM_VALUE_MAX,
                "initial value exceeds the maximum semaphore value"
            );
            return Err(SemaphoreError::SemaphoreOverflow);
        }

        let os_name = os_name(&self.name)?;

        if self.open_mode == OpenMode::PurgeAndCreate {
            unlink(&self.name, &os_name)?;
        }

        let exclusive = libc::O_CREAT | libc::O_EXCL;
        let (handle, has_ownership) = match self.open_mode {
            OpenMode::OpenExisting => (self.open(&os_name, 0), false),
            OpenMode::Create | OpenMode::PurgeAndCreate => (self.open(&os_name, exclusive), true),
            OpenMode::OpenOrCreate => match self.open(&os_name, exclusive) {
                Err(libc::EEXIST) => (self.open(&os_name, 0), false),
                created => (created, true),
            },
        };
        let handle = handle.map_err(|errnum| self.open_error(errnum))?;

        debug!(
            name = %self.name,
            open_mode = ?self.open_mode,
            has_ownership,
            "opened named semaphore"
        );

        Ok(NamedSemaphore {
            handle,
            name: self.name,
            has_ownership,
        })
    }

    fn open(&self, os_name: &CString, oflag: libc::c_int) -> Result<NonNull<libc::sem_t>, i32> {
        loop {
            let handle = unsafe {
                libc::sem_open(
                    os_name.as_ptr(),
                    oflag,
                    self.permissions.bits() as libc::c_uint,
                    self.initial_value as libc::c_uint,
                )
            };
            if handle != libc::SEM_FAILED {
                return NonNull::new(handle).ok_or(libc::EINVAL);
            }
            match errno() {
                libc::EINTR => continue,
                errnum => return Err(errnum),
            }
        }
    }

    fn open_error(&self, errnum: i32) -> SemaphoreError {
        let name = &self.name;
        match errnum {
            libc::EEXIST => {
                error!(name = %name, "a semaphore with that name already exists");
                SemaphoreError::AlreadyExist
            }
            libc::EMFILE => {
                error!(name = %name, "per-process file descriptor limit reached while opening semaphore");
                SemaphoreError::FileDescriptorLimitReached
            }
            libc::ENFILE => {
                error!(name = %name, "system-wide file descriptor limit reached while opening semaphore");
                SemaphoreError::FileDescriptorLimitReached
            }
            libc::ENOENT => {
                error!(name = %name, "no semaphore with that name exists");
                SemaphoreError::NoSemaphoreWithThatNameExists
            }
            libc::ENOMEM => {
                error!(name = %name, "insufficient memory to create semaphore");
                SemaphoreError::OutOfMemory
            }
            libc::EACCES => {
                error!(name = %name, "no permission to open semaphore");
                SemaphoreError::PermissionDenied
            }
            errnum => {
                error!(name = %name, errnum, "unexpected error while opening semaphore");
                SemaphoreError::Undefined
            }
        }
    }
}

fn os_name(name: &str) -> Result<CString, SemaphoreError> {
    CString::new(format!("/{name}")).map_err(|_| SemaphoreError::InvalidName)
}

fn unlink(name: &str, os_name: &CString) -> Result<(), SemaphoreError> {
    if unsafe { libc::sem_unlink(os_name.as_ptr()) } == 0 {
        return Ok(());
    }
    match errno() {
        libc::ENOENT => Ok(()),
        libc::EACCES => {
            error!(name = %name, "no permission to remove semaphore");
            Err(SemaphoreError::PermissionDenied)
        }
        errnum => {
            error!(name = %name, errnum, "unexpected error while removing semaphore");
            Err(SemaphoreError::Undefined)
        }
    }
}

/// An open handle to a named POSIX semaphore.
///
/// Dropping a handle always closes it, but only the handle that created the
/// semaphore (see [`NamedSemaphore::has_ownership`]) also unlinks the name.
/// Handles that merely opened an existing semaphore leave it in place, so a
/// notifier closing its handle never removes the semaphore its listener
/// still waits on.
pub struct NamedSemaphore {
    handle: NonNull<libc::sem_t>,
    name: String,
    has_ownership: bool,
}

unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .field("has_ownership", &self.has_ownership)
            .finish()
    }
}

impl NamedSemaphore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_ownership(&self) -> bool {
        self.has_ownership
    }

    pub fn post(&self) -> Result<(), SemaphoreError> {
        retry_on_interrupt(|| unsafe { libc::sem_post(self.handle.as_ptr()) })
            .map(|_| ())
            .map_err(|errnum| self.operation_error("post", errnum))
    }

    /// Blocks until the semaphore can be decremented.
    pub fn wait(&self) -> Result<(), SemaphoreError> {
        retry_on_interrupt(|| unsafe { libc::sem_wait(self.handle.as_ptr()) })
            .map(|_| ())
            .map_err(|errnum| self.operation_error("wait", errnum))
    }

    /// Decrements without blocking; `false` if the value was zero.
    pub fn try_wait(&self) -> Result<bool, SemaphoreError> {
        match retry_on_interrupt(|| unsafe { libc::sem_trywait(self.handle.as_ptr()) }) {
            Ok(_) => Ok(true),
            Err(libc::EAGAIN) => Ok(false),
            Err(errnum) => Err(self.operation_error("try_wait", errnum)),
        }
    }

    /// Like [`NamedSemaphore::wait`] but gives up after `timeout`; `false` on
    /// timeout.
    #[cfg(target_os = "linux")]
    pub fn timed_wait(&self, timeout: Duration) -> Result<bool, SemaphoreError> {
        const NANOS_PER_SEC: i64 = 1_000_000_000;

        let mut now: libc::timespec = unsafe { std::mem::zeroed() };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

        let secs = libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX);
        let nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
        let mut deadline: libc::timespec = unsafe { std::mem::zeroed() };
        deadline.tv_sec = now
            .tv_sec
            .saturating_add(secs)
            .saturating_add((nanos / NANOS_PER_SEC) as libc::time_t);
        deadline.tv_nsec = (nanos % NANOS_PER_SEC) as libc::c_long;

        match retry_on_interrupt(|| unsafe { libc::sem_timedwait(self.handle.as_ptr(), &deadline) }) {
            Ok(_) => Ok(true),
            Err(libc::ETIMEDOUT) => Ok(false),
            Err(errnum) => Err(self.operation_error("timed_wait", errnum)),
        }
    }

    /// Like [`NamedSemaphore::wait`] but gives up after `timeout`; `false` on
    /// timeout.
    #[cfg(not(target_os = "linux"))]
    pub fn timed_wait(&self, timeout: Duration) -> Result<bool, SemaphoreError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn operation_error(&self, operation: &str, errnum: i32) -> SemaphoreError {
        match errnum {
            libc::EOVERFLOW => {
                error!(name = %self.name, operation, "semaphore value overflow");
                SemaphoreError::SemaphoreOverflow
            }
            libc::EINVAL => {
                error!(name = %self.name, operation, "invalid semaphore handle");
                SemaphoreError::InvalidSemaphoreHandle
            }
            errnum => {
                error!(name = %self.name, operation, errnum, "unexpected semaphore error");
                SemaphoreError::Undefined
            }
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if unsafe { libc::sem_close(self.handle.as_ptr()) } != 0 {
            warn!(name = %self.name, errnum = errno(), "failed to close named semaphore");
        }

        if self.has_ownership {
            // errors are already logged by `unlink`
            if let Ok(os_name) = os_name(&self.name) {
                let _ = unlink(&self.name, &os_name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use std::time::Instant;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!(
            "utils_sem_{tag}_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn invalid_name_is_rejected_before_any_os_call() {
        for name in ["", "with space", "nested/name", ".."] {
            let err = NamedSemaphoreBuilder::new(name)
                .open_mode(OpenMode::PurgeAndCreate)
                .create()
                .unwrap_err();
            assert_eq!(err, SemaphoreError::InvalidName);
        }
    }

    #[test]
    fn initial_value_above_max_overflows() {
        let err = NamedSemaphoreBuilder::new(unique_name("overflow"))
            .open_mode(OpenMode::PurgeAndCreate)
            .initial_value(SEM_VALUE_MAX + 1)
            .create()
            .unwrap_err();
        assert_eq!(err, SemaphoreError::SemaphoreOverflow);
    }

    #[test]
    fn purge_and_create_tolerates_missing_semaphore() {
        let sem = NamedSemaphoreBuilder::new(unique_name("purge"))
            .open_mode(OpenMode::PurgeAndCreate)
            .create()
            .unwrap();
        assert!(sem.has_ownership());
        assert!(!sem.try_wait().unwrap());
    }

    #[test]
    fn purge_and_create_replaces_existing_semaphore() {
        let name = unique_name("replace");
        let stale = NamedSemaphoreBuilder::new(&name)
            .open_mode(OpenMode::Create)
            .initial_value(3)
            .create()
            .unwrap();

        let fresh = NamedSemaphoreBuilder::new(&name)
            .open_mode(OpenMode::PurgeAndCreate)
            .create()
            .unwrap();
        assert!(!fresh.try_wait().unwrap());
        // the stale handle still points at the unlinked object
        assert!(stale.try_wait().unwrap());
        // unlinking an already removed name is tolerated
        drop(fresh);
        drop(stale);
    }

    #[test]
    fn exclusive_create_fails_when_name_is_taken() {
        let name = unique_name("exclusive");
        let _owner = NamedSemaphoreBuilder::new(&name)
            .open_mode(OpenMode::Create)
            .create()
            .unwrap();

        let err = NamedSemaphoreBuilder::new(&name)
            .open_mode(OpenMode::Create)
            .create()
            .unwrap_err();
        assert_eq!(err, SemaphoreError::AlreadyExist);
    }

    #[test]
    fn open_existing_requires_existing_semaphore() {
        let err = NamedSemaphoreBuilder::new(unique_name("missing"))
            .create()
            .unwrap_err();
        assert_eq!(err, SemaphoreError::NoSemaphoreWithThatNameExists);
    }

    #[test]
    fn open_or_create_only_owns_what_it_created() {
        let name = unique_name("open_or_create");
        let first = NamedSemaphoreBuilder::new(&name)
            .open_mode(OpenMode::OpenOrCreate)
            .create()
            .unwrap();
        let second = NamedSemaphoreBuilder::new(&name)
            .open_mode(OpenMode::OpenOrCreate)
            .create()
            .unwrap();

        assert!(first.has_ownership());
        assert!(!second.has_ownership());

        second.post().unwrap();
        assert!(first.try_wait().unwrap());
    }

    #[test]
    fn dropping_the_owner_removes_the_name() {
        let name = unique_name("unlink");
        let owner = NamedSemaphoreBuilder::new(&name)
            .open_mode(OpenMode::Create)
            .create()
            .unwrap();

        let opened = NamedSemaphoreBuilder::new(&name).create().unwrap();
        drop(opened);
        assert!(NamedSemaphoreBuilder::new(&name).create().is_ok());

        drop(owner);
        assert_eq!(
            NamedSemaphoreBuilder::new(&name).create().unwrap_err(),
            SemaphoreError::NoSemaphoreWithThatNameExists
        );
    }

    #[test]
    fn initial_value_is_counted_down() {
        let sem = NamedSemaphoreBuilder::new(unique_name("count"))
            .open_mode(OpenMode::PurgeAndCreate)
            .initial_value(2)
            .create()
            .unwrap();

        assert!(sem.try_wait().unwrap());
        assert!(sem.try_wait().unwrap());
        assert!(!sem.try_wait().unwrap());
    }

    #[test]
    fn timed_wait_times_out_without_post() {
        let sem = NamedSemaphoreBuilder::new(unique_name("timeout"))
            .open_mode(OpenMode::PurgeAndCreate)
            .create()
            .unwrap();

        let start = Instant::now();
        assert!(!sem.timed_wait(Duration::from_millis(50)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(40));

        sem.post().unwrap();
        assert!(sem.timed_wait(Duration::from_millis(50)).unwrap());
    }

    #[test]
    fn post_from_another_thread_wakes_waiter() {
        let name = unique_name("wake");
        let sem = Arc::new(
            NamedSemaphoreBuilder::new(&name)
                .open_mode(OpenMode::PurgeAndCreate)
                .create()
                .unwrap(),
        );

        let poster = {
            let name = name.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let sem = NamedSemaphoreBuilder::new(name).create().unwrap();
                sem.post().unwrap();
            })
        };

        sem.wait().unwrap();
        poster.join().unwrap();
    }
}
