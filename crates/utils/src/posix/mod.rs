//! Thin wrappers over the POSIX calls the data-plane relies on.

pub mod file_name;
pub mod named_semaphore;

pub use file_name::is_valid_file_name;
pub use file_name::is_valid_file_path;
pub use named_semaphore::NamedSemaphore;
pub use named_semaphore::NamedSemaphoreBuilder;
pub use named_semaphore::OpenMode;
pub use named_semaphore::Permissions;
pub use named_semaphore::SemaphoreError;
pub use named_semaphore::SEM_VALUE_MAX;

/// Runs `call` until it stops failing with `EINTR`.
///
/// `call` follows the libc convention of returning `-1` and setting `errno` on
/// failure; the errno is returned as the error.
pub(crate) fn retry_on_interrupt(mut call: impl FnMut() -> libc::c_int) -> Result<libc::c_int, i32> {
    loop {
        let ret = call();
        if ret != -1 {
            return Ok(ret);
        }
        match errno() {
            libc::EINTR => continue,
            errnum => return Err(errnum),
        }
    }
}

pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
