//! Filesystem/syscall error taxonomy (§7). Internal code returns one of
//! these; only the outermost syscall handler translates it to a signed
//! `-errno` for user space.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    Invalid,
    NotFound,
    Perm,
    NoMem,
    BadFd,
    Fault,
    Exists,
    Busy,
    NoSpc,
    Range,
    Again,
    Pipe,
    Child,
    NoSys,
    Io,
    NotADirectory,
    IsADirectory,
    NotMounted,
}

impl FsError {
    /// The negative-`errno` value a syscall handler writes back into EAX.
    pub fn errno(self) -> i32 {
        let e = match self {
            FsError::Perm => 1,            // EPERM
            FsError::NotFound => 2,        // ENOENT
            FsError::Io => 5,              // EIO
            FsError::BadFd => 9,           // EBADF
            FsError::Again => 11,          // EAGAIN
            FsError::NoMem => 12,          // ENOMEM
            FsError::Fault => 14,          // EFAULT
            FsError::Busy => 16,           // EBUSY
            FsError::Exists => 17,         // EEXIST
            FsError::NotADirectory => 20,  // ENOTDIR
            FsError::IsADirectory => 21,   // EISDIR
            FsError::Invalid => 22,        // EINVAL
            FsError::NoSpc => 28,          // ENOSPC
            FsError::Pipe => 32,           // EPIPE
            FsError::Range => 36,          // ENAMETOOLONG / ERANGE
            FsError::NoSys => 38,          // ENOSYS
            FsError::Child => 10,          // ECHILD
            FsError::NotMounted => 2,      // ENOENT — no fs at that path
        };
        -e
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FsError::Invalid => write!(f, "Invalid argument"),
            FsError::NotFound => write!(f, "No such file or directory"),
            FsError::Perm => write!(f, "Operation not permitted"),
            FsError::NoMem => write!(f, "Out of memory"),
            FsError::BadFd => write!(f, "Bad file descriptor"),
            FsError::Fault => write!(f, "Bad address"),
            FsError::Exists => write!(f, "File exists"),
            FsError::Busy => write!(f, "Device or resource busy"),
            FsError::NoSpc => write!(f, "No space left on device"),
            FsError::Range => write!(f, "Name too long"),
            FsError::Again => write!(f, "Resource temporarily unavailable"),
            FsError::Pipe => write!(f, "Broken pipe"),
            FsError::Child => write!(f, "No child processes"),
            FsError::NoSys => write!(f, "Function not implemented"),
            FsError::Io => write!(f, "I/O error"),
            FsError::NotADirectory => write!(f, "Not a directory"),
            FsError::IsADirectory => write!(f, "Is a directory"),
            FsError::NotMounted => write!(f, "No filesystem mounted at path"),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
