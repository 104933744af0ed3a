// Exports common ABI types and constants for use by userspace programs.
pub use crate::file::{CONSOLE, OpenFlag};
pub use crate::fs::{DIRSIZE, Directory, InodeType, Stat};
pub use crate::param::MAXPATH;

/// System call numbers.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Pipe = 4,
    Read = 5,
    Kill = 6,
    Exec = 7,
    Fstat = 8,
    Chdir = 9,
    Dup = 10,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Open = 15,
    Write = 16,
    Mknod = 17,
    Unlink = 18,
    Link = 19,
    Mkdir = 20,
    Close = 21,
    Waitx = 22,
    SetPriority = 23,
    Trace = 24,
}
