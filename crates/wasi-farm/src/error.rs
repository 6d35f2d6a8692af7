use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The WASI `$errno` domain, numbered as on the wire. This is the result code
/// carried in the trailing slot of every call frame; `Success` travels there
/// too, which is why it is part of the enum.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
#[repr(i32)]
pub enum Errno {
    #[error("Success: No error occurred")]
    Success = 0,
    #[error("TooBig: Argument list too long")]
    TooBig = 1,
    #[error("Acces: Permission denied")]
    Acces = 2,
    #[error("Addrinuse: Address in use")]
    Addrinuse = 3,
    #[error("Addrnotavail: Address not available")]
    Addrnotavail = 4,
    #[error("Afnosupport: Address family not supported")]
    Afnosupport = 5,
    #[error("Again: Resource unavailable, try again")]
    Again = 6,
    #[error("Already: Connection already in progress")]
    Already = 7,
    #[error("Badf: Bad file descriptor")]
    Badf = 8,
    #[error("Badmsg: Bad message")]
    Badmsg = 9,
    #[error("Busy: Device or resource busy")]
    Busy = 10,
    #[error("Canceled: Operation canceled")]
    Canceled = 11,
    #[error("Child: No child processes")]
    Child = 12,
    #[error("Connaborted: Connection aborted")]
    Connaborted = 13,
    #[error("Connrefused: Connection refused")]
    Connrefused = 14,
    #[error("Connreset: Connection reset")]
    Connreset = 15,
    #[error("Deadlk: Resource deadlock would occur")]
    Deadlk = 16,
    #[error("Destaddrreq: Destination address required")]
    Destaddrreq = 17,
    #[error("Dom: Argument out of domain of function")]
    Dom = 18,
    #[error("Dquot: Reserved")]
    Dquot = 19,
    #[error("Exist: File exists")]
    Exist = 20,
    #[error("Fault: Bad address")]
    Fault = 21,
    #[error("Fbig: File too large")]
    Fbig = 22,
    #[error("Hostunreach: Host is unreachable")]
    Hostunreach = 23,
    #[error("Idrm: Identifier removed")]
    Idrm = 24,
    #[error("Ilseq: Illegal byte sequence")]
    Ilseq = 25,
    #[error("Inprogress: Operation in progress")]
    Inprogress = 26,
    #[error("Intr: Interrupted function")]
    Intr = 27,
    #[error("Inval: Invalid argument")]
    Inval = 28,
    #[error("Io: I/O error")]
    Io = 29,
    #[error("Isconn: Socket is connected")]
    Isconn = 30,
    #[error("Isdir: Is a directory")]
    Isdir = 31,
    #[error("Loop: Too many levels of symbolic links")]
    Loop = 32,
    #[error("Mfile: File descriptor value too large")]
    Mfile = 33,
    #[error("Mlink: Too many links")]
    Mlink = 34,
    #[error("Msgsize: Message too large")]
    Msgsize = 35,
    #[error("Multihop: Reserved")]
    Multihop = 36,
    #[error("Nametoolong: Filename too long")]
    Nametoolong = 37,
    #[error("Netdown: Network is down")]
    Netdown = 38,
    #[error("Netreset: Connection aborted by network")]
    Netreset = 39,
    #[error("Netunreach: Network unreachable")]
    Netunreach = 40,
    #[error("Nfile: Too many files open in system")]
    Nfile = 41,
    #[error("Nobufs: No buffer space available")]
    Nobufs = 42,
    #[error("Nodev: No such device")]
    Nodev = 43,
    #[error("Noent: No such file or directory")]
    Noent = 44,
    #[error("Noexec: Executable file format error")]
    Noexec = 45,
    #[error("Nolck: No locks available")]
    Nolck = 46,
    #[error("Nolink: Reserved")]
    Nolink = 47,
    #[error("Nomem: Not enough space")]
    Nomem = 48,
    #[error("Nomsg: No message of the desired type")]
    Nomsg = 49,
    #[error("Noprotoopt: Protocol not available")]
    Noprotoopt = 50,
    #[error("Nospc: No space left on device")]
    Nospc = 51,
    #[error("Nosys: Function not supported")]
    Nosys = 52,
    #[error("Notconn: The socket is not connected")]
    Notconn = 53,
    #[error("Notdir: Not a directory or a symbolic link to a directory")]
    Notdir = 54,
    #[error("Notempty: Directory not empty")]
    Notempty = 55,
    #[error("Notrecoverable: State not recoverable")]
    Notrecoverable = 56,
    #[error("Notsock: Not a socket")]
    Notsock = 57,
    #[error("Notsup: Not supported, or operation not supported on socket")]
    Notsup = 58,
    #[error("Notty: Inappropriate I/O control operation")]
    Notty = 59,
    #[error("Nxio: No such device or address")]
    Nxio = 60,
    #[error("Overflow: Value too large to be stored in data type")]
    Overflow = 61,
    #[error("Ownerdead: Previous owner died")]
    Ownerdead = 62,
    #[error("Perm: Operation not permitted")]
    Perm = 63,
    #[error("Pipe: Broken pipe")]
    Pipe = 64,
    #[error("Proto: Protocol error")]
    Proto = 65,
    #[error("Protonosupport: Protocol not supported")]
    Protonosupport = 66,
    #[error("Prototype: Protocol wrong type for socket")]
    Prototype = 67,
    #[error("Range: Result too large")]
    Range = 68,
    #[error("Rofs: Read-only file system")]
    Rofs = 69,
    #[error("Spipe: Invalid seek")]
    Spipe = 70,
    #[error("Srch: No such process")]
    Srch = 71,
    #[error("Stale: Reserved")]
    Stale = 72,
    #[error("Timedout: Connection timed out")]
    Timedout = 73,
    #[error("Txtbsy: Text file busy")]
    Txtbsy = 74,
    #[error("Xdev: Cross-device link")]
    Xdev = 75,
    #[error("Notcapable: Capabilities insufficient")]
    Notcapable = 76,
}

impl Errno {
    pub const fn raw(self) -> i32 {
        self as i32
    }

    pub fn from_raw(raw: i32) -> Result<Errno> {
        if !(0..=Errno::Notcapable.raw()).contains(&raw) {
            return Err(Error::InvalidErrno(raw));
        }
        // Values are dense from 0 to Notcapable, so the range check above is
        // the whole validation.
        Ok(unsafe { std::mem::transmute::<i32, Errno>(raw) })
    }
}

/// Internal error type for the `wasi-farm` crate.
///
/// Capability implementations report failures through the `$errno` variants;
/// the remaining variants are protocol-level failures of the RPC machinery
/// itself. Both sides collapse to a wire errno via `Errno::from(&err)` when a
/// result is encoded into a call frame.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Errno(#[from] Errno),
    #[error("TryFromIntError: {0}")]
    TryFromInt(#[from] std::num::TryFromIntError),
    #[error("Utf8Error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload arena exhausted: {needed} bytes requested, {capacity} byte capacity")]
    ArenaFull { needed: usize, capacity: usize },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("errno slot held invalid value {0}")]
    InvalidErrno(i32),
    #[error("call frame addressed to fd {driving} decoded by listener for fd {listener}")]
    StaleFrame { driving: u32, listener: u32 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<&Error> for Errno {
    fn from(e: &Error) -> Errno {
        match e {
            Error::Errno(errno) => *errno,
            Error::TryFromInt(_) => Errno::Overflow,
            Error::Utf8(_) => Errno::Ilseq,
            Error::ArenaFull { .. } => Errno::Nomem,
            Error::UnknownOpcode(_)
            | Error::InvalidErrno(_)
            | Error::StaleFrame { .. }
            | Error::Other(_) => Errno::Io,
        }
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(_err: std::convert::Infallible) -> Self {
        unreachable!("should be impossible: From<Infallible>")
    }
}

/// Shorthand constructors for the errno values the crate raises itself.
pub trait ErrorExt {
    fn badf() -> Self;
    fn exist() -> Self;
    fn noent() -> Self;
    fn inval() -> Self;
    fn isdir() -> Self;
    fn notdir() -> Self;
    fn notempty() -> Self;
    fn not_supported() -> Self;
    fn name_too_long() -> Self;
    fn overflow() -> Self;
    fn perm() -> Self;
    fn spipe() -> Self;
    fn io() -> Self;
    fn too_many_files() -> Self;
}

impl ErrorExt for Error {
    fn badf() -> Self {
        Errno::Badf.into()
    }
    fn exist() -> Self {
        Errno::Exist.into()
    }
    fn noent() -> Self {
        Errno::Noent.into()
    }
    fn inval() -> Self {
        Errno::Inval.into()
    }
    fn isdir() -> Self {
        Errno::Isdir.into()
    }
    fn notdir() -> Self {
        Errno::Notdir.into()
    }
    fn notempty() -> Self {
        Errno::Notempty.into()
    }
    fn not_supported() -> Self {
        Errno::Notsup.into()
    }
    fn name_too_long() -> Self {
        Errno::Nametoolong.into()
    }
    fn overflow() -> Self {
        Errno::Overflow.into()
    }
    fn perm() -> Self {
        Errno::Perm.into()
    }
    fn spipe() -> Self {
        Errno::Spipe.into()
    }
    fn io() -> Self {
        Errno::Io.into()
    }
    fn too_many_files() -> Self {
        Errno::Mfile.into()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_raw_round_trip() {
        for raw in 0..=Errno::Notcapable.raw() {
            let errno = Errno::from_raw(raw).unwrap();
            assert_eq!(errno.raw(), raw);
        }
        assert!(Errno::from_raw(-1).is_err());
        assert!(Errno::from_raw(77).is_err());
    }

    #[test]
    fn wire_values_pinned() {
        assert_eq!(Errno::Success.raw(), 0);
        assert_eq!(Errno::Badf.raw(), 8);
        assert_eq!(Errno::Nametoolong.raw(), 37);
        assert_eq!(Errno::Nosys.raw(), 52);
        assert_eq!(Errno::Notsup.raw(), 58);
        assert_eq!(Errno::Notcapable.raw(), 76);
    }
}
