//! Package implement a concurrent [Adaptive Radix Tree][art], [Art],
//! indexing binary-keys to a set of 64-bit tuple-identifiers, along with
//! the decentralized epoch-manager, [EpochManager], that supplies the
//! grace-period machinery for safe memory reclamation and doubles as the
//! logical-clock for snapshot visibility.
//!
//! Refer to module documentation of [art] and [epoch] for details.
//!
//! [art]: https://db.in.tum.de/~leis/papers/ART.pdf

use std::{error, fmt, result};

/// Convenience macro, convert message and/or error into [Error], tagged
/// with the position in code.
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

pub mod art;
pub mod epoch;
pub mod util;

pub use crate::art::{ArtKey, Index as Art, ThreadInfo};
pub use crate::epoch::{EpochManager, Timestamp};

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, mostly the file-position in code where
/// the error happened, and a message describing the error.
#[derive(Clone, PartialEq)]
pub enum Error {
    Fatal(String, String),
    FailConvert(String, String),
    InvalidInput(String, String),
    IPCFail(String, String),
    ThreadFail(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Fatal(p, m) => write!(f, "{} Fatal: {}", p, m),
            FailConvert(p, m) => write!(f, "{} FailConvert: {}", p, m),
            InvalidInput(p, m) => write!(f, "{} InvalidInput: {}", p, m),
            IPCFail(p, m) => write!(f, "{} IPCFail: {}", p, m),
            ThreadFail(p, m) => write!(f, "{} ThreadFail: {}", p, m),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}
