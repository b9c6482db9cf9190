//! Selva provide an in-memory hierarchical graph database. Every node in
//! the hierarchy carries a typed dynamic object, optional custom edge
//! fields with referential constraints, and a set of subscription markers
//! feeding a live event system.
//!
//! The crate is organised leaves-first. [SelvaString], [SVector],
//! [SelvaSet] and [SelvaObject] are the value primitives, `hierarchy` owns
//! the node graph and the traversal kernel, `subscriptions` implements the
//! marker/event engine and `find_index` the popularity driven query index
//! cache. The `cmd` module is the command surface a server loop dispatches
//! decoded [proto] frames into.
//!
//! The whole database assumes a single-threaded cooperative server
//! process; exclusive access for the duration of one command is modelled
//! with `&mut` borrows and nothing in here locks.

use std::fmt;

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use crate::Error;
/// err_at!(InvalidInput, msg: "bad argument")
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(RangeError, std::str::from_utf8(buf))
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(RangeError, std::str::from_utf8(buf), "expected utf8 name")
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err($crate::Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err($crate::Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err($crate::Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the failing
/// call-site, and a message.
#[derive(Clone, PartialEq)]
pub enum Error {
    /// Catch-all, also used for detected structural corruption.
    Fatal(String, String),
    /// Invalid argument or combination of arguments.
    InvalidInput(String, String),
    /// Operation applied on a value of an incompatible type.
    TypeMismatch(String, String),
    /// Addressed entity does not exist.
    NotFound(String, String),
    /// Entity already exists, or a value update was a no-op.
    Exists(String, String),
    /// Key name exceeds the supported length.
    NameTooLong(String, String),
    /// Operation not supported on this value.
    NotSupported(String, String),
    /// Numeric parse or conversion out of range.
    RangeError(String, String),
    /// Filter/traversal expression failed to compile.
    RpnCompile(String, String),
    /// Filter/traversal expression failed at runtime.
    RpnRuntime(String, String),
    /// Input buffer exhausted while decoding.
    OutOfBuffer(String, String),
    /// Cbor serialization failure.
    FailCbor(String, String),
}

impl Error {
    /// Wire error code for the selva_proto error value. Codes are stable
    /// and negative, zero is success.
    pub fn to_code(&self) -> i32 {
        match self {
            Error::Fatal(_, _) => -1,
            Error::InvalidInput(_, _) => -2,
            Error::RangeError(_, _) => -3,
            Error::TypeMismatch(_, _) => -4,
            Error::NameTooLong(_, _) => -5,
            Error::NotSupported(_, _) => -6,
            Error::NotFound(_, _) => -7,
            Error::Exists(_, _) => -8,
            Error::OutOfBuffer(_, _) => -9,
            Error::RpnCompile(_, _) => -10,
            Error::RpnRuntime(_, _) => -11,
            Error::FailCbor(_, _) => -12,
        }
    }

    pub fn is_exists(&self) -> bool {
        matches!(self, Error::Exists(_, _))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_, _))
    }

    fn pretty(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;

        match self {
            Fatal(p, m) => write!(f, "Fatal:{}:{}", p, m),
            InvalidInput(p, m) => write!(f, "InvalidInput:{}:{}", p, m),
            TypeMismatch(p, m) => write!(f, "TypeMismatch:{}:{}", p, m),
            NotFound(p, m) => write!(f, "NotFound:{}:{}", p, m),
            Exists(p, m) => write!(f, "Exists:{}:{}", p, m),
            NameTooLong(p, m) => write!(f, "NameTooLong:{}:{}", p, m),
            NotSupported(p, m) => write!(f, "NotSupported:{}:{}", p, m),
            RangeError(p, m) => write!(f, "RangeError:{}:{}", p, m),
            RpnCompile(p, m) => write!(f, "RpnCompile:{}:{}", p, m),
            RpnRuntime(p, m) => write!(f, "RpnRuntime:{}:{}", p, m),
            OutOfBuffer(p, m) => write!(f, "OutOfBuffer:{}:{}", p, m),
            FailCbor(p, m) => write!(f, "FailCbor:{}:{}", p, m),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.pretty(f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.pretty(f)
    }
}

/// Type alias for Result return type, used by this package.
pub type Result<T> = std::result::Result<T, Error>;

mod config;
mod types;

pub mod cmd;
pub mod edge;
pub mod find_index;
pub mod hierarchy;
pub mod object;
pub mod proto;
pub mod rpn;
pub mod set;
pub mod snapshot;
pub mod sstring;
pub mod subscriptions;
pub mod svector;

pub use crate::config::Config;
pub use crate::hierarchy::SelvaHierarchy;
pub use crate::object::SelvaObject;
pub use crate::set::SelvaSet;
pub use crate::sstring::SelvaString;
pub use crate::svector::SVector;
pub use crate::types::{MarkerId, NodeId, NodeType, SubscriptionId, TriggerType};
