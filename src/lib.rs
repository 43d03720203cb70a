//! Remote source-level debugger server for compiled Pawn-style script
//! images.
//!
//! The crate has two coupled halves. [`image`] parses and validates the
//! binary script container and exposes its debug and RTTI tables; [`debugger`]
//! runs one session per connected IDE client, intercepts VM breaks through
//! the [`vm`] seam, and speaks the binary framing protocol in [`proto`] over
//! the TCP listener in [`net`].

pub mod debugger;
pub mod image;
pub mod log;
pub mod net;
pub mod proto;
pub mod settings;
pub mod vm;

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
