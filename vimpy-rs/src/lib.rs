//! Embedded Python bridge for a modal text editor.
//!
//! The interpreter is bound at run time from a shared library
//! ([`foreign::linker`]), started lazily on the first command and driven
//! through [`session::Session`].  Scripts see the editor through the `vim`
//! module: buffers, windows, tab pages, variables and host commands, all as
//! live proxies ([`proxy`]).

pub mod cli;
pub mod commands;
pub mod config;
pub mod convert;
pub mod error;
pub mod foreign;
pub mod handoff;
pub mod host;
pub mod proxy;
pub mod session;

pub use error::BridgeError;
pub use session::{Session, SessionConfig};
