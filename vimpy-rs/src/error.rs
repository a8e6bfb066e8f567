//! Error types.
//!
//! | Type           | Raised by                                    | Surfaces as            |
//! |----------------|----------------------------------------------|------------------------|
//! | [`LinkError`]  | binding the shared library                   | E263 to the user       |
//! | [`HandoffError`]| entering the interpreter                    | E659 to the user       |
//! | [`ConvertError`]| value conversion in either direction        | E859 / foreign error   |
//! | [`ProxyError`] | proxy attribute, item and method dispatch    | foreign exception      |
//! | [`ForeignError`]| the interpreter itself                      | E858 / traceback       |
//! | [`ParseError`] | splitting an ex command line                 | E16 / E471 / E492      |
//! | [`BridgeError`]| every user-facing entry point                | an editor error message|

use thiserror::Error;

use crate::foreign::ExcKind;
use crate::host::services::HostError;
use crate::host::value::LockError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("could not load library {library}: {reason}")]
    LibraryNotFound { library: String, reason: String },
    #[error("could not load library function {symbol} from {library}")]
    MissingSymbol { library: String, symbol: String },
    #[error("cannot load {library}: incompatible interpreter {loaded} is already loaded")]
    IncompatibleSibling { library: String, loaded: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandoffError {
    #[error("E659: Cannot invoke Python recursively")]
    Recursive,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConvertError {
    #[error("recursive structure cannot be converted")]
    Recursive,
    #[error("dictionary keys must be strings, not {0}")]
    NonStringKey(String),
    #[error("empty keys are not allowed")]
    EmptyKey,
    #[error("unable to convert {0} to an editor value")]
    Unsupported(String),
    #[error("string cannot contain newlines")]
    Newline,
    #[error("attempt to refer to deleted {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Locked(#[from] LockError),
    #[error(transparent)]
    Foreign(#[from] ForeignError),
}

impl ConvertError {
    pub fn exc_kind(&self) -> ExcKind {
        match self {
            ConvertError::Recursive | ConvertError::EmptyKey => ExcKind::Value,
            ConvertError::NonStringKey(_) | ConvertError::Unsupported(_) => ExcKind::Type,
            ConvertError::Invalid(_) | ConvertError::Newline | ConvertError::Locked(_) => ExcKind::Vim,
            ConvertError::Foreign(f) => f.exc_kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ForeignError {
    #[error("{kind}: {message}")]
    Exception { kind: ExcKind, message: String },
    /// An exception is already set in the interpreter.
    #[error("exception pending in the interpreter")]
    Pending,
    /// The interpreter printed the error itself.
    #[error("error reported by the interpreter")]
    Reported,
    #[error("interpreter is not initialised")]
    NotInitialized,
}

impl ForeignError {
    pub fn exception(kind: ExcKind, message: impl Into<String>) -> Self {
        ForeignError::Exception { kind, message: message.into() }
    }

    pub fn exc_kind(&self) -> ExcKind {
        match self {
            ForeignError::Exception { kind, .. } => *kind,
            _ => ExcKind::Vim,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProxyError {
    #[error("attempt to refer to deleted {0}")]
    Invalid(&'static str),
    #[error("{0}")]
    Index(String),
    #[error("{0}")]
    Key(String),
    #[error("{0}")]
    Type(String),
    #[error("{0}")]
    Value(String),
    #[error("{0}")]
    Attribute(String),
    /// Host-side failure, raised as `vim.error`.
    #[error("{0}")]
    Host(String),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Foreign(#[from] ForeignError),
}

impl ProxyError {
    pub fn exc_kind(&self) -> ExcKind {
        match self {
            ProxyError::Invalid(_) | ProxyError::Host(_) => ExcKind::Vim,
            ProxyError::Index(_) => ExcKind::Index,
            ProxyError::Key(_) => ExcKind::Key,
            ProxyError::Type(_) => ExcKind::Type,
            ProxyError::Value(_) => ExcKind::Value,
            ProxyError::Attribute(_) => ExcKind::Attribute,
            ProxyError::Convert(c) => c.exc_kind(),
            ProxyError::Foreign(f) => f.exc_kind(),
        }
    }

    /// Re-express as the exception a script would observe.
    pub fn into_foreign(self) -> ForeignError {
        match self {
            ProxyError::Foreign(f) | ProxyError::Convert(ConvertError::Foreign(f)) => f,
            other => ForeignError::Exception { kind: other.exc_kind(), message: other.to_string() },
        }
    }
}

impl From<LockError> for ProxyError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::OutOfRange => ProxyError::Index(e.to_string()),
            other => ProxyError::Host(other.to_string()),
        }
    }
}

impl From<HostError> for ProxyError {
    fn from(e: HostError) -> Self {
        ProxyError::Host(e.0)
    }
}

impl From<crate::host::editor::EditorError> for ProxyError {
    fn from(e: crate::host::editor::EditorError) -> Self {
        ProxyError::Host(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("E16: Invalid range")]
    InvalidRange,
    #[error("E492: Not an editor command: {0}")]
    NotACommand(String),
    #[error("E471: Argument required")]
    ArgumentRequired,
    #[error("bad command pattern: {0}")]
    Pattern(String),
}

/// Errors surfaced by the user-facing entry points.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("E263: Sorry, this command is disabled, the Python library could not be loaded: {0}")]
    Link(#[source] LinkError),
    /// A later command after start-up failed; carries the first failure.
    #[error("E263: Sorry, this command is disabled, the Python library could not be loaded: {0}")]
    Disabled(String),
    #[error("interpreter initialisation failed: {0}")]
    Init(String),
    #[error(transparent)]
    Handoff(#[from] HandoffError),
    #[error("{0}")]
    Execute(#[source] ForeignError),
    #[error("E858: Eval did not return a valid python object")]
    Eval(#[source] ForeignError),
    #[error("E859: Failed to convert returned python object to vim value")]
    Convert(#[source] ConvertError),
    #[error("file name too long: {0}")]
    PathTooLong(String),
    #[error("{0}")]
    Host(#[from] HostError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("interpreter has been shut down")]
    Finalized,
}

impl From<LinkError> for BridgeError {
    fn from(e: LinkError) -> Self {
        BridgeError::Link(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_codes() {
        assert!(BridgeError::Disabled("no library".into()).to_string().starts_with("E263"));
        assert!(BridgeError::from(HandoffError::Recursive).to_string().starts_with("E659"));
        assert!(BridgeError::Eval(ForeignError::Pending).to_string().starts_with("E858"));
        assert!(BridgeError::Convert(ConvertError::Recursive).to_string().starts_with("E859"));
    }

    #[test]
    fn link_failures_name_the_library_and_symbol() {
        let missing = LinkError::MissingSymbol { library: "libpython3.so".into(), symbol: "PyRun_String".into() };
        let text = BridgeError::from(missing).to_string();
        assert!(text.starts_with("E263"));
        assert!(text.contains("libpython3.so"), "{text}");
        assert!(text.contains("PyRun_String"), "{text}");

        let absent = LinkError::LibraryNotFound { library: "libpython3.9.so".into(), reason: "no such file".into() };
        let text = BridgeError::from(absent).to_string();
        assert!(text.contains("libpython3.9.so") && text.contains("no such file"), "{text}");
    }

    #[test]
    fn proxy_errors_map_to_exceptions() {
        assert_eq!(ProxyError::Invalid("buffer").exc_kind(), ExcKind::Vim);
        assert_eq!(ProxyError::Index("x".into()).exc_kind(), ExcKind::Index);
        assert_eq!(ProxyError::from(ConvertError::NonStringKey("int".into())).exc_kind(), ExcKind::Type);
        assert_eq!(ProxyError::from(LockError::DictLocked).exc_kind(), ExcKind::Vim);
        assert_eq!(ConvertError::from(LockError::DictLocked).exc_kind(), ExcKind::Vim);
        assert_eq!(ConvertError::from(LockError::DictLocked).to_string(), "dictionary is locked");
        let f = ProxyError::Invalid("window").into_foreign();
        assert_eq!(f, ForeignError::exception(ExcKind::Vim, "attempt to refer to deleted window"));
    }
}
