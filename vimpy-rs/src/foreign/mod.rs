//! The foreign interpreter seam.
//!
//! [`Runtime`] is everything the bridge needs from an embedded interpreter:
//! lifecycle, the interpreter lock, code execution, object construction and
//! classification, weak references and module installation.  Two backends:
//!
//! | Backend              | Purpose                                              |
//! |----------------------|------------------------------------------------------|
//! | [`cpython::CPython`] | real CPython 3 through a runtime-linked library      |
//! | [`stub::StubRuntime`]| in-process object graph; scripts are Rust closures   |

pub mod cpython;
pub mod linker;
pub mod stub;

use std::fmt;
use std::path::Path;
use std::rc::Weak;

use crate::error::{BridgeError, ForeignError, LinkError};
use crate::handoff::HandoffMode;
use crate::proxy::Proxy;
use crate::session::Session;

/// Exception classes the bridge raises on the foreign side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcKind {
    Attribute,
    Index,
    Key,
    Type,
    Value,
    Overflow,
    /// The module's own `vim.error` class.
    Vim,
}

impl fmt::Display for ExcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExcKind::Attribute => "AttributeError",
            ExcKind::Index => "IndexError",
            ExcKind::Key => "KeyError",
            ExcKind::Type => "TypeError",
            ExcKind::Value => "ValueError",
            ExcKind::Overflow => "OverflowError",
            ExcKind::Vim => "vim.error",
        })
    }
}

/// Classification of a foreign object, checked in this order by conversion.
#[derive(Debug)]
pub enum Inspect<'a> {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    List,
    Tuple,
    Dict,
    Slice(SliceSpec),
    Proxy(&'a Proxy),
    Other { mapping_like: bool, sequence_like: bool },
}

/// Opaque value returned by [`Runtime::acquire`] and handed back to
/// [`Runtime::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockToken(pub isize);

/// An embedded interpreter.
///
/// All object-level methods may only be called while the interpreter lock
/// is held (inside a handoff guard, or during initialisation).
pub trait Runtime: Sized + 'static {
    /// Strong reference to a foreign object.
    type Obj: Clone + 'static;
    /// Non-owning back-reference used by the proxy registry.
    type Weak: 'static;

    fn name(&self) -> String;

    /// Bind the shared library without starting the interpreter.
    fn probe(&self) -> Result<(), LinkError>;
    /// Start the interpreter.  On success the calling thread holds the lock.
    fn initialize(&self, home: Option<&Path>) -> Result<(), BridgeError>;
    fn is_initialized(&self) -> bool;
    /// Give up the lock taken by [`Runtime::initialize`].
    fn release_initial(&self);
    /// Stop the interpreter.  Called with the lock held.
    fn finalize(&self);
    /// Make `session` reachable from foreign-side callbacks.
    fn bind_session(&self, session: Weak<Session<Self>>);

    fn acquire(&self, mode: HandoffMode) -> LockToken;
    fn release(&self, mode: HandoffMode, token: LockToken);

    /// Execute statements in the interpreter's main namespace.  Errors have
    /// already been printed to the foreign `sys.stderr` when the result is
    /// [`ForeignError::Reported`].
    fn run(&self, code: &str) -> Result<(), ForeignError>;
    /// Evaluate one expression.
    fn eval(&self, expr: &str) -> Result<Self::Obj, ForeignError>;

    fn none(&self) -> Result<Self::Obj, ForeignError>;
    fn bool(&self, b: bool) -> Result<Self::Obj, ForeignError>;
    fn int(&self, n: i64) -> Result<Self::Obj, ForeignError>;
    fn float(&self, x: f64) -> Result<Self::Obj, ForeignError>;
    fn str(&self, s: &str) -> Result<Self::Obj, ForeignError>;
    fn list(&self, items: Vec<Self::Obj>) -> Result<Self::Obj, ForeignError>;
    fn tuple(&self, items: Vec<Self::Obj>) -> Result<Self::Obj, ForeignError>;
    fn dict(&self, entries: Vec<(String, Self::Obj)>) -> Result<Self::Obj, ForeignError>;
    /// Wrap a proxy in a foreign object of the proxy's class.
    fn proxy(&self, proxy: Proxy) -> Result<Self::Obj, ForeignError>;

    fn inspect<'a>(&self, obj: &'a Self::Obj) -> Result<Inspect<'a>, ForeignError>;
    /// Stable address-like identity of a live object.
    fn identity(&self, obj: &Self::Obj) -> usize;
    /// Elements of a list, tuple or sequence-like object.
    fn items(&self, obj: &Self::Obj) -> Result<Vec<Self::Obj>, ForeignError>;
    /// Key/value pairs of a dict or mapping-like object.
    fn mapping_items(&self, obj: &Self::Obj) -> Result<Vec<(Self::Obj, Self::Obj)>, ForeignError>;
    /// The object's `str()` form.
    fn str_form(&self, obj: &Self::Obj) -> Result<String, ForeignError>;
    fn type_name(&self, obj: &Self::Obj) -> String;

    fn downgrade(&self, obj: &Self::Obj) -> Self::Weak;
    /// Recover a strong reference.  Only called while the proxy the weak
    /// reference points at is known to be alive.
    fn upgrade(&self, weak: &Self::Weak) -> Option<Self::Obj>;

    /// Create module `name` (with its `error` exception class) and register
    /// it so scripts can import it.
    fn install_module(&self, name: &str, members: Vec<(&'static str, Self::Obj)>) -> Result<(), ForeignError>;
    /// Replace `sys.<name>` (stdout / stderr).
    fn set_sys_stream(&self, name: &str, stream: Self::Obj) -> Result<(), ForeignError>;
}

// ── Slices ────────────────────────────────────────────────────────────────────

/// Slice bounds with defaults filled in but not yet clamped to a length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceSpec {
    pub start: isize,
    pub stop: isize,
    pub step: isize,
}

impl SliceSpec {
    /// Fill in defaults for missing bounds.  A zero step is an error.
    pub fn unpack(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Result<Self, ForeignError> {
        let step = step.unwrap_or(1);
        if step == 0 {
            return Err(ForeignError::Exception {
                kind: ExcKind::Value,
                message: "slice step cannot be zero".into(),
            });
        }
        let clamp = |n: i64| n.clamp(isize::MIN as i64, isize::MAX as i64) as isize;
        let step = clamp(step).max(-isize::MAX);
        let (dstart, dstop) = if step < 0 { (isize::MAX, isize::MIN) } else { (0, isize::MAX) };
        Ok(SliceSpec {
            start: start.map(clamp).unwrap_or(dstart),
            stop: stop.map(clamp).unwrap_or(dstop),
            step,
        })
    }

    /// Clamp to a sequence of length `len`, returning `(start, stop, count)`.
    pub fn adjust(&self, len: usize) -> (isize, isize, usize) {
        let len = len as isize;
        let fix = |mut i: isize, hi: isize| {
            if i < 0 {
                i += len;
                if i < 0 {
                    i = if self.step < 0 { -1 } else { 0 };
                }
            } else if i >= len {
                i = hi;
            }
            i
        };
        let hi = if self.step < 0 { len - 1 } else { len };
        let start = fix(self.start, hi);
        let stop = fix(self.stop, hi);
        let count = if self.step < 0 {
            if stop < start { (start - stop - 1) / (-self.step) + 1 } else { 0 }
        } else if start < stop {
            (stop - start - 1) / self.step + 1
        } else {
            0
        };
        (start, stop, count as usize)
    }

    /// Contiguous `lo..hi` bounds for a step-1 slice.
    pub fn contiguous(&self, len: usize) -> Option<(usize, usize)> {
        if self.step != 1 {
            return None;
        }
        let (start, stop, _) = self.adjust(len);
        let lo = start.max(0) as usize;
        Some((lo, (stop.max(0) as usize).max(lo)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_defaults() {
        let s = SliceSpec::unpack(None, None, None).unwrap();
        assert_eq!(s.adjust(5), (0, 5, 5));
        let s = SliceSpec::unpack(None, None, Some(-1)).unwrap();
        assert_eq!(s.adjust(5), (4, -1, 5));
    }

    #[test]
    fn slice_negative_bounds() {
        let s = SliceSpec::unpack(Some(-2), None, None).unwrap();
        assert_eq!(s.contiguous(5), Some((3, 5)));
        let s = SliceSpec::unpack(Some(1), Some(-10), None).unwrap();
        assert_eq!(s.contiguous(5), Some((1, 1)));
        let s = SliceSpec::unpack(Some(3), Some(100), None).unwrap();
        assert_eq!(s.contiguous(5), Some((3, 5)));
    }

    #[test]
    fn slice_step() {
        let s = SliceSpec::unpack(None, None, Some(2)).unwrap();
        assert_eq!(s.adjust(5), (0, 5, 3));
        assert_eq!(s.contiguous(5), None);
        assert!(SliceSpec::unpack(None, None, Some(0)).is_err());
    }

    #[test]
    fn exc_kind_names() {
        assert_eq!(ExcKind::Vim.to_string(), "vim.error");
        assert_eq!(ExcKind::Index.to_string(), "IndexError");
    }
}
