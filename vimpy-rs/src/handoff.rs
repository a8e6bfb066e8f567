//! Control handoff between the editor and the interpreter.
//!
//! Every entry into foreign code goes through a [`ForeignGuard`].  Entering
//! marks the foreign side current, forces `LC_NUMERIC` to `"C"` and takes
//! the interpreter lock; dropping the guard undoes all three in reverse, so
//! early returns and panics restore state too.
//!
//! Two lock disciplines are supported:
//!
//! | Mode          | Lock primitive              | Nested entry            |
//! |---------------|-----------------------------|-------------------------|
//! | `Reentrant`   | per-thread ensure / release | allowed                 |
//! | `SingleCall`  | save / restore thread state | refused (E659)          |

use std::cell::Cell;
use std::ffi::{CStr, CString};
use std::fmt;
use std::str::FromStr;

use tracing::trace;

use crate::error::HandoffError;
use crate::foreign::{LockToken, Runtime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandoffMode {
    #[default]
    Reentrant,
    SingleCall,
}

impl FromStr for HandoffMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reentrant" => Ok(HandoffMode::Reentrant),
            "single" | "single-call" => Ok(HandoffMode::SingleCall),
            other => Err(format!("unknown handoff mode '{other}' (expected reentrant or single)")),
        }
    }
}

impl fmt::Display for HandoffMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandoffMode::Reentrant => "reentrant",
            HandoffMode::SingleCall => "single",
        })
    }
}

/// Which side of the bridge currently owns execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Foreign,
}

/// Per-session handoff state.
#[derive(Debug)]
pub struct Handoff {
    mode: HandoffMode,
    depth: Cell<usize>,
    side: Cell<Side>,
}

impl Handoff {
    pub fn new(mode: HandoffMode) -> Self {
        Handoff { mode, depth: Cell::new(0), side: Cell::new(Side::Host) }
    }

    pub fn mode(&self) -> HandoffMode {
        self.mode
    }

    pub fn side(&self) -> Side {
        self.side.get()
    }

    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    /// Enter foreign code.
    pub fn enter<'a, R: Runtime>(&'a self, rt: &'a R) -> Result<ForeignGuard<'a, R>, HandoffError> {
        if self.mode == HandoffMode::SingleCall && self.depth.get() > 0 {
            return Err(HandoffError::Recursive);
        }
        self.depth.set(self.depth.get() + 1);
        let prev_side = self.side.replace(Side::Foreign);
        let locale = NumericLocale::force_c();
        let token = rt.acquire(self.mode);
        trace!(depth = self.depth.get(), mode = %self.mode, "entered foreign side");
        Ok(ForeignGuard { handoff: self, rt, token, prev_side, _locale: locale })
    }
}

/// RAII scope of one foreign-side execution.
pub struct ForeignGuard<'a, R: Runtime> {
    handoff: &'a Handoff,
    rt: &'a R,
    token: LockToken,
    prev_side: Side,
    _locale: NumericLocale,
}

impl<R: Runtime> Drop for ForeignGuard<'_, R> {
    fn drop(&mut self) {
        self.rt.release(self.handoff.mode, self.token);
        self.handoff.side.set(self.prev_side);
        self.handoff.depth.set(self.handoff.depth.get().saturating_sub(1));
        trace!(depth = self.handoff.depth.get(), "left foreign side");
    }
}

/// Forces `LC_NUMERIC` to `"C"` for its lifetime, restoring the previous
/// setting on drop.  Does nothing when the category is already `"C"`.
pub struct NumericLocale {
    saved: Option<CString>,
}

impl NumericLocale {
    pub fn force_c() -> Self {
        // SAFETY: a null locale argument only queries the current setting;
        // the returned string is copied before any further setlocale call.
        let saved = unsafe {
            let cur = libc::setlocale(libc::LC_NUMERIC, std::ptr::null());
            if cur.is_null() {
                None
            } else {
                let cur = CStr::from_ptr(cur);
                if cur.to_bytes() == b"C" {
                    None
                } else {
                    Some(cur.to_owned())
                }
            }
        };
        if saved.is_some() {
            // SAFETY: "C" is a valid, NUL-terminated locale name.
            unsafe {
                libc::setlocale(libc::LC_NUMERIC, c"C".as_ptr());
            }
        }
        NumericLocale { saved }
    }

    /// The setting that will be restored, if one was changed.
    pub fn saved(&self) -> Option<&CStr> {
        self.saved.as_deref()
    }
}

impl Drop for NumericLocale {
    fn drop(&mut self) {
        if let Some(prev) = self.saved.take() {
            // SAFETY: `prev` is the NUL-terminated name returned earlier.
            unsafe {
                libc::setlocale(libc::LC_NUMERIC, prev.as_ptr());
            }
        }
    }
}
