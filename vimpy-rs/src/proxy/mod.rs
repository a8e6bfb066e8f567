//! Proxy objects: foreign-side handles onto live editor state.
//!
//! A [`Proxy`] is owned by exactly one foreign object.  Editor entities
//! (buffers, windows, tab pages) get at most one live proxy each, recorded
//! in the session's [`ProxyTable`] as a pair of weak references: one to the
//! proxy's Rust core, used to decide whether the foreign object still
//! exists, and one to the foreign object, used to hand the same identity
//! back.  Destroying an entity flips its proxy to the invalid state; the
//! foreign object itself lives on until the script drops it.
//!
//! Dispatch for each class lives in a submodule:
//!
//! | Module       | Classes                                              |
//! |--------------|------------------------------------------------------|
//! | `buffer`     | buffer, range, `current.line`                        |
//! | `window`     | window, tab page, buffer map, window / tab lists, current |
//! | `container`  | dictionary, list, function                           |
//! | `module`     | `vim.command` / `eval` / `bindeval`, output streams  |
//! | `dispatch`   | the per-operation entry points tying them together   |

mod buffer;
mod container;
mod dispatch;
mod module;
mod window;

pub use dispatch::Attr;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::host::editor::{BufferId, TabId, WindowId};
use crate::host::value::{Dict, FuncRef, List};

/// Foreign-visible class of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyClass {
    Buffer,
    Range,
    Window,
    TabPage,
    BufferMap,
    WindowList,
    TabList,
    Current,
    Dictionary,
    List,
    Function,
    Builtin,
    Output,
    Method,
}

/// Which protocol slots a class fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Caps {
    pub sequence: bool,
    pub mapping: bool,
    pub callable: bool,
    pub iterable: bool,
}

impl ProxyClass {
    pub const ALL: [ProxyClass; 14] = [
        ProxyClass::Buffer,
        ProxyClass::Range,
        ProxyClass::Window,
        ProxyClass::TabPage,
        ProxyClass::BufferMap,
        ProxyClass::WindowList,
        ProxyClass::TabList,
        ProxyClass::Current,
        ProxyClass::Dictionary,
        ProxyClass::List,
        ProxyClass::Function,
        ProxyClass::Builtin,
        ProxyClass::Output,
        ProxyClass::Method,
    ];

    /// Qualified type name shown by `type()`.
    pub fn type_name(self) -> &'static str {
        match self {
            ProxyClass::Buffer => "vim.buffer",
            ProxyClass::Range => "vim.range",
            ProxyClass::Window => "vim.window",
            ProxyClass::TabPage => "vim.tabpage",
            ProxyClass::BufferMap => "vim.bufferlist",
            ProxyClass::WindowList => "vim.windowlist",
            ProxyClass::TabList => "vim.tabpagelist",
            ProxyClass::Current => "vim.currentdata",
            ProxyClass::Dictionary => "vim.dictionary",
            ProxyClass::List => "vim.list",
            ProxyClass::Function => "vim.function",
            ProxyClass::Builtin => "vim.builtin",
            ProxyClass::Output => "vim.message",
            ProxyClass::Method => "vim.method",
        }
    }

    pub fn caps(self) -> Caps {
        match self {
            ProxyClass::Buffer
            | ProxyClass::Range
            | ProxyClass::List
            | ProxyClass::WindowList
            | ProxyClass::TabList => Caps { sequence: true, ..Caps::default() },
            ProxyClass::BufferMap | ProxyClass::Dictionary => {
                Caps { mapping: true, iterable: true, ..Caps::default() }
            }
            ProxyClass::Function | ProxyClass::Builtin | ProxyClass::Method => {
                Caps { callable: true, ..Caps::default() }
            }
            ProxyClass::Current | ProxyClass::Window | ProxyClass::TabPage | ProxyClass::Output => {
                Caps::default()
            }
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Module-level callables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Command,
    Eval,
    BindEval,
}

/// `sys.stdout` / `sys.stderr` replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Out,
    Err,
}

/// What a proxy refers to.
#[derive(Clone)]
pub enum Target {
    Buffer(BufferId),
    Window(WindowId),
    TabPage(TabId),
    /// 1-based inclusive line span.  The end moves as the range is edited
    /// and is shared with bound methods of the range.
    Range { buffer: BufferId, start: i64, end: Rc<Cell<i64>> },
    BufferMap,
    /// Windows of one tab page, or of the current one when `None`.
    WindowList(Option<TabId>),
    TabList,
    Current,
    Dict(Dict),
    List(List),
    Function(FuncRef),
    Builtin(Builtin),
    Output(Stream),
    Method { receiver: Box<Target>, class: ProxyClass, name: &'static str },
    /// The entity this proxy referred to has been destroyed.
    Invalid,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Buffer(id) => write!(f, "Buffer({id})"),
            Target::Window(id) => write!(f, "Window({id})"),
            Target::TabPage(id) => write!(f, "TabPage({id})"),
            Target::Range { buffer, start, end } => write!(f, "Range({buffer}, {start}..={})", end.get()),
            Target::BufferMap => write!(f, "BufferMap"),
            Target::WindowList(tab) => write!(f, "WindowList({tab:?})"),
            Target::TabList => write!(f, "TabList"),
            Target::Current => write!(f, "Current"),
            Target::Dict(d) => write!(f, "Dict@{:#x}", d.id()),
            Target::List(l) => write!(f, "List@{:#x}", l.id()),
            Target::Function(func) => write!(f, "Function({})", func.name),
            Target::Builtin(b) => write!(f, "Builtin({b:?})"),
            Target::Output(s) => write!(f, "Output({s:?})"),
            Target::Method { class, name, .. } => write!(f, "Method({}.{name})", class.type_name()),
            Target::Invalid => write!(f, "Invalid"),
        }
    }
}

pub(crate) struct ProxyCore {
    class: ProxyClass,
    target: RefCell<Target>,
}

/// Rust-side state of one foreign proxy object.
pub struct Proxy {
    core: Rc<ProxyCore>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proxy({}, {:?})", self.class().type_name(), self.core.target.borrow())
    }
}

impl Proxy {
    pub(crate) fn new(class: ProxyClass, target: Target) -> Self {
        Proxy { core: Rc::new(ProxyCore { class, target: RefCell::new(target) }) }
    }

    pub fn class(&self) -> ProxyClass {
        self.core.class
    }

    pub fn target(&self) -> Target {
        self.core.target.borrow().clone()
    }

    pub fn is_valid(&self) -> bool {
        !matches!(*self.core.target.borrow(), Target::Invalid)
    }

    /// Entity key for registry-managed proxies.
    pub fn entity(&self) -> Option<EntityKey> {
        match *self.core.target.borrow() {
            Target::Buffer(id) => Some(EntityKey::Buffer(id)),
            Target::Window(id) => Some(EntityKey::Window(id)),
            Target::TabPage(id) => Some(EntityKey::TabPage(id)),
            _ => None,
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ProxyCore> {
        Rc::downgrade(&self.core)
    }
}

impl ProxyCore {
    fn invalidate(&self) {
        *self.target.borrow_mut() = Target::Invalid;
    }
}

/// Identity of a registry-managed editor entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Buffer(BufferId),
    Window(WindowId),
    TabPage(TabId),
}

impl EntityKey {
    pub fn class(self) -> ProxyClass {
        match self {
            EntityKey::Buffer(_) => ProxyClass::Buffer,
            EntityKey::Window(_) => ProxyClass::Window,
            EntityKey::TabPage(_) => ProxyClass::TabPage,
        }
    }

    pub fn target(self) -> Target {
        match self {
            EntityKey::Buffer(id) => Target::Buffer(id),
            EntityKey::Window(id) => Target::Window(id),
            EntityKey::TabPage(id) => Target::TabPage(id),
        }
    }

    pub fn kind_name(self) -> &'static str {
        match self {
            EntityKey::Buffer(_) => "buffer",
            EntityKey::Window(_) => "window",
            EntityKey::TabPage(_) => "tab page",
        }
    }
}

struct Slot<W> {
    core: Weak<ProxyCore>,
    foreign: W,
}

/// Back-reference slots from editor entities to their live proxies.
pub struct ProxyTable<W> {
    slots: HashMap<EntityKey, Slot<W>>,
}

impl<W> Default for ProxyTable<W> {
    fn default() -> Self {
        ProxyTable { slots: HashMap::new() }
    }
}

impl<W> ProxyTable<W> {
    /// Weak foreign reference for `key`, if its proxy is still alive.
    pub fn live(&self, key: EntityKey) -> Option<&W> {
        let slot = self.slots.get(&key)?;
        (slot.core.strong_count() > 0).then_some(&slot.foreign)
    }

    pub(crate) fn record(&mut self, key: EntityKey, core: Weak<ProxyCore>, foreign: W) {
        self.slots.retain(|_, s| s.core.strong_count() > 0);
        self.slots.insert(key, Slot { core, foreign });
    }

    /// Entity destroyed: invalidate its proxy (if any) and clear the slot.
    /// Returns whether a live proxy was invalidated.
    pub fn invalidate(&mut self, key: EntityKey) -> bool {
        match self.slots.remove(&key).and_then(|s| s.core.upgrade()) {
            Some(core) => {
                core.invalidate();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.values().filter(|s| s.core.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        for (_, slot) in self.slots.drain() {
            if let Some(core) = slot.core.upgrade() {
                core.invalidate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_tracks_liveness() {
        let mut table: ProxyTable<u32> = ProxyTable::default();
        let key = EntityKey::Buffer(3);
        let p = Proxy::new(ProxyClass::Buffer, Target::Buffer(3));
        table.record(key, p.downgrade(), 7);
        assert_eq!(table.live(key), Some(&7));
        drop(p);
        assert_eq!(table.live(key), None);
        assert!(table.is_empty());
    }

    #[test]
    fn invalidate_flips_target() {
        let mut table: ProxyTable<()> = ProxyTable::default();
        let p = Proxy::new(ProxyClass::Window, Target::Window(1000));
        table.record(EntityKey::Window(1000), p.downgrade(), ());
        assert!(table.invalidate(EntityKey::Window(1000)));
        assert!(!p.is_valid());
        assert_eq!(p.entity(), None);
        assert!(!table.invalidate(EntityKey::Window(1000)));
    }

    #[test]
    fn classes_have_distinct_indices() {
        for (i, c) in ProxyClass::ALL.iter().enumerate() {
            assert_eq!(c.index(), i);
        }
        assert!(ProxyClass::Buffer.caps().sequence);
        assert!(ProxyClass::Dictionary.caps().mapping);
        assert!(ProxyClass::Method.caps().callable);
    }
}
