//! The bridge session: one editor, one interpreter, and everything that
//! connects them.
//!
//! A [`Session`] owns the [`Runtime`], shares the [`Editor`], and holds the
//! proxy registry, the handoff state and the output-stream buffers.  It is
//! always handled through an `Rc`; the runtime keeps a weak reference back
//! so foreign-side callbacks can find it.
//!
//! Lifecycle: the interpreter starts lazily on the first command.  If the
//! library cannot be bound or the interpreter fails to start, the feature
//! stays disabled for the rest of the session.  [`Session::shutdown`] is
//! latched against re-entry and idempotent.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use tracing::{debug, error, info, warn};

use crate::convert::{EntryPolicy, ToHost};
use crate::error::{BridgeError, ForeignError, ProxyError};
use crate::foreign::Runtime;
use crate::handoff::{Handoff, HandoffMode};
use crate::host::editor::{BufferId, Editor, EntityListener, TabId, WindowId};
use crate::host::services::HostServices;
use crate::host::value::{Value, VAR_DEF_SCOPE, VAR_FIXED, VAR_LOCKED, VAR_SCOPE};
use crate::proxy::{Builtin, EntityKey, Proxy, ProxyClass, ProxyTable, Stream, Target};

/// Name of the module scripts import.
pub const MODULE_NAME: &str = "vim";

/// Per-session settings.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub mode: HandoffMode,
    /// Interpreter home directory (`PYTHONHOME`).
    pub home: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Ready,
    Disabled,
    Finalized,
}

/// Partial-line buffers of the two output streams.
#[derive(Default)]
pub(crate) struct OutputState {
    pub(crate) pending: RefCell<[String; 2]>,
    pub(crate) softspace: Cell<i64>,
}

pub struct Session<R: Runtime> {
    pub(crate) rt: R,
    config: SessionConfig,
    pub(crate) editor: Rc<RefCell<Editor>>,
    services: RefCell<Box<dyn HostServices>>,
    pub(crate) proxies: RefCell<ProxyTable<R::Weak>>,
    /// Entities destroyed while the table was borrowed.
    orphaned: RefCell<Vec<EntityKey>>,
    pub(crate) handoff: Handoff,
    state: Cell<Lifecycle>,
    /// Why start-up failed, repeated by every later command.
    disabled: RefCell<String>,
    ending: Cell<bool>,
    pub(crate) output: OutputState,
    /// 1-based inclusive line range of the command being run.
    pub(crate) range: Cell<(usize, usize)>,
}

impl<R: Runtime> Session<R> {
    /// Create a session and register it with the editor and the runtime.
    pub fn new(
        rt: R,
        editor: Rc<RefCell<Editor>>,
        services: Box<dyn HostServices>,
        config: SessionConfig,
    ) -> Rc<Self> {
        let handoff = Handoff::new(config.mode);
        let session = Rc::new(Session {
            rt,
            config,
            editor,
            services: RefCell::new(services),
            proxies: RefCell::new(ProxyTable::default()),
            orphaned: RefCell::new(Vec::new()),
            handoff,
            state: Cell::new(Lifecycle::Uninitialized),
            disabled: RefCell::new(String::new()),
            ending: Cell::new(false),
            output: OutputState::default(),
            range: Cell::new((1, 1)),
        });
        let listener: Weak<dyn EntityListener> = Rc::downgrade(&session) as Weak<dyn EntityListener>;
        session.editor.borrow_mut().add_listener(listener);
        session.rt.bind_session(Rc::downgrade(&session));
        session
    }

    pub fn runtime(&self) -> &R {
        &self.rt
    }

    pub fn editor(&self) -> Rc<RefCell<Editor>> {
        Rc::clone(&self.editor)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.get()
    }

    pub fn handoff_mode(&self) -> HandoffMode {
        self.handoff.mode()
    }

    /// Number of live registry-managed proxies.
    pub fn live_proxies(&self) -> usize {
        self.settle();
        self.proxies.borrow().len()
    }

    pub(crate) fn editor_ref(&self) -> Result<Ref<'_, Editor>, ProxyError> {
        self.editor.try_borrow().map_err(|_| ProxyError::Host("editor is busy".into()))
    }

    pub(crate) fn editor_mut(&self) -> Result<RefMut<'_, Editor>, ProxyError> {
        self.editor.try_borrow_mut().map_err(|_| ProxyError::Host("editor is busy".into()))
    }

    pub(crate) fn services_mut(&self) -> Result<RefMut<'_, Box<dyn HostServices>>, ProxyError> {
        self.services.try_borrow_mut().map_err(|_| ProxyError::Host("host interpreter is busy".into()))
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Whether the interpreter library can be bound.  Does not start it.
    pub fn probe(&self) -> bool {
        match self.state.get() {
            Lifecycle::Ready => true,
            Lifecycle::Disabled | Lifecycle::Finalized => false,
            Lifecycle::Uninitialized => match self.rt.probe() {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "library probe failed");
                    false
                }
            },
        }
    }

    /// Bind the library and start the interpreter if that has not happened.
    pub fn ensure_ready(&self) -> Result<(), BridgeError> {
        match self.state.get() {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Disabled => Err(BridgeError::Disabled(self.disabled.borrow().clone())),
            Lifecycle::Finalized => Err(BridgeError::Finalized),
            Lifecycle::Uninitialized => self.initialize(),
        }
    }

    fn initialize(&self) -> Result<(), BridgeError> {
        if let Err(e) = self.rt.initialize(self.config.home.as_deref()) {
            error!(runtime = %self.rt.name(), error = %e, "interpreter initialisation failed");
            let reason = match &e {
                BridgeError::Link(link) => link.to_string(),
                other => other.to_string(),
            };
            self.disable(reason);
            return Err(e);
        }
        let installed = self.install_module();
        self.rt.release_initial();
        match installed {
            Ok(()) => {
                info!(runtime = %self.rt.name(), mode = %self.config.mode, "interpreter ready");
                self.state.set(Lifecycle::Ready);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "module installation failed");
                let err = BridgeError::Init(e.to_string());
                self.disable(err.to_string());
                Err(err)
            }
        }
    }

    fn disable(&self, reason: String) {
        *self.disabled.borrow_mut() = reason;
        self.state.set(Lifecycle::Disabled);
    }

    fn install_module(&self) -> Result<(), ProxyError> {
        let rt = &self.rt;
        let (globals, vimvars) = {
            let ed = self.editor_ref()?;
            (ed.globals().clone(), ed.vimvars().clone())
        };
        let members = vec![
            ("buffers", self.wrap(ProxyClass::BufferMap, Target::BufferMap)?),
            ("windows", self.wrap(ProxyClass::WindowList, Target::WindowList(None))?),
            ("tabpages", self.wrap(ProxyClass::TabList, Target::TabList)?),
            ("current", self.wrap(ProxyClass::Current, Target::Current)?),
            ("vars", self.wrap(ProxyClass::Dictionary, Target::Dict(globals))?),
            ("vvars", self.wrap(ProxyClass::Dictionary, Target::Dict(vimvars))?),
            ("command", self.wrap(ProxyClass::Builtin, Target::Builtin(Builtin::Command))?),
            ("eval", self.wrap(ProxyClass::Builtin, Target::Builtin(Builtin::Eval))?),
            ("bindeval", self.wrap(ProxyClass::Builtin, Target::Builtin(Builtin::BindEval))?),
            ("VAR_LOCKED", rt.int(VAR_LOCKED)?),
            ("VAR_FIXED", rt.int(VAR_FIXED)?),
            ("VAR_SCOPE", rt.int(VAR_SCOPE)?),
            ("VAR_DEF_SCOPE", rt.int(VAR_DEF_SCOPE)?),
        ];
        rt.install_module(MODULE_NAME, members)?;
        rt.set_sys_stream("stdout", self.wrap(ProxyClass::Output, Target::Output(Stream::Out))?)?;
        rt.set_sys_stream("stderr", self.wrap(ProxyClass::Output, Target::Output(Stream::Err))?)?;
        debug!(module = MODULE_NAME, "module installed");
        Ok(())
    }

    /// Stop the interpreter.  Safe to call more than once and from within
    /// teardown paths that may re-enter.
    pub fn shutdown(&self) {
        if self.ending.replace(true) {
            warn!("shutdown re-entered during teardown");
            return;
        }
        if self.state.get() == Lifecycle::Ready && self.rt.is_initialized() {
            if let Ok(mut table) = self.proxies.try_borrow_mut() {
                table.clear();
                self.orphaned.borrow_mut().clear();
            }
            // The lock is never given back: the interpreter is gone after this.
            let _token = self.rt.acquire(self.handoff.mode());
            self.rt.finalize();
            info!("interpreter finalised");
        }
        if self.state.get() != Lifecycle::Disabled {
            self.state.set(Lifecycle::Finalized);
        }
        self.ending.set(false);
    }

    // ── Execution ─────────────────────────────────────────────────────────────

    /// Run statements.  `range` is the 1-based inclusive line range exposed
    /// as `current.range`; it defaults to the cursor line.
    pub fn execute(&self, code: &str, range: Option<(usize, usize)>) -> Result<(), BridgeError> {
        self.ensure_ready()?;
        let range = match range {
            Some(r) => r,
            None => {
                let line = self.editor.try_borrow().map(|e| e.cursor_line()).unwrap_or(1);
                (line, line)
            }
        };
        let prev_range = self.range.replace(range);
        let outcome = match self.handoff.enter(&self.rt) {
            Ok(_guard) => self.rt.run(code),
            Err(e) => {
                self.range.set(prev_range);
                return Err(e.into());
            }
        };
        self.range.set(prev_range);
        self.flush_output();
        outcome.map_err(BridgeError::Execute)
    }

    /// Evaluate an expression and convert the result.  An absent (None)
    /// result becomes the number 0.
    pub fn evaluate(&self, expr: &str) -> Result<Value, BridgeError> {
        self.ensure_ready()?;
        let outcome = {
            let _guard = self.handoff.enter(&self.rt)?;
            let converted = match self.rt.eval(expr) {
                Ok(obj) => ToHost::new(&self.rt, EntryPolicy::Abort).convert(&obj).map_err(BridgeError::Convert),
                Err(e) => Err(BridgeError::Eval(e)),
            };
            converted
        };
        self.flush_output();
        match outcome? {
            Value::None => Ok(Value::Number(0)),
            v => Ok(v),
        }
    }

    /// Report an entry-point failure to the user.  Errors the interpreter
    /// already printed are not repeated.
    pub fn report(&self, err: &BridgeError) {
        if matches!(err, BridgeError::Execute(ForeignError::Reported)) {
            return;
        }
        warn!(error = %err, "command failed");
        if let Ok(mut ed) = self.editor.try_borrow_mut() {
            ed.emsg(err.to_string());
        }
    }

    // ── Proxy construction ────────────────────────────────────────────────────

    /// Wrap an unregistered target in a new foreign object.
    pub(crate) fn wrap(&self, class: ProxyClass, target: Target) -> Result<R::Obj, ProxyError> {
        Ok(self.rt.proxy(Proxy::new(class, target))?)
    }

    /// The unique live proxy for an editor entity, creating it if needed.
    pub(crate) fn entity(&self, key: EntityKey) -> Result<R::Obj, ProxyError> {
        self.settle();
        let exists = {
            let ed = self.editor_ref()?;
            match key {
                EntityKey::Buffer(id) => ed.buffer(id).is_some(),
                EntityKey::Window(id) => ed.window(id).is_some(),
                EntityKey::TabPage(id) => ed.tab(id).is_some(),
            }
        };
        if !exists {
            return Err(ProxyError::Invalid(key.kind_name()));
        }
        let existing = {
            let table = self.proxies.borrow();
            table.live(key).and_then(|w| self.rt.upgrade(w))
        };
        if let Some(obj) = existing {
            return Ok(obj);
        }
        let proxy = Proxy::new(key.class(), key.target());
        let core = proxy.downgrade();
        let obj = self.rt.proxy(proxy)?;
        let weak = self.rt.downgrade(&obj);
        self.proxies.borrow_mut().record(key, core, weak);
        Ok(obj)
    }

    pub(crate) fn buffer_obj(&self, id: BufferId) -> Result<R::Obj, ProxyError> {
        self.entity(EntityKey::Buffer(id))
    }

    pub(crate) fn window_obj(&self, id: WindowId) -> Result<R::Obj, ProxyError> {
        self.entity(EntityKey::Window(id))
    }

    pub(crate) fn tabpage_obj(&self, id: TabId) -> Result<R::Obj, ProxyError> {
        self.entity(EntityKey::TabPage(id))
    }

    fn destroyed(&self, key: EntityKey) {
        self.orphaned.borrow_mut().push(key);
        self.settle();
    }

    /// Invalidate proxies of destroyed entities once the table is free.
    pub(crate) fn settle(&self) {
        let Ok(mut table) = self.proxies.try_borrow_mut() else {
            debug!(queued = self.orphaned.borrow().len(), "proxy table busy; invalidation deferred");
            return;
        };
        let keys = std::mem::take(&mut *self.orphaned.borrow_mut());
        for key in keys {
            if table.invalidate(key) {
                debug!(?key, "proxy invalidated");
            }
        }
    }
}

impl<R: Runtime> EntityListener for Session<R> {
    fn buffer_destroyed(&self, id: BufferId) {
        self.destroyed(EntityKey::Buffer(id));
    }

    fn window_destroyed(&self, id: WindowId) {
        self.destroyed(EntityKey::Window(id));
    }

    fn tabpage_destroyed(&self, id: TabId) {
        self.destroyed(EntityKey::TabPage(id));
    }
}

impl<R: Runtime> Drop for Session<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreign::stub::StubRuntime;
    use crate::host::services::BasicServices;

    #[test]
    fn destruction_during_a_table_borrow_is_applied_later() {
        let editor = Rc::new(RefCell::new(Editor::new()));
        let second = editor.borrow_mut().add_buffer("other.txt", vec!["x".into()]);
        let services = Box::new(BasicServices::new());
        let s = Session::new(StubRuntime::new(), Rc::clone(&editor), services, SessionConfig::default());
        let obj = s.buffer_obj(second).unwrap();
        let proxy = obj.proxy().unwrap();

        let busy = s.proxies.borrow();
        editor.borrow_mut().wipe_buffer(second).unwrap();
        assert!(proxy.is_valid());
        assert_eq!(s.orphaned.borrow().len(), 1);
        drop(busy);

        assert_eq!(s.live_proxies(), 0);
        assert!(!proxy.is_valid());
        assert!(s.orphaned.borrow().is_empty());
        assert!(matches!(s.buffer_obj(second), Err(ProxyError::Invalid("buffer"))));
    }
}
