//! CPython 3 backend.
//!
//! Every proxy class becomes a heap type built with `PyType_FromSpec`.
//! Instances carry a boxed [`Proxy`]; the type's slots are `extern "C"`
//! trampolines that find the session through a thread-local, run the
//! matching `Session::proxy_*` entry point and turn a [`ProxyError`] into a
//! Python exception.  Panics never cross the C boundary.
//!
//! Object references are [`PyRef`]s: cloning increments the reference
//! count and dropping decrements it, so they must only be created and
//! dropped while the interpreter lock is held.

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::{debug, error, trace};

use super::linker::{self, Bound, Obj, PyObject, PyThreadState, PyTypeObject, PyTypeSlot, PyTypeSpec};
use super::linker::{
    PY_EVAL_INPUT, PY_FILE_INPUT, PY_MP_ASS_SUBSCRIPT, PY_MP_LENGTH, PY_MP_SUBSCRIPT, PY_SQ_ASS_ITEM, PY_SQ_ITEM,
    PY_SQ_LENGTH, PY_TPFLAGS_DEFAULT, PY_TP_CALL, PY_TP_DEALLOC, PY_TP_GETATTRO, PY_TP_ITER, PY_TP_REPR,
    PY_TP_SETATTRO,
};
use super::{ExcKind, Inspect, LockToken, Runtime, SliceSpec};
use crate::error::{BridgeError, ForeignError, LinkError, ProxyError};
use crate::handoff::HandoffMode;
use crate::proxy::{Attr, Proxy, ProxyClass};
use crate::session::Session;

thread_local! {
    static SESSION: RefCell<Option<Weak<Session<CPython>>>> = const { RefCell::new(None) };
}

/// Instance layout of every proxy type.
#[repr(C)]
struct ProxyObject {
    ob_base: PyObject,
    proxy: *mut Proxy,
}

fn type_cname(class: ProxyClass) -> &'static CStr {
    match class {
        ProxyClass::Buffer => c"vim.buffer",
        ProxyClass::Range => c"vim.range",
        ProxyClass::Window => c"vim.window",
        ProxyClass::TabPage => c"vim.tabpage",
        ProxyClass::BufferMap => c"vim.bufferlist",
        ProxyClass::WindowList => c"vim.windowlist",
        ProxyClass::TabList => c"vim.tabpagelist",
        ProxyClass::Current => c"vim.currentdata",
        ProxyClass::Dictionary => c"vim.dictionary",
        ProxyClass::List => c"vim.list",
        ProxyClass::Function => c"vim.function",
        ProxyClass::Builtin => c"vim.builtin",
        ProxyClass::Output => c"vim.message",
        ProxyClass::Method => c"vim.method",
    }
}

const BUILTIN_EXCEPTIONS: [(ExcKind, &CStr); 6] = [
    (ExcKind::Attribute, c"AttributeError"),
    (ExcKind::Index, c"IndexError"),
    (ExcKind::Key, c"KeyError"),
    (ExcKind::Type, c"TypeError"),
    (ExcKind::Value, c"ValueError"),
    (ExcKind::Overflow, c"OverflowError"),
];

fn cstring(s: &str) -> Result<CString, ForeignError> {
    CString::new(s).map_err(|_| ForeignError::exception(ExcKind::Value, "embedded null character"))
}

// ── References ────────────────────────────────────────────────────────────────

/// A strong reference to a Python object.
pub struct PyRef {
    ptr: NonNull<PyObject>,
    bound: Arc<Bound>,
}

impl PyRef {
    /// Adopt a new reference.  Null means the call failed with an
    /// exception set.
    unsafe fn owned(bound: &Arc<Bound>, ptr: Obj) -> Result<Self, ForeignError> {
        NonNull::new(ptr)
            .map(|ptr| PyRef { ptr, bound: Arc::clone(bound) })
            .ok_or(ForeignError::Pending)
    }

    /// Take a new reference to a borrowed pointer.
    unsafe fn borrowed(bound: &Arc<Bound>, ptr: Obj) -> Result<Self, ForeignError> {
        if !ptr.is_null() {
            (bound.api.Py_IncRef)(ptr);
        }
        Self::owned(bound, ptr)
    }

    pub fn as_ptr(&self) -> Obj {
        self.ptr.as_ptr()
    }

    /// Hand the reference over to the interpreter.
    fn into_raw(self) -> Obj {
        let ptr = self.ptr.as_ptr();
        mem::forget(self);
        ptr
    }
}

impl Clone for PyRef {
    fn clone(&self) -> Self {
        // SAFETY: the pointer is a live object; the lock is held.
        unsafe { (self.bound.api.Py_IncRef)(self.as_ptr()) };
        PyRef { ptr: self.ptr, bound: Arc::clone(&self.bound) }
    }
}

impl Drop for PyRef {
    fn drop(&mut self) {
        // SAFETY: we own one reference; the lock is held.
        unsafe { (self.bound.api.Py_DecRef)(self.as_ptr()) };
    }
}

impl fmt::Debug for PyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PyRef({:p})", self.ptr)
    }
}

/// Address of an object whose liveness is tracked elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct PyWeak(usize);

// ── Runtime ───────────────────────────────────────────────────────────────────

struct Interp {
    globals: PyRef,
    classes: Vec<PyRef>,
    exceptions: HashMap<ExcKind, PyRef>,
}

/// The CPython 3 runtime, bound from a shared library on first use.
pub struct CPython {
    library: String,
    siblings: Vec<String>,
    bound: OnceCell<Arc<Bound>>,
    interp: RefCell<Option<Interp>>,
    saved: Cell<*mut PyThreadState>,
}

impl CPython {
    /// `library` is the file name handed to the dynamic loader; `siblings`
    /// are interpreter libraries that must not already be resident.
    pub fn new(library: impl Into<String>, siblings: Vec<String>) -> Self {
        CPython {
            library: library.into(),
            siblings,
            bound: OnceCell::new(),
            interp: RefCell::new(None),
            saved: Cell::new(ptr::null_mut()),
        }
    }

    /// The bound library.  Object operations only run after a successful
    /// [`Runtime::initialize`], which binds it first.
    fn lib(&self) -> Result<&Arc<Bound>, ForeignError> {
        self.bound.get().ok_or(ForeignError::NotInitialized)
    }

    fn globals(&self) -> Result<PyRef, ForeignError> {
        self.interp.borrow().as_ref().map(|i| i.globals.clone()).ok_or(ForeignError::NotInitialized)
    }

    fn class_type(&self, class: ProxyClass) -> Result<Obj, ForeignError> {
        self.interp
            .borrow()
            .as_ref()
            .and_then(|i| i.classes.get(class.index()))
            .map(PyRef::as_ptr)
            .ok_or(ForeignError::NotInitialized)
    }

    fn is_proxy_type(&self, ty: *mut PyTypeObject) -> bool {
        self.interp
            .borrow()
            .as_ref()
            .is_some_and(|i| i.classes.iter().any(|c| c.as_ptr() as *mut PyTypeObject == ty))
    }

    /// UTF-8 text of a str object; undecodable code points are replaced.
    unsafe fn decode(&self, obj: Obj) -> Result<String, ForeignError> {
        let b = self.lib()?;
        let encoded = PyRef::owned(b, (b.encode)(obj, c"utf-8".as_ptr(), c"replace".as_ptr()))?;
        self.bytes_of(encoded.as_ptr())
    }

    unsafe fn bytes_of(&self, obj: Obj) -> Result<String, ForeignError> {
        let b = self.lib()?;
        let mut data: *mut c_char = ptr::null_mut();
        let mut len: isize = 0;
        if (b.api.PyBytes_AsStringAndSize)(obj, &mut data, &mut len) < 0 {
            return Err(ForeignError::Pending);
        }
        let bytes = std::slice::from_raw_parts(data as *const u8, len.max(0) as usize);
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    unsafe fn is_instance(b: &Bound, obj: Obj, ty: Obj) -> bool {
        (b.api.PyObject_IsInstance)(obj, ty) == 1
    }

    /// Print and clear a pending exception.
    fn print_pending(&self) {
        let Ok(b) = self.lib() else {
            return;
        };
        // SAFETY: lock held by the caller.
        unsafe {
            if !(b.api.PyErr_Occurred)().is_null() {
                (b.api.PyErr_PrintEx)(0);
            }
        }
    }

    /// Set the Python exception for `err`.
    fn raise(&self, err: ProxyError) {
        let (kind, message) = match err.into_foreign() {
            ForeignError::Pending => return,
            ForeignError::Exception { kind, message } => (kind, message),
            other => (ExcKind::Vim, other.to_string()),
        };
        trace!(%kind, %message, "raising");
        let Ok(b) = self.lib() else {
            return;
        };
        let msg = CString::new(message.replace('\0', "\\0")).unwrap_or_default();
        let interp = self.interp.borrow();
        // SAFETY: the lock is held inside every slot.
        unsafe {
            let exc = match interp.as_ref().and_then(|i| i.exceptions.get(&kind)) {
                Some(e) => e.as_ptr(),
                None => *b.statics.runtime_error,
            };
            (b.api.PyErr_SetString)(exc, msg.as_ptr());
        }
    }

    unsafe fn make_type(&self, b: &Arc<Bound>, class: ProxyClass) -> Result<PyRef, ForeignError> {
        let caps = class.caps();
        let mut slots = vec![
            slot(PY_TP_DEALLOC, tp_dealloc as unsafe extern "C" fn(Obj) as *mut c_void),
            slot(PY_TP_GETATTRO, tp_getattro as unsafe extern "C" fn(Obj, Obj) -> Obj as *mut c_void),
            slot(PY_TP_SETATTRO, tp_setattro as unsafe extern "C" fn(Obj, Obj, Obj) -> c_int as *mut c_void),
            slot(PY_TP_REPR, tp_repr as unsafe extern "C" fn(Obj) -> Obj as *mut c_void),
        ];
        if caps.sequence || caps.mapping {
            slots.push(slot(PY_MP_LENGTH, length as unsafe extern "C" fn(Obj) -> isize as *mut c_void));
            slots.push(slot(PY_MP_SUBSCRIPT, mp_subscript as unsafe extern "C" fn(Obj, Obj) -> Obj as *mut c_void));
            slots.push(slot(
                PY_MP_ASS_SUBSCRIPT,
                mp_ass_subscript as unsafe extern "C" fn(Obj, Obj, Obj) -> c_int as *mut c_void,
            ));
        }
        if caps.sequence {
            slots.push(slot(PY_SQ_LENGTH, length as unsafe extern "C" fn(Obj) -> isize as *mut c_void));
            slots.push(slot(PY_SQ_ITEM, sq_item as unsafe extern "C" fn(Obj, isize) -> Obj as *mut c_void));
            slots.push(slot(
                PY_SQ_ASS_ITEM,
                sq_ass_item as unsafe extern "C" fn(Obj, isize, Obj) -> c_int as *mut c_void,
            ));
        }
        if caps.iterable {
            slots.push(slot(PY_TP_ITER, tp_iter as unsafe extern "C" fn(Obj) -> Obj as *mut c_void));
        }
        if caps.callable {
            slots.push(slot(PY_TP_CALL, tp_call as unsafe extern "C" fn(Obj, Obj, Obj) -> Obj as *mut c_void));
        }
        slots.push(slot(0, ptr::null_mut()));
        let mut spec = PyTypeSpec {
            name: type_cname(class).as_ptr(),
            basicsize: mem::size_of::<ProxyObject>() as c_int,
            itemsize: 0,
            flags: PY_TPFLAGS_DEFAULT,
            slots: slots.as_mut_ptr(),
        };
        PyRef::owned(b, (b.api.PyType_FromSpec)(&mut spec))
    }

    unsafe fn build_interp(&self, b: &Arc<Bound>) -> Result<Interp, ForeignError> {
        let main = (b.api.PyImport_AddModule)(c"__main__".as_ptr());
        if main.is_null() {
            return Err(ForeignError::Pending);
        }
        let globals = PyRef::borrowed(b, (b.api.PyModule_GetDict)(main))?;
        let classes = ProxyClass::ALL
            .iter()
            .map(|&c| self.make_type(b, c))
            .collect::<Result<Vec<_>, _>>()?;
        let builtins = PyRef::owned(b, (b.api.PyImport_ImportModule)(c"builtins".as_ptr()))?;
        let mut exceptions = HashMap::new();
        for (kind, name) in BUILTIN_EXCEPTIONS {
            let exc = PyRef::owned(b, (b.api.PyObject_GetAttrString)(builtins.as_ptr(), name.as_ptr()))?;
            exceptions.insert(kind, exc);
        }
        Ok(Interp { globals, classes, exceptions })
    }

    /// Scripts expect `sys.argv` to exist; give it one empty entry.
    unsafe fn set_argv(&self, b: &Arc<Bound>) -> Result<(), ForeignError> {
        let empty = PyRef::owned(b, (b.api.PyUnicode_FromStringAndSize)(c"".as_ptr(), 0))?;
        let argv = PyRef::owned(b, (b.api.PyList_New)(1))?;
        if (b.api.PyList_SetItem)(argv.as_ptr(), 0, empty.into_raw()) < 0
            || (b.api.PySys_SetObject)(c"argv".as_ptr(), argv.as_ptr()) < 0
        {
            return Err(ForeignError::Pending);
        }
        Ok(())
    }

    unsafe fn set_attr(&self, obj: &PyRef, name: &str, value: &PyRef) -> Result<(), ForeignError> {
        let cname = cstring(name)?;
        if (obj.bound.api.PyObject_SetAttrString)(obj.as_ptr(), cname.as_ptr(), value.as_ptr()) < 0 {
            return Err(ForeignError::Pending);
        }
        Ok(())
    }
}

fn slot(id: c_int, pfunc: *mut c_void) -> PyTypeSlot {
    PyTypeSlot { slot: id, pfunc }
}

impl Runtime for CPython {
    type Obj = PyRef;
    type Weak = PyWeak;

    fn name(&self) -> String {
        format!("CPython ({})", self.library)
    }

    fn probe(&self) -> Result<(), LinkError> {
        if self.bound.get().is_some() {
            return Ok(());
        }
        let bound = linker::load(&self.library, &self.siblings)?;
        let _ = self.bound.set(bound);
        Ok(())
    }

    fn initialize(&self, home: Option<&Path>) -> Result<(), BridgeError> {
        self.probe()?;
        let b = Arc::clone(self.lib().map_err(|e| BridgeError::Init(e.to_string()))?);
        // SAFETY: single-threaded start-up; on success this thread holds
        // the interpreter lock.
        unsafe {
            if (b.api.Py_IsInitialized)() == 0 {
                if let Some(home) = home {
                    debug!(home = %home.display(), "setting PYTHONHOME");
                    std::env::set_var("PYTHONHOME", home);
                }
                (b.api.Py_InitializeEx)(0);
            }
            if (b.api.Py_IsInitialized)() == 0 {
                return Err(BridgeError::Init(format!("{} did not start", self.library)));
            }
            if let Some(init_threads) = b.init_threads {
                init_threads();
            }
            match self.build_interp(&b).and_then(|interp| self.set_argv(&b).map(|()| interp)) {
                Ok(interp) => *self.interp.borrow_mut() = Some(interp),
                Err(e) => {
                    self.print_pending();
                    error!(error = %e, "interpreter set-up failed");
                    return Err(BridgeError::Init(e.to_string()));
                }
            }
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.interp.borrow().is_some()
    }

    fn release_initial(&self) {
        let Ok(b) = self.lib() else {
            return;
        };
        // SAFETY: called once, by the thread that initialised.
        let ts = unsafe { (b.api.PyEval_SaveThread)() };
        self.saved.set(ts);
    }

    fn finalize(&self) {
        let interp = self.interp.borrow_mut().take();
        drop(interp);
        SESSION.with(|s| s.borrow_mut().take());
        if let Some(b) = self.bound.get() {
            // SAFETY: the lock is held and no PyRef owned by us survives.
            let rc = unsafe { (b.api.Py_FinalizeEx)() };
            if rc != 0 {
                error!(rc, "Py_FinalizeEx reported an error");
            }
            linker::unload();
        }
    }

    fn bind_session(&self, session: Weak<Session<Self>>) {
        SESSION.with(|s| *s.borrow_mut() = Some(session));
    }

    fn acquire(&self, mode: HandoffMode) -> LockToken {
        let Ok(b) = self.lib() else {
            debug!("lock requested before the library was bound");
            return LockToken(0);
        };
        // SAFETY: the interpreter is initialised and the lock released.
        unsafe {
            match mode {
                HandoffMode::Reentrant => LockToken((b.api.PyGILState_Ensure)() as isize),
                HandoffMode::SingleCall => {
                    let ts = self.saved.replace(ptr::null_mut());
                    if !ts.is_null() {
                        (b.api.PyEval_RestoreThread)(ts);
                    }
                    LockToken(0)
                }
            }
        }
    }

    fn release(&self, mode: HandoffMode, token: LockToken) {
        let Ok(b) = self.lib() else {
            return;
        };
        // SAFETY: pairs with `acquire` on this thread.
        unsafe {
            match mode {
                HandoffMode::Reentrant => (b.api.PyGILState_Release)(token.0 as c_int),
                HandoffMode::SingleCall => self.saved.set((b.api.PyEval_SaveThread)()),
            }
        }
    }

    fn run(&self, code: &str) -> Result<(), ForeignError> {
        let src = cstring(code)?;
        let globals = self.globals()?;
        let b = self.lib()?;
        // SAFETY: lock held by the handoff guard.
        unsafe {
            let g = globals.as_ptr();
            let result = (b.api.PyRun_String)(src.as_ptr(), PY_FILE_INPUT, g, g);
            if result.is_null() {
                (b.api.PyErr_PrintEx)(0);
                return Err(ForeignError::Reported);
            }
            (b.api.Py_DecRef)(result);
        }
        Ok(())
    }

    fn eval(&self, expr: &str) -> Result<PyRef, ForeignError> {
        let src = cstring(expr)?;
        let globals = self.globals()?;
        let b = self.lib()?;
        // SAFETY: lock held by the handoff guard.
        unsafe {
            let g = globals.as_ptr();
            let result = (b.api.PyRun_String)(src.as_ptr(), PY_EVAL_INPUT, g, g);
            if result.is_null() {
                (b.api.PyErr_PrintEx)(0);
                return Err(ForeignError::Reported);
            }
            PyRef::owned(b, result)
        }
    }

    fn none(&self) -> Result<PyRef, ForeignError> {
        let b = self.lib()?;
        // SAFETY: None is a static that lives as long as the library; the
        // lock is held.
        unsafe { PyRef::borrowed(b, b.statics.none) }
    }

    fn bool(&self, v: bool) -> Result<PyRef, ForeignError> {
        let b = self.lib()?;
        // SAFETY: PyBool_FromLong returns a new reference to a static.
        unsafe { PyRef::owned(b, (b.api.PyBool_FromLong)(v as _)) }
    }

    fn int(&self, n: i64) -> Result<PyRef, ForeignError> {
        let b = self.lib()?;
        unsafe { PyRef::owned(b, (b.api.PyLong_FromLongLong)(n)) }
    }

    fn float(&self, x: f64) -> Result<PyRef, ForeignError> {
        let b = self.lib()?;
        unsafe { PyRef::owned(b, (b.api.PyFloat_FromDouble)(x)) }
    }

    fn str(&self, s: &str) -> Result<PyRef, ForeignError> {
        let b = self.lib()?;
        unsafe { PyRef::owned(b, (b.api.PyUnicode_FromStringAndSize)(s.as_ptr() as *const c_char, s.len() as isize)) }
    }

    fn list(&self, items: Vec<PyRef>) -> Result<PyRef, ForeignError> {
        let b = self.lib()?;
        unsafe {
            let list = PyRef::owned(b, (b.api.PyList_New)(items.len() as isize))?;
            for (i, item) in items.into_iter().enumerate() {
                // Steals the item reference.
                if (b.api.PyList_SetItem)(list.as_ptr(), i as isize, item.into_raw()) < 0 {
                    return Err(ForeignError::Pending);
                }
            }
            Ok(list)
        }
    }

    fn tuple(&self, items: Vec<PyRef>) -> Result<PyRef, ForeignError> {
        let b = self.lib()?;
        unsafe {
            let tuple = PyRef::owned(b, (b.api.PyTuple_New)(items.len() as isize))?;
            for (i, item) in items.into_iter().enumerate() {
                if (b.api.PyTuple_SetItem)(tuple.as_ptr(), i as isize, item.into_raw()) < 0 {
                    return Err(ForeignError::Pending);
                }
            }
            Ok(tuple)
        }
    }

    fn dict(&self, entries: Vec<(String, PyRef)>) -> Result<PyRef, ForeignError> {
        let b = self.lib()?;
        unsafe {
            let dict = PyRef::owned(b, (b.api.PyDict_New)())?;
            for (k, v) in entries {
                let key = cstring(&k)?;
                if (b.api.PyDict_SetItemString)(dict.as_ptr(), key.as_ptr(), v.as_ptr()) < 0 {
                    return Err(ForeignError::Pending);
                }
            }
            Ok(dict)
        }
    }

    fn proxy(&self, proxy: Proxy) -> Result<PyRef, ForeignError> {
        let ty = self.class_type(proxy.class())?;
        let b = self.lib()?;
        unsafe {
            let obj = PyRef::owned(b, (b.api.PyType_GenericAlloc)(ty as *mut PyTypeObject, 0))?;
            (*(obj.as_ptr() as *mut ProxyObject)).proxy = Box::into_raw(Box::new(proxy));
            Ok(obj)
        }
    }

    fn inspect<'a>(&self, obj: &'a PyRef) -> Result<Inspect<'a>, ForeignError> {
        let b = self.lib()?;
        let s = &b.statics;
        let o = obj.as_ptr();
        // SAFETY: `obj` is live for 'a; lock held.
        unsafe {
            let ty = (*o).ob_type;
            if o == s.none {
                return Ok(Inspect::None);
            }
            if ty as Obj == s.bool_type {
                return Ok(Inspect::Bool((b.api.PyObject_IsTrue)(o) == 1));
            }
            if Self::is_instance(b, o, s.long_type) {
                let n = (b.api.PyLong_AsLongLong)(o);
                if n == -1 && !(b.api.PyErr_Occurred)().is_null() {
                    (b.api.PyErr_Clear)();
                    return Err(ForeignError::exception(ExcKind::Overflow, "int too large to convert"));
                }
                return Ok(Inspect::Int(n));
            }
            if Self::is_instance(b, o, s.float_type) {
                return Ok(Inspect::Float((b.api.PyFloat_AsDouble)(o)));
            }
            if Self::is_instance(b, o, s.bytes_type) {
                let mut data: *mut c_char = ptr::null_mut();
                let mut len: isize = 0;
                if (b.api.PyBytes_AsStringAndSize)(o, &mut data, &mut len) < 0 {
                    return Err(ForeignError::Pending);
                }
                return Ok(Inspect::Bytes(std::slice::from_raw_parts(data as *const u8, len as usize).to_vec()));
            }
            if Self::is_instance(b, o, s.unicode_type) {
                return Ok(Inspect::Str(self.decode(o)?));
            }
            if Self::is_instance(b, o, s.dict_type) {
                return Ok(Inspect::Dict);
            }
            if Self::is_instance(b, o, s.list_type) {
                return Ok(Inspect::List);
            }
            if Self::is_instance(b, o, s.tuple_type) {
                return Ok(Inspect::Tuple);
            }
            if ty as Obj == s.slice_type {
                let (mut start, mut stop, mut step) = (0isize, 0isize, 0isize);
                if (b.api.PySlice_Unpack)(o, &mut start, &mut stop, &mut step) < 0 {
                    return Err(ForeignError::Pending);
                }
                return Ok(Inspect::Slice(SliceSpec { start, stop, step }));
            }
            if self.is_proxy_type(ty) {
                if let Some(p) = (*(o as *mut ProxyObject)).proxy.as_ref() {
                    return Ok(Inspect::Proxy(p));
                }
            }
            Ok(Inspect::Other {
                mapping_like: (b.api.PyObject_HasAttrString)(o, c"keys".as_ptr()) == 1,
                sequence_like: (b.api.PySequence_Check)(o) == 1,
            })
        }
    }

    fn identity(&self, obj: &PyRef) -> usize {
        obj.as_ptr() as usize
    }

    fn items(&self, obj: &PyRef) -> Result<Vec<PyRef>, ForeignError> {
        let b = self.lib()?;
        unsafe {
            let n = (b.api.PySequence_Size)(obj.as_ptr());
            if n < 0 {
                return Err(ForeignError::Pending);
            }
            (0..n).map(|i| PyRef::owned(b, (b.api.PySequence_GetItem)(obj.as_ptr(), i))).collect()
        }
    }

    fn mapping_items(&self, obj: &PyRef) -> Result<Vec<(PyRef, PyRef)>, ForeignError> {
        let b = self.lib()?;
        let pairs = unsafe {
            match b.mapping_items {
                Some(items) => PyRef::owned(b, items(obj.as_ptr()))?,
                None => {
                    let method = PyRef::owned(b, (b.api.PyObject_GetAttrString)(obj.as_ptr(), c"items".as_ptr()))?;
                    PyRef::owned(b, (b.api.PyObject_CallObject)(method.as_ptr(), ptr::null_mut()))?
                }
            }
        };
        self.items(&pairs)?
            .into_iter()
            .map(|pair| match self.items(&pair)?.as_slice() {
                [k, v] => Ok((k.clone(), v.clone())),
                _ => Err(ForeignError::exception(ExcKind::Value, "mapping items must be pairs")),
            })
            .collect()
    }

    fn str_form(&self, obj: &PyRef) -> Result<String, ForeignError> {
        let b = self.lib()?;
        unsafe {
            let s = PyRef::owned(b, (b.api.PyObject_Str)(obj.as_ptr()))?;
            self.decode(s.as_ptr())
        }
    }

    fn type_name(&self, obj: &PyRef) -> String {
        let Ok(b) = self.lib() else {
            return "object".to_owned();
        };
        let name = unsafe {
            PyRef::owned(b, (b.api.PyObject_Type)(obj.as_ptr()))
                .and_then(|ty| PyRef::owned(b, (b.api.PyObject_GetAttrString)(ty.as_ptr(), c"__name__".as_ptr())))
                .and_then(|n| self.decode(n.as_ptr()))
        };
        name.unwrap_or_else(|_| {
            // SAFETY: lock held; discard the lookup failure.
            unsafe { (b.api.PyErr_Clear)() };
            "object".to_owned()
        })
    }

    fn downgrade(&self, obj: &PyRef) -> PyWeak {
        PyWeak(obj.as_ptr() as usize)
    }

    fn upgrade(&self, weak: &PyWeak) -> Option<PyRef> {
        // SAFETY: only called while the proxy inside the object is alive,
        // which means the object is.
        unsafe { PyRef::borrowed(self.lib().ok()?, weak.0 as Obj).ok() }
    }

    fn install_module(&self, name: &str, members: Vec<(&'static str, PyRef)>) -> Result<(), ForeignError> {
        let b = self.lib()?;
        let cname = cstring(name)?;
        let err_name = cstring(&format!("{name}.error"))?;
        unsafe {
            let module = PyRef::borrowed(b, (b.api.PyImport_AddModule)(cname.as_ptr()))?;
            let error = PyRef::owned(b, (b.api.PyErr_NewException)(err_name.as_ptr(), ptr::null_mut(), ptr::null_mut()))?;
            self.set_attr(&module, "error", &error)?;
            for (member, value) in &members {
                self.set_attr(&module, member, value)?;
            }
            let globals = self.globals()?;
            if (b.api.PyDict_SetItemString)(globals.as_ptr(), cname.as_ptr(), module.as_ptr()) < 0 {
                return Err(ForeignError::Pending);
            }
            if let Some(interp) = self.interp.borrow_mut().as_mut() {
                interp.exceptions.insert(ExcKind::Vim, error);
            }
        }
        Ok(())
    }

    fn set_sys_stream(&self, name: &str, stream: PyRef) -> Result<(), ForeignError> {
        let b = self.lib()?;
        let cname = cstring(name)?;
        unsafe {
            if (b.api.PySys_SetObject)(cname.as_ptr(), stream.as_ptr()) < 0 {
                return Err(ForeignError::Pending);
            }
        }
        Ok(())
    }
}

// ── Slots ─────────────────────────────────────────────────────────────────────

fn current_session() -> Option<Rc<Session<CPython>>> {
    SESSION.with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
}

unsafe fn raise_runtime_error(message: &CStr) {
    if let Some(b) = linker::loaded() {
        (b.api.PyErr_SetString)(*b.statics.runtime_error, message.as_ptr());
    }
}

/// Run a slot body with the session, mapping errors to exceptions and
/// returning `fail` after raising.
unsafe fn trampoline<T>(fail: T, body: impl FnOnce(&Session<CPython>) -> Result<T, ProxyError>) -> T {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match current_session() {
        Some(session) => body(&session).map_err(|e| session.runtime().raise(e)),
        None => Err(raise_runtime_error(c"vim: no editor session")),
    }));
    match outcome {
        Ok(Ok(v)) => v,
        Ok(Err(())) => fail,
        Err(_) => {
            raise_runtime_error(c"vim: internal error");
            fail
        }
    }
}

unsafe fn proxy_of<'a>(obj: Obj) -> Result<&'a Proxy, ProxyError> {
    (*(obj as *mut ProxyObject))
        .proxy
        .as_ref()
        .ok_or_else(|| ProxyError::Host("proxy object without state".into()))
}

unsafe fn arg(rt: &CPython, obj: Obj) -> Result<Option<PyRef>, ProxyError> {
    if obj.is_null() {
        return Ok(None);
    }
    Ok(Some(PyRef::borrowed(rt.lib()?, obj)?))
}

unsafe extern "C" fn tp_dealloc(obj: Obj) {
    let po = obj as *mut ProxyObject;
    let proxy = mem::replace(&mut (*po).proxy, ptr::null_mut());
    if !proxy.is_null() {
        drop(Box::from_raw(proxy));
    }
    let ty = (*obj).ob_type as Obj;
    if let Some(b) = linker::loaded() {
        (b.api.PyObject_Free)(obj as *mut c_void);
        (b.api.Py_DecRef)(ty);
    }
}

unsafe extern "C" fn tp_getattro(obj: Obj, name: Obj) -> Obj {
    trampoline(ptr::null_mut(), |s| {
        let rt = s.runtime();
        let proxy = proxy_of(obj)?;
        let attr = rt.decode(name)?;
        match s.proxy_getattr(proxy, &attr)? {
            Attr::Found(v) => Ok(v.into_raw()),
            Attr::Missing => Ok((rt.lib()?.api.PyObject_GenericGetAttr)(obj, name)),
        }
    })
}

unsafe extern "C" fn tp_setattro(obj: Obj, name: Obj, value: Obj) -> c_int {
    trampoline(-1, |s| {
        let rt = s.runtime();
        let proxy = proxy_of(obj)?;
        let attr = rt.decode(name)?;
        let value = arg(rt, value)?;
        s.proxy_setattr(proxy, &attr, value.as_ref())?;
        Ok(0)
    })
}

unsafe extern "C" fn tp_repr(obj: Obj) -> Obj {
    trampoline(ptr::null_mut(), |s| {
        let repr = s.proxy_repr(proxy_of(obj)?);
        Ok(s.runtime().str(&repr)?.into_raw())
    })
}

unsafe extern "C" fn length(obj: Obj) -> isize {
    trampoline(-1, |s| Ok(s.proxy_len(proxy_of(obj)?)? as isize))
}

unsafe extern "C" fn sq_item(obj: Obj, index: isize) -> Obj {
    trampoline(ptr::null_mut(), |s| Ok(s.proxy_item(proxy_of(obj)?, index)?.into_raw()))
}

unsafe extern "C" fn sq_ass_item(obj: Obj, index: isize, value: Obj) -> c_int {
    trampoline(-1, |s| {
        let value = arg(s.runtime(), value)?;
        s.proxy_ass_item(proxy_of(obj)?, index, value.as_ref())?;
        Ok(0)
    })
}

unsafe extern "C" fn mp_subscript(obj: Obj, key: Obj) -> Obj {
    trampoline(ptr::null_mut(), |s| {
        let key = PyRef::borrowed(s.runtime().lib()?, key)?;
        Ok(s.proxy_subscript(proxy_of(obj)?, &key)?.into_raw())
    })
}

unsafe extern "C" fn mp_ass_subscript(obj: Obj, key: Obj, value: Obj) -> c_int {
    trampoline(-1, |s| {
        let rt = s.runtime();
        let key = PyRef::borrowed(rt.lib()?, key)?;
        let value = arg(rt, value)?;
        s.proxy_ass_subscript(proxy_of(obj)?, &key, value.as_ref())?;
        Ok(0)
    })
}

unsafe extern "C" fn tp_iter(obj: Obj) -> Obj {
    trampoline(ptr::null_mut(), |s| {
        let rt = s.runtime();
        let list = s.proxy_iter(proxy_of(obj)?)?;
        let b = rt.lib()?;
        Ok(PyRef::owned(b, (b.api.PyObject_GetIter)(list.as_ptr()))?.into_raw())
    })
}

unsafe extern "C" fn tp_call(obj: Obj, args: Obj, kwargs: Obj) -> Obj {
    trampoline(ptr::null_mut(), |s| {
        let rt = s.runtime();
        if !kwargs.is_null() && (rt.lib()?.api.PyDict_Size)(kwargs) > 0 {
            return Err(ProxyError::Type("keyword arguments are not supported".into()));
        }
        let args = match arg(rt, args)? {
            Some(tuple) => rt.items(&tuple)?,
            None => Vec::new(),
        };
        Ok(s.proxy_call(proxy_of(obj)?, &args)?.into_raw())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_match_classes() {
        for class in ProxyClass::ALL {
            assert_eq!(type_cname(class).to_str().unwrap(), class.type_name());
        }
    }

    #[test]
    fn unbound_runtime_is_not_initialised() {
        let _slot = linker::test_slot();
        let rt = CPython::new("libvimpy-missing-python.so", Vec::new());
        assert!(!rt.is_initialized());
        assert!(rt.probe().is_err());
        assert!(matches!(rt.initialize(None), Err(BridgeError::Link(LinkError::LibraryNotFound { .. }))));
        assert!(matches!(rt.none(), Err(ForeignError::NotInitialized)));
        assert!(matches!(rt.bool(true), Err(ForeignError::NotInitialized)));
        assert!(matches!(rt.int(7), Err(ForeignError::NotInitialized)));
        assert!(matches!(rt.str("x"), Err(ForeignError::NotInitialized)));
    }

    #[test]
    fn proxy_object_layout() {
        assert_eq!(mem::size_of::<ProxyObject>(), 3 * mem::size_of::<usize>());
    }
}

/// Tests against a real interpreter, named by `VIMPY_TEST_PYTHONDLL`.
#[cfg(all(test, feature = "live-python"))]
mod live_tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::host::editor::Editor;
    use crate::host::services::BasicServices;
    use crate::session::SessionConfig;

    fn session() -> Option<Rc<Session<CPython>>> {
        let library = std::env::var("VIMPY_TEST_PYTHONDLL").ok()?;
        let editor = Rc::new(RefCell::new(Editor::new()));
        Some(Session::new(
            CPython::new(library, Vec::new()),
            editor,
            Box::new(BasicServices::new()),
            SessionConfig::default(),
        ))
    }

    #[test]
    fn round_trip_through_the_interpreter() {
        let _slot = linker::test_slot();
        let Some(s) = session() else { return };
        s.execute("import vim\nvim.current.buffer[:] = ['a', 'b']\nprint(len(vim.current.buffer))", None)
            .unwrap();
        let ed = s.editor();
        let ed = ed.borrow();
        assert_eq!(ed.buffer(ed.current_buffer()).unwrap().lines(), ["a", "b"]);
        assert!(ed.messages().iter().any(|m| m.text() == "2"));
        drop(ed);
        let same = s.evaluate("vim.current.buffer is vim.buffers[1]").unwrap();
        assert_eq!(same.as_number(), Some(1));
    }

    #[test]
    fn keyword_arguments_are_refused() {
        let _slot = linker::test_slot();
        let Some(s) = session() else { return };
        let code = "import vim\ntry:\n    vim.eval('1', x=2)\nexcept TypeError as e:\n    print(e)\nprint(vim.eval('1'))";
        s.execute(code, None).unwrap();
        let ed = s.editor();
        let ed = ed.borrow();
        let texts: Vec<&str> = ed.messages().iter().map(|m| m.text()).collect();
        assert_eq!(texts, ["keyword arguments are not supported", "1"]);
    }
}
