//! Runtime binding of the Python shared library.
//!
//! Nothing links against libpython at build time.  [`load`] opens the
//! library named in the configuration, resolves every entry point into a
//! [`PyApi`] table and keeps the result in a process-wide slot, so a
//! failed bind leaves the editor running with the feature disabled.
//!
//! Two interpreter libraries cannot share one process: their global
//! symbols collide.  Before binding, the sibling guard refuses to load if
//! a different interpreter library is already resident, either bound by
//! us or mapped by someone else (detected with `RTLD_NOLOAD`).

use std::ffi::{c_char, c_double, c_int, c_long, c_longlong, c_uint, c_void, CString};
use std::sync::{Arc, Mutex};

use libloading::Library;
use tracing::{debug, info, warn};

use crate::error::LinkError;

// ── C layout ──────────────────────────────────────────────────────────────────

#[repr(C)]
pub struct PyObject {
    pub ob_refcnt: isize,
    pub ob_type: *mut PyTypeObject,
}

#[repr(C)]
pub struct PyTypeObject {
    _opaque: [u8; 0],
}

#[repr(C)]
pub struct PyThreadState {
    _opaque: [u8; 0],
}

#[repr(C)]
pub struct PyTypeSlot {
    pub slot: c_int,
    pub pfunc: *mut c_void,
}

#[repr(C)]
pub struct PyTypeSpec {
    pub name: *const c_char,
    pub basicsize: c_int,
    pub itemsize: c_int,
    pub flags: c_uint,
    pub slots: *mut PyTypeSlot,
}

pub type Obj = *mut PyObject;

pub const PY_FILE_INPUT: c_int = 257;
pub const PY_EVAL_INPUT: c_int = 258;
pub const PY_TPFLAGS_DEFAULT: c_uint = 1 << 18;

// Slot ids from typeslots.h.
pub const PY_MP_ASS_SUBSCRIPT: c_int = 3;
pub const PY_MP_LENGTH: c_int = 4;
pub const PY_MP_SUBSCRIPT: c_int = 5;
pub const PY_SQ_ASS_ITEM: c_int = 39;
pub const PY_SQ_ITEM: c_int = 44;
pub const PY_SQ_LENGTH: c_int = 45;
pub const PY_TP_CALL: c_int = 50;
pub const PY_TP_DEALLOC: c_int = 52;
pub const PY_TP_GETATTRO: c_int = 58;
pub const PY_TP_ITER: c_int = 62;
pub const PY_TP_REPR: c_int = 66;
pub const PY_TP_SETATTRO: c_int = 69;

// ── Entry-point table ─────────────────────────────────────────────────────────

/// Resolve one symbol, copying the value out of the library handle.
///
/// # Safety
/// `T` must match the symbol's real type.
unsafe fn symbol<T: Copy>(lib: &Library, library: &str, name: &str) -> Result<T, LinkError> {
    let cname = format!("{name}\0");
    lib.get::<T>(cname.as_bytes()).map(|s| *s).map_err(|_| LinkError::MissingSymbol {
        library: library.to_owned(),
        symbol: name.to_owned(),
    })
}

macro_rules! python_api {
    ($($name:ident: fn($($arg:ty),*) $(-> $ret:ty)?;)*) => {
        /// Required interpreter entry points.
        #[allow(non_snake_case)]
        pub struct PyApi {
            $(pub $name: unsafe extern "C" fn($($arg),*) $(-> $ret)?,)*
        }

        impl PyApi {
            /// Symbol names in binding order.
            pub const NAMES: &'static [&'static str] = &[$(stringify!($name)),*];

            unsafe fn bind(lib: &Library, library: &str) -> Result<Self, LinkError> {
                Ok(PyApi {
                    $($name: symbol(lib, library, stringify!($name))?,)*
                })
            }
        }
    };
}

python_api! {
    Py_InitializeEx: fn(c_int);
    Py_IsInitialized: fn() -> c_int;
    Py_FinalizeEx: fn() -> c_int;
    PyGILState_Ensure: fn() -> c_int;
    PyGILState_Release: fn(c_int);
    PyEval_SaveThread: fn() -> *mut PyThreadState;
    PyEval_RestoreThread: fn(*mut PyThreadState);
    PyRun_String: fn(*const c_char, c_int, Obj, Obj) -> Obj;
    PyImport_AddModule: fn(*const c_char) -> Obj;
    PyImport_ImportModule: fn(*const c_char) -> Obj;
    PyModule_GetDict: fn(Obj) -> Obj;
    PyErr_Occurred: fn() -> Obj;
    PyErr_PrintEx: fn(c_int);
    PyErr_Clear: fn();
    PyErr_SetString: fn(Obj, *const c_char);
    PyErr_NewException: fn(*const c_char, Obj, Obj) -> Obj;
    Py_IncRef: fn(Obj);
    Py_DecRef: fn(Obj);
    PyObject_IsTrue: fn(Obj) -> c_int;
    PyObject_IsInstance: fn(Obj, Obj) -> c_int;
    PyObject_Str: fn(Obj) -> Obj;
    PyObject_Type: fn(Obj) -> Obj;
    PyObject_GetAttrString: fn(Obj, *const c_char) -> Obj;
    PyObject_SetAttrString: fn(Obj, *const c_char, Obj) -> c_int;
    PyObject_HasAttrString: fn(Obj, *const c_char) -> c_int;
    PyObject_GenericGetAttr: fn(Obj, Obj) -> Obj;
    PyObject_CallObject: fn(Obj, Obj) -> Obj;
    PyObject_GetIter: fn(Obj) -> Obj;
    PyObject_Free: fn(*mut c_void);
    PyType_FromSpec: fn(*mut PyTypeSpec) -> Obj;
    PyType_GenericAlloc: fn(*mut PyTypeObject, isize) -> Obj;
    PyLong_FromLongLong: fn(c_longlong) -> Obj;
    PyLong_AsLongLong: fn(Obj) -> c_longlong;
    PyBool_FromLong: fn(c_long) -> Obj;
    PyFloat_FromDouble: fn(c_double) -> Obj;
    PyFloat_AsDouble: fn(Obj) -> c_double;
    PyUnicode_FromStringAndSize: fn(*const c_char, isize) -> Obj;
    PyBytes_AsStringAndSize: fn(Obj, *mut *mut c_char, *mut isize) -> c_int;
    PyList_New: fn(isize) -> Obj;
    PyList_SetItem: fn(Obj, isize, Obj) -> c_int;
    PyTuple_New: fn(isize) -> Obj;
    PyTuple_SetItem: fn(Obj, isize, Obj) -> c_int;
    PyDict_New: fn() -> Obj;
    PyDict_SetItemString: fn(Obj, *const c_char, Obj) -> c_int;
    PyDict_Size: fn(Obj) -> isize;
    PySequence_Check: fn(Obj) -> c_int;
    PySequence_Size: fn(Obj) -> isize;
    PySequence_GetItem: fn(Obj, isize) -> Obj;
    PySlice_Unpack: fn(Obj, *mut isize, *mut isize, *mut isize) -> c_int;
    PySys_SetObject: fn(*const c_char, Obj) -> c_int;
}

pub type MappingItemsFn = unsafe extern "C" fn(Obj) -> Obj;
pub type EncodeFn = unsafe extern "C" fn(Obj, *const c_char, *const c_char) -> Obj;
pub type InitThreadsFn = unsafe extern "C" fn();

/// Unicode encoder names, tried in order.
pub const UNICODE_ENCODERS: [&str; 3] =
    ["PyUnicodeUCS2_AsEncodedString", "PyUnicodeUCS4_AsEncodedString", "PyUnicode_AsEncodedString"];

/// Addresses of the interpreter's static type and singleton objects.
pub struct PyStatics {
    pub none: Obj,
    pub bool_type: Obj,
    pub long_type: Obj,
    pub float_type: Obj,
    pub unicode_type: Obj,
    pub bytes_type: Obj,
    pub list_type: Obj,
    pub tuple_type: Obj,
    pub dict_type: Obj,
    pub slice_type: Obj,
    /// `PyExc_RuntimeError` holds a pointer to the class.
    pub runtime_error: *mut Obj,
}

impl PyStatics {
    unsafe fn bind(lib: &Library, library: &str) -> Result<Self, LinkError> {
        let data = |name: &str| -> Result<Obj, LinkError> {
            let cname = format!("{name}\0");
            lib.get::<*mut PyObject>(cname.as_bytes())
                .map(|s| *s)
                .map_err(|_| LinkError::MissingSymbol { library: library.to_owned(), symbol: name.to_owned() })
        };
        Ok(PyStatics {
            none: data("_Py_NoneStruct")?,
            bool_type: data("PyBool_Type")?,
            long_type: data("PyLong_Type")?,
            float_type: data("PyFloat_Type")?,
            unicode_type: data("PyUnicode_Type")?,
            bytes_type: data("PyBytes_Type")?,
            list_type: data("PyList_Type")?,
            tuple_type: data("PyTuple_Type")?,
            dict_type: data("PyDict_Type")?,
            slice_type: data("PySlice_Type")?,
            runtime_error: data("PyExc_RuntimeError")? as *mut Obj,
        })
    }
}

/// A bound interpreter library.
pub struct Bound {
    pub name: String,
    pub api: PyApi,
    pub statics: PyStatics,
    pub encode: EncodeFn,
    pub unicode_symbol: &'static str,
    pub mapping_items: Option<MappingItemsFn>,
    pub init_threads: Option<InitThreadsFn>,
    // Last: the table above points into this library.
    _library: Library,
}

// SAFETY: the table holds code and static-data addresses inside `_library`,
// which lives exactly as long as the table.  Calling into the interpreter
// is serialised by its own lock.
unsafe impl Send for Bound {}
unsafe impl Sync for Bound {}

static BOUND: Mutex<Option<Arc<Bound>>> = Mutex::new(None);

fn slot() -> std::sync::MutexGuard<'static, Option<Arc<Bound>>> {
    BOUND.lock().unwrap_or_else(|p| p.into_inner())
}

/// Serialises tests that bind or inspect the process-wide table.
#[cfg(test)]
pub(crate) static TEST_SLOT: Mutex<()> = Mutex::new(());

#[cfg(test)]
pub(crate) fn test_slot() -> std::sync::MutexGuard<'static, ()> {
    TEST_SLOT.lock().unwrap_or_else(|p| p.into_inner())
}

/// The currently bound library, if any.
pub fn loaded() -> Option<Arc<Bound>> {
    slot().clone()
}

pub fn is_loaded() -> bool {
    slot().is_some()
}

/// Forget the bound library.  Outstanding [`Arc`]s keep it mapped.
pub fn unload() {
    if let Some(b) = slot().take() {
        debug!(library = %b.name, "library released");
    }
}

#[cfg(unix)]
fn resident(name: &str) -> bool {
    let Ok(cname) = CString::new(name) else {
        return false;
    };
    // SAFETY: RTLD_NOLOAD never maps anything; the handle only bumps the
    // reference count of an already loaded object and is closed at once.
    unsafe {
        let handle = libc::dlopen(cname.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD);
        if handle.is_null() {
            return false;
        }
        libc::dlclose(handle);
        true
    }
}

#[cfg(not(unix))]
fn resident(_name: &str) -> bool {
    false
}

fn open(name: &str) -> Result<Library, libloading::Error> {
    #[cfg(unix)]
    {
        use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_LAZY};
        // SAFETY: loading runs the library's initialisers; libpython's are
        // benign until Py_Initialize.
        unsafe { UnixLibrary::open(Some(name), RTLD_LAZY | RTLD_GLOBAL).map(Library::from) }
    }
    #[cfg(not(unix))]
    {
        // SAFETY: as above.
        unsafe { Library::new(name) }
    }
}

/// Bind `library`, refusing if one of `siblings` (or another interpreter
/// library bound earlier) is already resident.
pub fn load(library: &str, siblings: &[String]) -> Result<Arc<Bound>, LinkError> {
    let mut current = slot();
    if let Some(b) = current.as_ref() {
        if b.name == library {
            return Ok(Arc::clone(b));
        }
        return Err(LinkError::IncompatibleSibling { library: library.to_owned(), loaded: b.name.clone() });
    }
    if let Some(other) = siblings.iter().find(|s| s.as_str() != library && resident(s)) {
        warn!(library, sibling = %other, "incompatible interpreter already loaded");
        return Err(LinkError::IncompatibleSibling { library: library.to_owned(), loaded: other.clone() });
    }

    let lib = open(library).map_err(|e| LinkError::LibraryNotFound {
        library: library.to_owned(),
        reason: e.to_string(),
    })?;
    // SAFETY: each symbol is read with the type CPython declares for it.
    let bound = unsafe {
        let api = PyApi::bind(&lib, library)?;
        let statics = PyStatics::bind(&lib, library)?;
        let (encode, unicode_symbol) = UNICODE_ENCODERS
            .iter()
            .find_map(|name| symbol::<EncodeFn>(&lib, library, name).ok().map(|f| (f, *name)))
            .ok_or_else(|| LinkError::MissingSymbol {
                library: library.to_owned(),
                symbol: UNICODE_ENCODERS[2].to_owned(),
            })?;
        let mapping_items = symbol::<MappingItemsFn>(&lib, library, "PyMapping_Items").ok();
        let init_threads = symbol::<InitThreadsFn>(&lib, library, "PyEval_InitThreads").ok();
        Bound {
            name: library.to_owned(),
            api,
            statics,
            encode,
            unicode_symbol,
            mapping_items,
            init_threads,
            _library: lib,
        }
    };
    info!(library, encoder = bound.unicode_symbol, symbols = PyApi::NAMES.len(), "python library bound");
    let bound = Arc::new(bound);
    *current = Some(Arc::clone(&bound));
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_reported() {
        let _slot = test_slot();
        let err = load("libvimpy-does-not-exist.so.0", &[]).err();
        assert!(matches!(err, Some(LinkError::LibraryNotFound { .. })));
        assert!(!is_loaded());
        assert!(loaded().is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn library_without_api_fails_cleanly() {
        let _slot = test_slot();
        match load("libc.so.6", &[]) {
            Err(LinkError::MissingSymbol { library, symbol }) => {
                assert_eq!(library, "libc.so.6");
                assert_eq!(symbol, PyApi::NAMES[0]);
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("libc bound as python"),
        }
        assert!(loaded().is_none());
        // Nothing half-bound is left behind: the same failure repeats.
        assert!(matches!(load("libc.so.6", &[]), Err(LinkError::MissingSymbol { .. })));
        assert!(!is_loaded());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sibling_guard_refuses_resident_library() {
        let _slot = test_slot();
        let err = load("libpython3-vimpy-test.so", &["libc.so.6".to_string()]).err();
        assert!(matches!(err, Some(LinkError::IncompatibleSibling { ref loaded, .. }) if loaded == "libc.so.6"));
        assert!(loaded().is_none());
    }

    #[cfg(feature = "live-python")]
    #[test]
    fn failed_load_then_real_library_binds() {
        let Ok(library) = std::env::var("VIMPY_TEST_PYTHONDLL") else { return };
        let _slot = test_slot();
        assert!(load("libvimpy-does-not-exist.so.0", &[]).is_err());
        assert!(loaded().is_none());

        let first = load(&library, &[]).unwrap();
        assert!(is_loaded());
        let again = load(&library, &[]).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        unload();
        assert!(loaded().is_none());
    }

    #[test]
    fn api_table_names() {
        assert!(PyApi::NAMES.contains(&"PyRun_String"));
        assert!(PyApi::NAMES.contains(&"PyType_FromSpec"));
        assert_eq!(UNICODE_ENCODERS.last(), Some(&"PyUnicode_AsEncodedString"));
    }
}
