//! In-process stand-in for the interpreter.
//!
//! Objects form a small reference-counted graph shaped like the real
//! interpreter's (ints, strings, lists, dicts, tuples, slices, opaque
//! objects and proxies).  "Scripts" are Rust closures registered per source
//! string with [`StubRuntime::on_script`]; running or evaluating that exact
//! source invokes the closure with the owning session.  Unregistered
//! expressions that are plain literals (`42`, `1.5`, `'text'`, `None`,
//! `True`) evaluate to themselves.
//!
//! The attribute / item / call helpers ([`StubRuntime::getattr`] and
//! friends) route proxy operations through the same session dispatch the
//! CPython backend's slot functions use, so closures and tests exercise the
//! real proxy layer.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::rc::{Rc, Weak};

use tracing::debug;

use super::{ExcKind, Inspect, LockToken, Runtime, SliceSpec};
use crate::error::{BridgeError, ForeignError, LinkError};
use crate::handoff::HandoffMode;
use crate::proxy::{Attr, Proxy};
use crate::session::Session;

/// A stub object value.
pub enum StubValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    List(RefCell<Vec<StubObj>>),
    Tuple(Vec<StubObj>),
    Dict(RefCell<Vec<(StubObj, StubObj)>>),
    Slice(SliceSpec),
    Proxy(Proxy),
    /// User object exposing `keys()` / `items()`.
    Mapping(Vec<(StubObj, StubObj)>),
    /// User object supporting `len()` and indexing.
    Sequence(Vec<StubObj>),
    /// Anything else; `str_form` of `None` means `str()` raises.
    Opaque { type_name: String, str_form: Option<String> },
    Module { name: String, members: RefCell<Vec<(String, StubObj)>> },
}

/// Strong reference to a stub object.
#[derive(Clone)]
pub struct StubObj(Rc<StubValue>);

impl StubObj {
    pub fn new(value: StubValue) -> Self {
        StubObj(Rc::new(value))
    }

    pub fn none() -> Self {
        Self::new(StubValue::None)
    }

    pub fn int(n: i64) -> Self {
        Self::new(StubValue::Int(n))
    }

    pub fn float(x: f64) -> Self {
        Self::new(StubValue::Float(x))
    }

    pub fn str(s: &str) -> Self {
        Self::new(StubValue::Str(s.to_owned()))
    }

    pub fn bytes(b: &[u8]) -> Self {
        Self::new(StubValue::Bytes(b.to_vec()))
    }

    pub fn list(items: Vec<StubObj>) -> Self {
        Self::new(StubValue::List(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<StubObj>) -> Self {
        Self::new(StubValue::Tuple(items))
    }

    pub fn dict(entries: Vec<(StubObj, StubObj)>) -> Self {
        Self::new(StubValue::Dict(RefCell::new(entries)))
    }

    /// Dict with string keys.
    pub fn str_dict(entries: Vec<(&str, StubObj)>) -> Self {
        Self::dict(entries.into_iter().map(|(k, v)| (StubObj::str(k), v)).collect())
    }

    pub fn slice(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Result<Self, ForeignError> {
        Ok(Self::new(StubValue::Slice(SliceSpec::unpack(start, stop, step)?)))
    }

    pub fn opaque(type_name: &str, str_form: Option<&str>) -> Self {
        Self::new(StubValue::Opaque { type_name: type_name.to_owned(), str_form: str_form.map(str::to_owned) })
    }

    pub fn value(&self) -> &StubValue {
        &self.0
    }

    pub fn ptr_eq(&self, other: &StubObj) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self.0 {
            StubValue::Int(n) => Some(n),
            StubValue::Bool(b) => Some(b as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<String> {
        match &*self.0 {
            StubValue::Str(s) => Some(s.clone()),
            StubValue::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(*self.0, StubValue::None)
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        match &*self.0 {
            StubValue::Proxy(p) => Some(p),
            _ => None,
        }
    }

    /// Elements of a list or tuple.
    pub fn elements(&self) -> Option<Vec<StubObj>> {
        match &*self.0 {
            StubValue::List(items) => Some(items.borrow().clone()),
            StubValue::Tuple(items) | StubValue::Sequence(items) => Some(items.clone()),
            _ => None,
        }
    }

    fn key_eq(&self, other: &StubObj) -> bool {
        match (&*self.0, &*other.0) {
            (StubValue::Str(a), StubValue::Str(b)) => a == b,
            (StubValue::Bytes(a), StubValue::Bytes(b)) => a == b,
            (StubValue::Int(a), StubValue::Int(b)) => a == b,
            _ => self.ptr_eq(other),
        }
    }

    fn type_name(&self) -> String {
        match &*self.0 {
            StubValue::None => "NoneType".into(),
            StubValue::Bool(_) => "bool".into(),
            StubValue::Int(_) => "int".into(),
            StubValue::Float(_) => "float".into(),
            StubValue::Bytes(_) => "bytes".into(),
            StubValue::Str(_) => "str".into(),
            StubValue::List(_) => "list".into(),
            StubValue::Tuple(_) => "tuple".into(),
            StubValue::Dict(_) => "dict".into(),
            StubValue::Slice(_) => "slice".into(),
            StubValue::Proxy(p) => p.class().type_name().into(),
            StubValue::Mapping(_) => "mapping".into(),
            StubValue::Sequence(_) => "sequence".into(),
            StubValue::Opaque { type_name, .. } => type_name.clone(),
            StubValue::Module { .. } => "module".into(),
        }
    }
}

impl fmt::Debug for StubObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            StubValue::None => write!(f, "None"),
            StubValue::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            StubValue::Int(n) => write!(f, "{n}"),
            StubValue::Float(x) => write!(f, "{x:?}"),
            StubValue::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            StubValue::Str(s) => write!(f, "{s:?}"),
            StubValue::List(items) => match items.try_borrow() {
                Ok(items) => write!(f, "[{} items]", items.len()),
                Err(_) => write!(f, "[...]"),
            },
            StubValue::Tuple(items) => write!(f, "({} items)", items.len()),
            StubValue::Dict(items) => match items.try_borrow() {
                Ok(items) => write!(f, "{{{} items}}", items.len()),
                Err(_) => write!(f, "{{...}}"),
            },
            StubValue::Proxy(p) => write!(f, "{p:?}"),
            _ => write!(f, "<{} object>", self.type_name()),
        }
    }
}

/// A script body: receives the session and returns the expression value.
pub type Script = Rc<dyn Fn(&Rc<Session<StubRuntime>>) -> Result<StubObj, ForeignError>>;

/// Interpreter lock operations, in the order they happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Acquire(HandoffMode),
    Release(HandoffMode),
    InitialRelease,
}

/// The stub interpreter.
#[derive(Default)]
pub struct StubRuntime {
    initialized: Cell<bool>,
    fail_init: Cell<bool>,
    depth: Cell<isize>,
    session: RefCell<Option<Weak<Session<StubRuntime>>>>,
    scripts: RefCell<HashMap<String, Script>>,
    modules: RefCell<HashMap<String, StubObj>>,
    sys: RefCell<HashMap<String, StubObj>>,
    events: RefCell<Vec<LockEvent>>,
    history: RefCell<Vec<String>>,
}

impl StubRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make [`Runtime::initialize`] fail, as a missing library would.
    pub fn failing() -> Self {
        let rt = Self::default();
        rt.fail_init.set(true);
        rt
    }

    /// Register `script` as the behaviour of source text `code`.
    pub fn on_script<F>(&self, code: &str, script: F)
    where
        F: Fn(&Rc<Session<StubRuntime>>) -> Result<StubObj, ForeignError> + 'static,
    {
        self.scripts.borrow_mut().insert(code.to_owned(), Rc::new(script));
    }

    pub fn lock_events(&self) -> Vec<LockEvent> {
        self.events.borrow().clone()
    }

    /// Every source string run or evaluated so far.
    pub fn history(&self) -> Vec<String> {
        self.history.borrow().clone()
    }

    pub fn module(&self, name: &str) -> Option<StubObj> {
        self.modules.borrow().get(name).cloned()
    }

    /// Shorthand for `getattr(module(name), attr)`.
    pub fn module_attr(&self, name: &str, attr: &str) -> Result<StubObj, ForeignError> {
        let module = self
            .module(name)
            .ok_or_else(|| ForeignError::exception(ExcKind::Attribute, format!("no module named {name}")))?;
        self.getattr(&module, attr)
    }

    pub fn sys_stream(&self, name: &str) -> Option<StubObj> {
        self.sys.borrow().get(name).cloned()
    }

    /// `print(text)`: write to the installed `sys.stdout`.
    pub fn print(&self, text: &str) -> Result<(), ForeignError> {
        let out = self
            .sys_stream("stdout")
            .ok_or_else(|| ForeignError::exception(ExcKind::Attribute, "sys.stdout is not set"))?;
        let write = self.getattr(&out, "write")?;
        self.call(&write, &[StubObj::str(&format!("{text}\n"))])?;
        Ok(())
    }

    fn session(&self) -> Result<Rc<Session<StubRuntime>>, ForeignError> {
        self.session
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(ForeignError::NotInitialized)
    }

    fn run_script(&self, code: &str) -> Option<Result<StubObj, ForeignError>> {
        self.history.borrow_mut().push(code.to_owned());
        let script = self.scripts.borrow().get(code).cloned()?;
        Some(self.session().and_then(|s| script(&s)))
    }

    // ── Script-level operations ───────────────────────────────────────────────

    /// `getattr(obj, name)`.
    pub fn getattr(&self, obj: &StubObj, name: &str) -> Result<StubObj, ForeignError> {
        let missing =
            || ForeignError::exception(ExcKind::Attribute, format!("'{}' object has no attribute '{name}'", obj.type_name()));
        match obj.value() {
            StubValue::Proxy(p) => match self.session()?.proxy_getattr(p, name) {
                Ok(Attr::Found(v)) => Ok(v),
                Ok(Attr::Missing) => Err(missing()),
                Err(e) => Err(e.into_foreign()),
            },
            StubValue::Module { members, .. } => {
                members.borrow().iter().find(|(k, _)| k == name).map(|(_, v)| v.clone()).ok_or_else(missing)
            }
            _ => Err(missing()),
        }
    }

    /// `obj.name = value`, or `del obj.name` when `value` is `None`.
    pub fn setattr(&self, obj: &StubObj, name: &str, value: Option<&StubObj>) -> Result<(), ForeignError> {
        match obj.value() {
            StubValue::Proxy(p) => self.session()?.proxy_setattr(p, name, value).map_err(|e| e.into_foreign()),
            _ => Err(ForeignError::exception(
                ExcKind::Attribute,
                format!("'{}' object attribute '{name}' is read-only", obj.type_name()),
            )),
        }
    }

    /// `obj[key]`.
    pub fn getitem(&self, obj: &StubObj, key: &StubObj) -> Result<StubObj, ForeignError> {
        match obj.value() {
            StubValue::Proxy(p) => self.session()?.proxy_subscript(p, key).map_err(|e| e.into_foreign()),
            StubValue::List(_) | StubValue::Tuple(_) | StubValue::Sequence(_) => {
                let items = obj.elements().unwrap_or_default();
                let i = key
                    .as_int()
                    .ok_or_else(|| ForeignError::exception(ExcKind::Type, "indices must be integers"))?;
                let i = if i < 0 { i + items.len() as i64 } else { i };
                usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| ForeignError::exception(ExcKind::Index, "index out of range"))
            }
            StubValue::Dict(entries) => entries
                .borrow()
                .iter()
                .find(|(k, _)| k.key_eq(key))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| ForeignError::exception(ExcKind::Key, format!("{key:?}"))),
            _ => Err(ForeignError::exception(
                ExcKind::Type,
                format!("'{}' object is not subscriptable", obj.type_name()),
            )),
        }
    }

    /// `obj[key] = value`, or `del obj[key]` when `value` is `None`.
    pub fn setitem(&self, obj: &StubObj, key: &StubObj, value: Option<&StubObj>) -> Result<(), ForeignError> {
        match obj.value() {
            StubValue::Proxy(p) => {
                self.session()?.proxy_ass_subscript(p, key, value).map_err(|e| e.into_foreign())
            }
            StubValue::Dict(entries) => {
                let mut entries = entries.borrow_mut();
                entries.retain(|(k, _)| !k.key_eq(key));
                if let Some(v) = value {
                    entries.push((key.clone(), v.clone()));
                }
                Ok(())
            }
            StubValue::List(items) => {
                let mut items = items.borrow_mut();
                let i = key
                    .as_int()
                    .and_then(|i| usize::try_from(i).ok())
                    .filter(|&i| i < items.len())
                    .ok_or_else(|| ForeignError::exception(ExcKind::Index, "index out of range"))?;
                match value {
                    Some(v) => items[i] = v.clone(),
                    None => {
                        items.remove(i);
                    }
                }
                Ok(())
            }
            _ => Err(ForeignError::exception(
                ExcKind::Type,
                format!("'{}' object does not support item assignment", obj.type_name()),
            )),
        }
    }

    /// `len(obj)`.
    pub fn len(&self, obj: &StubObj) -> Result<usize, ForeignError> {
        match obj.value() {
            StubValue::Proxy(p) => self.session()?.proxy_len(p).map_err(|e| e.into_foreign()),
            StubValue::Str(s) => Ok(s.chars().count()),
            StubValue::Bytes(b) => Ok(b.len()),
            StubValue::Dict(d) => Ok(d.borrow().len()),
            StubValue::Mapping(m) => Ok(m.len()),
            _ => obj
                .elements()
                .map(|e| e.len())
                .ok_or_else(|| ForeignError::exception(ExcKind::Type, format!("object of type '{}' has no len()", obj.type_name()))),
        }
    }

    /// `obj(*args)`.
    pub fn call(&self, obj: &StubObj, args: &[StubObj]) -> Result<StubObj, ForeignError> {
        match obj.value() {
            StubValue::Proxy(p) => self.session()?.proxy_call(p, args).map_err(|e| e.into_foreign()),
            _ => Err(ForeignError::exception(
                ExcKind::Type,
                format!("'{}' object is not callable", obj.type_name()),
            )),
        }
    }

    /// `obj.name(*args)`.
    pub fn call_method(&self, obj: &StubObj, name: &str, args: &[StubObj]) -> Result<StubObj, ForeignError> {
        let method = self.getattr(obj, name)?;
        self.call(&method, args)
    }

    /// `list(obj)`: iterate a sequence or mapping.
    pub fn iter(&self, obj: &StubObj) -> Result<Vec<StubObj>, ForeignError> {
        match obj.value() {
            StubValue::Proxy(p) => {
                let session = self.session()?;
                let list = if p.class().caps().iterable {
                    session.proxy_iter(p).map_err(|e| e.into_foreign())?
                } else {
                    let len = session.proxy_len(p).map_err(|e| e.into_foreign())?;
                    let items = (0..len)
                        .map(|i| session.proxy_item(p, i as isize))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| e.into_foreign())?;
                    StubObj::list(items)
                };
                Ok(list.elements().unwrap_or_default())
            }
            StubValue::Dict(entries) => Ok(entries.borrow().iter().map(|(k, _)| k.clone()).collect()),
            _ => obj
                .elements()
                .ok_or_else(|| ForeignError::exception(ExcKind::Type, format!("'{}' object is not iterable", obj.type_name()))),
        }
    }

    /// `repr(obj)` for proxies, `str(obj)` otherwise.
    pub fn repr(&self, obj: &StubObj) -> Result<String, ForeignError> {
        self.str_form(obj)
    }
}

fn literal(code: &str) -> Option<StubObj> {
    let code = code.trim();
    match code {
        "None" => return Some(StubObj::none()),
        "True" => return Some(StubObj::new(StubValue::Bool(true))),
        "False" => return Some(StubObj::new(StubValue::Bool(false))),
        _ => {}
    }
    if let Ok(n) = code.parse::<i64>() {
        return Some(StubObj::int(n));
    }
    if let Ok(x) = code.parse::<f64>() {
        return Some(StubObj::float(x));
    }
    for q in ['\'', '"'] {
        if code.len() >= 2 && code.starts_with(q) && code.ends_with(q) {
            return Some(StubObj::str(&code[1..code.len() - 1]));
        }
    }
    None
}

impl Runtime for StubRuntime {
    type Obj = StubObj;
    type Weak = Weak<StubValue>;

    fn name(&self) -> String {
        "stub".into()
    }

    fn probe(&self) -> Result<(), LinkError> {
        if self.fail_init.get() {
            return Err(LinkError::LibraryNotFound { library: "stub".into(), reason: "disabled".into() });
        }
        Ok(())
    }

    fn initialize(&self, _home: Option<&Path>) -> Result<(), BridgeError> {
        self.probe()?;
        self.initialized.set(true);
        debug!("stub interpreter initialised");
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    fn release_initial(&self) {
        self.events.borrow_mut().push(LockEvent::InitialRelease);
    }

    fn finalize(&self) {
        self.initialized.set(false);
        self.modules.borrow_mut().clear();
        self.sys.borrow_mut().clear();
    }

    fn bind_session(&self, session: Weak<Session<Self>>) {
        *self.session.borrow_mut() = Some(session);
    }

    fn acquire(&self, mode: HandoffMode) -> LockToken {
        self.events.borrow_mut().push(LockEvent::Acquire(mode));
        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        LockToken(depth)
    }

    fn release(&self, mode: HandoffMode, token: LockToken) {
        self.events.borrow_mut().push(LockEvent::Release(mode));
        debug_assert_eq!(token.0, self.depth.get(), "lock released out of order");
        self.depth.set(self.depth.get() - 1);
    }

    fn run(&self, code: &str) -> Result<(), ForeignError> {
        match self.run_script(code) {
            Some(r) => r.map(|_| ()),
            None => Err(ForeignError::exception(ExcKind::Value, format!("no stub script for {code:?}"))),
        }
    }

    fn eval(&self, expr: &str) -> Result<StubObj, ForeignError> {
        match self.run_script(expr) {
            Some(r) => r,
            None => literal(expr)
                .ok_or_else(|| ForeignError::exception(ExcKind::Value, format!("no stub script for {expr:?}"))),
        }
    }

    fn none(&self) -> Result<StubObj, ForeignError> {
        Ok(StubObj::none())
    }

    fn bool(&self, b: bool) -> Result<StubObj, ForeignError> {
        Ok(StubObj::new(StubValue::Bool(b)))
    }

    fn int(&self, n: i64) -> Result<StubObj, ForeignError> {
        Ok(StubObj::int(n))
    }

    fn float(&self, x: f64) -> Result<StubObj, ForeignError> {
        Ok(StubObj::float(x))
    }

    fn str(&self, s: &str) -> Result<StubObj, ForeignError> {
        Ok(StubObj::str(s))
    }

    fn list(&self, items: Vec<StubObj>) -> Result<StubObj, ForeignError> {
        Ok(StubObj::list(items))
    }

    fn tuple(&self, items: Vec<StubObj>) -> Result<StubObj, ForeignError> {
        Ok(StubObj::tuple(items))
    }

    fn dict(&self, entries: Vec<(String, StubObj)>) -> Result<StubObj, ForeignError> {
        Ok(StubObj::dict(entries.into_iter().map(|(k, v)| (StubObj::str(&k), v)).collect()))
    }

    fn proxy(&self, proxy: Proxy) -> Result<StubObj, ForeignError> {
        Ok(StubObj::new(StubValue::Proxy(proxy)))
    }

    fn inspect<'a>(&self, obj: &'a StubObj) -> Result<Inspect<'a>, ForeignError> {
        Ok(match obj.value() {
            StubValue::None => Inspect::None,
            StubValue::Bool(b) => Inspect::Bool(*b),
            StubValue::Int(n) => Inspect::Int(*n),
            StubValue::Float(x) => Inspect::Float(*x),
            StubValue::Bytes(b) => Inspect::Bytes(b.clone()),
            StubValue::Str(s) => Inspect::Str(s.clone()),
            StubValue::List(_) => Inspect::List,
            StubValue::Tuple(_) => Inspect::Tuple,
            StubValue::Dict(_) => Inspect::Dict,
            StubValue::Slice(s) => Inspect::Slice(*s),
            StubValue::Proxy(p) => Inspect::Proxy(p),
            StubValue::Mapping(_) => Inspect::Other { mapping_like: true, sequence_like: false },
            StubValue::Sequence(_) => Inspect::Other { mapping_like: false, sequence_like: true },
            StubValue::Opaque { .. } | StubValue::Module { .. } => {
                Inspect::Other { mapping_like: false, sequence_like: false }
            }
        })
    }

    fn identity(&self, obj: &StubObj) -> usize {
        Rc::as_ptr(&obj.0) as usize
    }

    fn items(&self, obj: &StubObj) -> Result<Vec<StubObj>, ForeignError> {
        obj.elements()
            .ok_or_else(|| ForeignError::exception(ExcKind::Type, format!("'{}' object is not a sequence", obj.type_name())))
    }

    fn mapping_items(&self, obj: &StubObj) -> Result<Vec<(StubObj, StubObj)>, ForeignError> {
        match obj.value() {
            StubValue::Dict(entries) => Ok(entries.borrow().clone()),
            StubValue::Mapping(entries) => Ok(entries.clone()),
            _ => Err(ForeignError::exception(
                ExcKind::Type,
                format!("'{}' object is not a mapping", obj.type_name()),
            )),
        }
    }

    fn str_form(&self, obj: &StubObj) -> Result<String, ForeignError> {
        match obj.value() {
            StubValue::None => Ok("None".into()),
            StubValue::Bool(b) => Ok(if *b { "True" } else { "False" }.into()),
            StubValue::Int(n) => Ok(n.to_string()),
            StubValue::Float(x) => Ok(format!("{x:?}")),
            StubValue::Str(s) => Ok(s.clone()),
            StubValue::Bytes(b) => Ok(format!("b'{}'", String::from_utf8_lossy(b))),
            StubValue::Slice(s) => Ok(format!("slice({}, {}, {})", s.start, s.stop, s.step)),
            StubValue::Proxy(p) => Ok(self.session()?.proxy_repr(p)),
            StubValue::Module { name, .. } => Ok(format!("<module '{name}'>")),
            StubValue::Opaque { type_name, str_form } => str_form.clone().ok_or_else(|| {
                ForeignError::exception(ExcKind::Type, format!("__str__ returned non-string (type {type_name})"))
            }),
            _ => Ok(format!("{obj:?}")),
        }
    }

    fn type_name(&self, obj: &StubObj) -> String {
        obj.type_name()
    }

    fn downgrade(&self, obj: &StubObj) -> Weak<StubValue> {
        Rc::downgrade(&obj.0)
    }

    fn upgrade(&self, weak: &Weak<StubValue>) -> Option<StubObj> {
        weak.upgrade().map(StubObj)
    }

    fn install_module(&self, name: &str, members: Vec<(&'static str, StubObj)>) -> Result<(), ForeignError> {
        let mut all: Vec<(String, StubObj)> =
            vec![("error".into(), StubObj::opaque("type", Some(&format!("<class '{name}.error'>"))))];
        all.extend(members.into_iter().map(|(k, v)| (k.to_owned(), v)));
        let module = StubObj::new(StubValue::Module { name: name.to_owned(), members: RefCell::new(all) });
        self.modules.borrow_mut().insert(name.to_owned(), module);
        Ok(())
    }

    fn set_sys_stream(&self, name: &str, stream: StubObj) -> Result<(), ForeignError> {
        self.sys.borrow_mut().insert(name.to_owned(), stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_evaluate_without_scripts() {
        let rt = StubRuntime::new();
        assert_eq!(rt.eval("42").unwrap().as_int(), Some(42));
        assert_eq!(rt.eval("'hi'").unwrap().as_str().as_deref(), Some("hi"));
        assert!(rt.eval("None").unwrap().is_none());
        assert!(rt.eval("undefined_name").is_err());
    }

    #[test]
    fn script_without_session_fails() {
        let rt = StubRuntime::new();
        rt.on_script("x", |_| Ok(StubObj::none()));
        assert_eq!(rt.run("x"), Err(ForeignError::NotInitialized));
        assert_eq!(rt.history(), vec!["x".to_string()]);
    }

    #[test]
    fn plain_container_operations() {
        let rt = StubRuntime::new();
        let l = StubObj::list(vec![StubObj::int(1), StubObj::int(2)]);
        assert_eq!(rt.len(&l).unwrap(), 2);
        assert_eq!(rt.getitem(&l, &StubObj::int(-1)).unwrap().as_int(), Some(2));
        let d = StubObj::str_dict(vec![("a", StubObj::int(1))]);
        rt.setitem(&d, &StubObj::str("b"), Some(&StubObj::int(2))).unwrap();
        assert_eq!(rt.getitem(&d, &StubObj::str("b")).unwrap().as_int(), Some(2));
        assert!(rt.getitem(&d, &StubObj::str("zz")).is_err());
    }

    #[test]
    fn weak_references_follow_object_lifetime() {
        let rt = StubRuntime::new();
        let obj = StubObj::int(5);
        let weak = rt.downgrade(&obj);
        assert!(rt.upgrade(&weak).is_some());
        drop(obj);
        assert!(rt.upgrade(&weak).is_none());
    }
}
