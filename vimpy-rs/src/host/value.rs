//! Host-side value model.
//!
//! Mirrors the editor's typed variables: numbers, floats, strings, lists,
//! dictionaries and function references.  Lists and dictionaries are shared,
//! reference-counted containers so that a proxy handed to the foreign side
//! aliases the very same storage the editor sees.

use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

/// A host variable value.
#[derive(Clone, Default)]
pub enum Value {
    /// Absent / unknown result.
    #[default]
    None,
    Number(i64),
    Float(f64),
    Str(String),
    List(List),
    Dict(Dict),
    Func(FuncRef),
}

impl Value {
    /// Name of the type, as shown in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Number(_) => "number",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Func(_) => "funcref",
        }
    }

    /// Truthiness used by `:if`-style host checks.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Number(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => s.trim().parse::<i64>().map(|n| n != 0).unwrap_or(false),
            Value::List(l) => !l.is_empty(),
            Value::Dict(d) => !d.is_empty(),
            Value::Func(_) => true,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Float(x) => Some(*x as i64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String form used by `:echo` (strings unquoted at top level).
    pub fn to_echo(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "v:none"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.abs() < 1e15 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{x}")
                }
            }
            Value::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::List(l) => fmt::Display::fmt(l, f),
            Value::Dict(d) => fmt::Display::fmt(d, f),
            Value::Func(func) => write!(f, "function('{}')", func.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::List(l) => write!(f, "List({l})"),
            Value::Dict(d) => write!(f, "Dict({d})"),
            Value::Func(func) => write!(f, "Func({:?})", func.name),
        }
    }
}

/// Structural equality; shared containers short-circuit on identity so
/// comparing a container with itself terminates even if it is cyclic.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.ptr_eq(b) || *a.0.borrow().items == *b.0.borrow().items
            }
            (Value::Dict(a), Value::Dict(b)) => a.ptr_eq(b) || a.0.borrow().map == b.0.borrow().map,
            (Value::Func(a), Value::Func(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<List> for Value {
    fn from(l: List) -> Self {
        Value::List(l)
    }
}

impl From<Dict> for Value {
    fn from(d: Dict) -> Self {
        Value::Dict(d)
    }
}

// ── Locking ───────────────────────────────────────────────────────────────────

/// Lock state of a container, numerically compatible with the
/// `VAR_LOCKED` / `VAR_FIXED` constants exported to scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lock {
    #[default]
    Unlocked = 0,
    Locked = 1,
    Fixed = 2,
}

impl Lock {
    pub fn as_int(self) -> i64 {
        self as i64
    }
}

/// Scope flag of a dictionary (`VAR_SCOPE` / `VAR_DEF_SCOPE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    None = 0,
    Scope = 1,
    DefScope = 2,
}

impl Scope {
    pub fn as_int(self) -> i64 {
        self as i64
    }
}

pub const VAR_LOCKED: i64 = Lock::Locked as i64;
pub const VAR_FIXED: i64 = Lock::Fixed as i64;
pub const VAR_SCOPE: i64 = Scope::Scope as i64;
pub const VAR_DEF_SCOPE: i64 = Scope::DefScope as i64;

/// Mutation refused by a container lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("list is locked")]
    ListLocked,
    #[error("dictionary is locked")]
    DictLocked,
    #[error("cannot modify fixed {0}")]
    Fixed(&'static str),
    #[error("list index out of range")]
    OutOfRange,
}

// ── List ──────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ListData {
    items: Vec<Value>,
    lock: Lock,
}

/// Shared, mutable host list.
#[derive(Clone, Default)]
pub struct List(Rc<RefCell<ListData>>);

impl List {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        List(Rc::new(RefCell::new(ListData { items, lock: Lock::Unlocked })))
    }

    /// Identity of the underlying storage.
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &List) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn len(&self) -> usize {
        self.0.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.borrow().items.get(index).cloned()
    }

    /// Snapshot of the current elements.
    pub fn items(&self) -> Vec<Value> {
        self.0.borrow().items.clone()
    }

    pub fn borrow_items(&self) -> Ref<'_, [Value]> {
        Ref::map(self.0.borrow(), |d| d.items.as_slice())
    }

    pub fn lock(&self) -> Lock {
        self.0.borrow().lock
    }

    pub fn set_lock(&self, lock: Lock) -> Result<(), LockError> {
        let mut data = self.0.borrow_mut();
        if data.lock == Lock::Fixed {
            return Err(LockError::Fixed("list"));
        }
        data.lock = lock;
        Ok(())
    }

    fn writable(&self) -> Result<std::cell::RefMut<'_, ListData>, LockError> {
        let data = self.0.borrow_mut();
        if data.lock != Lock::Unlocked {
            return Err(LockError::ListLocked);
        }
        Ok(data)
    }

    pub fn push(&self, value: Value) -> Result<(), LockError> {
        self.writable()?.items.push(value);
        Ok(())
    }

    /// Replace element `index`; `index == len` appends.
    pub fn set(&self, index: usize, value: Value) -> Result<(), LockError> {
        let mut data = self.writable()?;
        match index.cmp(&data.items.len()) {
            std::cmp::Ordering::Less => data.items[index] = value,
            std::cmp::Ordering::Equal => data.items.push(value),
            std::cmp::Ordering::Greater => return Err(LockError::OutOfRange),
        }
        Ok(())
    }

    pub fn remove(&self, index: usize) -> Result<Value, LockError> {
        let mut data = self.writable()?;
        if index >= data.items.len() {
            return Err(LockError::OutOfRange);
        }
        Ok(data.items.remove(index))
    }

    /// Replace `lo..hi` with `values` (clamped to the current length).
    pub fn splice(&self, lo: usize, hi: usize, values: Vec<Value>) -> Result<(), LockError> {
        let mut data = self.writable()?;
        let len = data.items.len();
        let lo = lo.min(len);
        let hi = hi.clamp(lo, len);
        data.items.splice(lo..hi, values);
        Ok(())
    }

    pub fn extend(&self, values: Vec<Value>) -> Result<(), LockError> {
        self.writable()?.items.extend(values);
        Ok(())
    }
}

impl fmt::Display for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = match self.0.try_borrow() {
            Ok(d) => d,
            Err(_) => return write!(f, "[...]"),
        };
        write!(f, "[")?;
        for (i, v) in data.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match v {
                Value::List(inner) if inner.ptr_eq(self) => write!(f, "[...]")?,
                Value::List(inner) => write!(f, "[{} items]", inner.len())?,
                Value::Dict(inner) => write!(f, "{{{} items}}", inner.len())?,
                other => write!(f, "{other}")?,
            }
        }
        write!(f, "]")
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "List({self})")
    }
}

// ── Dict ──────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct DictData {
    map: BTreeMap<String, Value>,
    lock: Lock,
    scope: Scope,
}

/// Shared, mutable host dictionary with string keys.
#[derive(Clone, Default)]
pub struct Dict(Rc<RefCell<DictData>>);

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope dictionary such as `g:` or `v:`.
    pub fn with_scope(scope: Scope) -> Self {
        Dict(Rc::new(RefCell::new(DictData { scope, ..Default::default() })))
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let d = Dict::new();
        {
            let mut data = d.0.borrow_mut();
            for (k, v) in pairs {
                data.map.insert(k.into(), v);
            }
        }
        d
    }

    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &Dict) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn len(&self) -> usize {
        self.0.borrow().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.borrow().map.get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.borrow().map.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().map.keys().cloned().collect()
    }

    /// Snapshot of all entries in key order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0.borrow().map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn lock(&self) -> Lock {
        self.0.borrow().lock
    }

    pub fn scope(&self) -> Scope {
        self.0.borrow().scope
    }

    pub fn set_lock(&self, lock: Lock) -> Result<(), LockError> {
        let mut data = self.0.borrow_mut();
        if data.lock == Lock::Fixed {
            return Err(LockError::Fixed("dictionary"));
        }
        data.lock = lock;
        Ok(())
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Result<Option<Value>, LockError> {
        let mut data = self.0.borrow_mut();
        if data.lock != Lock::Unlocked {
            return Err(LockError::DictLocked);
        }
        Ok(data.map.insert(key.into(), value))
    }

    pub fn remove(&self, key: &str) -> Result<Option<Value>, LockError> {
        let mut data = self.0.borrow_mut();
        if data.lock != Lock::Unlocked {
            return Err(LockError::DictLocked);
        }
        Ok(data.map.remove(key))
    }
}

impl fmt::Display for Dict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = match self.0.try_borrow() {
            Ok(d) => d,
            Err(_) => return write!(f, "{{...}}"),
        };
        write!(f, "{{")?;
        for (i, (k, v)) in data.map.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "'{k}': ")?;
            match v {
                Value::Dict(inner) if inner.ptr_eq(self) => write!(f, "{{...}}")?,
                Value::Dict(inner) => write!(f, "{{{} items}}", inner.len())?,
                Value::List(inner) => write!(f, "[{} items]", inner.len())?,
                other => write!(f, "{other}")?,
            }
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for Dict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dict({self})")
    }
}

// ── FuncRef ───────────────────────────────────────────────────────────────────

/// Reference to a host function, optionally with bound leading arguments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FuncRef {
    pub name: String,
    pub partial: Vec<Value>,
}

impl FuncRef {
    pub fn new(name: impl Into<String>) -> Self {
        FuncRef { name: name.into(), partial: Vec::new() }
    }

    /// Full argument list: bound arguments followed by `args`.
    pub fn arguments(&self, args: Vec<Value>) -> Vec<Value> {
        let mut all = self.partial.clone();
        all.extend(args);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_aliasing_is_shared() {
        let a = List::from_vec(vec![Value::Number(1)]);
        let b = a.clone();
        b.push(Value::Number(2)).unwrap();
        assert_eq!(a.len(), 2);
        assert!(a.ptr_eq(&b));
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn locked_list_refuses_mutation() {
        let l = List::from_vec(vec![Value::Number(1)]);
        l.set_lock(Lock::Locked).unwrap();
        assert_eq!(l.push(Value::Number(2)), Err(LockError::ListLocked));
        l.set_lock(Lock::Unlocked).unwrap();
        l.push(Value::Number(2)).unwrap();
        assert_eq!(l.len(), 2);
    }

    #[test]
    fn fixed_dict_lock_cannot_change() {
        let d = Dict::new();
        d.set_lock(Lock::Fixed).unwrap();
        assert_eq!(d.set_lock(Lock::Unlocked), Err(LockError::Fixed("dictionary")));
        assert_eq!(d.insert("a", Value::Number(1)), Err(LockError::DictLocked));
    }

    #[test]
    fn list_set_at_len_appends() {
        let l = List::new();
        l.set(0, Value::from("x")).unwrap();
        assert_eq!(l.items(), vec![Value::from("x")]);
        assert_eq!(l.set(5, Value::Number(0)), Err(LockError::OutOfRange));
    }

    #[test]
    fn splice_clamps() {
        let l = List::from_vec((1..=4).map(Value::Number).collect());
        l.splice(1, 10, vec![Value::Number(9)]).unwrap();
        assert_eq!(l.items(), vec![Value::Number(1), Value::Number(9)]);
    }

    #[test]
    fn self_referencing_list_displays() {
        let l = List::new();
        l.push(Value::List(l.clone())).unwrap();
        assert_eq!(l.to_string(), "[[...]]");
        assert_eq!(Value::List(l.clone()), Value::List(l));
    }

    #[test]
    fn display_quotes_nested_strings() {
        let d = Dict::from_pairs([("a", Value::from("it's")), ("b", Value::Number(2))]);
        assert_eq!(d.to_string(), "{'a': 'it''s', 'b': 2}");
        assert_eq!(Value::from("plain").to_echo(), "plain");
    }

    #[test]
    fn scope_constants() {
        assert_eq!(VAR_LOCKED, 1);
        assert_eq!(VAR_FIXED, 2);
        assert_eq!(VAR_SCOPE, 1);
        assert_eq!(VAR_DEF_SCOPE, 2);
        assert_eq!(Dict::with_scope(Scope::DefScope).scope(), Scope::DefScope);
    }

    #[test]
    fn funcref_partial_arguments() {
        let f = FuncRef { name: "Add".into(), partial: vec![Value::Number(1)] };
        assert_eq!(f.arguments(vec![Value::Number(2)]), vec![Value::Number(1), Value::Number(2)]);
    }
}
