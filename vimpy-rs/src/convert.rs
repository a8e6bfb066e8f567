//! Value conversion between the editor and the interpreter.
//!
//! Host → foreign comes in two flavours:
//!
//! - [`to_foreign`] makes a deep copy.  Lists and dictionaries become
//!   native foreign lists and dicts; a container already on the current
//!   path is a cycle and aborts the whole conversion.
//! - [`to_foreign_bound`] aliases: lists, dictionaries and function
//!   references become proxies onto the host storage.
//!
//! Foreign → host ([`ToHost`]) classifies in a fixed order: proxy, None,
//! bool / int, float, bytes / str, dict, list / tuple, mapping-like,
//! sequence-like, and finally the object's `str()` form.  Shared
//! substructure stays shared; cycles are errors.  Dictionary entries and
//! list items that fail under [`EntryPolicy::Skip`] are dropped with a
//! warning instead of failing the whole conversion.
//!
//! Buffer lines use their own pair of helpers: a NUL byte in a host line is
//! how the editor stores an embedded newline, so lines map `"\n"` ↔ NUL on
//! the way across and a raw newline coming back is rejected.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::error::ConvertError;
use crate::foreign::{Inspect, Runtime};
use crate::host::value::{Dict, FuncRef, List, Value};
use crate::proxy::{Proxy, ProxyClass, Target};

// ── Host → foreign ────────────────────────────────────────────────────────────

/// Deep-copy a host value into a fresh foreign object.
pub fn to_foreign<R: Runtime>(rt: &R, value: &Value) -> Result<R::Obj, ConvertError> {
    Copier { rt, path: HashSet::new() }.copy(value)
}

/// Convert a host value, exposing containers as aliasing proxies.
pub fn to_foreign_bound<R: Runtime>(rt: &R, value: &Value) -> Result<R::Obj, ConvertError> {
    match value {
        Value::List(l) => Ok(rt.proxy(list_proxy(l))?),
        Value::Dict(d) => Ok(rt.proxy(dict_proxy(d))?),
        other => to_foreign(rt, other),
    }
}

pub(crate) fn list_proxy(l: &List) -> Proxy {
    Proxy::new(ProxyClass::List, Target::List(l.clone()))
}

pub(crate) fn dict_proxy(d: &Dict) -> Proxy {
    Proxy::new(ProxyClass::Dictionary, Target::Dict(d.clone()))
}

pub(crate) fn function_proxy(f: &FuncRef) -> Proxy {
    Proxy::new(ProxyClass::Function, Target::Function(f.clone()))
}

struct Copier<'a, R: Runtime> {
    rt: &'a R,
    /// Containers on the path from the root to the value being copied.
    path: HashSet<usize>,
}

impl<R: Runtime> Copier<'_, R> {
    fn copy(&mut self, value: &Value) -> Result<R::Obj, ConvertError> {
        let rt = self.rt;
        match value {
            Value::None => Ok(rt.none()?),
            Value::Number(n) => Ok(rt.int(*n)?),
            Value::Float(x) => Ok(rt.float(*x)?),
            Value::Str(s) => Ok(rt.str(s)?),
            Value::Func(f) => Ok(rt.proxy(function_proxy(f))?),
            Value::List(l) => {
                let id = l.id();
                if !self.path.insert(id) {
                    return Err(ConvertError::Recursive);
                }
                let items: Result<Vec<_>, _> = l.items().iter().map(|v| self.copy(v)).collect();
                self.path.remove(&id);
                Ok(rt.list(items?)?)
            }
            Value::Dict(d) => {
                let id = d.id();
                if !self.path.insert(id) {
                    return Err(ConvertError::Recursive);
                }
                let entries: Result<Vec<_>, _> =
                    d.entries().into_iter().map(|(k, v)| self.copy(&v).map(|o| (k, o))).collect();
                self.path.remove(&id);
                Ok(rt.dict(entries?)?)
            }
        }
    }
}

// ── Foreign → host ────────────────────────────────────────────────────────────

/// What to do with a dictionary entry or list item that fails to convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryPolicy {
    /// The first failure fails the whole conversion.
    #[default]
    Abort,
    /// Drop the entry, log a warning and keep going.
    Skip,
}

/// One foreign → host conversion, with its memo of already-converted
/// containers.
pub struct ToHost<'a, R: Runtime> {
    rt: &'a R,
    policy: EntryPolicy,
    memo: HashMap<usize, Value>,
    active: HashSet<usize>,
    skipped: Vec<(String, ConvertError)>,
}

impl<'a, R: Runtime> ToHost<'a, R> {
    pub fn new(rt: &'a R, policy: EntryPolicy) -> Self {
        ToHost { rt, policy, memo: HashMap::new(), active: HashSet::new(), skipped: Vec::new() }
    }

    /// Entries dropped under [`EntryPolicy::Skip`], with the reason.
    pub fn skipped(&self) -> &[(String, ConvertError)] {
        &self.skipped
    }

    pub fn convert(&mut self, obj: &R::Obj) -> Result<Value, ConvertError> {
        let rt = self.rt;
        match rt.inspect(obj)? {
            Inspect::Proxy(p) => self.unwrap_proxy(p, obj),
            Inspect::None => Ok(Value::None),
            Inspect::Bool(b) => Ok(Value::Number(b as i64)),
            Inspect::Int(n) => Ok(Value::Number(n)),
            Inspect::Float(x) => Ok(Value::Float(x)),
            Inspect::Bytes(b) => Ok(Value::Str(String::from_utf8_lossy(&b).into_owned())),
            Inspect::Str(s) => Ok(Value::Str(s)),
            Inspect::Dict | Inspect::Other { mapping_like: true, .. } => self.container(obj, Self::mapping),
            Inspect::List | Inspect::Tuple | Inspect::Other { sequence_like: true, .. } => {
                self.container(obj, Self::sequence)
            }
            Inspect::Slice(_) | Inspect::Other { .. } => match rt.str_form(obj) {
                Ok(s) => Ok(Value::Str(s)),
                Err(_) => Err(ConvertError::Unsupported(rt.type_name(obj))),
            },
        }
    }

    fn container(
        &mut self,
        obj: &R::Obj,
        body: fn(&mut Self, &R::Obj) -> Result<Value, ConvertError>,
    ) -> Result<Value, ConvertError> {
        let id = self.rt.identity(obj);
        if let Some(done) = self.memo.get(&id) {
            return Ok(done.clone());
        }
        if !self.active.insert(id) {
            return Err(ConvertError::Recursive);
        }
        let result = body(self, obj);
        self.active.remove(&id);
        let value = result?;
        self.memo.insert(id, value.clone());
        Ok(value)
    }

    fn sequence(&mut self, obj: &R::Obj) -> Result<Value, ConvertError> {
        let items = self.rt.items(obj)?;
        let mut values = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            match self.convert(item) {
                Ok(value) => values.push(value),
                Err(e) if self.policy == EntryPolicy::Skip => {
                    let kind = self.rt.type_name(item);
                    warn!(index, %kind, error = %e, "skipping list item");
                    self.skipped.push((index.to_string(), e));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Value::List(List::from_vec(values)))
    }

    fn mapping(&mut self, obj: &R::Obj) -> Result<Value, ConvertError> {
        let dict = Dict::new();
        for (k, v) in self.rt.mapping_items(obj)? {
            let entry = mapping_key(self.rt, &k).and_then(|key| Ok((key, self.convert(&v)?)));
            match entry {
                Ok((key, value)) => {
                    dict.insert(key, value)?;
                }
                Err(e) if self.policy == EntryPolicy::Skip => {
                    let key = self.rt.str_form(&k).unwrap_or_else(|_| self.rt.type_name(&k));
                    warn!(%key, error = %e, "skipping dictionary entry");
                    self.skipped.push((key, e));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Value::Dict(dict))
    }

    fn unwrap_proxy(&mut self, p: &Proxy, obj: &R::Obj) -> Result<Value, ConvertError> {
        match p.target() {
            Target::Dict(d) => Ok(Value::Dict(d)),
            Target::List(l) => Ok(Value::List(l)),
            Target::Function(f) => Ok(Value::Func(f)),
            Target::Buffer(id) | Target::Window(id) | Target::TabPage(id) => Ok(Value::Number(id as i64)),
            Target::Invalid => Err(ConvertError::Invalid(match p.class() {
                ProxyClass::Window => "window",
                ProxyClass::TabPage => "tab page",
                _ => "buffer",
            })),
            _ => match self.rt.str_form(obj) {
                Ok(s) => Ok(Value::Str(s)),
                Err(_) => Err(ConvertError::Unsupported(p.class().type_name().into())),
            },
        }
    }
}

/// Strict conversion: any failure fails the call.
pub fn to_host<R: Runtime>(rt: &R, obj: &R::Obj) -> Result<Value, ConvertError> {
    ToHost::new(rt, EntryPolicy::Abort).convert(obj)
}

/// Dictionary key: strings as-is, numbers by their decimal form.
pub fn mapping_key<R: Runtime>(rt: &R, key: &R::Obj) -> Result<String, ConvertError> {
    let s = match rt.inspect(key)? {
        Inspect::Str(s) => s,
        Inspect::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
        Inspect::Int(n) => n.to_string(),
        Inspect::Bool(b) => (b as i64).to_string(),
        Inspect::Float(x) => Value::Float(x).to_string(),
        _ => return Err(ConvertError::NonStringKey(rt.type_name(key))),
    };
    if s.is_empty() {
        return Err(ConvertError::EmptyKey);
    }
    Ok(s)
}

/// A plain string argument (str or bytes).
pub fn string_arg<R: Runtime>(rt: &R, obj: &R::Obj) -> Result<String, ConvertError> {
    match rt.inspect(obj)? {
        Inspect::Str(s) => Ok(s),
        Inspect::Bytes(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
        _ => Err(ConvertError::Unsupported(rt.type_name(obj))),
    }
}

// ── Buffer lines ──────────────────────────────────────────────────────────────

/// Host line → foreign string: embedded NULs are stored as newlines in the
/// buffer and surface as NUL characters.
pub fn line_to_foreign<R: Runtime>(rt: &R, line: &str) -> Result<R::Obj, ConvertError> {
    if line.contains('\n') {
        Ok(rt.str(&line.replace('\n', "\0"))?)
    } else {
        Ok(rt.str(line)?)
    }
}

/// Foreign string → host line: NULs are stored as newlines; a newline in
/// the foreign text is an error.
pub fn line_from_foreign<R: Runtime>(rt: &R, obj: &R::Obj) -> Result<String, ConvertError> {
    let s = string_arg(rt, obj)?;
    if s.contains('\n') {
        return Err(ConvertError::Newline);
    }
    Ok(s.replace('\0', "\n"))
}

/// A single string or a sequence of strings, as buffer lines.
pub fn lines_from_foreign<R: Runtime>(rt: &R, obj: &R::Obj) -> Result<Vec<String>, ConvertError> {
    match rt.inspect(obj)? {
        Inspect::Str(_) | Inspect::Bytes(_) => Ok(vec![line_from_foreign(rt, obj)?]),
        Inspect::List | Inspect::Tuple | Inspect::Other { sequence_like: true, .. } => {
            rt.items(obj)?.iter().map(|item| line_from_foreign(rt, item)).collect()
        }
        _ => Err(ConvertError::Unsupported(rt.type_name(obj))),
    }
}

/// Host lines → foreign list of strings.
pub fn lines_to_foreign<R: Runtime>(rt: &R, lines: &[String]) -> Result<R::Obj, ConvertError> {
    let items = lines.iter().map(|l| line_to_foreign(rt, l)).collect::<Result<Vec<_>, _>>()?;
    Ok(rt.list(items)?)
}
