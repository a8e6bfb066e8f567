//! Per-operation proxy entry points.
//!
//! Each backend's protocol slots (attribute get/set, length, item,
//! subscript, call, iteration, repr) land here.  Attribute lookup runs in a
//! fixed order: the class's specific attributes, then its method table
//! (producing bound-method proxies), then "not found", which the backend
//! turns into its generic lookup / `AttributeError`.

use std::cell::RefMut;

use super::{Proxy, ProxyClass, Target};
use crate::error::ProxyError;
use crate::foreign::{Inspect, Runtime, SliceSpec};
use crate::handoff::Side;
use crate::host::editor::Editor;
use crate::session::Session;

/// Result of a specific-attribute lookup.
pub enum Attr<O> {
    Found(O),
    Missing,
}

/// Bound-method names per class.
pub(crate) fn methods(class: ProxyClass) -> &'static [&'static str] {
    match class {
        ProxyClass::Buffer => &["append", "range"],
        ProxyClass::Range => &["append"],
        ProxyClass::Dictionary => &["keys", "values", "items", "has_key", "get", "update"],
        ProxyClass::List => &["extend"],
        ProxyClass::Output => &["write", "writelines", "flush"],
        _ => &[],
    }
}

/// Specific attribute names per class, as listed by `__members__`.
pub(crate) fn members(class: ProxyClass) -> &'static [&'static str] {
    match class {
        ProxyClass::Buffer => &["name", "number", "vars", "valid"],
        ProxyClass::Range => &["start", "end"],
        ProxyClass::Window => &["buffer", "cursor", "height", "width", "vars", "number", "tabpage", "valid"],
        ProxyClass::TabPage => &["windows", "window", "number", "vars", "valid"],
        ProxyClass::Current => &["buffer", "window", "tabpage", "line", "range"],
        ProxyClass::Dictionary => &["locked", "scope"],
        ProxyClass::List => &["locked"],
        ProxyClass::Function => &["name"],
        ProxyClass::Output => &["softspace", "encoding", "errors", "closed"],
        _ => &[],
    }
}

pub(crate) fn kind_name(class: ProxyClass) -> &'static str {
    match class {
        ProxyClass::Window => "window",
        ProxyClass::TabPage => "tab page",
        _ => "buffer",
    }
}

impl<R: Runtime> Session<R> {
    /// Mutable editor access for a foreign-side write.
    pub(crate) fn host_write(&self) -> Result<RefMut<'_, Editor>, ProxyError> {
        if self.handoff.side() != Side::Foreign {
            return Err(ProxyError::Host("editor state can only be changed from inside a script".into()));
        }
        self.editor_mut()
    }

    pub fn proxy_getattr(&self, proxy: &Proxy, name: &str) -> Result<Attr<R::Obj>, ProxyError> {
        self.settle();
        let class = proxy.class();
        let target = proxy.target();
        if let Target::Invalid = target {
            return match name {
                "valid" => Ok(Attr::Found(self.rt.bool(false)?)),
                _ => Err(ProxyError::Invalid(kind_name(class))),
            };
        }
        let specific = match &target {
            Target::Buffer(id) => self.buffer_attr(*id, name)?,
            Target::Range { buffer, start, end } => self.range_attr(*buffer, *start, end.get(), name)?,
            Target::Window(id) => self.window_attr(*id, name)?,
            Target::TabPage(id) => self.tabpage_attr(*id, name)?,
            Target::Current => self.current_attr(name)?,
            Target::Dict(d) => self.dict_attr(d, name)?,
            Target::List(l) => self.list_attr(l, name)?,
            Target::Function(f) => self.function_attr(f, name)?,
            Target::Output(_) => self.output_attr(name)?,
            _ => None,
        };
        if let Some(v) = specific {
            return Ok(Attr::Found(v));
        }
        if let Some(m) = methods(class).iter().find(|m| **m == name) {
            let method = Target::Method { receiver: Box::new(target), class, name: m };
            return Ok(Attr::Found(self.wrap(ProxyClass::Method, method)?));
        }
        if name == "__members__" {
            let names = members(class)
                .iter()
                .map(|n| self.rt.str(n))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Attr::Found(self.rt.list(names)?));
        }
        Ok(Attr::Missing)
    }

    /// `obj.name = value`; `value` is `None` for deletion.
    pub fn proxy_setattr(&self, proxy: &Proxy, name: &str, value: Option<&R::Obj>) -> Result<(), ProxyError> {
        let class = proxy.class();
        let handled = match proxy.target() {
            Target::Invalid => return Err(ProxyError::Invalid(kind_name(class))),
            Target::Current => self.current_setattr(name, value)?,
            other => {
                let Some(value) = value else {
                    return Err(ProxyError::Type("can't delete attribute".into()));
                };
                match other {
                    Target::Buffer(id) => self.buffer_setattr(id, name, value)?,
                    Target::Window(id) => self.window_setattr(id, name, value)?,
                    Target::Dict(d) => self.dict_setattr(&d, name, value)?,
                    Target::List(l) => self.list_setattr(&l, name, value)?,
                    Target::Output(_) => self.output_setattr(name, value)?,
                    _ => false,
                }
            }
        };
        if handled {
            Ok(())
        } else {
            Err(ProxyError::Attribute(format!(
                "'{}' object has no attribute '{name}'",
                class.type_name()
            )))
        }
    }

    pub fn proxy_len(&self, proxy: &Proxy) -> Result<usize, ProxyError> {
        match proxy.target() {
            t @ (Target::Buffer(_) | Target::Range { .. }) => Ok(self.span(&t)?.len()),
            Target::List(l) => Ok(l.len()),
            Target::Dict(d) => Ok(d.len()),
            Target::BufferMap => Ok(self.editor_ref()?.buffer_ids().len()),
            Target::WindowList(tab) => Ok(self.tab_windows(tab)?.len()),
            Target::TabList => Ok(self.editor_ref()?.tabs().len()),
            Target::Invalid => Err(ProxyError::Invalid(kind_name(proxy.class()))),
            _ => Err(ProxyError::Type(format!("object of type '{}' has no len()", proxy.class().type_name()))),
        }
    }

    /// Sequence item by non-negative position.
    pub fn proxy_item(&self, proxy: &Proxy, index: isize) -> Result<R::Obj, ProxyError> {
        match proxy.target() {
            t @ (Target::Buffer(_) | Target::Range { .. }) => {
                let span = self.span(&t)?;
                self.span_item(&span, index)
            }
            Target::List(l) => self.list_item(&l, index),
            Target::WindowList(tab) => {
                let windows = self.tab_windows(tab)?;
                let id = usize::try_from(index)
                    .ok()
                    .and_then(|i| windows.get(i).copied())
                    .ok_or_else(|| ProxyError::Index("no such window".into()))?;
                self.window_obj(id)
            }
            Target::TabList => {
                let id = {
                    let ed = self.editor_ref()?;
                    usize::try_from(index).ok().and_then(|i| ed.tabs().get(i)).map(|t| t.id)
                };
                let id = id.ok_or_else(|| ProxyError::Index("no such tab page".into()))?;
                self.tabpage_obj(id)
            }
            Target::Invalid => Err(ProxyError::Invalid(kind_name(proxy.class()))),
            _ => Err(ProxyError::Type(format!("'{}' object is not a sequence", proxy.class().type_name()))),
        }
    }

    /// `obj[key]`.
    pub fn proxy_subscript(&self, proxy: &Proxy, key: &R::Obj) -> Result<R::Obj, ProxyError> {
        match proxy.target() {
            Target::BufferMap => self.buffer_by_number(key),
            Target::Dict(d) => self.dict_item(&d, key),
            Target::Invalid => Err(ProxyError::Invalid(kind_name(proxy.class()))),
            t if proxy.class().caps().sequence => match self.rt.inspect(key)? {
                Inspect::Int(i) => {
                    let len = self.proxy_len(proxy)?;
                    self.proxy_item(proxy, normalize_index(i, len)?)
                }
                Inspect::Bool(b) => self.proxy_item(proxy, b as isize),
                Inspect::Slice(spec) => self.proxy_slice(proxy, &t, &spec),
                _ => Err(ProxyError::Type("index must be int or slice".into())),
            },
            _ => Err(ProxyError::Type(format!("'{}' object is not subscriptable", proxy.class().type_name()))),
        }
    }

    fn proxy_slice(&self, proxy: &Proxy, target: &Target, spec: &SliceSpec) -> Result<R::Obj, ProxyError> {
        match target {
            Target::Buffer(_) | Target::Range { .. } => {
                let span = self.span(target)?;
                self.span_slice(&span, spec)
            }
            Target::List(l) => self.list_slice(l, spec),
            _ => {
                let len = self.proxy_len(proxy)?;
                let (start, _, count) = spec.adjust(len);
                let items = (0..count)
                    .map(|k| self.proxy_item(proxy, start + k as isize * spec.step))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.rt.list(items)?)
            }
        }
    }

    /// `obj[key] = value`, or `del obj[key]` when `value` is `None`.
    pub fn proxy_ass_subscript(&self, proxy: &Proxy, key: &R::Obj, value: Option<&R::Obj>) -> Result<(), ProxyError> {
        let target = proxy.target();
        match &target {
            Target::Dict(d) => return self.dict_set(d, key, value),
            Target::Invalid => return Err(ProxyError::Invalid(kind_name(proxy.class()))),
            Target::Buffer(_) | Target::Range { .. } | Target::List(_) => {}
            _ => {
                return Err(ProxyError::Type(format!(
                    "'{}' object does not support item assignment",
                    proxy.class().type_name()
                )))
            }
        }
        match self.rt.inspect(key)? {
            Inspect::Int(i) => {
                let len = self.proxy_len(proxy)?;
                let index = if i == len as i64 && matches!(target, Target::List(_)) {
                    len as isize
                } else {
                    normalize_index(i, len)?
                };
                self.proxy_ass_item(proxy, index, value)
            }
            Inspect::Slice(spec) => {
                let len = self.proxy_len(proxy)?;
                let (lo, hi) = spec
                    .contiguous(len)
                    .ok_or_else(|| ProxyError::Value("slice step must be 1 for assignment".into()))?;
                match target {
                    Target::List(l) => self.list_ass_slice(&l, lo, hi, value),
                    t => {
                        let span = self.span(&t)?;
                        self.span_ass_slice(&span, lo, hi, value)
                    }
                }
            }
            _ => Err(ProxyError::Type("index must be int or slice".into())),
        }
    }

    /// Sequence item assignment by non-negative position.
    pub fn proxy_ass_item(&self, proxy: &Proxy, index: isize, value: Option<&R::Obj>) -> Result<(), ProxyError> {
        match proxy.target() {
            t @ (Target::Buffer(_) | Target::Range { .. }) => {
                let span = self.span(&t)?;
                self.span_ass_item(&span, index, value)
            }
            Target::List(l) => self.list_ass_item(&l, index, value),
            Target::Invalid => Err(ProxyError::Invalid(kind_name(proxy.class()))),
            _ => Err(ProxyError::Type(format!(
                "'{}' object does not support item assignment",
                proxy.class().type_name()
            ))),
        }
    }

    /// `obj(*args)`.
    pub fn proxy_call(&self, proxy: &Proxy, args: &[R::Obj]) -> Result<R::Obj, ProxyError> {
        match proxy.target() {
            Target::Builtin(b) => self.builtin_call(b, args),
            Target::Function(f) => self.function_call(&f, args),
            Target::Method { receiver, class, name } => match class {
                ProxyClass::Buffer | ProxyClass::Range => self.buffer_method(&receiver, name, args),
                ProxyClass::Dictionary => match *receiver {
                    Target::Dict(d) => self.dict_method(&d, name, args),
                    _ => Err(ProxyError::Type("bad method receiver".into())),
                },
                ProxyClass::List => match *receiver {
                    Target::List(l) => self.list_method(&l, name, args),
                    _ => Err(ProxyError::Type("bad method receiver".into())),
                },
                ProxyClass::Output => match *receiver {
                    Target::Output(stream) => self.output_method(stream, name, args),
                    _ => Err(ProxyError::Type("bad method receiver".into())),
                },
                other => Err(ProxyError::Type(format!("'{}' has no methods", other.type_name()))),
            },
            Target::Invalid => Err(ProxyError::Invalid(kind_name(proxy.class()))),
            _ => Err(ProxyError::Type(format!("'{}' object is not callable", proxy.class().type_name()))),
        }
    }

    /// Snapshot list to iterate over for mapping-style proxies.
    pub fn proxy_iter(&self, proxy: &Proxy) -> Result<R::Obj, ProxyError> {
        match proxy.target() {
            Target::BufferMap => {
                let ids = self.editor_ref()?.buffer_ids();
                let items = ids.into_iter().map(|id| self.buffer_obj(id)).collect::<Result<Vec<_>, _>>()?;
                Ok(self.rt.list(items)?)
            }
            Target::Dict(d) => {
                let keys = d.keys().iter().map(|k| self.rt.str(k)).collect::<Result<Vec<_>, _>>()?;
                Ok(self.rt.list(keys)?)
            }
            _ => Err(ProxyError::Type(format!("'{}' object is not iterable", proxy.class().type_name()))),
        }
    }

    pub fn proxy_repr(&self, proxy: &Proxy) -> String {
        let class = proxy.class();
        match proxy.target() {
            Target::Invalid => format!("<{} object (deleted)>", kind_name(class)),
            Target::Buffer(id) => match self.editor.try_borrow().ok().and_then(|e| e.buffer(id).map(|b| b.name.clone())) {
                Some(name) if !name.is_empty() => format!("<buffer {name}>"),
                _ => format!("<buffer object (unnamed) {id}>"),
            },
            Target::Range { buffer, start, end } => {
                let name = self
                    .editor
                    .try_borrow()
                    .ok()
                    .and_then(|e| e.buffer(buffer).map(|b| b.name.clone()))
                    .unwrap_or_default();
                format!("<range {name} ({start}:{})>", end.get())
            }
            Target::Window(id) => match self.editor.try_borrow().ok().and_then(|e| e.window_number(id)) {
                Some(n) => format!("<window {}>", n - 1),
                None => "<window object (unknown)>".into(),
            },
            Target::TabPage(id) => match self.editor.try_borrow().ok().and_then(|e| e.tab_number(id)) {
                Some(n) => format!("<tabpage {}>", n - 1),
                None => "<tabpage object (unknown)>".into(),
            },
            Target::Dict(d) => format!("<vim.dictionary object at {:#x}>", d.id()),
            Target::List(l) => format!("<vim.list object at {:#x}>", l.id()),
            Target::Function(f) => format!("<vim.function '{}'>", f.name),
            Target::Builtin(b) => format!("<built-in function {}>", format!("{b:?}").to_lowercase()),
            Target::Method { class, name, .. } => {
                format!("<built-in method {name} of {} object>", class.type_name())
            }
            _ => format!("<{} object>", class.type_name()),
        }
    }
}

/// Python-style negative index normalisation.
pub(crate) fn normalize_index(i: i64, len: usize) -> Result<isize, ProxyError> {
    let len = len as i64;
    let j = if i < 0 { i + len } else { i };
    if j < 0 || j >= len {
        return Err(ProxyError::Index("index out of range".into()));
    }
    Ok(j as isize)
}

pub(crate) fn arity<O>(name: &str, args: &[O], min: usize, max: usize) -> Result<(), ProxyError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max { min.to_string() } else { format!("{min} to {max}") };
        return Err(ProxyError::Type(format!(
            "{name}() takes {expected} argument{} ({} given)",
            if max == 1 { "" } else { "s" },
            args.len()
        )));
    }
    Ok(())
}

pub(crate) fn int_arg<R: Runtime>(rt: &R, obj: &R::Obj) -> Result<i64, ProxyError> {
    match rt.inspect(obj)? {
        Inspect::Int(n) => Ok(n),
        Inspect::Bool(b) => Ok(b as i64),
        _ => Err(ProxyError::Type(format!("expected int, got {}", rt.type_name(obj)))),
    }
}

pub(crate) fn truth_arg<R: Runtime>(rt: &R, obj: &R::Obj) -> Result<bool, ProxyError> {
    match rt.inspect(obj)? {
        Inspect::Bool(b) => Ok(b),
        Inspect::Int(n) => Ok(n != 0),
        Inspect::None => Ok(false),
        _ => Err(ProxyError::Type(format!("expected bool or int, got {}", rt.type_name(obj)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_indices_wrap_once() {
        assert_eq!(normalize_index(-1, 3).unwrap(), 2);
        assert_eq!(normalize_index(0, 3).unwrap(), 0);
        assert!(normalize_index(3, 3).is_err());
        assert!(normalize_index(-4, 3).is_err());
    }

    #[test]
    fn arity_messages() {
        assert!(arity::<u8>("f", &[1], 1, 2).is_ok());
        let err = arity::<u8>("append", &[], 1, 2).unwrap_err();
        assert_eq!(err.to_string(), "append() takes 1 to 2 arguments (0 given)");
    }

    #[test]
    fn method_tables() {
        assert!(methods(ProxyClass::Dictionary).contains(&"update"));
        assert!(methods(ProxyClass::Window).is_empty());
        assert!(members(ProxyClass::Current).contains(&"range"));
    }
}
