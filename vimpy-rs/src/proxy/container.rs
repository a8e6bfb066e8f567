//! Dictionary, list and function proxies.
//!
//! These alias live host values: reads convert lazily with
//! [`to_foreign_bound`] so nested containers stay shared, writes convert
//! strictly with [`to_host`].

use tracing::warn;

use super::dispatch::{arity, truth_arg};
use super::ProxyClass;
use crate::convert::{mapping_key, to_foreign_bound, to_host, EntryPolicy, ToHost};
use crate::error::{ConvertError, ProxyError};
use crate::foreign::{Inspect, Runtime, SliceSpec};
use crate::host::value::{Dict, FuncRef, List, Lock, Value};
use crate::session::Session;

fn lock_from(flag: bool) -> Lock {
    if flag {
        Lock::Locked
    } else {
        Lock::Unlocked
    }
}

impl<R: Runtime> Session<R> {
    fn bound(&self, value: &Value) -> Result<R::Obj, ProxyError> {
        Ok(to_foreign_bound(&self.rt, value)?)
    }

    fn host_values(&self, obj: &R::Obj) -> Result<Vec<Value>, ProxyError> {
        match self.rt.inspect(obj)? {
            Inspect::List | Inspect::Tuple | Inspect::Other { sequence_like: true, .. } => {}
            Inspect::Proxy(p) if p.class() == ProxyClass::List => {}
            _ => return Err(ProxyError::Type(format!("expected a sequence, got {}", self.rt.type_name(obj)))),
        }
        match to_host(&self.rt, obj)? {
            Value::List(l) => Ok(l.items()),
            other => Err(ProxyError::Type(format!("expected a sequence, got {}", other.type_name()))),
        }
    }

    // ── Dictionary ────────────────────────────────────────────────────────────

    pub(crate) fn dict_attr(&self, d: &Dict, name: &str) -> Result<Option<R::Obj>, ProxyError> {
        match name {
            "locked" => Ok(Some(self.rt.int(d.lock().as_int())?)),
            "scope" => Ok(Some(self.rt.int(d.scope().as_int())?)),
            _ => Ok(None),
        }
    }

    pub(crate) fn dict_setattr(&self, d: &Dict, name: &str, value: &R::Obj) -> Result<bool, ProxyError> {
        match name {
            "locked" => {
                d.set_lock(lock_from(truth_arg(&self.rt, value)?))?;
                Ok(true)
            }
            "scope" => Err(ProxyError::Type("cannot modify scope".into())),
            _ => Ok(false),
        }
    }

    pub(crate) fn dict_item(&self, d: &Dict, key: &R::Obj) -> Result<R::Obj, ProxyError> {
        let key = mapping_key(&self.rt, key)?;
        match d.get(&key) {
            Some(v) => self.bound(&v),
            None => Err(ProxyError::Key(key)),
        }
    }

    /// `d[key] = value`, or `del d[key]`.
    pub(crate) fn dict_set(&self, d: &Dict, key: &R::Obj, value: Option<&R::Obj>) -> Result<(), ProxyError> {
        let key = mapping_key(&self.rt, key)?;
        match value {
            None => match d.remove(&key)? {
                Some(_) => Ok(()),
                None => Err(ProxyError::Key(key)),
            },
            Some(v) => {
                let v = to_host(&self.rt, v)?;
                d.insert(key, v)?;
                Ok(())
            }
        }
    }

    pub(crate) fn dict_method(&self, d: &Dict, name: &str, args: &[R::Obj]) -> Result<R::Obj, ProxyError> {
        let rt = &self.rt;
        match name {
            "keys" => {
                arity(name, args, 0, 0)?;
                let keys = d.keys().iter().map(|k| rt.str(k)).collect::<Result<Vec<_>, _>>()?;
                Ok(rt.list(keys)?)
            }
            "values" => {
                arity(name, args, 0, 0)?;
                let values = d.entries().iter().map(|(_, v)| self.bound(v)).collect::<Result<Vec<_>, _>>()?;
                Ok(rt.list(values)?)
            }
            "items" => {
                arity(name, args, 0, 0)?;
                let mut pairs = Vec::with_capacity(d.len());
                for (k, v) in d.entries() {
                    pairs.push(rt.tuple(vec![rt.str(&k)?, self.bound(&v)?])?);
                }
                Ok(rt.list(pairs)?)
            }
            "has_key" => {
                arity(name, args, 1, 1)?;
                let key = mapping_key(rt, &args[0])?;
                Ok(rt.bool(d.contains_key(&key))?)
            }
            "get" => {
                arity(name, args, 1, 2)?;
                let key = mapping_key(rt, &args[0])?;
                match d.get(&key) {
                    Some(v) => self.bound(&v),
                    None => match args.get(1) {
                        Some(default) => Ok(default.clone()),
                        None => Ok(rt.none()?),
                    },
                }
            }
            "update" => {
                arity(name, args, 1, 1)?;
                self.dict_update(d, &args[0])?;
                Ok(rt.none()?)
            }
            other => Err(ProxyError::Attribute(format!("no method {other}"))),
        }
    }

    /// Merge a mapping in, skipping entries that cannot be converted.  The
    /// skipped keys are reported once the update is done.
    fn dict_update(&self, d: &Dict, other: &R::Obj) -> Result<(), ProxyError> {
        let mut conv = ToHost::new(&self.rt, EntryPolicy::Skip);
        let source = match conv.convert(other)? {
            Value::Dict(src) => src,
            v => return Err(ProxyError::Type(format!("update() needs a mapping, got {}", v.type_name()))),
        };
        for (k, v) in source.entries() {
            d.insert(k, v)?;
        }
        let skipped: Vec<(String, ConvertError)> = conv.skipped().to_vec();
        if !skipped.is_empty() {
            if let Ok(mut ed) = self.editor_mut() {
                for (key, err) in &skipped {
                    warn!(key = %key, error = %err, "dictionary update skipped an entry");
                    ed.msg(format!("W: skipped key '{key}': {err}"));
                }
            }
        }
        Ok(())
    }

    // ── List ──────────────────────────────────────────────────────────────────

    pub(crate) fn list_attr(&self, l: &List, name: &str) -> Result<Option<R::Obj>, ProxyError> {
        match name {
            "locked" => Ok(Some(self.rt.int(l.lock().as_int())?)),
            _ => Ok(None),
        }
    }

    pub(crate) fn list_setattr(&self, l: &List, name: &str, value: &R::Obj) -> Result<bool, ProxyError> {
        match name {
            "locked" => {
                l.set_lock(lock_from(truth_arg(&self.rt, value)?))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub(crate) fn list_item(&self, l: &List, index: isize) -> Result<R::Obj, ProxyError> {
        let item = usize::try_from(index)
            .ok()
            .and_then(|i| l.get(i))
            .ok_or_else(|| ProxyError::Index("list index out of range".into()))?;
        self.bound(&item)
    }

    pub(crate) fn list_slice(&self, l: &List, spec: &SliceSpec) -> Result<R::Obj, ProxyError> {
        let items = l.items();
        let (start, _, count) = spec.adjust(items.len());
        let picked = (0..count)
            .map(|k| &items[(start + k as isize * spec.step) as usize])
            .map(|v| self.bound(v))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.rt.list(picked)?)
    }

    /// `l[i] = v` (appending when `i == len`), or `del l[i]`.
    pub(crate) fn list_ass_item(&self, l: &List, index: isize, value: Option<&R::Obj>) -> Result<(), ProxyError> {
        let index = usize::try_from(index).map_err(|_| ProxyError::Index("list index out of range".into()))?;
        match value {
            None => {
                if index >= l.len() {
                    return Err(ProxyError::Index("list index out of range".into()));
                }
                l.remove(index)?;
            }
            Some(v) => {
                let v = to_host(&self.rt, v)?;
                l.set(index, v)?;
            }
        }
        Ok(())
    }

    pub(crate) fn list_ass_slice(&self, l: &List, lo: usize, hi: usize, value: Option<&R::Obj>) -> Result<(), ProxyError> {
        let values = match value {
            Some(v) => self.host_values(v)?,
            None => Vec::new(),
        };
        l.splice(lo, hi, values)?;
        Ok(())
    }

    pub(crate) fn list_method(&self, l: &List, name: &str, args: &[R::Obj]) -> Result<R::Obj, ProxyError> {
        match name {
            "extend" => {
                arity(name, args, 1, 1)?;
                let values = self.host_values(&args[0])?;
                l.extend(values)?;
                Ok(self.rt.none()?)
            }
            other => Err(ProxyError::Attribute(format!("no method {other}"))),
        }
    }

    // ── Function ──────────────────────────────────────────────────────────────

    pub(crate) fn function_attr(&self, f: &FuncRef, name: &str) -> Result<Option<R::Obj>, ProxyError> {
        match name {
            "name" => Ok(Some(self.rt.str(&f.name)?)),
            _ => Ok(None),
        }
    }

    pub(crate) fn function_call(&self, f: &FuncRef, args: &[R::Obj]) -> Result<R::Obj, ProxyError> {
        let args = args.iter().map(|a| to_host(&self.rt, a)).collect::<Result<Vec<_>, _>>()?;
        let result = {
            let mut services = self.services_mut()?;
            let mut ed = self.editor_mut()?;
            services.call(&mut ed, &f.name, f.arguments(args))?
        };
        self.bound(&result)
    }
}

