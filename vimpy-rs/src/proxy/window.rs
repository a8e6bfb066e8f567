//! Window, tab page, buffer map and `vim.current` dispatch.

use std::cell::Cell;
use std::rc::Rc;

use super::dispatch::int_arg;
use super::{ProxyClass, Target};
use crate::error::ProxyError;
use crate::foreign::{Inspect, Runtime};
use crate::host::editor::{TabId, WindowId};
use crate::session::Session;

impl<R: Runtime> Session<R> {
    /// Windows of `tab`, or of the current tab page.
    pub(crate) fn tab_windows(&self, tab: Option<TabId>) -> Result<Vec<WindowId>, ProxyError> {
        let ed = self.editor_ref()?;
        let tab = tab.unwrap_or_else(|| ed.current_tab());
        let page = ed.tab(tab).ok_or(ProxyError::Invalid("tab page"))?;
        Ok(page.windows.clone())
    }

    /// `vim.buffers[nr]`: lookup by buffer number.
    pub(crate) fn buffer_by_number(&self, key: &R::Obj) -> Result<R::Obj, ProxyError> {
        let nr = match self.rt.inspect(key)? {
            Inspect::Int(n) => n,
            _ => return Err(ProxyError::Type("key must be an integer".into())),
        };
        let exists = {
            let ed = self.editor_ref()?;
            u32::try_from(nr).ok().filter(|&id| ed.buffer(id).is_some())
        };
        match exists {
            Some(id) => self.buffer_obj(id),
            None => Err(ProxyError::Key(nr.to_string())),
        }
    }

    pub(crate) fn window_attr(&self, id: WindowId, name: &str) -> Result<Option<R::Obj>, ProxyError> {
        let (win, number, tab) = {
            let ed = self.editor_ref()?;
            let win = ed.window(id).ok_or(ProxyError::Invalid("window"))?.clone();
            (win, ed.window_number(id).unwrap_or(0), ed.window_tab(id))
        };
        let rt = &self.rt;
        let obj = match name {
            "buffer" => self.buffer_obj(win.buffer)?,
            "cursor" => rt.tuple(vec![rt.int(win.cursor.0 as i64)?, rt.int(win.cursor.1 as i64)?])?,
            "height" => rt.int(win.height as i64)?,
            "width" => rt.int(win.width as i64)?,
            "vars" => self.wrap(ProxyClass::Dictionary, Target::Dict(win.vars))?,
            "number" => rt.int(number as i64)?,
            "tabpage" => match tab {
                Some(tab) => self.tabpage_obj(tab)?,
                None => return Err(ProxyError::Invalid("tab page")),
            },
            "valid" => rt.bool(true)?,
            _ => return Ok(None),
        };
        Ok(Some(obj))
    }

    pub(crate) fn window_setattr(&self, id: WindowId, name: &str, value: &R::Obj) -> Result<bool, ProxyError> {
        match name {
            "cursor" => {
                let parts = match self.rt.inspect(value)? {
                    Inspect::List | Inspect::Tuple => self.rt.items(value)?,
                    _ => return Err(ProxyError::Type("cursor must be a (row, col) tuple".into())),
                };
                let [row, col] = parts.as_slice() else {
                    return Err(ProxyError::Type("cursor must be a (row, col) tuple".into()));
                };
                let row = int_arg(&self.rt, row)?;
                let col = int_arg(&self.rt, col)?.max(0) as usize;
                let row = usize::try_from(row).map_err(|_| ProxyError::Host("cursor position outside buffer".into()))?;
                self.host_write()?.set_cursor(id, row, col)?;
                Ok(true)
            }
            "height" | "width" => {
                let n = int_arg(&self.rt, value)?;
                let n = usize::try_from(n).map_err(|_| ProxyError::Value(format!("{name} must not be negative")))?;
                let mut ed = self.host_write()?;
                let win = ed.window_mut(id)?;
                if name == "height" {
                    win.height = n;
                } else {
                    win.width = n;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub(crate) fn tabpage_attr(&self, id: TabId, name: &str) -> Result<Option<R::Obj>, ProxyError> {
        let (current, number, vars) = {
            let ed = self.editor_ref()?;
            let tab = ed.tab(id).ok_or(ProxyError::Invalid("tab page"))?;
            (tab.current, ed.tab_number(id).unwrap_or(0), tab.vars.clone())
        };
        let obj = match name {
            "windows" => self.wrap(ProxyClass::WindowList, Target::WindowList(Some(id)))?,
            "window" => self.window_obj(current)?,
            "number" => self.rt.int(number as i64)?,
            "vars" => self.wrap(ProxyClass::Dictionary, Target::Dict(vars))?,
            "valid" => self.rt.bool(true)?,
            _ => return Ok(None),
        };
        Ok(Some(obj))
    }

    pub(crate) fn current_attr(&self, name: &str) -> Result<Option<R::Obj>, ProxyError> {
        let (buffer, window, tab) = {
            let ed = self.editor_ref()?;
            (ed.current_buffer(), ed.current_window(), ed.current_tab())
        };
        let obj = match name {
            "buffer" => self.buffer_obj(buffer)?,
            "window" => self.window_obj(window)?,
            "tabpage" => self.tabpage_obj(tab)?,
            "line" => self.current_line()?,
            "range" => {
                let (start, end) = self.range.get();
                let target = Target::Range { buffer, start: start as i64, end: Rc::new(Cell::new(end as i64)) };
                self.wrap(ProxyClass::Range, target)?
            }
            _ => return Ok(None),
        };
        Ok(Some(obj))
    }

    /// Assignments to `vim.current`.  Only `line` may be deleted.
    pub(crate) fn current_setattr(&self, name: &str, value: Option<&R::Obj>) -> Result<bool, ProxyError> {
        if name == "line" {
            self.set_current_line(value)?;
            return Ok(true);
        }
        if !matches!(name, "buffer" | "window" | "tabpage") {
            return Ok(false);
        }
        let Some(value) = value else {
            return Err(ProxyError::Type("can't delete attribute".into()));
        };
        let target = match self.rt.inspect(value)? {
            Inspect::Proxy(p) => p.target(),
            _ => return Err(ProxyError::Type(format!("expected vim.{name} object"))),
        };
        match (name, target) {
            ("buffer", Target::Buffer(id)) => self.host_write()?.set_current_buffer(id)?,
            ("window", Target::Window(id)) => self.host_write()?.set_current_window(id)?,
            ("tabpage", Target::TabPage(id)) => self.host_write()?.set_current_tab(id)?,
            (_, Target::Invalid) => {
                return Err(ProxyError::Invalid(match name {
                    "window" => "window",
                    "tabpage" => "tab page",
                    _ => "buffer",
                }))
            }
            _ => return Err(ProxyError::Type(format!("expected vim.{name} object"))),
        }
        Ok(true)
    }
}
