//! Buffer, range and `current.line` dispatch.
//!
//! Buffers and ranges share one line-span engine: a buffer is the span
//! `1..=line_count`, a range is a fixed start and an end that moves as
//! lines are added or removed through it.

use std::cell::Cell;
use std::rc::Rc;

use super::dispatch::{arity, int_arg};
use super::{ProxyClass, Target};
use crate::convert::{line_from_foreign, line_to_foreign, lines_from_foreign, lines_to_foreign, string_arg};
use crate::error::ProxyError;
use crate::foreign::{Runtime, SliceSpec};
use crate::host::editor::BufferId;
use crate::session::Session;

/// A resolved line span.  `start` and `end` are 1-based and inclusive; an
/// empty span has `end == start - 1`.
#[derive(Debug, Clone)]
pub(crate) struct Span {
    pub(crate) buffer: BufferId,
    pub(crate) start: usize,
    pub(crate) end: usize,
    /// Set for ranges: the shared end to adjust after edits.
    pub(crate) moving_end: Option<Rc<Cell<i64>>>,
}

impl Span {
    pub(crate) fn len(&self) -> usize {
        (self.end + 1).saturating_sub(self.start)
    }

    /// 0-based buffer position of span offset `n`.
    fn absolute(&self, n: usize) -> usize {
        self.start - 1 + n
    }

    fn shift_end(&self, delta: i64) {
        if let Some(end) = &self.moving_end {
            end.set(end.get() + delta);
        }
    }

    fn check(&self, n: isize) -> Result<usize, ProxyError> {
        usize::try_from(n)
            .ok()
            .filter(|&n| n < self.len())
            .ok_or_else(|| ProxyError::Index("line number out of range".into()))
    }
}

impl<R: Runtime> Session<R> {
    pub(crate) fn span(&self, target: &Target) -> Result<Span, ProxyError> {
        let ed = self.editor_ref()?;
        match target {
            Target::Buffer(id) => {
                let buf = ed.buffer(*id).ok_or(ProxyError::Invalid("buffer"))?;
                Ok(Span { buffer: *id, start: 1, end: buf.line_count(), moving_end: None })
            }
            Target::Range { buffer, start, end } => {
                let buf = ed.buffer(*buffer).ok_or(ProxyError::Invalid("buffer"))?;
                let start = (*start).max(1) as usize;
                let stop = end.get().clamp(start as i64 - 1, buf.line_count() as i64) as usize;
                Ok(Span { buffer: *buffer, start, end: stop, moving_end: Some(Rc::clone(end)) })
            }
            _ => Err(ProxyError::Invalid("buffer")),
        }
    }

    fn span_lines(&self, span: &Span, lo: usize, hi: usize) -> Result<Vec<String>, ProxyError> {
        let ed = self.editor_ref()?;
        let buf = ed.buffer(span.buffer).ok_or(ProxyError::Invalid("buffer"))?;
        Ok(buf.lines()[span.absolute(lo)..span.absolute(hi)].to_vec())
    }

    pub(crate) fn span_item(&self, span: &Span, n: isize) -> Result<R::Obj, ProxyError> {
        let n = span.check(n)?;
        let line = self.span_lines(span, n, n + 1)?.remove(0);
        Ok(line_to_foreign(&self.rt, &line)?)
    }

    pub(crate) fn span_slice(&self, span: &Span, spec: &SliceSpec) -> Result<R::Obj, ProxyError> {
        let (lo, hi) = spec
            .contiguous(span.len())
            .ok_or_else(|| ProxyError::Value("slice step must be 1".into()))?;
        let lines = self.span_lines(span, lo, hi)?;
        Ok(lines_to_foreign(&self.rt, &lines)?)
    }

    /// Replace or (with `None`) delete one line of the span.
    pub(crate) fn span_ass_item(&self, span: &Span, n: isize, value: Option<&R::Obj>) -> Result<(), ProxyError> {
        let n = span.check(n)?;
        let at = span.absolute(n);
        match value {
            None => {
                self.host_write()?.replace_lines(span.buffer, at, at + 1, Vec::new())?;
                span.shift_end(-1);
            }
            Some(v) => {
                let line = line_from_foreign(&self.rt, v)?;
                self.host_write()?.replace_lines(span.buffer, at, at + 1, vec![line])?;
            }
        }
        Ok(())
    }

    /// Replace or (with `None`) delete span offsets `lo..hi`.
    pub(crate) fn span_ass_slice(
        &self,
        span: &Span,
        lo: usize,
        hi: usize,
        value: Option<&R::Obj>,
    ) -> Result<(), ProxyError> {
        let lines = match value {
            Some(v) => lines_from_foreign(&self.rt, v)?,
            None => Vec::new(),
        };
        let added = lines.len() as i64;
        self.host_write()?
            .replace_lines(span.buffer, span.absolute(lo), span.absolute(hi), lines)?;
        span.shift_end(added - (hi - lo) as i64);
        Ok(())
    }

    /// `append(lines[, nr])`: insert after span offset `nr` (default: the end).
    fn span_append(&self, span: &Span, args: &[R::Obj]) -> Result<R::Obj, ProxyError> {
        arity("append", args, 1, 2)?;
        let lines = lines_from_foreign(&self.rt, &args[0])?;
        let nr = match args.get(1) {
            Some(n) => int_arg(&self.rt, n)?,
            None => span.len() as i64,
        };
        if nr < 0 || nr > span.len() as i64 {
            return Err(ProxyError::Index("line number out of range".into()));
        }
        let added = lines.len() as i64;
        self.host_write()?
            .insert_lines(span.buffer, span.absolute(nr as usize), lines)?;
        span.shift_end(added);
        Ok(self.rt.none()?)
    }

    pub(crate) fn buffer_attr(&self, id: BufferId, name: &str) -> Result<Option<R::Obj>, ProxyError> {
        let (bufname, vars) = {
            let ed = self.editor_ref()?;
            let buf = ed.buffer(id).ok_or(ProxyError::Invalid("buffer"))?;
            (buf.name.clone(), buf.vars.clone())
        };
        let obj = match name {
            "name" => self.rt.str(&bufname)?,
            "number" => self.rt.int(id as i64)?,
            "vars" => self.wrap(ProxyClass::Dictionary, Target::Dict(vars))?,
            "valid" => self.rt.bool(true)?,
            _ => return Ok(None),
        };
        Ok(Some(obj))
    }

    pub(crate) fn buffer_setattr(&self, id: BufferId, name: &str, value: &R::Obj) -> Result<bool, ProxyError> {
        match name {
            "name" => {
                let new = string_arg(&self.rt, value)?;
                self.host_write()?.rename_buffer(id, &new)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Ranges expose 0-based bounds.
    pub(crate) fn range_attr(
        &self,
        buffer: BufferId,
        start: i64,
        end: i64,
        name: &str,
    ) -> Result<Option<R::Obj>, ProxyError> {
        if self.editor_ref()?.buffer(buffer).is_none() {
            return Err(ProxyError::Invalid("buffer"));
        }
        match name {
            "start" => Ok(Some(self.rt.int(start - 1)?)),
            "end" => Ok(Some(self.rt.int(end - 1)?)),
            _ => Ok(None),
        }
    }

    pub(crate) fn buffer_method(&self, receiver: &Target, name: &str, args: &[R::Obj]) -> Result<R::Obj, ProxyError> {
        let span = self.span(receiver)?;
        match name {
            "append" => self.span_append(&span, args),
            "range" => {
                arity("range", args, 2, 2)?;
                let start = int_arg(&self.rt, &args[0])?;
                let end = int_arg(&self.rt, &args[1])?;
                if start < 1 || end > span.len() as i64 || start > end + 1 {
                    return Err(ProxyError::Index("line number out of range".into()));
                }
                let target = Target::Range { buffer: span.buffer, start, end: Rc::new(Cell::new(end)) };
                self.wrap(ProxyClass::Range, target)
            }
            other => Err(ProxyError::Attribute(format!("no method {other}"))),
        }
    }

    // ── current.line ──────────────────────────────────────────────────────────

    fn cursor_position(&self) -> Result<(BufferId, usize), ProxyError> {
        let ed = self.editor_ref()?;
        Ok((ed.current_buffer(), ed.cursor_line()))
    }

    pub(crate) fn current_line(&self) -> Result<R::Obj, ProxyError> {
        let (buffer, row) = self.cursor_position()?;
        let span = self.span(&Target::Buffer(buffer))?;
        self.span_item(&span, row as isize - 1)
    }

    /// Replace the cursor line, or delete it when `value` is `None`.
    pub(crate) fn set_current_line(&self, value: Option<&R::Obj>) -> Result<(), ProxyError> {
        let (buffer, row) = self.cursor_position()?;
        let span = self.span(&Target::Buffer(buffer))?;
        self.span_ass_item(&span, row as isize - 1, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: usize, end: usize) -> Span {
        Span { buffer: 1, start, end, moving_end: None }
    }

    #[test]
    fn span_lengths() {
        assert_eq!(span(1, 3).len(), 3);
        assert_eq!(span(4, 3).len(), 0);
        assert_eq!(span(2, 2).absolute(0), 1);
    }

    #[test]
    fn span_bounds() {
        let s = span(2, 4);
        assert_eq!(s.check(0).unwrap(), 0);
        assert_eq!(s.check(2).unwrap(), 2);
        assert!(s.check(3).is_err());
        assert!(s.check(-1).is_err());
    }

    #[test]
    fn moving_end_is_shared() {
        let end = Rc::new(Cell::new(5));
        let s = Span { buffer: 1, start: 2, end: 5, moving_end: Some(Rc::clone(&end)) };
        s.shift_end(-2);
        assert_eq!(end.get(), 3);
    }
}
