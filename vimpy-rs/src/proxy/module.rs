//! `vim.command`, `vim.eval`, `vim.bindeval` and the output streams.
//!
//! Output is line-buffered: text written to `sys.stdout` becomes editor
//! messages one complete line at a time; `sys.stderr` lines become error
//! messages.  Partial lines are flushed when the script returns.

use tracing::debug;

use super::dispatch::{arity, int_arg};
use super::{Builtin, Stream};
use crate::convert::{string_arg, to_foreign, to_foreign_bound};
use crate::error::ProxyError;
use crate::foreign::Runtime;
use crate::host::editor::Editor;
use crate::session::Session;

fn emit(ed: &mut Editor, stream: Stream, line: String) {
    match stream {
        Stream::Out => ed.msg(line),
        Stream::Err => ed.emsg(line),
    }
}

impl<R: Runtime> Session<R> {
    pub(crate) fn builtin_call(&self, builtin: Builtin, args: &[R::Obj]) -> Result<R::Obj, ProxyError> {
        let name = match builtin {
            Builtin::Command => "command",
            Builtin::Eval => "eval",
            Builtin::BindEval => "bindeval",
        };
        arity(name, args, 1, 1)?;
        let text = string_arg(&self.rt, &args[0])?;
        match builtin {
            Builtin::Command => {
                debug!(command = %text, "vim.command");
                self.flush_output();
                self.ex_command(&text).map_err(|e| ProxyError::Host(e.to_string()))?;
                Ok(self.rt.none()?)
            }
            Builtin::Eval | Builtin::BindEval => {
                let value = {
                    let mut services = self.services_mut()?;
                    let mut ed = self.editor_mut()?;
                    services.eval(&mut ed, &text)?
                };
                let obj = if builtin == Builtin::Eval {
                    to_foreign(&self.rt, &value)?
                } else {
                    to_foreign_bound(&self.rt, &value)?
                };
                Ok(obj)
            }
        }
    }

    pub(crate) fn output_attr(&self, name: &str) -> Result<Option<R::Obj>, ProxyError> {
        let obj = match name {
            "softspace" => self.rt.int(self.output.softspace.get())?,
            "encoding" => self.rt.str("utf-8")?,
            "errors" => self.rt.str("strict")?,
            "closed" => self.rt.bool(false)?,
            _ => return Ok(None),
        };
        Ok(Some(obj))
    }

    pub(crate) fn output_setattr(&self, name: &str, value: &R::Obj) -> Result<bool, ProxyError> {
        match name {
            "softspace" => {
                self.output.softspace.set(int_arg(&self.rt, value)?);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub(crate) fn output_method(&self, stream: Stream, name: &str, args: &[R::Obj]) -> Result<R::Obj, ProxyError> {
        match name {
            "write" => {
                arity(name, args, 1, 1)?;
                let text = string_arg(&self.rt, &args[0])?;
                self.write_output(stream, &text);
            }
            "writelines" => {
                arity(name, args, 1, 1)?;
                for item in self.rt.items(&args[0])? {
                    let text = string_arg(&self.rt, &item)?;
                    self.write_output(stream, &text);
                }
            }
            "flush" => {
                arity(name, args, 0, 0)?;
            }
            other => return Err(ProxyError::Attribute(format!("no method {other}"))),
        }
        Ok(self.rt.none()?)
    }

    /// Buffer `text`, emitting every completed line.
    pub(crate) fn write_output(&self, stream: Stream, text: &str) {
        let slot = stream as usize;
        let lines = {
            let mut pending = self.output.pending.borrow_mut();
            pending[slot].push_str(text);
            match pending[slot].rfind('\n') {
                Some(cut) => {
                    let rest = pending[slot].split_off(cut + 1);
                    let done = std::mem::replace(&mut pending[slot], rest);
                    done.lines().map(str::to_owned).collect::<Vec<_>>()
                }
                None => return,
            }
        };
        match self.editor_mut() {
            Ok(mut ed) => lines.into_iter().for_each(|l| emit(&mut ed, stream, l)),
            Err(_) => debug!(dropped = lines.len(), "editor busy; output dropped"),
        }
    }

    /// Emit partial lines left in both stream buffers.
    pub(crate) fn flush_output(&self) {
        let pending = std::mem::take(&mut *self.output.pending.borrow_mut());
        let Ok(mut ed) = self.editor_mut() else {
            return;
        };
        for (stream, text) in [Stream::Out, Stream::Err].into_iter().zip(pending) {
            if !text.is_empty() {
                emit(&mut ed, stream, text);
            }
        }
    }
}
