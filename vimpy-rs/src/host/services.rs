//! Host command / expression services.
//!
//! [`HostServices`] is the seam through which the bridge reaches the host's
//! own command interpreter and expression evaluator.  [`BasicServices`] is a
//! small self-contained implementation used by the `vimpy` binary and the
//! tests:
//!
//! | Command                 | Effect                                     |
//! |-------------------------|--------------------------------------------|
//! | `echo {expr}…`          | message with the echo form of each value   |
//! | `echoerr {expr}`        | error message                              |
//! | `let {var} = {expr}`    | assign `g:`/`b:`/`w:`/`t:`/`v:` variable   |
//! | `unlet {var}`           | remove a variable                          |
//! | `call {f}({args})`      | call a function, discard the result        |
//! | `new` / `split`         | split the current window                   |
//! | `close`                 | close the current window                   |
//! | `tabnew` / `tabclose`   | open / close a tab page                    |
//! | `b[uffer] {N}`          | show buffer N in the current window        |
//! | `bw[ipeout] [N]`        | wipe out buffer N (default current)        |
//!
//! Expressions support numbers, floats, `'single'`/`"double"` strings,
//! `[lists]`, `{'dicts': 1}`, scoped variables, function calls, `+ - * /`
//! arithmetic and `.` concatenation.

use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use super::editor::Editor;
use super::value::{Dict, FuncRef, List, Value};

/// Failure reported by the host interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(msg: impl Into<String>) -> Self {
        HostError(msg.into())
    }
}

/// Access to the host's command and expression interpreter.
pub trait HostServices {
    /// Execute one ex command line.
    fn command(&mut self, editor: &mut Editor, cmd: &str) -> Result<(), HostError>;
    /// Evaluate an expression.
    fn eval(&mut self, editor: &mut Editor, expr: &str) -> Result<Value, HostError>;
    /// Call a function by name.
    fn call(&mut self, editor: &mut Editor, name: &str, args: Vec<Value>) -> Result<Value, HostError>;
}

/// A user-defined host function.
pub type UserFn = Rc<dyn Fn(&mut Editor, Vec<Value>) -> Result<Value, HostError>>;

/// Minimal host interpreter.
#[derive(Default)]
pub struct BasicServices {
    functions: HashMap<String, UserFn>,
}

impl BasicServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user function callable from expressions and funcrefs.
    pub fn define<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&mut Editor, Vec<Value>) -> Result<Value, HostError> + 'static,
    {
        self.functions.insert(name.to_owned(), Rc::new(f));
    }
}

impl HostServices for BasicServices {
    fn command(&mut self, editor: &mut Editor, cmd: &str) -> Result<(), HostError> {
        let cmd = cmd.trim_start_matches([' ', '\t', ':']).trim_end();
        if cmd.is_empty() || cmd.starts_with('"') {
            return Ok(());
        }
        let (name, rest) = match cmd.find(|c: char| !c.is_ascii_alphabetic()) {
            Some(i) => (&cmd[..i], cmd[i..].trim()),
            None => (cmd, ""),
        };
        match name {
            "echo" | "echom" | "echomsg" => {
                let mut p = Parser::new(rest, editor, self);
                let mut parts = Vec::new();
                while !p.at_end() {
                    parts.push(p.expr()?.to_echo());
                }
                editor.msg(parts.join(" "));
                Ok(())
            }
            "echoe" | "echoerr" => {
                let v = self.eval(editor, rest)?;
                editor.emsg(v.to_echo());
                Ok(())
            }
            "let" => {
                let (var, expr) = rest
                    .split_once('=')
                    .ok_or_else(|| HostError::new(format!("E15: Invalid expression: \"{rest}\"")))?;
                let value = self.eval(editor, expr)?;
                let (dict, key) = scope_dict(editor, var.trim())?;
                dict.insert(key, value).map_err(|e| HostError::new(format!("E741: {e}")))?;
                Ok(())
            }
            "unl" | "unlet" => {
                let (dict, key) = scope_dict(editor, rest)?;
                match dict.remove(&key) {
                    Ok(Some(_)) => Ok(()),
                    Ok(None) => Err(HostError::new(format!("E108: No such variable: \"{rest}\""))),
                    Err(e) => Err(HostError::new(format!("E741: {e}"))),
                }
            }
            "cal" | "call" => {
                self.eval(editor, rest)?;
                Ok(())
            }
            "new" => {
                let b = editor.add_buffer("", Vec::new());
                editor.split_window(b).map(|_| ()).map_err(host_err)
            }
            "sp" | "split" => {
                let b = editor.current_buffer();
                editor.split_window(b).map(|_| ()).map_err(host_err)
            }
            "clo" | "close" => {
                let w = editor.current_window();
                editor.close_window(w).map_err(host_err)
            }
            "tabnew" => {
                let b = editor.add_buffer("", Vec::new());
                editor.new_tab(b).map(|_| ()).map_err(host_err)
            }
            "tabc" | "tabclose" => {
                let t = editor.current_tab();
                editor.close_tab(t).map_err(host_err)
            }
            "b" | "buffer" => {
                let n = parse_number(rest)?;
                editor.set_current_buffer(n).map_err(host_err)
            }
            "bw" | "bwipe" | "bwipeout" => {
                let n = if rest.is_empty() { editor.current_buffer() } else { parse_number(rest)? };
                editor.wipe_buffer(n).map_err(host_err)
            }
            _ => Err(HostError::new(format!("E492: Not an editor command: {cmd}"))),
        }
    }

    fn eval(&mut self, editor: &mut Editor, expr: &str) -> Result<Value, HostError> {
        let mut p = Parser::new(expr, editor, self);
        let v = p.expr()?;
        if !p.at_end() {
            return Err(HostError::new(format!("E488: Trailing characters: {}", p.rest())));
        }
        Ok(v)
    }

    fn call(&mut self, editor: &mut Editor, name: &str, args: Vec<Value>) -> Result<Value, HostError> {
        if let Some(f) = self.functions.get(name).cloned() {
            return f(editor, args);
        }
        builtin(name, args)
    }
}

fn host_err(e: super::editor::EditorError) -> HostError {
    HostError(e.to_string())
}

fn parse_number(s: &str) -> Result<u32, HostError> {
    s.trim().parse().map_err(|_| HostError::new(format!("E86: Buffer {s} does not exist")))
}

/// Resolve `g:x`, `b:x`, `w:x`, `t:x`, `v:x` or bare `x` to its dictionary.
fn scope_dict(editor: &Editor, var: &str) -> Result<(Dict, String), HostError> {
    let (scope, name) = match var.split_once(':') {
        Some((s, n)) if s.len() == 1 => (s, n),
        _ => ("g", var),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(HostError::new(format!("E461: Illegal variable name: {var}")));
    }
    let dict = match scope {
        "g" => editor.globals().clone(),
        "v" => editor.vimvars().clone(),
        "b" => editor
            .buffer(editor.current_buffer())
            .map(|b| b.vars.clone())
            .ok_or_else(|| HostError::new("no current buffer"))?,
        "w" => editor
            .window(editor.current_window())
            .map(|w| w.vars.clone())
            .ok_or_else(|| HostError::new("no current window"))?,
        "t" => editor
            .tab(editor.current_tab())
            .map(|t| t.vars.clone())
            .ok_or_else(|| HostError::new("no current tab page"))?,
        _ => return Err(HostError::new(format!("E461: Illegal variable name: {var}"))),
    };
    Ok((dict, name.to_owned()))
}

fn builtin(name: &str, args: Vec<Value>) -> Result<Value, HostError> {
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(HostError::new(format!("E118: Wrong number of arguments for function: {name}")))
        }
    };
    match name {
        "len" => {
            arity(1)?;
            Ok(Value::Number(match &args[0] {
                Value::Str(s) => s.len() as i64,
                Value::List(l) => l.len() as i64,
                Value::Dict(d) => d.len() as i64,
                Value::Number(n) => n.to_string().len() as i64,
                other => return Err(HostError::new(format!("E701: Invalid type for len(): {}", other.type_name()))),
            }))
        }
        "function" => {
            if args.is_empty() {
                return Err(HostError::new("E119: Not enough arguments for function: function"));
            }
            let mut it = args.into_iter();
            let fname = match it.next() {
                Some(Value::Str(s)) => s,
                _ => return Err(HostError::new("E129: Function name required")),
            };
            let partial = match it.next() {
                Some(Value::List(l)) => l.items(),
                Some(_) => return Err(HostError::new("E923: Second argument of function() must be a list")),
                None => Vec::new(),
            };
            Ok(Value::Func(FuncRef { name: fname, partial }))
        }
        "add" => {
            arity(2)?;
            match &args[0] {
                Value::List(l) => {
                    l.push(args[1].clone()).map_err(|e| HostError::new(format!("E741: {e}")))?;
                    Ok(args[0].clone())
                }
                _ => Err(HostError::new("E897: List required")),
            }
        }
        "get" => match (args.first(), args.get(1)) {
            (Some(Value::Dict(d)), Some(key)) => {
                Ok(d.get(&key.to_echo()).unwrap_or_else(|| args.get(2).cloned().unwrap_or(Value::Number(0))))
            }
            (Some(Value::List(l)), Some(Value::Number(i))) => Ok(usize::try_from(*i)
                .ok()
                .and_then(|i| l.get(i))
                .unwrap_or_else(|| args.get(2).cloned().unwrap_or(Value::Number(0)))),
            _ => Err(HostError::new("E896: Argument of get() must be a List or Dictionary")),
        },
        "keys" => {
            arity(1)?;
            match &args[0] {
                Value::Dict(d) => Ok(Value::List(List::from_vec(d.keys().into_iter().map(Value::Str).collect()))),
                _ => Err(HostError::new("E715: Dictionary required")),
            }
        }
        "string" => {
            arity(1)?;
            Ok(Value::Str(args[0].to_string()))
        }
        "toupper" => {
            arity(1)?;
            Ok(Value::Str(args[0].to_echo().to_uppercase()))
        }
        "range" => {
            arity(1)?;
            let n = args[0].as_number().unwrap_or(0);
            Ok(Value::List(List::from_vec((0..n).map(Value::Number).collect())))
        }
        "type" => {
            arity(1)?;
            Ok(Value::Number(match &args[0] {
                Value::Number(_) => 0,
                Value::Str(_) => 1,
                Value::Func(_) => 2,
                Value::List(_) => 3,
                Value::Dict(_) => 4,
                Value::Float(_) => 5,
                Value::None => 7,
            }))
        }
        _ => Err(HostError::new(format!("E117: Unknown function: {name}"))),
    }
}

// ── Expression parser ─────────────────────────────────────────────────────────

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    editor: &'a mut Editor,
    services: &'a mut BasicServices,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, editor: &'a mut Editor, services: &'a mut BasicServices) -> Self {
        Parser { src, pos: 0, editor, services }
    }

    fn rest(&self) -> &str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.pos >= self.src.len()
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.rest().chars().next()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), HostError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(HostError::new(format!("E15: Invalid expression: \"{}\"", self.src)))
        }
    }

    fn expr(&mut self) -> Result<Value, HostError> {
        let mut lhs = self.term()?;
        loop {
            match self.peek() {
                Some('+') => {
                    self.pos += 1;
                    let rhs = self.term()?;
                    lhs = arith(lhs, rhs, '+')?;
                }
                Some('-') => {
                    self.pos += 1;
                    let rhs = self.term()?;
                    lhs = arith(lhs, rhs, '-')?;
                }
                Some('.') => {
                    self.pos += 1;
                    if self.rest().starts_with('.') {
                        self.pos += 1;
                    }
                    let rhs = self.term()?;
                    lhs = Value::Str(lhs.to_echo() + &rhs.to_echo());
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn term(&mut self) -> Result<Value, HostError> {
        let mut lhs = self.factor()?;
        loop {
            match self.peek() {
                Some(op @ ('*' | '/' | '%')) => {
                    self.pos += 1;
                    let rhs = self.factor()?;
                    lhs = arith(lhs, rhs, op)?;
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn factor(&mut self) -> Result<Value, HostError> {
        match self.peek() {
            None => Err(HostError::new("E15: Invalid expression: \"\"")),
            Some('-') => {
                self.pos += 1;
                let v = self.factor()?;
                arith(Value::Number(0), v, '-')
            }
            Some('(') => {
                self.pos += 1;
                let v = self.expr()?;
                self.expect(')')?;
                Ok(v)
            }
            Some('\'') => self.single_quoted(),
            Some('"') => self.double_quoted(),
            Some('[') => {
                self.pos += 1;
                let mut items = Vec::new();
                while !self.eat(']') {
                    items.push(self.expr()?);
                    if !self.eat(',') {
                        self.expect(']')?;
                        break;
                    }
                }
                Ok(Value::List(List::from_vec(items)))
            }
            Some('{') => {
                self.pos += 1;
                let dict = Dict::new();
                while !self.eat('}') {
                    let key = self.expr()?.to_echo();
                    self.expect(':')?;
                    let value = self.expr()?;
                    dict.insert(key, value).map_err(|e| HostError::new(e.to_string()))?;
                    if !self.eat(',') {
                        self.expect('}')?;
                        break;
                    }
                }
                Ok(Value::Dict(dict))
            }
            Some(c) if c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() || c == '_' => self.name(),
            Some(_) => Err(HostError::new(format!("E15: Invalid expression: \"{}\"", self.src))),
        }
    }

    fn number(&mut self) -> Result<Value, HostError> {
        let text = {
            let rest = self.rest();
            let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
            let mut text = &rest[..end];
            // `1.x` is concatenation, not a float.
            if let Some(dot) = text.find('.') {
                if !text[dot + 1..].starts_with(|c: char| c.is_ascii_digit()) {
                    text = &text[..dot];
                }
            }
            text.to_owned()
        };
        self.pos += text.len();
        if text.contains('.') {
            text.parse().map(Value::Float).map_err(|_| HostError::new(format!("E15: Invalid expression: \"{text}\"")))
        } else {
            text.parse().map(Value::Number).map_err(|_| HostError::new(format!("E15: Invalid expression: \"{text}\"")))
        }
    }

    fn single_quoted(&mut self) -> Result<Value, HostError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.rest().chars().next() else {
                return Err(HostError::new(format!("E115: Missing quote: {}", self.src)));
            };
            self.pos += c.len_utf8();
            if c == '\'' {
                if self.rest().starts_with('\'') {
                    self.pos += 1;
                    out.push('\'');
                    continue;
                }
                return Ok(Value::Str(out));
            }
            out.push(c);
        }
    }

    fn double_quoted(&mut self) -> Result<Value, HostError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.rest().chars().next() else {
                return Err(HostError::new(format!("E114: Missing quote: {}", self.src)));
            };
            self.pos += c.len_utf8();
            match c {
                '"' => return Ok(Value::Str(out)),
                '\\' => {
                    let Some(e) = self.rest().chars().next() else { continue };
                    self.pos += e.len_utf8();
                    out.push(match e {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        other => other,
                    });
                }
                other => out.push(other),
            }
        }
    }

    fn name(&mut self) -> Result<Value, HostError> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == ':' || c == '#'))
            .unwrap_or(rest.len());
        let name = rest[..end].to_owned();
        self.pos += end;
        if self.eat('(') {
            let mut args = Vec::new();
            while !self.eat(')') {
                args.push(self.expr()?);
                if !self.eat(',') {
                    self.expect(')')?;
                    break;
                }
            }
            return self.services.call(self.editor, &name, args);
        }
        let (dict, key) = scope_dict(self.editor, &name)?;
        dict.get(&key)
            .ok_or_else(|| HostError::new(format!("E121: Undefined variable: {name}")))
    }
}

fn arith(lhs: Value, rhs: Value, op: char) -> Result<Value, HostError> {
    match (&lhs, &rhs) {
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            let a = as_float(&lhs)?;
            let b = as_float(&rhs)?;
            Ok(Value::Float(match op {
                '+' => a + b,
                '-' => a - b,
                '*' => a * b,
                '/' => a / b,
                _ => return Err(HostError::new("E804: Cannot use '%' with Float")),
            }))
        }
        (Value::List(a), Value::List(b)) if op == '+' => {
            let mut items = a.items();
            items.extend(b.items());
            Ok(Value::List(List::from_vec(items)))
        }
        _ => {
            let a = lhs.as_number().ok_or_else(|| type_err(&lhs))?;
            let b = rhs.as_number().ok_or_else(|| type_err(&rhs))?;
            Ok(Value::Number(match op {
                '+' => a.wrapping_add(b),
                '-' => a.wrapping_sub(b),
                '*' => a.wrapping_mul(b),
                '/' if b == 0 => 0,
                '/' => a / b,
                '%' if b == 0 => 0,
                _ => a % b,
            }))
        }
    }
}

fn as_float(v: &Value) -> Result<f64, HostError> {
    match v {
        Value::Float(x) => Ok(*x),
        Value::Number(n) => Ok(*n as f64),
        other => Err(type_err(other)),
    }
}

fn type_err(v: &Value) -> HostError {
    HostError::new(format!("E745: Using a {} as a Number", v.type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Result<Value, HostError> {
        let mut ed = Editor::new();
        BasicServices::new().eval(&mut ed, src)
    }

    #[test]
    fn arithmetic_and_concat() {
        assert_eq!(eval("1 + 2 * 3"), Ok(Value::Number(7)));
        assert_eq!(eval("(1 + 2) * 3"), Ok(Value::Number(9)));
        assert_eq!(eval("1.5 + 1"), Ok(Value::Float(2.5)));
        assert_eq!(eval("'a' . 'b'"), Ok(Value::from("ab")));
        assert_eq!(eval("-4"), Ok(Value::Number(-4)));
    }

    #[test]
    fn number_literals() {
        assert_eq!(eval("42"), Ok(Value::Number(42)));
        assert_eq!(eval("3.25"), Ok(Value::Float(3.25)));
        assert_eq!(eval("12.'x'"), Ok(Value::from("12x")));
        assert_eq!(eval("7..'y'"), Ok(Value::from("7y")));
    }

    #[test]
    fn string_literals() {
        assert_eq!(eval("'it''s'"), Ok(Value::from("it's")));
        assert_eq!(eval("\"a\\nb\""), Ok(Value::from("a\nb")));
        assert!(eval("'open").is_err());
    }

    #[test]
    fn containers() {
        let v = eval("[1, 'two', [3]]").unwrap();
        let Value::List(l) = v else { panic!("expected list") };
        assert_eq!(l.len(), 3);
        let v = eval("{'a': 1, 'b': [2]}").unwrap();
        let Value::Dict(d) = v else { panic!("expected dict") };
        assert_eq!(d.get("a"), Some(Value::Number(1)));
    }

    #[test]
    fn let_and_lookup() {
        let mut ed = Editor::new();
        let mut s = BasicServices::new();
        s.command(&mut ed, "let g:answer = 40 + 2").unwrap();
        assert_eq!(s.eval(&mut ed, "g:answer"), Ok(Value::Number(42)));
        assert_eq!(s.eval(&mut ed, "answer"), Ok(Value::Number(42)));
        s.command(&mut ed, "unlet g:answer").unwrap();
        assert!(s.eval(&mut ed, "g:answer").is_err());
    }

    #[test]
    fn echo_writes_message() {
        let mut ed = Editor::new();
        let mut s = BasicServices::new();
        s.command(&mut ed, "echo 'hi' 1+1").unwrap();
        assert_eq!(ed.take_messages(), vec![crate::host::editor::Message::Info("hi 2".into())]);
    }

    #[test]
    fn user_function_and_funcref() {
        let mut ed = Editor::new();
        let mut s = BasicServices::new();
        s.define("Double", |_, args| Ok(Value::Number(args[0].as_number().unwrap_or(0) * 2)));
        assert_eq!(s.eval(&mut ed, "Double(21)"), Ok(Value::Number(42)));
        let f = s.eval(&mut ed, "function('Double', [4])").unwrap();
        assert_eq!(f, Value::Func(FuncRef { name: "Double".into(), partial: vec![Value::Number(4)] }));
    }

    #[test]
    fn add_mutates_in_place() {
        let mut ed = Editor::new();
        let mut s = BasicServices::new();
        s.command(&mut ed, "let g:l = [1]").unwrap();
        s.command(&mut ed, "call add(g:l, 2)").unwrap();
        assert_eq!(s.eval(&mut ed, "len(g:l)"), Ok(Value::Number(2)));
    }

    #[test]
    fn window_commands() {
        let mut ed = Editor::new();
        let mut s = BasicServices::new();
        s.command(&mut ed, "new").unwrap();
        assert_eq!(ed.buffer_ids().len(), 2);
        s.command(&mut ed, "close").unwrap();
        s.command(&mut ed, "tabnew").unwrap();
        assert_eq!(ed.tabs().len(), 2);
        s.command(&mut ed, "tabclose").unwrap();
        assert_eq!(ed.tabs().len(), 1);
        assert!(s.command(&mut ed, "frobnicate").is_err());
    }
}
