//! Ex command front end: `:python`, `:pyfile`, `:pyeval`.
//!
//! A command line is an optional line range, a command name (which may be
//! abbreviated down to its minimum prefix) and an argument.  Commands that
//! are not interpreter commands go to the host's own command interpreter.
//!
//! ```text
//! :python print(1)             run one statement on the cursor line
//! :%py for l in vim.current.range: ...
//! :python << EOF               heredoc, up to a line reading EOF
//! :pyfile ~/script.py          run a file
//! :pyeval 6 * 7                evaluate and echo
//! ```

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{BridgeError, ParseError};
use crate::foreign::Runtime;
use crate::host::editor::Editor;
use crate::host::services::HostError;
use crate::session::Session;

/// Longest escaped file name `:pyfile` accepts.
pub const MAX_FILE_NAME: usize = 1024;

const EX_PATTERN: &str = r"^[\s:]*(?P<range>%|(?:\d+|[.$])(?:\s*,\s*(?:\d+|[.$]))?)?\s*(?P<cmd>[A-Za-z][A-Za-z0-9]*)(?P<rest>.*)$";

fn ex_regex() -> Result<&'static Regex, ParseError> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(EX_PATTERN))
        .as_ref()
        .map_err(|e| ParseError::Pattern(e.to_string()))
}

/// One end of a line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    Line(usize),
    /// `.`
    Cursor,
    /// `$`
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRange {
    /// `%`
    Whole,
    Single(Address),
    Pair(Address, Address),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExKind {
    Python,
    PyFile,
    PyEval,
    /// Anything else: handed to the host unchanged.
    Host,
}

/// A split command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExLine {
    pub range: Option<LineRange>,
    pub kind: ExKind,
    pub arg: String,
    /// The full original line.
    pub text: String,
}

impl ExLine {
    /// Heredoc end marker for `:python << MARK` (`.` when none is given).
    pub fn heredoc_marker(&self) -> Option<&str> {
        if self.kind != ExKind::Python {
            return None;
        }
        let rest = self.arg.strip_prefix("<<")?.trim();
        Some(if rest.is_empty() { "." } else { rest })
    }
}

/// `word` is an abbreviation of `full` at least `min` characters long.
fn abbrev(word: &str, full: &str, min: usize) -> bool {
    word.len() >= min && full.starts_with(word)
}

fn classify(word: &str) -> ExKind {
    if abbrev(word, "python", 2) || word == "py3" || abbrev(word, "python3", 7) {
        ExKind::Python
    } else if abbrev(word, "pyfile", 3) || abbrev(word, "py3file", 4) {
        ExKind::PyFile
    } else if abbrev(word, "pyeval", 3) || abbrev(word, "py3eval", 4) {
        ExKind::PyEval
    } else {
        ExKind::Host
    }
}

fn address(s: &str) -> Result<Address, ParseError> {
    match s.trim() {
        "." => Ok(Address::Cursor),
        "$" => Ok(Address::Last),
        n => n.parse().map(Address::Line).map_err(|_| ParseError::InvalidRange),
    }
}

/// Split a command line.
pub fn parse_ex(line: &str) -> Result<ExLine, ParseError> {
    let caps = ex_regex()?
        .captures(line)
        .ok_or_else(|| ParseError::NotACommand(line.trim().to_owned()))?;
    let range = match caps.name("range").map(|m| m.as_str()) {
        None => None,
        Some("%") => Some(LineRange::Whole),
        Some(r) => Some(match r.split_once(',') {
            Some((a, b)) => LineRange::Pair(address(a)?, address(b)?),
            None => LineRange::Single(address(r)?),
        }),
    };
    let word = caps.name("cmd").map_or("", |m| m.as_str());
    let rest = caps.name("rest").map_or("", |m| m.as_str());
    Ok(ExLine {
        range,
        kind: classify(word),
        arg: rest.trim().to_owned(),
        text: line.to_owned(),
    })
}

/// Resolve a range against the current buffer and cursor.
pub fn resolve_range(range: LineRange, editor: &Editor) -> Result<(usize, usize), ParseError> {
    let cursor = editor.cursor_line();
    let last = editor.buffer(editor.current_buffer()).map_or(1, |b| b.line_count());
    let line = |a: Address| match a {
        Address::Line(n) => n,
        Address::Cursor => cursor,
        Address::Last => last,
    };
    let (start, end) = match range {
        LineRange::Whole => (1, last),
        LineRange::Single(a) => (line(a), line(a)),
        LineRange::Pair(a, b) => (line(a), line(b)),
    };
    if start == 0 || end > last || start > end {
        return Err(ParseError::InvalidRange);
    }
    Ok((start, end))
}

/// The statement `:pyfile` runs for `path`.
pub fn file_loader(path: &str) -> Result<String, BridgeError> {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '\\' || c == '\'' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    if escaped.len() >= MAX_FILE_NAME {
        return Err(BridgeError::PathTooLong(path.to_owned()));
    }
    Ok(format!("exec(compile(open('{escaped}').read(), '{escaped}', 'exec'))"))
}

/// A command ready to run: a parsed line and, for heredocs, the script body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExInput {
    pub line: ExLine,
    pub body: Option<String>,
}

/// Groups script lines into commands, collecting heredoc bodies.
#[derive(Debug, Default)]
pub struct ScriptReader {
    heredoc: Option<(ExLine, String, Vec<String>)>,
}

impl ScriptReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a heredoc body is being collected.
    pub fn in_heredoc(&self) -> bool {
        self.heredoc.is_some()
    }

    /// Feed one line; returns a command once one is complete.
    pub fn push(&mut self, line: &str) -> Result<Option<ExInput>, ParseError> {
        if let Some((_, marker, body)) = &mut self.heredoc {
            if line.trim_end() != marker.as_str() {
                body.push(line.to_owned());
                return Ok(None);
            }
            return Ok(self.finish());
        }
        if line.trim().is_empty() || line.trim_start().starts_with('"') {
            return Ok(None);
        }
        let parsed = parse_ex(line)?;
        if let Some(marker) = parsed.heredoc_marker() {
            let marker = marker.to_owned();
            self.heredoc = Some((parsed, marker, Vec::new()));
            return Ok(None);
        }
        Ok(Some(ExInput { line: parsed, body: None }))
    }

    /// End of input: an unterminated heredoc runs with what was collected.
    pub fn finish(&mut self) -> Option<ExInput> {
        self.heredoc
            .take()
            .map(|(line, _, body)| ExInput { line, body: Some(body.join("\n")) })
    }
}

impl<R: Runtime> Session<R> {
    /// Run one command line.
    pub fn ex_command(&self, line: &str) -> Result<(), BridgeError> {
        let parsed = parse_ex(line)?;
        let body = parsed.heredoc_marker().map(|_| String::new());
        self.run_input(&ExInput { line: parsed, body })
    }

    /// Run a multi-line script.  Failing commands are reported and the
    /// rest still run; returns how many failed.
    pub fn source(&self, script: &str) -> usize {
        let mut reader = ScriptReader::new();
        let mut failed = 0;
        let mut run = |input: Result<Option<ExInput>, ParseError>| {
            let outcome = match input {
                Ok(Some(input)) => self.run_input(&input),
                Ok(None) => Ok(()),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = outcome {
                self.report(&e);
                failed += 1;
            }
        };
        for line in script.lines() {
            run(reader.push(line));
        }
        run(Ok(reader.finish()));
        failed
    }

    pub fn run_input(&self, input: &ExInput) -> Result<(), BridgeError> {
        let line = &input.line;
        let range = match line.range {
            Some(r) => {
                let ed = self.editor.try_borrow().map_err(|_| HostError::new("editor is busy"))?;
                Some(resolve_range(r, &ed)?)
            }
            None => None,
        };
        match line.kind {
            ExKind::Python => {
                let code = input.body.as_deref().unwrap_or(&line.arg);
                debug!(?range, len = code.len(), "python command");
                self.execute(code, range)
            }
            ExKind::PyFile => self.run_file(Path::new(&line.arg), range),
            ExKind::PyEval => {
                let value = self.evaluate(&line.arg)?;
                let mut ed = self.editor.try_borrow_mut().map_err(|_| HostError::new("editor is busy"))?;
                ed.msg(value.to_echo());
                Ok(())
            }
            ExKind::Host => self.host_command(&line.text),
        }
    }

    /// Run a script file in the interpreter's main namespace.
    pub fn run_file(&self, path: &Path, range: Option<(usize, usize)>) -> Result<(), BridgeError> {
        let name = path.to_string_lossy();
        if name.is_empty() {
            return Err(ParseError::ArgumentRequired.into());
        }
        let code = file_loader(&name)?;
        self.execute(&code, range)
    }

    fn host_command(&self, line: &str) -> Result<(), BridgeError> {
        let mut services = self.services_mut().map_err(|e| HostError::new(e.to_string()))?;
        let mut ed = self.editor_mut().map_err(|e| HostError::new(e.to_string()))?;
        services.command(&mut ed, line.trim_start_matches([' ', '\t', ':'])).map_err(|e| {
            warn!(command = line, error = %e, "host command failed");
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_abbreviations() {
        assert_eq!(parse_ex("py print(1)").unwrap().kind, ExKind::Python);
        assert_eq!(parse_ex("pyth x").unwrap().kind, ExKind::Python);
        assert_eq!(parse_ex("python3 x").unwrap().kind, ExKind::Python);
        assert_eq!(parse_ex("pyf a.py").unwrap().kind, ExKind::PyFile);
        assert_eq!(parse_ex("pyeval 1").unwrap().kind, ExKind::PyEval);
        assert_eq!(parse_ex("p").unwrap().kind, ExKind::Host);
        assert_eq!(parse_ex("echo 1").unwrap().kind, ExKind::Host);
    }

    #[test]
    fn arguments_are_trimmed() {
        let l = parse_ex(":python   print('a b')  ").unwrap();
        assert_eq!(l.arg, "print('a b')");
        assert_eq!(l.range, None);
    }

    #[test]
    fn ranges() {
        assert_eq!(parse_ex("%py x").unwrap().range, Some(LineRange::Whole));
        assert_eq!(parse_ex("3py x").unwrap().range, Some(LineRange::Single(Address::Line(3))));
        assert_eq!(
            parse_ex("2,$py x").unwrap().range,
            Some(LineRange::Pair(Address::Line(2), Address::Last))
        );
        assert_eq!(
            parse_ex(".,4 python x").unwrap().range,
            Some(LineRange::Pair(Address::Cursor, Address::Line(4)))
        );
    }

    #[test]
    fn range_resolution() {
        let mut ed = Editor::new();
        let b = ed.current_buffer();
        ed.replace_lines(b, 0, 1, vec!["a".into(), "b".into(), "c".into()]).unwrap();
        assert_eq!(resolve_range(LineRange::Whole, &ed).unwrap(), (1, 3));
        assert_eq!(resolve_range(LineRange::Single(Address::Cursor), &ed).unwrap(), (1, 1));
        assert_eq!(
            resolve_range(LineRange::Pair(Address::Line(2), Address::Last), &ed).unwrap(),
            (2, 3)
        );
        assert_eq!(
            resolve_range(LineRange::Pair(Address::Line(3), Address::Line(2)), &ed),
            Err(ParseError::InvalidRange)
        );
        assert_eq!(resolve_range(LineRange::Single(Address::Line(9)), &ed), Err(ParseError::InvalidRange));
    }

    #[test]
    fn heredoc_markers() {
        assert_eq!(parse_ex("py << EOF").unwrap().heredoc_marker(), Some("EOF"));
        assert_eq!(parse_ex("python <<").unwrap().heredoc_marker(), Some("."));
        assert_eq!(parse_ex("echo << EOF").unwrap().heredoc_marker(), None);
    }

    #[test]
    fn reader_collects_heredoc() {
        let mut r = ScriptReader::new();
        assert_eq!(r.push("python << END").unwrap(), None);
        assert!(r.in_heredoc());
        assert_eq!(r.push("x = 1").unwrap(), None);
        assert_eq!(r.push("  y = 2").unwrap(), None);
        let input = r.push("END").unwrap().unwrap();
        assert_eq!(input.body.as_deref(), Some("x = 1\n  y = 2"));
        assert!(!r.in_heredoc());
        assert!(r.push("\" comment").unwrap().is_none());
        let next = r.push("echo 1").unwrap().unwrap();
        assert_eq!(next.line.kind, ExKind::Host);
    }

    #[test]
    fn unterminated_heredoc_flushes() {
        let mut r = ScriptReader::new();
        r.push("py <<").unwrap();
        r.push("a").unwrap();
        assert_eq!(r.finish().and_then(|i| i.body), Some("a".to_string()));
        assert!(r.finish().is_none());
    }

    #[test]
    fn file_loader_escapes() {
        let code = file_loader(r"C:\it's.py").unwrap();
        assert_eq!(code, r"exec(compile(open('C:\\it\'s.py').read(), 'C:\\it\'s.py', 'exec'))");
        let long = "x".repeat(MAX_FILE_NAME);
        assert!(matches!(file_loader(&long), Err(BridgeError::PathTooLong(_))));
    }
}
