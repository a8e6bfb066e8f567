//! Bridge behaviour through the stub runtime.
//!
//! Each "script" is a closure registered on the stub under its source text;
//! running that text through the session invokes the closure inside the
//! handoff guard, exactly where real interpreter code would run.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use vimpy::commands::file_loader;
use vimpy::error::{BridgeError, ForeignError, LinkError, ParseError};
use vimpy::foreign::stub::{LockEvent, StubObj, StubRuntime};
use vimpy::foreign::ExcKind;
use vimpy::handoff::HandoffMode;
use vimpy::host::editor::{Editor, Message};
use vimpy::host::services::BasicServices;
use vimpy::host::value::{List, Value};
use vimpy::session::Lifecycle;
use vimpy::{Session, SessionConfig};

// ── Helpers ───────────────────────────────────────────────────────────────────

type Stub = Rc<Session<StubRuntime>>;

fn session_with(rt: StubRuntime, mode: HandoffMode, lines: &[&str]) -> (Stub, Rc<RefCell<Editor>>) {
    let editor = Rc::new(RefCell::new(Editor::new()));
    {
        let mut ed = editor.borrow_mut();
        let id = ed.current_buffer();
        ed.rename_buffer(id, "main.txt").unwrap();
        ed.replace_lines(id, 0, 1, lines.iter().map(|s| s.to_string()).collect()).unwrap();
    }
    let config = SessionConfig { mode, home: None };
    let session = Session::new(rt, Rc::clone(&editor), Box::new(BasicServices::new()), config);
    (session, editor)
}

fn session(lines: &[&str]) -> (Stub, Rc<RefCell<Editor>>) {
    session_with(StubRuntime::new(), HandoffMode::Reentrant, lines)
}

fn lines(editor: &RefCell<Editor>) -> Vec<String> {
    let ed = editor.borrow();
    ed.buffer(ed.current_buffer()).unwrap().lines().to_vec()
}

fn messages(editor: &RefCell<Editor>) -> Vec<Message> {
    editor.borrow().messages().to_vec()
}

fn vim(s: &Stub, attr: &str) -> Result<StubObj, ForeignError> {
    s.runtime().module_attr("vim", attr)
}

fn current(s: &Stub, attr: &str) -> Result<StubObj, ForeignError> {
    let cur = vim(s, "current")?;
    s.runtime().getattr(&cur, attr)
}

fn strings(s: &Stub, obj: &StubObj) -> Vec<String> {
    s.runtime().iter(obj).unwrap().iter().map(|o| o.as_str().unwrap()).collect()
}

fn is_vim_error(r: Result<StubObj, ForeignError>, needle: &str) -> bool {
    matches!(r, Err(ForeignError::Exception { kind: ExcKind::Vim, message }) if message.contains(needle))
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[test]
fn interpreter_starts_on_first_command() {
    let (s, _) = session(&["a"]);
    assert_eq!(s.lifecycle(), Lifecycle::Uninitialized);
    assert!(s.probe());
    s.runtime().on_script("pass", |_| Ok(StubObj::none()));
    s.execute("pass", None).unwrap();
    assert_eq!(s.lifecycle(), Lifecycle::Ready);
    assert!(s.runtime().module("vim").is_some());
    assert!(s.runtime().sys_stream("stdout").is_some());
    assert!(s.runtime().sys_stream("stderr").is_some());
}

#[test]
fn missing_library_disables_the_feature() {
    let (s, editor) = session_with(StubRuntime::failing(), HandoffMode::Reentrant, &["a"]);
    assert!(!s.probe());
    let first = s.execute("pass", None).unwrap_err();
    assert!(matches!(first, BridgeError::Link(LinkError::LibraryNotFound { .. })));
    assert_eq!(s.lifecycle(), Lifecycle::Disabled);
    let again = s.execute("pass", None).unwrap_err();
    assert!(matches!(again, BridgeError::Disabled(_)));
    s.report(&again);
    assert!(messages(&editor).iter().any(|m| matches!(m, Message::Error(t) if t.starts_with("E263"))));
    assert!(s.runtime().history().is_empty());
}

#[test]
fn disabled_reports_name_the_failed_library() {
    let (s, editor) = session_with(StubRuntime::failing(), HandoffMode::Reentrant, &["a"]);
    let first = s.execute("pass", None).unwrap_err();
    s.report(&first);
    let again = s.evaluate("1").unwrap_err();
    s.report(&again);
    let errors: Vec<String> = messages(&editor)
        .into_iter()
        .filter_map(|m| match m {
            Message::Error(t) => Some(t),
            Message::Info(_) => None,
        })
        .collect();
    assert_eq!(errors.len(), 2);
    for text in &errors {
        assert!(text.starts_with("E263"), "{text}");
        assert!(text.contains("could not load library stub: disabled"), "{text}");
    }
}

#[test]
fn lock_is_paired_around_every_execution() {
    let (s, _) = session(&["a"]);
    s.runtime().on_script("pass", |_| Ok(StubObj::none()));
    s.execute("pass", None).unwrap();
    s.execute("missing script", None).unwrap_err();
    assert_eq!(
        s.runtime().lock_events(),
        vec![
            LockEvent::InitialRelease,
            LockEvent::Acquire(HandoffMode::Reentrant),
            LockEvent::Release(HandoffMode::Reentrant),
            LockEvent::Acquire(HandoffMode::Reentrant),
            LockEvent::Release(HandoffMode::Reentrant),
        ]
    );
}

#[test]
fn shutdown_is_idempotent() {
    let (s, _) = session(&["a"]);
    s.runtime().on_script("pass", |_| Ok(StubObj::none()));
    s.execute("pass", None).unwrap();
    s.shutdown();
    s.shutdown();
    assert_eq!(s.lifecycle(), Lifecycle::Finalized);
    assert!(matches!(s.execute("pass", None), Err(BridgeError::Finalized)));
}

// ── Reentrancy ────────────────────────────────────────────────────────────────

#[test]
fn single_call_mode_refuses_nested_python() {
    let (s, _) = session_with(StubRuntime::new(), HandoffMode::SingleCall, &["a"]);
    let seen = Rc::new(RefCell::new(None));
    let out = Rc::clone(&seen);
    s.runtime().on_script("outer", move |s| {
        let command = vim(s, "command")?;
        *out.borrow_mut() = Some(s.runtime().call(&command, &[StubObj::str("python inner")]));
        Ok(StubObj::none())
    });
    s.runtime().on_script("inner", |_| Ok(StubObj::none()));
    s.execute("outer", None).unwrap();
    let nested = seen.borrow_mut().take().unwrap();
    assert!(is_vim_error(nested, "E659"));
    assert!(!s.runtime().history().contains(&"inner".to_string()));
}

#[test]
fn reentrant_mode_allows_nested_python() {
    let (s, editor) = session(&["a"]);
    s.runtime().on_script("outer", |s| {
        let command = vim(s, "command")?;
        s.runtime().call(&command, &[StubObj::str("py inner")])?;
        Ok(StubObj::none())
    });
    s.runtime().on_script("inner", |s| {
        let buf = current(s, "buffer")?;
        s.runtime().setitem(&buf, &StubObj::int(0), Some(&StubObj::str("from inner")))?;
        Ok(StubObj::none())
    });
    s.execute("outer", None).unwrap();
    assert_eq!(lines(&editor), ["from inner"]);
}

// ── Buffers ───────────────────────────────────────────────────────────────────

#[test]
fn buffer_lines_read_write_and_append() {
    let (s, editor) = session(&["one", "two", "three"]);
    s.runtime().on_script("edit", |s| {
        let rt = s.runtime();
        let buf = current(s, "buffer")?;
        assert_eq!(rt.len(&buf)?, 3);
        assert_eq!(rt.getitem(&buf, &StubObj::int(-1))?.as_str().as_deref(), Some("three"));
        rt.setitem(&buf, &StubObj::int(1), Some(&StubObj::str("TWO")))?;
        rt.call_method(&buf, "append", &[StubObj::list(vec![StubObj::str("four")])])?;
        rt.call_method(&buf, "append", &[StubObj::str("zero"), StubObj::int(0)])?;
        let tail = rt.getitem(&buf, &StubObj::slice(Some(-2), None, None)?)?;
        assert_eq!(strings(s, &tail), ["three", "four"]);
        Ok(StubObj::none())
    });
    s.execute("edit", None).unwrap();
    assert_eq!(lines(&editor), ["zero", "one", "TWO", "three", "four"]);
}

#[test]
fn buffer_slice_assignment_and_deletion() {
    let (s, editor) = session(&["a", "b", "c", "d"]);
    s.runtime().on_script("splice", |s| {
        let rt = s.runtime();
        let buf = current(s, "buffer")?;
        let mid = StubObj::slice(Some(1), Some(3), None)?;
        rt.setitem(&buf, &mid, Some(&StubObj::list(vec![StubObj::str("x")])))?;
        rt.setitem(&buf, &StubObj::int(0), None)?;
        let stepped = StubObj::slice(None, None, Some(2))?;
        let err = rt.getitem(&buf, &stepped).unwrap_err();
        assert_eq!(err.exc_kind(), ExcKind::Value);
        Ok(StubObj::none())
    });
    s.execute("splice", None).unwrap();
    assert_eq!(lines(&editor), ["x", "d"]);
}

#[test]
fn buffer_lines_cannot_contain_newlines() {
    let (s, editor) = session(&["a"]);
    s.runtime().on_script("bad", |s| {
        let buf = current(s, "buffer")?;
        let r = s.runtime().setitem(&buf, &StubObj::int(0), Some(&StubObj::str("x\ny")));
        assert!(matches!(r, Err(ForeignError::Exception { kind: ExcKind::Vim, .. })));
        s.runtime().setitem(&buf, &StubObj::int(0), Some(&StubObj::str("nul\0inside")))?;
        let back = s.runtime().getitem(&buf, &StubObj::int(0))?;
        assert_eq!(back.as_str().as_deref(), Some("nul\0inside"));
        Ok(StubObj::none())
    });
    s.execute("bad", None).unwrap();
    assert_eq!(lines(&editor), ["nul\ninside"]);
}

#[test]
fn buffer_attributes() {
    let (s, editor) = session(&["a"]);
    s.runtime().on_script("attrs", |s| {
        let rt = s.runtime();
        let buf = current(s, "buffer")?;
        assert_eq!(rt.getattr(&buf, "name")?.as_str().as_deref(), Some("main.txt"));
        assert_eq!(rt.getattr(&buf, "number")?.as_int(), Some(1));
        assert_eq!(rt.getattr(&buf, "valid")?.as_int(), Some(1));
        rt.setattr(&buf, "name", Some(&StubObj::str("renamed.txt")))?;
        assert!(rt.getattr(&buf, "no_such_thing").is_err());
        assert_eq!(rt.repr(&buf)?, "<buffer renamed.txt>");
        let members = rt.getattr(&buf, "__members__")?;
        assert_eq!(strings(s, &members), ["name", "number", "vars", "valid"]);
        Ok(StubObj::none())
    });
    s.execute("attrs", None).unwrap();
    let ed = editor.borrow();
    assert_eq!(ed.buffer(1).unwrap().name, "renamed.txt");
}

#[test]
fn current_line_get_set_delete() {
    let (s, editor) = session(&["first", "second"]);
    s.runtime().on_script("line", |s| {
        let rt = s.runtime();
        let cur = vim(s, "current")?;
        assert_eq!(rt.getattr(&cur, "line")?.as_str().as_deref(), Some("first"));
        rt.setattr(&cur, "line", Some(&StubObj::str("changed")))?;
        Ok(StubObj::none())
    });
    s.runtime().on_script("delete", |s| {
        let cur = vim(s, "current")?;
        s.runtime().setattr(&cur, "line", None)?;
        Ok(StubObj::none())
    });
    s.execute("line", None).unwrap();
    assert_eq!(lines(&editor), ["changed", "second"]);
    s.execute("delete", None).unwrap();
    assert_eq!(lines(&editor), ["second"]);
}

// ── Ranges ────────────────────────────────────────────────────────────────────

#[test]
fn range_end_follows_edits() {
    let (s, editor) = session(&["1", "2", "3", "4", "5"]);
    s.runtime().on_script("range", |s| {
        let rt = s.runtime();
        let r = current(s, "range")?;
        assert_eq!(rt.len(&r)?, 3);
        assert_eq!(rt.getattr(&r, "start")?.as_int(), Some(1));
        assert_eq!(rt.getattr(&r, "end")?.as_int(), Some(3));
        rt.call_method(&r, "append", &[StubObj::str("new")])?;
        assert_eq!(rt.len(&r)?, 4);
        rt.setitem(&r, &StubObj::int(0), None)?;
        rt.setitem(&r, &StubObj::int(0), None)?;
        assert_eq!(rt.len(&r)?, 2);
        assert_eq!(rt.getattr(&r, "end")?.as_int(), Some(2));
        assert_eq!(rt.getitem(&r, &StubObj::int(-1))?.as_str().as_deref(), Some("new"));
        Ok(StubObj::none())
    });
    s.execute("range", Some((2, 4))).unwrap();
    assert_eq!(lines(&editor), ["1", "4", "new", "5"]);
}

#[test]
fn buffer_range_method_validates_bounds() {
    let (s, _) = session(&["a", "b", "c"]);
    s.runtime().on_script("r", |s| {
        let rt = s.runtime();
        let buf = current(s, "buffer")?;
        let r = rt.call_method(&buf, "range", &[StubObj::int(2), StubObj::int(3)])?;
        assert_eq!(strings(s, &rt.getitem(&r, &StubObj::slice(None, None, None)?)?), ["b", "c"]);
        let bad = rt.call_method(&buf, "range", &[StubObj::int(0), StubObj::int(2)]).unwrap_err();
        assert_eq!(bad.exc_kind(), ExcKind::Index);
        assert!(rt.call_method(&buf, "range", &[StubObj::int(1), StubObj::int(9)]).is_err());
        Ok(StubObj::none())
    });
    s.execute("r", None).unwrap();
}

// ── Entity proxies ────────────────────────────────────────────────────────────

#[test]
fn one_live_proxy_per_entity() {
    let (s, _) = session(&["a"]);
    s.runtime().on_script("same", |s| {
        let rt = s.runtime();
        let a = current(s, "buffer")?;
        let b = rt.getitem(&vim(s, "buffers")?, &StubObj::int(1))?;
        assert!(a.ptr_eq(&b));
        let w1 = current(s, "window")?;
        let w2 = rt.getitem(&vim(s, "windows")?, &StubObj::int(0))?;
        assert!(w1.ptr_eq(&w2));
        let buffers = vim(s, "buffers")?;
        let missing = rt.getitem(&buffers, &StubObj::int(99)).unwrap_err();
        assert_eq!(missing.exc_kind(), ExcKind::Key);
        Ok(StubObj::none())
    });
    s.execute("same", None).unwrap();
    assert_eq!(s.live_proxies(), 0);
}

#[test]
fn destroyed_buffer_invalidates_its_proxy() {
    let (s, editor) = session(&["a"]);
    let second = editor.borrow_mut().add_buffer("other.txt", vec!["x".into()]);
    let kept: Rc<RefCell<Option<StubObj>>> = Rc::default();
    let slot = Rc::clone(&kept);
    s.runtime().on_script("grab", move |s| {
        let buffers = vim(s, "buffers")?;
        *slot.borrow_mut() = Some(s.runtime().getitem(&buffers, &StubObj::int(second as i64))?);
        Ok(StubObj::none())
    });
    s.execute("grab", None).unwrap();
    assert_eq!(s.live_proxies(), 1);

    editor.borrow_mut().wipe_buffer(second).unwrap();
    assert_eq!(s.live_proxies(), 0);

    let stale = kept.borrow().clone().unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let results = Rc::clone(&seen);
    s.runtime().on_script("use", move |s| {
        let rt = s.runtime();
        results.borrow_mut().push(rt.getattr(&stale, "valid").map(|v| v.as_int()));
        results.borrow_mut().push(rt.getattr(&stale, "name").map(|v| v.as_int()));
        results.borrow_mut().push(rt.len(&stale).map(|n| Some(n as i64)));
        Ok(StubObj::none())
    });
    s.execute("use", None).unwrap();
    let results = seen.borrow();
    assert_eq!(results[0], Ok(Some(0)));
    assert_eq!(
        results[1],
        Err(ForeignError::exception(ExcKind::Vim, "attempt to refer to deleted buffer"))
    );
    assert!(results[2].is_err());
}

#[test]
fn range_on_a_wiped_buffer_refuses_attributes() {
    let (s, editor) = session(&["a"]);
    let second = editor.borrow_mut().add_buffer("other.txt", vec!["x".into(), "y".into()]);
    let kept: Rc<RefCell<Option<StubObj>>> = Rc::default();
    let slot = Rc::clone(&kept);
    s.runtime().on_script("grab", move |s| {
        let rt = s.runtime();
        let buf = rt.getitem(&vim(s, "buffers")?, &StubObj::int(second as i64))?;
        let r = rt.call_method(&buf, "range", &[StubObj::int(1), StubObj::int(2)])?;
        assert_eq!(rt.getattr(&r, "end")?.as_int(), Some(1));
        *slot.borrow_mut() = Some(r);
        Ok(StubObj::none())
    });
    s.execute("grab", None).unwrap();

    editor.borrow_mut().wipe_buffer(second).unwrap();

    let stale = kept.borrow().clone().unwrap();
    s.runtime().on_script("use", move |s| {
        let rt = s.runtime();
        assert!(is_vim_error(rt.getattr(&stale, "start"), "attempt to refer to deleted buffer"));
        assert!(is_vim_error(rt.getattr(&stale, "end"), "attempt to refer to deleted buffer"));
        Ok(StubObj::none())
    });
    s.execute("use", None).unwrap();
}

#[test]
fn windows_and_tab_pages() {
    let (s, editor) = session(&["a", "b", "c"]);
    s.runtime().on_script("layout", |s| {
        let rt = s.runtime();
        let command = vim(s, "command")?;
        rt.call(&command, &[StubObj::str("split")])?;
        rt.call(&command, &[StubObj::str("tabnew")])?;
        let tabs = vim(s, "tabpages")?;
        assert_eq!(rt.len(&tabs)?, 2);
        let first = rt.getitem(&tabs, &StubObj::int(0))?;
        let windows = rt.getattr(&first, "windows")?;
        assert_eq!(rt.len(&windows)?, 2);
        assert_eq!(rt.getattr(&first, "number")?.as_int(), Some(1));

        let win = rt.getitem(&windows, &StubObj::int(0))?;
        rt.setattr(&win, "cursor", Some(&StubObj::tuple(vec![StubObj::int(3), StubObj::int(0)])))?;
        let cursor = rt.getattr(&win, "cursor")?;
        assert_eq!(cursor.elements().unwrap()[0].as_int(), Some(3));
        let bad = rt.setattr(&win, "cursor", Some(&StubObj::tuple(vec![StubObj::int(40), StubObj::int(0)])));
        assert!(bad.is_err());
        rt.setattr(&win, "height", Some(&StubObj::int(12)))?;
        assert_eq!(rt.getattr(&win, "height")?.as_int(), Some(12));
        assert!(rt.setattr(&win, "width", Some(&StubObj::int(-1))).is_err());

        let cur = vim(s, "current")?;
        rt.setattr(&cur, "tabpage", Some(&first))?;
        Ok(StubObj::none())
    });
    s.execute("layout", None).unwrap();
    let ed = editor.borrow();
    assert_eq!(ed.tab_number(ed.current_tab()), Some(1));
}

#[test]
fn editor_cannot_be_changed_outside_a_script() {
    let (s, editor) = session(&["a"]);
    let kept: Rc<RefCell<Option<StubObj>>> = Rc::default();
    let slot = Rc::clone(&kept);
    s.runtime().on_script("grab", move |s| {
        *slot.borrow_mut() = Some(current(s, "buffer")?);
        Ok(StubObj::none())
    });
    s.execute("grab", None).unwrap();
    let buf = kept.borrow().clone().unwrap();
    let r = s.runtime().setitem(&buf, &StubObj::int(0), Some(&StubObj::str("sneaky")));
    assert!(r.is_err());
    assert_eq!(lines(&editor), ["a"]);
}

// ── Variables and evaluation ──────────────────────────────────────────────────

#[test]
fn vars_dictionary_aliases_globals() {
    let (s, editor) = session(&["a"]);
    s.runtime().on_script("vars", |s| {
        let rt = s.runtime();
        let vars = vim(s, "vars")?;
        rt.setitem(&vars, &StubObj::str("answer"), Some(&StubObj::int(42)))?;
        assert_eq!(rt.call_method(&vars, "has_key", &[StubObj::str("answer")])?.as_int(), Some(1));
        let fallback = rt.call_method(&vars, "get", &[StubObj::str("nope"), StubObj::int(7)])?;
        assert_eq!(fallback.as_int(), Some(7));
        let missing = rt.getitem(&vars, &StubObj::str("nope")).unwrap_err();
        assert_eq!(missing.exc_kind(), ExcKind::Key);
        let empty = rt.setitem(&vars, &StubObj::str(""), Some(&StubObj::int(1))).unwrap_err();
        assert_eq!(empty.exc_kind(), ExcKind::Value);
        Ok(StubObj::none())
    });
    s.execute("vars", None).unwrap();
    assert_eq!(editor.borrow().globals().get("answer").and_then(|v| v.as_number()), Some(42));
}

#[test]
fn dict_update_skips_bad_entries() {
    let (s, editor) = session(&["a"]);
    s.runtime().on_script("update", |s| {
        let vars = vim(s, "vars")?;
        let source = StubObj::str_dict(vec![
            ("good", StubObj::int(1)),
            ("", StubObj::int(2)),
            ("bad", StubObj::opaque("Widget", None)),
        ]);
        s.runtime().call_method(&vars, "update", &[source])?;
        Ok(StubObj::none())
    });
    s.execute("update", None).unwrap();
    let ed = editor.borrow();
    assert_eq!(ed.globals().get("good").and_then(|v| v.as_number()), Some(1));
    assert!(!ed.globals().contains_key("bad"));
    let warnings: Vec<_> = ed.messages().iter().filter(|m| m.text().starts_with("W: skipped key")).collect();
    assert_eq!(warnings.len(), 2);
}

#[test]
fn locked_dictionary_rejects_writes() {
    let (s, _) = session(&["a"]);
    s.runtime().on_script("lock", |s| {
        let rt = s.runtime();
        let vars = vim(s, "vars")?;
        rt.setattr(&vars, "locked", Some(&vim(s, "VAR_LOCKED")?))?;
        assert!(is_vim_error(
            rt.setitem(&vars, &StubObj::str("x"), Some(&StubObj::int(1))).map(|()| StubObj::none()),
            ""
        ));
        rt.setattr(&vars, "locked", Some(&StubObj::int(0)))?;
        rt.setitem(&vars, &StubObj::str("x"), Some(&StubObj::int(1)))?;
        Ok(StubObj::none())
    });
    s.execute("lock", None).unwrap();
}

#[test]
fn eval_copies_and_bindeval_aliases() {
    let (s, editor) = session(&["a"]);
    s.ex_command("let g:lst = [1, 2]").unwrap();
    s.runtime().on_script("eval", |s| {
        let rt = s.runtime();
        let copy = rt.call(&vim(s, "eval")?, &[StubObj::str("g:lst")])?;
        assert!(copy.proxy().is_none());
        assert_eq!(rt.len(&copy)?, 2);
        let bound = rt.call(&vim(s, "bindeval")?, &[StubObj::str("g:lst")])?;
        assert!(bound.proxy().is_some());
        rt.call_method(&bound, "extend", &[StubObj::list(vec![StubObj::int(3)])])?;
        rt.setitem(&bound, &StubObj::int(0), Some(&StubObj::str("one")))?;
        Ok(StubObj::none())
    });
    s.execute("eval", None).unwrap();
    let lst = editor.borrow().globals().get("lst").unwrap();
    let Value::List(l) = lst else { panic!("g:lst is not a list") };
    assert_eq!(l.len(), 3);
    assert_eq!(l.get(0).unwrap().to_echo(), "one");
}

#[test]
fn evaluate_converts_results() {
    let (s, _) = session(&["a"]);
    assert_eq!(s.evaluate("None").unwrap().as_number(), Some(0));
    assert_eq!(s.evaluate("42").unwrap().as_number(), Some(42));
    s.runtime().on_script("nested", |_| {
        Ok(StubObj::str_dict(vec![("k", StubObj::list(vec![StubObj::int(1), StubObj::float(2.5)]))]))
    });
    let Value::Dict(d) = s.evaluate("nested").unwrap() else { panic!("expected a dictionary") };
    let expected = Value::List(List::from_vec(vec![Value::Number(1), Value::Float(2.5)]));
    assert_eq!(d.get("k"), Some(expected));
    s.runtime().on_script("opaque", |_| Ok(StubObj::opaque("Widget", None)));
    assert!(matches!(s.evaluate("opaque"), Err(BridgeError::Convert(_))));
    assert!(matches!(s.evaluate("undefined"), Err(BridgeError::Eval(_))));
}

// ── Output ────────────────────────────────────────────────────────────────────

#[test]
fn output_streams_become_messages() {
    let (s, editor) = session(&["a"]);
    s.runtime().on_script("print", |s| {
        let rt = s.runtime();
        rt.print("hello")?;
        let out = rt.sys_stream("stdout").unwrap();
        rt.call_method(&out, "write", &[StubObj::str("par")])?;
        rt.call_method(&out, "write", &[StubObj::str("tial")])?;
        let err = rt.sys_stream("stderr").unwrap();
        rt.call_method(&err, "writelines", &[StubObj::list(vec![StubObj::str("bad\n"), StubObj::str("worse\n")])])?;
        Ok(StubObj::none())
    });
    s.execute("print", None).unwrap();
    assert_eq!(
        messages(&editor),
        [
            Message::Info("hello".into()),
            Message::Error("bad".into()),
            Message::Error("worse".into()),
            Message::Info("partial".into()),
        ]
    );
}

#[test]
fn command_output_keeps_its_place() {
    let (s, editor) = session(&["a"]);
    s.runtime().on_script("mix", |s| {
        let rt = s.runtime();
        let out = rt.sys_stream("stdout").unwrap();
        rt.call_method(&out, "write", &[StubObj::str("before ")])?;
        rt.call(&vim(s, "command")?, &[StubObj::str("echo 'middle'")])?;
        rt.print("after")?;
        Ok(StubObj::none())
    });
    s.execute("mix", None).unwrap();
    let texts: Vec<String> = messages(&editor).iter().map(|m| m.text().to_owned()).collect();
    assert_eq!(texts, ["before ", "middle", "after"]);
}

// ── Ex commands ───────────────────────────────────────────────────────────────

#[test]
fn ex_lines_dispatch_by_command() {
    let (s, editor) = session(&["a", "b", "c"]);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let out = Rc::clone(&seen);
    s.runtime().on_script("report()", move |s| {
        let r = current(s, "range")?;
        out.borrow_mut().push((s.runtime().getattr(&r, "start")?.as_int(), s.runtime().len(&r)?));
        Ok(StubObj::none())
    });
    s.ex_command("%py report()").unwrap();
    s.ex_command("2python3 report()").unwrap();
    s.ex_command("pyeval 7").unwrap();
    s.ex_command("echo 'host'").unwrap();
    assert_eq!(*seen.borrow(), [(Some(0), 3), (Some(1), 1)]);
    let texts: Vec<String> = messages(&editor).iter().map(|m| m.text().to_owned()).collect();
    assert_eq!(texts, ["7", "host"]);
    assert!(matches!(s.ex_command("5,2py report()"), Err(BridgeError::Parse(_))));
}

#[test]
fn source_runs_heredocs_and_continues_after_errors() {
    let (s, editor) = session(&["a"]);
    s.runtime().on_script("x = 1\ny = 2", |s| {
        s.runtime().print("heredoc ran")?;
        Ok(StubObj::none())
    });
    let script = "\" comment\npy undefined_script\npython << EOF\nx = 1\ny = 2\nEOF\necho 'done'\n";
    assert_eq!(s.source(script), 1);
    let ed = editor.borrow();
    let texts: Vec<&str> = ed.messages().iter().map(Message::text).collect();
    assert!(texts.contains(&"heredoc ran"));
    assert_eq!(texts.last(), Some(&"done"));
}

#[test]
fn pyfile_runs_the_loader_for_the_path() {
    let (s, editor) = session(&["a"]);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "print('from file')").unwrap();
    let path = file.path().to_string_lossy().into_owned();
    let loader = file_loader(&path).unwrap();
    assert!(loader.starts_with("exec(compile(open('"));
    s.runtime().on_script(&loader, |s| {
        s.runtime().print("from file")?;
        Ok(StubObj::none())
    });
    s.ex_command(&format!("pyfile {path}")).unwrap();
    assert_eq!(messages(&editor), [Message::Info("from file".into())]);

    let long = format!("/{}", "x".repeat(2000));
    assert!(matches!(s.ex_command(&format!("pyf {long}")), Err(BridgeError::PathTooLong(_))));
}

#[test]
fn pyfile_without_a_name_needs_an_argument() {
    let (s, editor) = session(&["a"]);
    for line in ["pyfile", "pyf   "] {
        let err = s.ex_command(line).unwrap_err();
        assert!(matches!(err, BridgeError::Parse(ParseError::ArgumentRequired)), "{line}: {err}");
        assert_eq!(err.to_string(), "E471: Argument required");
    }
    assert_eq!(s.lifecycle(), Lifecycle::Uninitialized);
    assert!(s.runtime().history().is_empty());
    assert!(messages(&editor).is_empty());
}
