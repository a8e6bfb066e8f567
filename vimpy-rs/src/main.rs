use std::cell::RefCell;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::rc::Rc;

use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use vimpy::cli::{self, RcFile};
use vimpy::commands::ScriptReader;
use vimpy::config;
use vimpy::foreign::cpython::CPython;
use vimpy::host::editor::{Editor, Message};
use vimpy::host::services::BasicServices;
use vimpy::Session;

fn init_logging() {
    let filter = std::env::var("VIMPY_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

/// Print and clear the editor's pending messages.
fn drain_messages(editor: &RefCell<Editor>) {
    let Ok(mut ed) = editor.try_borrow_mut() else {
        return;
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for m in ed.take_messages() {
        match m {
            Message::Info(text) => {
                let _ = writeln!(out, "{text}");
            }
            Message::Error(text) => eprintln!("{text}"),
        }
    }
    let _ = out.flush();
}

/// One buffer per file; the first file takes over the initial buffer.
fn load_files(editor: &mut Editor, files: &[impl AsRef<Path>]) {
    for (i, path) in files.iter().enumerate() {
        let path = path.as_ref();
        let name = path.display().to_string();
        let lines: Vec<String> = match std::fs::read_to_string(path) {
            Ok(text) => text.lines().map(str::to_owned).collect(),
            Err(e) => {
                debug!(file = %name, error = %e, "new file");
                Vec::new()
            }
        };
        if i == 0 {
            let id = editor.current_buffer();
            let len = editor.buffer(id).map_or(0, |b| b.line_count());
            if let Err(e) = editor.rename_buffer(id, &name).and_then(|()| editor.replace_lines(id, 0, len, lines)) {
                warn!(file = %name, error = %e, "could not load file");
            }
        } else {
            editor.add_buffer(&name, lines);
        }
    }
}

fn is_quit(line: &str) -> bool {
    matches!(line.trim().trim_start_matches(':'), "q" | "quit" | "qa" | "qall")
}

fn main() {
    init_logging();

    let args = match cli::parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("vimpy: {e}");
            eprintln!("{}", cli::USAGE);
            std::process::exit(1);
        }
    };

    // ── Configuration ─────────────────────────────────────────────────────────
    let loaded = match &args.rc {
        RcFile::Skip => {
            let mut c = config::Config::default();
            let errors = c.apply_env(|k| std::env::var(k).ok());
            Ok((c, errors))
        }
        RcFile::Explicit(path) => config::load(Some(path)),
        RcFile::Search => config::load(None),
    };
    let mut config = match loaded {
        Ok((c, errors)) => {
            for e in errors {
                eprintln!("vimpy: config {e}");
            }
            c
        }
        Err(e) => {
            eprintln!("vimpy: cannot read config: {e}");
            std::process::exit(1);
        }
    };
    args.apply(&mut config);
    debug!(?config, "configuration");

    // ── Editor and session ────────────────────────────────────────────────────
    let editor = Rc::new(RefCell::new(Editor::new()));
    load_files(&mut editor.borrow_mut(), &args.files);

    let runtime = CPython::new(config.library.clone(), config.siblings.clone());
    let session = Session::new(
        runtime,
        Rc::clone(&editor),
        Box::new(BasicServices::new()),
        config.session_config(),
    );

    for cmd in &args.commands {
        if let Err(e) = session.ex_command(cmd) {
            session.report(&e);
        }
        drain_messages(&editor);
    }

    // ── Ex lines from stdin ───────────────────────────────────────────────────
    let mut reader = ScriptReader::new();
    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("vimpy: {e}");
                break;
            }
        };
        if !reader.in_heredoc() && is_quit(&line) {
            break;
        }
        let outcome = match reader.push(&line) {
            Ok(Some(input)) => session.run_input(&input),
            Ok(None) => Ok(()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = outcome {
            session.report(&e);
        }
        drain_messages(&editor);
    }
    if let Some(input) = reader.finish() {
        if let Err(e) = session.run_input(&input) {
            session.report(&e);
        }
    }

    session.shutdown();
    drain_messages(&editor);
}
