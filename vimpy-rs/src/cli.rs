//! Command-line argument parsing.
//!
//! Usage:
//!   vimpy [-u <rcfile>|NONE] [--dll <library>] [--home <dir>] [--single]
//!         [-c <excmd>]... [<file>...]

use std::path::PathBuf;

use crate::config::Config;
use crate::handoff::HandoffMode;

pub const USAGE: &str =
    "Usage: vimpy [-u <rcfile>|NONE] [--dll <library>] [--home <dir>] [--single] [-c <excmd>]... [<file>...]";

// ── Public types ──────────────────────────────────────────────────────────────

/// Parsed command-line arguments.
#[derive(Debug, Default)]
pub struct CliArgs {
    pub rc: RcFile,
    /// Interpreter library override (`--dll`).
    pub library: Option<String>,
    /// Interpreter home override (`--home`).
    pub home: Option<PathBuf>,
    /// Use the single-call handoff (`--single`).
    pub single: bool,
    /// Ex commands run after the files are loaded (`-c`), in order.
    pub commands: Vec<String>,
    /// Files to load, one buffer each.
    pub files: Vec<PathBuf>,
}

/// How to choose the rc file.
#[derive(Debug, Default, PartialEq, Eq)]
pub enum RcFile {
    /// The per-user `vimpyrc`, if it exists.
    #[default]
    Search,
    /// `-u NONE`: no rc file.
    Skip,
    /// `-u <file>`.
    Explicit(PathBuf),
}

impl CliArgs {
    /// Command-line flags override everything else.
    pub fn apply(&self, config: &mut Config) {
        if let Some(lib) = &self.library {
            config.library = lib.clone();
        }
        if let Some(home) = &self.home {
            config.python_home = Some(home.clone());
        }
        if self.single {
            config.handoff = HandoffMode::SingleCall;
        }
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse `std::env::args()` and return [`CliArgs`] or an error message.
pub fn parse_args() -> Result<CliArgs, String> {
    let raw: Vec<String> = std::env::args().collect();
    parse_argv(raw.get(1..).unwrap_or_default())
}

/// Parse a slice of argument strings (exposed for testing).
pub fn parse_argv(argv: &[String]) -> Result<CliArgs, String> {
    let mut args = CliArgs::default();
    let mut i = 0;

    while i < argv.len() {
        let arg = argv[i].as_str();

        // `--` ends flag processing.
        if arg == "--" {
            args.files.extend(argv[i + 1..].iter().map(PathBuf::from));
            break;
        }

        if !arg.starts_with('-') || arg == "-" {
            args.files.push(PathBuf::from(arg));
            i += 1;
            continue;
        }

        let mut value = |flag: &str| -> Result<String, String> {
            i += 1;
            argv.get(i).cloned().ok_or_else(|| format!("{flag} requires an argument"))
        };

        match arg {
            "-u" => {
                let rc = value("-u")?;
                args.rc = if rc == "NONE" { RcFile::Skip } else { RcFile::Explicit(PathBuf::from(rc)) };
            }
            "-c" => {
                let cmd = value("-c")?;
                args.commands.push(cmd);
            }
            "--dll" => args.library = Some(value("--dll")?),
            "--home" => args.home = Some(PathBuf::from(value("--home")?)),
            "--single" => args.single = true,
            s if s.starts_with("-c") => args.commands.push(s[2..].to_owned()),
            other => return Err(format!("unknown option: {other}")),
        }
        i += 1;
    }

    Ok(args)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|&s| s.to_owned()).collect()
    }

    #[test]
    fn empty_args() {
        let a = parse_argv(&argv(&[])).unwrap();
        assert_eq!(a.rc, RcFile::Search);
        assert!(a.files.is_empty());
        assert!(a.commands.is_empty());
        assert!(!a.single);
    }

    #[test]
    fn files_positional() {
        let a = parse_argv(&argv(&["a.txt", "b.txt"])).unwrap();
        assert_eq!(a.files, [PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
    }

    #[test]
    fn commands_keep_order() {
        let a = parse_argv(&argv(&["-c", "py x = 1", "-cpy print(x)"])).unwrap();
        assert_eq!(a.commands, ["py x = 1", "py print(x)"]);
    }

    #[test]
    fn rc_file_choices() {
        let a = parse_argv(&argv(&["-u", "NONE"])).unwrap();
        assert_eq!(a.rc, RcFile::Skip);
        let a = parse_argv(&argv(&["-u", "my.rc"])).unwrap();
        assert_eq!(a.rc, RcFile::Explicit(PathBuf::from("my.rc")));
    }

    #[test]
    fn interpreter_flags() {
        let a = parse_argv(&argv(&["--dll", "libpython3.12.so", "--home", "/py", "--single"])).unwrap();
        assert_eq!(a.library.as_deref(), Some("libpython3.12.so"));
        assert_eq!(a.home, Some(PathBuf::from("/py")));
        assert!(a.single);
    }

    #[test]
    fn double_dash_ends_flags() {
        let a = parse_argv(&argv(&["--", "-c", "x"])).unwrap();
        assert!(a.commands.is_empty());
        assert_eq!(a.files, [PathBuf::from("-c"), PathBuf::from("x")]);
    }

    #[test]
    fn missing_values_and_unknown_flags() {
        assert_eq!(parse_argv(&argv(&["-c"])).unwrap_err(), "-c requires an argument");
        assert!(parse_argv(&argv(&["--dll"])).is_err());
        assert!(parse_argv(&argv(&["-z"])).is_err());
    }

    #[test]
    fn flags_override_config() {
        let a = parse_argv(&argv(&["--dll", "x.so", "--single"])).unwrap();
        let mut c = Config::default();
        a.apply(&mut c);
        assert_eq!(c.library, "x.so");
        assert_eq!(c.handoff, HandoffMode::SingleCall);
    }
}
