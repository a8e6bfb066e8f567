//! `vimpyrc` configuration.
//!
//! Sources, later overriding earlier: built-in defaults, the rc file, the
//! environment, then command-line flags (applied by the binary).
//!
//! | Directive | Action |
//! |-----------|--------|
//! | `set <name>=<value>` or `set <name> <value>` | set an option |
//! | Lines starting with `"` or `#` | comment, ignored |
//!
//! Options: `library`, `pythonhome`, `handoff` (`reentrant` or `single`) and
//! `siblings` (comma-separated library names that must not already be
//! loaded).

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

use crate::handoff::HandoffMode;
use crate::session::SessionConfig;

/// Environment variable naming the interpreter library.
pub const ENV_LIBRARY: &str = "VIMPY_PYTHONDLL";
/// Environment variable naming the interpreter home.
pub const ENV_HOME: &str = "VIMPY_PYTHONHOME";
/// Environment variable selecting the handoff mode.
pub const ENV_HANDOFF: &str = "VIMPY_HANDOFF";

#[cfg(target_os = "macos")]
pub const DEFAULT_LIBRARY: &str = "libpython3.dylib";
#[cfg(windows)]
pub const DEFAULT_LIBRARY: &str = "python3.dll";
#[cfg(not(any(target_os = "macos", windows)))]
pub const DEFAULT_LIBRARY: &str = "libpython3.so";

/// A non-fatal error in one configuration line.  Line 0 means the
/// environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Shared library to bind.
    pub library: String,
    pub python_home: Option<PathBuf>,
    pub handoff: HandoffMode,
    /// Interpreter libraries that must not be resident when binding.
    pub siblings: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            library: DEFAULT_LIBRARY.to_owned(),
            python_home: None,
            handoff: HandoffMode::default(),
            siblings: Vec::new(),
        }
    }
}

impl Config {
    /// Parse rc-file text on top of the defaults.
    ///
    /// Bad lines are reported and skipped; the rest still apply.
    pub fn load_str(s: &str) -> (Self, Vec<ConfigError>) {
        let mut config = Config::default();
        let errors = config.apply_str(s);
        (config, errors)
    }

    pub fn load_file(path: &Path) -> std::io::Result<(Self, Vec<ConfigError>)> {
        let s = std::fs::read_to_string(path)?;
        Ok(Self::load_str(&s))
    }

    fn apply_str(&mut self, s: &str) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        for (i, raw) in s.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('"') || line.starts_with('#') {
                continue;
            }
            let (cmd, rest) = line.split_once(|c: char| c.is_ascii_whitespace()).unwrap_or((line, ""));
            let result = match cmd {
                "set" | "se" => parse_set(rest.trim()).and_then(|(name, value)| self.set(name, value)),
                other => Err(format!("unknown directive: {other}")),
            };
            if let Err(message) = result {
                errors.push(ConfigError { line: i + 1, message });
            }
        }
        errors
    }

    /// Set one option by name.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), String> {
        match name {
            "library" | "pythondll" => {
                if value.is_empty() {
                    return Err("library name cannot be empty".to_owned());
                }
                self.library = value.to_owned();
            }
            "pythonhome" => {
                self.python_home = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "handoff" => self.handoff = value.parse()?,
            "siblings" => {
                self.siblings =
                    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect();
            }
            other => return Err(format!("unknown option: {other}")),
        }
        Ok(())
    }

    /// Apply environment overrides, looking variables up with `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        for (env, option) in [(ENV_LIBRARY, "library"), (ENV_HOME, "pythonhome"), (ENV_HANDOFF, "handoff")] {
            if let Some(value) = var(env) {
                if let Err(e) = self.set(option, &value) {
                    errors.push(ConfigError { line: 0, message: format!("{env}: {e}") });
                }
            }
        }
        errors
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig { mode: self.handoff, home: self.python_home.clone() }
    }
}

fn parse_set(args: &str) -> Result<(&str, &str), String> {
    if args.is_empty() {
        return Err("set requires an option name".to_owned());
    }
    let (name, value) = match args.split_once('=') {
        Some((n, v)) => (n.trim(), v.trim()),
        None => args.split_once(|c: char| c.is_ascii_whitespace()).map_or((args, ""), |(n, v)| (n, v.trim())),
    };
    if name.is_empty() {
        return Err("set requires an option name".to_owned());
    }
    Ok((name, value))
}

/// `vimpyrc` in the platform's per-user config directory.
pub fn default_rc_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "vimpy").map(|d| d.config_dir().join("vimpyrc"))
}

/// Defaults, then `rc` (or the per-user rc file if it exists), then the
/// process environment.  A missing explicit rc file is an error.
pub fn load(rc: Option<&Path>) -> std::io::Result<(Config, Vec<ConfigError>)> {
    let (mut config, mut errors) = match rc {
        Some(path) => Config::load_file(path)?,
        None => match default_rc_path().filter(|p| p.exists()) {
            Some(path) => Config::load_file(&path)?,
            None => (Config::default(), Vec::new()),
        },
    };
    errors.extend(config.apply_env(|k| std::env::var(k).ok()));
    Ok((config, errors))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.library, DEFAULT_LIBRARY);
        assert_eq!(c.handoff, HandoffMode::Reentrant);
        assert!(c.python_home.is_none());
        assert!(c.siblings.is_empty());
    }

    #[test]
    fn set_equals_and_space_syntax() {
        let (c, errs) = Config::load_str("set library=libpython3.12.so\nset handoff single\n");
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(c.library, "libpython3.12.so");
        assert_eq!(c.handoff, HandoffMode::SingleCall);
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let (c, errs) = Config::load_str("\" vim-style comment\n# hash comment\n\n   \nset pythonhome=/opt/py\n");
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(c.python_home, Some(PathBuf::from("/opt/py")));
    }

    #[test]
    fn siblings_are_comma_separated() {
        let (c, _) = Config::load_str("set siblings = libpython2.7.so, libpython3.11.so ,\n");
        assert_eq!(c.siblings, ["libpython2.7.so", "libpython3.11.so"]);
    }

    #[test]
    fn bad_lines_are_reported_and_skipped() {
        let src = "set library=a.so\nlet x = 1\nset colour=red\nset handoff=both\nset library=b.so\n";
        let (c, errs) = Config::load_str(src);
        assert_eq!(c.library, "b.so");
        assert_eq!(errs.iter().map(|e| e.line).collect::<Vec<_>>(), [2, 3, 4]);
        assert!(errs[1].message.contains("colour"));
        assert_eq!(errs[0].to_string(), "line 2: unknown directive: let");
    }

    #[test]
    fn environment_overrides_file() {
        let (mut c, _) = Config::load_str("set library=file.so\nset handoff=single\n");
        let env: HashMap<&str, &str> = [(ENV_LIBRARY, "env.so"), (ENV_HANDOFF, "reentrant")].into_iter().collect();
        let errs = c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert!(errs.is_empty());
        assert_eq!(c.library, "env.so");
        assert_eq!(c.handoff, HandoffMode::Reentrant);
    }

    #[test]
    fn bad_environment_value_is_reported() {
        let mut c = Config::default();
        let errs = c.apply_env(|k| (k == ENV_HANDOFF).then(|| "sometimes".to_owned()));
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].line, 0);
        assert!(errs[0].message.starts_with(ENV_HANDOFF));
        assert_eq!(c.handoff, HandoffMode::Reentrant);
    }

    #[test]
    fn load_file_from_disk() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "set library=disk.so").unwrap();
        let (c, errs) = Config::load_file(f.path()).unwrap();
        assert!(errs.is_empty());
        assert_eq!(c.library, "disk.so");
        assert!(Config::load_file(Path::new("/nonexistent/vimpyrc")).is_err());
    }

    #[test]
    fn session_config_carries_mode_and_home() {
        let (c, _) = Config::load_str("set handoff=single\nset pythonhome=/py\n");
        let s = c.session_config();
        assert_eq!(s.mode, HandoffMode::SingleCall);
        assert_eq!(s.home, Some(PathBuf::from("/py")));
    }
}
