//! Editor state: buffers, windows, tab pages and the global variable scopes.
//!
//! Entity identifiers are allocated monotonically and never reused, so an
//! identifier that no longer resolves always means "destroyed".  Every
//! destruction is announced to the registered [`EntityListener`]s before the
//! entity's storage is dropped.

use std::collections::BTreeMap;
use std::rc::Weak;

use thiserror::Error;
use tracing::debug;

use super::value::{Dict, Scope, Value};

pub type BufferId = u32;
pub type WindowId = u32;
pub type TabId = u32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EditorError {
    #[error("no such buffer: {0}")]
    NoSuchBuffer(BufferId),
    #[error("no such window: {0}")]
    NoSuchWindow(WindowId),
    #[error("no such tab page: {0}")]
    NoSuchTab(TabId),
    #[error("cannot close last window")]
    LastWindow,
    #[error("cannot wipe out the last buffer")]
    LastBuffer,
    #[error("line number out of range: {0}")]
    InvalidLine(usize),
    #[error("cursor position outside buffer")]
    CursorOutside,
}

/// Observer notified when an entity is destroyed.
pub trait EntityListener {
    fn buffer_destroyed(&self, id: BufferId);
    fn window_destroyed(&self, id: WindowId);
    fn tabpage_destroyed(&self, id: TabId);
}

/// A message produced for the user (`:echo` output or an error).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Info(String),
    Error(String),
}

impl Message {
    pub fn text(&self) -> &str {
        match self {
            Message::Info(s) | Message::Error(s) => s,
        }
    }
}

#[derive(Debug)]
pub struct Buffer {
    pub number: BufferId,
    pub name: String,
    lines: Vec<String>,
    pub vars: Dict,
    pub changed: bool,
}

impl Buffer {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }
}

#[derive(Debug, Clone)]
pub struct Window {
    pub id: WindowId,
    pub buffer: BufferId,
    /// `(row, col)`: row 1-based, col 0-based.
    pub cursor: (usize, usize),
    pub height: usize,
    pub width: usize,
    pub vars: Dict,
}

#[derive(Debug)]
pub struct TabPage {
    pub id: TabId,
    pub windows: Vec<WindowId>,
    pub current: WindowId,
    pub vars: Dict,
}

pub struct Editor {
    buffers: BTreeMap<BufferId, Buffer>,
    windows: BTreeMap<WindowId, Window>,
    tabs: Vec<TabPage>,
    current_tab: TabId,
    globals: Dict,
    vimvars: Dict,
    messages: Vec<Message>,
    next_buffer: BufferId,
    next_window: WindowId,
    next_tab: TabId,
    listeners: Vec<Weak<dyn EntityListener>>,
}

impl Default for Editor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Editor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor")
            .field("buffers", &self.buffers.len())
            .field("windows", &self.windows.len())
            .field("tabs", &self.tabs.len())
            .field("current_tab", &self.current_tab)
            .finish()
    }
}

const DEFAULT_HEIGHT: usize = 24;
const DEFAULT_WIDTH: usize = 80;

impl Editor {
    /// One empty buffer shown in one window of one tab page.
    pub fn new() -> Self {
        let vimvars = Dict::with_scope(Scope::DefScope);
        let _ = vimvars.insert("version", Value::Number(900));
        let _ = vimvars.insert("progname", Value::from("vimpy"));
        let mut ed = Editor {
            buffers: BTreeMap::new(),
            windows: BTreeMap::new(),
            tabs: Vec::new(),
            current_tab: 0,
            globals: Dict::with_scope(Scope::DefScope),
            vimvars,
            messages: Vec::new(),
            next_buffer: 1,
            next_window: 1000,
            next_tab: 1,
            listeners: Vec::new(),
        };
        let buf = ed.add_buffer("", Vec::new());
        let win = ed.alloc_window(buf);
        let tab = ed.alloc_tab(win);
        ed.current_tab = tab;
        ed
    }

    pub fn add_listener(&mut self, listener: Weak<dyn EntityListener>) {
        self.listeners.retain(|l| l.strong_count() > 0);
        self.listeners.push(listener);
    }

    fn notify(&self, f: impl Fn(&dyn EntityListener)) {
        for l in &self.listeners {
            if let Some(l) = l.upgrade() {
                f(&*l);
            }
        }
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    pub fn msg(&mut self, text: impl Into<String>) {
        self.messages.push(Message::Info(text.into()));
    }

    pub fn emsg(&mut self, text: impl Into<String>) {
        self.messages.push(Message::Error(text.into()));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn take_messages(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }

    // ── Variable scopes ───────────────────────────────────────────────────────

    /// `g:` dictionary.
    pub fn globals(&self) -> &Dict {
        &self.globals
    }

    /// `v:` dictionary.
    pub fn vimvars(&self) -> &Dict {
        &self.vimvars
    }

    // ── Buffers ───────────────────────────────────────────────────────────────

    pub fn add_buffer(&mut self, name: &str, lines: Vec<String>) -> BufferId {
        let number = self.next_buffer;
        self.next_buffer += 1;
        let lines = if lines.is_empty() { vec![String::new()] } else { lines };
        self.buffers.insert(
            number,
            Buffer {
                number,
                name: name.to_owned(),
                lines,
                vars: Dict::with_scope(Scope::DefScope),
                changed: false,
            },
        );
        debug!(buffer = number, name, "buffer created");
        number
    }

    pub fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(&id)
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> Result<&mut Buffer, EditorError> {
        self.buffers.get_mut(&id).ok_or(EditorError::NoSuchBuffer(id))
    }

    pub fn buffer_ids(&self) -> Vec<BufferId> {
        self.buffers.keys().copied().collect()
    }

    pub fn rename_buffer(&mut self, id: BufferId, name: &str) -> Result<(), EditorError> {
        self.buffer_mut(id)?.name = name.to_owned();
        Ok(())
    }

    /// Replace lines `lo..hi` (0-based, exclusive) with `new`.
    ///
    /// A buffer never becomes empty: removing every line leaves one empty
    /// line behind.  Cursors past the new end are clamped.
    pub fn replace_lines(
        &mut self,
        id: BufferId,
        lo: usize,
        hi: usize,
        new: Vec<String>,
    ) -> Result<(), EditorError> {
        let buf = self.buffer_mut(id)?;
        let len = buf.lines.len();
        if lo > len || hi > len || lo > hi {
            return Err(EditorError::InvalidLine(hi.max(lo)));
        }
        buf.lines.splice(lo..hi, new);
        if buf.lines.is_empty() {
            buf.lines.push(String::new());
        }
        buf.changed = true;
        let count = buf.lines.len();
        for w in self.windows.values_mut().filter(|w| w.buffer == id) {
            if w.cursor.0 > count {
                w.cursor = (count, 0);
            }
        }
        Ok(())
    }

    /// Insert `new` after 0-based line position `after` (0 inserts at top).
    pub fn insert_lines(&mut self, id: BufferId, after: usize, new: Vec<String>) -> Result<(), EditorError> {
        self.replace_lines(id, after, after, new)
    }

    /// Wipe a buffer out.  Windows showing it switch to another buffer.
    pub fn wipe_buffer(&mut self, id: BufferId) -> Result<(), EditorError> {
        if !self.buffers.contains_key(&id) {
            return Err(EditorError::NoSuchBuffer(id));
        }
        let Some(other) = self.buffers.keys().copied().find(|&b| b != id) else {
            return Err(EditorError::LastBuffer);
        };
        for w in self.windows.values_mut().filter(|w| w.buffer == id) {
            w.buffer = other;
            w.cursor = (1, 0);
        }
        self.notify(|l| l.buffer_destroyed(id));
        self.buffers.remove(&id);
        debug!(buffer = id, "buffer wiped");
        Ok(())
    }

    // ── Windows ───────────────────────────────────────────────────────────────

    fn alloc_window(&mut self, buffer: BufferId) -> WindowId {
        let id = self.next_window;
        self.next_window += 1;
        self.windows.insert(
            id,
            Window {
                id,
                buffer,
                cursor: (1, 0),
                height: DEFAULT_HEIGHT,
                width: DEFAULT_WIDTH,
                vars: Dict::with_scope(Scope::DefScope),
            },
        );
        id
    }

    pub fn window(&self, id: WindowId) -> Option<&Window> {
        self.windows.get(&id)
    }

    pub fn window_mut(&mut self, id: WindowId) -> Result<&mut Window, EditorError> {
        self.windows.get_mut(&id).ok_or(EditorError::NoSuchWindow(id))
    }

    /// Split the current window; the new window shows `buffer` and becomes current.
    pub fn split_window(&mut self, buffer: BufferId) -> Result<WindowId, EditorError> {
        if !self.buffers.contains_key(&buffer) {
            return Err(EditorError::NoSuchBuffer(buffer));
        }
        let win = self.alloc_window(buffer);
        let tab = self.tab_mut(self.current_tab)?;
        let pos = tab.windows.iter().position(|&w| w == tab.current).unwrap_or(0);
        tab.windows.insert(pos, win);
        tab.current = win;
        Ok(win)
    }

    /// Close a window.  Closing the last window of a tab page closes the tab.
    pub fn close_window(&mut self, id: WindowId) -> Result<(), EditorError> {
        let tab_id = self.window_tab(id).ok_or(EditorError::NoSuchWindow(id))?;
        let tab_index = self.tab_index(tab_id).ok_or(EditorError::NoSuchTab(tab_id))?;
        if self.tabs[tab_index].windows.len() == 1 {
            if self.tabs.len() == 1 {
                return Err(EditorError::LastWindow);
            }
            return self.close_tab(tab_id);
        }
        let tab = &mut self.tabs[tab_index];
        let pos = tab.windows.iter().position(|&w| w == id).unwrap_or(0);
        tab.windows.remove(pos);
        if tab.current == id {
            tab.current = tab.windows[pos.min(tab.windows.len() - 1)];
        }
        self.notify(|l| l.window_destroyed(id));
        self.windows.remove(&id);
        Ok(())
    }

    /// Tab page that contains window `id`.
    pub fn window_tab(&self, id: WindowId) -> Option<TabId> {
        self.tabs.iter().find(|t| t.windows.contains(&id)).map(|t| t.id)
    }

    /// 1-based position of a window within its tab page.
    pub fn window_number(&self, id: WindowId) -> Option<usize> {
        let tab = self.tabs.iter().find(|t| t.windows.contains(&id))?;
        tab.windows.iter().position(|&w| w == id).map(|p| p + 1)
    }

    pub fn set_cursor(&mut self, id: WindowId, row: usize, col: usize) -> Result<(), EditorError> {
        let buffer = self.window(id).ok_or(EditorError::NoSuchWindow(id))?.buffer;
        let count = self.buffer(buffer).map(Buffer::line_count).unwrap_or(0);
        if row == 0 || row > count {
            return Err(EditorError::CursorOutside);
        }
        self.window_mut(id)?.cursor = (row, col);
        Ok(())
    }

    // ── Tab pages ─────────────────────────────────────────────────────────────

    fn alloc_tab(&mut self, window: WindowId) -> TabId {
        let id = self.next_tab;
        self.next_tab += 1;
        self.tabs.push(TabPage {
            id,
            windows: vec![window],
            current: window,
            vars: Dict::with_scope(Scope::DefScope),
        });
        id
    }

    fn tab_index(&self, id: TabId) -> Option<usize> {
        self.tabs.iter().position(|t| t.id == id)
    }

    pub fn tab(&self, id: TabId) -> Option<&TabPage> {
        self.tabs.iter().find(|t| t.id == id)
    }

    fn tab_mut(&mut self, id: TabId) -> Result<&mut TabPage, EditorError> {
        self.tabs.iter_mut().find(|t| t.id == id).ok_or(EditorError::NoSuchTab(id))
    }

    pub fn tabs(&self) -> &[TabPage] {
        &self.tabs
    }

    /// 1-based position of a tab page.
    pub fn tab_number(&self, id: TabId) -> Option<usize> {
        self.tab_index(id).map(|i| i + 1)
    }

    /// Open a new tab page showing `buffer`; it becomes current.
    pub fn new_tab(&mut self, buffer: BufferId) -> Result<TabId, EditorError> {
        if !self.buffers.contains_key(&buffer) {
            return Err(EditorError::NoSuchBuffer(buffer));
        }
        let win = self.alloc_window(buffer);
        let tab = self.alloc_tab(win);
        self.current_tab = tab;
        Ok(tab)
    }

    /// Close a tab page and all of its windows.
    pub fn close_tab(&mut self, id: TabId) -> Result<(), EditorError> {
        let index = self.tab_index(id).ok_or(EditorError::NoSuchTab(id))?;
        if self.tabs.len() == 1 {
            return Err(EditorError::LastWindow);
        }
        let tab = self.tabs.remove(index);
        for w in &tab.windows {
            self.notify(|l| l.window_destroyed(*w));
            self.windows.remove(w);
        }
        self.notify(|l| l.tabpage_destroyed(id));
        if self.current_tab == id {
            self.current_tab = self.tabs[index.min(self.tabs.len() - 1)].id;
        }
        Ok(())
    }

    // ── Current entities ──────────────────────────────────────────────────────

    pub fn current_tab(&self) -> TabId {
        self.current_tab
    }

    pub fn current_window(&self) -> WindowId {
        self.tab(self.current_tab).map(|t| t.current).unwrap_or_default()
    }

    pub fn current_buffer(&self) -> BufferId {
        self.window(self.current_window()).map(|w| w.buffer).unwrap_or_default()
    }

    /// Make `id` the current window, switching tab pages if needed.
    pub fn set_current_window(&mut self, id: WindowId) -> Result<(), EditorError> {
        let tab = self.window_tab(id).ok_or(EditorError::NoSuchWindow(id))?;
        self.tab_mut(tab)?.current = id;
        self.current_tab = tab;
        Ok(())
    }

    pub fn set_current_tab(&mut self, id: TabId) -> Result<(), EditorError> {
        self.tab_index(id).ok_or(EditorError::NoSuchTab(id))?;
        self.current_tab = id;
        Ok(())
    }

    /// Show `id` in the current window.
    pub fn set_current_buffer(&mut self, id: BufferId) -> Result<(), EditorError> {
        if !self.buffers.contains_key(&id) {
            return Err(EditorError::NoSuchBuffer(id));
        }
        let win = self.current_window();
        let w = self.window_mut(win)?;
        w.buffer = id;
        w.cursor = (1, 0);
        Ok(())
    }

    /// Cursor row (1-based) of the current window.
    pub fn cursor_line(&self) -> usize {
        self.window(self.current_window()).map(|w| w.cursor.0).unwrap_or(1)
    }
}
