//! Source positions and the input buffer stack.
//!
//! Input is consumed one logical line at a time from a stack of frames. The
//! bottom frame is the primary source file; `.include` pushes a frame owning
//! the included file's lines, and macro/`.rept`/`.irp` expansion pushes a
//! frame owning the expanded body. Popping a frame releases its storage.
//!
//! Every line carries a [`SourceLoc`] so that symbols, frags, fixups, and
//! diagnostics can point back at where they came from, even out of a macro
//! body defined in another file.

use ferrite_entity::{entity_impl, PrimaryMap};
use std::fmt;

/// An opaque reference to an input file (or pseudo-file such as a macro
/// body) registered in the [`SourceMap`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);
entity_impl!(FileId, "file");

/// A source location: file and 1-based line number.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SourceLoc {
    /// The file the line came from.
    pub file: FileId,
    /// 1-based line number; 0 means "no line information".
    pub line: u32,
}

impl SourceLoc {
    /// Create a new location.
    pub fn new(file: FileId, line: u32) -> Self {
        Self { file, line }
    }

    /// Is this the default "nowhere" location?
    pub fn is_default(self) -> bool {
        self == Self::default()
    }
}

impl Default for SourceLoc {
    fn default() -> Self {
        Self {
            file: FileId::from_u32(0),
            line: 0,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Registry of input file names.
#[derive(Debug, Default)]
pub struct SourceMap {
    names: PrimaryMap<FileId, String>,
}

impl SourceMap {
    /// Register a file name, returning its id.
    pub fn add(&mut self, name: impl Into<String>) -> FileId {
        self.names.push(name.into())
    }

    /// Get the name registered for `file`.
    pub fn name(&self, file: FileId) -> &str {
        self.names
            .get(file)
            .map(String::as_str)
            .unwrap_or("<unknown>")
    }

    /// Render `loc` as `name:line` for a diagnostic.
    pub fn describe(&self, loc: SourceLoc) -> String {
        format!("{}:{}", self.name(loc.file), loc.line)
    }
}

/// What pushed an input frame. Expansion frames replay stored lines with
/// the locations recorded when the body was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// The primary input file.
    File,
    /// An `.include`d file.
    Include,
    /// A macro body, `.rept` body, or `.irp`/`.irpc` body.
    Expansion,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    lines: Vec<(SourceLoc, String)>,
    pos: usize,
}

/// The input stack: owns every pending buffer and hands out lines in
/// source order, innermost frame first.
#[derive(Debug, Default)]
pub struct SourceStack {
    /// File-name registry, shared with diagnostics rendering.
    pub map: SourceMap,
    frames: Vec<Frame>,
    last: SourceLoc,
}

impl SourceStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `text` into numbered lines attributed to `file`.
    fn number_lines(file: FileId, text: &str) -> Vec<(SourceLoc, String)> {
        text.lines()
            .enumerate()
            .map(|(i, l)| (SourceLoc::new(file, i as u32 + 1), l.to_string()))
            .collect()
    }

    /// Push the primary source file.
    pub fn push_file(&mut self, name: impl Into<String>, text: &str) -> FileId {
        let file = self.map.add(name);
        self.frames.push(Frame {
            kind: FrameKind::File,
            lines: Self::number_lines(file, text),
            pos: 0,
        });
        file
    }

    /// Push an `.include`d file on top of the current frame.
    pub fn push_include(&mut self, name: impl Into<String>, text: &str) -> FileId {
        let file = self.map.add(name);
        self.frames.push(Frame {
            kind: FrameKind::Include,
            lines: Self::number_lines(file, text),
            pos: 0,
        });
        file
    }

    /// Push an expansion body: lines keep the locations they were captured
    /// with, so diagnostics point into the macro definition.
    pub fn push_expansion(&mut self, lines: Vec<(SourceLoc, String)>) {
        self.frames.push(Frame {
            kind: FrameKind::Expansion,
            lines,
            pos: 0,
        });
    }

    /// Pop the innermost expansion frame, if any. Used by `.mexit`.
    pub fn pop_expansion(&mut self) -> bool {
        match self.frames.last() {
            Some(f) if f.kind == FrameKind::Expansion => {
                self.frames.pop();
                true
            }
            _ => false,
        }
    }

    /// Current expansion nesting depth.
    pub fn expansion_depth(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| f.kind == FrameKind::Expansion)
            .count()
    }

    /// Fetch the next input line, popping exhausted frames.
    pub fn next_line(&mut self) -> Option<(SourceLoc, String)> {
        loop {
            let frame = self.frames.last_mut()?;
            if frame.pos >= frame.lines.len() {
                self.frames.pop();
                continue;
            }
            let (loc, line) = frame.lines[frame.pos].clone();
            frame.pos += 1;
            self.last = loc;
            return Some((loc, line));
        }
    }

    /// The location of the most recently fetched line.
    pub fn here(&self) -> SourceLoc {
        self.last
    }

    /// Override the logical line number of the current frame (`.line`).
    pub fn set_logical_line(&mut self, line: u32) {
        if let Some(frame) = self.frames.last_mut() {
            let mut n = line;
            for i in frame.pos..frame.lines.len() {
                frame.lines[i].0.line = n;
                n += 1;
            }
        }
        self.last.line = line.saturating_sub(1);
    }

    /// Override the logical file of the current frame (`.file`).
    pub fn set_logical_file(&mut self, name: impl Into<String>) {
        let file = self.map.add(name);
        if let Some(frame) = self.frames.last_mut() {
            for i in frame.pos..frame.lines.len() {
                frame.lines[i].0.file = file;
            }
        }
        self.last.file = file;
    }
}

/// A byte cursor over one statement.
///
/// This is the moral equivalent of `input_line_pointer`: cheap to clone for
/// backtracking, with helpers for the token shapes the assembler needs.
#[derive(Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

/// True for characters that may begin a symbol name.
pub fn is_name_beginner(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'.' || c == b'$'
}

/// True for characters that may appear inside a symbol name.
pub fn is_part_of_name(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'$'
}

impl<'a> Cursor<'a> {
    /// Create a cursor over `s`.
    pub fn new(s: &'a str) -> Self {
        Self {
            buf: s.as_bytes(),
            pos: 0,
        }
    }

    /// Current byte offset.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Rewind or advance to an absolute offset.
    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    /// Byte at the cursor, if any.
    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Byte one past the cursor, if any.
    pub fn peek2(&self) -> Option<u8> {
        self.buf.get(self.pos + 1).copied()
    }

    /// Consume and return the byte at the cursor.
    pub fn next_byte(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    /// Advance over the current byte.
    pub fn bump(&mut self) {
        if self.pos < self.buf.len() {
            self.pos += 1;
        }
    }

    /// Step back one byte.
    pub fn back(&mut self) {
        if self.pos > 0 {
            self.pos -= 1;
        }
    }

    /// Consume `c` if it is next, returning whether it was.
    pub fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Skip spaces and tabs.
    pub fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
    }

    /// At end of statement?
    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Everything from the cursor to the end of the statement.
    pub fn rest(&self) -> &'a str {
        // The buffer came from a &str, so slicing at byte positions we have
        // only moved across ASCII keeps it valid UTF-8.
        std::str::from_utf8(&self.buf[self.pos..]).unwrap_or("")
    }

    /// Take a symbol name if one starts here; the cursor moves past it.
    pub fn take_name(&mut self) -> Option<&'a str> {
        let start = self.pos;
        match self.peek() {
            Some(c) if is_name_beginner(c) => self.pos += 1,
            _ => return None,
        }
        while matches!(self.peek(), Some(c) if is_part_of_name(c)) {
            self.pos += 1;
        }
        std::str::from_utf8(&self.buf[start..self.pos]).ok()
    }

    /// Case-insensitive match of `word` at the cursor, consumed on success.
    pub fn eat_keyword(&mut self, word: &str) -> bool {
        let end = self.pos + word.len();
        if end > self.buf.len() {
            return false;
        }
        if self.buf[self.pos..end].eq_ignore_ascii_case(word.as_bytes()) {
            self.pos = end;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_pops_in_order() {
        let mut s = SourceStack::new();
        s.push_file("a.s", "one\ntwo");
        let (l1, t1) = s.next_line().unwrap();
        assert_eq!((l1.line, t1.as_str()), (1, "one"));
        s.push_include("b.s", "inner");
        assert_eq!(s.next_line().unwrap().1, "inner");
        let (l2, t2) = s.next_line().unwrap();
        assert_eq!((l2.line, t2.as_str()), (2, "two"));
        assert!(s.next_line().is_none());
    }

    #[test]
    fn expansion_keeps_captured_locs() {
        let mut s = SourceStack::new();
        let f = s.push_file("a.s", "x");
        s.next_line();
        let body = vec![(SourceLoc::new(f, 1), "nop".to_string())];
        s.push_expansion(body);
        let (loc, line) = s.next_line().unwrap();
        assert_eq!(loc, SourceLoc::new(f, 1));
        assert_eq!(line, "nop");
    }

    #[test]
    fn cursor_names() {
        let mut c = Cursor::new("  foo_1+2");
        c.skip_whitespace();
        assert_eq!(c.take_name(), Some("foo_1"));
        assert_eq!(c.peek(), Some(b'+'));
        assert!(!c.at_end());
    }
}
