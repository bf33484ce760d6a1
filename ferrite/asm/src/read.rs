//! The statement reader: labels, directives, and instruction dispatch.
//!
//! Each input line is split into statements, labels are peeled off, and the
//! rest is either a pseudo-op handled here, a macro invocation, or an
//! instruction handed to the target backend. Conditional assembly, macro
//! capture, and `.rept`/`.irp` repetition are all driven from this layer;
//! expansion bodies go back through the source stack so everything below
//! sees one uniform stream of statements.

use crate::context::Assembler;
use crate::expr::{self, Big, Expr, ExprValue};
use crate::frag::FragKind;
use crate::section::{LinkOnce, SectionFlags, SectionId};
use crate::source::{Cursor, SourceLoc};
use crate::symbol::{Segment, SymbolFlags};
use crate::target::{RelocKind, TargetOps};
use crate::write::number_to_chars;
use crate::{AsmError, AsmResult};

/// One entry of the conditional-assembly stack.
#[derive(Debug, Clone)]
pub struct CondFrame {
    /// This branch's condition held and the enclosing context is active.
    pub active: bool,
    /// Some branch of this conditional has already been taken.
    pub taken: bool,
    /// `.else` already seen.
    pub else_seen: bool,
    /// Where the conditional began, for unterminated-conditional reports.
    pub loc: SourceLoc,
}

/// A defined macro.
#[derive(Debug, Clone)]
pub struct MacroDef {
    /// Formal parameter names with optional defaults.
    pub params: Vec<(String, String)>,
    /// Captured body lines.
    pub body: Vec<(SourceLoc, String)>,
    /// Definition site.
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureKind {
    Macro,
    Rept,
    Irp,
    Irpc,
}

struct Capture {
    kind: CaptureKind,
    depth: usize,
    loc: SourceLoc,
    /// `.macro` header text or the `.irp` argument list.
    header: String,
    lines: Vec<(SourceLoc, String)>,
}

struct ReadState {
    capture: Option<Capture>,
    finished: bool,
    macro_counter: u32,
}

/// Drive the reader over everything on the source stack.
pub fn read_source(asm: &mut Assembler, target: &dyn TargetOps) -> AsmResult<()> {
    let mut state = ReadState {
        capture: None,
        finished: false,
        macro_counter: 0,
    };

    while let Some((loc, line)) = asm.sources.next_line() {
        if state.capture.is_some() {
            capture_line(asm, &mut state, loc, &line)?;
            continue;
        }
        for stmt in split_statements(&line, target.separator_char(), target.comment_char()) {
            process_statement(asm, target, &mut state, &stmt)?;
            if state.finished {
                return Ok(());
            }
        }
    }

    if let Some(capture) = &state.capture {
        let what = match capture.kind {
            CaptureKind::Macro => ".endm",
            _ => ".endr",
        };
        let loc = capture.loc;
        asm.diag.error(loc, format!("end of input; expected {what}"));
    }
    if let Some(frame) = asm.conds.last() {
        let loc = frame.loc;
        asm.diag.error(loc, "end of input inside a conditional");
    }
    Ok(())
}

/// Split a raw line into statements, honoring quotes and stripping the
/// line comment.
fn split_statements(line: &str, separator: u8, comment: u8) -> Vec<String> {
    let bytes = line.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            if c == b'\\' {
                i += 1;
            } else if c == b'"' {
                in_string = false;
            }
        } else if c == b'"' {
            in_string = true;
        } else if c == b'\'' {
            // A character constant swallows the next byte verbatim.
            i += 1;
        } else if c == comment {
            break;
        } else if c == separator {
            out.push(line[start..i].to_string());
            start = i + 1;
        }
        i += 1;
    }
    let end = i.min(bytes.len());
    out.push(line[start..end].to_string());
    out.retain(|s| !s.trim().is_empty());
    out
}

fn directive_name(stmt: &str) -> Option<String> {
    let mut cur = Cursor::new(stmt);
    cur.skip_whitespace();
    let name = cur.take_name()?;
    name.strip_prefix('.').map(|n| n.to_ascii_lowercase())
}

fn capture_line(
    asm: &mut Assembler,
    state: &mut ReadState,
    loc: SourceLoc,
    line: &str,
) -> AsmResult<()> {
    let dir = directive_name(line);
    let capture = state.capture.as_mut().expect("capture mode");

    if let Some(d) = dir.as_deref() {
        match d {
            "macro" | "rept" | "irp" | "irpc" | "irep" | "irepc" => capture.depth += 1,
            "endm" | "endr" => {
                if capture.depth == 0 {
                    let capture = state.capture.take().expect("capture mode");
                    let matches = match capture.kind {
                        CaptureKind::Macro => d == "endm",
                        _ => d == "endr",
                    };
                    if !matches {
                        asm.diag.error(loc, format!("unexpected .{d}"));
                    }
                    finish_capture(asm, state, capture);
                    return Ok(());
                }
                capture.depth -= 1;
            }
            _ => {}
        }
    }
    capture.lines.push((loc, line.to_string()));
    Ok(())
}

fn finish_capture(asm: &mut Assembler, state: &mut ReadState, capture: Capture) {
    match capture.kind {
        CaptureKind::Macro => {
            let mut cur = Cursor::new(&capture.header);
            cur.skip_whitespace();
            let Some(name) = cur.take_name() else {
                let loc = capture.loc;
                asm.diag.error(loc, ".macro needs a name");
                return;
            };
            let name = name.to_ascii_lowercase();
            let mut params = Vec::new();
            loop {
                cur.skip_whitespace();
                cur.eat(b',');
                cur.skip_whitespace();
                let Some(p) = cur.take_name() else { break };
                let p = p.to_string();
                let mut default = String::new();
                cur.skip_whitespace();
                if cur.eat(b'=') {
                    cur.skip_whitespace();
                    let rest = cur.rest();
                    let end = rest.find(',').unwrap_or(rest.len());
                    default = rest[..end].trim().to_string();
                    cur.set_pos(cur.pos() + end);
                }
                params.push((p, default));
            }
            asm.macros.insert(
                name,
                MacroDef {
                    params,
                    body: capture.lines,
                    loc: capture.loc,
                },
            );
        }

        CaptureKind::Rept => {
            let count: i64 = capture.header.trim().parse().unwrap_or(0);
            if count < 0 {
                let loc = capture.loc;
                asm.diag.error(loc, ".rept count must not be negative");
                return;
            }
            let mut lines = Vec::new();
            for _ in 0..count {
                lines.extend(capture.lines.iter().cloned());
            }
            asm.sources.push_expansion(lines);
        }

        CaptureKind::Irp | CaptureKind::Irpc => {
            let mut header = Cursor::new(&capture.header);
            header.skip_whitespace();
            let Some(param) = header.take_name() else {
                let loc = capture.loc;
                asm.diag.error(loc, ".irp needs a parameter name");
                return;
            };
            let param = param.to_string();
            header.skip_whitespace();
            header.eat(b',');
            let rest = header.rest().trim().to_string();

            let values: Vec<String> = if capture.kind == CaptureKind::Irpc {
                rest.chars().map(|c| c.to_string()).collect()
            } else {
                rest.split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect()
            };

            let mut lines = Vec::new();
            for value in &values {
                for (loc, body_line) in &capture.lines {
                    let substituted = substitute_params(
                        body_line,
                        &[(param.clone(), value.clone())],
                        state.macro_counter,
                    );
                    lines.push((*loc, substituted));
                }
            }
            state.macro_counter += 1;
            asm.sources.push_expansion(lines);
        }
    }
}

/// Replace `\param` references (and `\@`, the invocation counter).
fn substitute_params(line: &str, args: &[(String, String)], counter: u32) -> String {
    let mut out = String::with_capacity(line.len());
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            if bytes[i + 1] == b'@' {
                out.push_str(&counter.to_string());
                i += 2;
                continue;
            }
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && crate::source::is_part_of_name(bytes[end]) {
                end += 1;
            }
            if end > start {
                let name = &line[start..end];
                if let Some((_, value)) = args.iter().find(|(p, _)| p == name) {
                    out.push_str(value);
                    // A trailing `&` glues the substitution to what
                    // follows.
                    if end < bytes.len() && bytes[end] == b'&' {
                        end += 1;
                    }
                    i = end;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn in_false_branch(asm: &Assembler) -> bool {
    asm.conds.last().map(|f| !f.active).unwrap_or(false)
}

fn process_statement(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    state: &mut ReadState,
    stmt: &str,
) -> AsmResult<()> {
    let mut cur = Cursor::new(stmt);
    cur.skip_whitespace();
    if cur.at_end() {
        return Ok(());
    }

    // In the untaken branch of a conditional only the conditional
    // directives themselves matter.
    if in_false_branch(asm) {
        if let Some(d) = directive_name(stmt) {
            match d.as_str() {
                "if" | "ifdef" | "ifndef" | "ifnotdef" | "ifeq" | "ifne" | "ifge" | "ifgt"
                | "ifle" | "iflt" | "ifc" | "ifnc" | "ifeqs" | "ifnes" | "else" | "elsec"
                | "endif" | "endc" => {
                    cur.take_name();
                    return dispatch_conditional(asm, target, &d, &mut cur);
                }
                _ => return Ok(()),
            }
        }
        return Ok(());
    }

    // Peel off labels.
    loop {
        cur.skip_whitespace();
        let save = cur.pos();

        if matches!(cur.peek(), Some(c) if c.is_ascii_digit()) {
            let mut n: u32 = 0;
            while let Some(c) = cur.peek() {
                if !c.is_ascii_digit() {
                    break;
                }
                n = n.wrapping_mul(10).wrapping_add((c - b'0') as u32);
                cur.bump();
            }
            if cur.eat(b':') {
                asm.symbols.fb_label_increment(n);
                let name = asm.symbols.fb_label_name(n, false);
                asm.colon(&name);
                continue;
            }
            cur.set_pos(save);
            break;
        }

        let Some(name) = cur.take_name() else { break };
        let name = name.to_string();
        cur.skip_whitespace();
        if cur.eat(b':') {
            asm.colon(&name);
            continue;
        }
        if cur.peek() == Some(b'=') && cur.peek2() != Some(b'=') {
            cur.bump();
            let (seg, e) = expr::expression(asm, target, &mut cur);
            asm.equate(&name, seg, e);
            return demand_empty(asm, &mut cur);
        }
        cur.set_pos(save);
        break;
    }

    cur.skip_whitespace();
    if cur.at_end() {
        return Ok(());
    }

    let save = cur.pos();
    let Some(word) = cur.take_name() else {
        let rest = cur.rest().to_string();
        asm.error(format!("junk at end of line: `{rest}'"));
        return Ok(());
    };
    let word_string = word.to_string();

    if let Some(bare) = word_string.strip_prefix('.') {
        return dispatch_directive(asm, target, state, &bare.to_ascii_lowercase(), &mut cur);
    }

    let lowered = word_string.to_ascii_lowercase();
    // MRI mode accepts pseudo-ops without the leading dot.
    if asm.opts.mri && is_known_directive(&lowered) {
        return dispatch_directive(asm, target, state, &lowered, &mut cur);
    }

    if asm.macros.contains_key(&lowered) {
        expand_macro(asm, state, &lowered, &mut cur);
        return Ok(());
    }

    cur.set_pos(save);
    target.assemble(asm, &mut cur);
    Ok(())
}

fn is_known_directive(name: &str) -> bool {
    matches!(
        name,
        "equ" | "set"
            | "common"
            | "common.s"
            | "dc"
            | "dc.b"
            | "dc.w"
            | "dc.l"
            | "dc.s"
            | "dc.d"
            | "dcb"
            | "dcb.b"
            | "dcb.w"
            | "dcb.l"
            | "ds"
            | "ds.b"
            | "ds.w"
            | "ds.l"
            | "ds.d"
            | "end"
            | "fail"
            | "format"
            | "global"
            | "include"
            | "irp"
            | "irpc"
            | "macro"
            | "endm"
            | "mexit"
            | "rept"
            | "endr"
            | "print"
            | "org"
    )
}

fn demand_empty(asm: &mut Assembler, cur: &mut Cursor) -> AsmResult<()> {
    cur.skip_whitespace();
    if !cur.at_end() {
        let rest = cur.rest().to_string();
        asm.error(format!("junk at end of line: `{rest}'"));
    }
    Ok(())
}

fn dispatch_conditional(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    name: &str,
    cur: &mut Cursor,
) -> AsmResult<()> {
    let loc = asm.here();
    let parent_active = asm.conds.last().map(|f| f.active).unwrap_or(true);

    let push = |asm: &mut Assembler, t: bool| {
        let active = parent_active && t;
        asm.conds.push(CondFrame {
            active,
            taken: active,
            else_seen: false,
            loc,
        });
    };

    match name {
        "if" | "ifeq" | "ifne" | "ifge" | "ifgt" | "ifle" | "iflt" => {
            let t = if parent_active {
                let v = expr::absolute_expression(asm, target, cur);
                match name {
                    "ifeq" => v == 0,
                    "ifge" => v >= 0,
                    "ifgt" => v > 0,
                    "ifle" => v <= 0,
                    "iflt" => v < 0,
                    _ => v != 0,
                }
            } else {
                false
            };
            push(asm, t);
        }

        "ifdef" | "ifndef" | "ifnotdef" => {
            cur.skip_whitespace();
            let defined = cur
                .take_name()
                .and_then(|n| asm.symbol_find(n))
                .map(|s| asm.symbols.syms[s].is_defined())
                .unwrap_or(false);
            let invert = name != "ifdef";
            push(asm, defined != invert);
        }

        "ifc" | "ifnc" => {
            let a = take_opt_quoted(cur);
            cur.skip_whitespace();
            cur.eat(b',');
            let b = take_opt_quoted(cur);
            let same = a.trim() == b.trim();
            push(asm, same == (name == "ifc"));
        }

        "ifeqs" | "ifnes" => {
            let a = take_quoted(asm, cur).unwrap_or_default();
            cur.skip_whitespace();
            cur.eat(b',');
            cur.skip_whitespace();
            let b = take_quoted(asm, cur).unwrap_or_default();
            push(asm, (a == b) == (name == "ifeqs"));
        }

        "else" | "elsec" => {
            let n = asm.conds.len();
            if n == 0 {
                asm.error(".else without .if");
            } else {
                let parent = if n >= 2 { asm.conds[n - 2].active } else { true };
                if asm.conds[n - 1].else_seen {
                    asm.error("duplicate .else");
                }
                let frame = &mut asm.conds[n - 1];
                frame.else_seen = true;
                frame.active = parent && !frame.taken;
                if frame.active {
                    frame.taken = true;
                }
            }
        }

        "endif" | "endc" => {
            if asm.conds.pop().is_none() {
                asm.error(".endif without .if");
            }
        }

        _ => unreachable!("not a conditional: {name}"),
    }
    Ok(())
}

fn take_quoted(asm: &mut Assembler, cur: &mut Cursor) -> Option<String> {
    cur.skip_whitespace();
    if !cur.eat(b'"') {
        asm.error("expected string");
        return None;
    }
    let mut out = String::new();
    loop {
        match cur.next_byte() {
            None => {
                asm.error("unterminated string");
                return Some(out);
            }
            Some(b'"') => return Some(out),
            Some(b'\\') => {
                let c = cur.next_byte().unwrap_or(b'\\');
                out.push(escape_char(cur, c) as char);
            }
            Some(c) => out.push(c as char),
        }
    }
}

fn take_opt_quoted(cur: &mut Cursor) -> String {
    cur.skip_whitespace();
    if cur.peek() == Some(b'"') {
        cur.bump();
        let mut out = String::new();
        while let Some(c) = cur.next_byte() {
            if c == b'"' {
                break;
            }
            out.push(c as char);
        }
        out
    } else {
        let rest = cur.rest();
        let end = rest.find(',').unwrap_or(rest.len());
        let s = rest[..end].to_string();
        cur.set_pos(cur.pos() + end);
        s
    }
}

fn escape_char(cur: &mut Cursor, c: u8) -> u8 {
    match c {
        b'b' => 8,
        b'f' => 12,
        b'n' => b'\n',
        b'r' => b'\r',
        b't' => b'\t',
        b'v' => 11,
        b'x' | b'X' => {
            let mut v: u32 = 0;
            while let Some(h) = cur.peek() {
                let d = match h {
                    b'0'..=b'9' => (h - b'0') as u32,
                    b'a'..=b'f' => (h - b'a') as u32 + 10,
                    b'A'..=b'F' => (h - b'A') as u32 + 10,
                    _ => break,
                };
                v = (v << 4) | d;
                cur.bump();
            }
            v as u8
        }
        b'0'..=b'7' => {
            let mut v: u32 = (c - b'0') as u32;
            for _ in 0..2 {
                match cur.peek() {
                    Some(o @ b'0'..=b'7') => {
                        v = (v << 3) | (o - b'0') as u32;
                        cur.bump();
                    }
                    _ => break,
                }
            }
            v as u8
        }
        other => other,
    }
}

#[allow(clippy::too_many_lines)]
fn dispatch_directive(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    state: &mut ReadState,
    name: &str,
    cur: &mut Cursor,
) -> AsmResult<()> {
    match name {
        "if" | "ifdef" | "ifndef" | "ifnotdef" | "ifeq" | "ifne" | "ifge" | "ifgt" | "ifle"
        | "iflt" | "ifc" | "ifnc" | "ifeqs" | "ifnes" | "else" | "elsec" | "endif" | "endc" => {
            return dispatch_conditional(asm, target, name, cur);
        }

        "abort" => {
            return Err(AsmError::Aborted(".abort detected".to_string()));
        }

        "align" => s_align(asm, target, cur, false, 1),
        "balign" => s_align(asm, target, cur, true, 1),
        "balignw" => s_align(asm, target, cur, true, 2),
        "balignl" => s_align(asm, target, cur, true, 4),
        "p2align" => s_align(asm, target, cur, false, 1),
        "p2alignw" => s_align(asm, target, cur, false, 2),
        "p2alignl" => s_align(asm, target, cur, false, 4),

        "ascii" => stringer(asm, cur, false),
        "asciz" | "string" => stringer(asm, cur, true),

        "byte" | "dc.b" => cons(asm, target, cur, 1, false),
        "word" | "hword" | "short" | "dc.w" | "dc" => cons(asm, target, cur, 2, false),
        "long" | "int" | "dc.l" => cons(asm, target, cur, 4, false),
        "quad" => cons(asm, target, cur, 8, false),
        "octa" => cons(asm, target, cur, 16, false),
        "rva" => cons(asm, target, cur, 4, true),

        "float" | "single" | "dc.s" => float_cons(asm, target, cur, 4),
        "double" | "dc.d" => float_cons(asm, target, cur, 8),

        "comm" => s_comm(asm, target, cur),
        "common" => s_mri_common(asm, target, cur),
        "common.s" => s_mri_common(asm, target, cur),
        "lcomm" => s_lcomm(asm, target, cur),

        "text" => {
            let text = asm.text;
            s_switch(asm, target, cur, text)
        }
        "data" => {
            let data = asm.data;
            s_switch(asm, target, cur, data)
        }
        "section" => s_section(asm, target, cur),

        "globl" | "global" => s_globl(asm, cur),
        "extern" => Ok(()), // All undefined symbols are external anyway.
        "weak" => s_weak(asm, cur),

        "set" | "equ" => s_set(asm, target, cur),
        "lsym" => s_set(asm, target, cur),

        "org" => s_org(asm, target, cur),
        "space" | "skip" | "zero" | "block" => s_space(asm, target, cur, 1),
        "ds" | "ds.w" | "dcb" | "dcb.w" => s_space(asm, target, cur, 2),
        "ds.b" | "dcb.b" => s_space(asm, target, cur, 1),
        "ds.l" | "dcb.l" | "ds.s" => s_space(asm, target, cur, 4),
        "ds.d" => s_space(asm, target, cur, 8),
        "fill" => s_fill(asm, target, cur),

        "linkonce" => s_linkonce(asm, cur),

        "stabs" => s_stab(asm, target, cur, b's'),
        "stabn" => s_stab(asm, target, cur, b'n'),
        "stabd" => s_stab(asm, target, cur, b'd'),

        "include" => s_include(asm, cur),

        "rept" | "irep" => start_capture(asm, state, CaptureKind::Rept, cur),
        "irp" => start_capture(asm, state, CaptureKind::Irp, cur),
        "irpc" | "irepc" => start_capture(asm, state, CaptureKind::Irpc, cur),
        "macro" => start_capture(asm, state, CaptureKind::Macro, cur),
        "endm" | "endr" => {
            asm.error(format!(".{name} outside a definition"));
            Ok(())
        }
        "purgem" => {
            cur.skip_whitespace();
            if let Some(n) = cur.take_name() {
                let n = n.to_ascii_lowercase();
                if asm.macros.remove(&n).is_none() {
                    asm.error(format!("macro `{n}' has no definition"));
                }
            }
            Ok(())
        }
        "mexit" | "exitm" => {
            if !asm.sources.pop_expansion() {
                asm.error(".mexit outside a macro");
            }
            Ok(())
        }

        "print" => {
            if let Some(s) = take_quoted(asm, cur) {
                println!("{s}");
            }
            Ok(())
        }
        "err" => {
            asm.error(".err encountered");
            Ok(())
        }
        "fail" => {
            let v = expr::absolute_expression(asm, target, cur);
            if v >= 500 {
                asm.warn(format!(".fail {v} encountered"));
            } else {
                asm.error(format!(".fail {v} encountered"));
            }
            Ok(())
        }

        "file" | "appfile" => {
            if let Some(f) = take_quoted(asm, cur) {
                asm.sources.set_logical_file(f);
            }
            Ok(())
        }
        "line" | "appline" => {
            let v = expr::absolute_expression(asm, target, cur);
            asm.sources.set_logical_line(v.max(0) as u32);
            Ok(())
        }

        "mri" => {
            let v = expr::absolute_expression(asm, target, cur);
            asm.opts.mri = v != 0;
            Ok(())
        }

        "end" => {
            state.finished = true;
            Ok(())
        }

        // Listing-control and format directives with no effect here.
        "list" | "nolist" | "eject" | "lflags" | "llen" | "psize" | "title" | "sbttl"
        | "format" | "noformat" | "name" | "debug" | "ident" | "ttl" | "page" | "plen" => {
            Ok(())
        }

        other => {
            asm.error(format!("unknown pseudo-op: `.{other}'"));
            Ok(())
        }
    }
}

fn start_capture(
    asm: &mut Assembler,
    state: &mut ReadState,
    kind: CaptureKind,
    cur: &mut Cursor,
) -> AsmResult<()> {
    cur.skip_whitespace();
    state.capture = Some(Capture {
        kind,
        depth: 0,
        loc: asm.here(),
        header: cur.rest().to_string(),
        lines: Vec::new(),
    });
    Ok(())
}

fn expand_macro(asm: &mut Assembler, state: &mut ReadState, name: &str, cur: &mut Cursor) {
    let def = asm.macros.get(name).cloned().expect("macro exists");

    // Collect actual arguments: positional, or `name=value`.
    let mut args: Vec<(String, String)> = def
        .params
        .iter()
        .map(|(p, d)| (p.clone(), d.clone()))
        .collect();
    let mut position = 0;
    loop {
        cur.skip_whitespace();
        if cur.at_end() {
            break;
        }
        cur.eat(b',');
        cur.skip_whitespace();
        if cur.at_end() {
            break;
        }

        let checkpoint = cur.pos();
        let named = if let Some(n) = cur.take_name() {
            let n = n.to_string();
            cur.skip_whitespace();
            if cur.eat(b'=') {
                Some(n)
            } else {
                cur.set_pos(checkpoint);
                None
            }
        } else {
            None
        };

        let value = take_opt_quoted(cur);
        match named {
            Some(n) => {
                if let Some(slot) = args.iter_mut().find(|(p, _)| *p == n) {
                    slot.1 = value;
                } else {
                    asm.error(format!("macro `{name}' has no parameter `{n}'"));
                }
            }
            None => {
                if position < args.len() {
                    args[position].1 = value;
                    position += 1;
                } else {
                    asm.error(format!("too many arguments to macro `{name}'"));
                }
            }
        }
    }

    let counter = state.macro_counter;
    state.macro_counter += 1;
    let lines = def
        .body
        .iter()
        .map(|(loc, l)| (*loc, substitute_params(l, &args, counter)))
        .collect();
    asm.sources.push_expansion(lines);
}

// ---------------------------------------------------------------------------
// Data-emitting directives.

/// Worker for the sized integer directives.
fn cons(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    cur: &mut Cursor,
    nbytes: u8,
    rva: bool,
) -> AsmResult<()> {
    loop {
        let (_, mut e) = expr::expression(asm, target, cur);
        if rva {
            if let ExprValue::Symbol { sym, add } = e.value {
                e.value = ExprValue::SymbolRva { sym, add };
            }
        }
        emit_expr(asm, target, &e, nbytes);
        cur.skip_whitespace();
        if !cur.eat(b',') {
            break;
        }
    }
    demand_empty(asm, cur)
}

/// Emit one expression as an `nbytes`-wide field, with a fixup when the
/// value is not yet known.
pub fn emit_expr(asm: &mut Assembler, target: &dyn TargetOps, e: &Expr, nbytes: u8) {
    if asm.now_seg == Segment::Absolute {
        match e.value {
            ExprValue::Constant(_) | ExprValue::Absent => {
                asm.abs_offset += nbytes as i64;
            }
            _ => asm.error("attempt to store non-constant value in absolute section"),
        }
        return;
    }

    let endian = asm.opts.endian.unwrap_or(target.default_endian());
    match &e.value {
        ExprValue::Absent => {
            asm.error("missing expression");
            asm.frag_more(nbytes as usize);
        }

        ExprValue::Illegal => {
            asm.error("illegal expression");
            asm.frag_more(nbytes as usize);
        }

        ExprValue::Register(_) => {
            asm.error("register value used as expression");
            asm.frag_more(nbytes as usize);
        }

        ExprValue::Constant(v) => {
            // Range check: the bits above the field must be all zero or
            // all one.
            if (nbytes as usize) < 8 {
                let mask: u64 = !0u64 << (nbytes * 8);
                let bits = *v as u64;
                if bits & mask != 0 && bits & mask != mask {
                    let masked = bits & !mask;
                    asm.warn(format!("value {v:#x} truncated to {masked:#x}"));
                }
            }
            let (frag, at) = asm.frag_more(nbytes as usize);
            number_to_chars(
                &mut asm.frags[frag].literal[at..at + nbytes as usize],
                *v as u64,
                endian,
            );
        }

        ExprValue::Big(Big::Int(parts)) => {
            let need = parts.len() * 2;
            if need > nbytes as usize {
                asm.warn("bignum truncated to fit field");
            }
            let n = nbytes as usize;
            let (frag, at) = asm.frag_more(n);
            let mut bytes = vec![0u8; n];
            for i in 0..n {
                let limb = parts.get(i / 2).copied().unwrap_or_else(|| {
                    // Sign-extend negative bignums; they only arise from
                    // unary minus, which clears `unsigned`.
                    if e.unsigned {
                        0
                    } else {
                        0xffff
                    }
                });
                bytes[i] = if i % 2 == 0 {
                    (limb & 0xff) as u8
                } else {
                    (limb >> 8) as u8
                };
            }
            if endian == crate::context::Endian::Big {
                bytes.reverse();
            }
            asm.frags[frag].literal[at..at + n].copy_from_slice(&bytes);
        }

        ExprValue::Big(Big::Float { value, .. }) => {
            let n = nbytes as usize;
            let (frag, at) = asm.frag_more(n);
            let mut bytes = match n {
                4 => (*value as f32).to_le_bytes().to_vec(),
                8 => value.to_le_bytes().to_vec(),
                _ => {
                    asm.warn(format!("can't emit a float into {n} bytes"));
                    vec![0; n]
                }
            };
            if endian == crate::context::Endian::Big {
                bytes.reverse();
            }
            asm.frags[frag].literal[at..at + n].copy_from_slice(&bytes);
        }

        _ => {
            let (frag, at) = asm.frag_more(nbytes as usize);
            let kind = match nbytes {
                1 => RelocKind::Abs8,
                2 => RelocKind::Abs16,
                8 => RelocKind::Abs64,
                _ => RelocKind::Abs32,
            };
            asm.fix_new_exp(frag, at, nbytes, e, false, kind);
        }
    }
}

/// Worker for `.float`/`.double`.
fn float_cons(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    cur: &mut Cursor,
    nbytes: u8,
) -> AsmResult<()> {
    loop {
        cur.skip_whitespace();
        // Accept the `0f1.5` spelling as well as a bare literal.
        if cur.peek() == Some(b'0') {
            if let Some(l) = cur.peek2() {
                if l.is_ascii_alphabetic() {
                    cur.bump();
                    cur.bump();
                }
            }
        }
        let text = cur.rest();
        let end = text.find(',').unwrap_or(text.len());
        let lit = text[..end].trim();
        match lit.parse::<f64>() {
            Ok(v) => {
                let e = Expr {
                    value: ExprValue::Big(Big::Float {
                        letter: if nbytes == 4 { b'f' } else { b'd' },
                        value: v,
                    }),
                    unsigned: true,
                };
                emit_expr(asm, target, &e, nbytes);
            }
            Err(_) => asm.error(format!("bad floating literal: `{lit}'")),
        }
        cur.set_pos(cur.pos() + end);
        if !cur.eat(b',') {
            break;
        }
    }
    demand_empty(asm, cur)
}

/// Worker for `.ascii`/`.asciz`/`.string`.
fn stringer(asm: &mut Assembler, cur: &mut Cursor, append_zero: bool) -> AsmResult<()> {
    loop {
        cur.skip_whitespace();
        if !cur.eat(b'"') {
            asm.error("expected string");
            return Ok(());
        }
        let mut bytes = Vec::new();
        loop {
            match cur.next_byte() {
                None => {
                    asm.error("unterminated string");
                    break;
                }
                Some(b'"') => break,
                Some(b'\\') => {
                    let c = cur.next_byte().unwrap_or(b'\\');
                    bytes.push(escape_char(cur, c));
                }
                Some(c) => bytes.push(c),
            }
        }
        if append_zero {
            bytes.push(0);
        }
        asm.frag_append(&bytes);

        cur.skip_whitespace();
        if !cur.eat(b',') {
            break;
        }
    }
    demand_empty(asm, cur)
}

// ---------------------------------------------------------------------------
// Storage and section directives.

fn s_align(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    cur: &mut Cursor,
    bytes_form: bool,
    fill_width: u8,
) -> AsmResult<()> {
    let arg = expr::absolute_expression(asm, target, cur);
    let power = if bytes_form {
        if arg <= 0 {
            0
        } else if (arg & (arg - 1)) != 0 {
            asm.error(format!("alignment {arg} is not a power of 2"));
            0
        } else {
            arg.trailing_zeros()
        }
    } else {
        if !(0..=31).contains(&arg) {
            asm.error(format!("bad alignment {arg}"));
        }
        arg.clamp(0, 31) as u32
    };

    let mut fill: Option<i64> = None;
    let mut max_skip = 0usize;
    cur.skip_whitespace();
    if cur.eat(b',') {
        cur.skip_whitespace();
        if cur.peek() != Some(b',') && !cur.at_end() {
            fill = Some(expr::absolute_expression(asm, target, cur));
        }
        cur.skip_whitespace();
        if cur.eat(b',') {
            max_skip = expr::absolute_expression(asm, target, cur).max(0) as usize;
        }
    }

    if let Some(section) = asm.now_section() {
        asm.sections[section].record_alignment(power);
        let is_code = asm.sections[section].flags.contains(SectionFlags::CODE);
        match fill {
            None if is_code => {
                let pattern = target.align_code_fill().to_vec();
                let frag = asm.frag_var(FragKind::AlignCode, 0, &pattern, 0, None, power as i64);
                asm.frags[frag].subtype = max_skip as u32;
            }
            None => asm.frag_align(power, 0, max_skip),
            Some(v) => {
                let endian = asm.opts.endian.unwrap_or(target.default_endian());
                let mut pattern = vec![0u8; fill_width as usize];
                number_to_chars(&mut pattern, v as u64, endian);
                asm.frag_align_pattern(power, &pattern, max_skip);
            }
        }
    } else {
        // Absolute section: round the location counter directly.
        let pad = crate::relax::relax_align(asm.abs_offset as u64, power);
        asm.abs_offset += pad as i64;
    }
    demand_empty(asm, cur)
}

fn s_comm(asm: &mut Assembler, target: &dyn TargetOps, cur: &mut Cursor) -> AsmResult<()> {
    cur.skip_whitespace();
    let Some(name) = cur.take_name() else {
        asm.error("expected symbol name after .comm");
        return Ok(());
    };
    let name = name.to_string();
    cur.skip_whitespace();
    cur.eat(b',');
    let size = expr::absolute_expression(asm, target, cur);
    if size < 0 {
        asm.error(format!(".comm length ({size}) out of range, ignored"));
        return Ok(());
    }

    let mut align_p2 = 0u32;
    cur.skip_whitespace();
    if cur.eat(b',') {
        let align = expr::absolute_expression(asm, target, cur);
        if align > 0 {
            if (align & (align - 1)) != 0 {
                asm.error(format!("common alignment {align} is not a power of 2"));
            } else {
                align_p2 = align.trailing_zeros();
            }
        }
    }

    let sym = asm.symbol_find_or_make(&name);
    let s = &asm.symbols.syms[sym];
    if s.is_defined() {
        asm.error(format!("symbol `{name}' is already defined; can't make common"));
        return demand_empty(asm, cur);
    }
    if s.segment == Segment::Common && s.size != size as u64 {
        asm.warn(format!(
            "length of .comm `{name}' ({size}) differs from earlier ({})",
            s.size
        ));
    }
    let s = &mut asm.symbols.syms[sym];
    s.segment = Segment::Common;
    s.size = size as u64;
    s.align = align_p2;
    s.flags.insert(SymbolFlags::EXTERNAL);
    demand_empty(asm, cur)
}

fn s_lcomm(asm: &mut Assembler, target: &dyn TargetOps, cur: &mut Cursor) -> AsmResult<()> {
    cur.skip_whitespace();
    let Some(name) = cur.take_name() else {
        asm.error("expected symbol name after .lcomm");
        return Ok(());
    };
    let name = name.to_string();
    cur.skip_whitespace();
    cur.eat(b',');
    let size = expr::absolute_expression(asm, target, cur);
    if size < 0 {
        asm.error(format!(".lcomm length ({size}) out of range, ignored"));
        return Ok(());
    }

    // Default alignment rule by size.
    let align = if size >= 8 {
        3
    } else if size >= 4 {
        2
    } else if size >= 2 {
        1
    } else {
        0
    };

    let save_seg = asm.now_seg;
    let save_subseg = asm.now_subseg;

    let bss = asm.bss;
    asm.subseg_set(bss, 1);
    if align > 0 {
        asm.frag_align(align, 0, 0);
        asm.sections[bss].record_alignment(align);
    }
    asm.colon(&name);
    asm.frag_var(FragKind::Fill, 0, &[0], 0, None, size);
    let sym = asm.symbol_find_or_make(&name);
    asm.symbols.syms[sym].size = size as u64;

    asm.now_seg = save_seg;
    asm.now_subseg = save_subseg;
    demand_empty(asm, cur)
}

fn s_mri_common(asm: &mut Assembler, target: &dyn TargetOps, cur: &mut Cursor) -> AsmResult<()> {
    cur.skip_whitespace();
    let name = cur.take_name().unwrap_or("").to_string();
    let _ = target;
    let internal = if name.is_empty() {
        "*mri-common*".to_string()
    } else {
        name.clone()
    };
    let sym = asm.symbol_find_or_make(&internal);
    let s = &mut asm.symbols.syms[sym];
    if s.is_defined() && s.segment != Segment::Common {
        asm.error(format!("symbol `{internal}' is already defined"));
        return Ok(());
    }
    let s = &mut asm.symbols.syms[sym];
    s.segment = Segment::Common;
    s.flags.insert(SymbolFlags::EXTERNAL);
    asm.mri_common = Some(sym);
    Ok(())
}

fn s_switch(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    cur: &mut Cursor,
    section: SectionId,
) -> AsmResult<()> {
    // Leaving a section closes any open MRI common block.
    asm.mri_common = None;
    cur.skip_whitespace();
    let subseg = if cur.at_end() {
        0
    } else {
        expr::absolute_expression(asm, target, cur).max(0) as u32
    };
    asm.subseg_set(section, subseg);
    demand_empty(asm, cur)
}

fn s_section(asm: &mut Assembler, target: &dyn TargetOps, cur: &mut Cursor) -> AsmResult<()> {
    cur.skip_whitespace();
    let rest = cur.rest();
    let name_end = rest
        .find(|c: char| c == ',' || c.is_whitespace())
        .unwrap_or(rest.len());
    let name = rest[..name_end].to_string();
    cur.set_pos(cur.pos() + name_end);
    if name.is_empty() {
        asm.error("expected section name");
        return Ok(());
    }

    let mut flags = SectionFlags::ALLOC
        | SectionFlags::LOAD
        | SectionFlags::DATA
        | SectionFlags::HAS_CONTENTS;
    let mut subseg = 0u32;

    cur.skip_whitespace();
    if cur.eat(b',') {
        cur.skip_whitespace();
        if cur.peek() == Some(b'"') {
            if let Some(letters) = take_quoted(asm, cur) {
                flags = SectionFlags::empty();
                for l in letters.chars() {
                    match l {
                        'a' => flags |= SectionFlags::ALLOC,
                        'w' => flags |= SectionFlags::DATA | SectionFlags::HAS_CONTENTS,
                        'x' => {
                            flags |=
                                SectionFlags::CODE | SectionFlags::LOAD | SectionFlags::HAS_CONTENTS
                        }
                        'r' => flags |= SectionFlags::READONLY | SectionFlags::HAS_CONTENTS,
                        's' => flags |= SectionFlags::ALLOC | SectionFlags::LOAD,
                        'b' => flags |= SectionFlags::BSS,
                        'd' => flags |= SectionFlags::DATA | SectionFlags::LOAD
                            | SectionFlags::HAS_CONTENTS,
                        'l' => flags |= SectionFlags::LOAD,
                        'n' => flags |= SectionFlags::NEVER_LOAD,
                        other => asm.warn(format!("unknown section attribute '{other}'")),
                    }
                }
                if !flags.contains(SectionFlags::BSS) {
                    flags |= SectionFlags::ALLOC;
                }
            }
            cur.skip_whitespace();
            if cur.eat(b',') {
                subseg = expr::absolute_expression(asm, target, cur).max(0) as u32;
            }
        } else if !cur.at_end() {
            subseg = expr::absolute_expression(asm, target, cur).max(0) as u32;
        }
    }

    let section = match asm.section_by_name(&name) {
        Some(s) => s,
        None => asm.new_section(&name, flags),
    };
    asm.mri_common = None;
    asm.subseg_set(section, subseg);
    demand_empty(asm, cur)
}

fn s_globl(asm: &mut Assembler, cur: &mut Cursor) -> AsmResult<()> {
    loop {
        cur.skip_whitespace();
        let Some(name) = cur.take_name() else {
            asm.error("expected symbol name");
            return Ok(());
        };
        let name = name.to_string();
        let sym = asm.symbol_find_or_make(&name);
        asm.symbols.syms[sym].flags.insert(SymbolFlags::EXTERNAL);
        cur.skip_whitespace();
        if !cur.eat(b',') {
            break;
        }
    }
    demand_empty(asm, cur)
}

fn s_weak(asm: &mut Assembler, cur: &mut Cursor) -> AsmResult<()> {
    loop {
        cur.skip_whitespace();
        let Some(name) = cur.take_name() else {
            asm.error("expected symbol name");
            return Ok(());
        };
        let name = name.to_string();
        let sym = asm.symbol_find_or_make(&name);
        asm.symbols.syms[sym]
            .flags
            .insert(SymbolFlags::WEAK | SymbolFlags::EXTERNAL);
        cur.skip_whitespace();
        if !cur.eat(b',') {
            break;
        }
    }
    demand_empty(asm, cur)
}

fn s_set(asm: &mut Assembler, target: &dyn TargetOps, cur: &mut Cursor) -> AsmResult<()> {
    cur.skip_whitespace();
    let Some(name) = cur.take_name() else {
        asm.error("expected symbol name after .set");
        return Ok(());
    };
    let name = name.to_string();
    cur.skip_whitespace();
    if !cur.eat(b',') {
        asm.error("expected comma after name in .set");
        return Ok(());
    }
    let (seg, e) = expr::expression(asm, target, cur);
    asm.equate(&name, seg, e);
    demand_empty(asm, cur)
}

fn s_org(asm: &mut Assembler, target: &dyn TargetOps, cur: &mut Cursor) -> AsmResult<()> {
    let (seg, e) = expr::expression(asm, target, cur);
    if seg != Segment::Absolute && seg != asm.now_seg {
        asm.error("invalid segment in .org");
        return Ok(());
    }

    let mut fill = 0u8;
    cur.skip_whitespace();
    if cur.eat(b',') {
        fill = expr::absolute_expression(asm, target, cur) as u8;
    }

    if asm.now_seg == Segment::Absolute {
        match e.value {
            ExprValue::Constant(v) => {
                if v < asm.abs_offset {
                    asm.error("attempt to .org backwards ignored");
                } else {
                    asm.abs_offset = v;
                }
            }
            _ => asm.error(".org in absolute section must be absolute"),
        }
        return demand_empty(asm, cur);
    }

    let (sym, offset) = match e.value {
        ExprValue::Constant(v) => (None, v),
        ExprValue::Symbol { sym, add } => (Some(sym), add),
        _ => {
            let wrapped = expr::make_expr_symbol(asm, &e);
            (Some(wrapped), 0)
        }
    };
    asm.frag_var(FragKind::Org, 0, &[fill], 0, sym, offset);
    demand_empty(asm, cur)
}

fn s_space(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    cur: &mut Cursor,
    mult: i64,
) -> AsmResult<()> {
    let (_, e) = expr::expression(asm, target, cur);

    let mut fill = 0u8;
    cur.skip_whitespace();
    if cur.eat(b',') {
        fill = expr::absolute_expression(asm, target, cur) as u8;
    }

    // Inside an MRI common block, space accumulates into the block symbol.
    if let Some(common) = asm.mri_common {
        match e.value {
            ExprValue::Constant(v) if v >= 0 => {
                asm.symbols.syms[common].size += (v * mult.max(1)) as u64;
            }
            _ => asm.error(".space in a common block must be absolute and non-negative"),
        }
        return demand_empty(asm, cur);
    }

    match e.value {
        ExprValue::Constant(v) => {
            let total = v * mult.max(1);
            if total < 0 {
                asm.warn(".space or .fill with negative value, ignored");
            } else if asm.now_seg == Segment::Absolute {
                asm.abs_offset += total;
            } else {
                asm.frag_var(FragKind::Fill, 0, &[fill], 0, None, total);
            }
        }
        ExprValue::Symbol { sym, add: 0 } => {
            asm.frag_var(FragKind::Space, 0, &[fill], 0, Some(sym), 0);
        }
        _ => {
            let wrapped = expr::make_expr_symbol(asm, &e);
            asm.frag_var(FragKind::Space, 0, &[fill], 0, Some(wrapped), 0);
        }
    }
    demand_empty(asm, cur)
}

fn s_fill(asm: &mut Assembler, target: &dyn TargetOps, cur: &mut Cursor) -> AsmResult<()> {
    let repeat = expr::absolute_expression(asm, target, cur);
    let mut size: i64 = 1;
    let mut value: i64 = 0;
    cur.skip_whitespace();
    if cur.eat(b',') {
        size = expr::absolute_expression(asm, target, cur);
        cur.skip_whitespace();
        if cur.eat(b',') {
            value = expr::absolute_expression(asm, target, cur);
        }
    }

    if repeat < 0 {
        asm.warn(".fill repeat count is negative, ignored");
        return demand_empty(asm, cur);
    }
    if size < 0 {
        asm.warn(".fill size is negative, ignored");
        return demand_empty(asm, cur);
    }
    if size > 8 {
        asm.warn(".fill size clamped to 8");
        size = 8;
    }
    if size == 0 || repeat == 0 {
        return demand_empty(asm, cur);
    }

    let endian = asm.opts.endian.unwrap_or(target.default_endian());
    let mut pattern = vec![0u8; size as usize];
    number_to_chars(&mut pattern, value as u64, endian);
    if asm.now_seg == Segment::Absolute {
        asm.abs_offset += repeat * size;
    } else {
        asm.frag_var(FragKind::Fill, 0, &pattern, 0, None, repeat);
    }
    demand_empty(asm, cur)
}

fn s_linkonce(asm: &mut Assembler, cur: &mut Cursor) -> AsmResult<()> {
    cur.skip_whitespace();
    let kind = match cur.take_name() {
        None => LinkOnce::Discard,
        Some(word) => match word.to_ascii_lowercase().as_str() {
            "discard" => LinkOnce::Discard,
            "one_only" => LinkOnce::OneOnly,
            "same_size" => LinkOnce::SameSize,
            "same_contents" => LinkOnce::SameContents,
            other => {
                asm.error(format!("unrecognized .linkonce type `{other}'"));
                LinkOnce::Discard
            }
        },
    };
    match asm.now_section() {
        Some(section) => asm.sections[section].link_once = Some(kind),
        None => asm.error(".linkonce outside a section"),
    }
    demand_empty(asm, cur)
}

fn s_include(asm: &mut Assembler, cur: &mut Cursor) -> AsmResult<()> {
    let Some(name) = take_quoted(asm, cur) else {
        return Ok(());
    };
    let mut candidates = vec![std::path::PathBuf::from(&name)];
    for dir in &asm.opts.include_paths {
        candidates.push(dir.join(&name));
    }
    for path in candidates {
        if let Ok(text) = std::fs::read_to_string(&path) {
            asm.sources.push_include(path.display().to_string(), &text);
            return Ok(());
        }
    }
    asm.error(format!("can't open `{name}' for reading"));
    Ok(())
}

// ---------------------------------------------------------------------------
// Stabs.

fn stab_sections(asm: &mut Assembler) -> (SectionId, SectionId) {
    let stab = match asm.section_by_name(".stab") {
        Some(s) => s,
        None => {
            let s = asm.new_section(
                ".stab",
                SectionFlags::HAS_CONTENTS | SectionFlags::DEBUG | SectionFlags::READONLY,
            );
            // Offset 0 of .stabstr is reserved for the empty string.
            let str_sec = asm.new_section(
                ".stabstr",
                SectionFlags::HAS_CONTENTS | SectionFlags::DEBUG | SectionFlags::READONLY,
            );
            let save_seg = asm.now_seg;
            let save_subseg = asm.now_subseg;
            asm.subseg_set(str_sec, 0);
            asm.frag_append(&[0]);
            asm.now_seg = save_seg;
            asm.now_subseg = save_subseg;
            s
        }
    };
    let stabstr = asm.section_by_name(".stabstr").expect("created above");
    (stab, stabstr)
}

/// The running size of a section's frags; used as the next `.stabstr`
/// offset.
fn section_byte_count(asm: &Assembler, section: SectionId) -> u64 {
    let mut total = 0;
    for &subseg in &asm.sections[section].subsegs {
        let mut cur = Some(asm.subsegs[subseg].frag_root);
        while let Some(id) = cur {
            total += asm.frags[id].fix as u64;
            cur = asm.frags[id].next;
        }
    }
    total
}

fn s_stab(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    cur: &mut Cursor,
    what: u8,
) -> AsmResult<()> {
    let (stab, stabstr) = stab_sections(asm);

    // .stabs has a leading string.
    let strx = if what == b's' {
        let Some(text) = take_quoted(asm, cur) else {
            return Ok(());
        };
        cur.skip_whitespace();
        cur.eat(b',');
        let offset = section_byte_count(asm, stabstr);
        let save_seg = asm.now_seg;
        let save_subseg = asm.now_subseg;
        asm.subseg_set(stabstr, 0);
        let mut bytes = text.into_bytes();
        bytes.push(0);
        asm.frag_append(&bytes);
        asm.now_seg = save_seg;
        asm.now_subseg = save_subseg;
        offset as u32
    } else {
        0
    };

    let ntype = expr::absolute_expression(asm, target, cur);
    cur.skip_whitespace();
    cur.eat(b',');
    let nother = expr::absolute_expression(asm, target, cur);
    cur.skip_whitespace();
    cur.eat(b',');
    let ndesc = expr::absolute_expression(asm, target, cur);

    // The value: an expression for .stabs/.stabn, the current location
    // for .stabd.
    let value: Expr = if what == b'd' {
        if asm.now_seg == Segment::Absolute {
            Expr::constant(asm.abs_offset)
        } else {
            let frag = asm.frag_now();
            let fix = asm.frag_now_fix() as i64;
            let loc = asm.here();
            let sym = asm.symbols.make_fake(
                &mut asm.names,
                asm.now_seg,
                Expr::constant(fix),
                Some(frag),
                loc,
            );
            Expr::symbol(sym)
        }
    } else {
        cur.skip_whitespace();
        cur.eat(b',');
        expr::expression(asm, target, cur).1
    };

    let endian = asm.opts.endian.unwrap_or(target.default_endian());
    let save_seg = asm.now_seg;
    let save_subseg = asm.now_subseg;
    asm.subseg_set(stab, 0);

    let (frag, at) = asm.frag_more(8);
    {
        let lit = &mut asm.frags[frag].literal;
        number_to_chars(&mut lit[at..at + 4], strx as u64, endian);
        lit[at + 4] = ntype as u8;
        lit[at + 5] = nother as u8;
        number_to_chars(&mut lit[at + 6..at + 8], ndesc as u64, endian);
    }
    emit_expr(asm, target, &value, 4);

    asm.now_seg = save_seg;
    asm.now_subseg = save_subseg;
    demand_empty(asm, cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AsmOptions;
    use crate::target::null_target;

    fn run(src: &str) -> Assembler {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let t = null_target();
        asm.sources.push_file("t.s", src);
        read_source(&mut asm, &*t).unwrap();
        asm
    }

    fn section_bytes(asm: &Assembler, section: crate::section::SectionId) -> Vec<u8> {
        let mut bytes = Vec::new();
        for &subseg in &asm.sections[section].subsegs {
            let mut cur = Some(asm.subsegs[subseg].frag_root);
            while let Some(id) = cur {
                let f = &asm.frags[id];
                bytes.extend_from_slice(&f.literal[..f.fix]);
                for _ in 0..f.offset {
                    if f.var > 0 {
                        bytes.extend_from_slice(&f.literal[f.fix..f.fix + f.var as usize]);
                    }
                }
                cur = f.next;
            }
        }
        bytes
    }

    #[test]
    fn equate_and_long() {
        let asm = run(".equ x, 5 + 3\n.long x\n.long x - 2\n");
        assert_eq!(asm.diag.error_count(), 0);
        let bytes = section_bytes(&asm, asm.text);
        assert_eq!(bytes, vec![8, 0, 0, 0, 6, 0, 0, 0]);
    }

    #[test]
    fn bytes_and_words() {
        let asm = run(".byte 1, 2\n.word 0x0304\n");
        let bytes = section_bytes(&asm, asm.text);
        assert_eq!(bytes, vec![1, 2, 0x04, 0x03]);
    }

    #[test]
    fn ascii_and_asciz() {
        let asm = run(".ascii \"ab\"\n.asciz \"c\\n\"\n");
        let bytes = section_bytes(&asm, asm.text);
        assert_eq!(bytes, b"abc\n\0");
    }

    #[test]
    fn comm_and_lcomm() {
        let asm = run(".comm c1, 16, 4\n.lcomm c2, 8\n");
        assert_eq!(asm.diag.error_count(), 0);

        let c1 = asm.symbol_find("c1").unwrap();
        let s1 = &asm.symbols.syms[c1];
        assert_eq!(s1.segment, Segment::Common);
        assert!(s1.flags.contains(SymbolFlags::EXTERNAL));
        assert_eq!(s1.size, 16);
        assert_eq!(s1.align, 2);

        let c2 = asm.symbol_find("c2").unwrap();
        let s2 = &asm.symbols.syms[c2];
        assert_eq!(s2.segment, Segment::Section(asm.bss));
        assert!(!s2.flags.contains(SymbolFlags::EXTERNAL));
        assert_eq!(s2.size, 8);
    }

    #[test]
    fn conditionals() {
        let asm = run(".if 1\n.byte 1\n.else\n.byte 2\n.endif\n.ifdef undef\n.byte 3\n.endif\n");
        let bytes = section_bytes(&asm, asm.text);
        assert_eq!(bytes, vec![1]);
        assert!(asm.conds.is_empty());
    }

    #[test]
    fn nested_false_conditionals() {
        let asm = run(".if 0\n.if 1\n.byte 9\n.endif\n.byte 8\n.else\n.byte 7\n.endif\n");
        let bytes = section_bytes(&asm, asm.text);
        assert_eq!(bytes, vec![7]);
    }

    #[test]
    fn rept_repeats() {
        let asm = run(".rept 3\n.byte 5\n.endr\n");
        let bytes = section_bytes(&asm, asm.text);
        assert_eq!(bytes, vec![5, 5, 5]);
    }

    #[test]
    fn irp_substitutes() {
        let asm = run(".irp v, 1, 2, 3\n.byte \\v\n.endr\n");
        let bytes = section_bytes(&asm, asm.text);
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[test]
    fn macros_expand() {
        let asm = run(".macro pair a, b=9\n.byte \\a\n.byte \\b\n.endm\npair 1, 2\npair 3\n");
        assert_eq!(asm.diag.error_count(), 0);
        let bytes = section_bytes(&asm, asm.text);
        assert_eq!(bytes, vec![1, 2, 3, 9]);
    }

    #[test]
    fn fill_directive() {
        let asm = run(".fill 3, 2, 0x0102\n");
        let bytes = section_bytes(&asm, asm.text);
        assert_eq!(bytes, vec![2, 1, 2, 1, 2, 1]);
    }

    #[test]
    fn section_switching() {
        let asm = run(".data\n.byte 1\n.text\n.byte 2\n.section .rodata, \"r\"\n.byte 3\n");
        assert_eq!(section_bytes(&asm, asm.data), vec![1]);
        assert_eq!(section_bytes(&asm, asm.text), vec![2]);
        let rodata = asm.section_by_name(".rodata").unwrap();
        assert_eq!(section_bytes(&asm, rodata), vec![3]);
        assert!(asm.sections[rodata]
            .flags
            .contains(SectionFlags::READONLY));
    }

    #[test]
    fn local_fb_labels() {
        let asm = run("1:\n.byte 1\n.long 1b\n1:\n");
        // Two instances of label 1 exist.
        assert_eq!(asm.diag.error_count(), 0);
        assert!(asm.symbol_find("L1\u{2}1").is_some());
        assert!(asm.symbol_find("L1\u{2}2").is_some());
    }

    #[test]
    fn stabs_build_sections() {
        let asm = run(".stabs \"main:F1\", 36, 0, 0, 4\n");
        assert_eq!(asm.diag.error_count(), 0);
        let stab = asm.section_by_name(".stab").unwrap();
        let stabstr = asm.section_by_name(".stabstr").unwrap();
        let stab_bytes = section_bytes(&asm, stab);
        assert_eq!(stab_bytes.len(), 12);
        // n_strx points past the reserved NUL at offset 0.
        assert_eq!(&stab_bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(stab_bytes[4], 36);
        let str_bytes = section_bytes(&asm, stabstr);
        assert_eq!(&str_bytes[..], b"\0main:F1\0");
    }

    #[test]
    fn unknown_directive_is_recoverable() {
        let asm = run(".bogus 1, 2\n.byte 4\n");
        assert_eq!(asm.diag.error_count(), 1);
        let bytes = section_bytes(&asm, asm.text);
        assert_eq!(bytes, vec![4]);
    }

    #[test]
    fn fail_severity() {
        let asm = run(".fail 500\n.fail 499\n");
        assert_eq!(asm.diag.warning_count(), 1);
        assert_eq!(asm.diag.error_count(), 1);
    }

    #[test]
    fn org_absolute_grows() {
        let asm = run(".org 8\n.byte 1\n");
        // .org in a normal section makes an org frag; just check no error.
        assert_eq!(asm.diag.error_count(), 0);
    }
}
