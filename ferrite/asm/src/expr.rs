//! Expression parsing and folding.
//!
//! Expressions evaluate to a tagged [`Expr`] value plus the segment the
//! result lives in. Most operands are a register, a constant, or a single
//! symbol; `symbol+constant` and `symbol-symbol` are common; anything more
//! complex gets wrapped in a synthetic symbol living in the expression
//! segment, with a side table mapping it back to its source location so a
//! late diagnostic can still point somewhere useful.
//!
//! The grammar is the classic one: operands (including parenthesized
//! subexpressions and unary operators) combined by precedence climbing over
//! a fixed rank table. The MRI dialect swaps the precedence of the
//! multiplicative and bitwise groups and changes the radix spelling rules.

use crate::context::Assembler;
use crate::source::{is_name_beginner, is_part_of_name, Cursor};
use crate::symbol::{Segment, SymbolId};
use crate::target::TargetOps;
use smallvec::SmallVec;

/// 16-bit limbs of a big number, least significant first.
pub type LittleNums = SmallVec<[u16; 8]>;

/// A number too large for a plain constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Big {
    /// Arbitrary-precision integer, 16-bit limbs, little-endian.
    Int(LittleNums),
    /// Floating constant of a sized flavor (`f`, `d`, `x`, ...).
    Float {
        /// The size letter, lower-cased.
        letter: u8,
        /// Parsed value.
        value: f64,
    },
}

/// Unary operators that survive folding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Minus,
    /// Bitwise complement.
    BitNot,
    /// Logical complement.
    LogicalNot,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// Multiplication.
    Mul,
    /// Division. Division by zero folds to one with a warning.
    Div,
    /// Remainder.
    Mod,
    /// Left shift.
    Shl,
    /// Right shift.
    Shr,
    /// Bitwise inclusive or.
    BitOr,
    /// `a | ~b`.
    BitOrNot,
    /// Bitwise exclusive or.
    BitXor,
    /// Bitwise and.
    BitAnd,
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Comparisons fold to all-ones for true, zero for false.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than or equal.
    Ge,
    /// Greater than.
    Gt,
    /// Logical and.
    LogicalAnd,
    /// Logical or.
    LogicalOr,
}

impl BinaryOp {
    /// Operator rank; larger binds tighter. Rank 5 is only used by the MRI
    /// dialect, which demotes the multiplicative group below the bitwise
    /// one.
    pub fn rank(self, mri: bool) -> u8 {
        match self {
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                if mri {
                    5
                } else {
                    7
                }
            }
            BinaryOp::Shl | BinaryOp::Shr => 7,
            BinaryOp::BitOr | BinaryOp::BitOrNot | BinaryOp::BitXor | BinaryOp::BitAnd => 6,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Ge
            | BinaryOp::Gt => 3,
            BinaryOp::LogicalAnd => 2,
            BinaryOp::LogicalOr => 1,
        }
    }
}

/// The tagged value of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    /// Nothing there at all.
    Absent,
    /// Something unparseable; treated as zero after diagnosing.
    Illegal,
    /// A plain number.
    Constant(i64),
    /// A bignum or float.
    Big(Big),
    /// A register, by number.
    Register(u32),
    /// `sym + add`.
    Symbol {
        /// The symbol.
        sym: SymbolId,
        /// Additive constant.
        add: i64,
    },
    /// `rva(sym) + add`; forces an image-relative relocation.
    SymbolRva {
        /// The symbol.
        sym: SymbolId,
        /// Additive constant.
        add: i64,
    },
    /// A unary operator applied to a symbolic operand.
    Unary {
        /// The operator.
        op: UnaryOp,
        /// Operand, wrapped as a symbol.
        sym: SymbolId,
        /// Additive constant.
        add: i64,
    },
    /// A binary operator over two symbolic operands plus a constant.
    Binary {
        /// The operator.
        op: BinaryOp,
        /// Left operand.
        lhs: SymbolId,
        /// Right operand.
        rhs: SymbolId,
        /// Additive constant.
        add: i64,
    },
}

/// An expression value plus the unsigned flag.
///
/// All integers parse as unsigned until negated; the flag only matters when
/// a constant is widened into a larger literal, where it suppresses sign
/// extension (`.quad 0x80000000` must not become negative).
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    /// The tagged value.
    pub value: ExprValue,
    /// Suppress sign extension when widening.
    pub unsigned: bool,
}

impl Expr {
    /// An absent expression.
    pub fn absent() -> Self {
        Expr {
            value: ExprValue::Absent,
            unsigned: true,
        }
    }

    /// An illegal expression.
    pub fn illegal() -> Self {
        Expr {
            value: ExprValue::Illegal,
            unsigned: true,
        }
    }

    /// A constant.
    pub fn constant(v: i64) -> Self {
        Expr {
            value: ExprValue::Constant(v),
            unsigned: v >= 0,
        }
    }

    /// A bare symbol reference.
    pub fn symbol(sym: SymbolId) -> Self {
        Expr {
            value: ExprValue::Symbol { sym, add: 0 },
            unsigned: true,
        }
    }

    /// Is this `Absent`?
    pub fn is_absent(&self) -> bool {
        matches!(self.value, ExprValue::Absent)
    }

    /// The additive constant carried by this expression.
    pub fn add_number(&self) -> i64 {
        match &self.value {
            ExprValue::Constant(v) => *v,
            ExprValue::Register(r) => *r as i64,
            ExprValue::Symbol { add, .. }
            | ExprValue::SymbolRva { add, .. }
            | ExprValue::Unary { add, .. }
            | ExprValue::Binary { add, .. } => *add,
            ExprValue::Absent | ExprValue::Illegal | ExprValue::Big(_) => 0,
        }
    }

    /// Add `delta` to the additive constant.
    pub fn bump(&mut self, delta: i64) {
        match &mut self.value {
            ExprValue::Constant(v) => *v = v.wrapping_add(delta),
            ExprValue::Symbol { add, .. }
            | ExprValue::SymbolRva { add, .. }
            | ExprValue::Unary { add, .. }
            | ExprValue::Binary { add, .. } => *add = add.wrapping_add(delta),
            _ => {}
        }
    }

    /// The symbol this expression adds, if any.
    pub fn add_symbol(&self) -> Option<SymbolId> {
        match &self.value {
            ExprValue::Symbol { sym, .. }
            | ExprValue::SymbolRva { sym, .. }
            | ExprValue::Unary { sym, .. }
            | ExprValue::Binary { lhs: sym, .. } => Some(*sym),
            _ => None,
        }
    }
}

/// Characters that may follow `0` to start a floating constant.
const FLT_CHARS: &[u8] = b"fFdDxXeEgGrR";

/// Parse a full expression (rank 0) from `cur`.
pub fn expression(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    cur: &mut Cursor,
) -> (Segment, Expr) {
    parse_expression(asm, target, cur, 0)
}

/// Parse one operand and return `(segment, value)` without applying any
/// binary operators.
pub fn parse_operand(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    cur: &mut Cursor,
) -> (Segment, Expr) {
    operand(asm, target, cur)
}

/// Read an expression and require it to fold to an absolute value; returns
/// zero (with a diagnostic) otherwise.
pub fn absolute_expression(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    cur: &mut Cursor,
) -> i64 {
    let (_, e) = expression(asm, target, cur);
    match e.value {
        ExprValue::Constant(v) => v,
        ExprValue::Absent => 0,
        _ => {
            asm.error("expression must be absolute");
            0
        }
    }
}

/// Build a synthetic symbol holding a complex expression. Constant
/// expressions land in the absolute segment, everything else in the
/// expression segment; the symbol's origin is recorded for later
/// diagnostics.
pub fn make_expr_symbol(asm: &mut Assembler, e: &Expr) -> SymbolId {
    if let ExprValue::Symbol { sym, add: 0 } = e.value {
        return sym;
    }
    let seg = match e.value {
        ExprValue::Constant(_) => Segment::Absolute,
        _ => Segment::Expression,
    };
    let loc = asm.sources.here();
    let sym = asm.symbols.make_fake(&mut asm.names, seg, e.clone(), None, loc);
    asm.symbols.expr_symbol_where.insert(sym, loc);
    sym
}

fn mark_used(asm: &mut Assembler, e: &Expr) {
    if let Some(sym) = e.add_symbol() {
        asm.symbols.syms[sym]
            .flags
            .insert(crate::symbol::SymbolFlags::USED);
    }
}

/// An expression representing the current location: the magic symbol `.`.
fn current_location(asm: &mut Assembler) -> Expr {
    if asm.now_seg == Segment::Absolute {
        return Expr::constant(asm.abs_offset);
    }
    let frag = asm.frag_now();
    let fix = asm.frag_now_fix() as i64;
    let loc = asm.sources.here();
    let sym = asm.symbols.make_fake(
        &mut asm.names,
        asm.now_seg,
        Expr::constant(fix),
        Some(frag),
        loc,
    );
    Expr::symbol(sym)
}

fn wrap_unary(asm: &mut Assembler, op: UnaryOp, e: &Expr) -> Expr {
    let sym = make_expr_symbol(asm, e);
    Expr {
        value: ExprValue::Unary { op, sym, add: 0 },
        unsigned: true,
    }
}

/// Scan an integer in `radix`; a radix of zero asks for the MRI suffix
/// rules. Produces a constant, a bignum, or a local-label reference.
fn integer_constant(asm: &mut Assembler, cur: &mut Cursor, mut radix: u32) -> Expr {
    let mut suffix_pos: Option<usize> = None;

    if radix == 0 {
        // MRI: the radix is a trailing letter; `123H`, `777O`, `1010B`,
        // or a floating constant if it has an exponent or decimal point.
        let start = cur.pos();
        let mut saw_e = false;
        let mut end = start;
        {
            let mut probe = cur.clone();
            while let Some(c) = probe.peek() {
                if !c.is_ascii_alphanumeric() {
                    break;
                }
                if c == b'e' || c == b'E' {
                    saw_e = true;
                }
                probe.bump();
                end = probe.pos();
            }
        }
        if end == start {
            radix = 10;
        } else {
            let mut probe = cur.clone();
            probe.set_pos(end - 1);
            let last = probe.peek().unwrap_or(0).to_ascii_uppercase();
            match last {
                b'B' => {
                    radix = 2;
                    suffix_pos = Some(end - 1);
                }
                b'D' => {
                    radix = 10;
                    suffix_pos = Some(end - 1);
                }
                b'O' | b'Q' => {
                    radix = 8;
                    suffix_pos = Some(end - 1);
                }
                b'H' => {
                    radix = 16;
                    suffix_pos = Some(end - 1);
                }
                b'E' => return floating_constant(asm, cur, b'd'),
                _ => {
                    if saw_e {
                        return floating_constant(asm, cur, b'd');
                    }
                    radix = 10;
                }
            }
        }
    }

    let digit = |c: u8| -> Option<u32> {
        let v = match c {
            b'0'..=b'9' => (c - b'0') as u32,
            b'a'..=b'f' => (c - b'a') as u32 + 10,
            b'A'..=b'F' => (c - b'A') as u32 + 10,
            _ => return None,
        };
        (v < radix).then_some(v)
    };

    let start = cur.pos();
    let mut number: u64 = 0;
    let mut overflow = false;
    while let Some(c) = cur.peek() {
        if let Some(pos) = suffix_pos {
            if cur.pos() == pos {
                break;
            }
        }
        let Some(d) = digit(c) else { break };
        cur.bump();
        let (mul, o1) = number.overflowing_mul(radix as u64);
        let (add, o2) = mul.overflowing_add(d as u64);
        overflow |= o1 || o2;
        number = add;
    }

    let expr = if overflow {
        // Too big for the host word; rebuild as 16-bit limbs.
        let mut parts: LittleNums = SmallVec::new();
        parts.push(0);
        let mut rescan = Cursor::new("");
        std::mem::swap(&mut rescan, cur);
        let mut probe = rescan.clone();
        probe.set_pos(start);
        while let Some(c) = probe.peek() {
            if let Some(pos) = suffix_pos {
                if probe.pos() == pos {
                    break;
                }
            }
            let Some(d) = digit(c) else { break };
            probe.bump();
            let mut carry = d as u32;
            for limb in parts.iter_mut() {
                let work = carry + radix * (*limb as u32);
                *limb = (work & 0xffff) as u16;
                carry = work >> 16;
            }
            while carry != 0 {
                parts.push((carry & 0xffff) as u16);
                carry >>= 16;
            }
        }
        *cur = probe;
        Expr {
            value: ExprValue::Big(Big::Int(parts)),
            unsigned: true,
        }
    } else {
        Expr {
            value: ExprValue::Constant(number as i64),
            unsigned: true,
        }
    };

    // Consume the MRI radix suffix letter.
    if let Some(pos) = suffix_pos {
        if cur.pos() == pos {
            cur.bump();
        }
    }

    if let ExprValue::Constant(n) = expr.value {
        // Local-label references: `4f` forward, `4b` backward, `4$`.
        match cur.peek() {
            Some(b'b') if !asm.opts.mri => {
                cur.bump();
                let name = asm.symbols.fb_label_name(n as u32, false);
                let found = asm.symbol_find(&name).filter(|&s| {
                    asm.symbols.syms[s].segment != Segment::Undefined
                });
                return match found {
                    Some(sym) => Expr::symbol(sym),
                    None => {
                        asm.error(format!(
                            "backward reference to unknown label \"{n}:\", 0 assumed"
                        ));
                        Expr::constant(0)
                    }
                };
            }
            Some(b'f') if !asm.opts.mri => {
                cur.bump();
                let name = asm.symbols.fb_label_name(n as u32, true);
                let sym = asm.symbol_find_or_make(&name);
                return Expr::symbol(sym);
            }
            Some(b'$') if asm.opts.dollar_labels => {
                cur.bump();
                let name = asm.symbols.dollar_label_name(n as u32, false);
                let sym = asm.symbol_find_or_make(&name);
                return Expr::symbol(sym);
            }
            _ => {}
        }
    }

    expr
}

/// Parse a floating constant of flavor `letter`.
fn floating_constant(asm: &mut Assembler, cur: &mut Cursor, letter: u8) -> Expr {
    let text = cur.rest();
    let bytes = text.as_bytes();
    let mut len = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    while len < bytes.len() {
        let c = bytes[len];
        match c {
            b'0'..=b'9' => seen_digit = true,
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if seen_digit && !seen_exp => {
                seen_exp = true;
                if matches!(bytes.get(len + 1), Some(b'+') | Some(b'-')) {
                    len += 1;
                }
            }
            b'-' | b'+' if len == 0 => {}
            _ => break,
        }
        len += 1;
    }

    let parsed = text[..len].parse::<f64>().ok();
    for _ in 0..len {
        cur.bump();
    }
    match parsed {
        Some(value) => Expr {
            value: ExprValue::Big(Big::Float {
                letter: letter.to_ascii_lowercase(),
                value,
            }),
            unsigned: true,
        },
        None => {
            asm.error("bad floating-point constant");
            Expr::constant(0)
        }
    }
}

/// MRI multi-character constant: `'ab'`, big-endian, with a doubled quote
/// escaping a literal quote. The trailing partial limb is left-justified.
fn mri_char_constant(asm: &mut Assembler, cur: &mut Cursor) -> Expr {
    let mut bytes: Vec<u8> = Vec::new();
    loop {
        match cur.next_byte() {
            None => {
                asm.error("unterminated character constant");
                break;
            }
            Some(b'\'') => {
                if cur.peek() == Some(b'\'') {
                    cur.bump();
                    bytes.push(b'\'');
                } else {
                    break;
                }
            }
            Some(c) => bytes.push(c),
        }
    }

    if bytes.len() <= 4 {
        let mut v: i64 = 0;
        for &b in &bytes {
            v = (v << 8) | b as i64;
        }
        return Expr {
            value: ExprValue::Constant(v),
            unsigned: true,
        };
    }

    // Pair characters from the left, big-endian within each limb; a
    // trailing partial limb is left-justified to match the earlier ones.
    let mut parts: LittleNums = bytes
        .chunks(2)
        .map(|ch| {
            if ch.len() == 2 {
                ((ch[0] as u16) << 8) | ch[1] as u16
            } else {
                (ch[0] as u16) << 8
            }
        })
        .collect();
    parts.reverse();
    Expr {
        value: ExprValue::Big(Big::Int(parts)),
        unsigned: true,
    }
}

fn parse_symbol_operand(asm: &mut Assembler, name: &str) -> (Segment, Expr) {
    let sym = asm.symbol_find_or_make(name);
    let seg = asm.symbols.syms[sym].segment;
    match seg {
        Segment::Absolute => {
            let v = asm.symbol_constant_value(sym);
            (Segment::Absolute, Expr::constant(v))
        }
        Segment::Register => {
            let v = asm.symbol_constant_value(sym);
            (
                Segment::Register,
                Expr {
                    value: ExprValue::Register(v as u32),
                    unsigned: true,
                },
            )
        }
        _ => (seg, Expr::symbol(sym)),
    }
}

/// `.startof.(name)` / `.sizeof.(name)`: link-time section geometry,
/// represented as undefined symbols the linker recognizes.
fn startof_sizeof(asm: &mut Assembler, cur: &mut Cursor, start: bool) -> Expr {
    cur.skip_whitespace();
    if !cur.eat(b'(') {
        asm.error("syntax error in .startof. or .sizeof.");
        return Expr::constant(0);
    }
    cur.skip_whitespace();
    let Some(name) = cur.take_name() else {
        asm.error("syntax error in .startof. or .sizeof.");
        return Expr::constant(0);
    };
    let name = name.to_string();
    let full = if start {
        format!(".startof.{name}")
    } else {
        format!(".sizeof.{name}")
    };
    let sym = asm.symbol_find_or_make(&full);
    cur.skip_whitespace();
    if !cur.eat(b')') {
        asm.error("syntax error in .startof. or .sizeof.");
    }
    Expr::symbol(sym)
}

/// Parse one operand. The cursor ends on the first non-blank character
/// after the operand.
fn operand(asm: &mut Assembler, target: &dyn TargetOps, cur: &mut Cursor) -> (Segment, Expr) {
    cur.skip_whitespace();
    let mri = asm.opts.mri;

    let Some(c) = cur.peek() else {
        return (Segment::Absolute, Expr::absent());
    };

    let mut result = match c {
        b'1'..=b'9' => {
            let e = integer_constant(asm, cur, if mri { 0 } else { 10 });
            (Segment::Absolute, e)
        }

        b'0' => {
            cur.bump();
            // MRI radix spellings (`0AH`, `12O`, `777Q`) are detected from
            // the suffix; hand the whole token back to the scanner.
            if mri && matches!(cur.peek(), Some(c) if c.is_ascii_alphanumeric()) {
                cur.back();
                let e = integer_constant(asm, cur, 0);
                return finish_operand(asm, (Segment::Absolute, e), cur);
            }
            let next = cur.peek();
            let e = match next {
                Some(b'x') | Some(b'X') if !mri => {
                    cur.bump();
                    integer_constant(asm, cur, 16)
                }
                Some(b'b') | Some(b'B') => {
                    // `0b` may start a binary number or reference label 0
                    // backward; only digits (or end) after it mean binary.
                    let mut probe = cur.clone();
                    probe.bump();
                    let is_binary = match probe.peek() {
                        Some(b'+') | Some(b'-') => {
                            // A difference expression like `0b-4f` keeps the
                            // label reading unless every following digit run
                            // ends in another local label letter.
                            loop {
                                probe.bump();
                                match probe.peek() {
                                    Some(b'0'..=b'9') => continue,
                                    Some(b'b') | Some(b'f') => break false,
                                    _ => break true,
                                }
                            }
                        }
                        Some(b'0'..=b'9') => true,
                        None => false,
                        _ => false,
                    };
                    if is_binary && !mri {
                        cur.bump();
                        integer_constant(asm, cur, 2)
                    } else {
                        cur.back();
                        integer_constant(asm, cur, 10)
                    }
                }
                Some(b'0'..=b'7') => integer_constant(asm, cur, if mri { 0 } else { 8 }),
                Some(b'f') => {
                    // `0f` is a float only when it cannot be a label
                    // difference like `0f-0b`.
                    let mut probe = cur.clone();
                    probe.bump();
                    let mut is_label = probe.at_end();
                    if !is_label {
                        let mut p2 = probe.clone();
                        while matches!(p2.peek(), Some(b'0'..=b'9') | Some(b'.')) {
                            p2.bump();
                        }
                        if matches!(p2.peek(), Some(b'b') | Some(b'f')) {
                            is_label = true;
                        }
                    }
                    if is_label {
                        integer_constant(asm, cur, 10)
                    } else {
                        cur.bump();
                        floating_constant(asm, cur, b'f')
                    }
                }
                Some(l) if FLT_CHARS.contains(&l) => {
                    cur.bump();
                    floating_constant(asm, cur, l)
                }
                Some(b'$') if asm.opts.dollar_labels => integer_constant(asm, cur, 10),
                _ => Expr::constant(0),
            };
            (Segment::Absolute, e)
        }

        b'(' | b'[' => {
            cur.bump();
            let (seg, e) = expression(asm, target, cur);
            let closer = if c == b'(' { b')' } else { b']' };
            if !cur.eat(closer) {
                asm.error("missing ')' assumed");
            }
            cur.skip_whitespace();
            return (seg, e);
        }

        b'\'' => {
            cur.bump();
            if mri {
                (Segment::Absolute, mri_char_constant(asm, cur))
            } else {
                // No escapes: the next character, whatever it is, is the
                // value.
                let v = cur.next_byte().unwrap_or(0);
                (Segment::Absolute, Expr::constant(v as i64))
            }
        }

        b'+' => {
            cur.bump();
            operand(asm, target, cur)
        }

        b'-' | b'~' | b'!' | b'"' => {
            if c == b'"' && !mri {
                return unknown_operand(asm, target, cur);
            }
            cur.bump();
            let (seg, mut e) = operand(asm, target, cur);
            match e.value {
                ExprValue::Constant(v) => {
                    e.value = ExprValue::Constant(match c {
                        b'-' => {
                            e.unsigned = false;
                            v.wrapping_neg()
                        }
                        b'~' | b'"' => !v,
                        _ => (v == 0) as i64,
                    });
                    (seg, e)
                }
                ExprValue::Absent | ExprValue::Illegal => {
                    asm.warn(format!(
                        "unary operator {} ignored because bad operand follows",
                        c as char
                    ));
                    (seg, e)
                }
                _ => {
                    let op = match c {
                        b'-' => UnaryOp::Minus,
                        b'~' | b'"' => UnaryOp::BitNot,
                        _ => UnaryOp::LogicalNot,
                    };
                    let wrapped = wrap_unary(asm, op, &e);
                    (seg, wrapped)
                }
            }
        }

        b'$' => {
            if mri {
                cur.bump();
                if matches!(cur.peek(), Some(c) if c.is_ascii_hexdigit()) {
                    let e = integer_constant(asm, cur, 16);
                    (Segment::Absolute, e)
                } else if matches!(cur.peek(), Some(c) if is_part_of_name(c)) {
                    cur.back();
                    named_operand(asm, cur)
                } else {
                    let e = current_location(asm);
                    let seg = asm.now_seg;
                    (seg_of_location(seg), e)
                }
            } else {
                named_operand(asm, cur)
            }
        }

        b'%' if mri => {
            cur.bump();
            let e = integer_constant(asm, cur, 2);
            (Segment::Absolute, e)
        }

        b'@' if mri => {
            cur.bump();
            let e = integer_constant(asm, cur, 8);
            (Segment::Absolute, e)
        }

        b':' if mri => {
            cur.bump();
            let e = integer_constant(asm, cur, 16);
            (Segment::Absolute, e)
        }

        b'*' if mri => {
            cur.bump();
            let e = current_location(asm);
            let seg = asm.now_seg;
            (seg_of_location(seg), e)
        }

        b'.' => {
            let mut probe = cur.clone();
            probe.bump();
            if !matches!(probe.peek(), Some(c) if is_part_of_name(c)) {
                cur.bump();
                let e = current_location(asm);
                let seg = asm.now_seg;
                (seg_of_location(seg), e)
            } else if probe.eat_keyword("startof.") {
                *cur = probe;
                let e = startof_sizeof(asm, cur, true);
                (Segment::Undefined, e)
            } else if probe.eat_keyword("sizeof.") {
                *cur = probe;
                let e = startof_sizeof(asm, cur, false);
                (Segment::Undefined, e)
            } else {
                named_operand(asm, cur)
            }
        }

        b',' => {
            return (Segment::Absolute, Expr::absent());
        }

        _ => {
            if is_name_beginner(c) {
                named_operand(asm, cur)
            } else {
                return unknown_operand(asm, target, cur);
            }
        }
    };

    finish_operand(asm, result, cur)
}

fn finish_operand(
    asm: &mut Assembler,
    mut result: (Segment, Expr),
    cur: &mut Cursor,
) -> (Segment, Expr) {
    cur.skip_whitespace();
    mark_used(asm, &result.1);

    // The final segment follows the value shape, not the path we took.
    result.0 = match &result.1.value {
        ExprValue::Symbol { sym, .. } | ExprValue::SymbolRva { sym, .. } => {
            asm.symbols.syms[*sym].segment
        }
        ExprValue::Register(_) => Segment::Register,
        ExprValue::Constant(_) | ExprValue::Big(_) => Segment::Absolute,
        _ => result.0,
    };
    result
}

fn seg_of_location(seg: Segment) -> Segment {
    match seg {
        Segment::Absolute => Segment::Absolute,
        s => s,
    }
}

fn named_operand(asm: &mut Assembler, cur: &mut Cursor) -> (Segment, Expr) {
    match cur.take_name() {
        Some(name) => {
            let name = name.to_string();
            parse_symbol_operand(asm, &name)
        }
        None => (Segment::Absolute, Expr::absent()),
    }
}

/// Nothing we recognize: give the target a shot, then give up.
fn unknown_operand(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    cur: &mut Cursor,
) -> (Segment, Expr) {
    let before = cur.pos();
    if let Some(e) = target.parse_operand(asm, cur) {
        let seg = match &e.value {
            ExprValue::Register(_) => Segment::Register,
            ExprValue::Symbol { sym, .. } => asm.symbols.syms[*sym].segment,
            _ => Segment::Absolute,
        };
        return (seg, e);
    }
    cur.set_pos(before);
    cur.bump();
    asm.error("bad expression");
    (Segment::Absolute, Expr::constant(0))
}

/// Scan the operator at the cursor. Single-character operators leave the
/// cursor on the character; the caller advances past the first character
/// after deciding to consume the operator, so multi-character operators
/// advance to their *last* character here.
fn scan_operator(asm: &Assembler, cur: &mut Cursor) -> Option<BinaryOp> {
    let mri = asm.opts.mri;
    let c = cur.peek()?;
    let op = match c {
        b'+' => BinaryOp::Add,
        b'-' => BinaryOp::Sub,
        b'*' => BinaryOp::Mul,
        b'/' => BinaryOp::Div,
        b'%' => BinaryOp::Mod,
        b'^' => BinaryOp::BitXor,
        b'"' if mri => BinaryOp::BitOrNot,
        b'<' => match cur.peek2() {
            Some(b'<') => {
                cur.bump();
                BinaryOp::Shl
            }
            Some(b'>') => {
                cur.bump();
                BinaryOp::Ne
            }
            Some(b'=') => {
                cur.bump();
                BinaryOp::Le
            }
            _ => BinaryOp::Lt,
        },
        b'>' => match cur.peek2() {
            Some(b'>') => {
                cur.bump();
                BinaryOp::Shr
            }
            Some(b'=') => {
                cur.bump();
                BinaryOp::Ge
            }
            _ => BinaryOp::Gt,
        },
        b'=' => match cur.peek2() {
            Some(b'=') => {
                cur.bump();
                BinaryOp::Eq
            }
            _ => BinaryOp::Eq,
        },
        b'!' => match cur.peek2() {
            // `!!` is accepted as exclusive or for MRI compatibility.
            Some(b'!') => {
                cur.bump();
                BinaryOp::BitXor
            }
            Some(b'=') => {
                cur.bump();
                BinaryOp::Ne
            }
            _ => {
                if mri {
                    BinaryOp::BitOr
                } else {
                    BinaryOp::BitOrNot
                }
            }
        },
        b'|' => match cur.peek2() {
            Some(b'|') => {
                cur.bump();
                BinaryOp::LogicalOr
            }
            _ => BinaryOp::BitOr,
        },
        b'&' => match cur.peek2() {
            Some(b'&') => {
                cur.bump();
                BinaryOp::LogicalAnd
            }
            _ => BinaryOp::BitAnd,
        },
        _ => return None,
    };
    Some(op)
}

fn fold_constants(asm: &mut Assembler, op: BinaryOp, l: i64, r: i64) -> i64 {
    let mut v = r;
    if v == 0 && matches!(op, BinaryOp::Div | BinaryOp::Mod) {
        asm.warn("division by zero");
        v = 1;
    }
    let truth = |b: bool| if b { !0 } else { 0 };
    match op {
        BinaryOp::Mul => l.wrapping_mul(v),
        BinaryOp::Div => l.wrapping_div(v),
        BinaryOp::Mod => l.wrapping_rem(v),
        BinaryOp::Shl => l.wrapping_shl(v as u32),
        BinaryOp::Shr => ((l as u64).wrapping_shr(v as u32)) as i64,
        BinaryOp::BitOr => l | v,
        BinaryOp::BitOrNot => l | !v,
        BinaryOp::BitXor => l ^ v,
        BinaryOp::BitAnd => l & v,
        BinaryOp::Add => l.wrapping_add(v),
        BinaryOp::Sub => l.wrapping_sub(v),
        BinaryOp::Eq => truth(l == v),
        BinaryOp::Ne => truth(l != v),
        BinaryOp::Lt => truth(l < v),
        BinaryOp::Le => truth(l <= v),
        BinaryOp::Ge => truth(l >= v),
        BinaryOp::Gt => truth(l > v),
        BinaryOp::LogicalAnd => (l != 0 && v != 0) as i64,
        BinaryOp::LogicalOr => (l != 0 || v != 0) as i64,
    }
}

fn demote_big(asm: &mut Assembler, e: &mut Expr, side: &str) {
    if let ExprValue::Big(big) = &e.value {
        let what = match big {
            Big::Int(_) => "bignum",
            Big::Float { .. } => "float",
        };
        asm.warn(format!("{side} operand is a {what}; integer 0 assumed"));
        e.value = ExprValue::Constant(0);
    }
}

/// Precedence-climbing expression parser. After return the cursor rests on
/// an operator of rank `<= rank` (or on a non-operator).
pub fn parse_expression(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    cur: &mut Cursor,
    rank: u8,
) -> (Segment, Expr) {
    let mri = asm.opts.mri;
    let (mut retseg, mut left) = operand(asm, target, cur);

    loop {
        let checkpoint = cur.clone();
        let Some(op) = scan_operator(asm, cur) else {
            break;
        };
        if op.rank(mri) <= rank {
            *cur = checkpoint;
            break;
        }
        cur.bump();

        let (rightseg, mut right) = parse_expression(asm, target, cur, op.rank(mri));
        if right.is_absent() {
            asm.warn("missing operand; zero assumed");
            right = Expr::constant(0);
        }

        // Segment bookkeeping: the first normal segment wins; combining two
        // different normal segments is only meaningful for subtraction.
        if retseg == Segment::Undefined {
            if rightseg.is_normal() {
                retseg = rightseg;
            }
        } else if !retseg.is_normal() {
            retseg = rightseg;
        } else if rightseg.is_normal() && retseg != rightseg && op != BinaryOp::Sub {
            asm.error("operation combines symbols in different segments");
        }

        demote_big(asm, &mut left, "left");
        demote_big(asm, &mut right, "right");

        match (&left.value.clone(), &right.value.clone()) {
            // X + constant / X - constant.
            (_, ExprValue::Constant(rc))
                if op == BinaryOp::Add && !matches!(left.value, ExprValue::Constant(_)) =>
            {
                left.bump(*rc);
            }
            (_, ExprValue::Constant(rc))
                if op == BinaryOp::Sub && !matches!(left.value, ExprValue::Constant(_)) =>
            {
                left.bump(-*rc);
            }

            // The PIC case: `sym1 - sym2` where both symbols sit in the
            // same frag of a normal segment reduces immediately.
            (
                ExprValue::Symbol { sym: ls, add: la },
                ExprValue::Symbol { sym: rs, add: ra },
            ) if op == BinaryOp::Sub
                && asm.symbols.syms[*ls].frag.is_some()
                && asm.symbols.syms[*ls].frag == asm.symbols.syms[*rs].frag
                && asm.symbols.syms[*rs].segment.is_normal() =>
            {
                let lv = asm.symbol_constant_value(*ls);
                let rv = asm.symbol_constant_value(*rs);
                left = Expr {
                    value: ExprValue::Constant(la + lv - rv - ra),
                    unsigned: true,
                };
                retseg = Segment::Absolute;
            }

            // Constant + X commutes.
            (ExprValue::Constant(lc), _) if op == BinaryOp::Add => {
                right.bump(*lc);
                left = right;
                retseg = rightseg;
            }

            // Constant OP constant folds outright.
            (ExprValue::Constant(lc), ExprValue::Constant(rc)) => {
                let v = fold_constants(asm, op, *lc, *rc);
                let unsigned = left.unsigned && right.unsigned;
                left = Expr {
                    value: ExprValue::Constant(v),
                    unsigned,
                };
            }

            // Symbol OP symbol stays a single operator node when the
            // addends permit.
            (
                ExprValue::Symbol { sym: ls, add: la },
                ExprValue::Symbol { sym: rs, add: ra },
            ) if op == BinaryOp::Add
                || op == BinaryOp::Sub
                || (*la == 0 && *ra == 0) =>
            {
                let add = match op {
                    BinaryOp::Add => la + ra,
                    BinaryOp::Sub => la - ra,
                    _ => 0,
                };
                left = Expr {
                    value: ExprValue::Binary {
                        op,
                        lhs: *ls,
                        rhs: *rs,
                        add,
                    },
                    unsigned: true,
                };
            }

            // The general case: wrap both sides in expression symbols.
            _ => {
                let lhs = make_expr_symbol(asm, &left);
                let rhs = make_expr_symbol(asm, &right);
                left = Expr {
                    value: ExprValue::Binary {
                        op,
                        lhs,
                        rhs,
                        add: 0,
                    },
                    unsigned: true,
                };
            }
        }
    }

    mark_used(asm, &left);
    if matches!(left.value, ExprValue::Constant(_)) {
        retseg = Segment::Absolute;
    }
    (retseg, left)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AsmOptions;
    use crate::target::null_target;

    fn eval(src: &str) -> Expr {
        let mut asm = Assembler::new(AsmOptions::default());
        let t = null_target();
        let mut cur = Cursor::new(src);
        expression(&mut asm, &*t, &mut cur).1
    }

    #[test]
    fn constant_folding() {
        assert_eq!(eval("5 + 3").value, ExprValue::Constant(8));
        assert_eq!(eval("2*3+4").value, ExprValue::Constant(10));
        assert_eq!(eval("2+3*4").value, ExprValue::Constant(14));
        assert_eq!(eval("(2+3)*4").value, ExprValue::Constant(20));
        assert_eq!(eval("1<<4 | 1").value, ExprValue::Constant(17));
        assert_eq!(eval("7 & 5").value, ExprValue::Constant(5));
    }

    #[test]
    fn radix_prefixes() {
        assert_eq!(eval("0x10").value, ExprValue::Constant(16));
        assert_eq!(eval("0b101").value, ExprValue::Constant(5));
        assert_eq!(eval("017").value, ExprValue::Constant(15));
        assert_eq!(eval("0").value, ExprValue::Constant(0));
    }

    #[test]
    fn comparisons_fold_to_all_ones() {
        assert_eq!(eval("1 == 1").value, ExprValue::Constant(!0));
        assert_eq!(eval("1 <> 1").value, ExprValue::Constant(0));
        assert_eq!(eval("2 >= 1").value, ExprValue::Constant(!0));
    }

    #[test]
    fn unary_operators() {
        assert_eq!(eval("-5").value, ExprValue::Constant(-5));
        assert!(!eval("-5").unsigned);
        assert_eq!(eval("~0").value, ExprValue::Constant(-1));
        assert_eq!(eval("!1").value, ExprValue::Constant(0));
    }

    #[test]
    fn division_by_zero_warns_and_uses_one() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let t = null_target();
        let mut cur = Cursor::new("10/0");
        let (_, e) = expression(&mut asm, &*t, &mut cur);
        assert_eq!(e.value, ExprValue::Constant(10));
        assert_eq!(asm.diag.warning_count(), 1);
    }

    #[test]
    fn char_constant_no_escapes() {
        assert_eq!(eval("'A").value, ExprValue::Constant(65));
        assert_eq!(eval("'\\").value, ExprValue::Constant(92));
    }

    #[test]
    fn symbol_minus_symbol_same_frag_folds() {
        let mut asm = Assembler::new(AsmOptions::default());
        let t = null_target();
        // Define two labels four bytes apart in the same frag.
        asm.colon("a");
        asm.frag_more(4);
        asm.colon("b");
        let mut cur = Cursor::new("b - a");
        let (seg, e) = expression(&mut asm, &*t, &mut cur);
        assert_eq!(e.value, ExprValue::Constant(4));
        assert_eq!(seg, Segment::Absolute);
    }

    #[test]
    fn bignum_overflow() {
        let e = eval("0x112233445566778899");
        match e.value {
            ExprValue::Big(Big::Int(parts)) => {
                assert_eq!(parts[0], 0x8899);
                assert_eq!(parts[1], 0x6677);
                assert_eq!(parts.last(), Some(&0x1));
            }
            other => panic!("expected bignum, got {other:?}"),
        }
    }

    #[test]
    fn mri_radix_suffixes() {
        let mut opts = AsmOptions::default();
        opts.mri = true;
        let mut asm = Assembler::new(opts);
        let t = null_target();
        for (src, want) in [("0AH", 10), ("12O", 10), ("1010B", 10), ("100D", 100)] {
            let mut cur = Cursor::new(src);
            let (_, e) = expression(&mut asm, &*t, &mut cur);
            assert_eq!(e.value, ExprValue::Constant(want), "{src}");
        }
    }

    #[test]
    fn missing_operand_assumes_zero() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let t = null_target();
        let mut cur = Cursor::new("4+");
        let (_, e) = expression(&mut asm, &*t, &mut cur);
        assert_eq!(e.value, ExprValue::Constant(4));
        assert_eq!(asm.diag.warning_count(), 1);
    }
}
