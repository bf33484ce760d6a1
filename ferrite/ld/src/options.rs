//! Linker configuration and the diagnostic callback surface.

/// How much of the symbol table survives the link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StripMode {
    /// Keep everything.
    #[default]
    None,
    /// Strip debugging symbols only.
    Debugger,
    /// Strip everything except the names in the keep list.
    Some(Vec<String>),
    /// Strip the whole symbol table.
    All,
}

/// Which local symbols are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscardMode {
    /// Keep all locals.
    #[default]
    None,
    /// Discard compiler-generated locals (the `L` prefix).
    LPrefix,
    /// Discard every local.
    All,
}

/// Linker options.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Produce relocatable output (`-r`): keep relocations, do not
    /// resolve them into the section bytes.
    pub relocatable: bool,
    /// Symbol-table strip policy.
    pub strip: StripMode,
    /// Local-symbol discard policy.
    pub discard: DiscardMode,
    /// Prefix that marks discardable locals.
    pub lprefix: String,
    /// Keep input symbol buffers in memory after each file is processed.
    pub keep_memory: bool,
    /// Disable string-table hashing and the stab optimization, matching
    /// old tools byte for byte.
    pub traditional_format: bool,
    /// Entry-point symbol.
    pub entry: Option<String>,
    /// Base address of the first loaded output section.
    pub image_base: u64,
    /// Allow the difference of undefined symbols in inputs (set for
    /// position-independent code).
    pub undefined_difference_ok: bool,
    /// Warn about writable sections in `-mrelocatable` style output,
    /// except for these names.
    pub writable_ok: Vec<String>,
    /// Check writable sections at all.
    pub check_writable: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            relocatable: false,
            strip: StripMode::None,
            discard: DiscardMode::None,
            lprefix: "L".to_string(),
            keep_memory: false,
            traditional_format: false,
            entry: None,
            image_base: 0,
            undefined_difference_ok: false,
            writable_ok: vec![
                ".got2".into(),
                ".dtors".into(),
                ".ctors".into(),
                ".fixup".into(),
                ".stab".into(),
                ".gcc_except_table".into(),
                ".ex_shared".into(),
            ],
            check_writable: false,
        }
    }
}

/// Diagnostic callbacks; the driver decides whether any of these are
/// fatal. The default implementation logs and counts.
pub trait LinkCallbacks {
    /// `name` is referenced from `whence` but never defined.
    fn undefined_symbol(&mut self, name: &str, whence: &str);

    /// `name` is defined in both `old` and `new`.
    fn multiple_definition(&mut self, name: &str, old: &str, new: &str);

    /// A relocation in `input` refers to a symbol that was stripped.
    fn unattached_reloc(&mut self, name: &str, input: &str, address: u64);

    /// `member` of `archive` was pulled into the link to define `symbol`.
    fn add_archive_element(&mut self, archive: &str, member: &str, symbol: &str);

    /// A reloc field overflowed while relocating `input`.
    fn reloc_overflow(&mut self, name: &str, input: &str, address: u64);

    /// How many errors the callbacks have seen.
    fn error_count(&self) -> usize;
}

/// Stderr-reporting callbacks with error counting.
#[derive(Debug, Default)]
pub struct DefaultCallbacks {
    pub errors: usize,
    /// Suppress stderr output (used by tests).
    pub quiet: bool,
}

impl DefaultCallbacks {
    /// Create a reporting instance.
    pub fn new() -> Self {
        Self::default()
    }

    fn report(&mut self, msg: String) {
        log::debug!("{msg}");
        if !self.quiet {
            eprintln!("{msg}");
        }
    }
}

impl LinkCallbacks for DefaultCallbacks {
    fn undefined_symbol(&mut self, name: &str, whence: &str) {
        self.errors += 1;
        self.report(format!("{whence}: undefined reference to `{name}'"));
    }

    fn multiple_definition(&mut self, name: &str, old: &str, new: &str) {
        self.errors += 1;
        self.report(format!(
            "{new}: multiple definition of `{name}' (first defined in {old})"
        ));
    }

    fn unattached_reloc(&mut self, name: &str, input: &str, address: u64) {
        self.errors += 1;
        self.report(format!(
            "{input}: reloc at {address:#x} against stripped symbol `{name}'"
        ));
    }

    fn add_archive_element(&mut self, archive: &str, member: &str, symbol: &str) {
        log::debug!("{archive}({member}) pulled in for `{symbol}'");
    }

    fn reloc_overflow(&mut self, name: &str, input: &str, address: u64) {
        self.errors += 1;
        self.report(format!(
            "{input}: relocation overflow at {address:#x} against `{name}'"
        ));
    }

    fn error_count(&self) -> usize {
        self.errors
    }
}
