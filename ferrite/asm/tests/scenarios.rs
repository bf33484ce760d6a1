//! End-to-end assembler scenarios driven through the public API.

use ferrite_asm::context::{AsmOptions, Assembler, Endian};
use ferrite_asm::diag::Diagnostics;
use ferrite_asm::symbol::SymbolFlags;
use ferrite_asm::target::falcon::Falcon;
use ferrite_asm::write::{build_object, ObjModule, ObjSymbolHome};
use ferrite_asm::{read, relax};

fn assemble(src: &str) -> (Assembler, ObjModule) {
    assemble_with(src, AsmOptions::default())
}

fn assemble_with(src: &str, opts: AsmOptions) -> (Assembler, ObjModule) {
    let mut asm = Assembler::new(opts);
    asm.diag = Diagnostics::silent();
    let falcon = Falcon::new();
    asm.sources.push_file("test.s", src);
    read::read_source(&mut asm, &falcon).expect("read");
    let module = build_object(&mut asm, &falcon).expect("build");
    (asm, module)
}

#[test]
fn equate_folds_into_data() {
    let (asm, module) = assemble(".equ x, 5 + 3\n.long x\n.long x - 2\n");
    assert_eq!(asm.diag.error_count(), 0);
    let text = &module.sections[0];
    assert_eq!(text.contents, vec![0x08, 0, 0, 0, 0x06, 0, 0, 0]);
    assert!(text.relocs.is_empty());
}

#[test]
fn equate_folds_big_endian() {
    let (_, module) = assemble_with(
        ".equ x, 5 + 3\n.long x\n.long x - 2\n",
        AsmOptions {
            endian: Some(Endian::Big),
            ..Default::default()
        },
    );
    assert_eq!(
        module.sections[0].contents,
        vec![0, 0, 0, 0x08, 0, 0, 0, 0x06]
    );
}

#[test]
fn pcrel_branch_resolves_without_reloc() {
    let (asm, module) = assemble("foo: nop\nnop\n bne r1, r2, foo\n");
    assert_eq!(asm.diag.error_count(), 0);
    let text = &module.sections[0];
    assert!(text.relocs.is_empty());
    // Displacement field: (addr(foo) - (addr(bne) + 4)) / 4 = -3.
    let insn = u32::from_le_bytes(text.contents[8..12].try_into().unwrap());
    assert_eq!((insn & 0xffff) as u16, (-3i16) as u16);
}

#[test]
fn branch_relaxation_grows_across_range_boundary() {
    // A forward branch over 129 bytes no longer fits the short form's
    // 127-byte reach; the second relaxation pass picks the 6-byte form.
    let mut src = String::from("b far\n");
    for _ in 0..32 {
        src.push_str("nop\n");
    }
    src.push_str(".byte 1\n");
    src.push_str("far: nop\n");
    let (asm, module) = assemble(&src);
    assert_eq!(asm.diag.error_count(), 0);

    let text = &module.sections[0];
    // 6-byte long branch + 32 nops + 1 byte + final nop.
    assert_eq!(text.size, 6 + 32 * 4 + 1 + 4);
    // The long form carries an absolute target word and needs a reloc.
    assert_eq!(text.relocs.len(), 1);
    let target_word = u32::from_le_bytes(text.contents[2..6].try_into().unwrap());
    assert_eq!(target_word as u64, 6 + 32 * 4 + 1);
}

#[test]
fn short_branch_in_range_stays_short() {
    let (asm, module) = assemble("b near\nnop\nnear: nop\n");
    assert_eq!(asm.diag.error_count(), 0);
    assert_eq!(module.sections[0].size, 2 + 4 + 4);
    assert!(module.sections[0].relocs.is_empty());
}

#[test]
fn symbol_difference_is_absolute() {
    let (asm, module) = assemble("a:\n.long b - a\nb:\n");
    assert_eq!(asm.diag.error_count(), 0);
    let text = &module.sections[0];
    assert_eq!(text.contents, vec![4, 0, 0, 0]);
    assert!(text.relocs.is_empty());
}

#[test]
fn comm_and_lcomm_defaults() {
    let (asm, module) = assemble(".comm c1, 16, 4\n.lcomm c2, 8\n");
    assert_eq!(asm.diag.error_count(), 0);

    let c1 = module.symbols.iter().find(|s| s.name == "c1").unwrap();
    assert_eq!(c1.home, ObjSymbolHome::Common);
    assert_eq!(c1.value, 16);
    assert_eq!(c1.align, 2);
    assert!(c1.external);

    // c2 landed in bss with the default >= 8 bytes -> 8-byte alignment.
    let c2 = module.symbols.iter().find(|s| s.name == "c2").unwrap();
    let bss_index = module
        .sections
        .iter()
        .position(|s| s.name == ".bss")
        .unwrap();
    assert_eq!(c2.home, ObjSymbolHome::Section(bss_index));
    assert!(!c2.external);
    assert_eq!(module.sections[bss_index].size, 8);
}

#[test]
fn frag_chain_closure_holds_after_relaxation() {
    let src = "\
b far\n\
.align 4\n\
.byte 1\n\
.space 9\n\
.org 64\n\
far: nop\n";
    let mut asm = Assembler::new(AsmOptions::default());
    asm.diag = Diagnostics::silent();
    let falcon = Falcon::new();
    asm.sources.push_file("test.s", src);
    read::read_source(&mut asm, &falcon).unwrap();
    build_object(&mut asm, &falcon).unwrap();
    assert_eq!(asm.diag.error_count(), 0);
    for section in asm.sections.keys().collect::<Vec<_>>() {
        assert!(relax::check_chain_closure(&asm, section).is_none());
    }
}

#[test]
fn resolution_is_idempotent_across_module_build() {
    let (mut asm, _) = assemble("x:\nnop\ny = x + 4\n.long y\n");
    let y = asm.symbol_find("y").unwrap();
    let v1 = asm.resolve_symbol(y);
    let v2 = asm.resolve_symbol(y);
    assert_eq!(v1, v2);
}

#[test]
fn self_difference_folds_to_zero_before_fixups() {
    let (asm, module) = assemble("s1: nop\n.long s1 - s1\n");
    assert_eq!(asm.diag.error_count(), 0);
    assert_eq!(module.sections[0].contents[4..8], [0, 0, 0, 0]);
    assert!(module.sections[0].relocs.is_empty());
}

#[test]
fn reloc_targets_survive_and_are_marked() {
    let (asm, module) = assemble(".long ext\n.globl here\nhere: nop\n.long here\n");
    assert_eq!(asm.diag.error_count(), 0);
    // Every reloc points at a written symbol with the used-in-reloc flag.
    for reloc in &module.sections[0].relocs {
        let sym = &module.symbols[reloc.symbol];
        assert!(!sym.name.is_empty());
    }
    let ext = asm.symbol_find("ext").unwrap();
    assert!(asm.symbols.syms[ext]
        .flags
        .contains(SymbolFlags::USED_IN_RELOC));
}

#[test]
fn subsegments_concatenate_in_order() {
    let (asm, module) = assemble(
        ".text 1\n.byte 2\n.text 0\n.byte 1\n.text 1\n.byte 3\n",
    );
    assert_eq!(asm.diag.error_count(), 0);
    assert_eq!(module.sections[0].contents, vec![1, 2, 3]);
}

#[test]
fn mri_mode_precedence_swap() {
    // In MRI mode the multiplicative operators bind *looser* than the
    // bitwise ones: 3 & 1 evaluates first here.
    let (asm, module) = assemble_with(
        "\tdc.l 2*3&1\n",
        AsmOptions {
            mri: true,
            ..Default::default()
        },
    );
    assert_eq!(asm.diag.error_count(), 0, "{:?}", asm.diag.reports());
    assert_eq!(module.sections[0].contents, vec![2, 0, 0, 0]);
}

#[test]
fn include_pushes_and_pops_frames() {
    let dir = tempfile::tempdir().unwrap();
    let inc = dir.path().join("defs.inc");
    std::fs::write(&inc, ".byte 2\n.byte 3\n").unwrap();

    let src = format!(".byte 1\n.include \"{}\"\n.byte 4\n", inc.display());
    let mut asm = Assembler::new(AsmOptions::default());
    asm.diag = Diagnostics::silent();
    let falcon = Falcon::new();
    asm.sources.push_file("test.s", &src);
    read::read_source(&mut asm, &falcon).unwrap();
    let module = build_object(&mut asm, &falcon).unwrap();
    assert_eq!(asm.diag.error_count(), 0);
    assert_eq!(module.sections[0].contents, vec![1, 2, 3, 4]);
}

#[test]
fn include_search_path() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("lib.inc"), ".byte 7\n").unwrap();

    let mut asm = Assembler::new(AsmOptions {
        include_paths: vec![dir.path().to_path_buf()],
        ..Default::default()
    });
    asm.diag = Diagnostics::silent();
    let falcon = Falcon::new();
    asm.sources.push_file("test.s", ".include \"lib.inc\"\n");
    read::read_source(&mut asm, &falcon).unwrap();
    let module = build_object(&mut asm, &falcon).unwrap();
    assert_eq!(asm.diag.error_count(), 0);
    assert_eq!(module.sections[0].contents, vec![7]);
}

#[test]
fn missing_include_is_recoverable() {
    let (asm, module) = assemble(".include \"no-such-file.inc\"\n.byte 9\n");
    assert_eq!(asm.diag.error_count(), 1);
    assert_eq!(module.sections[0].contents, vec![9]);
}

#[test]
fn always_emit_writes_bad_output() {
    let mut asm = Assembler::new(AsmOptions {
        always_emit: true,
        ..Default::default()
    });
    asm.diag = Diagnostics::silent();
    let falcon = Falcon::new();
    asm.sources.push_file("test.s", ".bogus\n.byte 1\n");
    read::read_source(&mut asm, &falcon).unwrap();
    let module = build_object(&mut asm, &falcon).unwrap();
    assert!(asm.diag.had_errors());
    assert_eq!(module.sections[0].contents, vec![1]);
}
