//! End-to-end linker scenarios.

use ferrite_asm::context::{AsmOptions, Assembler};
use ferrite_asm::target::falcon::Falcon;
use ferrite_coff::types::{AuxEntry, SymEntry, Syment};
use ferrite_coff::{CoffObject, CoffWriter, C_EOS, C_EXT, C_MOS, C_STRTAG, N_UNDEF};
use ferrite_ld::archive::{build_archive, is_archive, parse_archive, scan_archive};
use ferrite_ld::link::final_link;
use ferrite_ld::options::{DefaultCallbacks, DiscardMode, LinkCallbacks, LinkOptions, StripMode};
use ferrite_ld::plan::build_plan;
use ferrite_ld::LinkContext;

fn assemble(src: &str) -> Vec<u8> {
    let mut asm = Assembler::new(AsmOptions::default());
    asm.diag = ferrite_asm::diag::Diagnostics::silent();
    let falcon = Falcon::new();
    asm.sources.push_file("test.s", src);
    ferrite_asm::read::read_source(&mut asm, &falcon).unwrap();
    let mut writer = CoffWriter::new();
    ferrite_asm::write::write_object(&mut asm, &falcon, &mut writer).unwrap();
    assert_eq!(asm.diag.error_count(), 0, "{:?}", asm.diag.reports());
    writer.into_bytes()
}

fn callbacks() -> DefaultCallbacks {
    DefaultCallbacks {
        quiet: true,
        ..Default::default()
    }
}

fn link(objects: &[(&str, Vec<u8>)], options: LinkOptions) -> (Vec<u8>, DefaultCallbacks) {
    let mut ctx = LinkContext::new(options);
    let mut cb = callbacks();
    for (name, data) in objects {
        let obj = CoffObject::parse(*name, data).unwrap();
        ctx.add_object(&mut cb, obj);
    }
    let plan = build_plan(&mut ctx);
    let image = final_link(&mut ctx, &plan, &mut cb).unwrap();
    (image, cb)
}

#[test]
fn archive_member_pulled_for_undefined_symbol() {
    let main = assemble(".globl start\nstart:\n.long bar\n");
    let member = assemble(".globl bar\nbar:\n nop\n");
    let lib = build_archive(&[("m.o".to_string(), member)]);
    assert!(is_archive(&lib));

    let mut ctx = LinkContext::new(LinkOptions::default());
    let mut cb = callbacks();
    ctx.add_object(&mut cb, CoffObject::parse("main.o", &main).unwrap());
    assert_eq!(ctx.hash.undefined_count(), 1);

    let members = parse_archive("libA.a", &lib).unwrap();
    scan_archive(&mut ctx, &mut cb, "libA.a", &members).unwrap();

    // m.o is in the link and bar is now defined.
    assert_eq!(ctx.inputs.len(), 2);
    assert_eq!(ctx.hash.undefined_count(), 0);

    let plan = build_plan(&mut ctx);
    let image = final_link(&mut ctx, &plan, &mut cb).unwrap();
    let out = CoffObject::parse("out", &image).unwrap();
    let bar = out
        .symbols
        .iter()
        .filter_map(SymEntry::as_sym)
        .find(|s| s.name == "bar")
        .expect("bar defined in output");
    assert!(bar.scnum > 0);
}

#[test]
fn common_symbol_does_not_pull_archive_member() {
    // main has `bar` as a common; historic COFF linkers leave the
    // archive member alone in that case.
    let main = assemble(".comm bar, 8\n");
    let member = assemble(".globl bar\nbar:\n nop\n");
    let lib = build_archive(&[("m.o".to_string(), member)]);

    let mut ctx = LinkContext::new(LinkOptions::default());
    let mut cb = callbacks();
    ctx.add_object(&mut cb, CoffObject::parse("main.o", &main).unwrap());

    let members = parse_archive("libA.a", &lib).unwrap();
    scan_archive(&mut ctx, &mut cb, "libA.a", &members).unwrap();
    assert_eq!(ctx.inputs.len(), 1, "member must not be pulled in");
}

#[test]
fn members_satisfy_each_other() {
    // a needs b, b needs c; pulling a must cascade.
    let main = assemble(".long sym_a\n");
    let a = assemble(".globl sym_a\nsym_a:\n.long sym_b\n");
    let b = assemble(".globl sym_b\nsym_b:\n nop\n");
    let lib = build_archive(&[("a.o".to_string(), a), ("b.o".to_string(), b)]);

    let mut ctx = LinkContext::new(LinkOptions::default());
    let mut cb = callbacks();
    ctx.add_object(&mut cb, CoffObject::parse("main.o", &main).unwrap());
    let members = parse_archive("lib.a", &lib).unwrap();
    scan_archive(&mut ctx, &mut cb, "lib.a", &members).unwrap();
    assert_eq!(ctx.inputs.len(), 3);
    assert_eq!(ctx.hash.undefined_count(), 0);
}

#[test]
fn relocatable_round_trip_matches_direct_link() {
    // Assemble two pieces; link them -r, then link the combined object
    // against nothing; compare text/data bytes with the direct link.
    let a = assemble(".globl start\nstart:\n li r1, other\n nop\n");
    let b = assemble(".globl other\nother:\n.long 0xdeadbeef\n");

    let (direct, _) = link(
        &[("a.o", a.clone()), ("b.o", b.clone())],
        LinkOptions::default(),
    );

    let (partial, _) = link(
        &[("a.o", a), ("b.o", b)],
        LinkOptions {
            relocatable: true,
            ..Default::default()
        },
    );
    let (full, _) = link(&[("ab.o", partial)], LinkOptions::default());

    let direct_obj = CoffObject::parse("direct", &direct).unwrap();
    let full_obj = CoffObject::parse("full", &full).unwrap();

    for (d, f) in direct_obj.sections.iter().zip(full_obj.sections.iter()) {
        assert_eq!(d.header.name, f.header.name);
        assert_eq!(d.data, f.data, "section {} differs", d.header.name);
    }
}

/// Hand-build an object defining `struct foo { int a; int b; }` as COFF
/// debug symbols: the tag, two members, and the closing .eos, plus one
/// C_EXT so the object has a global.
fn object_with_struct_foo(file: &str, global: &str) -> CoffObject {
    let endian = ferrite_asm::context::Endian::Little;
    let mut symbols = Vec::new();
    // 0: the tag, one aux whose endndx points just past the .eos pair
    // (raw index 6).
    symbols.push(SymEntry::Sym(Syment {
        name: "foo".into(),
        value: 0,
        scnum: N_UNDEF,
        ty: 0,
        sclass: C_STRTAG,
        numaux: 1,
    }));
    symbols.push(SymEntry::Aux(AuxEntry::Tag { size: 8, endndx: 6 }));
    // 2, 3: member a.
    symbols.push(SymEntry::Sym(Syment {
        name: "a".into(),
        value: 0,
        scnum: N_UNDEF,
        ty: 4,
        sclass: C_MOS,
        numaux: 0,
    }));
    symbols.push(SymEntry::Sym(Syment {
        name: "b".into(),
        value: 4,
        scnum: N_UNDEF,
        ty: 4,
        sclass: C_MOS,
        numaux: 0,
    }));
    // 4, 5: end of structure.
    symbols.push(SymEntry::Sym(Syment {
        name: ".eos".into(),
        value: 8,
        scnum: N_UNDEF,
        ty: 0,
        sclass: C_EOS,
        numaux: 1,
    }));
    symbols.push(SymEntry::Aux(AuxEntry::Eos { tagndx: 0, size: 8 }));
    // 6: a global so the object participates in linking.
    symbols.push(SymEntry::Sym(Syment {
        name: global.into(),
        value: 0,
        scnum: N_UNDEF,
        ty: 0,
        sclass: C_EXT,
        numaux: 0,
    }));

    // An empty .text so the object participates in the link orders.
    CoffObject {
        name: file.into(),
        endian,
        header: Default::default(),
        sections: vec![ferrite_coff::read::CoffSection {
            header: ferrite_coff::types::SectionHeader {
                name: ".text".into(),
                ..Default::default()
            },
            data: vec![],
            relocs: vec![],
            linenos: vec![],
        }],
        symbols,
        strings: vec![],
    }
}

/// Hand-build an object with a `.file` symbol and one global.
fn object_with_file_symbol(file: &str, source_name: &str, global: &str) -> CoffObject {
    let symbols = vec![
        SymEntry::Sym(Syment {
            name: ".file".into(),
            value: 0,
            scnum: ferrite_coff::N_DEBUG,
            ty: 0,
            sclass: ferrite_coff::C_FILE,
            numaux: 1,
        }),
        SymEntry::Aux(AuxEntry::File {
            name: source_name.into(),
        }),
        SymEntry::Sym(Syment {
            name: global.into(),
            value: 0,
            scnum: N_UNDEF,
            ty: 0,
            sclass: C_EXT,
            numaux: 0,
        }),
    ];
    CoffObject {
        name: file.into(),
        endian: ferrite_asm::context::Endian::Little,
        header: Default::default(),
        sections: vec![ferrite_coff::read::CoffSection {
            header: ferrite_coff::types::SectionHeader {
                name: ".text".into(),
                ..Default::default()
            },
            data: vec![],
            relocs: vec![],
            linenos: vec![],
        }],
        symbols,
        strings: vec![],
    }
}

#[test]
fn c_file_symbols_chain_across_inputs() {
    let mut ctx = LinkContext::new(LinkOptions::default());
    let mut cb = callbacks();
    ctx.add_object(&mut cb, object_with_file_symbol("a.o", "a.c", "ga"));
    ctx.add_object(&mut cb, object_with_file_symbol("b.o", "b.c", "gb"));
    let plan = build_plan(&mut ctx);
    let image = final_link(&mut ctx, &plan, &mut cb).unwrap();
    let out = CoffObject::parse("out", &image).unwrap();

    let files: Vec<usize> = out
        .symbols
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, SymEntry::Sym(s) if s.sclass == ferrite_coff::C_FILE))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(files.len(), 2);

    // Each .file's value is the index of the next; the last one points
    // at the first global.
    let first = out.symbol(files[0]).unwrap();
    assert_eq!(first.value as usize, files[1]);

    let first_global = out
        .symbols
        .iter()
        .position(|e| matches!(e, SymEntry::Sym(s) if s.sclass == C_EXT))
        .unwrap();
    let second = out.symbol(files[1]).unwrap();
    assert_eq!(second.value as usize, first_global);
}

#[test]
fn duplicate_struct_tags_merge() {
    let mut ctx = LinkContext::new(LinkOptions::default());
    let mut cb = callbacks();
    ctx.add_object(&mut cb, object_with_struct_foo("a.o", "ga"));
    ctx.add_object(&mut cb, object_with_struct_foo("b.o", "gb"));
    let plan = build_plan(&mut ctx);
    let image = final_link(&mut ctx, &plan, &mut cb).unwrap();

    let out = CoffObject::parse("out", &image).unwrap();
    let tags: Vec<_> = out
        .symbols
        .iter()
        .filter_map(SymEntry::as_sym)
        .filter(|s| s.sclass == C_STRTAG && s.name == "foo")
        .collect();
    assert_eq!(tags.len(), 1, "second definition merged away");

    // The kept tag's aux chain still closes at a kept .eos boundary.
    let tag_index = out
        .symbols
        .iter()
        .position(|e| matches!(e, SymEntry::Sym(s) if s.sclass == C_STRTAG))
        .unwrap();
    let Some(SymEntry::Aux(AuxEntry::Tag { endndx, .. })) = out.symbols.get(tag_index + 1) else {
        panic!("tag aux missing");
    };
    let eos = out
        .symbols
        .iter()
        .position(|e| matches!(e, SymEntry::Sym(s) if s.sclass == C_EOS))
        .unwrap();
    assert_eq!(*endndx as usize, eos + 2);
}

#[test]
fn stab_strings_deduplicate_across_inputs() {
    let a = assemble(".stabs \"int:t1\", 128, 0, 0, 0\n.stabs \"only_a:t2\", 128, 0, 0, 0\n nop\n");
    let b = assemble(".stabs \"int:t1\", 128, 0, 0, 0\n nop\n");

    let (image, _) = link(&[("a.o", a), ("b.o", b)], LinkOptions::default());
    let out = CoffObject::parse("out", &image).unwrap();

    let stab = out
        .sections
        .iter()
        .find(|s| s.header.name == ".stab")
        .expect(".stab kept");
    let stabstr = out
        .sections
        .iter()
        .find(|s| s.header.name == ".stabstr")
        .expect("merged .stabstr");

    // Three records survive in order, but `int:t1` is stored once.
    assert_eq!(stab.data.len(), 3 * 12);
    let count = stabstr
        .data
        .windows(7)
        .filter(|w| *w == b"int:t1\0")
        .count();
    assert_eq!(count, 1);

    // Records 0 and 2 (both `int:t1`) point at the same offset.
    let strx0 = u32::from_le_bytes(stab.data[0..4].try_into().unwrap());
    let strx2 = u32::from_le_bytes(stab.data[24..28].try_into().unwrap());
    assert_eq!(strx0, strx2);
}

#[test]
fn discard_locals_strips_lprefix() {
    let a = assemble("Ltemp:\n nop\n.globl keep\nkeep:\n nop\n.long Ltemp\n");
    let mut ctx = LinkContext::new(LinkOptions {
        discard: DiscardMode::LPrefix,
        ..Default::default()
    });
    let mut cb = callbacks();
    ctx.add_object(&mut cb, CoffObject::parse("a.o", &a).unwrap());
    let plan = build_plan(&mut ctx);
    let image = final_link(&mut ctx, &plan, &mut cb).unwrap();
    let out = CoffObject::parse("out", &image).unwrap();
    assert!(out
        .symbols
        .iter()
        .filter_map(SymEntry::as_sym)
        .all(|s| s.name != "Ltemp"));
}

#[test]
fn strip_all_leaves_no_symbols() {
    let a = assemble(".globl start\nstart:\n nop\n");
    let (image, _) = link(
        &[("a.o", a)],
        LinkOptions {
            strip: StripMode::All,
            ..Default::default()
        },
    );
    let out = CoffObject::parse("out", &image).unwrap();
    assert_eq!(out.header.nsyms, 0);
}

#[test]
fn duplicate_linkonce_sections_discarded() {
    let a = assemble(
        ".section .gnu.linkonce.t.fn, \"x\"\n.linkonce discard\nfn_a: nop\nnop\n",
    );
    let b = assemble(
        ".section .gnu.linkonce.t.fn, \"x\"\n.linkonce discard\nfn_b: nop\nnop\n",
    );
    let (image, _) = link(&[("a.o", a), ("b.o", b)], LinkOptions::default());
    let out = CoffObject::parse("out", &image).unwrap();
    let once = out
        .sections
        .iter()
        .find(|s| s.header.name == ".gnu.linkonce.t.fn")
        .expect("one copy kept");
    // Only the first input's copy survives.
    assert_eq!(once.header.size, 8);
}

#[test]
fn weak_reference_resolves_to_zero() {
    let a = assemble(".weak maybe\n.long maybe\n nop\n");
    let (image, cb) = link(&[("a.o", a)], LinkOptions::default());
    assert_eq!(cb.error_count(), 0, "weak undefined must not be an error");
    let out = CoffObject::parse("out", &image).unwrap();
    let text = &out.sections[0];
    assert_eq!(&text.data[0..4], &[0, 0, 0, 0]);
}

#[test]
fn weak_definition_yields_weakext_class() {
    let strong = assemble(".globl dual\ndual:\n nop\n");
    let weak = assemble(".weak dual\ndual:\n nop\nnop\n");
    let mut ctx = LinkContext::new(LinkOptions::default());
    let mut cb = callbacks();
    ctx.add_object(&mut cb, CoffObject::parse("w.o", &weak).unwrap());
    ctx.add_object(&mut cb, CoffObject::parse("s.o", &strong).unwrap());
    // The strong definition wins without a multiple-definition report.
    assert_eq!(cb.error_count(), 0);
    let e = &ctx.hash.entries[ctx.hash.lookup("dual").unwrap()];
    assert!(matches!(
        e.state,
        ferrite_ld::hash::LinkState::Defined { weak: false, .. }
    ));
}

#[test]
fn output_written_to_disk() {
    let a = assemble(".globl start\nstart:\n nop\n");
    let (image, cb) = link(&[("a.o", a)], LinkOptions::default());
    assert_eq!(cb.error_count(), 0);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.out");
    std::fs::write(&path, &image).unwrap();
    let back = CoffObject::open(&path).unwrap();
    assert_eq!(back.sections[0].header.name, ".text");
    assert!(back.header.flags & ferrite_coff::F_EXEC != 0);
}
