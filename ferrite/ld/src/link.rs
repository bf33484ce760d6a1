//! The final link: copy, relocate, renumber, and write.
//!
//! The output is written in two passes over the symbol space. Local
//! symbols stream out while each input is copied, with their indices
//! recorded in a per-input map; globals wait until every input is done,
//! because their final indices are unknown while locals are still being
//! added. Relocations held for unwritten globals carry a marker index
//! and are patched just before the tables are flushed. C_FILE symbols
//! chain each file entry to the next; `.bf` records chain function
//! scopes across inputs; both chains use in-place rewrites of
//! already-written entries.

use crate::buffer::OutputBuffer;
use crate::hash::{DefHome, LinkState};
use crate::input::{InputId, LinkContext};
use crate::merge::{canonical_tag_name, DebugMergeTable, MergeElement, MergeType};
use crate::options::{DiscardMode, LinkCallbacks, StripMode};
use crate::plan::{LinkOrder, LinkPlan};
use crate::reloc::{apply_increment, howto};
use crate::stabs::STABSZ;
use crate::LinkError;
use ferrite_asm::context::Endian;
use ferrite_asm::intern::StringTable;
use ferrite_coff::types::{
    rtype_from_kind, AuxEntry, FileHeader, Reloc, SectionHeader, SymEntry, Syment,
};
use ferrite_coff::{
    is_function_type, is_tag_class, CoffObject, C_EXT, C_FCN, C_FILE, C_NULL, C_WEAKEXT, FILHSZ,
    LINESZ, MAGIC_BE, MAGIC_LE, N_ABS, N_DEBUG, N_UNDEF, RELSZ, SCNHSZ, SCNNMLEN, STYP_BSS,
    SYMESZ, SYMNMLEN,
};

#[derive(Debug, Default, Clone, Copy)]
struct SectionFile {
    scnptr: u32,
    relptr: u32,
    lnnoptr: u32,
    nreloc: u32,
    nlnno_written: u32,
}

struct FinalState {
    endian: Endian,
    buf: OutputBuffer,
    strtab: StringTable,
    scn_file: Vec<SectionFile>,
    long_section_names: Vec<Option<u32>>,
    symptr: usize,
    /// Raw output symbol count so far (aux slots included).
    output_index: u64,
    /// Held-back relocations per output section, with the hash entry of
    /// any global whose index is not yet known.
    out_relocs: Vec<Vec<(Reloc, Option<usize>)>>,
    last_file_index: i64,
    last_file: Syment,
    last_bf_index: i64,
    last_bf: AuxEntry,
    debug_merge: DebugMergeTable,
}

impl FinalState {
    fn sym_at(&self, index: u64) -> usize {
        self.symptr + index as usize * SYMESZ
    }

    fn write_syment(&mut self, index: u64, sym: &Syment) {
        let long = if sym.name.len() > SYMNMLEN {
            Some(self.strtab.add(&sym.name))
        } else {
            None
        };
        let bytes = sym.emit(self.endian, long);
        self.buf.write_at(self.sym_at(index), &bytes);
    }

    fn write_aux(&mut self, index: u64, aux: &AuxEntry) {
        let file_offset = match aux {
            AuxEntry::File { name } if name.len() > SYMESZ => Some(self.strtab.add(name)),
            _ => None,
        };
        let bytes = aux.emit(self.endian, file_offset);
        self.buf.write_at(self.sym_at(index), &bytes);
    }
}

/// The output address of a defined global.
fn global_address(plan: &LinkPlan, home: DefHome, value: u64) -> i64 {
    match home {
        DefHome::Absolute => value as i64,
        DefHome::Input { input: _, section: _ } => {
            // Resolved through the placement map by the caller.
            value as i64
        }
        DefHome::Output { section, offset } => {
            plan.sections[section].vma as i64 + offset as i64 + value as i64
        }
    }
}

/// Run the final link over `plan`, producing the output image.
pub fn final_link(
    ctx: &mut LinkContext,
    plan: &LinkPlan,
    callbacks: &mut dyn LinkCallbacks,
) -> Result<Vec<u8>, LinkError> {
    let endian = ctx
        .inputs
        .values()
        .next()
        .map(|i| i.object.endian)
        .unwrap_or(Endian::Little);

    let nscns = plan.sections.len();
    if nscns > u16::MAX as usize {
        return Err(LinkError::TooLarge(format!("{nscns} output sections")));
    }

    let mut st = FinalState {
        endian,
        buf: OutputBuffer::new(),
        strtab: StringTable::new(),
        scn_file: vec![SectionFile::default(); nscns],
        long_section_names: vec![None; nscns],
        symptr: 0,
        output_index: 0,
        out_relocs: vec![Vec::new(); nscns],
        last_file_index: -1,
        last_file: Syment::default(),
        last_bf_index: -1,
        last_bf: AuxEntry::Raw([0; SYMESZ]),
        debug_merge: DebugMergeTable::new(),
    };

    // Writable sections are suspect in relocatable-image output; the
    // exempt-name list is configuration, not a hardcoded table.
    if ctx.options.check_writable {
        for s in &plan.sections {
            let writable = s.styp & (ferrite_coff::STYP_TEXT | ferrite_coff::STYP_READONLY)
                == 0
                && s.styp & STYP_BSS == 0;
            if writable && !ctx.options.writable_ok.iter().any(|n| n == &s.name) {
                log::warn!("writable section `{}' in read-only image", s.name);
            }
        }
    }

    // Long output-section names go to the string table up front; the
    // header references them by offset.
    for (i, s) in plan.sections.iter().enumerate() {
        if s.name.len() > SCNNMLEN {
            st.long_section_names[i] = Some(st.strtab.add_no_hash(&s.name));
        }
    }

    // File layout: headers, section data, relocations, line numbers,
    // symbols, strings.
    let mut offset = (FILHSZ + nscns * SCNHSZ) as u32;
    for (i, s) in plan.sections.iter().enumerate() {
        if s.styp & STYP_BSS == 0 && s.size > 0 {
            offset = (offset + 3) & !3;
            st.scn_file[i].scnptr = offset;
            offset += s.size as u32;
        }
    }
    for (i, s) in plan.sections.iter().enumerate() {
        let mut count = 0u32;
        if ctx.options.relocatable {
            for order in &s.orders {
                count += match order {
                    LinkOrder::Indirect { input, section, .. } => {
                        ctx.inputs[*input].object.sections[*section].relocs.len() as u32
                    }
                    LinkOrder::SymbolReloc { .. } | LinkOrder::SectionReloc { .. } => 1,
                    LinkOrder::Data { .. } => 0,
                };
            }
        }
        if count > u16::MAX as u32 {
            return Err(LinkError::TooLarge(format!(
                "{count} relocations in `{}`",
                s.name
            )));
        }
        if count != 0 {
            st.scn_file[i].relptr = offset;
            st.scn_file[i].nreloc = count;
            offset += count * RELSZ as u32;
        }
    }
    let keep_linenos = matches!(ctx.options.strip, StripMode::None | StripMode::Some(_));
    for (i, s) in plan.sections.iter().enumerate() {
        let mut count = 0u32;
        if keep_linenos {
            for order in &s.orders {
                if let LinkOrder::Indirect { input, section, .. } = order {
                    count += ctx.inputs[*input].object.sections[*section].linenos.len() as u32;
                }
            }
        }
        if count != 0 {
            st.scn_file[i].lnnoptr = offset;
            offset += count * LINESZ as u32;
        }
    }
    st.symptr = offset as usize;

    // Walk the link orders. An input is copied in full the first time one
    // of its sections comes up.
    for (out, section) in plan.sections.iter().enumerate() {
        for order in &section.orders {
            match order {
                LinkOrder::Indirect { input, .. } => {
                    if !ctx.inputs[*input].output_done {
                        ctx.inputs[*input].output_done = true;
                        link_input(ctx, &mut st, plan, callbacks, *input)?;
                    }
                }
                LinkOrder::Data { offset, bytes } => {
                    let at = st.scn_file[out].scnptr as usize + *offset as usize;
                    st.buf.write_at(at, bytes);
                }
                LinkOrder::SymbolReloc {
                    offset,
                    symbol,
                    kind,
                    addend,
                } => {
                    reloc_link_order(ctx, &mut st, plan, out, *offset, symbol, *kind, *addend)?;
                }
                LinkOrder::SectionReloc {
                    offset,
                    section: target,
                    kind,
                    addend,
                } => {
                    // Section relocs resolve through a synthesized global
                    // defined at the target section's start.
                    let hidx = ctx.hash.entry(target);
                    if matches!(ctx.hash.entries[hidx].state, LinkState::New) {
                        let target_idx = plan.section_by_name(target).ok_or_else(|| {
                            LinkError::TooLarge(format!("no output section `{target}'"))
                        })?;
                        ctx.hash.entries[hidx].state = LinkState::Defined {
                            home: DefHome::Output {
                                section: target_idx,
                                offset: 0,
                            },
                            value: 0,
                            weak: false,
                        };
                    }
                    let name = ctx.hash.entries[hidx].name.clone();
                    reloc_link_order(ctx, &mut st, plan, out, *offset, &name, *kind, *addend)?;
                }
            }
        }
    }

    // The value of the last C_FILE symbol points at the first global.
    let locals_end = st.output_index;

    write_globals(ctx, &mut st, plan)?;

    if st.last_file_index != -1 && st.last_file.value != locals_end as u32 {
        st.last_file.value = locals_end as u32;
        let sym = st.last_file.clone();
        let index = st.last_file_index as u64;
        st.write_syment(index, &sym);
    }

    // Globals all have indices now; patch the deferred relocations and
    // flush the tables.
    if ctx.options.relocatable {
        for (out, relocs) in st.out_relocs.iter().enumerate() {
            let mut at = st.scn_file[out].relptr as usize;
            for (reloc, rel_hash) in relocs {
                let mut wire = *reloc;
                if let Some(h) = rel_hash {
                    debug_assert!(ctx.hash.entries[*h].indx >= 0);
                    wire.symndx = ctx.hash.entries[*h].indx as i32;
                }
                st.buf.write_at(at, &wire.emit(st.endian));
                at += RELSZ;
            }
        }
    }

    // String table sits after the last symbol.
    let strtab_at = st.symptr + st.output_index as usize * SYMESZ;
    let table = st.strtab.emit();
    st.buf.write_at(strtab_at, &table);

    // Now that every count is known, the headers.
    let total_relocs: u32 = st.scn_file.iter().map(|s| s.nreloc).sum();
    let total_linenos: u32 = st.scn_file.iter().map(|s| s.nlnno_written).sum();
    let mut flags = 0u16;
    if total_relocs == 0 {
        flags |= ferrite_coff::F_RELFLG;
    }
    if total_linenos == 0 {
        flags |= ferrite_coff::F_LNNO;
    }
    if !ctx.options.relocatable {
        flags |= ferrite_coff::F_EXEC;
    }
    let header = FileHeader {
        magic: match st.endian {
            Endian::Little => MAGIC_LE,
            Endian::Big => MAGIC_BE,
        },
        nscns: nscns as u16,
        timdat: 0,
        symptr: st.symptr as u32,
        nsyms: st.output_index as u32,
        opthdr: 0,
        flags,
    };
    st.buf.write_at(0, &header.emit(st.endian));

    for (i, s) in plan.sections.iter().enumerate() {
        let hdr = SectionHeader {
            name: s.name.clone(),
            paddr: s.vma as u32,
            vaddr: s.vma as u32,
            size: s.size as u32,
            scnptr: st.scn_file[i].scnptr,
            relptr: st.scn_file[i].relptr,
            lnnoptr: st.scn_file[i].lnnoptr,
            nreloc: st.scn_file[i].nreloc as u16,
            nlnno: st.scn_file[i].nlnno_written as u16,
            flags: s.styp,
        };
        let bytes = hdr.emit(st.endian, st.long_section_names[i]);
        st.buf.write_at(FILHSZ + i * SCNHSZ, &bytes);
    }

    if callbacks.error_count() != 0 {
        return Err(LinkError::HadErrors(callbacks.error_count()));
    }
    Ok(st.buf.into_bytes())
}

/// Copy one input: symbols, line numbers, contents, relocations.
#[allow(clippy::too_many_lines)]
fn link_input(
    ctx: &mut LinkContext,
    st: &mut FinalState,
    plan: &LinkPlan,
    callbacks: &mut dyn LinkCallbacks,
    input: InputId,
) -> Result<(), LinkError> {
    // Take the object out of the context while we work on it; everything
    // else we need from the context stays reachable.
    let object = std::mem::replace(
        &mut ctx.inputs[input].object,
        CoffObject {
            name: String::new(),
            endian: st.endian,
            header: Default::default(),
            sections: Vec::new(),
            symbols: Vec::new(),
            strings: Vec::new(),
        },
    );

    let syment_base = st.output_index;
    let n = object.symbols.len();
    let mut indices: Vec<i64> = vec![-1; n];

    let strip = ctx.options.strip.clone();
    let discard = ctx.options.discard;

    // First pass: decide, renumber, and write the local symbols.
    let mut i = 0usize;
    while i < n {
        let Some(sym) = object.symbols[i].as_sym() else {
            i += 1;
            continue;
        };
        let mut isym = sym.clone();
        let mut add = 1 + isym.numaux as usize;
        let mut skip = false;
        let mut global = false;

        if matches!(strip, StripMode::All) {
            skip = true;
        }

        if !skip {
            if isym.is_global_class() {
                // Globals are written at the end -- except functions,
                // which stay in place among the locals.
                global = true;
                if !is_function_type(isym.ty) {
                    skip = true;
                }
            } else if discard == DiscardMode::All {
                skip = true;
            }
        }

        if !skip && matches!(strip, StripMode::Debugger) && isym.scnum == N_DEBUG {
            skip = true;
        }

        if !skip {
            if let StripMode::Some(keep) = &strip {
                if !keep.contains(&isym.name) {
                    skip = true;
                }
            }
        }
        if !skip
            && !global
            && discard == DiscardMode::LPrefix
            && isym.name.starts_with(&ctx.options.lprefix)
        {
            skip = true;
        }

        // Merge struct/union/enum tags against types already output.
        if !skip
            && !ctx.options.traditional_format
            && is_tag_class(isym.sclass)
            && isym.numaux == 1
        {
            if let Some((mt, eslend)) = gather_tag(&object, &indices, i) {
                let name = canonical_tag_name(&isym.name).to_string();
                let kept = st.debug_merge.find_match(&name, &mt).map(|t| t.indx);
                match kept {
                    Some(indx) if (indx as u64) < syment_base => {
                        // Identical type seen in an earlier input: skip
                        // the whole definition and point references at
                        // the kept one.
                        indices[i] = indx;
                        add = eslend - i;
                        skip = true;
                    }
                    _ => {
                        let mut mt = mt;
                        mt.indx = st.output_index as i64;
                        st.debug_merge.insert(&name, mt);
                    }
                }
            }
        }

        if !skip {
            if isym.scnum > 0 {
                let isec = (isym.scnum - 1) as usize;
                match plan.placement.get(&(input, isec)) {
                    Some(&(out, off)) => {
                        let in_vaddr = object.sections[isec].header.vaddr;
                        isym.scnum = (out + 1) as i16;
                        isym.value = isym
                            .value
                            .wrapping_add(plan.sections[out].vma as u32)
                            .wrapping_add(off as u32)
                            .wrapping_sub(in_vaddr);
                    }
                    None => {
                        // Its section was excluded from the link.
                        skip = true;
                    }
                }
            }
        }

        if !skip {
            // Each C_FILE's value is the index of the next one; patch the
            // previous entry, wherever it was written.
            if isym.sclass == C_FILE {
                if st.last_file_index != -1 && st.last_file.value != st.output_index as u32 {
                    st.last_file.value = st.output_index as u32;
                    let prev = st.last_file.clone();
                    let index = st.last_file_index as u64;
                    st.write_syment(index, &prev);
                }
                st.last_file_index = st.output_index as i64;
                st.last_file = isym.clone();
            }

            indices[i] = st.output_index as i64;
            st.write_syment(st.output_index, &isym);

            if global {
                if let Some(h) = ctx.inputs[input].sym_hashes[i] {
                    ctx.hash.entries[h].indx = st.output_index as i64;
                }
            }
            st.output_index += add as u64;
        }

        i += add;
    }

    // Second pass: the aux entries, now that every kept symbol has its
    // final index.
    let mut i = 0usize;
    while i < n {
        let Some(sym) = object.symbols[i].as_sym() else {
            i += 1;
            continue;
        };
        let numaux = sym.numaux as usize;
        let add = 1 + numaux;
        let written_here = indices[i] >= syment_base as i64;

        if written_here && numaux > 0 {
            let sclass = sym.sclass;
            let ty = sym.ty;
            let is_bf = sclass == C_FCN && sym.name == ".bf";
            for k in 0..numaux {
                let Some(SymEntry::Aux(aux)) = object.symbols.get(i + 1 + k) else {
                    break;
                };
                let mut aux = aux.clone();

                if sclass != ferrite_coff::C_STAT || ty != 0 {
                    if let AuxEntry::Function {
                        tagndx,
                        fsize: _,
                        lnnoptr: _,
                        endndx,
                    } = &mut aux
                    {
                        // endndx points at the next symbol past this
                        // scope; find the next one we actually kept.
                        if *endndx > 0 && (*endndx as usize) < n {
                            let mut indx = *endndx as usize;
                            while indx < n
                                && (indices[indx] < 0
                                    || (indices[indx] as u64) < syment_base)
                            {
                                indx += 1;
                            }
                            *endndx = if indx >= n {
                                st.output_index as u32
                            } else {
                                indices[indx] as u32
                            };
                        }
                        if *tagndx > 0 && (*tagndx as usize) < n {
                            let t = indices[*tagndx as usize];
                            *tagndx = if t < 0 { 0 } else { t as u32 };
                        }
                    }
                    if let AuxEntry::Tag { endndx, .. } = &mut aux {
                        if *endndx > 0 && (*endndx as usize) < n {
                            let mut indx = *endndx as usize;
                            while indx < n
                                && (indices[indx] < 0
                                    || (indices[indx] as u64) < syment_base)
                            {
                                indx += 1;
                            }
                            *endndx = if indx >= n {
                                st.output_index as u32
                            } else {
                                indices[indx] as u32
                            };
                        }
                    }
                    if let AuxEntry::Eos { tagndx, .. } = &mut aux {
                        if *tagndx > 0 && (*tagndx as usize) < n {
                            let t = indices[*tagndx as usize];
                            *tagndx = if t < 0 { 0 } else { t as u32 };
                        }
                    }

                    // Chain .bf scopes across inputs through the endndx
                    // field; the previous record is rewritten in place.
                    if k == 0 && is_bf {
                        if st.last_bf_index != -1 {
                            if let AuxEntry::Function { endndx, .. } = &mut st.last_bf {
                                *endndx = indices[i] as u32;
                            }
                            let prev = st.last_bf.clone();
                            let index = st.last_bf_index as u64;
                            st.write_aux(index, &prev);
                        }
                        let own_end = match &aux {
                            AuxEntry::Function { endndx, .. } => *endndx,
                            _ => 0,
                        };
                        if own_end != 0 {
                            st.last_bf_index = -1;
                        } else {
                            st.last_bf = aux.clone();
                            st.last_bf_index = indices[i] + 1 + k as i64;
                        }
                    }
                }

                let index = indices[i] as u64 + 1 + k as u64;
                st.write_aux(index, &aux);
            }
        }

        i += add;
    }

    // Relocate and write the line numbers.
    if matches!(ctx.options.strip, StripMode::None | StripMode::Some(_)) {
        for (isec, section) in object.sections.iter().enumerate() {
            if section.linenos.is_empty() {
                continue;
            }
            let Some(&(out, _)) = plan.placement.get(&(input, isec)) else {
                continue;
            };
            let delta = section_delta_raw(plan, &object, input, isec);
            let base = st.scn_file[out].lnnoptr as usize
                + st.scn_file[out].nlnno_written as usize * LINESZ;

            for (li, lineno) in section.linenos.iter().enumerate() {
                let mut line = *lineno;
                if line.lnno != 0 {
                    line.addr = (line.addr as i64 + delta) as u32;
                } else if (line.addr as usize) < n {
                    let indx = indices[line.addr as usize];
                    if indx < 0 {
                        // Attached to a stripped symbol; keep the record
                        // but point it nowhere.
                        line.addr = 0;
                    } else {
                        line.addr = indx as u32;
                        patch_function_lnnoptr(
                            st,
                            indx as u64,
                            (base + li * LINESZ) as u32,
                        );
                    }
                }
                st.buf
                    .write_at(base + li * LINESZ, &line.emit(st.endian));
            }
            st.scn_file[out].nlnno_written += section.linenos.len() as u32;
        }
    }

    // Relocate and write the section contents.
    for (isec, section) in object.sections.iter().enumerate() {
        if ctx.inputs[input].excluded.contains(&isec) {
            continue;
        }
        let Some(&(out, off)) = plan.placement.get(&(input, isec)) else {
            continue;
        };
        if section.data.is_empty() && section.relocs.is_empty() {
            continue;
        }
        if section.data.is_empty() && !section.relocs.is_empty() {
            callbacks.unattached_reloc(
                "<no contents>",
                &object.name,
                section.relocs.first().map(|r| r.vaddr as u64).unwrap_or(0),
            );
            continue;
        }

        let mut contents = section.data.clone();

        // Rewrite stab string offsets through the merged table.
        if section.header.name == ".stab" {
            if let Some(map) = &ctx.inputs[input].stab_map {
                let mut at = 0;
                while at + STABSZ <= contents.len() {
                    let old = read_u32(&contents, at, st.endian);
                    if let Some(&new) = map.strx.get(&old) {
                        write_u32(&mut contents, at, new, st.endian);
                    }
                    at += STABSZ;
                }
            }
        }

        let site_delta = section_delta_raw(plan, &object, input, isec);
        let in_vaddr = section.header.vaddr as u64;

        for reloc in &section.relocs {
            let at = (reloc.vaddr as u64 - in_vaddr) as usize;
            let Some(h) = howto(reloc.rtype) else {
                callbacks.unattached_reloc(
                    &format!("<bad reloc type {:#x}>", reloc.rtype),
                    &object.name,
                    reloc.vaddr as u64,
                );
                continue;
            };

            // The increment folds the target's motion (or, for globals in
            // a final link, its full address) with the pc bias change.
            let mut increment: i64 = 0;
            let mut target_name = String::new();

            if reloc.symndx >= 0 {
                let si = reloc.symndx as usize;
                if let Some(Some(hidx)) = ctx.inputs[input].sym_hashes.get(si) {
                    let entry = &ctx.hash.entries[*hidx];
                    target_name = entry.name.clone();
                    if !ctx.options.relocatable {
                        match entry.state {
                            LinkState::Defined { home, value, .. } => {
                                increment = match home {
                                    DefHome::Input {
                                        input: di,
                                        section: ds,
                                    } => {
                                        let base = plan
                                            .placement
                                            .get(&(di, ds))
                                            .map(|&(o, of)| plan.sections[o].vma + of)
                                            .unwrap_or(0);
                                        base as i64 + value as i64
                                    }
                                    _ => global_address(plan, home, value),
                                };
                            }
                            LinkState::Common { .. } => {
                                // Commons are allocated before the final
                                // link; reaching one here means the plan
                                // skipped allocation.
                                callbacks.undefined_symbol(&entry.name, &object.name);
                            }
                            // A weak reference with no definition resolves
                            // to zero.
                            LinkState::WeakUndefined => {}
                            _ => {
                                callbacks.undefined_symbol(&entry.name, &object.name);
                            }
                        }
                    }
                } else if let Some(sym) = object.symbol(si) {
                    target_name = sym.name.clone();
                    if sym.scnum > 0 {
                        increment =
                            section_delta_raw(plan, &object, input, (sym.scnum - 1) as usize);
                    }
                } else {
                    callbacks.unattached_reloc(
                        &format!("<symbol {}>", reloc.symndx),
                        &object.name,
                        reloc.vaddr as u64,
                    );
                    continue;
                }
            }

            if h.pcrel {
                increment -= site_delta;
            }

            if apply_increment(&mut contents, at, st.endian, &h, increment).is_err() {
                callbacks.reloc_overflow(&target_name, &object.name, reloc.vaddr as u64);
            }
        }

        // For relocatable output, shift and renumber the relocs
        // themselves.
        if ctx.options.relocatable {
            for reloc in &section.relocs {
                let mut wire = *reloc;
                wire.vaddr = (wire.vaddr as i64 + site_delta) as u32;
                let mut rel_hash = None;

                if wire.symndx >= 0 {
                    let si = wire.symndx as usize;
                    if let Some(Some(hidx)) = ctx.inputs[input].sym_hashes.get(si) {
                        let indx = ctx.hash.entries[*hidx].indx;
                        if indx >= 0 {
                            wire.symndx = indx as i32;
                        } else {
                            // Written at the end; reserve and patch later.
                            ctx.hash.entries[*hidx].indx = -2;
                            rel_hash = Some(*hidx);
                            wire.symndx = -2;
                        }
                    } else {
                        let indx = indices.get(si).copied().unwrap_or(-1);
                        if indx >= 0 {
                            wire.symndx = indx as i32;
                        } else {
                            let name = object
                                .symbol(si)
                                .map(|s| s.name.clone())
                                .unwrap_or_else(|| format!("<symbol {si}>"));
                            callbacks.unattached_reloc(&name, &object.name, wire.vaddr as u64);
                            continue;
                        }
                    }
                }
                st.out_relocs[out].push((wire, rel_hash));
            }
        }

        let at = st.scn_file[out].scnptr as usize + off as usize;
        st.buf.write_at(at, &contents);
    }

    // Give the object back, releasing what the policy says to release.
    let mut object = object;
    if !ctx.options.keep_memory {
        object.strings = Vec::new();
        for s in object.sections.iter_mut() {
            s.data = Vec::new();
        }
    }
    ctx.inputs[input].object = object;
    Ok(())
}

/// Collect a tag definition's elements for debug merging. Returns the
/// merge candidate and the raw index just past the definition.
fn gather_tag(object: &CoffObject, indices: &[i64], i: usize) -> Option<(MergeType, usize)> {
    let sym = object.symbol(i)?;
    let Some(SymEntry::Aux(AuxEntry::Tag { endndx, .. })) = object.symbols.get(i + 1) else {
        return None;
    };
    let eslend = *endndx as usize;
    if eslend <= i + 2 || eslend > object.symbols.len() {
        return None;
    }

    let mut elements = Vec::new();
    let mut j = i + 2;
    while j < eslend {
        let ele = object.symbol(j)?;
        let mut tagndx = 0i64;
        if ele.numaux >= 1 && ele.ty != 0 && ele.sclass != ferrite_coff::C_EOS {
            // The element's tag reference sits in the first word of its
            // aux entry, whatever shape that aux decoded to.
            let t = match object.symbols.get(j + 1) {
                Some(SymEntry::Aux(AuxEntry::Function { tagndx: t, .. })) => *t as usize,
                Some(SymEntry::Aux(AuxEntry::Eos { tagndx: t, .. })) => *t as usize,
                Some(SymEntry::Aux(AuxEntry::Raw(raw))) => {
                    let b = [raw[0], raw[1], raw[2], raw[3]];
                    match object.endian {
                        Endian::Little => u32::from_le_bytes(b) as usize,
                        Endian::Big => u32::from_be_bytes(b) as usize,
                    }
                }
                _ => 0,
            };
            // A tag reference earlier in this file maps through the kept
            // indices; later or unknown ones merge as zero.
            if t > 0 && t < i {
                tagndx = match indices.get(t) {
                    Some(&v) if v >= 0 => v,
                    _ => 0,
                };
            }
        }
        elements.push(MergeElement {
            name: ele.name.clone(),
            ty: ele.ty,
            tagndx,
        });
        j += 1 + ele.numaux as usize;
    }

    Some((
        MergeType {
            class: sym.sclass,
            indx: 0,
            elements,
        },
        eslend,
    ))
}

/// Patch the `lnnoptr` of the function aux owning a line-number block.
fn patch_function_lnnoptr(st: &mut FinalState, sym_index: u64, lnnoptr: u32) {
    let raw = st.buf.read_at(st.sym_at(sym_index), SYMESZ);
    let Ok(sym) = Syment::parse(&raw, st.endian, &[]) else {
        return;
    };
    if !(is_function_type(sym.ty) || sym.sclass == ferrite_coff::C_BLOCK) || sym.numaux < 1 {
        return;
    }
    let aux_raw = st.buf.read_at(st.sym_at(sym_index + 1), SYMESZ);
    if let Ok(AuxEntry::Function {
        tagndx,
        fsize,
        lnnoptr: _,
        endndx,
    }) = AuxEntry::parse(&aux_raw, st.endian, sym.sclass, sym.ty, &[])
    {
        let fixed = AuxEntry::Function {
            tagndx,
            fsize,
            lnnoptr,
            endndx,
        };
        st.write_aux(sym_index + 1, &fixed);
    }
}

fn section_delta_raw(
    plan: &LinkPlan,
    object: &CoffObject,
    input: InputId,
    isec: usize,
) -> i64 {
    match plan.placement.get(&(input, isec)) {
        Some(&(out, off)) => {
            let in_vaddr = object.sections[isec].header.vaddr as i64;
            plan.sections[out].vma as i64 + off as i64 - in_vaddr
        }
        None => 0,
    }
}

fn read_u32(buf: &[u8], at: usize, endian: Endian) -> u32 {
    let b = [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
    match endian {
        Endian::Little => u32::from_le_bytes(b),
        Endian::Big => u32::from_be_bytes(b),
    }
}

fn write_u32(buf: &mut [u8], at: usize, v: u32, endian: Endian) {
    let b = match endian {
        Endian::Little => v.to_le_bytes(),
        Endian::Big => v.to_be_bytes(),
    };
    buf[at..at + 4].copy_from_slice(&b);
}

/// Synthesize one relocation from a link order. A nonzero addend is
/// validated by writing it through the relocation's howto first.
#[allow(clippy::too_many_arguments)]
fn reloc_link_order(
    ctx: &mut LinkContext,
    st: &mut FinalState,
    plan: &LinkPlan,
    out: usize,
    offset: u64,
    symbol: &str,
    kind: ferrite_asm::target::RelocKind,
    addend: i64,
) -> Result<(), LinkError> {
    let rtype = rtype_from_kind(kind)
        .ok_or_else(|| LinkError::TooLarge(format!("unrepresentable reloc kind {kind}")))?;
    let h = howto(rtype).ok_or_else(|| LinkError::TooLarge("unknown howto".into()))?;

    if addend != 0 {
        // Validate the addend through a null relocation into a scratch
        // buffer, then place the bytes.
        let mut scratch = vec![0u8; h.container as usize];
        apply_increment(&mut scratch, 0, st.endian, &h, addend)
            .map_err(|_| LinkError::TooLarge(format!("addend {addend} overflows field")))?;
        let at = st.scn_file[out].scnptr as usize + offset as usize;
        st.buf.write_at(at, &scratch);
    }

    let hidx = ctx.hash.entry(symbol);
    let indx = ctx.hash.entries[hidx].indx;
    let (symndx, rel_hash) = if indx >= 0 {
        (indx as i32, None)
    } else {
        ctx.hash.entries[hidx].indx = -2;
        (-2, Some(hidx))
    };

    st.out_relocs[out].push((
        Reloc {
            vaddr: (plan.sections[out].vma + offset) as u32,
            symndx,
            rtype,
        },
        rel_hash,
    ));
    st.scn_file[out].nreloc = st.scn_file[out].nreloc.max(st.out_relocs[out].len() as u32);
    Ok(())
}

/// Write the deferred global symbols and assign their indices.
fn write_globals(
    ctx: &mut LinkContext,
    st: &mut FinalState,
    plan: &LinkPlan,
) -> Result<(), LinkError> {
    for hidx in 0..ctx.hash.entries.len() {
        let entry = &ctx.hash.entries[hidx];
        if entry.indx >= 0 {
            continue;
        }
        if entry.indx != -2 {
            match &ctx.options.strip {
                StripMode::All => continue,
                StripMode::Some(keep) if !keep.contains(&entry.name) => continue,
                _ => {}
            }
        }
        if matches!(entry.state, LinkState::New) && entry.indx != -2 {
            continue;
        }

        let (scnum, value) = match entry.state {
            LinkState::New | LinkState::Undefined | LinkState::WeakUndefined => (N_UNDEF, 0i64),
            LinkState::Defined { home, value, .. } => match home {
                DefHome::Absolute => (N_ABS, value as i64),
                DefHome::Input { input, section } => match plan.placement.get(&(input, section))
                {
                    Some(&(out, off)) => (
                        (out + 1) as i16,
                        plan.sections[out].vma as i64 + off as i64 + value as i64,
                    ),
                    None => (N_UNDEF, 0),
                },
                DefHome::Output { section, offset } => (
                    (section + 1) as i16,
                    plan.sections[section].vma as i64 + offset as i64 + value as i64,
                ),
            },
            LinkState::Common { size, .. } => (N_UNDEF, size as i64),
        };

        let weak = matches!(
            entry.state,
            LinkState::WeakUndefined | LinkState::Defined { weak: true, .. }
        );
        let mut sclass = entry.sclass;
        if sclass == C_NULL {
            sclass = C_EXT;
        }
        if weak && sclass == C_EXT {
            sclass = C_WEAKEXT;
        }

        let sym = Syment {
            name: entry.name.clone(),
            value: value as u32,
            scnum,
            ty: entry.ty,
            sclass,
            numaux: entry.aux.len() as u8,
        };
        let aux = entry.aux.clone();

        let index = st.output_index;
        st.write_syment(index, &sym);
        for (k, a) in aux.iter().enumerate() {
            st.write_aux(index + 1 + k as u64, a);
        }
        ctx.hash.entries[hidx].indx = index as i64;
        st.output_index += 1 + aux.len() as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{DefaultCallbacks, LinkOptions};
    use crate::plan::build_plan;

    fn assemble(src: &str) -> Vec<u8> {
        use ferrite_asm::context::{AsmOptions, Assembler};
        use ferrite_asm::target::falcon::Falcon;
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = ferrite_asm::diag::Diagnostics::silent();
        let falcon = Falcon::new();
        asm.sources.push_file("t.s", src);
        ferrite_asm::read::read_source(&mut asm, &falcon).unwrap();
        let mut writer = ferrite_coff::CoffWriter::new();
        ferrite_asm::write::write_object(&mut asm, &falcon, &mut writer).unwrap();
        assert_eq!(asm.diag.error_count(), 0, "{:?}", asm.diag.reports());
        writer.into_bytes()
    }

    fn quiet_callbacks() -> DefaultCallbacks {
        DefaultCallbacks {
            quiet: true,
            ..Default::default()
        }
    }

    #[test]
    fn two_objects_link() {
        let a = assemble(".globl start\nstart:\n nop\n li r1, lab2\n");
        let b = assemble(".globl lab2\nlab2:\n nop\n nop\n");

        let mut ctx = LinkContext::new(LinkOptions::default());
        let mut cb = quiet_callbacks();
        ctx.add_object(&mut cb, CoffObject::parse("a.o", &a).unwrap());
        ctx.add_object(&mut cb, CoffObject::parse("b.o", &b).unwrap());
        let plan = build_plan(&mut ctx);
        let image = final_link(&mut ctx, &plan, &mut cb).unwrap();

        let out = CoffObject::parse("out", &image).unwrap();
        // One .text section holding both inputs (plus the empty .data and
        // .bss the assembler always creates).
        assert_eq!(out.sections[0].header.name, ".text");
        assert_eq!(out.sections[0].data.len(), 16);
        // Final output carries no relocations.
        assert_eq!(out.sections[0].header.nreloc, 0);
        assert!(out.header.flags & ferrite_coff::F_EXEC != 0);

        // `lab2` lives at offset 8 of the combined text.
        let lab2 = out
            .symbols
            .iter()
            .filter_map(SymEntry::as_sym)
            .find(|s| s.name == "lab2")
            .expect("global written");
        assert_eq!(lab2.value, 8);

        // The li instruction's low half got patched with lab2's address.
        let li = u32::from_le_bytes(out.sections[0].data[4..8].try_into().unwrap());
        assert_eq!(li & 0xffff, 8);
    }

    #[test]
    fn undefined_reference_fails_link() {
        let a = assemble(".long missing\n");
        let mut ctx = LinkContext::new(LinkOptions::default());
        let mut cb = quiet_callbacks();
        ctx.add_object(&mut cb, CoffObject::parse("a.o", &a).unwrap());
        let plan = build_plan(&mut ctx);
        let err = final_link(&mut ctx, &plan, &mut cb);
        assert!(matches!(err, Err(LinkError::HadErrors(1))));
    }

    #[test]
    fn relocatable_output_keeps_relocs() {
        let a = assemble(".long missing\n");
        let mut ctx = LinkContext::new(LinkOptions {
            relocatable: true,
            ..Default::default()
        });
        let mut cb = quiet_callbacks();
        ctx.add_object(&mut cb, CoffObject::parse("a.o", &a).unwrap());
        let plan = build_plan(&mut ctx);
        let image = final_link(&mut ctx, &plan, &mut cb).unwrap();

        let out = CoffObject::parse("out", &image).unwrap();
        assert_eq!(out.sections[0].header.nreloc, 1);
        let r = out.sections[0].relocs[0];
        let target = out.symbol(r.symndx as usize).expect("renumbered symbol");
        assert_eq!(target.name, "missing");
        assert_eq!(target.scnum, N_UNDEF);
    }

    #[test]
    fn commons_allocated_into_bss() {
        let a = assemble(".comm shared, 16, 4\n.long shared\n");
        let mut ctx = LinkContext::new(LinkOptions::default());
        let mut cb = quiet_callbacks();
        ctx.add_object(&mut cb, CoffObject::parse("a.o", &a).unwrap());
        let plan = build_plan(&mut ctx);
        let image = final_link(&mut ctx, &plan, &mut cb).unwrap();

        let out = CoffObject::parse("out", &image).unwrap();
        let bss = out
            .sections
            .iter()
            .find(|s| s.header.name == ".bss")
            .expect("bss created for commons");
        assert!(bss.header.size >= 16);

        let shared = out
            .symbols
            .iter()
            .filter_map(SymEntry::as_sym)
            .find(|s| s.name == "shared")
            .expect("common now defined");
        assert!(shared.scnum > 0);
    }
}
