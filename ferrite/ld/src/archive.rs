//! Archive reading and the undefined-symbol scan.
//!
//! Archives are the classic `!<arch>` format: a global magic line, then
//! members with 60-byte headers. The scan walks member symbol tables
//! directly: a member whose externally visible, *defined* symbols include
//! one the link currently has as undefined gets pulled in as a regular
//! input. A symbol known as common never pulls a member in. The scan
//! loops until a whole pass adds nothing, so members may satisfy each
//! other in any order.

use crate::input::LinkContext;
use crate::options::LinkCallbacks;
use crate::LinkError;
use ferrite_coff::types::SymEntry;
use ferrite_coff::CoffObject;

/// Global archive magic.
pub const ARMAG: &[u8; 8] = b"!<arch>\n";
/// Member-header terminator.
const ARFMAG: &[u8; 2] = b"`\n";
const AR_HDR_SIZE: usize = 60;

/// One archive member.
#[derive(Debug)]
pub struct ArchiveMember {
    /// Member name, long-name table resolved.
    pub name: String,
    /// Raw member contents.
    pub data: Vec<u8>,
}

/// Does this file look like an archive?
pub fn is_archive(data: &[u8]) -> bool {
    data.len() >= ARMAG.len() && &data[..ARMAG.len()] == ARMAG
}

/// Split an archive image into members, resolving extended names. The
/// armap member (`/`) is skipped; the scan reads member symbol tables
/// itself.
pub fn parse_archive(path: &str, data: &[u8]) -> Result<Vec<ArchiveMember>, LinkError> {
    if !is_archive(data) {
        return Err(LinkError::BadArchive {
            path: path.to_string(),
            reason: "missing !<arch> magic".into(),
        });
    }

    let mut members = Vec::new();
    let mut long_names: Vec<u8> = Vec::new();
    let mut at = ARMAG.len();

    while at + AR_HDR_SIZE <= data.len() {
        let hdr = &data[at..at + AR_HDR_SIZE];
        if &hdr[58..60] != ARFMAG {
            return Err(LinkError::BadArchive {
                path: path.to_string(),
                reason: format!("bad member header at {at:#x}"),
            });
        }
        let raw_name = String::from_utf8_lossy(&hdr[0..16]).trim_end().to_string();
        let size: usize = String::from_utf8_lossy(&hdr[48..58])
            .trim()
            .parse()
            .map_err(|_| LinkError::BadArchive {
                path: path.to_string(),
                reason: format!("bad member size at {at:#x}"),
            })?;
        at += AR_HDR_SIZE;
        let body = data
            .get(at..at + size)
            .ok_or_else(|| LinkError::BadArchive {
                path: path.to_string(),
                reason: "member runs past end of archive".into(),
            })?;

        if raw_name == "/" {
            // The armap; ignored.
        } else if raw_name == "//" {
            long_names = body.to_vec();
        } else {
            let name = if let Some(offset) = raw_name.strip_prefix('/') {
                let offset: usize = offset.parse().map_err(|_| LinkError::BadArchive {
                    path: path.to_string(),
                    reason: format!("bad long-name reference `{raw_name}'"),
                })?;
                let tail = &long_names[offset.min(long_names.len())..];
                let end = tail
                    .iter()
                    .position(|&b| b == b'\n' || b == b'/')
                    .unwrap_or(tail.len());
                String::from_utf8_lossy(&tail[..end]).to_string()
            } else {
                raw_name.trim_end_matches('/').to_string()
            };
            members.push(ArchiveMember {
                name,
                data: body.to_vec(),
            });
        }

        // Members are 2-byte aligned.
        at += size + (size & 1);
    }

    Ok(members)
}

/// Serialize members into an archive image. The producer side of the
/// contract; used by tests and by `-r` pipelines that feed archives.
pub fn build_archive(members: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(ARMAG);
    for (name, data) in members {
        let mut hdr = vec![b' '; AR_HDR_SIZE];
        let name_field = format!("{name}/");
        let n = name_field.len().min(16);
        hdr[..n].copy_from_slice(&name_field.as_bytes()[..n]);
        let size_field = format!("{:<10}", data.len());
        hdr[48..58].copy_from_slice(&size_field.as_bytes()[..10]);
        hdr[58..60].copy_from_slice(ARFMAG);
        out.extend_from_slice(&hdr);
        out.extend_from_slice(data);
        if data.len() & 1 != 0 {
            out.push(b'\n');
        }
    }
    out
}

/// Would this member bring in a definition for a currently-undefined
/// symbol? Returns the symbol's name.
fn member_satisfies(ctx: &LinkContext, object: &CoffObject) -> Option<String> {
    for entry in &object.symbols {
        let SymEntry::Sym(sym) = entry else { continue };
        // Externally visible and defined by this member.
        if !sym.is_global_class() || (sym.scnum == 0 && sym.value == 0) {
            continue;
        }
        if let Some(idx) = ctx.hash.lookup(&sym.name) {
            // Only a plain undefined pulls the member in; a common does
            // not.
            if matches!(ctx.hash.entries[idx].state, crate::hash::LinkState::Undefined) {
                return Some(sym.name.clone());
            }
        }
    }
    None
}

/// Scan an archive, adding members that define currently-undefined
/// symbols until a pass adds nothing.
pub fn scan_archive(
    ctx: &mut LinkContext,
    callbacks: &mut dyn LinkCallbacks,
    path: &str,
    members: &[ArchiveMember],
) -> Result<(), LinkError> {
    let mut added = vec![false; members.len()];

    loop {
        let mut pulled = false;
        for (i, member) in members.iter().enumerate() {
            if added[i] {
                continue;
            }
            let object = CoffObject::parse(format!("{path}({})", member.name), &member.data)
                .map_err(|source| LinkError::Input {
                    path: format!("{path}({})", member.name),
                    source,
                })?;

            if let Some(symbol) = member_satisfies(ctx, &object) {
                callbacks.add_archive_element(path, &member.name, &symbol);
                ctx.add_object(callbacks, object);
                added[i] = true;
                pulled = true;
            }
            // Not needed: the member's buffers drop here, matching the
            // free-immediately policy when keep_memory is off.
        }
        if !pulled {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_round_trip() {
        let members = vec![
            ("a.o".to_string(), vec![1u8, 2, 3]),
            ("module_with_a_long_name.o".to_string(), vec![9u8; 5]),
        ];
        let image = build_archive(&members);
        assert!(is_archive(&image));
        let parsed = parse_archive("lib.a", &image).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "a.o");
        assert_eq!(parsed[0].data, vec![1, 2, 3]);
        assert_eq!(parsed[1].name, "module_with_a_long_name.o");
    }

    #[test]
    fn truncated_archive_rejected() {
        let mut image = build_archive(&[("a.o".to_string(), vec![0u8; 10])]);
        image.truncate(image.len() - 4);
        assert!(parse_archive("lib.a", &image).is_err());
    }
}
