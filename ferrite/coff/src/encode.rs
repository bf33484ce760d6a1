//! Endian-aware field access for the wire structures.

use ferrite_asm::context::Endian;

pub fn get_u16(buf: &[u8], at: usize, endian: Endian) -> u16 {
    let b = [buf[at], buf[at + 1]];
    match endian {
        Endian::Little => u16::from_le_bytes(b),
        Endian::Big => u16::from_be_bytes(b),
    }
}

pub fn get_u32(buf: &[u8], at: usize, endian: Endian) -> u32 {
    let b = [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
    match endian {
        Endian::Little => u32::from_le_bytes(b),
        Endian::Big => u32::from_be_bytes(b),
    }
}

pub fn get_i16(buf: &[u8], at: usize, endian: Endian) -> i16 {
    get_u16(buf, at, endian) as i16
}

pub fn get_i32(buf: &[u8], at: usize, endian: Endian) -> i32 {
    get_u32(buf, at, endian) as i32
}

pub fn put_u16(buf: &mut [u8], at: usize, v: u16, endian: Endian) {
    let b = match endian {
        Endian::Little => v.to_le_bytes(),
        Endian::Big => v.to_be_bytes(),
    };
    buf[at..at + 2].copy_from_slice(&b);
}

pub fn put_u32(buf: &mut [u8], at: usize, v: u32, endian: Endian) {
    let b = match endian {
        Endian::Little => v.to_le_bytes(),
        Endian::Big => v.to_be_bytes(),
    };
    buf[at..at + 4].copy_from_slice(&b);
}

pub fn put_i16(buf: &mut [u8], at: usize, v: i16, endian: Endian) {
    put_u16(buf, at, v as u16, endian);
}

pub fn put_i32(buf: &mut [u8], at: usize, v: i32, endian: Endian) {
    put_u32(buf, at, v as u32, endian);
}
