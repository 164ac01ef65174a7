//! Box serialization primitives for the fragmented MP4 muxer.
//!
//! Each box is size (u32 BE, or 1 plus a u64 largesize), four type bytes and
//! its content. Content is produced by a closure so nested boxes are written
//! in one pass.

use super::boxes::FourCc;
use bytes::{BufMut, BytesMut};

/// Unity transformation matrix shared by mvhd and tkhd.
const MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// Write a box whose content is produced by `body`.
pub fn put_box<F>(buf: &mut BytesMut, box_type: &FourCc, body: F)
where
    F: FnOnce(&mut BytesMut),
{
    let mut content = BytesMut::new();
    body(&mut content);
    put_box_header(buf, box_type, content.len() as u64);
    buf.extend_from_slice(&content);
}

/// Write a full box: version and flags precede the content.
pub fn put_full_box<F>(buf: &mut BytesMut, box_type: &FourCc, version: u8, flags: u32, body: F)
where
    F: FnOnce(&mut BytesMut),
{
    put_box(buf, box_type, |b| {
        b.put_u32((version as u32) << 24 | (flags & 0x00FF_FFFF));
        body(b);
    });
}

/// Header for a box carrying `content_len` bytes, with a largesize when the
/// total does not fit 32 bits.
pub fn put_box_header(buf: &mut BytesMut, box_type: &FourCc, content_len: u64) {
    if content_len + 8 > u32::MAX as u64 {
        buf.put_u32(1);
        buf.put_slice(box_type);
        buf.put_u64(content_len + 16);
    } else {
        buf.put_u32((content_len + 8) as u32);
        buf.put_slice(box_type);
    }
}

/// Length of the header `put_box_header` writes.
pub fn box_header_len(content_len: u64) -> usize {
    if content_len + 8 > u32::MAX as u64 {
        16
    } else {
        8
    }
}

pub fn put_ftyp(buf: &mut BytesMut, major: &FourCc, compatible: &[FourCc]) {
    put_box(buf, b"ftyp", |b| {
        b.put_slice(major);
        b.put_u32(0x200);
        for brand in compatible {
            b.put_slice(brand);
        }
    });
}

fn put_matrix(b: &mut BytesMut) {
    for v in MATRIX {
        b.put_u32(v);
    }
}

pub fn put_mvhd(buf: &mut BytesMut, timescale: u32, duration: u64, next_track_id: u32) {
    put_full_box(buf, b"mvhd", 1, 0, |b| {
        b.put_u64(0); // creation
        b.put_u64(0); // modification
        b.put_u32(timescale);
        b.put_u64(duration);
        b.put_u32(0x0001_0000); // rate 1.0
        b.put_u16(0x0100); // volume 1.0
        b.put_bytes(0, 10);
        put_matrix(b);
        b.put_bytes(0, 24);
        b.put_u32(next_track_id);
    });
}

pub fn put_tkhd(buf: &mut BytesMut, track_id: u32, duration: u64, audio: bool, width: u32, height: u32) {
    // enabled | in_movie | in_preview
    put_full_box(buf, b"tkhd", 1, 7, |b| {
        b.put_u64(0);
        b.put_u64(0);
        b.put_u32(track_id);
        b.put_u32(0);
        b.put_u64(duration);
        b.put_bytes(0, 8);
        b.put_u16(0); // layer
        b.put_u16(0); // alternate group
        b.put_u16(if audio { 0x0100 } else { 0 });
        b.put_u16(0);
        put_matrix(b);
        b.put_u32(width << 16);
        b.put_u32(height << 16);
    });
}

/// ISO 639-2 code packed as three 5-bit letters; `und` when unset or invalid.
pub fn pack_language(language: Option<&str>) -> u16 {
    let code = language.filter(|l| l.len() == 3 && l.bytes().all(|c| c.is_ascii_lowercase()));
    let code = code.unwrap_or("und").as_bytes();
    code.iter().fold(0u16, |acc, c| acc << 5 | (*c - 0x60) as u16)
}

pub fn unpack_language(packed: u16) -> Option<String> {
    let letters: String = [10u16, 5, 0]
        .iter()
        .map(|shift| (((packed >> shift) & 0x1F) as u8 + 0x60) as char)
        .collect();
    (letters != "und" && letters.chars().all(|c| c.is_ascii_lowercase())).then_some(letters)
}

pub fn put_mdhd(buf: &mut BytesMut, timescale: u32, duration: u64, language: Option<&str>) {
    put_full_box(buf, b"mdhd", 1, 0, |b| {
        b.put_u64(0);
        b.put_u64(0);
        b.put_u32(timescale);
        b.put_u64(duration);
        b.put_u16(pack_language(language));
        b.put_u16(0);
    });
}

pub fn put_hdlr(buf: &mut BytesMut, handler: &FourCc, name: &str) {
    put_full_box(buf, b"hdlr", 0, 0, |b| {
        b.put_u32(0);
        b.put_slice(handler);
        b.put_bytes(0, 12);
        b.put_slice(name.as_bytes());
        b.put_u8(0);
    });
}

/// Media header matching a handler type.
pub fn put_media_header(buf: &mut BytesMut, handler: &FourCc) {
    match handler {
        b"vide" => put_full_box(buf, b"vmhd", 0, 1, |b| {
            b.put_u16(0); // graphics mode
            b.put_bytes(0, 6); // opcolor
        }),
        b"soun" => put_full_box(buf, b"smhd", 0, 0, |b| {
            b.put_u16(0); // balance
            b.put_u16(0);
        }),
        b"text" | b"subt" => put_full_box(buf, b"sthd", 0, 0, |_| {}),
        _ => put_full_box(buf, b"nmhd", 0, 0, |_| {}),
    }
}

/// Data information with a single self-contained reference.
pub fn put_dinf(buf: &mut BytesMut) {
    put_box(buf, b"dinf", |b| {
        put_full_box(b, b"dref", 0, 0, |d| {
            d.put_u32(1);
            put_full_box(d, b"url ", 0, 1, |_| {});
        });
    });
}

/// The sample tables an init segment must carry, all empty.
pub fn put_empty_tables(buf: &mut BytesMut) {
    for t in [b"stts", b"stsc", b"stco"] {
        put_full_box(buf, t, 0, 0, |b| b.put_u32(0));
    }
    put_full_box(buf, b"stsz", 0, 0, |b| {
        b.put_u32(0);
        b.put_u32(0);
    });
}

pub fn put_trex(buf: &mut BytesMut, track_id: u32) {
    put_full_box(buf, b"trex", 0, 0, |b| {
        b.put_u32(track_id);
        b.put_u32(1); // sample description index
        b.put_u32(0);
        b.put_u32(0);
        b.put_u32(0);
    });
}

pub fn put_mfhd(buf: &mut BytesMut, sequence_number: u32) {
    put_full_box(buf, b"mfhd", 0, 0, |b| b.put_u32(sequence_number));
}

pub fn put_tfdt(buf: &mut BytesMut, base_media_decode_time: u64) {
    put_full_box(buf, b"tfdt", 1, 0, |b| b.put_u64(base_media_decode_time));
}

/// Sample flags for a sync sample.
pub const SYNC_SAMPLE_FLAGS: u32 = 0x0200_0000;
/// Sample flags for a sample that depends on others and is not sync.
pub const NON_SYNC_SAMPLE_FLAGS: u32 = 0x0101_0000;

pub mod tfhd_flags {
    pub const BASE_DATA_OFFSET: u32 = 0x00_0001;
    pub const SAMPLE_DESCRIPTION_INDEX: u32 = 0x00_0002;
    pub const DEFAULT_DURATION: u32 = 0x00_0008;
    pub const DEFAULT_SIZE: u32 = 0x00_0010;
    pub const DEFAULT_FLAGS: u32 = 0x00_0020;
    pub const DEFAULT_BASE_IS_MOOF: u32 = 0x02_0000;
}

pub mod trun_flags {
    pub const DATA_OFFSET: u32 = 0x00_0001;
    pub const FIRST_SAMPLE_FLAGS: u32 = 0x00_0004;
    pub const DURATION: u32 = 0x00_0100;
    pub const SIZE: u32 = 0x00_0200;
    pub const FLAGS: u32 = 0x00_0400;
    pub const COMPOSITION_OFFSET: u32 = 0x00_0800;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bmff::boxes::read_box_header;

    fn size_of(buf: &[u8]) -> u32 {
        u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
    }

    #[test]
    fn test_box_size_and_type() {
        let mut buf = BytesMut::new();
        put_box(&mut buf, b"test", |b| b.put_slice(&[1, 2, 3]));
        assert_eq!(buf.len(), 11);
        assert_eq!(size_of(&buf), 11);
        assert_eq!(&buf[4..8], b"test");
    }

    #[test]
    fn test_nested_full_box() {
        let mut buf = BytesMut::new();
        put_box(&mut buf, b"cont", |b| put_mfhd(b, 7));
        assert_eq!(buf.len(), 8 + 16);
        assert_eq!(&buf[12..16], b"mfhd");
        assert_eq!(&buf[20..24], &7u32.to_be_bytes());
    }

    #[test]
    fn test_fixed_box_sizes() {
        let mut buf = BytesMut::new();
        put_mvhd(&mut buf, 1000, 0, 2);
        assert_eq!(size_of(&buf), 120);
        buf.clear();
        put_tkhd(&mut buf, 1, 0, false, 1920, 1080);
        assert_eq!(size_of(&buf), 104);
        buf.clear();
        put_mdhd(&mut buf, 90_000, 0, None);
        assert_eq!(size_of(&buf), 44);
        buf.clear();
        put_ftyp(&mut buf, b"iso6", &[*b"iso6", *b"mp41"]);
        assert_eq!(size_of(&buf), 24);
    }

    #[test]
    fn test_large_header() {
        let mut buf = BytesMut::new();
        put_box_header(&mut buf, b"mdat", u32::MAX as u64);
        assert_eq!(buf.len(), box_header_len(u32::MAX as u64));
        let h = read_box_header(&buf).unwrap().unwrap();
        assert_eq!(h.size, Some(u32::MAX as u64 + 16));
    }

    #[test]
    fn test_language_packing() {
        assert_eq!(pack_language(None), 0x55C4);
        assert_eq!(unpack_language(pack_language(Some("eng"))).as_deref(), Some("eng"));
        assert_eq!(unpack_language(0x55C4), None);
        assert_eq!(pack_language(Some("English")), 0x55C4);
    }
}
