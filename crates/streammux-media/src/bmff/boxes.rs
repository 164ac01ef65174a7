//! ISO BMFF box headers and a lazy box-tree finder.

use crate::error::{Error, Result};
use bytes::Bytes;

/// Nesting depth past which the finder stops descending.
pub const MAX_DEPTH: usize = 16;

pub type FourCc = [u8; 4];

/// A parsed box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: FourCc,
    /// Total size including the header; `None` when the box runs to the end
    /// of its parent.
    pub size: Option<u64>,
    /// 8, or 16 with a 64-bit largesize.
    pub header_len: usize,
}

/// Read a box header. `Ok(None)` when the header itself is cut off.
pub fn read_box_header(data: &[u8]) -> Result<Option<BoxHeader>> {
    if data.len() < 8 {
        return Ok(None);
    }
    let size32 = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let box_type = [data[4], data[5], data[6], data[7]];
    let (size, header_len) = match size32 {
        0 => (None, 8),
        1 => {
            let Some(ext) = data.get(8..16) else {
                return Ok(None);
            };
            let mut b = [0u8; 8];
            b.copy_from_slice(ext);
            (Some(u64::from_be_bytes(b)), 16)
        }
        n => (Some(n as u64), 8),
    };
    if let Some(size) = size {
        if size < header_len as u64 {
            return Err(Error::invalid(format!(
                "box {} of size {size} is smaller than its header",
                fourcc_str(&box_type)
            )));
        }
    }
    Ok(Some(BoxHeader {
        box_type,
        size,
        header_len,
    }))
}

/// Printable form of a box type.
pub fn fourcc_str(t: &FourCc) -> String {
    t.iter()
        .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' })
        .collect()
}

/// One step of a box search path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxMatcher {
    Type(FourCc),
    Any,
}

impl BoxMatcher {
    pub fn matches(&self, box_type: &FourCc) -> bool {
        match self {
            Self::Type(t) => t == box_type,
            Self::Any => true,
        }
    }
}

impl From<&FourCc> for BoxMatcher {
    fn from(t: &FourCc) -> Self {
        Self::Type(*t)
    }
}

/// A matched box. Offsets are relative to the searched buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmffBox {
    pub box_type: FourCc,
    pub start: usize,
    pub data_start: usize,
    pub end: usize,
    pub data: Bytes,
}

#[derive(Debug)]
struct Level {
    pos: usize,
    end: usize,
    depth: usize,
}

/// Iterator returned by [`find_box`].
#[derive(Debug)]
pub struct BoxIter<'p> {
    data: Bytes,
    path: &'p [BoxMatcher],
    full_only: bool,
    stack: Vec<Level>,
    consumed: usize,
    incomplete: bool,
    error: Option<Error>,
}

/// Walk `data` for boxes matching `path`, one matcher per nesting level.
///
/// Boxes are only descended into when the path continues below them, so
/// leaf payloads are never misread as children. With `full_only`, iteration
/// stops at the first box that has not fully arrived.
pub fn find_box<'p>(data: &Bytes, path: &'p [BoxMatcher], full_only: bool) -> BoxIter<'p> {
    BoxIter {
        data: data.clone(),
        path,
        full_only,
        stack: vec![Level {
            pos: 0,
            end: data.len(),
            depth: 0,
        }],
        consumed: 0,
        incomplete: false,
        error: None,
    }
}

/// First box along `path`, if any.
pub fn find_first(data: &Bytes, path: &[BoxMatcher]) -> Option<BmffBox> {
    find_box(data, path, false).next()
}

/// Children of a container payload.
pub fn children(data: &Bytes) -> BoxIter<'static> {
    find_box(data, &[BoxMatcher::Any], false)
}

impl BoxIter<'_> {
    /// End of the last complete top-level box walked so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
}

impl Iterator for BoxIter<'_> {
    type Item = BmffBox;

    fn next(&mut self) -> Option<BmffBox> {
        loop {
            let height = self.stack.len();
            let level = self.stack.last_mut()?;
            if level.pos >= level.end {
                self.stack.pop();
                continue;
            }

            let header = match read_box_header(&self.data[level.pos..level.end]) {
                Ok(Some(h)) => h,
                Ok(None) if self.full_only => {
                    self.incomplete = true;
                    self.stack.clear();
                    return None;
                }
                Ok(None) => {
                    self.stack.pop();
                    continue;
                }
                Err(e) => {
                    self.error = Some(e);
                    self.stack.clear();
                    return None;
                }
            };

            let start = level.pos;
            let data_start = start + header.header_len;
            let end = match header.size {
                Some(size) => {
                    let end = usize::try_from(size)
                        .map(|s| start.saturating_add(s))
                        .unwrap_or(usize::MAX);
                    if end <= level.end {
                        end
                    } else if self.full_only {
                        self.incomplete = true;
                        self.stack.clear();
                        return None;
                    } else {
                        level.end
                    }
                }
                None => level.end,
            };

            level.pos = end;
            let depth = level.depth;
            if height == 1 {
                self.consumed = end;
            }

            let Some(matcher) = self.path.get(depth) else {
                continue;
            };
            if !matcher.matches(&header.box_type) {
                continue;
            }
            if depth + 1 == self.path.len() {
                return Some(BmffBox {
                    box_type: header.box_type,
                    start,
                    data_start,
                    end,
                    data: self.data.slice(data_start..end),
                });
            }
            if height < MAX_DEPTH {
                self.stack.push(Level {
                    pos: data_start,
                    end,
                    depth: depth + 1,
                });
            }
        }
    }
}

/// Locate a box by scanning for its type tag, reading the size from the
/// four bytes before it. Used to find `moov` without walking the tree.
pub fn find_named_box(data: &Bytes, tag: &FourCc) -> Option<BmffBox> {
    let mut from = 4;
    while from + 4 <= data.len() {
        let found = data[from..].windows(4).position(|w| w == tag)? + from;
        let start = found - 4;
        if let Ok(Some(header)) = read_box_header(&data[start..]) {
            let end = match header.size {
                Some(size) => usize::try_from(size).ok().and_then(|s| start.checked_add(s)),
                None => Some(data.len()),
            };
            if let Some(end) = end.filter(|e| *e <= data.len()) {
                return Some(BmffBox {
                    box_type: header.box_type,
                    start,
                    data_start: start + header.header_len,
                    end,
                    data: data.slice(start + header.header_len..end),
                });
            }
        }
        from = found + 1;
    }
    None
}

/// Version and flags of a full box payload.
pub fn full_box_header(data: &[u8]) -> Result<(u8, u32)> {
    match data.get(..4) {
        Some(h) => Ok((h[0], u32::from_be_bytes([0, h[1], h[2], h[3]]))),
        None => Err(Error::Truncated {
            need: 4,
            have: data.len(),
        }),
    }
}

/// Big-endian field cursor over a box payload.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|e| *e <= self.data.len());
        match end {
            Some(end) => {
                let out = &self.data[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(Error::Truncated {
                need: n,
                have: self.remaining(),
            }),
        }
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }

    /// 32-bit field in version 0 boxes, 64-bit in version 1.
    pub fn versioned(&mut self, version: u8) -> Result<u64> {
        if version == 1 {
            self.u64()
        } else {
            self.u32().map(u64::from)
        }
    }
}
