//! Lazy search over an EBML element tree.

use super::ids;
use super::vint::{read_element_id, read_vint};
use crate::error::{Error, Result};
use bytes::Bytes;

/// Nesting depth past which the finder stops descending.
pub const MAX_DEPTH: usize = 16;

/// One step of a search path.
#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    Id(u32),
    OneOf(&'static [u32]),
    Any,
    Pred(fn(u32) -> bool),
}

impl Matcher {
    pub fn matches(&self, id: u32) -> bool {
        match self {
            Self::Id(want) => *want == id,
            Self::OneOf(ids) => ids.contains(&id),
            Self::Any => true,
            Self::Pred(f) => f(id),
        }
    }
}

impl From<u32> for Matcher {
    fn from(id: u32) -> Self {
        Self::Id(id)
    }
}

/// Decoded id and size of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementHeader {
    pub id: u32,
    /// `None` for unknown size.
    pub size: Option<u64>,
    pub header_len: usize,
}

/// Read an element header. `Ok(None)` when the header itself is cut off.
pub fn read_element_header(data: &[u8]) -> Result<Option<ElementHeader>> {
    let Some((id, id_len)) = read_element_id(data)? else {
        return Ok(None);
    };
    let Some(size) = read_vint(&data[id_len..])? else {
        return Ok(None);
    };
    Ok(Some(ElementHeader {
        id,
        size: (!size.is_unknown()).then_some(size.value),
        header_len: id_len + size.length,
    }))
}

/// A matched element. Offsets are relative to the searched buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EbmlElement {
    pub id: u32,
    pub start: usize,
    pub data_start: usize,
    pub end: usize,
    pub unknown_size: bool,
    pub data: Bytes,
}

#[derive(Debug)]
struct Level {
    pos: usize,
    end: usize,
    depth: usize,
}

/// Iterator returned by [`find_ebml`].
#[derive(Debug)]
pub struct EbmlIter<'p> {
    data: Bytes,
    path: &'p [Matcher],
    full_only: bool,
    stack: Vec<Level>,
    consumed: usize,
    incomplete: bool,
    error: Option<Error>,
}

/// Walk `data` for elements matching `path`, one matcher per nesting level.
///
/// With `full_only`, iteration stops at the first element that is not fully
/// contained in the buffer (including unknown-size elements whose end has
/// not arrived yet) instead of yielding a truncated match. Without it,
/// such elements are cut at the end of the buffer.
pub fn find_ebml<'p>(data: &Bytes, path: &'p [Matcher], full_only: bool) -> EbmlIter<'p> {
    EbmlIter {
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

impl EbmlIter<'_> {
    /// End of the last complete top-level element walked so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Whether iteration stopped at an element that has not fully arrived.
    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    /// Structural error that stopped iteration, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    fn abort(&mut self) -> Option<EbmlElement> {
        self.incomplete = true;
        self.stack.clear();
        None
    }
}

impl Iterator for EbmlIter<'_> {
    type Item = EbmlElement;

    fn next(&mut self) -> Option<EbmlElement> {
        loop {
            let height = self.stack.len();
            let level = self.stack.last_mut()?;
            if level.pos >= level.end {
                self.stack.pop();
                continue;
            }

            let header = match read_element_header(&self.data[level.pos..level.end]) {
                Ok(Some(h)) => h,
                Ok(None) if self.full_only => return self.abort(),
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
                        .map(|s| data_start.saturating_add(s))
                        .unwrap_or(usize::MAX);
                    if end <= level.end {
                        end
                    } else if self.full_only {
                        return self.abort();
                    } else {
                        level.end
                    }
                }
                None => match resolve_unknown_end(&self.data, data_start, level.end, header.id, height) {
                    Some(end) => end,
                    None if self.full_only => return self.abort(),
                    None => level.end,
                },
            };

            level.pos = end;
            let depth = level.depth;
            if height == 1 {
                self.consumed = end;
            }

            let Some(matcher) = self.path.get(depth) else {
                continue;
            };
            if !matcher.matches(header.id) {
                continue;
            }
            if depth + 1 == self.path.len() {
                return Some(EbmlElement {
                    id: header.id,
                    start,
                    data_start,
                    end,
                    unknown_size: header.size.is_none(),
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

/// Find where an unknown-size element whose payload starts at `start` ends:
/// the offset of the first following element that is not one of its
/// children. `None` if the buffer runs out first.
pub fn resolve_unknown_end(
    data: &[u8],
    start: usize,
    limit: usize,
    parent: u32,
    depth: usize,
) -> Option<usize> {
    let mut pos = start;
    while pos < limit {
        let header = read_element_header(&data[pos..limit]).ok()??;
        if ids::ends_parent(parent, header.id) {
            return Some(pos);
        }
        let data_start = pos + header.header_len;
        pos = match header.size {
            Some(size) => usize::try_from(size)
                .ok()
                .and_then(|s| data_start.checked_add(s))
                .filter(|&end| end <= limit)?,
            None if depth < MAX_DEPTH => {
                resolve_unknown_end(data, data_start, limit, header.id, depth + 1)?
            }
            None => return None,
        };
    }
    None
}
