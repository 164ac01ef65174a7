//! Program Specific Information: PAT and PMT sections.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};

pub const TABLE_PAT: u8 = 0x00;
pub const TABLE_PMT: u8 = 0x02;

pub const STREAM_MPEG1_AUDIO: u8 = 0x03;
pub const STREAM_MPEG2_AUDIO: u8 = 0x04;
pub const STREAM_AAC_ADTS: u8 = 0x0F;
pub const STREAM_H264: u8 = 0x1B;
pub const STREAM_H265: u8 = 0x24;

/// CRC-32/MPEG-2 as used by PSI sections.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for byte in data {
        crc ^= (*byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Validate the common long-form section header and trailing CRC, returning
/// the bytes between the header and the CRC.
fn section_body(section: &[u8], table_id: u8) -> Result<&[u8]> {
    if section.len() < 12 {
        return Err(Error::Truncated {
            need: 12,
            have: section.len(),
        });
    }
    if section[0] != table_id {
        return Err(Error::invalid(format!(
            "table id {:#04x}, expected {table_id:#04x}",
            section[0]
        )));
    }
    let len = 3 + ((((section[1] & 0x0F) as usize) << 8) | section[2] as usize);
    if section.len() < len || len < 12 {
        return Err(Error::invalid("PSI section length out of range"));
    }
    if crc32(&section[..len]) != 0 {
        return Err(Error::invalid("PSI section CRC mismatch"));
    }
    Ok(&section[8..len - 4])
}

/// Program association table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pat {
    /// `(program_number, pmt_pid)`, network PID entries excluded.
    pub programs: Vec<(u16, u16)>,
}

impl Pat {
    pub fn parse(section: &[u8]) -> Result<Self> {
        let body = section_body(section, TABLE_PAT)?;
        let programs = body
            .chunks_exact(4)
            .map(|e| (u16::from_be_bytes([e[0], e[1]]), u16::from_be_bytes([e[2], e[3]]) & 0x1FFF))
            .filter(|(program, _)| *program != 0)
            .collect();
        Ok(Self { programs })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: u8,
    pub pid: u16,
}

/// Program map table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pmt {
    pub pcr_pid: u16,
    pub streams: Vec<PmtStream>,
}

impl Pmt {
    pub fn parse(section: &[u8]) -> Result<Self> {
        let body = section_body(section, TABLE_PMT)?;
        if body.len() < 4 {
            return Err(Error::Truncated {
                need: 4,
                have: body.len(),
            });
        }
        let pcr_pid = u16::from_be_bytes([body[0], body[1]]) & 0x1FFF;
        let info_len = (u16::from_be_bytes([body[2], body[3]]) & 0x0FFF) as usize;
        let mut pos = 4 + info_len;
        let mut streams = Vec::new();
        while pos + 5 <= body.len() {
            let es_info_len = (u16::from_be_bytes([body[pos + 3], body[pos + 4]]) & 0x0FFF) as usize;
            streams.push(PmtStream {
                stream_type: body[pos],
                pid: u16::from_be_bytes([body[pos + 1], body[pos + 2]]) & 0x1FFF,
            });
            pos += 5 + es_info_len;
        }
        Ok(Self { pcr_pid, streams })
    }
}

/// Reassembles a PSI section from packet payloads.
#[derive(Debug, Default)]
pub struct SectionBuffer {
    data: BytesMut,
    started: bool,
}

impl SectionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one packet payload; returns the section it completed.
    pub fn push(&mut self, payload: &[u8], unit_start: bool) -> Option<Bytes> {
        if unit_start {
            let pointer = *payload.first()? as usize;
            self.data.clear();
            self.data.extend_from_slice(payload.get(1 + pointer..)?);
            self.started = true;
        } else if self.started {
            self.data.extend_from_slice(payload);
        } else {
            return None;
        }
        if self.data.len() < 3 {
            return None;
        }
        let len = 3 + ((((self.data[1] & 0x0F) as usize) << 8) | self.data[2] as usize);
        if self.data.len() < len {
            return None;
        }
        self.started = false;
        let section = self.data.split_to(len).freeze();
        self.data.clear();
        Some(section)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A complete section with its CRC.
    pub(crate) fn section(table_id: u8, id: u16, body: &[u8]) -> Vec<u8> {
        let len = 5 + body.len() + 4;
        let mut s = vec![table_id, 0xB0 | (len >> 8) as u8, len as u8];
        s.extend_from_slice(&id.to_be_bytes());
        s.extend_from_slice(&[0xC1, 0x00, 0x00]);
        s.extend_from_slice(body);
        let crc = crc32(&s);
        s.extend_from_slice(&crc.to_be_bytes());
        s
    }

    pub(crate) fn pat_section(pmt_pid: u16) -> Vec<u8> {
        let mut body = vec![0x00, 0x00, 0xE0, 0x10];
        body.extend_from_slice(&[0x00, 0x01]);
        body.extend_from_slice(&(0xE000 | pmt_pid).to_be_bytes());
        section(TABLE_PAT, 1, &body)
    }

    pub(crate) fn pmt_section(pcr_pid: u16, streams: &[(u8, u16)]) -> Vec<u8> {
        let mut body = (0xE000 | pcr_pid).to_be_bytes().to_vec();
        // program_info with one 2-byte descriptor
        body.extend_from_slice(&[0xF0, 0x02, 0x05, 0x00]);
        for (stream_type, pid) in streams {
            body.push(*stream_type);
            body.extend_from_slice(&(0xE000 | pid).to_be_bytes());
            body.extend_from_slice(&[0xF0, 0x00]);
        }
        section(TABLE_PMT, 1, &body)
    }

    #[test]
    fn test_crc_of_section_with_crc_is_zero() {
        assert_eq!(crc32(&pat_section(0x1000)), 0);
        assert_eq!(crc32(b""), 0xFFFF_FFFF);
    }

    #[test]
    fn test_parse_pat() {
        let pat = Pat::parse(&pat_section(0x1000)).unwrap();
        assert_eq!(pat.programs, vec![(1, 0x1000)]);
    }

    #[test]
    fn test_parse_pmt() {
        let pmt = Pmt::parse(&pmt_section(0x100, &[(STREAM_H264, 0x100), (STREAM_AAC_ADTS, 0x101)])).unwrap();
        assert_eq!(pmt.pcr_pid, 0x100);
        assert_eq!(
            pmt.streams,
            vec![
                PmtStream { stream_type: STREAM_H264, pid: 0x100 },
                PmtStream { stream_type: STREAM_AAC_ADTS, pid: 0x101 },
            ]
        );
    }

    #[test]
    fn test_corrupt_section_rejected() {
        let mut pat = pat_section(0x1000);
        pat[9] ^= 0x01;
        assert!(Pat::parse(&pat).is_err());
        assert!(Pmt::parse(&pat_section(0x1000)).is_err());
    }

    #[test]
    fn test_section_spanning_payloads() {
        let pmt = pmt_section(0x100, &[(STREAM_H264, 0x100)]);
        let mut first = vec![0u8];
        first.extend_from_slice(&pmt[..10]);
        let mut buffer = SectionBuffer::new();
        assert!(buffer.push(&[0xFF; 4], false).is_none());
        assert!(buffer.push(&first, true).is_none());
        let mut rest = pmt[10..].to_vec();
        rest.extend_from_slice(&[0xFF; 20]);
        assert_eq!(buffer.push(&rest, false).unwrap(), Bytes::from(pmt));
    }
}
