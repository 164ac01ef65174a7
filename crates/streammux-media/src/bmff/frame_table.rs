//! Sample table parsing and the per-sample frame table built from it.

use super::boxes::{children, full_box_header, Reader};
use crate::error::{Error, Result};
use bytes::Bytes;

/// Most samples one track may hold: over a day of AAC frames or 60 fps video.
pub const MAX_SAMPLES: u32 = 1 << 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StscEntry {
    /// 1-based.
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SttsEntry {
    pub count: u32,
    pub delta: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CttsEntry {
    pub count: u32,
    pub offset: i32,
}

/// Raw contents of the tables inside one `stbl`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleTables {
    pub chunk_offsets: Vec<u64>,
    pub stsc: Vec<StscEntry>,
    /// Constant sample size; 0 when `sample_sizes` lists them.
    pub sample_size: u32,
    pub sample_count: u32,
    pub sample_sizes: Vec<u32>,
    pub stts: Vec<SttsEntry>,
    /// 1-based sync sample numbers; empty means every sample is sync.
    pub stss: Vec<u32>,
    pub ctts: Vec<CttsEntry>,
}

impl SampleTables {
    /// Read the tables from an `stbl` payload. Missing tables stay empty.
    pub fn parse(stbl: &Bytes) -> Result<Self> {
        let mut tables = Self::default();
        for child in children(stbl) {
            full_box_header(&child.data)?;
            let mut r = Reader::new(&child.data[4..]);
            match &child.box_type {
                b"stco" | b"co64" => {
                    let count = r.u32()?;
                    let wide = &child.box_type == b"co64";
                    tables.chunk_offsets = (0..count)
                        .map(|_| if wide { r.u64() } else { r.u32().map(u64::from) })
                        .collect::<Result<_>>()?;
                }
                b"stsc" => {
                    let count = r.u32()?;
                    tables.stsc = (0..count)
                        .map(|_| {
                            Ok(StscEntry {
                                first_chunk: r.u32()?,
                                samples_per_chunk: r.u32()?,
                                sample_description_index: r.u32()?,
                            })
                        })
                        .collect::<Result<_>>()?;
                }
                b"stsz" => {
                    tables.sample_size = r.u32()?;
                    tables.sample_count = r.u32()?;
                    if tables.sample_size == 0 && tables.sample_count as usize > r.remaining() / 4 {
                        return Err(Error::invalid(format!(
                            "stsz lists {} samples in {} bytes",
                            tables.sample_count,
                            r.remaining()
                        )));
                    }
                    if tables.sample_size == 0 {
                        tables.sample_sizes = (0..tables.sample_count).map(|_| r.u32()).collect::<Result<_>>()?;
                    }
                }
                b"stz2" => {
                    r.skip(3)?;
                    let field_size = r.u8()?;
                    tables.sample_count = r.u32()?;
                    tables.sample_sizes = read_compact_sizes(&mut r, field_size, tables.sample_count)?;
                }
                b"stts" => {
                    let count = r.u32()?;
                    tables.stts = (0..count)
                        .map(|_| {
                            Ok(SttsEntry {
                                count: r.u32()?,
                                delta: r.u32()?,
                            })
                        })
                        .collect::<Result<_>>()?;
                }
                b"stss" => {
                    let count = r.u32()?;
                    tables.stss = (0..count).map(|_| r.u32()).collect::<Result<_>>()?;
                }
                b"ctts" => {
                    let count = r.u32()?;
                    tables.ctts = (0..count)
                        .map(|_| {
                            Ok(CttsEntry {
                                count: r.u32()?,
                                offset: r.i32()?,
                            })
                        })
                        .collect::<Result<_>>()?;
                }
                _ => {}
            }
        }
        Ok(tables)
    }

    fn size_of(&self, index: usize) -> Option<u32> {
        if self.sample_size != 0 {
            Some(self.sample_size)
        } else {
            self.sample_sizes.get(index).copied()
        }
    }

    fn stsz_count(&self) -> usize {
        if self.sample_size != 0 {
            self.sample_count as usize
        } else {
            self.sample_sizes.len()
        }
    }
}

fn read_compact_sizes(r: &mut Reader<'_>, field_size: u8, count: u32) -> Result<Vec<u32>> {
    let need = (count as u64 * field_size as u64).div_ceil(8);
    if need > r.remaining() as u64 {
        return Err(Error::invalid(format!("stz2 lists {count} samples in {} bytes", r.remaining())));
    }
    match field_size {
        4 => {
            let mut sizes = Vec::with_capacity(count as usize);
            while sizes.len() < count as usize {
                let b = r.u8()?;
                sizes.push((b >> 4) as u32);
                if sizes.len() < count as usize {
                    sizes.push((b & 0x0F) as u32);
                }
            }
            Ok(sizes)
        }
        8 => (0..count).map(|_| r.u8().map(u32::from)).collect(),
        16 => (0..count).map(|_| r.u16().map(u32::from)).collect(),
        other => Err(Error::invalid(format!("stz2 field size {other}"))),
    }
}

/// One sample located in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    pub byte_start: u64,
    pub byte_end: u64,
    pub keyframe: bool,
    /// Presentation time in media ticks.
    pub timestamp: i64,
    /// Decode time in media ticks.
    pub decode_time: u64,
    pub duration: u32,
}

/// Join the sample tables into one row per sample.
///
/// Chunks take their sample count from the stsc run covering them; within a
/// chunk the byte cursor advances by each sample's size and the time cursor
/// by the stts run covering the sample.
pub fn build_frame_table(tables: &SampleTables) -> Result<Vec<FrameEntry>> {
    if tables.chunk_offsets.is_empty() || tables.stsc.is_empty() || tables.stts.is_empty() {
        return Err(Error::Invariant("frame table needs stco, stsc and stts entries"));
    }
    let sample_count = tables.stsz_count();
    if sample_count == 0 {
        return Err(Error::Invariant("frame table needs stsz entries"));
    }
    if sample_count > MAX_SAMPLES as usize {
        return Err(Error::invalid(format!(
            "track lists {sample_count} samples, more than {MAX_SAMPLES}"
        )));
    }

    let chunk_count = tables.chunk_offsets.len() as u32;
    let mut derived = 0u64;
    for (i, run) in tables.stsc.iter().enumerate() {
        let next = tables.stsc.get(i + 1).map_or(chunk_count + 1, |n| n.first_chunk);
        let chunks = next.saturating_sub(run.first_chunk) as u64;
        derived = derived.saturating_add(chunks * run.samples_per_chunk as u64);
    }
    if derived != sample_count as u64 {
        return Err(Error::Invariant("stsc sample count does not match stsz"));
    }

    let sync: Option<std::collections::HashSet<u32>> =
        (!tables.stss.is_empty()).then(|| tables.stss.iter().copied().collect());

    let mut durations = tables.stts.iter().flat_map(|e| std::iter::repeat(e.delta).take(e.count as usize));
    let mut offsets = tables.ctts.iter().flat_map(|e| std::iter::repeat(e.offset).take(e.count as usize));
    let mut last_delta = 0;

    let mut frames = Vec::with_capacity(sample_count.min(4096));
    let mut run = 0;
    let mut decode_time = 0u64;
    for (chunk_index, chunk_offset) in tables.chunk_offsets.iter().enumerate() {
        let chunk_number = chunk_index as u32 + 1;
        while run + 1 < tables.stsc.len() && tables.stsc[run + 1].first_chunk <= chunk_number {
            run += 1;
        }
        let mut cursor = *chunk_offset;
        for _ in 0..tables.stsc[run].samples_per_chunk {
            let index = frames.len();
            let Some(size) = tables.size_of(index) else {
                return Err(Error::Invariant("sample index past stsz"));
            };
            let duration = durations.next().unwrap_or(last_delta);
            last_delta = duration;
            let offset = offsets.next().unwrap_or(0);
            let number = index as u32 + 1;
            let byte_end = cursor
                .checked_add(size as u64)
                .ok_or_else(|| Error::invalid(format!("sample {number} ends past 2^64")))?;
            frames.push(FrameEntry {
                byte_start: cursor,
                byte_end,
                keyframe: sync.as_ref().map_or(true, |s| s.contains(&number)),
                timestamp: decode_time as i64 + offset as i64,
                decode_time,
                duration,
            });
            cursor = byte_end;
            decode_time += duration as u64;
        }
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> SampleTables {
        SampleTables {
            chunk_offsets: vec![0, 100],
            stsc: vec![StscEntry {
                first_chunk: 1,
                samples_per_chunk: 2,
                sample_description_index: 1,
            }],
            sample_size: 0,
            sample_count: 4,
            sample_sizes: vec![50, 50, 40, 60],
            stts: vec![SttsEntry { count: 4, delta: 1000 }],
            stss: vec![],
            ctts: vec![],
        }
    }

    #[test]
    fn test_join_example() {
        let rows = build_frame_table(&tables()).unwrap();
        let got: Vec<_> = rows.iter().map(|r| (r.byte_start, r.byte_end, r.timestamp)).collect();
        assert_eq!(got, vec![(0, 50, 0), (50, 100, 1000), (100, 140, 2000), (140, 200, 3000)]);
        assert!(rows.iter().all(|r| r.keyframe && r.duration == 1000));
    }

    #[test]
    fn test_sync_samples_and_composition_offsets() {
        let mut t = tables();
        t.stss = vec![1, 3];
        t.ctts = vec![CttsEntry { count: 4, offset: 500 }];
        let rows = build_frame_table(&t).unwrap();
        let keys: Vec<bool> = rows.iter().map(|r| r.keyframe).collect();
        assert_eq!(keys, vec![true, false, true, false]);
        assert_eq!(rows[1].timestamp, 1500);
        assert_eq!(rows[1].decode_time, 1000);
    }

    #[test]
    fn test_fixed_sample_size_and_runs() {
        let t = SampleTables {
            chunk_offsets: vec![10, 200, 300],
            stsc: vec![
                StscEntry {
                    first_chunk: 1,
                    samples_per_chunk: 1,
                    sample_description_index: 1,
                },
                StscEntry {
                    first_chunk: 2,
                    samples_per_chunk: 2,
                    sample_description_index: 1,
                },
            ],
            sample_size: 8,
            sample_count: 5,
            sample_sizes: vec![],
            stts: vec![SttsEntry { count: 2, delta: 10 }, SttsEntry { count: 3, delta: 20 }],
            ..Default::default()
        };
        let rows = build_frame_table(&t).unwrap();
        let starts: Vec<u64> = rows.iter().map(|r| r.byte_start).collect();
        assert_eq!(starts, vec![10, 200, 208, 300, 308]);
        let times: Vec<i64> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(times, vec![0, 10, 20, 40, 60]);
    }

    #[test]
    fn test_empty_tables_are_invariant_violations() {
        assert!(matches!(build_frame_table(&SampleTables::default()), Err(Error::Invariant(_))));
        let mut t = tables();
        t.sample_sizes.clear();
        assert!(matches!(build_frame_table(&t), Err(Error::Invariant(_))));
    }

    #[test]
    fn test_count_mismatch_is_invariant_violation() {
        let mut t = tables();
        t.sample_sizes.push(10);
        assert!(matches!(build_frame_table(&t), Err(Error::Invariant(_))));
    }

    #[test]
    fn test_huge_uniform_sample_count_rejected() {
        let t = SampleTables {
            chunk_offsets: vec![0, 1, 2, 3],
            stsc: vec![StscEntry {
                first_chunk: 1,
                samples_per_chunk: 1_000_000_000,
                sample_description_index: 1,
            }],
            sample_size: 1,
            sample_count: 4_000_000_000,
            stts: vec![SttsEntry { count: 4_000_000_000, delta: 1 }],
            ..Default::default()
        };
        assert!(matches!(build_frame_table(&t), Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_chunk_offset_overflow_rejected() {
        let mut t = tables();
        t.chunk_offsets = vec![0, u64::MAX - 10];
        assert!(matches!(build_frame_table(&t), Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_size_lists_longer_than_box_rejected() {
        use crate::bmff::writer::put_full_box;
        use bytes::{BufMut, BytesMut};

        let mut stsz = BytesMut::new();
        put_full_box(&mut stsz, b"stsz", 0, 0, |b| {
            b.put_u32(0);
            b.put_u32(4_000_000_000);
            b.put_u32(7);
        });
        assert!(matches!(SampleTables::parse(&stsz.freeze()), Err(Error::InvalidData(_))));

        let mut stz2 = BytesMut::new();
        put_full_box(&mut stz2, b"stz2", 0, 0, |b| {
            b.put_slice(&[0, 0, 0, 4]);
            b.put_u32(4_000_000_000);
            b.put_u8(0x12);
        });
        assert!(matches!(SampleTables::parse(&stz2.freeze()), Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_parse_stbl() {
        use crate::bmff::writer::put_full_box;
        use bytes::{BufMut, BytesMut};

        let mut stbl = BytesMut::new();
        put_full_box(&mut stbl, b"stco", 0, 0, |b| {
            b.put_u32(2);
            b.put_u32(0);
            b.put_u32(100);
        });
        put_full_box(&mut stbl, b"stsc", 0, 0, |b| {
            b.put_u32(1);
            b.put_u32(1);
            b.put_u32(2);
            b.put_u32(1);
        });
        put_full_box(&mut stbl, b"stsz", 0, 0, |b| {
            b.put_u32(0);
            b.put_u32(4);
            for s in [50, 50, 40, 60] {
                b.put_u32(s);
            }
        });
        put_full_box(&mut stbl, b"stts", 0, 0, |b| {
            b.put_u32(1);
            b.put_u32(4);
            b.put_u32(1000);
        });
        let parsed = SampleTables::parse(&stbl.freeze()).unwrap();
        assert_eq!(parsed, tables());
    }
}
