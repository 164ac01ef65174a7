//! Exp-Golomb bit reader for H.264/H.265 parameter sets.

use crate::error::{Error, Result};

/// MSB-first bit reader over an RBSP (emulation prevention already removed).
///
/// Bits are consumed from a 32-bit window that is refilled from the byte
/// buffer whenever it runs dry.
#[derive(Debug, Clone)]
pub struct ExpGolombReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    word: u32,
    bits_in_word: u32,
}

impl<'a> ExpGolombReader<'a> {
    /// Create a reader. Reading parameters out of nothing is a caller bug.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Invariant("exp-golomb reader over empty data"));
        }
        let mut reader = Self {
            data,
            byte_pos: 0,
            word: 0,
            bits_in_word: 0,
        };
        reader.load_word()?;
        Ok(reader)
    }

    fn load_word(&mut self) -> Result<()> {
        let available = self.data.len() - self.byte_pos;
        if available == 0 {
            return Err(Error::Truncated {
                need: self.byte_pos + 1,
                have: self.data.len(),
            });
        }
        let n = available.min(4);
        let mut bytes = [0u8; 4];
        bytes[..n].copy_from_slice(&self.data[self.byte_pos..self.byte_pos + n]);
        self.word = u32::from_be_bytes(bytes);
        self.bits_in_word = n as u32 * 8;
        self.byte_pos += n;
        Ok(())
    }

    /// Read `n` bits (at most 32) as an unsigned number.
    pub fn read_bits(&mut self, n: u32) -> Result<u32> {
        debug_assert!(n <= 32);
        if n == 0 {
            return Ok(0);
        }
        if n <= self.bits_in_word {
            let value = self.word.checked_shr(32 - n).unwrap_or(0);
            self.word = self.word.checked_shl(n).unwrap_or(0);
            self.bits_in_word -= n;
            return Ok(value);
        }
        let high_bits = self.bits_in_word;
        let high = self.read_bits(high_bits)?;
        self.load_word()?;
        let low_bits = n - high_bits;
        let low = self.read_bits(low_bits)?;
        Ok(high.checked_shl(low_bits).unwrap_or(0) | low)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn skip_bits(&mut self, mut n: usize) -> Result<()> {
        while n > 0 {
            let step = n.min(32) as u32;
            self.read_bits(step)?;
            n -= step as usize;
        }
        Ok(())
    }

    /// Count and consume zero bits up to (not including) the next set bit.
    pub fn skip_leading_zeros(&mut self) -> Result<u32> {
        let mut count = 0;
        loop {
            if self.bits_in_word == 0 {
                self.load_word()?;
            }
            if self.word != 0 {
                let zeros = self.word.leading_zeros();
                self.word <<= zeros;
                self.bits_in_word -= zeros;
                return Ok(count + zeros);
            }
            count += self.bits_in_word;
            self.bits_in_word = 0;
        }
    }

    /// ue(v): `2^k - 1 + read_bits(k)` where `k` is the leading zero count.
    pub fn read_ue(&mut self) -> Result<u32> {
        let k = self.skip_leading_zeros()?;
        if k > 31 {
            return Err(Error::invalid(format!("exp-golomb code with {k} leading zeros")));
        }
        self.read_bits(1)?;
        let suffix = self.read_bits(k)? as u64;
        Ok(((1u64 << k) - 1 + suffix) as u32)
    }

    /// se(v): maps ue codes 1, 2, 3, 4... to 1, -1, 2, -2...
    pub fn read_se(&mut self) -> Result<i32> {
        let v = self.read_ue()? as i64;
        let magnitude = (v + 1) / 2;
        let value = if v % 2 == 1 { magnitude } else { -magnitude };
        i32::try_from(value).map_err(|_| Error::invalid(format!("se(v) value {value}")))
    }
}
