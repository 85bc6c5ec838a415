//! ビット単位の読み書きを行うためのユーティリティ
use crate::{Error, Result};

/// MSB ファーストでビット列を読み込むリーダー
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    /// [`BitReader`] インスタンスを生成する
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// 現在のビット位置を返す
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// 未読のビット数を返す
    pub fn remaining_bits(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.pos)
    }

    /// 1 ビット読み込む
    pub fn read_bit(&mut self) -> Result<u8> {
        let byte = self
            .data
            .get(self.pos / 8)
            .copied()
            .ok_or_else(|| Error::invalid_data("Unexpected end of bitstream"))?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit)
    }

    /// `n` ビット（最大 64）を読み込む
    pub fn read_bits(&mut self, n: u32) -> Result<u64> {
        if n > 64 {
            return Err(Error::invalid_input(format!(
                "Cannot read more than 64 bits at once: {n}"
            )));
        }
        let mut value = 0u64;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()? as u64;
        }
        Ok(value)
    }

    /// `n` ビット読み飛ばす
    pub fn skip_bits(&mut self, n: usize) -> Result<()> {
        if n > self.remaining_bits() {
            return Err(Error::invalid_data("Unexpected end of bitstream"));
        }
        self.pos += n;
        Ok(())
    }

    /// 符号なし指数ゴロム符号 ue(v) を読み込む
    pub fn read_ue(&mut self) -> Result<u32> {
        let mut leading_zeros = 0u32;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(Error::invalid_data("Exp-Golomb code is too long"));
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(leading_zeros)? as u32;
        Ok(((1u64 << leading_zeros) - 1 + suffix as u64) as u32)
    }

    /// 符号付き指数ゴロム符号 se(v) を読み込む
    pub fn read_se(&mut self) -> Result<i32> {
        let ue = self.read_ue()? as i64;
        let value = (ue + 1) / 2;
        Ok(if ue % 2 == 0 { -value } else { value } as i32)
    }
}

/// MSB ファーストでビット列を組み立てるライター
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    data: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    /// [`BitWriter`] インスタンスを生成する
    pub fn new() -> Self {
        Self::default()
    }

    /// `value` の下位 `n` ビット（最大 32）を書き込む
    pub fn write_bits(&mut self, n: u32, value: u32) {
        for i in (0..n).rev() {
            if self.bit_len % 8 == 0 {
                self.data.push(0);
            }
            if (value >> i) & 1 == 1 {
                let last = self.data.len() - 1;
                self.data[last] |= 1 << (7 - (self.bit_len % 8));
            }
            self.bit_len += 1;
        }
    }

    /// 末尾をゼロで埋めたバイト列を返す
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// `data` のビット範囲 `[start, end)` に `value` の下位ビットを MSB ファーストで書き込む
pub fn write_bits(data: &mut [u8], start: usize, end: usize, value: u32) -> Result<()> {
    if end < start || end > data.len() * 8 || end - start > 32 {
        return Err(Error::invalid_input(format!(
            "Invalid bit range: {start}..{end} (data has {} bits)",
            data.len() * 8
        )));
    }
    for i in start..end {
        let shift = end - i - 1;
        let bit = ((value >> shift) & 1) as u8;
        let byte = &mut data[i / 8];
        let mask = 1 << (7 - (i % 8));
        if bit == 1 {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exp_golomb() {
        // 1 | 010 | 011 | 00100 | 00111
        let data = [0b1010_0110, 0b0100_0011, 0b1000_0000];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_ue().unwrap(), 0);
        assert_eq!(reader.read_ue().unwrap(), 1);
        assert_eq!(reader.read_ue().unwrap(), 2);
        assert_eq!(reader.read_ue().unwrap(), 3);
        assert_eq!(reader.read_se().unwrap(), -3);
    }

    #[test]
    fn read_past_end() {
        let mut reader = BitReader::new(&[0xff]);
        assert_eq!(reader.read_bits(8).unwrap(), 0xff);
        assert!(reader.read_bit().is_err());
    }

    #[test]
    fn bit_writer_pads_last_byte() {
        let mut writer = BitWriter::new();
        writer.write_bits(5, 2);
        writer.write_bits(4, 4);
        assert_eq!(writer.into_bytes(), vec![0b0001_0010, 0b0000_0000]);
    }

    #[test]
    fn write_bits_in_the_middle() {
        let mut data = [0b1111_1111, 0b0000_0000];
        write_bits(&mut data, 6, 9, 0b010).unwrap();
        assert_eq!(data, [0b1111_1101, 0b0000_0000]);
    }
}
