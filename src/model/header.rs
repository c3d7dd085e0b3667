// =============================================================================
// model/header.rs — File header (128 bytes, little-endian)
// =============================================================================
//
//   off  field             type
//     0  magic "MDCS"      u32
//     4  version           u32
//     8  n_layers          u32
//    12  dim               u32
//    16  hidden_dim        u32
//    20  n_heads           u32
//    24  vocab_size        u32
//    28  max_seq_len       u32
//    32  prime_codes       u32   prime table length the file needs
//    36  n_tensors         u32
//    40  rope_theta        f32
//    44  norm_eps          f32
//    48  directory_offset  u64
//    56  reserved (zero)
// =============================================================================

use crate::error::{EngineError, Result};
use crate::primes::MAX_TABLE_LEN;

use super::constants::{HEADER_SIZE, MAGIC, VERSION};

/// Fields are read manually for portability; no repr(C,packed) tricks.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub n_layers: u32,
    pub dim: u32,
    pub hidden_dim: u32,
    pub n_heads: u32,
    pub vocab_size: u32,
    pub max_seq_len: u32,
    pub prime_codes: u32,
    pub n_tensors: u32,
    pub rope_theta: f32,
    pub norm_eps: f32,
    pub directory_offset: u64,
}

pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub(crate) fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(b)
}

pub(crate) fn write_u32_le(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

pub(crate) fn write_u64_le(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
}

impl FileHeader {
    /// Parse without judging the contents; see `validate`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(EngineError::Format(format!(
                "file too small for header: {} < {HEADER_SIZE} bytes",
                data.len()
            )));
        }
        Ok(FileHeader {
            magic: read_u32_le(data, 0),
            version: read_u32_le(data, 4),
            n_layers: read_u32_le(data, 8),
            dim: read_u32_le(data, 12),
            hidden_dim: read_u32_le(data, 16),
            n_heads: read_u32_le(data, 20),
            vocab_size: read_u32_le(data, 24),
            max_seq_len: read_u32_le(data, 28),
            prime_codes: read_u32_le(data, 32),
            n_tensors: read_u32_le(data, 36),
            rope_theta: f32::from_bits(read_u32_le(data, 40)),
            norm_eps: f32::from_bits(read_u32_le(data, 44)),
            directory_offset: read_u64_le(data, 48),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= HEADER_SIZE);
        buf[..HEADER_SIZE].fill(0);
        write_u32_le(buf, 0, self.magic);
        write_u32_le(buf, 4, self.version);
        write_u32_le(buf, 8, self.n_layers);
        write_u32_le(buf, 12, self.dim);
        write_u32_le(buf, 16, self.hidden_dim);
        write_u32_le(buf, 20, self.n_heads);
        write_u32_le(buf, 24, self.vocab_size);
        write_u32_le(buf, 28, self.max_seq_len);
        write_u32_le(buf, 32, self.prime_codes);
        write_u32_le(buf, 36, self.n_tensors);
        write_u32_le(buf, 40, self.rope_theta.to_bits());
        write_u32_le(buf, 44, self.norm_eps.to_bits());
        write_u64_le(buf, 48, self.directory_offset);
    }

    /// Magic and version first: nothing past the header is looked at when
    /// either is wrong.
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(EngineError::Format(format!("bad magic: 0x{:08X}", self.magic)));
        }
        if self.version != VERSION {
            return Err(EngineError::Format(format!(
                "unsupported version: {}",
                self.version
            )));
        }
        let nonzero = [
            ("n_layers", self.n_layers),
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("n_heads", self.n_heads),
            ("vocab_size", self.vocab_size),
            ("max_seq_len", self.max_seq_len),
            ("prime_codes", self.prime_codes),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(EngineError::Format(format!("header field {name} is zero")));
        }
        if self.prime_codes as usize > MAX_TABLE_LEN {
            return Err(EngineError::Format(format!(
                "prime_codes {} exceeds the {MAX_TABLE_LEN} codes a u16 can address",
                self.prime_codes
            )));
        }
        if self.dim % self.n_heads != 0 {
            return Err(EngineError::Format(format!(
                "dim {} not divisible by n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if (self.dim / self.n_heads) % 2 != 0 {
            return Err(EngineError::Format(format!(
                "head_dim {} must be even for rotary embedding",
                self.dim / self.n_heads
            )));
        }
        if !(self.rope_theta.is_finite() && self.rope_theta > 0.0) {
            return Err(EngineError::Format(format!("bad rope_theta {}", self.rope_theta)));
        }
        if !(self.norm_eps.is_finite() && self.norm_eps > 0.0) {
            return Err(EngineError::Format(format!("bad norm_eps {}", self.norm_eps)));
        }
        Ok(())
    }
}
