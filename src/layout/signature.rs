use crate::error::{Error, Result};

/// Which of the four interchangeable binary layouts a block uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Row,
    DeltaCluster,
    SimpleColumn,
    IndexedColumn,
}

/// Per-column compression mode, two bits in the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Fixed 8 bytes
    None,
    /// 7 bits per byte, continuation high bit
    Var1,
    /// Count byte plus minimal big-endian bytes
    Var2,
}

/// The one-byte layout signature persisted with each block's coordinates.
///
/// Bit layout, LSB first: 2 bits layout type, 1 bit delta-on-first-key,
/// 2 bits key1 compression, 2 bits key2 compression, 1 bit aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub layout: Layout,
    /// key1 stored as delta from the previous key1 rather than absolute
    pub delta_first: bool,
    pub compr1: Compression,
    pub compr2: Compression,
    /// Block stores back-references into another index, not direct pairs
    pub aggregated: bool,
}

impl Layout {
    fn to_bits(self) -> u8 {
        match self {
            Layout::Row => 0,
            Layout::DeltaCluster => 1,
            Layout::SimpleColumn => 2,
            Layout::IndexedColumn => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Layout::Row,
            1 => Layout::DeltaCluster,
            2 => Layout::SimpleColumn,
            _ => Layout::IndexedColumn,
        }
    }
}

impl Compression {
    fn to_bits(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Var1 => 1,
            Compression::Var2 => 2,
        }
    }

    fn from_bits(bits: u8) -> Result<Self> {
        match bits & 0x3 {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Var1),
            2 => Ok(Compression::Var2),
            other => Err(Error::Decode(
                "compression mode",
                format!("invalid mode bits {}", other),
            )),
        }
    }
}

impl Signature {
    pub fn new(
        layout: Layout,
        delta_first: bool,
        compr1: Compression,
        compr2: Compression,
        aggregated: bool,
    ) -> Self {
        Self {
            layout,
            delta_first,
            compr1,
            compr2,
            aggregated,
        }
    }

    pub fn to_byte(self) -> u8 {
        self.layout.to_bits()
            | (self.delta_first as u8) << 2
            | self.compr1.to_bits() << 3
            | self.compr2.to_bits() << 5
            | (self.aggregated as u8) << 7
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        Ok(Self {
            layout: Layout::from_bits(byte),
            delta_first: byte & 0x4 != 0,
            compr1: Compression::from_bits(byte >> 3)?,
            compr2: Compression::from_bits(byte >> 5)?,
            aggregated: byte & 0x80 != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUTS: [Layout; 4] = [
        Layout::Row,
        Layout::DeltaCluster,
        Layout::SimpleColumn,
        Layout::IndexedColumn,
    ];
    const MODES: [Compression; 3] = [Compression::None, Compression::Var1, Compression::Var2];

    #[test]
    fn test_signature_roundtrip_all_combinations() {
        for layout in LAYOUTS {
            for delta in [false, true] {
                for compr1 in MODES {
                    for compr2 in MODES {
                        for aggregated in [false, true] {
                            let sig = Signature::new(layout, delta, compr1, compr2, aggregated);
                            let decoded = Signature::from_byte(sig.to_byte())
                                .expect("Failed to decode signature");
                            assert_eq!(decoded, sig);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_invalid_compression_bits() {
        // compr1 bits = 3 is unused
        assert!(Signature::from_byte(0b0001_1000).is_err());
        // compr2 bits = 3 is unused
        assert!(Signature::from_byte(0b0110_0000).is_err());
    }

    #[test]
    fn test_distinct_bytes() {
        let a = Signature::new(Layout::Row, false, Compression::None, Compression::None, false);
        let b = Signature::new(Layout::Row, true, Compression::None, Compression::None, false);
        let c = Signature::new(Layout::Row, false, Compression::Var1, Compression::None, false);
        assert_ne!(a.to_byte(), b.to_byte());
        assert_ne!(a.to_byte(), c.to_byte());
        assert_ne!(b.to_byte(), c.to_byte());
    }
}
