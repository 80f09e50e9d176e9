/// Wire width of one channel's sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleWidth {
    One,
    Two,
    Four,
    /// Any other width. Its bytes are still consumed from the stream but
    /// always decode to `0.0`.
    Unsupported(u8),
}

impl SampleWidth {
    /// Number of bytes this width occupies on the wire
    pub fn byte_len(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
            Self::Unsupported(width) => usize::from(width),
        }
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }

    /// Map a little-endian unsigned sample onto `[-0.5, 0.5)`
    pub fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            Self::One => bytes
                .first()
                .map_or(0.0, |&raw| (f32::from(raw) - 128.0) / 256.0),
            Self::Two => bytes
                .get(..2)
                .and_then(|span| <[u8; 2]>::try_from(span).ok())
                .map_or(0.0, |raw| {
                    (f32::from(u16::from_le_bytes(raw)) - 32768.0) / 65536.0
                }),
            Self::Four => bytes
                .get(..4)
                .and_then(|span| <[u8; 4]>::try_from(span).ok())
                .map_or(0.0, |raw| {
                    let centered = (f64::from(u32::from_le_bytes(raw)) - 2_147_483_648.0)
                        / 4_294_967_296.0;
                    // values within half an ulp of 0.5 would round up to it
                    (centered as f32).min(largest_below_half())
                }),
            Self::Unsupported(_) => 0.0,
        }
    }
}

impl From<u8> for SampleWidth {
    fn from(width: u8) -> Self {
        match width {
            1 => Self::One,
            2 => Self::Two,
            4 => Self::Four,
            other => Self::Unsupported(other),
        }
    }
}

fn largest_below_half() -> f32 {
    f32::from_bits(0.5_f32.to_bits() - 1)
}

/// Decode one raw sample of the given wire width
pub fn decode(bytes: &[u8], width: u8) -> f32 {
    SampleWidth::from(width).decode(bytes)
}
