use divrem::DivCeil;

/// Rounds `value` up to the next multiple of `alignment`.
///
/// An alignment of zero or one leaves `value` unchanged.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    DivCeil::div_ceil(value, alignment) * alignment
}

pub fn div_ceil_u32(value: u32, divisor: u32) -> u32 {
    DivCeil::div_ceil(value, divisor)
}

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}
