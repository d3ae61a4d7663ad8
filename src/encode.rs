//! Short, filename-safe identifier derived from an arbitrary string.
//!
//! The byte sum of the input is rendered in decimal, armored as a single
//! uuencoded line, then shifted into the `A-Z a-z 0-9 + _` alphabet. Anything
//! the shift leaves outside that alphabet is dropped. The result is stable
//! for a given input and is used to tell producers apart in job filenames;
//! collisions are expected and absorbed by the publish retry.

/// Returns true for characters allowed in job filenames and shard names.
pub fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '+' || c == '_'
}

/// Encode `input` into a short, filesystem-safe token.
pub fn encoded_id(input: &str) -> String {
    // No modular folding: long inputs produce long sums.
    let sum: u64 = input.bytes().map(u64::from).sum();
    let armored = uuencode_line(sum.to_string().as_bytes());

    armored
        .chars()
        .map(shift_into_safe_range)
        .filter(|c| is_safe_char(*c))
        .collect()
}

/// Single uuencoded line: a length character followed by 4 characters per
/// 3-byte group, zero-padded. Zero sextets render as space.
fn uuencode_line(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(1 + bytes.len().div_ceil(3) * 4);
    out.push(sextet_char(bytes.len() as u8));

    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = chunk.get(1).copied().unwrap_or(0);
        let b2 = chunk.get(2).copied().unwrap_or(0);

        out.push(sextet_char(b0 >> 2));
        out.push(sextet_char(((b0 & 0x03) << 4) | (b1 >> 4)));
        out.push(sextet_char(((b1 & 0x0f) << 2) | (b2 >> 6)));
        out.push(sextet_char(b2 & 0x3f));
    }

    out
}

fn sextet_char(v: u8) -> char {
    char::from((v & 0x3f) + b' ')
}

/// Character range shift table from uuencode space into base64-ish space.
/// Ranges are applied exactly as the legacy producers did, including the
/// characters they map outside the safe alphabet (removed afterwards).
fn shift_into_safe_range(c: char) -> char {
    let shifted = match c {
        ' '..=':' => c as u32 + 33,
        ';'..='T' => c as u32 + 39,
        'U'..=']' => c as u32 - 36,
        '^' => '+' as u32,
        _ => return c,
    };
    char::from_u32(shifted).unwrap_or(c)
}
