//! Short, human-shareable room codes

use rand::Rng;

/// Safe character set for room codes (excludes 0/O, 1/I/L to avoid confusion)
pub const CODE_CHARS: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
pub const CODE_LENGTH: usize = 6;

/// Generate a random room code (6 characters, ~887M combinations)
pub fn generate_room_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_CHARS[rng.random_range(0..CODE_CHARS.len())] as char)
        .collect()
}

/// Normalize user input for lookup: trim whitespace, uppercase.
/// Returns None if nothing is left after trimming.
pub fn normalize_code(input: &str) -> Option<String> {
    let trimmed = input.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_ascii_uppercase())
}

/// Whether a code has the shape the generator produces
pub fn is_well_formed(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| CODE_CHARS.contains(&b))
}
