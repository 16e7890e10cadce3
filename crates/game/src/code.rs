//! Invitation codes for duel sessions.

use rand::Rng;

/// Uppercase letters and digits without the look-alikes `0 O I 1`.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const GAME_CODE_LENGTH: usize = 6;

pub fn generate_game_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..GAME_CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Codes are matched case-insensitively.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
