//! Session ids and the per-session secret agents present with every chunk.

use warden_protocol::Direction;

/// Hex length of a session secret (16 random bytes).
pub const TOKEN_HEX_LEN: usize = 32;

/// Fresh session secret: 16 CSPRNG bytes, lowercase hex.
pub fn generate_token() -> String {
    hex::encode(rand::random::<[u8; TOKEN_HEX_LEN / 2]>())
}

/// Fresh session id; the prefix tells uploads from downloads in logs.
pub fn session_id(direction: Direction) -> String {
    let prefix = match direction {
        Direction::Upload => "up",
        Direction::Download => "down",
    };
    format!("{prefix}-{}", generate_token())
}

/// Constant-time comparison of a presented secret against the stored one.
///
/// An empty stored secret matches nothing.
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    if expected.is_empty() || presented.len() != expected.len() {
        return false;
    }
    presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}
