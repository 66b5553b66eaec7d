//! Job identifier generation.

use std::fmt::Write as _;

use rand::RngCore;

/// Number of random bytes behind a job id.
const JID_BYTES: usize = 12;

/// Generate a new job id: 24 lowercase hex characters from 12 bytes of
/// CSPRNG output.
///
/// Ids are unique per enqueue; collisions across any realistic job corpus
/// are vanishingly unlikely at 96 bits of entropy.
pub fn random_jid() -> String {
    let mut bytes = [0u8; JID_BYTES];
    rand::rng().fill_bytes(&mut bytes);

    let mut out = String::with_capacity(JID_BYTES * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
