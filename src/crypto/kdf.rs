//! Password-to-header-key derivation.
//!
//! The header key is PBKDF2-HMAC-SHA256 over the password with the salt and
//! round count recorded in the container prefix. The round count is chosen
//! once, at creation, by [`calibrate_rounds`]; opening always uses the
//! recorded value verbatim so files stay portable across hosts.

use std::time::{Duration, Instant};

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::Error;
use crate::format::SALT_SIZE;

/// Derivation cost target for freshly created containers.
const CALIBRATION_TARGET: Duration = Duration::from_millis(100);

/// Rounds used for the timing probe, and the floor for the calibrated
/// result. Even a pathologically fast timer never yields a trivial count.
const PROBE_ROUNDS: u32 = 20_000;

/// Derive `out.len()` bytes of header-key material from a password.
pub(crate) fn derive_key(password: &str, salt: &[u8; SALT_SIZE], rounds: u32, out: &mut [u8]) {
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, out);
}

/// Pick a PBKDF2 round count costing roughly [`CALIBRATION_TARGET`] of CPU
/// on this host for the given password and key length.
///
/// Runs the real primitive for [`PROBE_ROUNDS`] rounds, times it, and
/// scales. The result is clamped to `[PROBE_ROUNDS, u32::MAX]`.
pub(crate) fn calibrate_rounds(password_len: usize, key_len: usize) -> Result<u32, Error> {
    // PBKDF2 cost is insensitive to password content, so a filler password
    // of the right length prices the real derivation.
    let password = vec![b'x'; password_len.max(1)];
    let salt = [0x5Au8; SALT_SIZE];
    let mut out = Zeroizing::new(vec![0u8; key_len]);

    let start = Instant::now();
    pbkdf2_hmac::<Sha256>(&password, &salt, PROBE_ROUNDS, &mut out);
    let elapsed = start.elapsed();

    if elapsed.is_zero() {
        return Err(Error::Crypto("kdf calibration produced no timing signal"));
    }

    let scaled =
        u128::from(PROBE_ROUNDS) * CALIBRATION_TARGET.as_nanos() / elapsed.as_nanos();
    let rounds = scaled.clamp(u128::from(PROBE_ROUNDS), u128::from(u32::MAX)) as u32;

    debug!(rounds, probe_ms = elapsed.as_millis() as u64, "calibrated kdf rounds");
    Ok(rounds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let salt = [7u8; SALT_SIZE];
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        derive_key("correct horse", &salt, 1_000, &mut a);
        derive_key("correct horse", &salt, 1_000, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn password_salt_and_rounds_all_matter() {
        let salt = [7u8; SALT_SIZE];
        let other_salt = [8u8; SALT_SIZE];
        let mut base = [0u8; 32];
        derive_key("password", &salt, 1_000, &mut base);

        let mut changed = [0u8; 32];
        derive_key("passworD", &salt, 1_000, &mut changed);
        assert_ne!(base, changed);

        derive_key("password", &other_salt, 1_000, &mut changed);
        assert_ne!(base, changed);

        derive_key("password", &salt, 1_001, &mut changed);
        assert_ne!(base, changed);
    }

    #[test]
    fn shorter_keys_are_prefix_independent() {
        // PBKDF2 output blocks differ per length request only past block
        // boundaries; a 16-byte request equals the first 16 bytes of a
        // 32-byte request (both inside the first SHA-256 block).
        let salt = [1u8; SALT_SIZE];
        let mut short = [0u8; 16];
        let mut long = [0u8; 32];
        derive_key("p", &salt, 100, &mut short);
        derive_key("p", &salt, 100, &mut long);
        assert_eq!(short, long[..16]);
    }

    #[test]
    fn calibration_respects_floor() {
        let rounds = calibrate_rounds(8, 32).expect("calibration");
        assert!(rounds >= PROBE_ROUNDS);
    }
}
