use cipher::generic_array::GenericArray;
use cipher::{BlockEncrypt, KeyInit};
use des::Des;

/// Effective length of a VNC auth key. Passwords are truncated or
/// zero-padded to exactly this many bytes before the key schedule.
pub const KEY_SIZE: usize = 8;

/// Length of the random challenge exchanged during VNC auth.
pub const CHALLENGE_SIZE: usize = 16;

const BLOCK_SIZE: usize = 8;

/// Truncates/zero-pads a password to the 8 bytes fed to the DES key schedule.
#[inline]
pub fn pad_key(passwd: &[u8]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];

    for (slot, &byte) in key.iter_mut().zip(passwd.iter()) {
        *slot = byte;
    }

    key
}

/// Computes the 16-byte VNC auth response for a challenge.
///
/// The key is the password truncated/zero-padded to 8 bytes with each byte
/// mirrored low-bit-first, per the DES convention used by RFB servers. The
/// response is the DES-ECB encryption of the two challenge halves. The key
/// schedule is constructed per call, so concurrent callers never share state.
pub fn auth_response(passwd: &[u8], challenge: &[u8; CHALLENGE_SIZE]) -> [u8; CHALLENGE_SIZE] {
    let mut key = pad_key(passwd);

    for byte in key.iter_mut() {
        *byte = byte.reverse_bits();
    }

    let cipher = Des::new_from_slice(&key).expect("DES key must be 8 bytes");

    let mut response = [0u8; CHALLENGE_SIZE];

    for (slot, source) in response
        .chunks_exact_mut(BLOCK_SIZE)
        .zip(challenge.chunks_exact(BLOCK_SIZE))
    {
        let mut block = GenericArray::clone_from_slice(source);
        cipher.encrypt_block(&mut block);
        slot.copy_from_slice(&block);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: [u8; CHALLENGE_SIZE] = [
        0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc, 0xfe, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd,
        0xef,
    ];

    #[test]
    fn test_pad_key_empty() {
        assert_eq!(pad_key(b""), [0u8; KEY_SIZE]);
    }

    #[test]
    fn test_pad_key_short() {
        assert_eq!(pad_key(b"ab"), [b'a', b'b', 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_pad_key_long() {
        assert_eq!(
            pad_key(b"abcdefghij"),
            [b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h']
        );
    }

    #[test]
    fn test_auth_response_deterministic() {
        assert_eq!(
            auth_response(b"pass", &CHALLENGE),
            auth_response(b"pass", &CHALLENGE)
        );
    }

    #[test]
    fn test_auth_response_truncates_like_pad_key() {
        // Only the first 8 bytes of the password partake in the key schedule.
        assert_eq!(
            auth_response(b"abcdefghij", &CHALLENGE),
            auth_response(b"abcdefgh", &CHALLENGE)
        );
        // Explicit zero padding is equivalent to implicit padding.
        assert_eq!(
            auth_response(b"ab", &CHALLENGE),
            auth_response(b"ab\0\0\0\0\0\0", &CHALLENGE)
        );
    }

    #[test]
    fn test_auth_response_blocks_are_independent() {
        let mut other = CHALLENGE;
        other[CHALLENGE_SIZE - 1] ^= 0xff;

        let response = auth_response(b"secret", &CHALLENGE);
        let other_response = auth_response(b"secret", &other);

        // The first half only depends on the first challenge half.
        assert_eq!(response[..BLOCK_SIZE], other_response[..BLOCK_SIZE]);
        assert_ne!(response[BLOCK_SIZE..], other_response[BLOCK_SIZE..]);
    }

    #[test]
    fn test_auth_response_distinguishes_keys() {
        assert_ne!(
            auth_response(b"pass", &CHALLENGE),
            auth_response(b"word", &CHALLENGE)
        );
    }
}
