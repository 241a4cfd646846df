//! Secure randomness helpers backed by `ring`.

use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::{Result, VerificationError};

pub fn fill(dest: &mut [u8]) -> Result<()> {
    SystemRandom::new()
        .fill(dest)
        .map_err(|_| VerificationError::provider("system randomness unavailable"))
}

pub fn bytes(len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(vec![0u8; len]);
    fill(&mut out)?;
    Ok(out)
}

/// Uniform decimal string of `len` digits, leading zeros allowed.
///
/// Bytes at or above 250 are discarded so every digit is equally likely.
pub fn digits(len: usize) -> Result<Zeroizing<String>> {
    let mut out = Zeroizing::new(String::with_capacity(len));
    let mut buf = Zeroizing::new([0u8; 16]);
    while out.len() < len {
        fill(&mut buf[..])?;
        for byte in buf.iter().filter(|b| **b < 250) {
            if out.len() == len {
                break;
            }
            out.push(char::from(b'0' + byte % 10));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digits_length_and_alphabet() {
        for _ in 0..50 {
            let code = digits(6).unwrap();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_bytes_are_not_constant() {
        let a = bytes(20).unwrap();
        let b = bytes(20).unwrap();
        assert_ne!(*a, *b);
    }
}
