//! Validation of server-supplied Diffie-Hellman parameters.
//!
//! `dh_prime` must be a 2048-bit safe prime (`p` and `(p - 1) / 2` both
//! prime) and `g` must generate the subgroup of order `(p - 1) / 2`.

use std::fmt;

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};

/// The prime every production and test datacenter currently sends.
pub const KNOWN_PRIME_HEX: &str = concat!(
    "c71caeb9c6b1c9048e6c522f70f13f73980d40238e3e21c14934d037563d930f",
    "48198a0aa7c14058229493d22530f4dbfa336f6e0ac925139543aed44cce7c37",
    "20fd51f69458705ac68cd4fe6b6b13abdc9746512969328454f18faf8c595f64",
    "2477fe96bb2a941d5bcd1d4ac8cc49880708fa9b378e3c4f3a9060bee67cf9a4",
    "a4a695811051907e162753b56b0f6b410dba74d8a84b2a14b3144e0ef1284754",
    "fd17ed950d5965b4b9dd46582db1178d169c6bc465b0d6ff9ca3928fef5b9ae4",
    "e418fc15e83ebea0f87fa9ff5eed70050ded2849f47bf959d956850ce929851f",
    "0d8115f635b105ee2e4e15d04b2454bf6f4fadf034b10403119cd8e3b92fcc5b",
);

/// Why a `(dh_prime, g)` pair was refused.
#[derive(Clone, Debug, PartialEq)]
pub enum DhError {
    /// `dh_prime` is not exactly 2048 bits long.
    PrimeLength { bits: u64 },
    /// `dh_prime` or `(dh_prime - 1) / 2` is composite.
    NotSafePrime,
    /// `g` does not generate the expected subgroup for this prime.
    BadGenerator { g: i32 },
}

impl fmt::Display for DhError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrimeLength { bits } => write!(f, "dh_prime has {bits} bits, expected 2048"),
            Self::NotSafePrime => write!(f, "dh_prime is not a safe prime"),
            Self::BadGenerator { g } => write!(f, "g={g} is not a valid generator"),
        }
    }
}

impl std::error::Error for DhError {}

fn known_prime() -> BigUint {
    BigUint::parse_bytes(KNOWN_PRIME_HEX.as_bytes(), 16).unwrap_or_default()
}

/// Check `prime` and `g` before any exponentiation uses them.
pub fn check_prime_and_generator(prime: &BigUint, g: i32) -> Result<(), DhError> {
    let bits = prime.bits();
    if bits != 2048 {
        return Err(DhError::PrimeLength { bits });
    }

    if !generator_matches(prime, g) {
        return Err(DhError::BadGenerator { g });
    }

    if *prime == known_prime() {
        return Ok(());
    }

    let half = (prime - 1u32) >> 1;
    if is_probable_prime(prime) && is_probable_prime(&half) {
        Ok(())
    } else {
        Err(DhError::NotSafePrime)
    }
}

fn residue(prime: &BigUint, m: u32) -> u32 {
    (prime % m).to_u32().unwrap_or(0)
}

fn generator_matches(prime: &BigUint, g: i32) -> bool {
    match g {
        2 => residue(prime, 8) == 7,
        3 => residue(prime, 3) == 2,
        4 => true,
        5 => matches!(residue(prime, 5), 1 | 4),
        6 => matches!(residue(prime, 24), 19 | 23),
        7 => matches!(residue(prime, 7), 3 | 5 | 6),
        _ => false,
    }
}

const WITNESSES: [u32; 16] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53];

/// Miller-Rabin with fixed witnesses.
fn is_probable_prime(n: &BigUint) -> bool {
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }
    for w in WITNESSES {
        let w = BigUint::from(w);
        if *n == w {
            return true;
        }
        if (n % &w).is_zero() {
            return false;
        }
    }

    let n_minus_one = n - 1u32;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    'witness: for w in WITNESSES {
        let mut x = BigUint::from(w).modpow(&d, n);
        if x.is_one() || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_prime_with_g3_is_accepted() {
        assert_eq!(check_prime_and_generator(&known_prime(), 3), Ok(()));
    }

    #[test]
    fn generator_must_match_residue() {
        // known prime is 3 mod 8, so 2 generates the wrong subgroup
        assert_eq!(
            check_prime_and_generator(&known_prime(), 2),
            Err(DhError::BadGenerator { g: 2 })
        );
        assert_eq!(
            check_prime_and_generator(&known_prime(), 9),
            Err(DhError::BadGenerator { g: 9 })
        );
    }

    #[test]
    fn short_prime_is_rejected() {
        let p = BigUint::from(1_000_003u32);
        assert_eq!(check_prime_and_generator(&p, 3), Err(DhError::PrimeLength { bits: 20 }));
    }

    #[test]
    fn composite_of_right_size_is_rejected() {
        // stays 2 mod 3 so g=3 passes, but is divisible by 5
        let p = known_prime() + 12u32;
        assert_eq!(p.bits(), 2048);
        assert_eq!(check_prime_and_generator(&p, 3), Err(DhError::NotSafePrime));
    }

    #[test]
    fn miller_rabin_small_values() {
        assert!(is_probable_prime(&BigUint::from(1_000_003u32)));
        assert!(!is_probable_prime(&BigUint::from(1_000_001u32)));
        // Carmichael number
        assert!(!is_probable_prime(&BigUint::from(561u32)));
        assert!(is_probable_prime(&BigUint::from(53u32)));
    }
}
