//! Relay fingerprints and relay pairs.

use std::{fmt, str};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};


//------------ Fingerprint -----------------------------------------------------

/// The 40 hex character identity fingerprint of a relay.
///
/// Fingerprints are compared and stored case-insensitively by upper-casing
/// on construction, matching how the overlay daemon itself reports them.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl str::FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('$');
        if s.len() != 40 {
            return Err(format!(
                "fingerprint '{s}' is {} characters long, expected 40",
                s.len()
            ))
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!(
                "fingerprint '{s}' contains non-hex characters"
            ))
        }
        Ok(Fingerprint(s.to_ascii_uppercase()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}


//------------ Pair -------------------------------------------------------------

/// An unordered pair of relays to measure, canonicalized so that `(A, B)`
/// and `(B, A)` are the same pair.
///
/// Canonicalization matters twice over: it lets the pair source dedup
/// equivalent pairs found in either order, and it gives the cache and
/// results journal a single stable key per pair.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Pair {
    first: Fingerprint,
    second: Fingerprint,
}

impl Pair {
    /// Builds a pair, ordering its two relays so fingerprint comparison
    /// is the sole source of truth for which is "first".
    pub fn new(a: Fingerprint, b: Fingerprint) -> Self {
        if a <= b {
            Pair { first: a, second: b }
        }
        else {
            Pair { first: b, second: a }
        }
    }

    pub fn first(&self) -> &Fingerprint {
        &self.first
    }

    pub fn second(&self) -> &Fingerprint {
        &self.second
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.first, self.second)
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn fp(c: char) -> Fingerprint {
        c.to_string().repeat(40).parse().unwrap()
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("AAAA".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn rejects_non_hex() {
        let bad = "Z".repeat(40);
        assert!(bad.parse::<Fingerprint>().is_err());
    }

    #[test]
    fn upcases_and_strips_dollar() {
        let lower = format!("${}", "ab".repeat(20));
        let parsed: Fingerprint = lower.parse().unwrap();
        assert_eq!(parsed.as_str(), "AB".repeat(20));
    }

    #[test]
    fn pair_canonicalizes_regardless_of_argument_order() {
        let a = fp('A');
        let b = fp('B');
        assert_eq!(Pair::new(a.clone(), b.clone()), Pair::new(b, a));
    }
}
