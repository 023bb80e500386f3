//! Combined key encoding.
//!
//! The device has no namespaces, so every `(prefix, key)` pair is stored
//! under a single byte string:
//!
//! ```text
//! prefix ++ SEPARATOR ++ key
//! ```
//!
//! Prefixes never contain [`SEPARATOR`], so the first separator splits a
//! combined key unambiguously, and byte-wise ordering of combined keys agrees
//! with `(prefix, SEPARATOR, key)` ordering.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{KvError, KvResult};

/// Reserved byte between prefix and key.
pub const SEPARATOR: u8 = 0x01;

/// Sorts after [`SEPARATOR`]; `prefix ++ PREFIX_UPPER` bounds every key under
/// `prefix` from above.
pub const PREFIX_UPPER: u8 = 0x02;

/// Largest key the device accepts.
pub const MAX_KEY_SIZE: usize = 4096;

/// Remote stand-in for the past-the-end position: greater than every key a
/// legal prefix can produce.
pub(crate) static END_KEY: [u8; MAX_KEY_SIZE] = [0xFF; MAX_KEY_SIZE];

/// A `(prefix, key)` pair encoded as one ordered byte string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CombinedKey(Bytes);

impl CombinedKey {
    /// Encodes `prefix` and `key`. `prefix` must not contain [`SEPARATOR`].
    pub fn new(prefix: &[u8], key: &[u8]) -> Self {
        debug_assert!(
            !prefix.contains(&SEPARATOR),
            "prefix must not contain the separator byte"
        );
        let mut buf = BytesMut::with_capacity(prefix.len() + 1 + key.len());
        buf.put_slice(prefix);
        buf.put_u8(SEPARATOR);
        buf.put_slice(key);
        Self(buf.freeze())
    }

    /// Wraps bytes read back from the device without validating them.
    pub fn from_raw(raw: Bytes) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Splits into `(prefix, key)`.
    pub fn split(&self) -> KvResult<(Bytes, Bytes)> {
        let at = separator_index(&self.0)?;
        Ok((self.0.slice(..at), self.0.slice(at + 1..)))
    }

    /// Returns the key component.
    pub fn key(&self) -> KvResult<Bytes> {
        let at = separator_index(&self.0)?;
        Ok(self.0.slice(at + 1..))
    }

    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        has_prefix(&self.0, prefix)
    }
}

impl AsRef<[u8]> for CombinedKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CombinedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CombinedKey({:?})", self.0)
    }
}

/// Encodes `(prefix, key)`.
pub fn combine(prefix: &[u8], key: &[u8]) -> CombinedKey {
    CombinedKey::new(prefix, key)
}

/// Splits a raw combined key at its first separator.
///
/// Fails with [`KvError::Encoding`] when no separator is present, which means
/// the key is foreign or corrupt.
pub fn split(combined: &[u8]) -> KvResult<(&[u8], &[u8])> {
    let at = combined
        .iter()
        .position(|&b| b == SEPARATOR)
        .ok_or_else(|| KvError::Encoding {
            key: Bytes::copy_from_slice(combined),
        })?;
    Ok((&combined[..at], &combined[at + 1..]))
}

/// True iff `combined` starts with `prefix` immediately followed by the
/// separator.
pub fn has_prefix(combined: &[u8], prefix: &[u8]) -> bool {
    combined.len() > prefix.len()
        && combined[prefix.len()] == SEPARATOR
        && combined.starts_with(prefix)
}

/// Exclusive upper bound of every combined key under `prefix`.
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut bound = Vec::with_capacity(prefix.len() + 1);
    bound.extend_from_slice(prefix);
    bound.push(PREFIX_UPPER);
    bound
}

fn separator_index(raw: &Bytes) -> KvResult<usize> {
    raw.iter()
        .position(|&b| b == SEPARATOR)
        .ok_or_else(|| KvError::Encoding { key: raw.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn combine_inserts_separator() {
        let key = combine(b"obj", b"name");
        assert_eq!(key.as_bytes(), b"obj\x01name");
    }

    #[test]
    fn split_without_separator_is_encoding_error() {
        let err = split(b"no-separator-here").unwrap_err();
        assert!(matches!(err, KvError::Encoding { .. }));

        let raw = CombinedKey::from_raw(Bytes::from_static(b"bare"));
        assert!(matches!(raw.split(), Err(KvError::Encoding { .. })));
    }

    #[test]
    fn split_uses_first_separator() {
        // Keys may contain the separator; prefixes may not.
        let (prefix, key) = split(b"p\x01k\x01v").unwrap();
        assert_eq!(prefix, b"p");
        assert_eq!(key, b"k\x01v");
    }

    #[test]
    fn empty_key_round_trips() {
        let combined = combine(b"p", b"");
        let (prefix, key) = combined.split().unwrap();
        assert_eq!(&prefix[..], b"p");
        assert!(key.is_empty());
    }

    #[test_case(b"a\x01x", b"a", true ; "direct member")]
    #[test_case(b"a\x01", b"a", true ; "empty key")]
    #[test_case(b"ab\x01x", b"a", false ; "longer prefix")]
    #[test_case(b"a", b"a", false ; "bare prefix")]
    #[test_case(b"b\x01x", b"a", false ; "other prefix")]
    #[test_case(b"\x01x", b"", true ; "empty prefix")]
    fn has_prefix_cases(combined: &[u8], prefix: &[u8], expected: bool) {
        assert_eq!(has_prefix(combined, prefix), expected);
    }

    #[test]
    fn prefix_upper_bound_sorts_after_members() {
        let bound = prefix_upper_bound(b"a");
        assert!(combine(b"a", &[0xFF; 8]).as_bytes() < bound.as_slice());
        assert!(bound.as_slice() < combine(b"b", b"").as_bytes());
    }

    fn prefix_strategy() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::vec(any::<u8>().prop_filter("no separator", |b| *b != SEPARATOR), 0..16)
    }

    proptest! {
        /// Property: split inverts combine for any separator-free prefix
        #[test]
        fn prop_split_inverts_combine(
            prefix in prefix_strategy(),
            key in proptest::collection::vec(any::<u8>(), 0..32),
        ) {
            let combined = combine(&prefix, &key);
            let (p, k) = split(combined.as_bytes()).unwrap();
            prop_assert_eq!(p, prefix.as_slice());
            prop_assert_eq!(k, key.as_slice());
            prop_assert!(combined.has_prefix(&prefix));
        }

        /// Property: combined ordering agrees with (prefix, key) ordering
        /// within one prefix
        #[test]
        fn prop_order_preserved_within_prefix(
            prefix in prefix_strategy(),
            a in proptest::collection::vec(any::<u8>(), 0..16),
            b in proptest::collection::vec(any::<u8>(), 0..16),
        ) {
            let ca = combine(&prefix, &a);
            let cb = combine(&prefix, &b);
            prop_assert_eq!(ca.cmp(&cb), a.cmp(&b));
        }
    }
}
