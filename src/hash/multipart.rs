//! Multipart-aware content digests
//!
//! An object uploaded in one request carries the hex MD5 of its content as
//! checksum. An object uploaded in parts carries the MD5 of the concatenated
//! per-part MD5 digests, followed by `-` and the part count. The part size is
//! not recorded anywhere, so a local stream can only be matched against such a
//! checksum by guessing: [`MultipartDigest`] hashes the stream once while
//! partitioning it under several candidate part sizes at the same time.
//!
//! A remote checksum produced with a part size outside the candidate set will
//! not match even when the content is identical. That is an accuracy bound of
//! the checksum scheme, not something this module can close.

use serde::Serialize;

/// Smallest part size the store accepts (except for the last part)
pub const MIN_MULTIPART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest object the store accepts in a single request
pub const MAX_PUTOBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Largest number of parts in one multipart upload
pub const MAX_MULTIPART_COUNT: u64 = 10_000;

/// Part sizes commonly used by upload tools
pub const COMMON_PART_SIZES: [u64; 2] = [10 * 1024 * 1024, 15 * 1024 * 1024];

/// Outcome of checking a finished digest against a remote checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verification {
    /// A candidate reproduced the remote checksum
    Matched,
    /// The remote checksum is reproducible in principle and did not match
    Mismatched,
    /// The remote checksum was absent, or its part layout is unknown
    Unverifiable,
}

/// One hypothesized partitioning of the stream
#[derive(Clone)]
struct Candidate {
    part_size: u64,
    hasher: md5::Context,
    part_bytes: u64,
    parts: Vec<[u8; 16]>,
    checksum: Option<String>,
}

impl Candidate {
    fn new(part_size: u64) -> Self {
        Self {
            part_size: part_size.max(1),
            hasher: md5::Context::new(),
            part_bytes: 0,
            parts: Vec::new(),
            checksum: None,
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = self.part_size - self.part_bytes;
            let take = (data.len() as u64).min(room) as usize;
            self.hasher.consume(&data[..take]);
            self.part_bytes += take as u64;
            data = &data[take..];
            if self.part_bytes == self.part_size {
                self.close_part();
            }
        }
    }

    fn close_part(&mut self) {
        let hasher = std::mem::replace(&mut self.hasher, md5::Context::new());
        self.parts.push(hasher.compute().0);
        self.part_bytes = 0;
    }

    fn finish(&mut self) {
        // An empty stream still counts as one (empty) part.
        if self.part_bytes > 0 || self.parts.is_empty() {
            self.close_part();
        }
        self.checksum = Some(multipart_checksum(&self.parts));
    }
}

/// Streaming digest that tracks several candidate part sizes in one pass
#[derive(Clone)]
pub struct MultipartDigest {
    candidates: Vec<Candidate>,
    bytes: u64,
    finished: bool,
}

impl MultipartDigest {
    /// Digest with the default candidate set
    pub fn new() -> Self {
        Self::from_part_sizes(&default_part_sizes())
    }

    /// Digest with the default candidates plus additional part sizes
    pub fn with_extra_part_sizes(extra: &[u64]) -> Self {
        let mut sizes = default_part_sizes();
        sizes.extend_from_slice(extra);
        Self::from_part_sizes(&sizes)
    }

    /// Digest tuned for a remote checksum whose size and part count are known
    ///
    /// A part count of one means the checksum is a plain content MD5, so only
    /// the whole-object candidate is needed. A larger count adds the part size
    /// that splits `size` into exactly that many parts.
    pub fn with_hint(size: u64, part_count: Option<u32>) -> Self {
        match part_count {
            Some(1) | None => Self::single_part(),
            Some(count) => {
                let mut sizes = default_part_sizes();
                sizes.push(guess_part_size(size, count));
                Self::from_part_sizes(&sizes)
            }
        }
    }

    /// Digest that only computes the plain content MD5
    pub fn single_part() -> Self {
        Self::from_part_sizes(&[MAX_PUTOBJECT_SIZE])
    }

    /// Digest with an explicit candidate set; duplicates are dropped
    pub fn from_part_sizes(sizes: &[u64]) -> Self {
        let mut unique: Vec<u64> = Vec::with_capacity(sizes.len());
        for &size in sizes {
            let size = size.max(1);
            if !unique.contains(&size) {
                unique.push(size);
            }
        }
        Self {
            candidates: unique.into_iter().map(Candidate::new).collect(),
            bytes: 0,
            finished: false,
        }
    }

    /// Feed the next chunk of the stream
    pub fn update(&mut self, data: &[u8]) {
        debug_assert!(!self.finished, "update after finish");
        self.bytes += data.len() as u64;
        for candidate in &mut self.candidates {
            candidate.update(data);
        }
    }

    /// Flush the final part of every candidate; idempotent
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        for candidate in &mut self.candidates {
            candidate.finish();
        }
        self.finished = true;
    }

    /// Whether [`finish`](Self::finish) has run
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Total bytes consumed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Candidate part sizes in use
    pub fn part_sizes(&self) -> Vec<u64> {
        self.candidates.iter().map(|c| c.part_size).collect()
    }

    /// Raw MD5 of the whole content, if some candidate saw it as one part
    pub fn content_md5(&self) -> Option<[u8; 16]> {
        if !self.finished {
            return None;
        }
        self.candidates
            .iter()
            .find(|c| c.parts.len() == 1)
            .map(|c| c.parts[0])
    }

    /// Hex MD5 of the whole content, if available
    pub fn content_md5_hex(&self) -> Option<String> {
        self.content_md5().map(hex::encode)
    }

    /// Finalized `hash-count` checksums, one per candidate
    pub fn checksums(&self) -> impl Iterator<Item = &str> {
        self.candidates.iter().filter_map(|c| c.checksum.as_deref())
    }

    /// Finalized checksum of the candidate that produced `count` parts
    pub fn checksum_for_parts(&self, count: u32) -> Option<&str> {
        self.candidates
            .iter()
            .find(|c| c.parts.len() as u64 == count as u64)
            .and_then(|c| c.checksum.as_deref())
    }

    /// True when any candidate reproduces the remote checksum
    ///
    /// Surrounding quotes and whitespace on `remote` are ignored. Empty or
    /// absent checksums never match, nor does anything before `finish`.
    pub fn matches(&self, remote: Option<&str>) -> bool {
        if !self.finished {
            return false;
        }
        let cleaned = match remote.map(clean_checksum) {
            Some(c) if !c.is_empty() => c,
            _ => return false,
        };
        if let Some(md5) = self.content_md5_hex() {
            if md5.eq_ignore_ascii_case(cleaned) {
                return true;
            }
        }
        self.checksums().any(|c| c.eq_ignore_ascii_case(cleaned))
    }

    /// Check against a remote checksum using its part-count suffix
    ///
    /// A plain or `-1` checksum must equal the content MD5. A `-N` checksum is
    /// compared only against candidates that produced N parts; when none
    /// reproduces it the uploader's part size is unknown and the result is
    /// [`Verification::Unverifiable`].
    pub fn verify(&self, remote: Option<&str>) -> Verification {
        let cleaned = match remote.map(clean_checksum) {
            Some(c) if !c.is_empty() => c,
            _ => return Verification::Unverifiable,
        };
        if !self.finished {
            return Verification::Mismatched;
        }
        match checksum_part_count(cleaned) {
            Some(count) if count > 1 => {
                let reproduced = self
                    .candidates
                    .iter()
                    .filter(|c| c.parts.len() as u64 == count as u64)
                    .filter_map(|c| c.checksum.as_deref())
                    .any(|c| c.eq_ignore_ascii_case(cleaned));
                if reproduced {
                    Verification::Matched
                } else {
                    Verification::Unverifiable
                }
            }
            _ => {
                if self.matches(Some(cleaned)) {
                    Verification::Matched
                } else {
                    Verification::Mismatched
                }
            }
        }
    }
}

impl Default for MultipartDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MultipartDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartDigest")
            .field("bytes", &self.bytes)
            .field("part_sizes", &self.part_sizes())
            .field("finished", &self.finished)
            .field("content_md5", &self.content_md5_hex())
            .finish()
    }
}

fn default_part_sizes() -> Vec<u64> {
    let mut sizes = vec![MAX_PUTOBJECT_SIZE, MIN_MULTIPART_SIZE];
    sizes.extend_from_slice(&COMMON_PART_SIZES);
    sizes
}

/// Part size that splits `size` bytes into `count` parts
pub fn guess_part_size(size: u64, count: u32) -> u64 {
    let count = count.max(1) as u64;
    size.div_ceil(count).max(1)
}

/// Checksum of a multipart object: MD5 of the part digests, then `-count`
pub fn multipart_checksum(parts: &[[u8; 16]]) -> String {
    let mut hasher = md5::Context::new();
    for part in parts {
        hasher.consume(part);
    }
    format!("{}-{}", hex::encode(hasher.compute().0), parts.len())
}

/// Raw MD5 of a byte slice
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    md5::compute(data).0
}

/// Hex MD5 of a byte slice
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5_digest(data))
}

/// Strip surrounding quotes and whitespace from a remote checksum
pub fn clean_checksum(raw: &str) -> &str {
    raw.trim_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'')
}

/// Part count encoded in a `hash-count` checksum suffix
pub fn checksum_part_count(checksum: &str) -> Option<u32> {
    let (hash, count) = clean_checksum(checksum).rsplit_once('-')?;
    if hash.len() != 32 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    count.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn digest_of(data: &[u8], sizes: &[u64], chunk: usize) -> MultipartDigest {
        let mut digest = MultipartDigest::from_part_sizes(sizes);
        for piece in data.chunks(chunk.max(1)) {
            digest.update(piece);
        }
        digest.finish();
        digest
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_single_part_matches_plain_md5() {
        let data = b"Hello, World!";
        let digest = digest_of(data, &[MAX_PUTOBJECT_SIZE], 4);
        let expected = md5_hex(data);
        assert_eq!(digest.content_md5_hex(), Some(expected.clone()));
        assert!(digest.matches(Some(&expected)));
        assert!(digest.matches(Some(&format!("\"{}\"", expected))));
        assert!(digest.matches(Some(&format!("  '\"{}\"' ", expected.to_uppercase()))));
    }

    #[test]
    fn test_multipart_checksum_layout() {
        let data = sample(25);
        let digest = digest_of(&data, &[10], 7);

        let parts: Vec<[u8; 16]> = data
            .chunks(10)
            .map(|c| md5::compute(c).0)
            .collect();
        let expected = multipart_checksum(&parts);

        assert!(expected.ends_with("-3"));
        assert_eq!(digest.checksum_for_parts(3), Some(expected.as_str()));
        assert!(digest.matches(Some(&expected)));
        assert_eq!(digest.verify(Some(&expected)), Verification::Matched);
    }

    #[test]
    fn test_exact_boundary_has_no_trailing_empty_part() {
        let data = sample(20);
        let digest = digest_of(&data, &[10], 20);
        assert!(digest.checksum_for_parts(2).is_some());
        assert!(digest.checksum_for_parts(3).is_none());
    }

    #[test]
    fn test_empty_stream() {
        let digest = digest_of(&[], &[MAX_PUTOBJECT_SIZE, 5], 1);
        let empty = md5_hex(b"");
        assert_eq!(digest.content_md5_hex(), Some(empty.clone()));
        assert!(digest.matches(Some(&empty)));
        assert_eq!(digest.bytes(), 0);
    }

    #[test]
    fn test_rejects_unrelated_values() {
        let digest = digest_of(b"some content", &[MAX_PUTOBJECT_SIZE, 4], 3);
        assert!(!digest.matches(None));
        assert!(!digest.matches(Some("")));
        assert!(!digest.matches(Some("\"\"")));
        assert!(!digest.matches(Some("d41d8cd98f00b204e9800998ecf8427e")));
        assert!(!digest.matches(Some("not-a-checksum")));
    }

    #[test]
    fn test_unfinished_never_matches() {
        let mut digest = MultipartDigest::single_part();
        digest.update(b"abc");
        assert!(!digest.matches(Some(&md5_hex(b"abc"))));
        digest.finish();
        assert!(digest.matches(Some(&md5_hex(b"abc"))));
    }

    #[test]
    fn test_hint_adds_computed_part_size() {
        let digest = MultipartDigest::with_hint(100, Some(3));
        assert!(digest.part_sizes().contains(&34));

        let single = MultipartDigest::with_hint(100, Some(1));
        assert_eq!(single.part_sizes(), vec![MAX_PUTOBJECT_SIZE]);
    }

    #[test]
    fn test_hinted_verification() {
        let data = sample(100);
        let mut digest = MultipartDigest::with_hint(100, Some(4));
        digest.update(&data);
        digest.finish();

        let reference = digest_of(&data, &[25], 100);
        let remote = reference.checksum_for_parts(4).unwrap().to_string();
        assert_eq!(digest.verify(Some(&remote)), Verification::Matched);

        // A layout no candidate reproduces cannot be judged.
        let odd = digest_of(&data, &[30], 100);
        let remote = odd.checksum_for_parts(4).unwrap().to_string();
        assert_eq!(digest.verify(Some(&remote)), Verification::Unverifiable);

        assert_eq!(
            digest.verify(Some("0123456789abcdef0123456789abcdef")),
            Verification::Mismatched
        );
        assert_eq!(digest.verify(None), Verification::Unverifiable);
    }

    #[test]
    fn test_checksum_part_count() {
        assert_eq!(
            checksum_part_count("\"0123456789abcdef0123456789abcdef-12\""),
            Some(12)
        );
        assert_eq!(checksum_part_count("0123456789abcdef0123456789abcdef"), None);
        assert_eq!(checksum_part_count("xyz-3"), None);
        assert_eq!(checksum_part_count("0123456789abcdef0123456789abcdef-"), None);
    }

    #[test]
    fn test_part_count_needs_exactly_32_hex_digits() {
        assert_eq!(
            checksum_part_count("xyz0123456789abcdef0123456789abcdef-3"),
            None
        );
        assert_eq!(checksum_part_count("0123456789abcdef0123456789abcde-3"), None);
        assert_eq!(checksum_part_count("0123456789abcdef0123456789abcdeg-3"), None);
    }

    #[test]
    fn test_guess_part_size() {
        assert_eq!(guess_part_size(100, 4), 25);
        assert_eq!(guess_part_size(101, 4), 26);
        assert_eq!(guess_part_size(0, 4), 1);
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_checksums(
            len in 0usize..600,
            chunk_a in 1usize..97,
            chunk_b in 1usize..97,
            size in 1u64..80,
        ) {
            let data = sample(len);
            let sizes = [MAX_PUTOBJECT_SIZE, size, size * 3 + 1];
            let a = digest_of(&data, &sizes, chunk_a);
            let b = digest_of(&data, &sizes, chunk_b);

            let ca: Vec<&str> = a.checksums().collect();
            let cb: Vec<&str> = b.checksums().collect();
            prop_assert_eq!(ca, cb);
            prop_assert_eq!(a.content_md5_hex(), b.content_md5_hex());
            prop_assert_eq!(a.bytes(), len as u64);
            prop_assert!(a.matches(Some(&md5_hex(&data))));
        }
    }
}
