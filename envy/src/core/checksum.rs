use std::fmt;
use std::io::Read;
use std::str::FromStr;

use anyhow::{Context, Result, bail, ensure};
use data_encoding::HEXLOWER_PERMISSIVE;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;

/// SHA-256 digest of a fetched artifact, rendered as `sha256:<hex>`.
///
/// This is the expected-digest format carried by source descriptors; fetch
/// verification compares one of these against the bytes actually downloaded.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum([u8; 32]);

impl Checksum {
    const PREFIX: &'static str = "sha256";

    pub fn parse(s: &str) -> Result<Self> {
        return inner(s).with_context(|| format!("failed to parse checksum: {s}"));

        fn inner(s: &str) -> Result<Checksum> {
            let Some((prefix, hex)) = s.split_once(':') else {
                bail!("checksum is missing hash function type prefix");
            };
            ensure!(
                prefix == Checksum::PREFIX,
                "unsupported hash function type: {prefix}"
            );
            let bytes = HEXLOWER_PERMISSIVE
                .decode(hex.as_bytes())
                .context("checksum is not valid hex")?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|b: Vec<u8>| anyhow::anyhow!("invalid checksum length {}", b.len()))?;
            Ok(Checksum(bytes))
        }
    }

    /// Digests a byte slice in one shot.
    pub fn compute(bytes: impl AsRef<[u8]>) -> Self {
        let mut digest = ChecksumDigest::new();
        digest.update(bytes.as_ref());
        digest.finish()
    }

    /// Digests everything a reader yields.
    pub fn compute_read(input: impl Read) -> Result<Self> {
        let mut digest = ChecksumDigest::new();
        digest.update_read(input)?;
        Ok(digest.finish())
    }
}

impl FromStr for Checksum {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Checksum::parse(s)
    }
}

impl TryFrom<String> for Checksum {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Checksum> for String {
    fn from(c: Checksum) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", Checksum::PREFIX, HEXLOWER_PERMISSIVE.encode(&self.0))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({self})")
    }
}

/// Incremental SHA-256 digest matching [`Checksum`].
pub struct ChecksumDigest(sha2::Sha256);

impl ChecksumDigest {
    pub fn new() -> Self {
        Self(sha2::Sha256::new())
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    pub fn update_read(&mut self, mut input: impl Read) -> Result<&mut Self> {
        let mut buf = [0; 64 * 1024];
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break Ok(self);
            }
            self.update(&buf[..n]);
        }
    }

    pub fn finish(&mut self) -> Checksum {
        Checksum(self.0.finalize_reset().into())
    }
}

impl Default for ChecksumDigest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parse_display_round_trip() {
        let s = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let checksum = Checksum::parse(s).unwrap();
        assert_eq!(checksum.to_string(), s);
    }

    #[test_case("deadbeef"; "missing prefix")]
    #[test_case("md5:0123456789abcdef0123456789abcdef"; "wrong function")]
    #[test_case("sha256:deadbeef"; "too short")]
    #[test_case("sha256:zz23456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"; "not hex")]
    fn parse_rejects(s: &str) {
        assert!(Checksum::parse(s).is_err());
    }

    #[test]
    fn compute_matches_known_vector() {
        // Well-known SHA-256 of the empty input.
        assert_eq!(
            Checksum::compute(b"").to_string(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn streamed_and_one_shot_agree() {
        let data = b"some artifact bytes".repeat(1000);
        let streamed = Checksum::compute_read(std::io::Cursor::new(&data)).unwrap();
        assert_eq!(streamed, Checksum::compute(&data));
    }
}
