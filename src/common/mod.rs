//! Common types shared by the rest of the crate: the canonical variant
//! identifier, the statistic-kind enum and the storage discipline it picks
//! for a [`crate::segment::Segment`].

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use crate::error::{Error, Result};

/// Canonical variant identifier `chrom:pos_ref/alt` with an optional
/// trailing `_extra`, per spec.md §3. Equality is string equality of the
/// canonical form, so `VariantId` derives `PartialEq` from its fields
/// directly rather than comparing some looser notion of identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantId {
    pub chromosome: String,
    pub position: u64,
    pub reference: String,
    pub alternate: String,
    pub extra: Option<String>,
}

fn variant_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<chrom>[^:]+):(?P<pos>[0-9]+)_(?P<ref>[^/]+)/(?P<alt>[^_]+)(?:_(?P<extra>.+))?$")
            .expect("variant id pattern is valid")
    })
}

impl VariantId {
    pub fn parse(raw: &str) -> Result<Self> {
        let caps = variant_pattern()
            .captures(raw)
            .ok_or_else(|| Error::InvalidArgument(format!("variant id does not parse: {raw:?}")))?;
        let position = caps["pos"]
            .parse::<u64>()
            .map_err(|e| Error::InvalidArgument(format!("invalid position in {raw:?}: {e}")))?;
        Ok(VariantId {
            chromosome: caps["chrom"].to_string(),
            position,
            reference: caps["ref"].to_string(),
            alternate: caps["alt"].to_string(),
            extra: caps.name("extra").map(|m| m.as_str().to_string()),
        })
    }
}

impl FromStr for VariantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        VariantId::parse(s)
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}_{}/{}",
            self.chromosome, self.position, self.reference, self.alternate
        )?;
        if let Some(extra) = &self.extra {
            write!(f, "_{extra}")?;
        }
        Ok(())
    }
}

/// The statistic kind a query asks the engine to compute. Carried through
/// the cache key (spec.md §4.4) as a single byte.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString,
)]
pub enum StatKind {
    #[strum(serialize = "r")]
    R,
    #[strum(serialize = "rsquare")]
    RSquare,
    #[strum(serialize = "cov")]
    Cov,
    #[strum(serialize = "rsquare_approx")]
    RSquareApprox,
}

impl StatKind {
    /// Storage discipline a [`crate::segment::Segment`] must use to serve
    /// this statistic, per spec.md §4.2.
    pub fn storage_mode(self) -> StorageMode {
        match self {
            StatKind::R | StatKind::RSquare => StorageMode::CscAllOnes,
            StatKind::Cov => StorageMode::CscValues,
            StatKind::RSquareApprox => StorageMode::BitsetCarriers,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            StatKind::R => 0,
            StatKind::RSquare => 1,
            StatKind::Cov => 2,
            StatKind::RSquareApprox => 3,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => StatKind::R,
            1 => StatKind::RSquare,
            2 => StatKind::Cov,
            3 => StatKind::RSquareApprox,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unrecognized statistic kind byte: {other}"
                )))
            }
        })
    }
}

/// Segment storage discipline, per spec.md §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Bi-allelic, unphased 0/1 genotypes; only non-zero positions matter.
    CscAllOnes,
    /// Dosage coded {0,1,2} (possibly `NaN`), explicit float values and
    /// per-column mean, used for covariance.
    CscValues,
    /// Bitset-of-carriers, used for approximate r².
    BitsetCarriers,
}

/// Output encoding a [`crate::segment::GenotypeSource`] is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// 0/1 per haplotype (bi-allelic, unphased).
    HaplotypePerAllele,
    /// 0/1/2 dosage, `NaN` for missing.
    Dosage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_canonical_form() {
        let v = VariantId::parse("22:51241101_A/T").unwrap();
        assert_eq!(v.chromosome, "22");
        assert_eq!(v.position, 51241101);
        assert_eq!(v.reference, "A");
        assert_eq!(v.alternate, "T");
        assert_eq!(v.extra, None);
        assert_eq!(v.to_string(), "22:51241101_A/T");
    }

    #[test]
    fn parses_with_extra_suffix() {
        let v = VariantId::parse("22:51241101_A/T_rs123").unwrap();
        assert_eq!(v.extra.as_deref(), Some("rs123"));
        assert_eq!(v.to_string(), "22:51241101_A/T_rs123");
    }

    #[test]
    fn rejects_malformed_id() {
        assert!(VariantId::parse("not-a-variant").is_err());
        assert!(VariantId::parse("22:abc_A/T").is_err());
    }

    #[rstest::rstest]
    #[case(StatKind::R, StorageMode::CscAllOnes)]
    #[case(StatKind::RSquare, StorageMode::CscAllOnes)]
    #[case(StatKind::Cov, StorageMode::CscValues)]
    #[case(StatKind::RSquareApprox, StorageMode::BitsetCarriers)]
    fn storage_mode_matches_spec(#[case] kind: StatKind, #[case] expected: StorageMode) {
        assert_eq!(kind.storage_mode(), expected);
    }

    #[test]
    fn stat_kind_byte_round_trip() {
        for kind in [
            StatKind::R,
            StatKind::RSquare,
            StatKind::Cov,
            StatKind::RSquareApprox,
        ] {
            assert_eq!(StatKind::from_byte(kind.as_byte()).unwrap(), kind);
        }
        assert!(StatKind::from_byte(99).is_err());
    }
}
