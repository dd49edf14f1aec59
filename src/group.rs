//! Group-level score-and-covariance bundle, assembled from a mask group's
//! variant list plus the score and pairwise-covariance computations over
//! those variants, per SPEC_FULL.md §2.1(d).
//!
//! Grounded on `core/src/ScoreCovarianceRunner.{h,cpp}`: the reference
//! keeps one `ScoreCovarianceRunner` per group holding its variant names,
//! score entries and a single flattened upper-triangular covariance
//! vector. The mask/group-definition parser itself stays an external
//! collaborator (spec.md §1); this module only assembles the bundle once a
//! group's variant list is already in hand.

use serde::{Serialize, Serializer};

use crate::cell::Cell;
use crate::common::StatKind;
use crate::error::{Error, Result};
use crate::paging::ScoreEntry;
use crate::score::{compute_scores, Phenotype};
use crate::segment::Segment;

/// A named set of variants spanning one chromosome, already resolved to
/// `(segment_index_in_group, column)` pairs by the mask parser
/// (out of scope here; see spec.md §1).
#[derive(Debug, Clone)]
pub struct MaskGroup {
    pub name: String,
    pub chromosome: String,
    /// Segments touched by this group's variants, in ascending start_bp
    /// order, already loaded with genotypes.
    pub segments: Vec<Segment>,
    /// `(segment index into `segments`, column within that segment)` for
    /// each of the group's variants, in the group's declared order.
    pub members: Vec<(usize, usize)>,
}

fn serialize_nullable_f64<S: Serializer>(
    value: &Option<f64>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(v) if v.is_finite() => s.serialize_f64(*v),
        _ => s.serialize_none(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CovarianceEntry {
    pub i: u32,
    pub j: u32,
    #[serde(serialize_with = "serialize_nullable_f64")]
    pub value: Option<f64>,
}

/// A mask group's score-and-covariance bundle: the group's variant-level
/// score entries plus its upper-triangular (including diagonal) pairwise
/// covariance, sharing one sigma2/n_samples pair across the whole group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupScoreCovariance {
    pub group_name: String,
    pub scores: Vec<ScoreEntry>,
    pub covariance: Vec<CovarianceEntry>,
    pub sigma2: f64,
    pub n_samples: u64,
}

impl GroupScoreCovariance {
    /// Build the bundle for `group` given an aligned phenotype vector.
    /// Scores are computed over the group's segments in order (unpaged —
    /// a group is expected to be small); covariance is computed for every
    /// member pair `(a, b)` with `a <= b` in declared order.
    pub fn build(group: &MaskGroup, phenotype: &Phenotype) -> Result<Self> {
        let (score_page, _) = compute_scores(&group.segments, phenotype, usize::MAX, None)?;
        let sigma2 = score_page.sigma2();
        let n_samples = score_page.n_effective();

        let mut covariance = Vec::with_capacity(group.members.len() * (group.members.len() + 1) / 2);
        for a in 0..group.members.len() {
            let (seg_a, col_a) = group.members[a];
            for b in a..group.members.len() {
                let (seg_b, col_b) = group.members[b];
                let value = pairwise_covariance(&group.segments, seg_a, col_a, seg_b, col_b)?;
                covariance.push(CovarianceEntry {
                    i: a as u32,
                    j: b as u32,
                    value,
                });
            }
        }

        Ok(GroupScoreCovariance {
            group_name: group.name.clone(),
            scores: score_page.entries().to_vec(),
            covariance,
            sigma2,
            n_samples,
        })
    }

    /// Serialize with `NaN`/missing covariance entries as JSON `null`
    /// (spec.md §4.5, §9); `serde_json::to_string` on this type already
    /// does that via each field's serializer, this is a thin convenience.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidArgument(e.to_string()))
    }
}

fn pairwise_covariance(
    segments: &[Segment],
    seg_a: usize,
    col_a: usize,
    seg_b: usize,
    col_b: usize,
) -> Result<Option<f64>> {
    let mut cell = Cell::new(
        segments[seg_a].start_bp(),
        segments[seg_b].start_bp(),
        StatKind::Cov,
    );
    if seg_a == seg_b {
        cell.compute(&segments[seg_a], &segments[seg_a])?;
        Ok(cell.value(col_a.min(col_b), col_a.max(col_b)))
    } else {
        cell.compute(&segments[seg_a], &segments[seg_b])?;
        Ok(cell.value(col_a, col_b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{OutputMode, StorageMode};
    use crate::segment::GenotypeRecord;

    struct Fixed(Vec<GenotypeRecord>);
    impl crate::segment::GenotypeSource for Fixed {
        fn samples(&self) -> &[String] {
            &[]
        }
        fn chromosomes(&self) -> Vec<String> {
            vec![]
        }
        fn scan(
            &self,
            _c: &str,
            _s: u64,
            _e: u64,
            _subset: &[String],
            _mode: OutputMode,
        ) -> Result<Vec<GenotypeRecord>> {
            Ok(self.0.clone())
        }
    }

    fn dosage_segment(start: u64, stop: u64, positions: &[u64]) -> Segment {
        let records: Vec<GenotypeRecord> = positions
            .iter()
            .enumerate()
            .map(|(k, &pos)| GenotypeRecord {
                position: pos,
                reference: "A".into(),
                alternate: "T".into(),
                n_rows: 4,
                values: vec![
                    (0, (k as f32) % 3.0),
                    (1, 1.0),
                    (2, 0.0),
                    (3, (k as f32 + 1.0) % 3.0),
                ],
            })
            .collect();
        let mut seg = Segment::new("1", start, stop);
        seg.load_from_source(&Fixed(records), &[], OutputMode::Dosage, StorageMode::CscValues)
            .unwrap();
        seg
    }

    #[test]
    fn bundle_has_upper_triangular_covariance_including_diagonal() {
        let seg = dosage_segment(100, 199, &[100, 150]);
        let group = MaskGroup {
            name: "grp1".into(),
            chromosome: "1".into(),
            segments: vec![seg],
            members: vec![(0, 0), (0, 1)],
        };
        let phenotype = Phenotype(vec![Some(0.1), Some(1.2), Some(-0.3), Some(0.8)]);
        let bundle = GroupScoreCovariance::build(&group, &phenotype).unwrap();
        assert_eq!(bundle.scores.len(), 2);
        // 2 diagonal + 1 off-diagonal = 3 entries
        assert_eq!(bundle.covariance.len(), 3);
        assert_eq!(bundle.group_name, "grp1");
    }
}
