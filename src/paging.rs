//! Result/paging model: the two pairwise-result page shapes, the score
//! page, their cursors, and the variants dictionary shared by both, per
//! spec.md §3 and §6.

use indexmap::IndexMap;
use serde::{Serialize, Serializer};

use crate::error::ErrorKind;

/// `NaN` serializes as JSON `null` (spec.md §4.5, §9) rather than the
/// non-standard string some float serializers fall back to.
fn serialize_nullable_f64<S: Serializer>(
    value: &Option<f64>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(v) if v.is_finite() => s.serialize_f64(*v),
        _ => s.serialize_none(),
    }
}

/// Resume cursor for a pairwise-result page: `(last_cell Z, last_i, last_j)`.
/// `(-1, -1)` after a non-`None` `last_cell` marks "begin that cell";
/// `last_cell = None` together with `last_i = last_j = -1` and a non-zero
/// page number is the terminal sentinel (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairwiseCursor {
    pub last_cell_z: Option<u64>,
    pub last_i: i64,
    pub last_j: i64,
}

impl Default for PairwiseCursor {
    fn default() -> Self {
        PairwiseCursor::start()
    }
}

impl PairwiseCursor {
    pub fn start() -> Self {
        PairwiseCursor {
            last_cell_z: None,
            last_i: -1,
            last_j: -1,
        }
    }

    pub fn terminal() -> Self {
        PairwiseCursor {
            last_cell_z: None,
            last_i: -1,
            last_j: -1,
        }
    }

    /// Encode as `last_cell_z:last_i:last_j:page_number`, the short text
    /// transport form from spec.md §6.
    pub fn encode(&self, page_number: u64) -> String {
        format!(
            "{}:{}:{}:{}",
            self.last_cell_z
                .map(|z| z.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.last_i,
            self.last_j,
            page_number
        )
    }

    pub fn decode(token: &str) -> Option<(Self, u64)> {
        let mut parts = token.split(':');
        let z = parts.next()?;
        let i: i64 = parts.next()?.parse().ok()?;
        let j: i64 = parts.next()?.parse().ok()?;
        let page_number: u64 = parts.next()?.parse().ok()?;
        let last_cell_z = if z == "-" { None } else { Some(z.parse().ok()?) };
        Some((
            PairwiseCursor {
                last_cell_z,
                last_i: i,
                last_j: j,
            },
            page_number,
        ))
    }
}

/// A (segment, column-within-segment) pair identifying one variant site as
/// seen during traversal, before it's resolved to a dense page-local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantSite {
    pub chromosome: String,
    pub segment_start_bp: u64,
    pub column: u32,
}

/// One resolved variant entry in a page's variants dictionary.
#[derive(Debug, Clone, Serialize)]
pub struct VariantEntry {
    pub name: String,
    pub position: u64,
    pub alt_freq: f32,
}

/// First-seen-order dictionary mapping a [`VariantSite`] to a dense,
/// page-local integer id, per spec.md §3.
#[derive(Debug, Default)]
pub struct VariantsDictionary {
    order: IndexMap<VariantSite, VariantEntry>,
}

impl VariantsDictionary {
    pub fn new() -> Self {
        VariantsDictionary {
            order: IndexMap::new(),
        }
    }

    /// Resolve (inserting if new) the dense id for `site`, with
    /// `resolve` supplying its name/position/frequency when it is first
    /// seen.
    pub fn id_for(&mut self, site: VariantSite, resolve: impl FnOnce() -> VariantEntry) -> u32 {
        if let Some(idx) = self.order.get_index_of(&site) {
            return idx as u32;
        }
        let (idx, _) = self.order.insert_full(site, resolve());
        idx as u32
    }

    pub fn entries(&self) -> impl Iterator<Item = &VariantEntry> {
        self.order.values()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrelationEntry {
    pub second_id: u32,
    #[serde(serialize_with = "serialize_nullable_f64")]
    pub value: Option<f64>,
}

/// Pairwise-result page: variants dictionary plus a map from
/// first-variant page-id to a sorted list of (second-id, value) pairs.
#[derive(Debug, Default, Serialize)]
pub struct PairwiseResultPage {
    #[serde(skip)]
    dictionary: VariantsDictionary,
    correlations: IndexMap<u32, Vec<CorrelationEntry>>,
    page_number: u64,
    #[serde(skip)]
    cursor: PairwiseCursor,
    next: Option<String>,
    error: Option<ErrorKind>,
}

impl PairwiseResultPage {
    pub fn new() -> Self {
        PairwiseResultPage {
            dictionary: VariantsDictionary::new(),
            correlations: IndexMap::new(),
            page_number: 0,
            cursor: PairwiseCursor::start(),
            next: None,
            error: None,
        }
    }

    /// Construct a fresh page primed to continue from a previous call's
    /// cursor and page number — the shape a caller builds to fetch the
    /// next page of a query already in progress.
    pub fn resume_at(cursor: PairwiseCursor, page_number: u64) -> Self {
        let mut page = Self::new();
        page.cursor = cursor;
        page.page_number = page_number;
        page
    }

    pub fn is_terminal(&self) -> bool {
        self.cursor.last_i == -1 && self.cursor.last_j == -1 && self.page_number > 0
    }

    pub fn cursor(&self) -> PairwiseCursor {
        self.cursor
    }

    pub fn page_number(&self) -> u64 {
        self.page_number
    }

    pub fn dictionary(&self) -> &VariantsDictionary {
        &self.dictionary
    }

    pub fn dictionary_mut(&mut self) -> &mut VariantsDictionary {
        &mut self.dictionary
    }

    pub fn total_entries(&self) -> usize {
        self.correlations.values().map(|v| v.len()).sum()
    }

    /// Iterate `(first_id, second_id, value)` triples in emission order,
    /// for callers (JSON writers, tests) that need the flat entry list
    /// rather than the nested by-first-id map.
    pub fn iter_entries(&self) -> impl Iterator<Item = (u32, u32, Option<f64>)> + '_ {
        self.correlations.iter().flat_map(|(&first_id, entries)| {
            entries
                .iter()
                .map(move |e| (first_id, e.second_id, e.value))
        })
    }

    /// Append one entry, keyed by first-variant id; callers are
    /// responsible for feeding entries in Z-major, row-major order so
    /// each per-first-id list stays sorted by construction.
    pub fn push(&mut self, first_id: u32, second_id: u32, value: Option<f64>) {
        self.correlations
            .entry(first_id)
            .or_default()
            .push(CorrelationEntry { second_id, value });
    }

    pub fn set_cursor(&mut self, cursor: PairwiseCursor) {
        self.cursor = cursor;
        self.next = if self.is_terminal() {
            None
        } else {
            Some(cursor.encode(self.page_number + 1))
        };
    }

    pub fn finish(&mut self) {
        self.page_number += 1;
    }

    pub fn set_error(&mut self, kind: ErrorKind) {
        self.error = Some(kind);
        self.cursor = PairwiseCursor::terminal();
        self.next = None;
    }

    pub fn error(&self) -> Option<ErrorKind> {
        self.error
    }
}

/// Single-variant result page: same shape, but the first variant is fixed
/// so entries collapse to one list (spec.md §3).
#[derive(Debug, Default, Serialize)]
pub struct SingleVariantResultPage {
    #[serde(skip)]
    dictionary: VariantsDictionary,
    index_variant_id: Option<u32>,
    entries: Vec<CorrelationEntry>,
    page_number: u64,
    #[serde(skip)]
    cursor: (Option<u64>, i64),
    next: Option<String>,
    error: Option<ErrorKind>,
}

impl SingleVariantResultPage {
    pub fn new() -> Self {
        SingleVariantResultPage {
            dictionary: VariantsDictionary::new(),
            index_variant_id: None,
            entries: Vec::new(),
            page_number: 0,
            cursor: (None, -1),
            next: None,
            error: None,
        }
    }

    /// As [`PairwiseResultPage::resume_at`], for the single-variant shape.
    pub fn resume_at(last_cell_z: Option<u64>, last_j: i64, page_number: u64) -> Self {
        let mut page = Self::new();
        page.cursor = (last_cell_z, last_j);
        page.page_number = page_number;
        page
    }

    pub fn is_terminal(&self) -> bool {
        self.cursor.1 == -1 && self.page_number > 0
    }

    pub fn cursor(&self) -> (Option<u64>, i64) {
        self.cursor
    }

    pub fn page_number(&self) -> u64 {
        self.page_number
    }

    pub fn dictionary_mut(&mut self) -> &mut VariantsDictionary {
        &mut self.dictionary
    }

    pub fn set_index_variant(&mut self, id: u32) {
        self.index_variant_id = Some(id);
    }

    pub fn push(&mut self, second_id: u32, value: Option<f64>) {
        self.entries.push(CorrelationEntry { second_id, value });
    }

    pub fn set_cursor(&mut self, last_cell_z: Option<u64>, last_j: i64) {
        self.cursor = (last_cell_z, last_j);
        self.next = if self.is_terminal() {
            None
        } else {
            let z = last_cell_z.map(|z| z.to_string()).unwrap_or_else(|| "-".into());
            Some(format!("{z}:{last_j}:{}", self.page_number + 1))
        };
    }

    pub fn finish(&mut self) {
        self.page_number += 1;
    }

    pub fn set_error(&mut self, kind: ErrorKind) {
        self.error = Some(kind);
        self.cursor = (None, -1);
        self.next = None;
    }

    pub fn error(&self) -> Option<ErrorKind> {
        self.error
    }
}

/// Score page: spec.md §3's `(variant-id, score U, p-value,
/// alt-frequency, chromosome, position)` sequence, plus the scalar model
/// parameters attached per query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreEntry {
    pub variant: String,
    pub chromosome: String,
    pub position: u64,
    #[serde(serialize_with = "serialize_nullable_f64")]
    pub score_u: Option<f64>,
    #[serde(serialize_with = "serialize_nullable_f64")]
    pub pvalue: Option<f64>,
    pub alt_freq: f32,
}

#[derive(Debug, Default, Serialize)]
pub struct ScorePage {
    entries: Vec<ScoreEntry>,
    sigma2: f64,
    n_effective: u64,
    page_number: u64,
    #[serde(skip)]
    cursor: (i64, i64),
    next: Option<String>,
    error: Option<ErrorKind>,
}

impl ScorePage {
    pub fn new(sigma2: f64, n_effective: u64) -> Self {
        ScorePage {
            entries: Vec::new(),
            sigma2,
            n_effective,
            page_number: 0,
            cursor: (-1, -1),
            next: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.cursor == (-1, -1) && self.page_number > 0
    }

    pub fn push(&mut self, entry: ScoreEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ScoreEntry] {
        &self.entries
    }

    pub fn sigma2(&self) -> f64 {
        self.sigma2
    }

    pub fn n_effective(&self) -> u64 {
        self.n_effective
    }

    pub fn set_cursor(&mut self, last_segment_index: i64, last_within_segment_index: i64) {
        self.cursor = (last_segment_index, last_within_segment_index);
        self.next = if self.is_terminal() {
            None
        } else {
            Some(format!(
                "{}:{}:{}",
                last_segment_index,
                last_within_segment_index,
                self.page_number + 1
            ))
        };
    }

    pub fn finish(&mut self) {
        self.page_number += 1;
    }

    pub fn set_error(&mut self, kind: ErrorKind) {
        self.error = Some(kind);
        self.cursor = (-1, -1);
        self.next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cursor_round_trips_through_text_token() {
        let cursor = PairwiseCursor {
            last_cell_z: Some(42),
            last_i: 3,
            last_j: 7,
        };
        let token = cursor.encode(2);
        let (decoded, page_number) = PairwiseCursor::decode(&token).unwrap();
        assert_eq!(decoded, cursor);
        assert_eq!(page_number, 2);
    }

    #[test]
    fn fresh_page_is_not_terminal() {
        let page = PairwiseResultPage::new();
        assert!(!page.is_terminal());
    }

    #[test]
    fn terminal_sentinel_after_exhausting_last_page() {
        let mut page = PairwiseResultPage::new();
        page.finish();
        page.set_cursor(PairwiseCursor::terminal());
        assert!(page.is_terminal());
        assert_eq!(page.next, None);
    }

    #[test]
    fn variants_dictionary_assigns_dense_ids_in_first_seen_order() {
        let mut dict = VariantsDictionary::new();
        let a = VariantSite {
            chromosome: "1".into(),
            segment_start_bp: 0,
            column: 0,
        };
        let b = VariantSite {
            chromosome: "1".into(),
            segment_start_bp: 0,
            column: 1,
        };
        let id_a = dict.id_for(a.clone(), || VariantEntry {
            name: "a".into(),
            position: 1,
            alt_freq: 0.1,
        });
        let id_b = dict.id_for(b, || VariantEntry {
            name: "b".into(),
            position: 2,
            alt_freq: 0.2,
        });
        let id_a_again = dict.id_for(a, || panic!("should not re-resolve"));
        assert_eq!(id_a, 0);
        assert_eq!(id_b, 1);
        assert_eq!(id_a_again, id_a);
    }

    #[test]
    fn nan_score_serializes_as_json_null() {
        let entry = ScoreEntry {
            variant: "1:1_A/T".into(),
            chromosome: "1".into(),
            position: 1,
            score_u: Some(f64::NAN),
            pvalue: None,
            alt_freq: 0.0,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"score_u\":null"));
        assert!(json.contains("\"pvalue\":null"));
    }
}
