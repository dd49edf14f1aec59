//! Segment: the column-slice of genotypes for one fixed-width bucket of
//! base-pair positions on one chromosome, per spec.md §3 and §4.2.
//!
//! Grounded on `core/src/Segment.{h,cpp}` in the reference implementation.
//! The three storage disciplines from spec.md §4.2 are represented as one
//! enum rather than three dense matrix types the way the original keeps a
//! single `genotypes_store` tag and three parallel vectors — there is no
//! per-kind allocation policy to speak of, so a tagged enum keeps the
//! invariant "only one mode is alive at a time per segment" in the type.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::common::{OutputMode, StorageMode};
use crate::error::{Error, Result};

/// One variant site's sparse allele vector as returned by a
/// [`GenotypeSource`] scan, already restricted to the requested sample
/// subset.
#[derive(Debug, Clone)]
pub struct GenotypeRecord {
    pub position: u64,
    pub reference: String,
    pub alternate: String,
    /// `(row, value)` pairs for haplotypes/samples carrying a non-zero or
    /// missing value; `n_rows` is the total haplotype/sample count in this
    /// record, needed even when `values` is empty (monomorphic site).
    pub n_rows: u64,
    pub values: Vec<(u32, f32)>,
}

/// External collaborator contract (spec.md §6): opens a genotype file and
/// scans (chromosome, bp-range, sample-subset, output-mode) into a sequence
/// of per-site sparse allele vectors. No VCF/BCF/SAV parser lives behind
/// this trait in this crate; implementing one is explicitly out of scope
/// (spec.md §1).
pub trait GenotypeSource: Send + Sync {
    fn samples(&self) -> &[String];
    fn chromosomes(&self) -> Vec<String>;
    fn scan(
        &self,
        chromosome: &str,
        start_bp: u64,
        stop_bp: u64,
        sample_subset: &[String],
        mode: OutputMode,
    ) -> Result<Vec<GenotypeRecord>>;
}

/// CSC-style column storage shared by the all-ones and dosage-value
/// disciplines: `col_ptr[c]..col_ptr[c+1]` indexes into `row_idx` (and
/// `values`, for the dosage discipline) for column `c`. Row indices within
/// a column are strictly increasing, since they are appended in the scan
/// order a [`GenotypeSource`] returns them in.
#[derive(Debug, Clone, Default)]
struct Csc {
    col_ptr: Vec<u32>,
    row_idx: Vec<u32>,
    values: Vec<f32>,
    /// Per-column mean over non-missing entries; only meaningful for the
    /// dosage discipline (empty for all-ones).
    means: Vec<f64>,
    has_nans: bool,
}

impl Csc {
    fn rows(&self, col: usize) -> &[u32] {
        let from = self.col_ptr[col] as usize;
        let to = self.col_ptr[col + 1] as usize;
        &self.row_idx[from..to]
    }

    fn values_of(&self, col: usize) -> &[f32] {
        let from = self.col_ptr[col] as usize;
        let to = self.col_ptr[col + 1] as usize;
        &self.values[from..to]
    }
}

/// Per-column carrier sets for the approximate-r² discipline: a dense
/// bitset plus the sorted carrier list, so the kernel can iterate the
/// smaller of two columns and test membership in the other in O(1)
/// (spec.md §4.5).
#[derive(Debug, Clone, Default)]
struct BitsetColumns {
    n_rows: u64,
    carriers: Vec<Vec<u32>>,
    bitsets: Vec<Vec<bool>>,
}

#[derive(Debug, Clone)]
enum Storage {
    CscAllOnes(Csc),
    CscValues(Csc),
    BitsetCarriers(BitsetColumns),
}

/// A fixed-width bucket of base-pair positions on one chromosome, holding
/// variant identity (always, once loaded) and genotypes (only when the
/// traversal needs them — see spec.md §4.4's caching protocol).
#[derive(Debug, Clone)]
pub struct Segment {
    chromosome: String,
    start_bp: u64,
    stop_bp: u64,
    /// Matrix row count as the kernels see it: haplotype count for the
    /// haploid-split disciplines, sample count for additive dosage — see
    /// spec.md §3's definition, which this port follows literally (see
    /// DESIGN.md for why this departs from the reference implementation's
    /// internal bookkeeping).
    n_haplotypes: u64,
    names: Vec<String>,
    positions: Vec<u64>,
    freqs: Vec<f32>,
    storage: Option<Storage>,
    has_names: bool,
    has_genotypes: bool,
    cached: bool,
}

impl Segment {
    pub fn new(chromosome: impl Into<String>, start_bp: u64, stop_bp: u64) -> Self {
        Segment {
            chromosome: chromosome.into(),
            start_bp,
            stop_bp,
            n_haplotypes: 0,
            names: Vec::new(),
            positions: Vec::new(),
            freqs: Vec::new(),
            storage: None,
            has_names: false,
            has_genotypes: false,
            cached: false,
        }
    }

    pub fn chromosome(&self) -> &str {
        &self.chromosome
    }
    pub fn start_bp(&self) -> u64 {
        self.start_bp
    }
    pub fn stop_bp(&self) -> u64 {
        self.stop_bp
    }
    pub fn n_haplotypes(&self) -> u64 {
        self.n_haplotypes
    }
    pub fn n_variants(&self) -> usize {
        self.names.len()
    }
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
    pub fn has_names(&self) -> bool {
        self.has_names
    }
    pub fn has_genotypes(&self) -> bool {
        self.has_genotypes
    }
    pub fn is_cached(&self) -> bool {
        self.cached
    }
    pub fn set_cached(&mut self, cached: bool) {
        self.cached = cached;
    }

    pub fn name(&self, i: usize) -> &str {
        &self.names[i]
    }
    pub fn position(&self, i: usize) -> u64 {
        self.positions[i]
    }
    pub fn freq(&self, i: usize) -> f32 {
        self.freqs[i]
    }
    pub fn is_monomorphic(&self, i: usize) -> bool {
        self.freqs[i] == 0.0
    }
    pub fn has_nans(&self) -> bool {
        match &self.storage {
            Some(Storage::CscValues(csc)) => csc.has_nans,
            _ => false,
        }
    }
    pub fn mean(&self, i: usize) -> f64 {
        match &self.storage {
            Some(Storage::CscValues(csc)) => csc.means[i],
            _ => 0.0,
        }
    }

    /// Populate names, positions and genotypes by scanning `source` over
    /// `[start_bp, stop_bp]`. Sites whose non-zero allele count over the
    /// subset is zero are dropped from the name/position list (their
    /// would-be column index is never assigned), per spec.md §4.2.
    pub fn load_from_source(
        &mut self,
        source: &dyn GenotypeSource,
        sample_subset: &[String],
        mode: OutputMode,
        storage_mode: StorageMode,
    ) -> Result<()> {
        let records = source.scan(
            &self.chromosome,
            self.start_bp,
            self.stop_bp,
            sample_subset,
            mode,
        )?;
        self.ingest(&records, storage_mode, true)
    }

    /// As [`Segment::load_from_source`], but discards genotype values and
    /// keeps only names/positions — the form stored in the cache.
    pub fn load_names_only(
        &mut self,
        source: &dyn GenotypeSource,
        sample_subset: &[String],
        mode: OutputMode,
    ) -> Result<()> {
        let records = source.scan(
            &self.chromosome,
            self.start_bp,
            self.stop_bp,
            sample_subset,
            mode,
        )?;
        for record in &records {
            if record.values.is_empty() {
                continue;
            }
            self.names.push(format!(
                "{}:{}_{}/{}",
                self.chromosome, record.position, record.reference, record.alternate
            ));
            self.positions.push(record.position);
        }
        self.validate_position_order()?;
        self.has_names = true;
        Ok(())
    }

    /// Add genotypes to a segment whose names were already loaded (from
    /// cache), matching sites by position/order. The caller must scan the
    /// identical region so record order lines up with the cached names.
    pub fn load_genotypes(
        &mut self,
        source: &dyn GenotypeSource,
        sample_subset: &[String],
        mode: OutputMode,
        storage_mode: StorageMode,
    ) -> Result<()> {
        let records = source.scan(
            &self.chromosome,
            self.start_bp,
            self.stop_bp,
            sample_subset,
            mode,
        )?;
        self.ingest_genotypes_only(&records, storage_mode)
    }

    fn validate_position_order(&self) -> Result<()> {
        if self
            .positions
            .windows(2)
            .any(|w| w[0] > w[1])
        {
            return Err(Error::ConsistencyViolation(format!(
                "segment {}:{}-{} positions are not non-decreasing",
                self.chromosome, self.start_bp, self.stop_bp
            )));
        }
        Ok(())
    }

    fn ingest(
        &mut self,
        records: &[GenotypeRecord],
        storage_mode: StorageMode,
        with_names: bool,
    ) -> Result<()> {
        let kept: Vec<&GenotypeRecord> = records.iter().filter(|r| !r.values.is_empty()).collect();
        if let Some(first) = kept.first() {
            self.n_haplotypes = first.n_rows;
        }

        if with_names {
            for record in &kept {
                self.names.push(format!(
                    "{}:{}_{}/{}",
                    self.chromosome, record.position, record.reference, record.alternate
                ));
                self.positions.push(record.position);
            }
            self.validate_position_order()?;
            self.has_names = true;
        }

        self.build_storage(&kept, storage_mode)?;
        self.has_genotypes = true;
        Ok(())
    }

    fn ingest_genotypes_only(
        &mut self,
        records: &[GenotypeRecord],
        storage_mode: StorageMode,
    ) -> Result<()> {
        let kept: Vec<&GenotypeRecord> = records.iter().filter(|r| !r.values.is_empty()).collect();
        if kept.len() != self.names.len() {
            return Err(Error::ConsistencyViolation(format!(
                "genotype scan for segment {}:{}-{} returned {} sites, expected {} from cached names",
                self.chromosome,
                self.start_bp,
                self.stop_bp,
                kept.len(),
                self.names.len()
            )));
        }
        if let Some(first) = kept.first() {
            self.n_haplotypes = first.n_rows;
        }
        self.build_storage(&kept, storage_mode)?;
        self.has_genotypes = true;
        Ok(())
    }

    fn build_storage(&mut self, kept: &[&GenotypeRecord], storage_mode: StorageMode) -> Result<()> {
        self.freqs = Vec::with_capacity(kept.len());
        match storage_mode {
            StorageMode::CscAllOnes => {
                let mut csc = Csc::default();
                csc.col_ptr.push(0);
                for record in kept {
                    let mut rows: Vec<u32> = record.values.iter().map(|(r, _)| *r).collect();
                    rows.sort_unstable();
                    self.freqs
                        .push(rows.len() as f32 / record.n_rows.max(1) as f32);
                    csc.row_idx.extend_from_slice(&rows);
                    csc.col_ptr.push(csc.row_idx.len() as u32);
                }
                self.storage = Some(Storage::CscAllOnes(csc));
            }
            StorageMode::CscValues => {
                let mut csc = Csc::default();
                csc.col_ptr.push(0);
                for record in kept {
                    let mut pairs = record.values.clone();
                    pairs.sort_unstable_by_key(|(r, _)| *r);
                    let mut sum = 0.0f64;
                    let mut count_non_missing = 0u64;
                    for (_, v) in &pairs {
                        if !v.is_nan() {
                            sum += *v as f64;
                            count_non_missing += 1;
                        } else {
                            csc.has_nans = true;
                        }
                    }
                    let mean = if count_non_missing > 0 {
                        sum / count_non_missing as f64
                    } else {
                        0.0
                    };
                    // Allele frequency over the whole column, additive
                    // dosage / 2 per non-missing sample.
                    let freq = if count_non_missing > 0 {
                        (sum / 2.0) / count_non_missing as f64
                    } else {
                        0.0
                    };
                    self.freqs.push(freq as f32);
                    csc.means.push(mean);
                    for (r, v) in &pairs {
                        csc.row_idx.push(*r);
                        csc.values.push(*v);
                    }
                    csc.col_ptr.push(csc.row_idx.len() as u32);
                }
                self.storage = Some(Storage::CscValues(csc));
            }
            StorageMode::BitsetCarriers => {
                let n_rows = kept.first().map(|r| r.n_rows).unwrap_or(0);
                let mut columns = BitsetColumns {
                    n_rows,
                    carriers: Vec::with_capacity(kept.len()),
                    bitsets: Vec::with_capacity(kept.len()),
                };
                for record in kept {
                    let mut rows: Vec<u32> = record.values.iter().map(|(r, _)| *r).collect();
                    rows.sort_unstable();
                    self.freqs
                        .push(rows.len() as f32 / n_rows.max(1) as f32);
                    let mut bits = vec![false; n_rows as usize];
                    for &r in &rows {
                        bits[r as usize] = true;
                    }
                    columns.carriers.push(rows);
                    columns.bitsets.push(bits);
                }
                self.storage = Some(Storage::BitsetCarriers(columns));
            }
        }
        Ok(())
    }

    /// Half-open column index interval `[i_from, i_to)` whose positions lie
    /// in `[range_start_bp, range_stop_bp]`, or `None` if the segment is
    /// empty or the range misses it entirely.
    pub fn overlaps_range(&self, range_start_bp: u64, range_stop_bp: u64) -> Option<(usize, usize)> {
        if self.positions.is_empty() {
            return None;
        }
        let from = if range_start_bp > self.start_bp && range_start_bp <= self.stop_bp {
            self.positions.partition_point(|&p| p < range_start_bp)
        } else {
            0
        };
        if from >= self.positions.len() {
            return None;
        }
        let to = if range_stop_bp > self.start_bp && range_stop_bp <= self.stop_bp {
            self.positions.partition_point(|&p| p <= range_stop_bp)
        } else {
            self.positions.len()
        };
        if to <= from {
            return None;
        }
        Some((from, to))
    }

    /// Linear scan forward from `lower_bound(bp)` for the column whose
    /// position equals `bp` and whose name matches.
    pub fn locate_variant(&self, name: &str, bp: u64) -> Option<usize> {
        let mut idx = self.positions.partition_point(|&p| p < bp);
        while idx < self.positions.len() && self.positions[idx] == bp {
            if self.names[idx] == name {
                return Some(idx);
            }
            idx += 1;
        }
        None
    }

    fn csc_all_ones(&self) -> Option<&Csc> {
        match &self.storage {
            Some(Storage::CscAllOnes(csc)) => Some(csc),
            _ => None,
        }
    }

    fn csc_values(&self) -> Option<&Csc> {
        match &self.storage {
            Some(Storage::CscValues(csc)) => Some(csc),
            _ => None,
        }
    }

    fn bitset_columns(&self) -> Option<&BitsetColumns> {
        match &self.storage {
            Some(Storage::BitsetCarriers(cols)) => Some(cols),
            _ => None,
        }
    }

    /// Row indices carrying the alternate allele for column `col`, under
    /// the all-ones discipline.
    pub(crate) fn carrier_rows(&self, col: usize) -> &[u32] {
        self.csc_all_ones()
            .map(|csc| csc.rows(col))
            .unwrap_or(&[])
    }

    /// Dense mean-centered (and, if the segment has missingness,
    /// mean-imputed) column for the covariance discipline.
    pub(crate) fn centered_dosage_column(&self, col: usize, force_center: bool) -> Vec<f32> {
        let csc = self
            .csc_values()
            .expect("centered_dosage_column requires CscValues storage");
        let n = self.n_haplotypes as usize;
        let mut out = vec![0.0f32; n];
        let rows = csc.rows(col);
        let values = csc.values_of(col);
        for (&r, &v) in rows.iter().zip(values.iter()) {
            out[r as usize] = v;
        }
        if csc.has_nans || force_center {
            let mean = csc.means[col];
            for value in out.iter_mut() {
                *value = if value.is_nan() {
                    0.0
                } else {
                    (*value as f64 - mean) as f32
                };
            }
        }
        out
    }

    pub(crate) fn bitset_carriers(&self, col: usize) -> (&[u32], &[bool]) {
        let cols = self
            .bitset_columns()
            .expect("bitset_carriers requires BitsetCarriers storage");
        (&cols.carriers[col], &cols.bitsets[col])
    }

    /// Binary wire form for the cache: `n_haplotypes`, names, positions —
    /// never genotypes (spec.md §4.2, §6).
    pub fn serialize_names<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.n_haplotypes)?;
        writer.write_u32::<LittleEndian>(self.names.len() as u32)?;
        for name in &self.names {
            let bytes = name.as_bytes();
            writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
            writer.write_all(bytes)?;
        }
        for &pos in &self.positions {
            writer.write_u64::<LittleEndian>(pos)?;
        }
        Ok(())
    }

    pub fn deserialize_names<R: Read>(
        reader: &mut R,
        chromosome: impl Into<String>,
        start_bp: u64,
        stop_bp: u64,
    ) -> io::Result<Self> {
        let n_haplotypes = reader.read_u64::<LittleEndian>()?;
        let n_names = reader.read_u32::<LittleEndian>()? as usize;
        let mut names = Vec::with_capacity(n_names);
        for _ in 0..n_names {
            let len = reader.read_u32::<LittleEndian>()? as usize;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf)?;
            names.push(String::from_utf8(buf).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, e.to_string())
            })?);
        }
        let mut positions = Vec::with_capacity(n_names);
        for _ in 0..n_names {
            positions.push(reader.read_u64::<LittleEndian>()?);
        }
        let has_names = !names.is_empty() || n_names == 0;
        Ok(Segment {
            chromosome: chromosome.into(),
            start_bp,
            stop_bp,
            n_haplotypes,
            freqs: vec![0.0; names.len()],
            names,
            positions,
            storage: None,
            has_names,
            has_genotypes: false,
            cached: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rec(pos: u64, rows: &[u32], n_rows: u64) -> GenotypeRecord {
        GenotypeRecord {
            position: pos,
            reference: "A".into(),
            alternate: "T".into(),
            n_rows,
            values: rows.iter().map(|&r| (r, 1.0)).collect(),
        }
    }

    #[test]
    fn load_drops_monomorphic_sites_from_name_list() {
        let records = vec![rec(100, &[0, 2], 4), rec(110, &[], 4), rec(120, &[1], 4)];
        let mut seg = Segment::new("1", 100, 199);
        seg.ingest(&records, StorageMode::CscAllOnes, true).unwrap();
        assert_eq!(seg.n_variants(), 2);
        assert_eq!(seg.position(0), 100);
        assert_eq!(seg.position(1), 120);
    }

    #[test]
    fn overlaps_range_half_open_interval() {
        let records = vec![rec(100, &[0], 4), rec(150, &[1], 4), rec(199, &[0, 1], 4)];
        let mut seg = Segment::new("1", 100, 199);
        seg.ingest(&records, StorageMode::CscAllOnes, true).unwrap();
        assert_eq!(seg.overlaps_range(100, 199), Some((0, 3)));
        assert_eq!(seg.overlaps_range(150, 199), Some((1, 3)));
        assert_eq!(seg.overlaps_range(200, 299), None);
    }

    #[test]
    fn locate_variant_scans_forward_from_lower_bound() {
        let records = vec![rec(100, &[0], 4), rec(100, &[1], 4), rec(110, &[0], 4)];
        let mut seg = Segment::new("1", 100, 199);
        seg.ingest(&records, StorageMode::CscAllOnes, true).unwrap();
        let name_at_1 = seg.name(1).to_string();
        assert_eq!(seg.locate_variant(&name_at_1, 100), Some(1));
        assert_eq!(seg.locate_variant("1:100_A/T_nonexistent", 100), None);
    }

    #[test]
    fn names_serialize_round_trip() {
        let records = vec![rec(100, &[0, 1], 4), rec(150, &[2], 4)];
        let mut seg = Segment::new("22", 100, 199);
        seg.ingest(&records, StorageMode::CscAllOnes, true).unwrap();

        let mut buf = Vec::new();
        seg.serialize_names(&mut buf).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let restored = Segment::deserialize_names(&mut cursor, "22", 100, 199).unwrap();

        assert_eq!(restored.n_haplotypes(), seg.n_haplotypes());
        assert_eq!(restored.n_variants(), seg.n_variants());
        for i in 0..seg.n_variants() {
            assert_eq!(restored.name(i), seg.name(i));
            assert_eq!(restored.position(i), seg.position(i));
        }
        assert!(restored.has_names());
        assert!(!restored.has_genotypes());
    }

    #[test]
    fn out_of_order_positions_are_rejected() {
        let records = vec![rec(150, &[0], 4), rec(100, &[1], 4)];
        let mut seg = Segment::new("1", 100, 199);
        let err = seg.ingest(&records, StorageMode::CscAllOnes, true).unwrap_err();
        assert!(matches!(err, Error::ConsistencyViolation(_)));
    }

    #[test]
    fn covariance_column_mean_imputes_missing() {
        let mut rec_nan = GenotypeRecord {
            position: 100,
            reference: "A".into(),
            alternate: "T".into(),
            n_rows: 4,
            values: vec![(0, 2.0), (1, f32::NAN), (2, 0.0)],
        };
        rec_nan.values.sort_by_key(|(r, _)| *r);
        let mut seg = Segment::new("1", 100, 199);
        seg.ingest(&[rec_nan], StorageMode::CscValues, true).unwrap();
        assert!(seg.has_nans());
        // mean over non-missing {2.0, 0.0} at rows 0,2 = 1.0 (row 3 implicit 0 non-missing too)
        let col = seg.centered_dosage_column(0, false);
        assert_eq!(col.len(), 4);
        assert!((col[1] - 0.0).abs() < 1e-9); // imputed to mean -> centered to 0
        assert!((col[0] - (2.0 - seg.mean(0) as f32)).abs() < 1e-6);
    }
}
