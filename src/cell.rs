//! Cell: the pairwise statistic matrix for one (segment_i, segment_j) pair,
//! i <= j, per spec.md §3 and §4.3.
//!
//! Grounded on `core/src/Cell.cpp`'s four `compute()` kernels (r, r²,
//! covariance, approximate r²) and its two `extract()` overloads (region
//! paging, single-variant paging). Kept as one type with a `StatKind`-tagged
//! `compute`, per spec.md §9's note that the reference's four Cell
//! subclasses collapse into one dispatch in an idiomatic port.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::common::StatKind;
use crate::error::{Error, Result};
use crate::segment::Segment;

/// One page-worthy value out of a cell: the pair of column indices (within
/// their respective segments) and the computed statistic, or `None` when
/// the kernel reports it as a degenerate value (spec.md §4.5: for example,
/// both columns monomorphic).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellValue {
    pub i: u32,
    pub j: u32,
    pub value: Option<f64>,
}

/// Dense `n_i x n_j` statistic matrix for a segment pair.
#[derive(Debug, Clone)]
pub struct Cell {
    i_start_bp: u64,
    j_start_bp: u64,
    kind: StatKind,
    n_i: usize,
    n_j: usize,
    /// Row-major `n_i x n_j`; `None` marks a degenerate (monomorphic or
    /// otherwise undefined) pair.
    values: Vec<Option<f64>>,
    computed: bool,
}

impl Cell {
    pub fn new(i_start_bp: u64, j_start_bp: u64, kind: StatKind) -> Self {
        Cell {
            i_start_bp,
            j_start_bp,
            kind,
            n_i: 0,
            n_j: 0,
            values: Vec::new(),
            computed: false,
        }
    }

    pub fn i_start_bp(&self) -> u64 {
        self.i_start_bp
    }
    pub fn j_start_bp(&self) -> u64 {
        self.j_start_bp
    }
    pub fn kind(&self) -> StatKind {
        self.kind
    }
    pub fn is_computed(&self) -> bool {
        self.computed
    }
    pub fn is_diagonal(&self) -> bool {
        self.i_start_bp == self.j_start_bp
    }

    fn index(&self, i: usize, j: usize) -> usize {
        i * self.n_j + j
    }

    pub fn value(&self, i: usize, j: usize) -> Option<f64> {
        self.values[self.index(i, j)]
    }

    /// Fill the matrix from two loaded segments, dispatching on `self.kind`,
    /// per spec.md §4.5. `segment_i` and `segment_j` may be the same segment
    /// (diagonal cell); in that case only the upper triangle `i <= j` is
    /// meaningful, matching the Z-walk's upper-triangle-only traversal.
    pub fn compute(&mut self, segment_i: &Segment, segment_j: &Segment) -> Result<()> {
        self.n_i = segment_i.n_variants();
        self.n_j = segment_j.n_variants();
        self.values = vec![None; self.n_i * self.n_j];

        match self.kind {
            StatKind::R => self.compute_r(segment_i, segment_j, false)?,
            StatKind::RSquare => self.compute_r(segment_i, segment_j, true)?,
            StatKind::Cov => self.compute_cov(segment_i, segment_j)?,
            StatKind::RSquareApprox => self.compute_rsquare_approx(segment_i, segment_j)?,
        }
        self.computed = true;
        Ok(())
    }

    /// r and r² share the same carrier-intersection kernel; squaring is a
    /// cheap post-step so both live in one pass over the matrix.
    fn compute_r(&mut self, segment_i: &Segment, segment_j: &Segment, square: bool) -> Result<()> {
        let n_hap = segment_i.n_haplotypes() as f64;
        if segment_j.n_haplotypes() != segment_i.n_haplotypes() as u64 {
            return Err(Error::ConsistencyViolation(format!(
                "segment pair haplotype counts differ: {} vs {}",
                segment_i.n_haplotypes(),
                segment_j.n_haplotypes()
            )));
        }
        let same = std::ptr::eq(segment_i, segment_j);
        for i in 0..self.n_i {
            let start_j = if same { i } else { 0 };
            if segment_i.is_monomorphic(i) {
                continue;
            }
            let rows_i = segment_i.carrier_rows(i);
            let freq_i = segment_i.freq(i) as f64;
            for j in start_j..self.n_j {
                if segment_j.is_monomorphic(j) {
                    continue;
                }
                let rows_j = segment_j.carrier_rows(j);
                let freq_j = segment_j.freq(j) as f64;
                let both = intersection_count(rows_i, rows_j) as f64;
                let pab = both / n_hap;
                let denom = (freq_i * (1.0 - freq_i) * freq_j * (1.0 - freq_j)).sqrt();
                let r = if denom > 0.0 {
                    Some((pab - freq_i * freq_j) / denom)
                } else {
                    None
                };
                let value = r.map(|r| if square { r * r } else { r });
                let idx = self.index(i, j);
                self.values[idx] = value;
            }
        }
        Ok(())
    }

    fn compute_cov(&mut self, segment_i: &Segment, segment_j: &Segment) -> Result<()> {
        let n = segment_i.n_haplotypes();
        if segment_j.n_haplotypes() != n {
            return Err(Error::ConsistencyViolation(format!(
                "segment pair sample counts differ: {} vs {}",
                n,
                segment_j.n_haplotypes()
            )));
        }
        let has_missing = segment_i.has_nans() || segment_j.has_nans();
        let same = std::ptr::eq(segment_i, segment_j);
        for i in 0..self.n_i {
            let mono_i = segment_i.is_monomorphic(i);
            let col_i = if mono_i {
                None
            } else {
                Some(segment_i.centered_dosage_column(i, has_missing))
            };
            let freq_i = segment_i.freq(i) as f64;
            let start_j = if same { i } else { 0 };
            for j in start_j..self.n_j {
                let idx = self.index(i, j);
                if mono_i || segment_j.is_monomorphic(j) {
                    // Covariance of a monomorphic column is zero, distinct
                    // from r/r²'s NaN-on-monomorphic policy above.
                    self.values[idx] = Some(0.0);
                    continue;
                }
                let col_i_ref = col_i.as_ref().unwrap();
                let col_j = if same && i == j {
                    None
                } else {
                    Some(segment_j.centered_dosage_column(j, has_missing))
                };
                let col_j_ref: &[f32] = col_j.as_deref().unwrap_or(col_i_ref);
                let mut sum = 0.0f64;
                let n_rows = col_i_ref.len().min(col_j_ref.len());
                for row in 0..n_rows {
                    sum += col_i_ref[row] as f64 * col_j_ref[row] as f64;
                }
                let denom = n_rows.max(1) as f64;
                let cov = sum / denom;
                let freq_j = segment_j.freq(j) as f64;
                let flip = (freq_i > 0.5) ^ (freq_j > 0.5);
                self.values[idx] = Some(if flip { -cov } else { cov });
            }
        }
        Ok(())
    }

    /// Approximate r² over carrier sets without the full phased-haplotype
    /// accounting the exact kernel does: iterate the smaller carrier set,
    /// test membership in the other's bitset, per spec.md §4.5.
    fn compute_rsquare_approx(&mut self, segment_i: &Segment, segment_j: &Segment) -> Result<()> {
        let n_hap = segment_i.n_haplotypes() as f64;
        let same = std::ptr::eq(segment_i, segment_j);
        for i in 0..self.n_i {
            if segment_i.is_monomorphic(i) {
                continue;
            }
            let (carriers_i, _bits_i) = segment_i.bitset_carriers(i);
            let freq_i = segment_i.freq(i) as f64;
            let start_j = if same { i } else { 0 };
            for j in start_j..self.n_j {
                if segment_j.is_monomorphic(j) {
                    continue;
                }
                let (carriers_j, bits_j) = segment_j.bitset_carriers(j);
                let freq_j = segment_j.freq(j) as f64;
                let both = if carriers_i.len() <= carriers_j.len() {
                    carriers_i
                        .iter()
                        .filter(|&&r| (r as usize) < bits_j.len() && bits_j[r as usize])
                        .count()
                } else {
                    let (_bits_i_unused, bits_i) = segment_i.bitset_carriers(i);
                    carriers_j
                        .iter()
                        .filter(|&&r| (r as usize) < bits_i.len() && bits_i[r as usize])
                        .count()
                } as f64;
                let pab = both / n_hap;
                let denom = (freq_i * (1.0 - freq_i) * freq_j * (1.0 - freq_j)).sqrt();
                let idx = self.index(i, j);
                self.values[idx] = if denom > 0.0 {
                    let r = (pab - freq_i * freq_j) / denom;
                    Some(r * r)
                } else {
                    None
                };
            }
        }
        Ok(())
    }

    /// Page out values for the column-index rectangle `[i_from, i_to) x
    /// [j_from, j_to)`, honoring a `(last_i, last_j)` resume cursor and a
    /// page size limit, per `Cell::extract`'s region overload.
    pub fn extract_region(
        &self,
        i_from: usize,
        i_to: usize,
        j_from: usize,
        j_to: usize,
        cursor: Option<(usize, usize)>,
        limit: usize,
    ) -> (Vec<CellValue>, Option<(usize, usize)>) {
        let mut out = Vec::with_capacity(limit.min(self.n_i * self.n_j));
        let same_diag = self.is_diagonal();
        let mut resumed = cursor.is_none();
        for i in i_from..i_to {
            for j in j_from..j_to {
                if same_diag && j < i {
                    continue;
                }
                if !resumed {
                    if let Some((ci, cj)) = cursor {
                        if (i, j) == (ci, cj) {
                            resumed = true;
                        }
                        continue;
                    }
                }
                if out.len() == limit {
                    return (out, Some((i, j)));
                }
                out.push(CellValue {
                    i: i as u32,
                    j: j as u32,
                    value: self.value(i, j),
                });
            }
        }
        (out, None)
    }

    /// Page out values touching a single fixed column `index` (the column
    /// owned by the query's anchor variant) across `[lo, hi)` in the other
    /// dimension, matching `Cell::extract`'s single-variant overload.
    pub fn extract_single_variant(
        &self,
        fixed_is_i: bool,
        index: usize,
        lo: usize,
        hi: usize,
        cursor: Option<usize>,
        limit: usize,
    ) -> (Vec<CellValue>, Option<usize>) {
        let mut out = Vec::with_capacity(limit.min(hi.saturating_sub(lo)));
        let mut resumed = cursor.is_none();
        for other in lo..hi {
            if !resumed {
                if cursor == Some(other) {
                    resumed = true;
                }
                continue;
            }
            if out.len() == limit {
                return (out, Some(other));
            }
            let (i, j) = if fixed_is_i { (index, other) } else { (other, index) };
            out.push(CellValue {
                i: i as u32,
                j: j as u32,
                value: self.value(i, j),
            });
        }
        (out, None)
    }

    /// Binary wire form for the cache (spec.md §4.4): dimensions, then
    /// row-major values with a sentinel NaN for `None`.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.n_i as u32)?;
        writer.write_u32::<LittleEndian>(self.n_j as u32)?;
        for value in &self.values {
            writer.write_f64::<LittleEndian>(value.unwrap_or(f64::NAN))?;
        }
        Ok(())
    }

    pub fn deserialize<R: Read>(
        reader: &mut R,
        i_start_bp: u64,
        j_start_bp: u64,
        kind: StatKind,
    ) -> io::Result<Self> {
        let n_i = reader.read_u32::<LittleEndian>()? as usize;
        let n_j = reader.read_u32::<LittleEndian>()? as usize;
        let mut values = Vec::with_capacity(n_i * n_j);
        for _ in 0..(n_i * n_j) {
            let raw = reader.read_f64::<LittleEndian>()?;
            values.push(if raw.is_nan() { None } else { Some(raw) });
        }
        Ok(Cell {
            i_start_bp,
            j_start_bp,
            kind,
            n_i,
            n_j,
            values,
            computed: true,
        })
    }
}

/// Two-pointer merge over sorted carrier-row lists; both `Segment` storage
/// disciplines keep rows strictly increasing within a column.
fn intersection_count(a: &[u32], b: &[u32]) -> usize {
    let (mut pa, mut pb) = (0usize, 0usize);
    let mut count = 0usize;
    while pa < a.len() && pb < b.len() {
        match a[pa].cmp(&b[pb]) {
            std::cmp::Ordering::Less => pa += 1,
            std::cmp::Ordering::Greater => pb += 1,
            std::cmp::Ordering::Equal => {
                count += 1;
                pa += 1;
                pb += 1;
            }
        }
    }
    count
}
