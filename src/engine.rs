//! Engine: drives region and single-variant queries by walking cells in
//! Z-order, applying the caching protocol, and streaming results into a
//! page, per spec.md §4.4 and §4.6.
//!
//! Grounded on `core/src/LDServer.cpp`'s `compute_region_ld`/`load_segment`
//! and their cache-key builders; the reference's shared-pointer segment
//! ownership becomes an in-traversal arena here (spec.md §9's explicit
//! re-architecture hint).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::cache::{cell_key, segment_key, Cache};
use crate::cell::Cell;
use crate::common::{OutputMode, StatKind};
use crate::error::{Error, ErrorKind, Result};
use crate::morton::{decode, encode, next_z, next_z_single_variant};
use crate::paging::{PairwiseCursor, PairwiseResultPage, SingleVariantResultPage, VariantEntry, VariantSite};
use crate::segment::{GenotypeSource, Segment};

/// Cooperative cancel flag checked at each cell boundary (spec.md §5).
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag(Arc::new(AtomicBool::new(false)))
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct CacheHandle {
    dataset_fingerprint: u32,
    cache: Arc<dyn Cache>,
}

/// Owns the map from chromosome to genotype source, the map from
/// sample-subset name to sample list, the segment width, and the optional
/// cache handle (spec.md §2, §6).
pub struct Engine {
    sources: HashMap<String, Box<dyn GenotypeSource>>,
    subsets: HashMap<String, Vec<String>>,
    all_samples: Option<Vec<String>>,
    segment_width: u64,
    cache: Option<CacheHandle>,
    admitted_segments: Option<Vec<u64>>,
}

impl Engine {
    pub fn new(segment_width: u64) -> Result<Self> {
        if segment_width == 0 {
            return Err(Error::InvalidArgument(
                "segment width must be positive".into(),
            ));
        }
        Ok(Engine {
            sources: HashMap::new(),
            subsets: HashMap::new(),
            all_samples: None,
            segment_width,
            cache: None,
            admitted_segments: None,
        })
    }

    pub fn set_genotype_source(&mut self, chromosome: impl Into<String>, source: Box<dyn GenotypeSource>) -> Result<()> {
        let samples = source.samples().to_vec();
        match &self.all_samples {
            None => {
                self.all_samples = Some(samples.clone());
                self.subsets.insert("ALL".to_string(), samples);
            }
            Some(existing) => {
                if existing != &samples {
                    return Err(Error::ConsistencyViolation(
                        "genotype source sample list differs from the ALL subset".into(),
                    ));
                }
            }
        }
        self.sources.insert(chromosome.into(), source);
        Ok(())
    }

    pub fn set_sample_subset(&mut self, name: impl Into<String>, samples: Vec<String>) {
        self.subsets.insert(name.into(), samples);
    }

    pub fn enable_cache(&mut self, dataset_fingerprint: u32, cache: Arc<dyn Cache>) {
        self.cache = Some(CacheHandle {
            dataset_fingerprint,
            cache,
        });
    }

    pub fn disable_cache(&mut self) {
        self.cache = None;
    }

    /// Narrow subsequent `compute_region` calls to segments touching at
    /// least one admitted position; cleared between queries (spec.md §6).
    pub fn add_admitted_segment(&mut self, bp_position: u64) {
        let idx = bp_position / self.segment_width;
        self.admitted_segments.get_or_insert_with(Vec::new).push(idx);
    }

    pub fn clear_admitted_segments(&mut self) {
        self.admitted_segments = None;
    }

    fn segment_index(&self, bp: u64) -> u64 {
        bp / self.segment_width
    }

    fn segment_bounds(&self, index: u64) -> (u64, u64) {
        let start = index * self.segment_width;
        (start, start + self.segment_width - 1)
    }

    fn resolve_subset<'a>(&'a self, name: &str) -> Result<&'a [String]> {
        self.subsets
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| Error::InvalidArgument(format!("unknown sample subset: {name}")))
    }

    fn resolve_source(&self, chromosome: &str) -> Result<&dyn GenotypeSource> {
        self.sources
            .get(chromosome)
            .map(|b| b.as_ref())
            .ok_or_else(|| Error::InvalidArgument(format!("unknown chromosome: {chromosome}")))
    }

    /// Load or fetch segment `index` into `arena`, applying steps 1–3 of
    /// the caching protocol (spec.md §4.4). `names_only` picks between
    /// loading just names (cache-hit path) or names+genotypes.
    fn admit_segment(
        &self,
        arena: &mut HashMap<u64, Segment>,
        chromosome: &str,
        index: u64,
        subset_name: &str,
        mode: OutputMode,
        storage_mode: crate::common::StorageMode,
        names_only: bool,
    ) -> Result<()> {
        if arena.contains_key(&index) {
            return Ok(());
        }
        let (start_bp, stop_bp) = self.segment_bounds(index);
        let source = self.resolve_source(chromosome)?;
        let subset = self.resolve_subset(subset_name)?;

        let mut segment = Segment::new(chromosome, start_bp, stop_bp);
        let mut cached = false;

        if let Some(handle) = &self.cache {
            let key = segment_key(handle.dataset_fingerprint, subset_name, chromosome, start_bp, stop_bp);
            // A cache I/O error degrades to a miss rather than aborting the
            // query (spec.md §7); only a corrupt hit is a hard error.
            if let Some(bytes) = handle.cache.get(&key).unwrap_or(None) {
                let mut cursor = std::io::Cursor::new(bytes);
                segment = Segment::deserialize_names(&mut cursor, chromosome, start_bp, stop_bp)
                    .map_err(|e| Error::ConsistencyViolation(format!("corrupt cached segment blob: {e}")))?;
                cached = true;
            }
        }

        if cached {
            if !names_only {
                trace!(chromosome, index, "loading genotypes for cache-hit segment");
                segment.load_genotypes(source, subset, mode, storage_mode)?;
            }
        } else {
            debug!(chromosome, index, names_only, "loading segment from source");
            if names_only {
                segment.load_names_only(source, subset, mode)?;
            } else {
                segment.load_from_source(source, subset, mode, storage_mode)?;
            }
            if let Some(handle) = &self.cache {
                let key = segment_key(handle.dataset_fingerprint, subset_name, chromosome, start_bp, stop_bp);
                let mut buf = Vec::new();
                segment.serialize_names(&mut buf)?;
                let _ = handle.cache.set(&key, &buf);
            }
        }
        segment.set_cached(cached);
        arena.insert(index, segment);
        Ok(())
    }

    /// Region query over `[start_bp, stop_bp]` (spec.md §4.6).
    #[allow(clippy::too_many_arguments)]
    pub fn compute_region(
        &self,
        chromosome: &str,
        start_bp: u64,
        stop_bp: u64,
        statistic: StatKind,
        subset_name: &str,
        page: &mut PairwiseResultPage,
        include_diagonal: bool,
        limit: usize,
        cancel: &CancelFlag,
        mut out_segments: Option<&mut Vec<Segment>>,
    ) -> Result<()> {
        if page.is_terminal() {
            return Err(Error::InvalidArgument(
                "compute_region called on a terminal page".into(),
            ));
        }
        if start_bp > stop_bp {
            page.set_error(ErrorKind::InvalidArgument);
            return Ok(());
        }
        if !self.sources.contains_key(chromosome) || !self.subsets.contains_key(subset_name) {
            page.set_error(ErrorKind::InvalidArgument);
            return Ok(());
        }

        let segment_i = self.segment_index(start_bp);
        let segment_j = self.segment_index(stop_bp);
        let z_min = encode(segment_i, segment_i);
        let z_max = encode(segment_j, segment_j);

        let cursor = page.cursor();
        let mut z = cursor.last_cell_z.filter(|&z| z > z_min).unwrap_or(z_min);
        let mut resume_ij: Option<(usize, usize)> = if cursor.last_i >= 0 && cursor.last_j >= 0 {
            Some((cursor.last_i as usize, cursor.last_j as usize))
        } else {
            None
        };

        let restricted: Option<Vec<u64>> = self.admitted_segments.as_ref().map(|set| {
            let mut zs: Vec<u64> = set
                .iter()
                .flat_map(|&a| set.iter().map(move |&b| (a.min(b), a.max(b))))
                .map(|(a, b)| encode(a, b))
                .filter(|&z_cand| z_cand >= z)
                .collect();
            zs.sort_unstable();
            zs.dedup();
            zs
        });
        let mut restricted_iter = restricted.map(|v| v.into_iter());

        let mut arena: HashMap<u64, Segment> = HashMap::new();
        let mut touched_order: Vec<u64> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                page.set_error(ErrorKind::Cancelled);
                return Ok(());
            }
            if z > z_max {
                break;
            }
            let (i, j) = decode(z);
            if i > j {
                z = if let Some(it) = &mut restricted_iter {
                    it.next().unwrap_or(z_max + 1)
                } else {
                    next_z(segment_i, segment_j, z_min, z_max, z)
                };
                continue;
            }

            let will_hit_cache = self.cache.is_some();
            self.admit_segment(
                &mut arena,
                chromosome,
                i,
                subset_name,
                OutputMode::HaplotypePerAllele,
                statistic.storage_mode(),
                will_hit_cache,
            )?;
            if !touched_order.contains(&i) {
                touched_order.push(i);
            }
            if i != j {
                self.admit_segment(
                    &mut arena,
                    chromosome,
                    j,
                    subset_name,
                    OutputMode::HaplotypePerAllele,
                    statistic.storage_mode(),
                    will_hit_cache,
                )?;
                if !touched_order.contains(&j) {
                    touched_order.push(j);
                }
            }

            let (i_start, _) = self.segment_bounds(i);
            let (j_start, _) = self.segment_bounds(j);
            let mut cell = Cell::new(i_start, j_start, statistic);
            let mut cell_cached = false;
            if let Some(handle) = &self.cache {
                let key = cell_key(handle.dataset_fingerprint, subset_name, chromosome, statistic, z);
                if let Some(bytes) = handle.cache.get(&key).unwrap_or(None) {
                    let mut cursor_r = std::io::Cursor::new(bytes);
                    cell = Cell::deserialize(&mut cursor_r, i_start, j_start, statistic)
                        .map_err(|e| Error::ConsistencyViolation(format!("corrupt cached cell blob: {e}")))?;
                    cell_cached = true;
                }
            }
            if !cell_cached {
                // genotypes weren't necessarily loaded above when the
                // cell was expected to be a cache hit; reload with values
                // now that we know compute() is required.
                if !arena[&i].has_genotypes() {
                    self.admit_segment(
                        &mut arena,
                        chromosome,
                        i,
                        subset_name,
                        OutputMode::HaplotypePerAllele,
                        statistic.storage_mode(),
                        false,
                    )?;
                }
                if i != j && !arena[&j].has_genotypes() {
                    self.admit_segment(
                        &mut arena,
                        chromosome,
                        j,
                        subset_name,
                        OutputMode::HaplotypePerAllele,
                        statistic.storage_mode(),
                        false,
                    )?;
                }
                let seg_i = &arena[&i];
                let seg_j = &arena[&j];
                cell.compute(seg_i, seg_j)?;
                if let Some(handle) = &self.cache {
                    let key = cell_key(handle.dataset_fingerprint, subset_name, chromosome, statistic, z);
                    let mut buf = Vec::new();
                    cell.serialize(&mut buf)?;
                    let _ = handle.cache.set(&key, &buf);
                }
            }

            let seg_i = &arena[&i];
            let seg_j = &arena[&j];
            let (i_from, i_to) = match seg_i.overlaps_range(start_bp, stop_bp) {
                Some(r) => r,
                None => {
                    resume_ij = None;
                    z = advance_z(i, j, segment_i, segment_j, z_min, z_max, &mut restricted_iter);
                    continue;
                }
            };
            let (j_from, j_to) = match seg_j.overlaps_range(start_bp, stop_bp) {
                Some(r) => r,
                None => {
                    resume_ij = None;
                    z = advance_z(i, j, segment_i, segment_j, z_min, z_max, &mut restricted_iter);
                    continue;
                }
            };
            let default_j_from = if i == j && !include_diagonal { 1 } else { 0 };
            let cursor_here = resume_ij.take().or(Some((i_from, j_from.max(default_j_from))));

            let (entries, next_cursor) = cell.extract_region(
                i_from,
                i_to,
                j_from.max(default_j_from),
                j_to,
                cursor_here,
                limit - page.total_entries(),
            );

            for v in &entries {
                let first_site = VariantSite {
                    chromosome: chromosome.to_string(),
                    segment_start_bp: i_start,
                    column: v.i,
                };
                let first_name = seg_i.name(v.i as usize).to_string();
                let first_pos = seg_i.position(v.i as usize);
                let first_freq = seg_i.freq(v.i as usize);
                let first_id = page.dictionary_mut().id_for(first_site, || VariantEntry {
                    name: first_name,
                    position: first_pos,
                    alt_freq: first_freq,
                });
                let second_site = VariantSite {
                    chromosome: chromosome.to_string(),
                    segment_start_bp: j_start,
                    column: v.j,
                };
                let second_name = seg_j.name(v.j as usize).to_string();
                let second_pos = seg_j.position(v.j as usize);
                let second_freq = seg_j.freq(v.j as usize);
                let second_id = page.dictionary_mut().id_for(second_site, || VariantEntry {
                    name: second_name,
                    position: second_pos,
                    alt_freq: second_freq,
                });
                page.push(first_id, second_id, v.value);
            }

            if let Some((next_i, next_j)) = next_cursor {
                page.set_cursor(PairwiseCursor {
                    last_cell_z: Some(z),
                    last_i: next_i as i64,
                    last_j: next_j as i64,
                });
                page.finish();
                Self::collect_touched(&mut arena, &touched_order, &mut out_segments);
                return Ok(());
            }

            resume_ij = None;
            z = advance_z(i, j, segment_i, segment_j, z_min, z_max, &mut restricted_iter);
        }

        page.set_cursor(PairwiseCursor::terminal());
        page.finish();
        Self::collect_touched(&mut arena, &touched_order, &mut out_segments);
        Ok(())
    }

    fn collect_touched(
        arena: &mut HashMap<u64, Segment>,
        order: &[u64],
        out_segments: &mut Option<&mut Vec<Segment>>,
    ) {
        if let Some(out) = out_segments.as_deref_mut() {
            for &idx in order {
                if let Some(segment) = arena.remove(&idx) {
                    out.push(segment);
                }
            }
        }
    }

    /// Single-variant query: traverses only cells intersecting the index
    /// variant's segment (spec.md §4.6). Upcoming cells are gathered into a
    /// bounded batch and their `compute()` calls run across a work-stealing
    /// pool, since cells with distinct (i, j) share no mutable state;
    /// extraction and paging stay single-threaded and strictly Z-ordered so
    /// the resume cursor remains exact.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_single_variant(
        &self,
        chromosome: &str,
        index_bp: u64,
        index_name: &str,
        region_start_bp: u64,
        region_stop_bp: u64,
        statistic: StatKind,
        subset_name: &str,
        page: &mut SingleVariantResultPage,
        limit: usize,
        cancel: &CancelFlag,
    ) -> Result<()> {
        if page.is_terminal() {
            return Err(Error::InvalidArgument(
                "compute_single_variant called on a terminal page".into(),
            ));
        }
        if !self.sources.contains_key(chromosome) || !self.subsets.contains_key(subset_name) {
            page.set_error(ErrorKind::InvalidArgument);
            return Ok(());
        }

        let index_segment = self.segment_index(index_bp);
        let region_i = self.segment_index(region_start_bp);
        let region_j = self.segment_index(region_stop_bp);
        let z_min = encode(region_i, region_i);
        let z_max = encode(region_j, region_j);

        let mut arena: HashMap<u64, Segment> = HashMap::new();
        self.admit_segment(
            &mut arena,
            chromosome,
            index_segment,
            subset_name,
            OutputMode::HaplotypePerAllele,
            statistic.storage_mode(),
            false,
        )?;
        let index_col = {
            let seg = &arena[&index_segment];
            seg.locate_variant(index_name, index_bp).ok_or_else(|| {
                Error::InvalidArgument(format!("index variant not found: {index_name}"))
            })?
        };
        if page.dictionary_mut().len() == 0 {
            let seg = &arena[&index_segment];
            let site = VariantSite {
                chromosome: chromosome.to_string(),
                segment_start_bp: seg.start_bp(),
                column: index_col as u32,
            };
            let name = seg.name(index_col).to_string();
            let pos = seg.position(index_col);
            let freq = seg.freq(index_col);
            let id = page
                .dictionary_mut()
                .id_for(site, || VariantEntry { name, position: pos, alt_freq: freq });
            page.set_index_variant(id);
        }

        const PREFETCH_BATCH: usize = 16;

        let (cursor_z, cursor_last_j) = page.cursor();
        let mut z = cursor_z.unwrap_or(z_min);
        let mut resume_j: Option<usize> =
            if cursor_last_j >= 0 { Some(cursor_last_j as usize) } else { None };

        loop {
            if cancel.is_cancelled() {
                page.set_error(ErrorKind::Cancelled);
                return Ok(());
            }

            let mut batch: Vec<(u64, u64, u64)> = Vec::with_capacity(PREFETCH_BATCH);
            let mut probe = z;
            while batch.len() < PREFETCH_BATCH {
                probe = next_z_single_variant(index_segment, region_i, region_j, z_min, z_max, probe);
                if probe > z_max {
                    break;
                }
                let (x, y) = decode(probe);
                batch.push((probe, x, y));
                probe += 1;
            }
            if batch.is_empty() {
                break;
            }

            for &(_, x, y) in &batch {
                let other = if x == index_segment { y } else { x };
                self.admit_segment(
                    &mut arena,
                    chromosome,
                    other,
                    subset_name,
                    OutputMode::HaplotypePerAllele,
                    statistic.storage_mode(),
                    false,
                )?;
            }

            // Cells in the batch touch disjoint segment pairs, so the
            // caching protocol plus compute() run across them in a bounded
            // work-stealing pool (spec.md §4.4, §4.6); extraction and
            // paging below stay single-threaded and strictly Z-ordered.
            let computed: Vec<Result<Cell>> = batch
                .par_iter()
                .map(|&(z_here, x, y)| {
                    let (i_start, _) = self.segment_bounds(x);
                    let (j_start, _) = self.segment_bounds(y);
                    let mut cell = Cell::new(i_start, j_start, statistic);
                    let mut cell_cached = false;
                    if let Some(handle) = &self.cache {
                        let key =
                            cell_key(handle.dataset_fingerprint, subset_name, chromosome, statistic, z_here);
                        if let Some(bytes) = handle.cache.get(&key).unwrap_or(None) {
                            let mut cursor_r = std::io::Cursor::new(bytes);
                            cell = Cell::deserialize(&mut cursor_r, i_start, j_start, statistic).map_err(
                                |e| Error::ConsistencyViolation(format!("corrupt cached cell blob: {e}")),
                            )?;
                            cell_cached = true;
                        }
                    }
                    if !cell_cached {
                        let seg_x = &arena[&x];
                        let seg_y = &arena[&y];
                        cell.compute(seg_x, seg_y)?;
                        if let Some(handle) = &self.cache {
                            let key = cell_key(
                                handle.dataset_fingerprint,
                                subset_name,
                                chromosome,
                                statistic,
                                z_here,
                            );
                            let mut buf = Vec::new();
                            cell.serialize(&mut buf)?;
                            let _ = handle.cache.set(&key, &buf);
                        }
                    }
                    Ok(cell)
                })
                .collect();

            for (idx, result) in computed.into_iter().enumerate() {
                let (z_here, x, y) = batch[idx];
                let cell = result?;
                let other = if x == index_segment { y } else { x };
                let fixed_is_i = x == index_segment;

                let other_seg = &arena[&other];
                let (lo, hi) = match other_seg.overlaps_range(region_start_bp, region_stop_bp) {
                    Some(r) => r,
                    None => continue,
                };
                let cursor_here = resume_j.take().or(Some(lo));
                let (entries, next_cursor) =
                    cell.extract_single_variant(fixed_is_i, index_col, lo, hi, cursor_here, limit);
                for v in &entries {
                    let col = if fixed_is_i { v.j } else { v.i };
                    let site = VariantSite {
                        chromosome: chromosome.to_string(),
                        segment_start_bp: other_seg.start_bp(),
                        column: col,
                    };
                    let name = other_seg.name(col as usize).to_string();
                    let pos = other_seg.position(col as usize);
                    let freq = other_seg.freq(col as usize);
                    let id = page.dictionary_mut().id_for(site, || VariantEntry {
                        name,
                        position: pos,
                        alt_freq: freq,
                    });
                    page.push(id, v.value);
                }
                if let Some(next_j) = next_cursor {
                    page.set_cursor(Some(z_here), next_j as i64);
                    page.finish();
                    return Ok(());
                }
                resume_j = None;
            }

            z = batch.last().unwrap().0 + 1;
        }

        page.set_cursor(None, -1);
        page.finish();
        Ok(())
    }
}

fn advance_z(
    i: u64,
    j: u64,
    i_lo: u64,
    i_hi: u64,
    z_min: u64,
    z_max: u64,
    restricted_iter: &mut Option<std::vec::IntoIter<u64>>,
) -> u64 {
    if let Some(it) = restricted_iter {
        it.next().unwrap_or(z_max + 1)
    } else {
        let z = encode(i, j);
        next_z(i_lo, i_hi, z_min, z_max, z + 1)
    }
}
