//! End-to-end scenarios from spec.md §8: known-answers region query,
//! paging equivalence, single-variant query, and cache correctness.

use std::sync::Arc;

use float_cmp::approx_eq;
use ldstat_worker::cache::MemoryCache;
use ldstat_worker::engine::CancelFlag;
use ldstat_worker::paging::{PairwiseResultPage, SingleVariantResultPage};
use ldstat_worker::segment::{GenotypeRecord, GenotypeSource};
use ldstat_worker::{Engine, OutputMode, StatKind};

struct FixedSource {
    samples: Vec<String>,
    records: Vec<GenotypeRecord>,
}

impl GenotypeSource for FixedSource {
    fn samples(&self) -> &[String] {
        &self.samples
    }

    fn chromosomes(&self) -> Vec<String> {
        vec!["22".to_string()]
    }

    fn scan(
        &self,
        _chromosome: &str,
        start_bp: u64,
        stop_bp: u64,
        _sample_subset: &[String],
        _mode: OutputMode,
    ) -> ldstat_worker::Result<Vec<GenotypeRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.position >= start_bp && r.position <= stop_bp)
            .cloned()
            .collect())
    }
}

fn oracle_r(n: f64, carriers_i: &[u32], carriers_j: &[u32], freq_i: f64, freq_j: f64) -> Option<f64> {
    let both = carriers_i.iter().filter(|r| carriers_j.contains(r)).count() as f64;
    let pab = both / n;
    let denom = (freq_i * (1.0 - freq_i) * freq_j * (1.0 - freq_j)).sqrt();
    if denom > 0.0 {
        Some((pab - freq_i * freq_j) / denom)
    } else {
        None
    }
}

fn eight_haplotype_source() -> FixedSource {
    let samples: Vec<String> = (0..4).map(|i| format!("S{i}")).collect();
    let records = vec![
        GenotypeRecord {
            position: 51241101,
            reference: "A".into(),
            alternate: "T".into(),
            n_rows: 8,
            values: vec![(0, 1.0), (1, 1.0), (4, 1.0)],
        },
        GenotypeRecord {
            position: 51241309,
            reference: "C".into(),
            alternate: "G".into(),
            n_rows: 8,
            values: vec![(0, 1.0), (2, 1.0), (4, 1.0), (5, 1.0)],
        },
        GenotypeRecord {
            position: 51241385,
            reference: "G".into(),
            alternate: "A".into(),
            n_rows: 8,
            values: vec![(1, 1.0), (3, 1.0)],
        },
    ];
    FixedSource { samples, records }
}

#[test]
fn known_answers_region_query_matches_oracle() {
    let mut engine = Engine::new(1000).unwrap();
    engine
        .set_genotype_source("22", Box::new(eight_haplotype_source()))
        .unwrap();

    let mut page = PairwiseResultPage::new();
    let cancel = CancelFlag::new();
    engine
        .compute_region(
            "22",
            51241101,
            51241385,
            StatKind::RSquare,
            "ALL",
            &mut page,
            false,
            1000,
            &cancel,
            None,
        )
        .unwrap();
    assert!(page.is_terminal());

    let expected = oracle_r(8.0, &[0, 1, 4], &[0, 2, 4, 5], 3.0 / 8.0, 4.0 / 8.0)
        .map(|r| r * r)
        .unwrap();

    let positions: Vec<u64> = page.dictionary().entries().map(|e| e.position).collect();
    let first_idx = positions.iter().position(|&p| p == 51241101).unwrap();
    let second_idx = positions.iter().position(|&p| p == 51241309).unwrap();

    let value = page
        .iter_entries()
        .find_map(|(first, second, value)| {
            let (lo, hi) = (first_idx.min(second_idx) as u32, first_idx.max(second_idx) as u32);
            if (first, second) == (lo, hi) {
                value
            } else {
                None
            }
        })
        .expect("the two known variants should share a cell");

    assert!(
        approx_eq!(f64, value, expected, epsilon = 1e-11),
        "r² = {value}, expected {expected}"
    );
}

#[test]
fn paging_equivalence_with_small_limit() {
    let mut engine = Engine::new(1000).unwrap();
    engine
        .set_genotype_source("22", Box::new(eight_haplotype_source()))
        .unwrap();
    let cancel = CancelFlag::new();

    let mut unbounded = PairwiseResultPage::new();
    engine
        .compute_region(
            "22",
            51241101,
            51241385,
            StatKind::RSquare,
            "ALL",
            &mut unbounded,
            true,
            1000,
            &cancel,
            None,
        )
        .unwrap();
    let total = unbounded.total_entries();
    assert!(total > 0);

    let mut paged_total = 0usize;
    let mut page = PairwiseResultPage::new();
    loop {
        engine
            .compute_region(
                "22",
                51241101,
                51241385,
                StatKind::RSquare,
                "ALL",
                &mut page,
                true,
                2,
                &cancel,
                None,
            )
            .unwrap();
        assert!(page.total_entries() <= 2);
        paged_total += page.total_entries();
        if page.is_terminal() {
            break;
        }
        page = PairwiseResultPage::resume_at(page.cursor(), page.page_number());
    }
    assert_eq!(paged_total, total);
}

#[test]
fn single_variant_query_fixes_index_across_pages() {
    let mut engine = Engine::new(1000).unwrap();
    engine
        .set_genotype_source("22", Box::new(eight_haplotype_source()))
        .unwrap();
    let cancel = CancelFlag::new();

    let mut page = SingleVariantResultPage::new();
    engine
        .compute_single_variant(
            "22",
            51241309,
            "22:51241309_C/G",
            51241101,
            51244237,
            StatKind::RSquare,
            "ALL",
            &mut page,
            1000,
            &cancel,
        )
        .unwrap();
    assert!(page.is_terminal());
    assert!(page.dictionary_mut().len() >= 2, "index variant plus at least one partner should be resolved");
}

#[test]
fn second_run_with_cache_enabled_returns_identical_entry_count() {
    let mut engine = Engine::new(1000).unwrap();
    engine
        .set_genotype_source("22", Box::new(eight_haplotype_source()))
        .unwrap();
    engine.enable_cache(0xC0FFEE, Arc::new(MemoryCache::new()));
    let cancel = CancelFlag::new();

    let mut first = PairwiseResultPage::new();
    engine
        .compute_region(
            "22", 51241101, 51241385, StatKind::R, "ALL", &mut first, true, 1000, &cancel, None,
        )
        .unwrap();

    let mut second = PairwiseResultPage::new();
    engine
        .compute_region(
            "22", 51241101, 51241385, StatKind::R, "ALL", &mut second, true, 1000, &cancel, None,
        )
        .unwrap();

    assert_eq!(first.total_entries(), second.total_entries());
    assert!(approx_eq!(f64, first.total_entries() as f64, second.total_entries() as f64));
}

#[test]
fn single_variant_cache_hit_on_second_run_returns_identical_entry_count() {
    let mut engine = Engine::new(1000).unwrap();
    engine
        .set_genotype_source("22", Box::new(eight_haplotype_source()))
        .unwrap();
    engine.enable_cache(0xC0FFEE, Arc::new(MemoryCache::new()));
    let cancel = CancelFlag::new();

    let mut first = SingleVariantResultPage::new();
    engine
        .compute_single_variant(
            "22",
            51241309,
            "22:51241309_C/G",
            51241101,
            51244237,
            StatKind::RSquare,
            "ALL",
            &mut first,
            1000,
            &cancel,
        )
        .unwrap();

    let mut second = SingleVariantResultPage::new();
    engine
        .compute_single_variant(
            "22",
            51241309,
            "22:51241309_C/G",
            51241101,
            51244237,
            StatKind::RSquare,
            "ALL",
            &mut second,
            1000,
            &cancel,
        )
        .unwrap();

    assert!(first.is_terminal());
    assert!(second.is_terminal());
    assert_eq!(first.dictionary_mut().len(), second.dictionary_mut().len());
}
