use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fnv::FnvHashMap;
use log::{debug, error};

use crate::acceptor::MassDiffAcceptor;
use crate::enzyme::Protease;
use crate::ion_series::{DissociationType, Product};
use crate::modification::Modification;
use crate::params::{CommonParameters, EngineError, NullProgress, ProgressSink};
use crate::peptide::{self, sequence_similarity, Peptide};
use crate::protein::Protein;
use crate::psm::PeptideSpectralMatch;
use crate::scoring::{calculate_peptide_score, match_fragment_ions, MatchedFragmentIon};
use crate::spectrum::{Ms2Scan, ScanCollection};
use crate::{DECOY_SIMILARITY_THRESHOLD, SCORE_TOLERANCE};

/// Give up rescrambling after this many attempts and keep the last shuffle
const MAX_SCRAMBLE_ATTEMPTS: u64 = 10;

pub struct ClassicSearchResults {
    /// False when the search was cancelled; partial output should be
    /// discarded by the caller
    pub complete: bool,
    pub proteins_searched: usize,
    /// Slot `i` is either empty or holds the PSM for `scan_index == i`
    pub psms: Vec<Option<PeptideSpectralMatch>>,
}

/// Protein-parallel digest/fragment/score loop with on-the-fly decoys.
///
/// Worker `w` of `T` handles proteins `{w, w+T, w+2T, ..}`, reusing
/// thread-local scratch fragment vectors across peptides. PSM slots are
/// guarded by one mutex per scan, so concurrent updates serialize per scan
/// while distinct scans proceed independently.
pub struct ClassicSearchEngine<'s> {
    proteins: &'s [Arc<Protein>],
    scans: &'s ScanCollection,
    fixed_mods: &'s [Arc<Modification>],
    variable_mods: &'s [Arc<Modification>],
    acceptor: &'s dyn MassDiffAcceptor,
    params: &'s CommonParameters,
    protease: Protease,
    protease_name: Arc<str>,
    decoy_on_the_fly: bool,
    has_spectral_library: bool,
    progress: Box<dyn ProgressSink>,
    stop_loops: Arc<AtomicBool>,
}

impl<'s> ClassicSearchEngine<'s> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        proteins: &'s [Arc<Protein>],
        scans: &'s ScanCollection,
        fixed_mods: &'s [Arc<Modification>],
        variable_mods: &'s [Arc<Modification>],
        acceptor: &'s dyn MassDiffAcceptor,
        params: &'s CommonParameters,
        decoy_on_the_fly: bool,
        has_spectral_library: bool,
    ) -> Result<Self, EngineError> {
        if params.max_threads_per_file == 0 {
            return Err(EngineError::InvalidConfiguration(
                "max_threads_per_file must be at least 1".into(),
            ));
        }
        if !params.score_cutoff.is_finite() {
            return Err(EngineError::InvalidConfiguration(
                "score_cutoff must be finite".into(),
            ));
        }
        let protease = params.protease()?;
        let protease_name = Arc::from(protease.name.as_str());
        Ok(Self {
            proteins,
            scans,
            fixed_mods,
            variable_mods,
            acceptor,
            params,
            protease,
            protease_name,
            decoy_on_the_fly,
            has_spectral_library,
            progress: Box::new(NullProgress),
            stop_loops: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Cooperative cancellation flag, checked at protein-loop boundaries
    pub fn stop_token(&self) -> Arc<AtomicBool> {
        self.stop_loops.clone()
    }

    pub fn run(&self) -> Result<ClassicSearchResults, EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.params.max_threads_per_file)
            .build()
            .map_err(|e| EngineError::InvalidConfiguration(e.to_string()))?;

        let locks: Vec<Mutex<Option<PeptideSpectralMatch>>> =
            (0..self.scans.len()).map(|_| Mutex::new(None)).collect();
        let proteins_searched = AtomicUsize::new(0);
        let old_percent_progress = AtomicUsize::new(0);

        pool.scope(|scope| {
            let locks = &locks;
            let proteins_searched = &proteins_searched;
            let old_percent_progress = &old_percent_progress;
            for worker in 0..self.params.max_threads_per_file {
                scope.spawn(move |_| {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        self.search_stripe(worker, locks, proteins_searched, old_percent_progress)
                    }));
                    if outcome.is_err() {
                        error!("search worker {} panicked, cancelling the pool", worker);
                        self.stop_loops.store(true, Ordering::Relaxed);
                    }
                });
            }
        });

        let complete = !self.stop_loops.load(Ordering::Relaxed);
        let psms = locks
            .into_iter()
            .map(|lock| {
                let mut slot = lock.into_inner().unwrap_or_else(|e| e.into_inner());
                if let Some(psm) = &mut slot {
                    psm.resolve_all_ambiguities();
                }
                slot
            })
            .collect();

        Ok(ClassicSearchResults {
            complete,
            proteins_searched: proteins_searched.load(Ordering::Relaxed),
            psms,
        })
    }

    /// One scratch vector per dissociation type the search can encounter.
    /// Under `Autodetect` every known type gets a slot; scans carrying
    /// anything else are skipped.
    fn scratch_table(&self) -> FnvHashMap<DissociationType, Vec<Product>> {
        let mut table = FnvHashMap::default();
        match self.params.dissociation_type {
            DissociationType::Autodetect => {
                for d in [
                    DissociationType::Hcd,
                    DissociationType::Cid,
                    DissociationType::Etd,
                ] {
                    table.insert(d, Vec::new());
                }
            }
            d => {
                table.insert(d, Vec::new());
            }
        }
        table
    }

    fn resolve_dissociation(&self, scan: &Ms2Scan) -> Option<DissociationType> {
        match self.params.dissociation_type {
            DissociationType::Autodetect => match scan.dissociation_type {
                Some(DissociationType::Autodetect) | None => {
                    debug!(
                        "scan {} carries no dissociation type; skipped under autodetect",
                        scan.scan_number
                    );
                    None
                }
                Some(d) => Some(d),
            },
            d => Some(d),
        }
    }

    fn generate_decoy(&self, target: &Peptide) -> Option<Peptide> {
        if !self.decoy_on_the_fly && !self.has_spectral_library {
            return None;
        }
        let mut decoy = target.reverse_decoy();
        // A paired library decoy is always the plain reverse; competition
        // decoys must not resemble their target
        if self.decoy_on_the_fly
            && sequence_similarity(target, &decoy) > DECOY_SIMILARITY_THRESHOLD
        {
            for attempt in 0..MAX_SCRAMBLE_ATTEMPTS {
                decoy = target.scrambled_decoy(attempt);
                if sequence_similarity(target, &decoy) <= DECOY_SIMILARITY_THRESHOLD {
                    break;
                }
            }
        }
        Some(decoy)
    }

    fn search_stripe(
        &self,
        worker: usize,
        locks: &[Mutex<Option<PeptideSpectralMatch>>],
        proteins_searched: &AtomicUsize,
        old_percent_progress: &AtomicUsize,
    ) {
        let stride = self.params.max_threads_per_file;
        let mut target_products = self.scratch_table();
        let mut decoy_products = self.scratch_table();

        let mut protein_idx = worker;
        while protein_idx < self.proteins.len() {
            if self.stop_loops.load(Ordering::Relaxed) {
                return;
            }
            let protein = &self.proteins[protein_idx];
            for target in peptide::digest(
                protein,
                &self.protease,
                &self.params.digestion,
                self.fixed_mods,
                self.variable_mods,
            ) {
                let decoy = self.generate_decoy(&target);
                for products in target_products.values_mut() {
                    products.clear();
                }
                for products in decoy_products.values_mut() {
                    products.clear();
                }

                for (interval, notch) in
                    self.acceptor.allowed_intervals(target.monoisotopic_mass)
                {
                    for scan in self.scans.scans_in_window(interval.min, interval.max) {
                        let Some(dissociation) = self.resolve_dissociation(scan) else {
                            continue;
                        };
                        let Some(products) = target_products.get_mut(&dissociation) else {
                            debug!(
                                "no scratch slot for dissociation {:?}; scan {} skipped",
                                dissociation, scan.scan_number
                            );
                            continue;
                        };
                        if products.is_empty() {
                            target.fragment(dissociation, products);
                        }
                        let target_ions = match_fragment_ions(
                            scan,
                            products,
                            self.params.product_tolerance,
                            false,
                            self.params.max_fragment_charge,
                        );
                        let target_score = calculate_peptide_score(scan, &target_ions, false);

                        if self.decoy_on_the_fly {
                            let decoy = decoy.as_ref().expect("decoy generated above");
                            let (decoy_score, decoy_ions) =
                                self.score_decoy(scan, decoy, dissociation, &mut decoy_products);

                            if decoy_score > target_score + SCORE_TOLERANCE {
                                self.add_psm(locks, scan, decoy_score, notch, decoy, decoy_ions);
                            } else if (decoy_score - target_score).abs() <= SCORE_TOLERANCE {
                                // Tie retained for downstream ambiguity handling
                                self.add_psm(locks, scan, target_score, notch, &target, target_ions);
                                self.add_psm(locks, scan, decoy_score, notch, decoy, decoy_ions);
                            } else {
                                self.add_psm(locks, scan, target_score, notch, &target, target_ions);
                            }
                        } else if let Some(decoy) = &decoy {
                            // Spectral library present: record the paired
                            // reverse decoy for later spectral-angle scoring
                            self.add_psm(locks, scan, target_score, notch, &target, target_ions);
                            let (decoy_score, decoy_ions) =
                                self.score_decoy(scan, decoy, dissociation, &mut decoy_products);
                            self.add_psm(locks, scan, decoy_score, notch, decoy, decoy_ions);
                        } else {
                            self.add_psm(locks, scan, target_score, notch, &target, target_ions);
                        }
                    }
                }
            }

            let searched = proteins_searched.fetch_add(1, Ordering::Relaxed) + 1;
            let percent = searched * 100 / self.proteins.len();
            if percent > old_percent_progress.fetch_max(percent, Ordering::Relaxed) {
                self.progress.report(percent, "Performing classic search...");
            }
            protein_idx += stride;
        }
    }

    fn score_decoy(
        &self,
        scan: &Ms2Scan,
        decoy: &Peptide,
        dissociation: DissociationType,
        decoy_products: &mut FnvHashMap<DissociationType, Vec<Product>>,
    ) -> (f64, Vec<MatchedFragmentIon>) {
        let products = decoy_products
            .get_mut(&dissociation)
            .expect("decoy scratch mirrors target scratch");
        if products.is_empty() {
            decoy.fragment(dissociation, products);
        }
        let ions = match_fragment_ions(
            scan,
            products,
            self.params.product_tolerance,
            false,
            self.params.max_fragment_charge,
        );
        let score = calculate_peptide_score(scan, &ions, false);
        (score, ions)
    }

    fn add_psm(
        &self,
        locks: &[Mutex<Option<PeptideSpectralMatch>>],
        scan: &Ms2Scan,
        score: f64,
        notch: usize,
        peptide: &Peptide,
        matched_ions: Vec<MatchedFragmentIon>,
    ) {
        if score < self.params.score_cutoff {
            return;
        }
        let mut slot = locks[scan.scan_index]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match &mut *slot {
            None => {
                *slot = Some(PeptideSpectralMatch::new(
                    scan,
                    self.scans.file_path.clone(),
                    self.protease_name.clone(),
                    score,
                    notch,
                    peptide.clone(),
                    matched_ions,
                ));
            }
            Some(psm) => {
                if score - psm.runner_up_score > -SCORE_TOLERANCE {
                    psm.add_or_replace(
                        peptide.clone(),
                        score,
                        notch,
                        self.params.report_all_ambiguity,
                        matched_ions,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acceptor::PpmAroundZeroAcceptor;
    use crate::enzyme::DigestionParams;
    use crate::mass::{Tolerance, PROTON};
    use crate::spectrum::Peak;

    fn test_params(threads: usize) -> CommonParameters {
        CommonParameters {
            max_threads_per_file: threads,
            score_cutoff: 1.0,
            precursor_tolerance: Tolerance::Ppm(-10.0, 10.0),
            product_tolerance: Tolerance::Ppm(-10.0, 10.0),
            dissociation_type: DissociationType::Hcd,
            max_fragment_charge: 1,
            report_all_ambiguity: true,
            digestion: DigestionParams {
                missed_cleavages: 0,
                min_len: 4,
                max_len: 50,
                ..Default::default()
            },
        }
    }

    fn perfect_scan(scan_index: usize, peptide: &Peptide) -> Ms2Scan {
        let mut products = Vec::new();
        peptide.fragment(DissociationType::Hcd, &mut products);
        let peaks = products
            .iter()
            .map(|p| Peak {
                mz: p.monoisotopic_mass + PROTON,
                intensity: 1.0,
            })
            .collect();
        Ms2Scan::new(
            scan_index,
            scan_index + 100,
            peptide.monoisotopic_mass,
            2,
            Some(DissociationType::Hcd),
            peaks,
        )
    }

    fn digest_one(protein: &Arc<Protein>, params: &CommonParameters) -> Vec<Peptide> {
        peptide::digest(
            protein,
            &params.protease().unwrap(),
            &params.digestion,
            &[],
            &[],
        )
    }

    #[test]
    fn slots_match_scan_indices() {
        let protein = Protein::new("P1", "PEPTIDEKAGIRLK", false).unwrap();
        let params = test_params(2);
        let peptides = digest_one(&protein, &params);
        // PEPTIDEK and AGIR survive the length window; LK does not
        assert_eq!(peptides.len(), 2);

        let scans = ScanCollection::new(
            vec![
                perfect_scan(0, &peptides[1]),
                perfect_scan(1, &peptides[0]),
            ],
            "test.mzML",
        )
        .unwrap();

        let proteins = vec![protein];
        let acceptor = PpmAroundZeroAcceptor { ppm: 10.0 };
        let engine = ClassicSearchEngine::new(
            &proteins, &scans, &[], &[], &acceptor, &params, false, false,
        )
        .unwrap();
        let results = engine.run().unwrap();

        assert!(results.complete);
        assert_eq!(results.proteins_searched, 1);
        assert_eq!(results.psms.len(), 2);
        for (i, slot) in results.psms.iter().enumerate() {
            let psm = slot.as_ref().unwrap();
            assert_eq!(psm.scan_index, i);
            assert!(psm.best_score >= psm.runner_up_score);
            assert!(!psm.is_decoy());
        }
        // 14 b/y ions for PEPTIDEK, all intensity matched
        let psm = results.psms[1].as_ref().unwrap();
        assert!((psm.best_score - 15.0).abs() < 1e-6);
        assert_eq!(
            psm.best_match().peptide.base_sequence_str(),
            "PEPTIDEK"
        );
    }

    #[test]
    fn decoy_on_the_fly_does_not_displace_perfect_target() {
        let protein = Protein::new("P1", "PEPTIDEK", false).unwrap();
        let params = test_params(1);
        let peptides = digest_one(&protein, &params);
        let scans =
            ScanCollection::new(vec![perfect_scan(0, &peptides[0])], "test.mzML").unwrap();

        let proteins = vec![protein];
        let acceptor = PpmAroundZeroAcceptor { ppm: 10.0 };
        let engine = ClassicSearchEngine::new(
            &proteins, &scans, &[], &[], &acceptor, &params, true, false,
        )
        .unwrap();
        let results = engine.run().unwrap();
        let psm = results.psms[0].as_ref().unwrap();
        assert!(!psm.is_decoy());
        assert!((psm.best_score - 15.0).abs() < 1e-6);
    }

    #[test]
    fn score_cutoff_rejects_weak_candidates() {
        let protein = Protein::new("P1", "PEPTIDEK", false).unwrap();
        let mut params = test_params(1);
        params.score_cutoff = 100.0;
        let peptides = digest_one(&protein, &params);
        let scans =
            ScanCollection::new(vec![perfect_scan(0, &peptides[0])], "test.mzML").unwrap();

        let proteins = vec![protein];
        let acceptor = PpmAroundZeroAcceptor { ppm: 10.0 };
        let engine = ClassicSearchEngine::new(
            &proteins, &scans, &[], &[], &acceptor, &params, false, false,
        )
        .unwrap();
        let results = engine.run().unwrap();
        assert!(results.psms[0].is_none());
    }

    #[test]
    fn autodetect_skips_unannotated_scans() {
        let protein = Protein::new("P1", "PEPTIDEK", false).unwrap();
        let mut params = test_params(1);
        params.dissociation_type = DissociationType::Autodetect;
        let peptides = digest_one(&protein, &params);
        let mut scan = perfect_scan(0, &peptides[0]);
        scan.dissociation_type = None;
        let scans = ScanCollection::new(vec![scan], "test.mzML").unwrap();

        let proteins = vec![protein];
        let acceptor = PpmAroundZeroAcceptor { ppm: 10.0 };
        let engine = ClassicSearchEngine::new(
            &proteins, &scans, &[], &[], &acceptor, &params, false, false,
        )
        .unwrap();
        let results = engine.run().unwrap();
        assert!(results.psms[0].is_none());
    }

    #[test]
    fn autodetect_uses_scan_annotation() {
        let protein = Protein::new("P1", "PEPTIDEK", false).unwrap();
        let mut params = test_params(1);
        params.dissociation_type = DissociationType::Autodetect;
        let peptides = digest_one(&protein, &params);
        let scans =
            ScanCollection::new(vec![perfect_scan(0, &peptides[0])], "test.mzML").unwrap();

        let proteins = vec![protein];
        let acceptor = PpmAroundZeroAcceptor { ppm: 10.0 };
        let engine = ClassicSearchEngine::new(
            &proteins, &scans, &[], &[], &acceptor, &params, false, false,
        )
        .unwrap();
        let results = engine.run().unwrap();
        assert!(results.psms[0].is_some());
    }

    #[test]
    fn cancellation_returns_incomplete() {
        let protein = Protein::new("P1", "PEPTIDEK", false).unwrap();
        let params = test_params(1);
        let peptides = digest_one(&protein, &params);
        let scans =
            ScanCollection::new(vec![perfect_scan(0, &peptides[0])], "test.mzML").unwrap();

        let proteins = vec![protein];
        let acceptor = PpmAroundZeroAcceptor { ppm: 10.0 };
        let engine = ClassicSearchEngine::new(
            &proteins, &scans, &[], &[], &acceptor, &params, false, false,
        )
        .unwrap();
        engine.stop_token().store(true, Ordering::Relaxed);
        let results = engine.run().unwrap();
        assert!(!results.complete);
        assert!(results.psms[0].is_none());
    }

    struct NoWindows;

    impl MassDiffAcceptor for NoWindows {
        fn num_notches(&self) -> usize {
            1
        }

        fn allowed_intervals(&self, _: f64) -> Vec<(crate::acceptor::MassInterval, usize)> {
            Vec::new()
        }
    }

    #[test]
    fn empty_interval_list_contributes_no_scans() {
        let protein = Protein::new("P1", "PEPTIDEK", false).unwrap();
        let params = test_params(1);
        let peptides = digest_one(&protein, &params);
        let scans =
            ScanCollection::new(vec![perfect_scan(0, &peptides[0])], "test.mzML").unwrap();

        let proteins = vec![protein];
        let acceptor = NoWindows;
        let engine = ClassicSearchEngine::new(
            &proteins, &scans, &[], &[], &acceptor, &params, false, false,
        )
        .unwrap();
        let results = engine.run().unwrap();
        assert!(results.complete);
        assert!(results.psms[0].is_none());
    }

    #[test]
    fn zero_threads_is_invalid() {
        let protein = Protein::new("P1", "PEPTIDEK", false).unwrap();
        let params = test_params(0);
        let scans = ScanCollection::new(vec![], "test.mzML").unwrap();
        let proteins = vec![protein];
        let acceptor = PpmAroundZeroAcceptor { ppm: 10.0 };
        assert!(ClassicSearchEngine::new(
            &proteins, &scans, &[], &[], &acceptor, &params, false, false,
        )
        .is_err());
    }
}
