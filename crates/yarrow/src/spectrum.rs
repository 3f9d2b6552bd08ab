use std::sync::Arc;

use crate::ion_series::DissociationType;
use crate::mass::Tolerance;
use crate::params::EngineError;

/// A single observed peak
#[derive(Copy, Clone, Default, Debug, PartialEq)]
pub struct Peak {
    pub mz: f64,
    pub intensity: f64,
}

/// One MS2 spectrum, immutable for the duration of a search
#[derive(Clone, Debug)]
pub struct Ms2Scan {
    /// Dense identifier within a file, `0..N`. Also the PSM slot index.
    pub scan_index: usize,
    /// Sparse instrument identifier
    pub scan_number: usize,
    /// Neutral monoisotopic precursor mass
    pub precursor_mass: f64,
    pub precursor_charge: u8,
    /// `None` when the instrument did not report a fragmentation method
    pub dissociation_type: Option<DissociationType>,
    /// Peaks sorted ascending by m/z
    pub peaks: Vec<Peak>,
    pub total_intensity: f64,
}

impl Ms2Scan {
    pub fn new(
        scan_index: usize,
        scan_number: usize,
        precursor_mass: f64,
        precursor_charge: u8,
        dissociation_type: Option<DissociationType>,
        mut peaks: Vec<Peak>,
    ) -> Ms2Scan {
        peaks.sort_unstable_by(|a, b| a.mz.total_cmp(&b.mz));
        let total_intensity = peaks.iter().map(|p| p.intensity).sum();
        Ms2Scan {
            scan_index,
            scan_number,
            precursor_mass,
            precursor_charge,
            dissociation_type,
            peaks,
            total_intensity,
        }
    }

    /// Most intense peak within the tolerance window around `mz`
    pub fn most_intense_peak_within(&self, mz: f64, tolerance: Tolerance) -> Option<&Peak> {
        let (lo, hi) = tolerance.bounds(mz);
        let start = self.peaks.partition_point(|p| p.mz < lo);
        let mut best: Option<&Peak> = None;
        for peak in self.peaks[start..].iter().take_while(|p| p.mz <= hi) {
            if best.map(|b| peak.intensity >= b.intensity).unwrap_or(true) {
                best = Some(peak);
            }
        }
        best
    }
}

/// All MS2 scans from one file, ordered ascending by precursor mass with the
/// masses extracted into a parallel array for binary search
pub struct ScanCollection {
    scans: Vec<Ms2Scan>,
    precursor_masses: Vec<f64>,
    pub file_path: Arc<str>,
    /// Number of PSM slots (scan indices are dense in `0..slots`)
    slots: usize,
}

impl ScanCollection {
    pub fn new(
        mut scans: Vec<Ms2Scan>,
        file_path: impl Into<Arc<str>>,
    ) -> Result<ScanCollection, EngineError> {
        let slots = scans.len();
        let mut seen = vec![false; slots];
        for scan in &scans {
            if scan.scan_index >= slots || seen[scan.scan_index] {
                return Err(EngineError::InvalidConfiguration(format!(
                    "scan indices must be unique and dense in 0..{}, got {}",
                    slots, scan.scan_index
                )));
            }
            seen[scan.scan_index] = true;
        }
        scans.sort_by(|a, b| {
            a.precursor_mass
                .total_cmp(&b.precursor_mass)
                .then_with(|| a.scan_index.cmp(&b.scan_index))
        });
        let precursor_masses = scans.iter().map(|s| s.precursor_mass).collect();
        Ok(ScanCollection {
            scans,
            precursor_masses,
            file_path: file_path.into(),
            slots,
        })
    }

    pub fn len(&self) -> usize {
        self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.slots == 0
    }

    /// Scans in ascending precursor-mass order
    pub fn scans(&self) -> &[Ms2Scan] {
        &self.scans
    }

    pub fn precursor_masses(&self) -> &[f64] {
        &self.precursor_masses
    }

    /// Index of the first scan with `precursor_mass >= minimum`; the
    /// insertion position when no such scan exists. This is the only entry
    /// point for mass-window iteration.
    pub fn first_scan_with_mass_over_or_equal(&self, minimum: f64) -> usize {
        self.precursor_masses.partition_point(|&m| m < minimum)
    }

    /// Scans whose precursor mass falls in `[lo, hi]`, in ascending order
    pub fn scans_in_window(&self, lo: f64, hi: f64) -> impl Iterator<Item = &Ms2Scan> {
        let start = self.first_scan_with_mass_over_or_equal(lo);
        self.scans[start..]
            .iter()
            .take_while(move |s| s.precursor_mass <= hi)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scan(scan_index: usize, precursor_mass: f64) -> Ms2Scan {
        Ms2Scan::new(scan_index, scan_index + 1, precursor_mass, 2, None, vec![])
    }

    fn collection(masses: &[f64]) -> ScanCollection {
        let scans = masses
            .iter()
            .enumerate()
            .map(|(i, &m)| scan(i, m))
            .collect();
        ScanCollection::new(scans, "test.mzML").unwrap()
    }

    #[test]
    fn lower_bound() {
        let c = collection(&[500.0, 300.0, 700.0, 300.0]);
        // Sorted: 300, 300, 500, 700
        assert_eq!(c.first_scan_with_mass_over_or_equal(100.0), 0);
        assert_eq!(c.first_scan_with_mass_over_or_equal(300.0), 0);
        assert_eq!(c.first_scan_with_mass_over_or_equal(300.1), 2);
        assert_eq!(c.first_scan_with_mass_over_or_equal(700.0), 3);
        assert_eq!(c.first_scan_with_mass_over_or_equal(701.0), 4);
    }

    #[test]
    fn window_iteration() {
        let c = collection(&[500.0, 300.0, 700.0, 300.0]);
        let hits = c
            .scans_in_window(299.0, 501.0)
            .map(|s| s.scan_index)
            .collect::<Vec<_>>();
        assert_eq!(hits, vec![1, 3, 0]);

        assert_eq!(c.scans_in_window(800.0, 900.0).count(), 0);
    }

    #[test]
    fn duplicate_scan_index_rejected() {
        let scans = vec![scan(0, 100.0), scan(0, 200.0)];
        assert!(ScanCollection::new(scans, "test.mzML").is_err());

        let scans = vec![scan(0, 100.0), scan(2, 200.0)];
        assert!(ScanCollection::new(scans, "test.mzML").is_err());
    }

    #[test]
    fn most_intense_peak() {
        let scan = Ms2Scan::new(
            0,
            1,
            500.0,
            2,
            None,
            vec![
                Peak {
                    mz: 100.001,
                    intensity: 10.0,
                },
                Peak {
                    mz: 100.0005,
                    intensity: 30.0,
                },
                Peak {
                    mz: 101.0,
                    intensity: 100.0,
                },
            ],
        );
        let peak = scan
            .most_intense_peak_within(100.0, Tolerance::Ppm(-20.0, 20.0))
            .unwrap();
        assert_eq!(peak.intensity, 30.0);
        assert!(scan
            .most_intense_peak_within(99.0, Tolerance::Ppm(-20.0, 20.0))
            .is_none());
    }
}
