use crate::mass::Tolerance;

/// A window of allowed scan precursor masses
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MassInterval {
    pub min: f64,
    pub max: f64,
}

impl MassInterval {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, mass: f64) -> bool {
        mass >= self.min && mass <= self.max
    }
}

/// Maps a theoretical peptide mass to the precursor-mass windows that may
/// contain matching scans. The notch tag stratifies FDR by window.
pub trait MassDiffAcceptor: Send + Sync {
    fn num_notches(&self) -> usize;

    /// Allowed `(interval, notch)` pairs for a theoretical mass
    fn allowed_intervals(&self, theoretical_mass: f64) -> Vec<(MassInterval, usize)>;
}

/// Single window around the exact mass; every match is notch 0
pub struct PpmAroundZeroAcceptor {
    pub ppm: f64,
}

impl MassDiffAcceptor for PpmAroundZeroAcceptor {
    fn num_notches(&self) -> usize {
        1
    }

    fn allowed_intervals(&self, theoretical_mass: f64) -> Vec<(MassInterval, usize)> {
        let (lo, hi) = Tolerance::Ppm(-self.ppm, self.ppm).bounds(theoretical_mass);
        vec![(MassInterval::new(lo, hi), 0)]
    }
}

/// Fixed-offset windows ("dots"), one notch per offset. The canonical use is
/// C13 isotope errors: offsets `[0, 1.00335, 2.0067]` give notches 0..=2.
pub struct DotMassDiffAcceptor {
    pub tolerance: Tolerance,
    pub offsets: Vec<f64>,
}

impl MassDiffAcceptor for DotMassDiffAcceptor {
    fn num_notches(&self) -> usize {
        self.offsets.len()
    }

    fn allowed_intervals(&self, theoretical_mass: f64) -> Vec<(MassInterval, usize)> {
        self.offsets
            .iter()
            .enumerate()
            .map(|(notch, offset)| {
                let (lo, hi) = self.tolerance.bounds(theoretical_mass + offset);
                (MassInterval::new(lo, hi), notch)
            })
            .collect()
    }
}

/// Accepts any precursor mass (open modification search); single notch
pub struct OpenMassDiffAcceptor;

impl MassDiffAcceptor for OpenMassDiffAcceptor {
    fn num_notches(&self) -> usize {
        1
    }

    fn allowed_intervals(&self, _theoretical_mass: f64) -> Vec<(MassInterval, usize)> {
        vec![(
            MassInterval::new(f64::NEG_INFINITY, f64::INFINITY),
            0,
        )]
    }
}
