//! Turn scan results into AMU/intensity pairs.

use {
    crate::scan::ScanResult,
    std::io::{self, Write},
};

/// One sample of a spectrum.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SpectrumPoint {
    /// Mass-to-charge ratio.
    pub amu: f64,
    /// Counts, divided by the total pressure when one was reported.
    pub intensity: f64,
}

/// A scan converted to AMU/intensity pairs.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Spectrum {
    points: Vec<SpectrumPoint>,
    total_pressure: u32,
}

impl Spectrum {
    /// Convert a completed scan.
    ///
    /// A zero total-pressure word leaves the raw counts in place.
    pub fn from_scan(scan: &ScanResult) -> Self {
        let pressure = scan.total_pressure();
        let ppa = f64::from(scan.points_per_amu().max(1));
        let start = f64::from(scan.start_amu());

        let points = scan
            .intensities()
            .iter()
            .enumerate()
            .map(|(i, &counts)| SpectrumPoint {
                amu: start + i as f64 / ppa,
                intensity: if pressure == 0 {
                    f64::from(counts)
                } else {
                    f64::from(counts) / f64::from(pressure)
                },
            })
            .collect();

        Self {
            points,
            total_pressure: pressure,
        }
    }

    /// Samples in scan order.
    pub fn points(&self) -> &[SpectrumPoint] {
        &self.points
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the spectrum is empty.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Whether intensities were divided by the total pressure.
    pub fn is_normalized(&self) -> bool {
        self.total_pressure != 0
    }

    /// Total-pressure word of the scan.
    pub fn total_pressure(&self) -> u32 {
        self.total_pressure
    }

    /// Sample with the highest intensity.
    pub fn peak(&self) -> Option<SpectrumPoint> {
        self.points
            .iter()
            .copied()
            .max_by(|a, b| a.intensity.total_cmp(&b.intensity))
    }

    /// Write `amu<TAB>intensity` lines.
    pub fn write_tsv<W: Write>(&self, mut out: W) -> io::Result<()> {
        for point in &self.points {
            if self.is_normalized() {
                writeln!(out, "{:.2}\t{:.6e}", point.amu, point.intensity)?;
            } else {
                writeln!(out, "{:.2}\t{}", point.amu, point.intensity)?;
            }
        }
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_pressure_keeps_raw_counts() {
        let points = (200 - 29) * 10 + 1;
        let mut values: Vec<u32> = (0..points).map(|i| i * 3).collect();
        values.push(0);
        assert_eq!(values.len(), 1712);

        let spectrum = Spectrum::from_scan(&ScanResult::new(values, 29, 10));
        assert!(!spectrum.is_normalized());
        assert_eq!(spectrum.len(), 1711);
        assert_eq!(spectrum.points()[10].intensity, 30.0);
        assert!((spectrum.points()[10].amu - 30.0).abs() < 1e-9);
        assert!((spectrum.points()[1710].amu - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_nonzero_pressure_normalizes() {
        let spectrum = Spectrum::from_scan(&ScanResult::new(vec![50, 100, 25, 200], 1, 2));
        assert!(spectrum.is_normalized());
        let intensities: Vec<f64> = spectrum.points().iter().map(|p| p.intensity).collect();
        assert_eq!(intensities, vec![0.25, 0.5, 0.125]);
        let amus: Vec<f64> = spectrum.points().iter().map(|p| p.amu).collect();
        assert_eq!(amus, vec![1.0, 1.5, 2.0]);
        assert_eq!(spectrum.peak().map(|p| p.amu), Some(1.5));
    }

    #[test]
    fn test_write_tsv() {
        let spectrum = Spectrum::from_scan(&ScanResult::new(vec![7, 9, 0], 28, 1));
        let mut out = Vec::new();
        spectrum.write_tsv(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "28.00\t7\n29.00\t9\n");
    }

    #[test]
    fn test_empty_scan() {
        let spectrum = Spectrum::from_scan(&ScanResult::new(Vec::new(), 1, 10));
        assert!(spectrum.is_empty());
        assert!(spectrum.peak().is_none());
    }
}
