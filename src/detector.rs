use indicatif::{ParallelProgressIterator, ProgressBar, ProgressIterator, ProgressStyle};
use log::info;
use ndarray::Array2;
use rayon::prelude::*;
use thiserror::Error;

use crate::coords::{rescale_coords, CellCoordinate, SlicePartition};
use crate::preprocess::{rescale_intensity, resize, PreprocessError};
use crate::preview::{ComparisonView, PreviewSink};
use crate::volume::{CoRegistered, VolumeError, VolumeSource};

// Number of co-positive cells on one slice that triggers the comparison
// view and ends a preview scan.
const PREVIEW_TRIGGER: usize = 50;

// Percentile window used to stretch raw channel intensities for display.
const DISPLAY_STRETCH: (f32, f32) = (2.0, 98.0);

#[derive(Error, Debug)]
pub enum DetectError {
    #[error(
        "coordinate (z={z}, y={y}, x={x}) falls outside its {height}x{width} probability slice"
    )]
    OutOfBoundsCoordinate {
        z: usize,
        y: f64,
        x: f64,
        height: usize,
        width: usize,
    },

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
}

#[derive(Clone, Copy, Debug)]
pub struct DetectParams {
    // probability strictly above this value marks a cell co-positive
    pub threshold: f32,
    // downscale factor applied to preview renderings
    pub preview_scale: f32,
}

impl Default for DetectParams {
    fn default() -> DetectParams {
        DetectParams {
            threshold: 0.4,
            preview_scale: 0.3,
        }
    }
}

// Co-positive coordinates accumulated per slice, ascending z. Kept
// unflattened until a run finishes; flattening is a separate,
// order-preserving step.
#[derive(Clone, Debug, Default)]
pub struct CoPositiveSet {
    slices: Vec<Vec<CellCoordinate>>,
}

impl CoPositiveSet {
    pub fn push_slice(&mut self, matches: Vec<CellCoordinate>) {
        self.slices.push(matches);
    }

    pub fn num_slices(&self) -> usize {
        self.slices.len()
    }

    pub fn slice(&self, z: usize) -> &[CellCoordinate] {
        &self.slices[z]
    }

    pub fn total(&self) -> usize {
        self.slices.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    // Concatenate per-slice lists in ascending z, preserving each list's
    // internal order.
    pub fn flatten(&self) -> Vec<CellCoordinate> {
        self.slices.iter().flatten().copied().collect()
    }
}

// One detection pass over the probability map: every slice is scanned for
// cell centers sitting on a voxel whose probability exceeds the threshold.
pub struct CoPositivityScan<'a, V: VolumeSource> {
    volumes: &'a CoRegistered<V>,
    coords: &'a [CellCoordinate],
    partition: SlicePartition,
    params: DetectParams,
}

impl<'a, V: VolumeSource + Sync> CoPositivityScan<'a, V> {
    pub fn new(
        volumes: &'a CoRegistered<V>,
        coords: &'a [CellCoordinate],
        params: DetectParams,
    ) -> CoPositivityScan<'a, V> {
        let (depth, _, _) = volumes.probability.shape();
        CoPositivityScan {
            volumes,
            coords,
            partition: SlicePartition::build(coords, depth),
            params,
        }
    }

    // Scan with slices in parallel. Per-slice results are merged back in
    // index order; the output is identical to a sequential scan.
    pub fn run(&self) -> Result<CoPositiveSet, DetectError> {
        let depth = self.partition.depth();
        let slices = (0..depth)
            .into_par_iter()
            .progress_with(slice_progress(depth))
            .map(|z| self.scan_slice(z))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CoPositiveSet { slices })
    }

    // Scan every slice in ascending z on the calling thread. The parallel
    // scan is checked against this one.
    #[allow(dead_code)]
    pub fn run_sequential(&self) -> Result<CoPositiveSet, DetectError> {
        let depth = self.partition.depth();
        let mut set = CoPositiveSet::default();
        for z in (0..depth).progress_with(slice_progress(depth)) {
            set.push_slice(self.scan_slice(z)?);
        }
        Ok(set)
    }

    // Sequential scan that renders a comparison view and stops as soon as
    // one slice accumulates more than PREVIEW_TRIGGER co-positive cells.
    // The returned set then covers only the slices scanned so far.
    pub fn run_with_preview(
        &self,
        sink: &mut dyn PreviewSink,
    ) -> Result<CoPositiveSet, DetectError> {
        let depth = self.partition.depth();
        let mut set = CoPositiveSet::default();
        for z in (0..depth).progress_with(slice_progress(depth)) {
            let matches = self.scan_slice(z)?;
            let tripped = matches.len() > PREVIEW_TRIGGER;
            set.push_slice(matches);
            if tripped {
                info!(
                    "slice {z} crossed {PREVIEW_TRIGGER} co-positive cells, rendering preview and stopping"
                );
                self.emit_comparison(z, set.slice(z), sink)?;
                break;
            }
        }
        Ok(set)
    }

    fn scan_slice(&self, z: usize) -> Result<Vec<CellCoordinate>, DetectError> {
        let candidates = self.partition.on_slice(z);
        if candidates.is_empty() {
            // Sparse slices are expected, skip the read entirely.
            return Ok(Vec::new());
        }
        let slice = self.volumes.probability.read_slice(z)?;
        self.matches_on_slice(z, &slice, candidates)
    }

    // Threshold test for every candidate on one slice. Fractional (y, x)
    // are floored onto the pixel grid for the lookup; matches keep their
    // original fractional values.
    fn matches_on_slice(
        &self,
        z: usize,
        slice: &Array2<f32>,
        candidates: &[usize],
    ) -> Result<Vec<CellCoordinate>, DetectError> {
        let (height, width) = slice.dim();
        let mut matches = Vec::new();
        for &i in candidates {
            let coord = self.coords[i];
            let yi = coord.y.floor();
            let xi = coord.x.floor();
            // Inclusive comparisons: NaN fails them all and lands in the
            // error branch rather than saturating to pixel (0, 0).
            if !(yi >= 0.0 && yi < height as f64 && xi >= 0.0 && xi < width as f64) {
                return Err(DetectError::OutOfBoundsCoordinate {
                    z,
                    y: coord.y,
                    x: coord.x,
                    height,
                    width,
                });
            }
            if slice[[yi as usize, xi as usize]] > self.params.threshold {
                matches.push(coord);
            }
        }
        Ok(matches)
    }

    fn emit_comparison(
        &self,
        z: usize,
        matches: &[CellCoordinate],
        sink: &mut dyn PreviewSink,
    ) -> Result<(), DetectError> {
        let scale = self.params.preview_scale;
        let source = rescale_intensity(&self.volumes.source.read_slice(z)?, DISPLAY_STRETCH)?;
        let destination =
            rescale_intensity(&self.volumes.destination.read_slice(z)?, DISPLAY_STRETCH)?;
        let probability = self.volumes.probability.read_slice(z)?;

        let candidates: Vec<CellCoordinate> = self
            .partition
            .on_slice(z)
            .iter()
            .map(|&i| self.coords[i])
            .collect();

        sink.comparison_view(&ComparisonView {
            z,
            source: resize(&source, scale),
            destination: resize(&destination, scale),
            probability: resize(&probability, scale),
            candidates: rescale_coords(&candidates, scale as f64),
            matches: rescale_coords(matches, scale as f64),
            scale,
        });
        Ok(())
    }
}

fn slice_progress(depth: usize) -> ProgressBar {
    let style =
        ProgressStyle::with_template("CoPos {bar:40} {pos}/{len} slices ({eta})").unwrap();
    ProgressBar::new(depth as u64).with_style(style)
}
