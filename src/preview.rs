use log::info;
use ndarray::Array2;

use crate::coords::CellCoordinate;
use crate::volume::Region;

// A side-by-side look at one slice: both channels stretched for display,
// the raw probability map, and the candidate and co-positive coordinates,
// all downscaled by the same factor.
#[allow(dead_code)]
pub struct ComparisonView {
    pub z: usize,
    pub source: Array2<f32>,
    pub destination: Array2<f32>,
    pub probability: Array2<f32>,
    pub candidates: Vec<CellCoordinate>,
    pub matches: Vec<CellCoordinate>,
    pub scale: f32,
}

// Max-projections of one sub-volume from each of the three arrays.
#[allow(dead_code)]
pub struct ProjectionView {
    pub source: Array2<f32>,
    pub destination: Array2<f32>,
    pub probability: Array2<f32>,
    pub region: Region,
}

// Receives rendered views. Rendering backends live outside this crate; the
// default sink just records what it saw in the log.
pub trait PreviewSink {
    fn comparison_view(&mut self, view: &ComparisonView);
    fn max_projection_view(&mut self, view: &ProjectionView);
}

#[derive(Default)]
pub struct LogPreview;

impl PreviewSink for LogPreview {
    fn comparison_view(&mut self, view: &ComparisonView) {
        let (height, width) = view.probability.dim();
        info!(
            "slice {}: {} candidates, {} co-positive, {width}x{height} display at {:.0}% scale",
            view.z,
            view.candidates.len(),
            view.matches.len(),
            100.0 * view.scale
        );
    }

    fn max_projection_view(&mut self, view: &ProjectionView) {
        let (height, width) = view.source.dim();
        info!(
            "max projection over {}: {width}x{height} source/destination/probability views",
            view.region
        );
    }
}
