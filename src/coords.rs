use std::path::{Path, PathBuf};

use log::warn;
use ndarray::Array2;
use ndarray_npy::{read_npy, ReadNpyError, ReadableElement};
use num_traits::AsPrimitive;
use thiserror::Error;

use crate::volume::Region;

#[derive(Error, Debug)]
pub enum CoordinateError {
    #[error("unable to read coordinates from {path}: {source}")]
    Read {
        path: PathBuf,
        source: ReadNpyError,
    },

    #[error("coordinate array at {path} has shape {rows}x{cols}, expected Nx3")]
    BadShape {
        path: PathBuf,
        rows: usize,
        cols: usize,
    },

    #[error("coordinate array at {path} has an unsupported dtype")]
    UnsupportedDtype { path: PathBuf },
}

// A cell center position in volume space. z names a slice, y and x are
// (possibly fractional) pixel positions within that slice.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CellCoordinate {
    pub z: f64,
    pub y: f64,
    pub x: f64,
}

impl CellCoordinate {
    pub fn new(z: f64, y: f64, x: f64) -> CellCoordinate {
        CellCoordinate { z, y, x }
    }

    // The slice this coordinate sits on, when z is a whole non-negative
    // number. Fractional or negative z never matches any slice.
    pub fn slice_index(&self) -> Option<usize> {
        if self.z >= 0.0 && self.z.fract() == 0.0 {
            Some(self.z as usize)
        } else {
            None
        }
    }
}

fn read_as_f64<T>(path: &Path) -> Result<Option<Array2<f64>>, CoordinateError>
where
    T: ReadableElement + Copy + AsPrimitive<f64>,
{
    match read_npy::<_, Array2<T>>(path) {
        Ok(array) => Ok(Some(array.mapv(|v| v.as_()))),
        Err(ReadNpyError::WrongDescriptor(_)) => Ok(None),
        Err(err) => Err(CoordinateError::Read {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}

// Read an Nx3 (z, y, x) coordinate array from a .npy file. Stored dtypes
// other than f64 are widened on load.
pub fn read_coordinates_npy(path: &Path) -> Result<Vec<CellCoordinate>, CoordinateError> {
    let mut array = read_as_f64::<f64>(path)?;
    if array.is_none() {
        array = read_as_f64::<f32>(path)?;
    }
    if array.is_none() {
        array = read_as_f64::<i64>(path)?;
    }
    if array.is_none() {
        array = read_as_f64::<i32>(path)?;
    }
    if array.is_none() {
        array = read_as_f64::<u16>(path)?;
    }
    let array = array.ok_or_else(|| CoordinateError::UnsupportedDtype {
        path: path.to_path_buf(),
    })?;

    if array.ncols() != 3 {
        return Err(CoordinateError::BadShape {
            path: path.to_path_buf(),
            rows: array.nrows(),
            cols: array.ncols(),
        });
    }

    let coords: Vec<CellCoordinate> = array
        .rows()
        .into_iter()
        .map(|row| CellCoordinate::new(row[0], row[1], row[2]))
        .collect();

    let unassignable = coords.iter().filter(|c| c.slice_index().is_none()).count();
    if unassignable > 0 {
        warn!(
            "{unassignable} of {} coordinates have fractional or negative z and will never match a slice",
            coords.len()
        );
    }

    Ok(coords)
}

// Coordinate indices bucketed by slice, built once per run. Within each
// bucket indices keep their order of appearance in the input.
pub struct SlicePartition {
    buckets: Vec<Vec<usize>>,
}

impl SlicePartition {
    pub fn build(coords: &[CellCoordinate], depth: usize) -> SlicePartition {
        let mut buckets = vec![Vec::new(); depth];
        let mut beyond = 0;
        for (i, coord) in coords.iter().enumerate() {
            match coord.slice_index() {
                Some(z) if z < depth => buckets[z].push(i),
                Some(_) => beyond += 1,
                None => {}
            }
        }
        if beyond > 0 {
            warn!("{beyond} coordinates lie beyond the last probability slice and are ignored");
        }
        SlicePartition { buckets }
    }

    pub fn on_slice(&self, z: usize) -> &[usize] {
        &self.buckets[z]
    }

    pub fn depth(&self) -> usize {
        self.buckets.len()
    }
}

// Stable filter of the coordinates falling inside a region. With `relative`
// set, survivors are re-expressed against the region's origin.
pub fn coords_in_region(
    coords: &[CellCoordinate],
    region: &Region,
    relative: bool,
) -> Vec<CellCoordinate> {
    coords
        .iter()
        .filter(|c| region.contains(c.z, c.y, c.x))
        .map(|c| {
            if relative {
                CellCoordinate::new(
                    c.z - region.z0 as f64,
                    c.y - region.y0 as f64,
                    c.x - region.x0 as f64,
                )
            } else {
                *c
            }
        })
        .collect()
}

// Scale the in-slice (y, x) components by `factor`, z untouched. Returns a
// new list, the input is never mutated.
pub fn rescale_coords(coords: &[CellCoordinate], factor: f64) -> Vec<CellCoordinate> {
    coords
        .iter()
        .map(|c| CellCoordinate::new(c.z, c.y * factor, c.x * factor))
        .collect()
}
