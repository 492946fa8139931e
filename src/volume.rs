use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

#[cfg(test)]
use ndarray::s;
use ndarray::{Array2, Array3, ArrayD, Axis, Ix3};
use thiserror::Error;
use zarrs::array::DataType;
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("unable to open zarr array at {path}: {reason}")]
    ZarrOpen { path: PathBuf, reason: String },

    #[error("unable to read zarr array at {path}: {reason}")]
    ZarrRead { path: PathBuf, reason: String },

    #[error("expected a 3d array, found {ndim} dimensions")]
    NotThreeDimensional { ndim: usize },

    #[error("unsupported zarr data type {dtype}")]
    UnsupportedDataType { dtype: String },

    #[error("invalid region on {axis} axis: {lo} must not exceed {hi}")]
    InvalidRegion { axis: char, lo: usize, hi: usize },

    #[error("slice {z} out of range for a volume with {depth} slices")]
    SliceOutOfRange { z: usize, depth: usize },

    #[error("unable to parse region \"{text}\", expected z0:z1,y0:y1,x0:x1")]
    ParseRegion { text: String },
}

// An axis-aligned box of three half-open index ranges, in (z, y, x) order
// to match how volumes are indexed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub z0: usize,
    pub z1: usize,
    pub y0: usize,
    pub y1: usize,
    pub x0: usize,
    pub x1: usize,
}

impl Region {
    pub fn new(
        z: (usize, usize),
        y: (usize, usize),
        x: (usize, usize),
    ) -> Result<Region, VolumeError> {
        for (axis, (lo, hi)) in [('z', z), ('y', y), ('x', x)] {
            if lo > hi {
                return Err(VolumeError::InvalidRegion { axis, lo, hi });
            }
        }
        Ok(Region {
            z0: z.0,
            z1: z.1,
            y0: y.0,
            y1: y.1,
            x0: x.0,
            x1: x.1,
        })
    }

    pub fn depth(&self) -> usize {
        self.z1 - self.z0
    }

    pub fn height(&self) -> usize {
        self.y1 - self.y0
    }

    pub fn width(&self) -> usize {
        self.x1 - self.x0
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0 || self.height() == 0 || self.width() == 0
    }

    // Shrink the box to fit a volume of the given (z, y, x) shape, keeping
    // bounds ordered.
    pub fn clamp_to(&self, shape: (usize, usize, usize)) -> Region {
        let (depth, height, width) = shape;
        Region {
            z0: self.z0.min(depth),
            z1: self.z1.min(depth),
            y0: self.y0.min(height),
            y1: self.y1.min(height),
            x0: self.x0.min(width),
            x1: self.x1.min(width),
        }
    }

    // Half-open containment on all three axes. Fractional positions compare
    // numerically: (y=3.5, x=4.9) lies inside y:0..4, x:0..5.
    pub fn contains(&self, z: f64, y: f64, x: f64) -> bool {
        self.z0 as f64 <= z
            && z < self.z1 as f64
            && self.y0 as f64 <= y
            && y < self.y1 as f64
            && self.x0 as f64 <= x
            && x < self.x1 as f64
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{},{}:{},{}:{}",
            self.z0, self.z1, self.y0, self.y1, self.x0, self.x1
        )
    }
}

impl FromStr for Region {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Region, VolumeError> {
        let parse_err = || VolumeError::ParseRegion {
            text: s.to_string(),
        };

        let mut bounds = [(0usize, 0usize); 3];
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 3 {
            return Err(parse_err());
        }
        for (bound, part) in bounds.iter_mut().zip(parts) {
            let (lo, hi) = part.trim().split_once(':').ok_or_else(parse_err)?;
            bound.0 = lo.trim().parse().map_err(|_| parse_err())?;
            bound.1 = hi.trim().parse().map_err(|_| parse_err())?;
        }
        Region::new(bounds[0], bounds[1], bounds[2])
    }
}

// Read access to a 3d scalar array indexed (z, y, x). Intensities are
// widened to f32 regardless of the stored data type.
pub trait VolumeSource {
    // (depth, height, width)
    fn shape(&self) -> (usize, usize, usize);

    // The region is clamped to the volume shape first: boxes reaching past
    // the edge come back smaller, zero-volume boxes come back empty.
    fn read_box(&self, region: &Region) -> Result<Array3<f32>, VolumeError>;

    fn read_slice(&self, z: usize) -> Result<Array2<f32>, VolumeError> {
        let (depth, height, width) = self.shape();
        if z >= depth {
            return Err(VolumeError::SliceOutOfRange { z, depth });
        }
        let region = Region::new((z, z + 1), (0, height), (0, width))?;
        Ok(self.read_box(&region)?.index_axis_move(Axis(0), 0))
    }
}

// A volume held entirely in memory, the stand-in store for tests.
#[cfg(test)]
pub struct MemVolume {
    data: Array3<f32>,
}

#[cfg(test)]
impl MemVolume {
    pub fn new(data: Array3<f32>) -> MemVolume {
        MemVolume { data }
    }
}

#[cfg(test)]
impl VolumeSource for MemVolume {
    fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    fn read_box(&self, region: &Region) -> Result<Array3<f32>, VolumeError> {
        let r = region.clamp_to(self.shape());
        Ok(self
            .data
            .slice(s![r.z0..r.z1, r.y0..r.y1, r.x0..r.x1])
            .to_owned())
    }

    fn read_slice(&self, z: usize) -> Result<Array2<f32>, VolumeError> {
        let (depth, _, _) = self.shape();
        if z >= depth {
            return Err(VolumeError::SliceOutOfRange { z, depth });
        }
        Ok(self.data.index_axis(Axis(0), z).to_owned())
    }
}

pub struct ZarrVolume {
    path: PathBuf,
    array: zarrs::array::Array<FilesystemStore>,
    shape: (usize, usize, usize),
}

impl ZarrVolume {
    pub fn open(path: &Path) -> Result<ZarrVolume, VolumeError> {
        let open_err = |reason: String| VolumeError::ZarrOpen {
            path: path.to_path_buf(),
            reason,
        };

        let store =
            Arc::new(FilesystemStore::new(path).map_err(|err| open_err(err.to_string()))?);
        let array = zarrs::array::Array::open(store, "/")
            .map_err(|err| open_err(err.to_string()))?;

        let shape = array.shape();
        if shape.len() != 3 {
            return Err(VolumeError::NotThreeDimensional { ndim: shape.len() });
        }
        let shape = (shape[0] as usize, shape[1] as usize, shape[2] as usize);

        Ok(ZarrVolume {
            path: path.to_path_buf(),
            array,
            shape,
        })
    }

    fn retrieve<T: zarrs::array::ElementOwned>(
        &self,
        subset: &ArraySubset,
    ) -> Result<ArrayD<T>, VolumeError> {
        self.array
            .retrieve_array_subset_ndarray::<T>(subset)
            .map_err(|err| VolumeError::ZarrRead {
                path: self.path.clone(),
                reason: err.to_string(),
            })
    }
}

impl VolumeSource for ZarrVolume {
    fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    fn read_box(&self, region: &Region) -> Result<Array3<f32>, VolumeError> {
        let r = region.clamp_to(self.shape);
        if r.is_empty() {
            return Ok(Array3::zeros((r.depth(), r.height(), r.width())));
        }

        let subset = ArraySubset::new_with_ranges(&[
            r.z0 as u64..r.z1 as u64,
            r.y0 as u64..r.y1 as u64,
            r.x0 as u64..r.x1 as u64,
        ]);

        let values = match self.array.data_type() {
            DataType::Float32 => self.retrieve::<f32>(&subset)?,
            DataType::Float64 => self.retrieve::<f64>(&subset)?.mapv(|v| v as f32),
            DataType::UInt8 => self.retrieve::<u8>(&subset)?.mapv(|v| v as f32),
            DataType::UInt16 => self.retrieve::<u16>(&subset)?.mapv(|v| v as f32),
            DataType::UInt32 => self.retrieve::<u32>(&subset)?.mapv(|v| v as f32),
            DataType::UInt64 => self.retrieve::<u64>(&subset)?.mapv(|v| v as f32),
            DataType::Int8 => self.retrieve::<i8>(&subset)?.mapv(|v| v as f32),
            DataType::Int16 => self.retrieve::<i16>(&subset)?.mapv(|v| v as f32),
            DataType::Int32 => self.retrieve::<i32>(&subset)?.mapv(|v| v as f32),
            DataType::Int64 => self.retrieve::<i64>(&subset)?.mapv(|v| v as f32),
            dtype => {
                return Err(VolumeError::UnsupportedDataType {
                    dtype: format!("{dtype:?}"),
                });
            }
        };

        values
            .into_dimensionality::<Ix3>()
            .map_err(|err| VolumeError::ZarrRead {
                path: self.path.clone(),
                reason: err.to_string(),
            })
    }
}

// The three aligned arrays a run operates on. Co-registration is an input
// precondition: the probability map shares the destination's coordinate
// system and shape.
pub struct CoRegistered<V: VolumeSource> {
    pub source: V,
    pub destination: V,
    pub probability: V,
}

impl<V: VolumeSource> CoRegistered<V> {
    // Carve the same box out of all three arrays.
    pub fn subvolumes(
        &self,
        region: &Region,
    ) -> Result<(Array3<f32>, Array3<f32>, Array3<f32>), VolumeError> {
        Ok((
            self.source.read_box(region)?,
            self.destination.read_box(region)?,
            self.probability.read_box(region)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled_volume(depth: usize, height: usize, width: usize) -> Array3<f32> {
        Array3::from_shape_fn((depth, height, width), |(z, y, x)| {
            (z * 10000 + y * 100 + x) as f32
        })
    }

    #[test]
    fn test_region_validation() {
        assert!(Region::new((0, 4), (1, 1), (2, 9)).is_ok());

        let err = Region::new((0, 4), (5, 2), (0, 9)).unwrap_err();
        match err {
            VolumeError::InvalidRegion { axis, lo, hi } => {
                assert_eq!(axis, 'y');
                assert_eq!((lo, hi), (5, 2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_region_parse() {
        let region: Region = "2:5, 0:10, 3:7".parse().unwrap();
        assert_eq!(region, Region::new((2, 5), (0, 10), (3, 7)).unwrap());
        assert_eq!(region.to_string().parse::<Region>().unwrap(), region);

        assert!(matches!(
            "2:5,0:10".parse::<Region>(),
            Err(VolumeError::ParseRegion { .. })
        ));
        assert!(matches!(
            "2:5,0:ten,3:7".parse::<Region>(),
            Err(VolumeError::ParseRegion { .. })
        ));
        assert!(matches!(
            "5:2,0:10,3:7".parse::<Region>(),
            Err(VolumeError::InvalidRegion { .. })
        ));
    }

    #[test]
    fn test_region_clamp_and_contains() {
        let region = Region::new((0, 10), (2, 20), (0, 8)).unwrap();
        let clamped = region.clamp_to((4, 5, 8));
        assert_eq!(clamped, Region::new((0, 4), (2, 5), (0, 8)).unwrap());

        assert!(region.contains(0.0, 2.0, 0.0));
        assert!(region.contains(9.0, 3.5, 7.9));
        assert!(!region.contains(10.0, 3.0, 3.0));
        assert!(!region.contains(3.0, 1.9, 3.0));
        assert!(!region.contains(3.0, 3.0, 8.0));
    }

    #[test]
    fn test_mem_volume_reads() {
        let vol = MemVolume::new(labeled_volume(4, 5, 6));
        assert_eq!(vol.shape(), (4, 5, 6));

        let slice = vol.read_slice(2).unwrap();
        assert_eq!(slice.dim(), (5, 6));
        assert_eq!(slice[[3, 4]], 20304.0);

        assert!(matches!(
            vol.read_slice(4),
            Err(VolumeError::SliceOutOfRange { z: 4, depth: 4 })
        ));

        let boxed = vol
            .read_box(&Region::new((1, 3), (0, 2), (4, 6)).unwrap())
            .unwrap();
        assert_eq!(boxed.dim(), (2, 2, 2));
        assert_eq!(boxed[[0, 0, 0]], 10004.0);
        assert_eq!(boxed[[1, 1, 1]], 20105.0);
    }

    #[test]
    fn test_read_box_clamps_to_shape() {
        let vol = MemVolume::new(labeled_volume(3, 4, 5));
        let oversized = Region::new((0, 99), (2, 99), (0, 99)).unwrap();
        let boxed = vol.read_box(&oversized).unwrap();
        assert_eq!(boxed.dim(), (3, 2, 5));

        let beyond = Region::new((3, 9), (0, 4), (0, 5)).unwrap();
        assert_eq!(vol.read_box(&beyond).unwrap().dim(), (0, 4, 5));
    }

    #[test]
    fn test_zero_volume_region_yields_empty_box() {
        let vol = MemVolume::new(labeled_volume(3, 4, 5));
        let flat = Region::new((1, 1), (0, 4), (0, 5)).unwrap();
        assert!(flat.is_empty());
        assert_eq!(vol.read_box(&flat).unwrap().len(), 0);
    }

    #[test]
    fn test_region_extraction_idempotent() {
        let vol = MemVolume::new(labeled_volume(6, 7, 8));
        let region = Region::new((1, 4), (2, 6), (0, 5)).unwrap();
        let sub = vol.read_box(&region).unwrap();

        let again = MemVolume::new(sub.clone());
        let full = Region::new((0, sub.dim().0), (0, sub.dim().1), (0, sub.dim().2)).unwrap();
        assert_eq!(again.read_box(&full).unwrap(), sub);
    }

    #[test]
    fn test_subvolumes_match_across_channels() {
        let volumes = CoRegistered {
            source: MemVolume::new(labeled_volume(3, 4, 5)),
            destination: MemVolume::new(labeled_volume(3, 4, 5).mapv(|v| v + 1.0)),
            probability: MemVolume::new(Array3::zeros((3, 4, 5))),
        };

        let region = Region::new((0, 2), (1, 3), (2, 4)).unwrap();
        let (src, dst, prob) = volumes.subvolumes(&region).unwrap();
        assert_eq!(src.dim(), (2, 2, 2));
        assert_eq!(dst, src.mapv(|v| v + 1.0));
        assert_eq!(prob.sum(), 0.0);
    }
}
