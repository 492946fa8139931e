use std::fs;
use std::fs::File;
use std::io;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;
use ndarray_npy::{write_npy, WriteNpyError};
use thiserror::Error;

use crate::coords::CellCoordinate;
use crate::detector::CoPositiveSet;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("unable to write {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("unable to write {path}: {source}")]
    Npy {
        path: PathBuf,
        source: WriteNpyError,
    },

    #[error("unable to write {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

// Paths of the three files a run leaves behind.
#[derive(Debug)]
pub struct RunArtifacts {
    pub npy: PathBuf,
    pub json: PathBuf,
    pub json_xyz: PathBuf,
}

// Persist the flattened co-positive list: an M x 3 array in z-y-x order as
// binary and json, plus an x-y-z json for consumers expecting that axis
// order. Each file lands via write-then-rename; a failed run never leaves a
// half-written artifact under its final name.
pub fn write_copositive_set(
    outdir: &Path,
    threshold: f32,
    set: &CoPositiveSet,
) -> Result<RunArtifacts, PersistError> {
    fs::create_dir_all(outdir).map_err(|err| PersistError::Io {
        path: outdir.to_path_buf(),
        source: err,
    })?;

    let zyx = coords_to_array(&set.flatten());
    let base = format!("CoPosCC_ccPos_thr_{threshold:.2}");

    let npy = outdir.join(format!("{base}.npy"));
    write_npy_atomic(&npy, &zyx)?;

    let json = outdir.join(format!("{base}.json"));
    write_json_atomic(&json, &zyx)?;

    let json_xyz = outdir.join(format!("{base}_xyz.json"));
    write_json_atomic(&json_xyz, &swap_zx(&zyx))?;

    Ok(RunArtifacts {
        npy,
        json,
        json_xyz,
    })
}

// Flattened coordinates as an M x 3 array with (z, y, x) columns.
pub fn coords_to_array(coords: &[CellCoordinate]) -> Array2<f64> {
    let mut array = Array2::zeros((coords.len(), 3));
    for (i, coord) in coords.iter().enumerate() {
        array[[i, 0]] = coord.z;
        array[[i, 1]] = coord.y;
        array[[i, 2]] = coord.x;
    }
    array
}

// Swap columns 0 and 2, turning z-y-x rows into x-y-z rows.
pub fn swap_zx(zyx: &Array2<f64>) -> Array2<f64> {
    let mut out = zyx.clone();
    for mut row in out.rows_mut() {
        row.swap(0, 2);
    }
    out
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn rename_into_place(tmp: &Path, path: &Path) -> Result<(), PersistError> {
    fs::rename(tmp, path).map_err(|err| PersistError::Io {
        path: path.to_path_buf(),
        source: err,
    })
}

fn write_npy_atomic(path: &Path, array: &Array2<f64>) -> Result<(), PersistError> {
    let tmp = tmp_sibling(path);
    write_npy(&tmp, array).map_err(|err| PersistError::Npy {
        path: path.to_path_buf(),
        source: err,
    })?;
    rename_into_place(&tmp, path)
}

fn write_json_atomic(path: &Path, array: &Array2<f64>) -> Result<(), PersistError> {
    let io_err = |err: io::Error| PersistError::Io {
        path: path.to_path_buf(),
        source: err,
    };

    let rows: Vec<[f64; 3]> = array
        .rows()
        .into_iter()
        .map(|row| [row[0], row[1], row[2]])
        .collect();

    let tmp = tmp_sibling(path);
    let mut writer = BufWriter::new(File::create(&tmp).map_err(io_err)?);
    serde_json::to_writer_pretty(&mut writer, &rows).map_err(|err| PersistError::Json {
        path: path.to_path_buf(),
        source: err,
    })?;
    writer.flush().map_err(io_err)?;
    drop(writer);

    rename_into_place(&tmp, path)
}
