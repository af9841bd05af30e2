//! Master dark construction: average a folder of dark TIFF captures into one `.npy`.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use ndarray::{stack, Array2, ArrayD, Axis};
use tiff::decoder::{Decoder, DecodingResult};
use tracing::{debug, info};

use super::npy;
use crate::error::{AppResult, DaqError};

/// Mean of a set of dark exposures.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterDark {
    /// Per-pixel mean; 2-D for single-page inputs, channel-first 3-D for stacks.
    pub data: ArrayD<f64>,
    /// Number of dark captures averaged.
    pub frames: usize,
}

/// Average every `.tif`/`.tiff` file in `input_dir`.
pub fn build_master_dark(input_dir: &Path) -> AppResult<MasterDark> {
    let files = dark_files(input_dir)?;
    if files.is_empty() {
        return Err(DaqError::Calibration {
            path: input_dir.to_path_buf(),
            reason: "no .tif dark frames found".to_string(),
        });
    }
    info!(dir = %input_dir.display(), frames = files.len(), "Averaging dark frames");

    let mut sum: Option<ArrayD<f64>> = None;
    for path in &files {
        let frame = read_tiff(path)?;
        debug!(file = %path.display(), shape = ?frame.shape(), "Loaded dark frame");
        sum = Some(match sum.take() {
            None => frame,
            Some(acc) if acc.shape() == frame.shape() => acc + &frame,
            Some(acc) => {
                return Err(DaqError::Calibration {
                    path: path.clone(),
                    reason: format!(
                        "shape {:?} differs from earlier dark frames {:?}",
                        frame.shape(),
                        acc.shape()
                    ),
                })
            }
        });
    }

    let frames = files.len();
    let data = sum.map(|acc| acc / frames as f64).unwrap_or_default();
    Ok(MasterDark { data, frames })
}

/// Build the master dark and save it as `.npy`.
pub fn write_master_dark(input_dir: &Path, output: &Path) -> AppResult<MasterDark> {
    let dark = build_master_dark(input_dir)?;
    npy::write_npy(output, &dark.data)?;
    info!(
        output = %output.display(),
        shape = ?dark.data.shape(),
        frames = dark.frames,
        "Master dark frame saved"
    );
    Ok(dark)
}

fn dark_files(dir: &Path) -> AppResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff"))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Decode every page of a grayscale TIFF; multi-page files become a channel stack.
pub(crate) fn read_tiff(path: &Path) -> AppResult<ArrayD<f64>> {
    let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;
    let mut planes = Vec::new();
    loop {
        let (width, height) = decoder.dimensions()?;
        let values = widen(decoder.read_image()?).ok_or_else(|| DaqError::Calibration {
            path: path.to_path_buf(),
            reason: "unsupported TIFF sample format".to_string(),
        })?;
        planes.push(Array2::from_shape_vec(
            (height as usize, width as usize),
            values,
        )?);
        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }

    if planes.len() == 1 {
        return Ok(planes.remove(0).into_dyn());
    }
    let views: Vec<_> = planes.iter().map(|plane| plane.view()).collect();
    Ok(stack(Axis(0), &views)?.into_dyn())
}

fn widen(result: DecodingResult) -> Option<Vec<f64>> {
    #[allow(unreachable_patterns)]
    let values = match result {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        _ => return None,
    };
    Some(values)
}
