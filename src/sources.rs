//! Sample identifiers for a run.
//!
//! Samples are either named after the stimulus images shown to the cameras (sorted
//! file names, extension stripped) or numbered.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::{AppResult, DaqError};

const STIMULUS_EXTENSIONS: [&str; 2] = ["jpg", "png"];

/// Sample ids from the `.jpg`/`.png` files in `dir`, in file-name order.
///
/// Two stimuli sharing a stem (`scene.jpg`, `scene.png`) would write to the same
/// artifacts, so they are rejected.
pub fn stimulus_samples(dir: &Path) -> AppResult<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| {
                        STIMULUS_EXTENSIONS
                            .iter()
                            .any(|known| ext.eq_ignore_ascii_case(known))
                    })
        })
        .filter_map(|path| path.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .collect();
    names.sort();

    let samples: Vec<String> = names
        .iter()
        .filter_map(|name| Path::new(name).file_stem().and_then(|s| s.to_str()))
        .map(str::to_string)
        .collect();
    if samples.is_empty() {
        return Err(DaqError::Configuration(format!(
            "no .jpg or .png stimuli in '{}'",
            dir.display()
        )));
    }

    let mut seen = HashSet::new();
    if let Some(duplicate) = samples.iter().find(|id| !seen.insert(id.as_str())) {
        return Err(DaqError::Configuration(format!(
            "several stimuli in '{}' share the sample id '{duplicate}'",
            dir.display()
        )));
    }
    Ok(samples)
}

/// `count` sample ids `start`, `start + 1`, ...
pub fn numbered_samples(start: usize, count: usize) -> Vec<String> {
    (start..start + count).map(|n| n.to_string()).collect()
}
