use log::{ debug, error, info, warn };

use std::fs;
use std::path::Path;

use crate::Lpr;
use crate::config::Config;
use crate::error::LprError;

/// Counters of one batch run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    /// regular files found in the input directory
    pub processed: usize,
    /// annotated images written to the output directory
    pub written: usize,
    /// files that could not be decoded or had no region of interest
    pub skipped: usize,
    /// files that could not be written, or unreadable directory entries
    pub failed: usize,
    /// plate outlines drawn over all images
    pub plates: usize,
}

enum FileOutcome {
    Written { plates: usize },
    Skipped,
}

/// Annotate every image of `config.input_dir` into `config.output_dir`.
/// A missing input directory is not an error, nothing happens at all.
/// Failures of a single file are logged and counted, the batch goes on.
pub fn run(lpr: &Lpr, config: &Config) -> Result<BatchSummary, LprError> {
    let input_dir = config.input_dir.as_path();
    let output_dir = config.output_dir.as_path();
    let mut summary = BatchSummary::default();
    if !input_dir.is_dir() {
        info!("input directory {:?} not found, nothing to do", input_dir);
        return Ok(summary);
    }
    fs::create_dir_all(output_dir)?;

    for entry in fs::read_dir(input_dir)? {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                warn!("unreadable entry in {:?}: {}", input_dir, e);
                summary.failed += 1;
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        summary.processed += 1;

        match process_file(lpr, &path, output_dir) {
            Ok(FileOutcome::Written { plates }) => {
                summary.written += 1;
                summary.plates += plates;
            }
            Ok(FileOutcome::Skipped) => summary.skipped += 1,
            Err(e) => {
                error!("failed to write result for {:?}: {}", path, e);
                summary.failed += 1;
            }
        }
    }

    info!("processed {} files: {} written, {} skipped, {} failed, {} plates",
        summary.processed, summary.written, summary.skipped, summary.failed, summary.plates);
    Ok(summary)
}

fn process_file(lpr: &Lpr, path: &Path, output_dir: &Path) -> Result<FileOutcome, LprError> {
    let img = match image::open(path) {
        Ok(img) => img,
        Err(e) => {
            warn!("skipping {:?}: {}", path, e);
            return Ok(FileOutcome::Skipped);
        }
    };

    let annotated = match lpr.recognize(&img) {
        Some(annotated) => annotated,
        None => {
            debug!("no region of interest in {:?}", path);
            return Ok(FileOutcome::Skipped);
        }
    };

    // is_file() held, so there is a file name
    let output = match path.file_name() {
        Some(name) => output_dir.join(name),
        None => return Ok(FileOutcome::Skipped),
    };
    annotated.image.save(&output)?;
    info!("{:?}: {} plate(s) -> {:?}", path, annotated.plates.len(), output);
    Ok(FileOutcome::Written { plates: annotated.plates.len() })
}
