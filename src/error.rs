use image::ImageError;
use thiserror::Error;

use std::io::Error as IOError;

use crate::cascade::CascadeError;

#[derive(Debug, Error)]
pub enum LprError {
    #[error(transparent)]
    IOError(#[from] IOError),
    #[error(transparent)]
    ImageError(#[from] ImageError),
    #[error("cascade classifier: {0}")]
    CascadeError(#[from] CascadeError),
}
