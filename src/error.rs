use thiserror::Error;

use crate::bytecode::image::ImageError;
use crate::bytecode::load_error::LoadError;
use crate::runtime::error::RuntimeError;

/// Anything that can stop the VM from loading or finishing a program.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Load(#[from] LoadError),

    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    #[error("{0}")]
    Image(#[from] ImageError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Usage(String),
}
