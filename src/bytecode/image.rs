//! Pre-linked program images.
//!
//! An image is the content of a [`MethodArea`] after loading: constants,
//! function and class records with indices already relocated. Loading one
//! goes back through the registration path and the verifier, but skips the
//! `.ball` parser.

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::constant::Constant;
use crate::bytecode::verify::{self, VerifyError};
use crate::runtime::error::VmError;
use crate::runtime::method_area::{ClassDef, FunctionDef, MethodArea};

pub const IMAGE_MAGIC: u32 = 0x6269_6D67;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image codec error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("not a program image (magic 0x{0:08x})")]
    BadMagic(u32),

    #[error("image rejected: {0}")]
    Register(#[from] VmError),

    #[error("image rejected: {0}")]
    Verify(#[from] VerifyError),
}

#[derive(Debug, Serialize, Deserialize)]
struct Image {
    magic: u32,
    constants: Vec<Constant>,
    functions: Vec<FunctionDef>,
    classes: Vec<ClassDef>,
}

pub fn save_image(area: &MethodArea) -> Result<Vec<u8>, ImageError> {
    let image = Image {
        magic: IMAGE_MAGIC,
        constants: area.constants().to_vec(),
        functions: area.functions().iter().map(|f| f.def.clone()).collect(),
        classes: area.classes().iter().map(|c| c.def.clone()).collect(),
    };
    Ok(postcard::to_allocvec(&image)?)
}

pub fn load_image(bytes: &[u8]) -> Result<MethodArea, ImageError> {
    let image: Image = postcard::from_bytes(bytes)?;
    if image.magic != IMAGE_MAGIC {
        return Err(ImageError::BadMagic(image.magic));
    }

    let mut area = MethodArea::new();
    for constant in image.constants {
        area.register_constant(constant);
    }
    for def in image.functions {
        area.register_function(def)?;
    }
    for def in image.classes {
        area.register_class(def)?;
    }
    verify::verify_from(&area, 0)?;

    info!(
        "loaded image: {} constants, {} functions, {} classes",
        area.constants().len(),
        area.functions().len(),
        area.classes().len()
    );
    Ok(area)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::test_support::function_ball;

    #[test]
    fn test_image_preserves_area() {
        let mut b = function_ball();
        b.class("Pair", &[("a", "I;"), ("b", "B;")], vec![0]);
        let area = b.to_area();

        let restored = load_image(&save_image(&area).unwrap()).unwrap();
        assert_eq!(restored.constants(), area.constants());
        assert_eq!(restored.functions().len(), 2);
        assert_eq!(restored.function_by_name("Sum").unwrap().def, area.functions()[0].def);
        assert_eq!(restored.class_by_name("Pair").unwrap().size, 5);
    }

    #[test]
    fn test_rejects_foreign_bytes() {
        let image = Image {
            magic: 0x1234_5678,
            constants: vec![],
            functions: vec![],
            classes: vec![],
        };
        let bytes = postcard::to_allocvec(&image).unwrap();
        assert!(matches!(load_image(&bytes), Err(ImageError::BadMagic(0x1234_5678))));
        assert!(matches!(load_image(&[0xff]), Err(ImageError::Codec(_))));
    }
}
