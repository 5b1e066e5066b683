use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::*;

/// A local descriptor and where it was computed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LocalFeature {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
    pub descriptor: Vec<f32>,
}

impl AsRef<[f32]> for LocalFeature {
    fn as_ref(&self) -> &[f32] {
        &self.descriptor
    }
}

/// Turns encoded image bytes into a grayscale pixel grid.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> PhowResult<GrayImage>;

    /// Names the decoder in feature cache namespaces. Decoders whose output
    /// depends on their settings must include those settings.
    fn identity(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Decodes any format the `image` crate recognises.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, bytes: &[u8]) -> PhowResult<GrayImage> {
        Ok(image::load_from_memory(bytes)?.to_luma8())
    }
}

/// Detects keypoints on an image and describes them.
///
/// Implementations return an empty list, never an error, for images
/// too small to hold a single descriptor.
pub trait KeypointExtractor: Send + Sync {
    fn detect(&self, image: &GrayImage) -> Vec<LocalFeature>;

    /// Length of every descriptor this extractor produces.
    fn descriptor_len(&self) -> usize;
}
