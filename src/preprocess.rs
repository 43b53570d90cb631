//! Image decode and normalization for the MobileNetV2-style input.
//!
//! Raw upload bytes become a batch-of-one f32 tensor: alpha is flattened onto
//! a white background, the EXIF orientation tag is applied, the image is
//! resized to 224x224 with Lanczos3, and pixel values are scaled into [-1, 1].

use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Rgb};
use thiserror::Error;

pub const INPUT_HEIGHT: u32 = 224;
pub const INPUT_WIDTH: u32 = 224;
pub const INPUT_CHANNELS: u32 = 3;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// A normalized image ready to feed the model: shape `[1, 224, 224, 3]`,
/// row-major, channels interleaved.
#[derive(Debug)]
pub struct ImageTensor {
    data: Vec<f32>,
}

impl ImageTensor {
    pub fn shape(&self) -> [u64; 4] {
        [1, INPUT_HEIGHT as u64, INPUT_WIDTH as u64, INPUT_CHANNELS as u64]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn min(&self) -> f32 {
        self.data.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }
}

/// Turns raw upload bytes into a normalized input tensor.
pub fn preprocess_image(bytes: &[u8]) -> Result<ImageTensor, PreprocessError> {
    let decoded = image::load_from_memory(bytes)?;
    let flattened = flatten_alpha(decoded);
    let oriented = apply_orientation(bytes, flattened);
    let resized = oriented.resize_exact(INPUT_WIDTH, INPUT_HEIGHT, FilterType::Lanczos3);
    let rgb = resized.to_rgb8();

    let data = rgb
        .pixels()
        .flat_map(|pixel| pixel.0)
        .map(|channel| channel as f32 / 127.5 - 1.0)
        .collect();

    Ok(ImageTensor { data })
}

/// Checks that a byte blob decodes to a structurally valid image, without
/// running the full pipeline. Not called from any endpoint.
#[allow(dead_code)]
pub fn validate_image(bytes: &[u8]) -> bool {
    image::load_from_memory(bytes)
        .map(|img| img.width() > 0 && img.height() > 0)
        .unwrap_or(false)
}

/// Composites transparent images onto a white background; everything else is
/// coerced to plain RGB.
fn flatten_alpha(img: DynamicImage) -> DynamicImage {
    if !img.color().has_alpha() {
        return DynamicImage::ImageRgb8(img.to_rgb8());
    }

    let rgba = img.to_rgba8();
    let flattened = ImageBuffer::from_fn(rgba.width(), rgba.height(), |x, y| {
        let pixel = rgba.get_pixel(x, y);
        let alpha = pixel[3] as f32 / 255.0;
        let blend = |channel: u8| (channel as f32 * alpha + 255.0 * (1.0 - alpha)).round() as u8;
        Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])])
    });
    DynamicImage::ImageRgb8(flattened)
}

/// Applies the EXIF orientation tag, if the container carries one. Images
/// without EXIF data (or with an unrecognized value) pass through untouched.
fn apply_orientation(bytes: &[u8], img: DynamicImage) -> DynamicImage {
    transpose(img, orientation_tag(bytes))
}

/// Reads the orientation value (1-8) from the container's EXIF data,
/// defaulting to 1 (upright) when absent.
fn orientation_tag(bytes: &[u8]) -> u32 {
    exif::Reader::new()
        .read_from_container(&mut std::io::Cursor::new(bytes))
        .ok()
        .and_then(|data| {
            data.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .unwrap_or(1)
}

fn transpose(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}
