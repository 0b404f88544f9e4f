//! Image comparison utilities for verification
//!
//! The GPU kernels and the CPU reference evaluate the same formulas, but in different orders and
//! with different transcendental implementations, so outputs are compared with a per-channel
//! tolerance in 8-bit steps rather than exactly.

use image::RgbaImage;

/// Result of comparing two images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareResult {
    /// Every channel of every pixel is within tolerance
    Match,
    /// Images have different dimensions
    DimensionMismatch {
        /// Dimensions of the reference output
        reference_dimensions: (u32, u32),
        /// Dimensions of the engine output
        actual_dimensions: (u32, u32),
    },
    /// Images have matching dimensions but some pixels differ beyond the tolerance
    PixelMismatch {
        /// Largest absolute channel difference found
        max_difference: u8,
        /// Number of pixels with at least one channel beyond the tolerance
        mismatched_pixels: usize,
    },
}

/// Compares two RGBA8 images channel by channel
///
/// # Arguments
/// * `reference` - Output of the CPU reference
/// * `actual` - Output read back from the engine
/// * `tolerance` - Largest accepted absolute difference per channel
pub fn compare_images(reference: &RgbaImage, actual: &RgbaImage, tolerance: u8) -> CompareResult {
    if reference.dimensions() != actual.dimensions() {
        return CompareResult::DimensionMismatch {
            reference_dimensions: reference.dimensions(),
            actual_dimensions: actual.dimensions(),
        };
    }

    let mut max_difference = 0u8;
    let mut mismatched_pixels = 0usize;
    for (expected, got) in reference.pixels().zip(actual.pixels()) {
        let difference = expected.0.iter().zip(got.0.iter()).map(|(a, b)| a.abs_diff(*b)).max().unwrap_or(0);
        max_difference = max_difference.max(difference);
        if difference > tolerance {
            mismatched_pixels += 1;
        }
    }

    if mismatched_pixels == 0 {
        CompareResult::Match
    } else {
        CompareResult::PixelMismatch {
            max_difference,
            mismatched_pixels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_identical_images_match() {
        let image = RgbaImage::from_fn(4, 3, |x, y| Rgba([x as u8, y as u8, 7, 255]));
        assert_eq!(compare_images(&image, &image.clone(), 0), CompareResult::Match);
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = RgbaImage::new(4, 3);
        let b = RgbaImage::new(3, 4);
        assert_eq!(
            compare_images(&a, &b, 1),
            CompareResult::DimensionMismatch {
                reference_dimensions: (4, 3),
                actual_dimensions: (3, 4),
            }
        );
    }

    #[test]
    fn test_tolerance() {
        let a = RgbaImage::from_pixel(2, 2, Rgba([100, 100, 100, 255]));
        let mut b = a.clone();
        b.put_pixel(0, 0, Rgba([101, 100, 100, 255]));
        b.put_pixel(1, 1, Rgba([100, 96, 100, 255]));

        assert_eq!(
            compare_images(&a, &b, 1),
            CompareResult::PixelMismatch {
                max_difference: 4,
                mismatched_pixels: 1,
            }
        );
        assert_eq!(compare_images(&a, &b, 4), CompareResult::Match);
    }
}
