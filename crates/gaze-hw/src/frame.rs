//! Frame type and pixel-format conversion into RGB.

use image::RgbImage;

/// A captured camera frame, already in RGB.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("MJPG decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("MJPG frame is {actual_w}x{actual_h}, stream negotiated {expected_w}x{expected_h}")]
    SizeMismatch {
        expected_w: u32,
        expected_h: u32,
        actual_w: u32,
        actual_h: u32,
    },
}

/// BT.601 limited-range YUV to RGB, integer arithmetic.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            format: "YUYV",
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        format: "YUYV",
        expected,
        actual: yuyv.len(),
    })
}

/// Wrap a packed 24-bit RGB buffer.
pub fn rgb3_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 3) as usize;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format: "RGB3",
            expected,
            actual: buf.len(),
        });
    }
    RgbImage::from_raw(width, height, buf[..expected].to_vec()).ok_or(FrameError::InvalidLength {
        format: "RGB3",
        expected,
        actual: buf.len(),
    })
}

/// Decode one Motion-JPEG frame.
pub fn mjpg_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let image = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)?.to_rgb8();
    if image.dimensions() != (width, height) {
        return Err(FrameError::SizeMismatch {
            expected_w: width,
            expected_h: height,
            actual_w: image.width(),
            actual_h: image.height(),
        });
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_black_and_white() {
        // 2x1: black then white, neutral chroma
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        let yuyv = vec![126, 128, 126, 128, 60, 128, 200, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 2).unwrap();
        for p in rgb.pixels() {
            assert_eq!(p.0[0], p.0[1]);
            assert_eq!(p.0[1], p.0[2]);
        }
        assert_eq!(rgb.get_pixel(0, 0).0[0], 128);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // High V pushes red up and green down.
        let rgb = yuyv_to_rgb(&[81, 90, 81, 240], 2, 1).unwrap();
        let [r, g, b] = rgb.get_pixel(0, 0).0;
        assert!(r > 200, "r = {r}");
        assert!(g < 40, "g = {g}");
        assert!(b < 40, "b = {b}");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let result = yuyv_to_rgb(&[100, 128], 2, 1);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 4, actual: 2, .. })
        ));
    }

    #[test]
    fn test_rgb3_passthrough_ignores_trailing_bytes() {
        let buf: Vec<u8> = (0..15).collect();
        let rgb = rgb3_to_rgb(&buf, 2, 2).unwrap();
        assert_eq!(rgb.get_pixel(1, 1).0, [9, 10, 11]);
        assert!(rgb3_to_rgb(&buf[..6], 2, 2).is_err());
    }

    #[test]
    fn test_mjpg_roundtrip_and_size_check() {
        let src = RgbImage::from_pixel(8, 6, image::Rgb([120, 60, 30]));
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageRgb8(src)
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        let decoded = mjpg_to_rgb(&jpeg, 8, 6).unwrap();
        assert_eq!(decoded.dimensions(), (8, 6));
        assert!(matches!(
            mjpg_to_rgb(&jpeg, 640, 480),
            Err(FrameError::SizeMismatch { .. })
        ));
        assert!(matches!(mjpg_to_rgb(b"not a jpeg", 8, 6), Err(FrameError::Decode(_))));
    }
}
