use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use snapvault_types::{Result, SnapError};

/// Longest edge of one thumbnail tile, and the square cell size.
const TILE_SIZE: u32 = 100;

const CANVAS_GRAY: Rgb<u8> = Rgb([240, 240, 240]);

/// Pick the grid shape for `n` tiles whose column/row ratio is closest to
/// 4:3; ties go to fewer rows.
pub fn grid_layout(n: usize) -> (u32, u32) {
    if n == 0 {
        return (1, 1);
    }
    let target = 4.0 / 3.0;
    let mut best = (1u32, 1u32);
    let mut best_diff = f64::INFINITY;

    for cols in 1..=n as u32 {
        let rows = (n as u32).div_ceil(cols);
        let diff = (cols as f64 / rows as f64 - target).abs();
        let better = diff + 1e-9 < best_diff
            || ((diff - best_diff).abs() <= 1e-9 && rows < best.1);
        if better {
            best_diff = diff;
            best = (cols, rows);
        }
    }
    best
}

/// Compose downscaled copies of `images` into a grid collage, returned as
/// PNG bytes. `None` when there are no images.
pub fn collage(images: &[DynamicImage]) -> Result<Option<Vec<u8>>> {
    if images.is_empty() {
        return Ok(None);
    }
    let (cols, rows) = grid_layout(images.len());
    let mut canvas = RgbImage::from_pixel(cols * TILE_SIZE, rows * TILE_SIZE, CANVAS_GRAY);

    for (i, img) in images.iter().enumerate() {
        let (w, h) = (img.width().max(1), img.height().max(1));
        // Bound the longer edge to the tile size, preserving aspect ratio.
        let (tw, th) = if w > h {
            (TILE_SIZE, ((h as f64 / w as f64) * TILE_SIZE as f64) as u32)
        } else {
            (((w as f64 / h as f64) * TILE_SIZE as f64) as u32, TILE_SIZE)
        };
        let thumb = img
            .resize_exact(tw.max(1), th.max(1), FilterType::Lanczos3)
            .to_rgb8();

        let col = (i as u32) % cols;
        let row = (i as u32) / cols;
        let x = col * TILE_SIZE + (TILE_SIZE - thumb.width()) / 2;
        let y = row * TILE_SIZE + (TILE_SIZE - thumb.height()) / 2;
        image::imageops::overlay(&mut canvas, &thumb, x as i64, y as i64);
    }

    Ok(Some(encode_png(&DynamicImage::ImageRgb8(canvas))?))
}

/// A minimal valid cover for sessions with no images.
pub fn blank_cover() -> Result<Vec<u8>> {
    let img = RgbImage::from_pixel(1, 1, Rgb([255, 255, 255]));
    encode_png(&DynamicImage::ImageRgb8(img))
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .map_err(|e| SnapError::Fatal(format!("PNG encode failed: {e}")))?;
    Ok(out.into_inner())
}
