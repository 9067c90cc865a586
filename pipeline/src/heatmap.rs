use std::path::Path;

use image::{DynamicImage, GrayImage, Rgb, RgbImage};

/// Polynomial fit of the turbo colormap, `t` in `[0, 1]`.
pub fn turbo(t: f32) -> Rgb<u8> {
    let t = t.clamp(0.0, 1.0);
    let r = 0.135_721_38 + t * (4.615_392_6 + t * (-42.660_324 + t * (132.131_08 + t * (-152.942_39 + t * 59.286_38))));
    let g = 0.091_402_61 + t * (2.194_188_4 + t * (4.842_966_6 + t * (-14.185_033 + t * (4.277_298_6 + t * 2.829_566))));
    let b = 0.106_673_3 + t * (12.641_946 + t * (-60.582_05 + t * (110.362_77 + t * (-89.903_11 + t * 27.348_25))));
    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([to_u8(r), to_u8(g), to_u8(b)])
}

/// Colour-mapped prediction. Values at or below `threshold` are zeroed and zero pixels stay black.
pub fn heatmap(prediction: &GrayImage, threshold: u8) -> RgbImage {
    RgbImage::from_fn(prediction.width(), prediction.height(), |x, y| {
        let v = prediction.get_pixel(x, y)[0];
        if v > threshold {
            turbo(v as f32 / 255.0)
        } else {
            Rgb([0, 0, 0])
        }
    })
}

/// Heatmap added onto the source image with saturation.
pub fn overlay(source: &DynamicImage, heat: &RgbImage) -> RgbImage {
    let mut out = source.to_rgb8();
    for (px, h) in out.pixels_mut().zip(heat.pixels()) {
        for c in 0..3 {
            px[c] = px[c].saturating_add(h[c]);
        }
    }
    out
}

/// File name of the heatmap of `class` for image `id`.
pub fn heatmap_name(id: &str, class: usize) -> String {
    if class == 0 {
        format!("{id}.png")
    } else {
        format!("{id}_{class}.png")
    }
}

/// Writes the heatmap and overlay of every class prediction.
pub fn save_heatmaps(
    id: &str,
    source: &DynamicImage,
    predictions: &[GrayImage],
    threshold: u8,
    heatmap_dir: &Path,
    overlay_dir: &Path,
) -> image::ImageResult<()> {
    std::fs::create_dir_all(heatmap_dir)?;
    std::fs::create_dir_all(overlay_dir)?;
    for (class, prediction) in predictions.iter().enumerate() {
        let heat = heatmap(prediction, threshold);
        overlay(source, &heat).save(overlay_dir.join(heatmap_name(id, class)))?;
        heat.save(heatmap_dir.join(heatmap_name(id, class)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn turbo_endpoints() {
        // Blue in the low range, dark red at the high end.
        let low = turbo(0.15);
        assert!(low[2] > low[0] && low[2] > low[1]);
        let high = turbo(1.0);
        assert!(high[0] > high[1] && high[0] > high[2]);
    }

    #[test]
    fn thresholded_pixels_are_black() {
        let prediction = GrayImage::from_fn(3, 1, |x, _| Luma([[10, 128, 255][x as usize]]));
        let heat = heatmap(&prediction, 127);
        assert_eq!(heat.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_ne!(heat.get_pixel(1, 0), &Rgb([0, 0, 0]));
        assert_ne!(heat.get_pixel(2, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn overlay_saturates() {
        let source = DynamicImage::ImageLuma8(GrayImage::from_pixel(1, 1, Luma([200])));
        let heat = RgbImage::from_pixel(1, 1, Rgb([100, 0, 30]));
        assert_eq!(overlay(&source, &heat).get_pixel(0, 0), &Rgb([255, 200, 230]));
        assert_eq!(heatmap_name("a", 0), "a.png");
        assert_eq!(heatmap_name("a", 2), "a_2.png");
    }
}
