use std::path::Path;

use glam::uvec2;
use image::{DynamicImage, GrayImage};

use crate::config::PreprocessConfig;
use crate::convert::{Normalization, MASK_THRESHOLD};
use crate::error::{DatasetError, Result};
use crate::filesystem::{sliced_masks_dir, tile_name, ImagePair, SLICED_IMAGES_DIR};
use crate::tiling::{compute_grid, downsample, slice, slice_dynamic};

/// Loads an image as greyscale or RGB, whatever the file stores.
pub fn load_image(path: &Path, greyscale: bool) -> Result<DynamicImage> {
    let image = image::open(path)?;
    Ok(if greyscale {
        DynamicImage::ImageLuma8(image.to_luma8())
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8())
    })
}

pub fn load_mask(path: &Path) -> Result<GrayImage> {
    Ok(image::open(path)?.to_luma8())
}

/// Normalization statistics over the down-sampled, un-padded images of a split.
pub fn split_statistics(pairs: &[ImagePair], config: &PreprocessConfig) -> Result<Normalization> {
    let images = pairs
        .iter()
        .map(|pair| -> Result<DynamicImage> {
            Ok(downsample(&load_image(&pair.image, config.greyscale)?, config.down_sample))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Normalization::compute(&images, config.greyscale))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SliceOutcome {
    pub written: usize,
    pub skipped: usize,
}

/// Cuts one image and its masks into tiles and writes them below `split_dir`.
///
/// With `skip_background`, tiles without any foreground mask pixel are not written.
pub fn slice_pair(
    pair: &ImagePair,
    config: &PreprocessConfig,
    split_dir: &Path,
    skip_background: bool,
) -> Result<SliceOutcome> {
    let image = load_image(&pair.image, config.greyscale)?;
    let masks = pair
        .masks
        .iter()
        .map(|path| -> Result<GrayImage> {
            let mask = load_mask(path)?;
            if mask.dimensions() != (image.width(), image.height()) {
                return Err(DatasetError::MaskSize {
                    id: pair.id.clone(),
                    image: (image.width(), image.height()),
                    mask: mask.dimensions(),
                });
            }
            Ok(downsample(&DynamicImage::ImageLuma8(mask), config.down_sample).to_luma8())
        })
        .collect::<Result<Vec<_>>>()?;
    let image = downsample(&image, config.down_sample);

    let tile = config.slice_size;
    let grid = compute_grid(uvec2(image.width(), image.height()), tile, config.border_padding)?;
    let image_tiles = slice_dynamic(&image, tile, config.border_padding, grid);
    let mask_tiles = masks
        .iter()
        .map(|mask| slice(mask, tile, config.border_padding, grid))
        .collect::<Vec<_>>();

    let images_dir = split_dir.join(SLICED_IMAGES_DIR);
    std::fs::create_dir_all(&images_dir)?;
    let mask_dirs = (0..mask_tiles.len())
        .map(|class| -> Result<std::path::PathBuf> {
            let dir = split_dir.join(sliced_masks_dir(class));
            std::fs::create_dir_all(&dir)?;
            Ok(dir)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut outcome = SliceOutcome::default();
    for (index, (row, col)) in grid.positions().enumerate() {
        let has_foreground = mask_tiles
            .iter()
            .any(|tiles| tiles[index].as_raw().iter().any(|&v| v > MASK_THRESHOLD));
        if skip_background && !has_foreground {
            outcome.skipped += 1;
            continue;
        }

        let name = tile_name(&pair.id, row, col);
        image_tiles[index].save(images_dir.join(&name))?;
        for (tiles, dir) in mask_tiles.iter().zip(&mask_dirs) {
            tiles[index].save(dir.join(&name))?;
        }
        outcome.written += 1;
    }
    Ok(outcome)
}
