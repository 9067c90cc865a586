use glam::{uvec2, UVec2};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, Pixel};

use crate::error::TilingError;

/// Owned image with any pixel layout.
pub type Raster<P> = ImageBuffer<P, Vec<<P as Pixel>::Subpixel>>;

/// Row-major grid of square tiles covering an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileGrid {
    pub rows: u32,
    pub cols: u32,
}

impl TileGrid {
    pub fn len(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(row, col)` of every tile in row-major order.
    pub fn positions(&self) -> impl Iterator<Item = (u32, u32)> + use<> {
        let cols = self.cols;
        (0..self.rows).flat_map(move |row| (0..cols).map(move |col| (row, col)))
    }

    /// Pixel extent covered by the grid.
    pub fn extent(&self, tile: u32) -> UVec2 {
        uvec2(self.cols * tile, self.rows * tile)
    }
}

/// Number of tile rows and columns for an image of `size` (width, height). Partial border
/// tiles are kept when padding, dropped otherwise.
pub fn compute_grid(size: UVec2, tile: u32, pad: bool) -> Result<TileGrid, TilingError> {
    if tile == 0 {
        return Err(TilingError::ZeroTileSize);
    }
    let count = |extent: u32| {
        if pad {
            extent.div_ceil(tile)
        } else {
            extent / tile
        }
    };
    Ok(TileGrid {
        rows: count(size.y),
        cols: count(size.x),
    })
}

/// Cuts `image` into `grid` tiles of `tile`×`tile` pixels. Border tiles are filled with
/// black when padding and clipped to the image otherwise.
pub fn slice<P: Pixel + 'static>(
    image: &Raster<P>,
    tile: u32,
    pad: bool,
    grid: TileGrid,
) -> Vec<Raster<P>> {
    grid.positions()
        .map(|(row, col)| {
            let region = imageops::crop_imm(image, col * tile, row * tile, tile, tile).to_image();
            if !pad || region.dimensions() == (tile, tile) {
                return region;
            }
            let mut padded = ImageBuffer::new(tile, tile);
            imageops::replace(&mut padded, &region, 0, 0);
            padded
        })
        .collect()
}

/// Stitches a row-major list of equally sized tiles back into one image.
pub fn merge<P: Pixel + 'static>(tiles: &[Raster<P>], grid: TileGrid) -> Result<Raster<P>, TilingError> {
    if tiles.len() != grid.len() {
        return Err(TilingError::TileCount {
            expected: grid.len(),
            actual: tiles.len(),
        });
    }
    let Some(first) = tiles.first() else {
        return Ok(ImageBuffer::new(0, 0));
    };

    let expected = first.dimensions();
    if let Some((index, tile)) = tiles
        .iter()
        .enumerate()
        .find(|(_, tile)| tile.dimensions() != expected)
    {
        return Err(TilingError::TileSize {
            index,
            expected,
            actual: tile.dimensions(),
        });
    }

    let (tw, th) = expected;
    let mut merged = ImageBuffer::new(grid.cols * tw, grid.rows * th);
    for (tile, (row, col)) in tiles.iter().zip(grid.positions()) {
        imageops::replace(&mut merged, tile, (col * tw) as i64, (row * th) as i64);
    }
    Ok(merged)
}

/// [`slice`] for decoded images. Greyscale stays greyscale, everything else becomes RGB.
pub fn slice_dynamic(image: &DynamicImage, tile: u32, pad: bool, grid: TileGrid) -> Vec<DynamicImage> {
    match image {
        DynamicImage::ImageLuma8(luma) => slice(luma, tile, pad, grid)
            .into_iter()
            .map(DynamicImage::ImageLuma8)
            .collect(),
        other => slice(&other.to_rgb8(), tile, pad, grid)
            .into_iter()
            .map(DynamicImage::ImageRgb8)
            .collect(),
    }
}

/// [`merge`] for decoded images. All tiles must share one pixel layout.
pub fn merge_dynamic(tiles: &[DynamicImage], grid: TileGrid) -> Result<DynamicImage, TilingError> {
    let Some(first) = tiles.first() else {
        return merge::<image::Luma<u8>>(&[], grid).map(DynamicImage::ImageLuma8);
    };
    let expected = first.color();
    if let Some((index, tile)) = tiles.iter().enumerate().find(|(_, t)| t.color() != expected) {
        return Err(TilingError::TileColor {
            index,
            expected,
            actual: tile.color(),
        });
    }

    if expected == image::ColorType::L8 {
        let tiles = tiles.iter().map(DynamicImage::to_luma8).collect::<Vec<_>>();
        merge(&tiles, grid).map(DynamicImage::ImageLuma8)
    } else {
        let tiles = tiles.iter().map(DynamicImage::to_rgb8).collect::<Vec<_>>();
        merge(&tiles, grid).map(DynamicImage::ImageRgb8)
    }
}

/// Halves the image `steps` times with nearest-neighbour sampling.
pub fn downsample(image: &DynamicImage, steps: u32) -> DynamicImage {
    (0..steps).fold(image.clone(), |current, _| {
        let (w, h) = (current.width(), current.height());
        current.resize_exact((w / 2).max(1), (h / 2).max(1), FilterType::Nearest)
    })
}

/// Doubles the image `steps` times with nearest-neighbour sampling.
pub fn upsample<P: Pixel + 'static>(image: &Raster<P>, steps: u32) -> Raster<P> {
    (0..steps).fold(image.clone(), |current, _| {
        let (w, h) = current.dimensions();
        imageops::resize(&current, w * 2, h * 2, FilterType::Nearest)
    })
}

/// Extends the image to at least `width`×`height` with black on the right and bottom.
pub fn pad_to<P: Pixel + 'static>(image: &Raster<P>, width: u32, height: u32) -> Raster<P> {
    let (w, h) = image.dimensions();
    if w >= width && h >= height {
        return image.clone();
    }
    let mut padded = ImageBuffer::new(w.max(width), h.max(height));
    imageops::replace(&mut padded, image, 0, 0);
    padded
}

/// Cuts the top-left `width`×`height` region, clipped to the image.
pub fn crop_to<P: Pixel + 'static>(image: &Raster<P>, width: u32, height: u32) -> Raster<P> {
    imageops::crop_imm(image, 0, 0, width, height).to_image()
}
