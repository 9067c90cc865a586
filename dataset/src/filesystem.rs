use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{DatasetError, Result};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

pub const IMAGES_DIR: &str = "images";
pub const SLICED_IMAGES_DIR: &str = "sliced_images";

/// Mask folder for `class`; the first class uses the plain name.
pub fn class_dir(base: &str, class: usize) -> String {
    if class == 0 {
        base.to_owned()
    } else {
        format!("{base}_{class}")
    }
}

pub fn masks_dir(class: usize) -> String {
    class_dir("masks", class)
}

pub fn sliced_masks_dir(class: usize) -> String {
    class_dir("sliced_masks", class)
}

/// An image and its per-class masks, joined by file stem.
#[derive(Clone, Debug)]
pub struct ImagePair {
    pub id: String,
    pub image: PathBuf,
    pub masks: Vec<PathBuf>,
}

/// File name of tile `(row, col)` cut from image `id`.
pub fn tile_name(id: &str, row: u32, col: u32) -> String {
    format!("{id}_{row}_{col}.png")
}

#[derive(Clone)]
pub struct Filesystem {
    root: PathBuf,
}

impl Filesystem {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn split(&self, split: &str) -> PathBuf {
        self.root.join(split)
    }

    /// Image files directly inside `dir`, keyed by file stem and sorted by it.
    pub fn images_in(dir: &Path) -> Vec<(String, PathBuf)> {
        let mut files = WalkDir::new(dir)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let path = entry.path();
                let ext = path.extension()?.to_str()?.to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str()).then_some(())?;
                let stem = path.file_stem()?.to_str()?.to_owned();
                Some((stem, path.to_path_buf()))
            })
            .collect::<Vec<_>>();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        files
    }

    /// Pairs every image of `split/images_dir` with its masks in the class mask folders.
    /// With `require_masks` a missing first-class mask is an error, otherwise pairs come
    /// back with whatever masks exist.
    pub fn pairs(
        &self,
        split: &str,
        images_dir: &str,
        mask_dir: impl Fn(usize) -> String,
        classes: usize,
        require_masks: bool,
    ) -> Result<Vec<ImagePair>> {
        let split_dir = self.split(split);
        let images = Self::images_in(&split_dir.join(images_dir));
        let masks = (0..classes)
            .map(|class| {
                Self::images_in(&split_dir.join(mask_dir(class)))
                    .into_iter()
                    .collect::<HashMap<_, _>>()
            })
            .collect::<Vec<_>>();

        if require_masks && !images.is_empty() && masks[0].len() != images.len() {
            return Err(DatasetError::PairCount {
                dir: split_dir,
                images: images.len(),
                masks: masks[0].len(),
            });
        }

        images
            .into_iter()
            .filter_map(|(id, image)| {
                let found = masks
                    .iter()
                    .map(|class_masks| class_masks.get(&id).cloned())
                    .collect::<Option<Vec<_>>>();
                match found {
                    Some(masks) => Some(Ok(ImagePair { id, image, masks })),
                    None if require_masks => Some(Err(DatasetError::MissingMask(id))),
                    None => Some(Ok(ImagePair {
                        id,
                        image,
                        masks: vec![],
                    })),
                }
            })
            .collect()
    }
}
