//! # Image Codec
//!
//! The pixel-level collaborators of the fleet: decoding and encoding PNG bytes,
//! splitting an image into a grid of tiles, joining tiles back together and the
//! per-pixel transforms a compute server applies.
//!
//! ## Grid Layout
//!
//! Tiles are produced in row-major order. For a `rows x columns` grid over a
//! `width x height` image every tile is `(width / columns) x (height / rows)`
//! pixels and tile `(row, column)` starts at pixel
//! `(column * tile_width, row * tile_height)`.

use image::{imageops, DynamicImage, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::common::error::GridError;

/// One cell of a split image.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub row: u32,
    pub column: u32,
    pub image: RgbaImage,
}

/// Pixel transform applied by compute servers.
///
/// Every variant maps each pixel independently of its neighbours, so applying
/// it tile by tile and joining the results equals applying it to the whole
/// image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Grayscale,
    RemoveReds,
    Identity,
}

impl Transform {
    pub fn apply(&self, image: &RgbaImage) -> RgbaImage {
        match self {
            Transform::Grayscale => DynamicImage::ImageRgba8(image.clone()).grayscale().to_rgba8(),
            Transform::RemoveReds => {
                let mut out = image.clone();
                for pixel in out.pixels_mut() {
                    pixel[0] = 0;
                }
                out
            }
            Transform::Identity => image.clone(),
        }
    }
}

/// Decode encoded image bytes (any format the `image` crate was built with).
pub fn decode(bytes: &[u8]) -> image::ImageResult<RgbaImage> {
    Ok(image::load_from_memory(bytes)?.to_rgba8())
}

/// Encode an image as PNG bytes.
pub fn encode_png(image: &RgbaImage) -> image::ImageResult<Vec<u8>> {
    let mut output_bytes = Vec::new();
    image.write_to(&mut std::io::Cursor::new(&mut output_bytes), ImageFormat::Png)?;
    Ok(output_bytes)
}

pub fn read_image(path: &Path) -> image::ImageResult<RgbaImage> {
    Ok(image::open(path)?.to_rgba8())
}

/// Save an image as PNG, creating missing parent directories.
pub fn save_png(image: &RgbaImage, path: &Path) -> image::ImageResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(image::ImageError::IoError)?;
        }
    }
    image.save_with_format(path, ImageFormat::Png)
}

/// Check that `rows x columns` evenly divides a `width x height` image.
pub fn check_grid(width: u32, height: u32, rows: u32, columns: u32) -> Result<(), GridError> {
    if rows == 0 || columns == 0 {
        return Err(GridError::EmptyGrid { rows, columns });
    }
    if width % columns != 0 || height % rows != 0 {
        return Err(GridError::NotDivisible {
            width,
            height,
            rows,
            columns,
        });
    }
    Ok(())
}

/// Split an image into a row-major grid of tiles.
pub fn split(image: &RgbaImage, rows: u32, columns: u32) -> Result<Vec<Tile>, GridError> {
    let (width, height) = image.dimensions();
    check_grid(width, height, rows, columns)?;

    let tile_width = width / columns;
    let tile_height = height / rows;

    let mut tiles = Vec::with_capacity((rows * columns) as usize);
    for row in 0..rows {
        for column in 0..columns {
            let view = imageops::crop_imm(
                image,
                column * tile_width,
                row * tile_height,
                tile_width,
                tile_height,
            );
            tiles.push(Tile {
                row,
                column,
                image: view.to_image(),
            });
        }
    }
    Ok(tiles)
}

/// Join a complete row-major grid of tiles into a `width x height` image.
///
/// `grid[row * columns + column]` holds tile `(row, column)`; every slot must be
/// filled and every tile must have the same dimensions.
pub fn join(
    grid: &[Option<RgbaImage>],
    rows: u32,
    columns: u32,
    width: u32,
    height: u32,
) -> Result<RgbaImage, GridError> {
    check_grid(width, height, rows, columns)?;
    let tile_width = width / columns;
    let tile_height = height / rows;

    let mut out = RgbaImage::new(width, height);
    for row in 0..rows {
        for column in 0..columns {
            let index = (row * columns + column) as usize;
            let tile = grid
                .get(index)
                .and_then(Option::as_ref)
                .ok_or(GridError::MissingTile { row, column })?;

            if tile.dimensions() != (tile_width, tile_height) {
                return Err(GridError::TileSize {
                    row,
                    column,
                    width: tile_width,
                    height: tile_height,
                    found_width: tile.width(),
                    found_height: tile.height(),
                });
            }

            imageops::replace(
                &mut out,
                tile,
                (column * tile_width) as i64,
                (row * tile_height) as i64,
            );
        }
    }
    Ok(out)
}
