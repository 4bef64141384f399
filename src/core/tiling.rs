//! Tile coordinate generation
//!
//! Tiles are enumerated in row-major order: for tile index `i`,
//! `x = (i % xtiles) * tile_size` and `y = (i / xtiles) * tile_size`.

use crate::types::{FusionError, FusionResult, RasterSize, TileCoordinate};
use serde::{Deserialize, Serialize};

/// Handling of the pixels left over when the raster size is not a
/// multiple of the tile size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgePolicy {
    /// Only whole tiles are produced; the remainder strip is skipped
    #[default]
    Drop,
    /// Partial edge tiles are produced as well, clipped to the raster.
    /// Their reads are zero-padded to the full tile size.
    Pad,
}

/// Lazy, finite sequence of tile windows over one raster.
///
/// Restart by constructing a new instance from the same parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileCoords {
    tile_size: usize,
    size: RasterSize,
    policy: EdgePolicy,
    xtiles: usize,
    ytiles: usize,
    next: usize,
}

impl TileCoords {
    pub fn new(tile_size: usize, size: RasterSize, policy: EdgePolicy) -> FusionResult<Self> {
        if tile_size == 0 {
            return Err(FusionError::InvalidGeometry(
                "Tile size must be positive".to_string(),
            ));
        }

        let (xtiles, ytiles) = match policy {
            EdgePolicy::Drop => (size.width / tile_size, size.height / tile_size),
            EdgePolicy::Pad => (
                size.width.div_ceil(tile_size),
                size.height.div_ceil(tile_size),
            ),
        };

        Ok(Self {
            tile_size,
            size,
            policy,
            xtiles,
            ytiles,
            next: 0,
        })
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn policy(&self) -> EdgePolicy {
        self.policy
    }

    /// Number of tiles along x and y
    pub fn grid(&self) -> (usize, usize) {
        (self.xtiles, self.ytiles)
    }

    /// Total number of tiles, independent of the iteration position
    pub fn total(&self) -> usize {
        self.xtiles * self.ytiles
    }

    pub fn has_next(&self) -> bool {
        self.next < self.total()
    }

    /// Window of tile `index`, `None` past the end
    pub fn coordinate(&self, index: usize) -> Option<TileCoordinate> {
        if index >= self.total() {
            return None;
        }
        let x = (index % self.xtiles) * self.tile_size;
        let y = (index / self.xtiles) * self.tile_size;
        Some(TileCoordinate::new(
            x,
            y,
            self.tile_size.min(self.size.width - x),
            self.tile_size.min(self.size.height - y),
        ))
    }
}

impl Iterator for TileCoords {
    type Item = TileCoordinate;

    fn next(&mut self) -> Option<TileCoordinate> {
        let coordinate = self.coordinate(self.next)?;
        self.next += 1;
        Some(coordinate)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileCoords {}

/// Whole-tile windows over a `width` x `height` raster; remainder pixels are dropped
pub fn tile_coords(tile_size: usize, width: usize, height: usize) -> FusionResult<TileCoords> {
    TileCoords::new(tile_size, RasterSize::new(width, height), EdgePolicy::Drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_exact_division_covers_raster() {
        let coords: Vec<_> = tile_coords(10, 50, 30).unwrap().collect();
        assert_eq!(coords.len(), 15);

        let mut covered = HashSet::new();
        for c in &coords {
            assert_eq!((c.width, c.height), (10, 10));
            assert!(c.fits_within(RasterSize::new(50, 30)));
            for y in c.y..c.y + c.height {
                for x in c.x..c.x + c.width {
                    // No overlap
                    assert!(covered.insert((x, y)));
                }
            }
        }
        // No gaps
        assert_eq!(covered.len(), 50 * 30);
    }

    #[test]
    fn test_row_major_order() {
        let coords: Vec<_> = tile_coords(5, 15, 10).unwrap().collect();
        let origins: Vec<_> = coords.iter().map(|c| (c.x, c.y)).collect();
        assert_eq!(
            origins,
            vec![(0, 0), (5, 0), (10, 0), (0, 5), (5, 5), (10, 5)]
        );
    }

    #[test]
    fn test_remainder_dropped() {
        let coords = tile_coords(10, 221, 221).unwrap();
        assert_eq!(coords.len(), 484);
        for c in coords {
            assert!(c.x <= 210 && c.y <= 210);
            assert_eq!(c.width, 10);
        }
    }

    #[test]
    fn test_pad_policy_clips_edge_tiles() {
        let coords: Vec<_> = TileCoords::new(10, RasterSize::new(25, 12), EdgePolicy::Pad)
            .unwrap()
            .collect();
        assert_eq!(coords.len(), 3 * 2);
        assert_eq!(coords[2], TileCoordinate::new(20, 0, 5, 10));
        assert_eq!(coords[5], TileCoordinate::new(20, 10, 5, 2));
        assert!(coords.iter().all(|c| c.fits_within(RasterSize::new(25, 12))));
    }

    #[test]
    fn test_restartable_and_exact_size() {
        let mut first = tile_coords(4, 16, 8).unwrap();
        assert_eq!(first.len(), 8);
        first.next();
        first.next();
        assert_eq!(first.len(), 6);

        let again = tile_coords(4, 16, 8).unwrap();
        assert_eq!(again.len(), 8);
        assert_eq!(again.collect::<Vec<_>>(), tile_coords(4, 16, 8).unwrap().collect::<Vec<_>>());
    }

    #[test]
    fn test_pad_policy_with_huge_tile() {
        let coords: Vec<_> = TileCoords::new(usize::MAX, RasterSize::new(25, 12), EdgePolicy::Pad)
            .unwrap()
            .collect();
        assert_eq!(coords, vec![TileCoordinate::new(0, 0, 25, 12)]);
    }

    #[test]
    fn test_small_raster_and_zero_tile() {
        assert_eq!(tile_coords(10, 9, 100).unwrap().count(), 0);
        assert!(tile_coords(0, 10, 10).is_err());
    }
}
