//! Lock-step batching over several tile streams

use crate::core::tiling::{EdgePolicy, TileCoords};
use crate::io::raster::Raster;
use crate::types::{FusionError, FusionResult, TileCoordinate};
use ndarray::{s, Array3, Array4, ArrayView3, Axis};

/// Tile stream over one raster
pub struct TileStream<'a> {
    raster: &'a dyn Raster,
    coords: TileCoords,
    batch_size: usize,
}

impl<'a> TileStream<'a> {
    pub fn new(
        raster: &'a dyn Raster,
        tile_size: usize,
        batch_size: usize,
        policy: EdgePolicy,
    ) -> FusionResult<Self> {
        if batch_size == 0 {
            return Err(FusionError::Config("Batch size must be positive".to_string()));
        }
        Ok(Self {
            raster,
            coords: TileCoords::new(tile_size, raster.size(), policy)?,
            batch_size,
        })
    }

    /// Tiles in the stream
    pub fn len(&self) -> usize {
        self.coords.total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// Read one tile, zero-padded to the full tile size when clipped
    fn read(&self, coordinate: &TileCoordinate) -> FusionResult<Array3<f32>> {
        let data = self.raster.read_window(coordinate)?;
        let tile = self.coords.tile_size();
        if coordinate.width == tile && coordinate.height == tile {
            return Ok(data);
        }

        let mut padded = Array3::zeros((data.len_of(Axis(0)), tile, tile));
        padded
            .slice_mut(s![.., ..coordinate.height, ..coordinate.width])
            .assign(&data);
        Ok(padded)
    }

    fn next_batch(&mut self) -> FusionResult<(Vec<TileCoordinate>, Vec<Array3<f32>>)> {
        let coordinates: Vec<TileCoordinate> = self.coords.by_ref().take(self.batch_size).collect();
        let tiles = coordinates
            .iter()
            .map(|c| self.read(c))
            .collect::<FusionResult<Vec<_>>>()?;
        Ok((coordinates, tiles))
    }
}

/// Tiles read from every stream at one dispatcher step
#[derive(Debug, Clone)]
pub struct Batch {
    pub index: usize,
    pub coordinates: Vec<Vec<TileCoordinate>>,
    pub tiles: Vec<Vec<Array3<f32>>>,
}

impl Batch {
    /// Tiles of stream `stream`
    pub fn stream(&self, stream: usize) -> &[Array3<f32>] {
        &self.tiles[stream]
    }

    /// Tiles of stream `stream` stacked as `(batch, band, row, col)`
    pub fn stacked(&self, stream: usize) -> FusionResult<Array4<f32>> {
        let views: Vec<ArrayView3<f32>> = self.tiles[stream].iter().map(|t| t.view()).collect();
        ndarray::stack(Axis(0), &views)
            .map_err(|e| FusionError::Processing(format!("Failed to stack batch: {}", e)))
    }
}

/// Advances all of its streams together, one batch per step.
///
/// Every stream must yield the same number of batches; this is checked
/// when the dispatcher is built.
pub struct TileDispatcher<'a> {
    streams: Vec<TileStream<'a>>,
    total_batches: usize,
    emitted: usize,
}

impl<'a> TileDispatcher<'a> {
    pub fn new(streams: Vec<TileStream<'a>>) -> FusionResult<Self> {
        if streams.len() < 2 {
            return Err(FusionError::Config(format!(
                "Dispatcher needs at least two tile streams, got {}",
                streams.len()
            )));
        }

        let batches: Vec<usize> = streams.iter().map(|s| s.total_batches()).collect();
        if batches.iter().any(|&b| b != batches[0]) {
            log::warn!("Tile streams disagree on batch count: {:?}", batches);
            return Err(FusionError::UnsynchronizedStreams { batches });
        }

        log::info!(
            "Dispatching {} batches over {} streams",
            batches[0],
            streams.len()
        );
        Ok(Self {
            streams,
            total_batches: batches[0],
            emitted: 0,
        })
    }

    pub fn total_batches(&self) -> usize {
        self.total_batches
    }

    pub fn has_next(&self) -> bool {
        self.emitted < self.total_batches
    }
}

impl<'a> Iterator for TileDispatcher<'a> {
    type Item = FusionResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }

        let mut coordinates = Vec::with_capacity(self.streams.len());
        let mut tiles = Vec::with_capacity(self.streams.len());
        for stream in self.streams.iter_mut() {
            match stream.next_batch() {
                Ok((c, t)) => {
                    coordinates.push(c);
                    tiles.push(t);
                }
                Err(e) => {
                    // Streams are out of step after a failed read
                    self.emitted = self.total_batches;
                    return Some(Err(e));
                }
            }
        }

        let index = self.emitted;
        self.emitted += 1;
        Some(Ok(Batch {
            index,
            coordinates,
            tiles,
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total_batches - self.emitted;
        (remaining, Some(remaining))
    }
}
