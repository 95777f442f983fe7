//! Rolling-average chart series for speed and fuel consumption.

use serde::Serialize;

/// Fast ticks averaged into one series point
pub const BLOCK_TICKS: usize = 10;
/// Longest series kept before downsampling
pub const MAX_SERIES_LEN: usize = 100;
/// Number of chunks a series is reduced to
pub const DOWNSAMPLE_FACTOR: usize = 10;

/// Incremental mean over one block of ticks
#[derive(Debug, Clone, Default, PartialEq)]
struct BlockMean {
    mean: f64,
    count: usize,
}

impl BlockMean {
    /// Add a sample; returns the block mean when the block completes
    #[allow(clippy::cast_precision_loss)]
    fn push(&mut self, x: f64) -> Option<f64> {
        self.count += 1;
        let k = self.count as f64;
        self.mean = (self.mean * (k - 1.0) + x) / k;
        if self.count == BLOCK_TICKS {
            let mean = self.mean;
            *self = Self::default();
            Some(mean)
        } else {
            None
        }
    }
}

/// Reduce `data` to `factor` chunk means.
///
/// The chunk size is `len / factor` (integer division). The final chunk
/// also takes the remainder, so the result never has more than `factor`
/// points. Series shorter than `factor` are returned unchanged.
#[allow(clippy::cast_precision_loss)]
pub fn downsample(data: &[f64], factor: usize) -> Vec<f64> {
    if factor == 0 || data.len() < factor {
        return data.to_vec();
    }
    let block_size = data.len() / factor;
    (0..factor)
        .map(|i| {
            let start = i * block_size;
            let end = if i + 1 == factor { data.len() } else { start + block_size };
            let chunk = &data[start..end];
            chunk.iter().sum::<f64>() / chunk.len() as f64
        })
        .collect()
}

/// One tracked metric
#[derive(Debug, Clone, Default)]
pub struct MetricSeries {
    block: BlockMean,
    points: Vec<f64>,
}

impl MetricSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fast-tick sample; returns true if a point was appended
    pub fn push(&mut self, x: f64) -> bool {
        let Some(mean) = self.block.push(x) else {
            return false;
        };
        self.points.push(mean);
        if self.points.len() > MAX_SERIES_LEN {
            self.points = downsample(&self.points, DOWNSAMPLE_FACTOR);
        }
        true
    }

    pub fn points(&self) -> &[f64] {
        &self.points
    }
}

/// Published copy of both series
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesSnapshot {
    pub speed: Vec<f64>,
    pub fuel: Vec<f64>,
}

/// Speed and fuel-consumption series, each with its own block counter
#[derive(Debug, Clone, Default)]
pub struct SeriesAggregator {
    speed: MetricSeries,
    fuel: MetricSeries,
}

impl SeriesAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fast tick. An absent value leaves that metric's block as is.
    pub fn push(&mut self, speed: Option<f64>, fuel_consumption: Option<f64>) {
        if let Some(speed) = speed {
            self.speed.push(speed);
        }
        if let Some(fuel) = fuel_consumption {
            self.fuel.push(fuel);
        }
    }

    pub fn snapshot(&self) -> SeriesSnapshot {
        SeriesSnapshot {
            speed: self.speed.points().to_vec(),
            fuel: self.fuel.points().to_vec(),
        }
    }
}
