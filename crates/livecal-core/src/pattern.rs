use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// Inner-corner layout of a planar chessboard.
///
/// `rows` counts corner rows (vertical direction), `cols` counts corners per
/// row. A board with 8x6 squares has `cols = 7`, `rows = 5`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternSize {
    pub rows: usize,
    pub cols: usize,
}

impl PatternSize {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn corner_count(&self) -> usize {
        self.rows * self.cols
    }
}

/// Board geometry: corner layout plus the side of one square in world units.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChessboardPattern {
    #[serde(flatten)]
    pub size: PatternSize,
    pub square_size: f64,
}

impl ChessboardPattern {
    pub fn new(rows: usize, cols: usize, square_size: f64) -> Self {
        Self {
            size: PatternSize::new(rows, cols),
            square_size,
        }
    }

    pub fn corner_count(&self) -> usize {
        self.size.corner_count()
    }

    /// Canonical board-plane corners (`z = 0`), row-major.
    ///
    /// The last corner sits at the origin; the others have non-positive
    /// coordinates.
    pub fn object_points(&self) -> Vec<Point3<f64>> {
        let s = self.square_size;
        let (rows, cols) = (self.size.rows, self.size.cols);
        let x0 = cols.saturating_sub(1) as f64 * s;
        let y0 = rows.saturating_sub(1) as f64 * s;
        (0..rows)
            .flat_map(|i| (0..cols).map(move |j| (i, j)))
            .map(|(i, j)| Point3::new(j as f64 * s - x0, i as f64 * s - y0, 0.0))
            .collect()
    }
}
