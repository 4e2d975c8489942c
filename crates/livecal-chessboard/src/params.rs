use serde::{Deserialize, Serialize};

/// Parameters for the neighbor graph built over raw ChESS corners.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GridGraphParams {
    pub min_spacing_pix: f32,
    pub max_spacing_pix: f32,
    pub k_neighbors: usize,
    /// Maximum deviation of an edge from the dominant grid axes.
    pub axis_tolerance_deg: f32,
    /// Accepted edge length relative to a corner's nearest-neighbor distance.
    pub spacing_ratio: f32,
}

impl Default for GridGraphParams {
    fn default() -> Self {
        Self {
            min_spacing_pix: 6.0,
            max_spacing_pix: 400.0,
            k_neighbors: 8,
            axis_tolerance_deg: 25.0,
            spacing_ratio: 1.3,
        }
    }
}

/// Iterative sub-pixel corner refinement settings.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SubpixParams {
    /// Half side of the search window; the window is `2 * half_window + 1` wide.
    pub half_window: usize,
    pub max_iterations: usize,
    /// Stop once the corner moves less than this many pixels.
    pub epsilon: f64,
}

impl Default for SubpixParams {
    fn default() -> Self {
        Self {
            half_window: 11,
            max_iterations: 30,
            epsilon: 0.1,
        }
    }
}

/// Full set of tunables for [`ChessboardFinder`](crate::ChessboardFinder).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChessboardFinderParams {
    /// Relative ChESS response threshold passed to `chess-corners`.
    pub chess_threshold_rel: f32,
    pub chess_nms_radius: u32,
    /// Minimal corner response kept after detection.
    pub min_strength: f32,
    pub graph: GridGraphParams,
    pub subpix: SubpixParams,
}

impl Default for ChessboardFinderParams {
    fn default() -> Self {
        Self {
            chess_threshold_rel: 0.2,
            chess_nms_radius: 2,
            min_strength: 0.0,
            graph: GridGraphParams::default(),
            subpix: SubpixParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let p: ChessboardFinderParams =
            serde_json::from_str(r#"{"subpix": {"half_window": 5}}"#).expect("parse");
        assert_eq!(p.subpix.half_window, 5);
        assert_eq!(p.subpix.max_iterations, 30);
        assert_eq!(p.graph, GridGraphParams::default());
    }
}
