//! Chessboard corner search for live calibration.
//!
//! Pipeline:
//! 1. Detect ChESS X-junction corners (`chess-corners`) and drop weak ones.
//! 2. Fast-reject frames with fewer corners than the board has.
//! 3. Estimate the dominant grid axis from nearest-neighbor edges and link
//!    each corner to at most one neighbor per axis direction (`kiddo` kNN).
//! 4. Walk connected components to integer grid coordinates and look for a
//!    complete `rows x cols` window, rotating transposed boards into place.
//! 5. Refine the ordered corners to sub-pixel precision.
//!
//! [`draw_chessboard_corners`] renders the display overlay.

mod detector;
mod draw;
mod geom;
mod gridgraph;
mod params;
mod subpix;

pub use detector::{order_board_corners, ChessboardFinder, CornerFinder, DetectError, RawCorner};
pub use draw::draw_chessboard_corners;
pub use geom::NeighborDirection;
pub use gridgraph::{assign_grid_coordinates, connected_components, GridGraph, NodeNeighbor};
pub use livecal_core::PatternSize;
pub use params::{ChessboardFinderParams, GridGraphParams, SubpixParams};
pub use subpix::{refine_corner, refine_corners};
