use crate::gridgraph::{assign_grid_coordinates, connected_components, GridGraph};
use crate::params::{ChessboardFinderParams, GridGraphParams};
use crate::subpix::refine_corners;
use chess_corners::{find_chess_corners_image, ChessConfig};
use livecal_core::{GrayImage, PatternSize};
use log::debug;
use nalgebra::Point2;
use std::collections::HashMap;

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectError {
    #[error("invalid grayscale image buffer length (expected {expected} bytes, got {got})")]
    InvalidGrayBuffer { expected: usize, got: usize },

    #[error("invalid grayscale image dimensions (width={width}, height={height})")]
    InvalidGrayDimensions { width: usize, height: usize },

    #[error("pattern must have at least 2x2 inner corners (got {rows}x{cols})")]
    InvalidPattern { rows: usize, cols: usize },
}

/// A detector response before grid fitting.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawCorner {
    pub position: Point2<f32>,
    pub strength: f32,
}

/// Locates a complete chessboard in a grayscale frame.
///
/// `Ok(None)` means the board was not found; `Err` is reserved for unusable
/// inputs. Returned corners are row-major (`pattern.cols` per row) and refined
/// to sub-pixel precision.
pub trait CornerFinder: Send + Sync {
    fn find_corners(
        &self,
        gray: &GrayImage,
        pattern: PatternSize,
    ) -> Result<Option<Vec<Point2<f64>>>, DetectError>;
}

/// ChESS corners -> grid graph -> ordered board -> sub-pixel refinement.
#[derive(Clone, Debug, Default)]
pub struct ChessboardFinder {
    pub params: ChessboardFinderParams,
}

impl ChessboardFinder {
    pub fn new(params: ChessboardFinderParams) -> Self {
        Self { params }
    }

    fn chess_config(&self) -> ChessConfig {
        let mut cfg = ChessConfig::single_scale();
        cfg.params.threshold_rel = self.params.chess_threshold_rel;
        cfg.params.nms_radius = self.params.chess_nms_radius;
        cfg
    }

    /// Raw ChESS corners above the strength threshold.
    pub fn raw_corners(&self, gray: &GrayImage) -> Result<Vec<RawCorner>, DetectError> {
        let img = to_image_gray(gray)?;
        let min_strength = self.params.min_strength;
        Ok(find_chess_corners_image(&img, &self.chess_config())
            .iter()
            .filter(|c| c.response >= min_strength)
            .map(|c| RawCorner {
                position: Point2::new(c.x, c.y),
                strength: c.response,
            })
            .collect())
    }
}

impl CornerFinder for ChessboardFinder {
    #[cfg_attr(
        feature = "tracing",
        instrument(
            level = "debug",
            skip(self, gray),
            fields(width = gray.width, height = gray.height, rows = pattern.rows, cols = pattern.cols)
        )
    )]
    fn find_corners(
        &self,
        gray: &GrayImage,
        pattern: PatternSize,
    ) -> Result<Option<Vec<Point2<f64>>>, DetectError> {
        if pattern.rows < 2 || pattern.cols < 2 {
            return Err(DetectError::InvalidPattern {
                rows: pattern.rows,
                cols: pattern.cols,
            });
        }
        let raw = self.raw_corners(gray)?;
        debug!("{} ChESS corners after strength filter", raw.len());

        let Some(ordered) = order_board_corners(&raw, pattern, &self.params.graph) else {
            return Ok(None);
        };
        Ok(Some(refine_corners(&gray.view(), &ordered, &self.params.subpix)))
    }
}

fn to_image_gray(gray: &GrayImage) -> Result<image::GrayImage, DetectError> {
    if gray.width == 0 || gray.height == 0 {
        return Err(DetectError::InvalidGrayDimensions {
            width: gray.width,
            height: gray.height,
        });
    }
    let expected = gray.width * gray.height;
    if gray.data.len() != expected {
        return Err(DetectError::InvalidGrayBuffer {
            expected,
            got: gray.data.len(),
        });
    }
    image::GrayImage::from_raw(gray.width as u32, gray.height as u32, gray.data.clone()).ok_or(
        DetectError::InvalidGrayDimensions {
            width: gray.width,
            height: gray.height,
        },
    )
}

/// Pick the full `rows x cols` board out of a cloud of corner positions and
/// return it in row-major order.
///
/// Fast-rejects when there are fewer corners than the board has. When several
/// complete windows exist (e.g. weak responses along the board border extend
/// the grid) the one with the strongest total response wins; ties return
/// `None`.
pub fn order_board_corners(
    corners: &[RawCorner],
    pattern: PatternSize,
    params: &GridGraphParams,
) -> Option<Vec<Point2<f64>>> {
    let n = pattern.corner_count();
    if n == 0 || corners.len() < n {
        return None;
    }
    let points: Vec<Point2<f32>> = corners.iter().map(|c| c.position).collect();
    let graph = GridGraph::new(&points, params)?;

    let mut best: Option<(f32, Vec<usize>)> = None;
    let mut tied = false;
    for component in connected_components(&graph) {
        if component.len() < n {
            continue;
        }
        let Some(coords) = assign_grid_coordinates(&graph, &component) else {
            debug!("inconsistent grid component of {} corners", component.len());
            continue;
        };
        for layout in board_windows(&coords, pattern) {
            let score: f32 = layout.iter().map(|&i| corners[i].strength).sum();
            match &best {
                Some((s, _)) if score < *s => {}
                Some((s, _)) if score == *s => tied = true,
                _ => {
                    tied = false;
                    best = Some((score, layout));
                }
            }
        }
    }
    if tied {
        debug!("ambiguous chessboard layout");
        return None;
    }

    let (_, indices) = best?;
    let mut ordered: Vec<Point2<f64>> = indices
        .iter()
        .map(|&i| Point2::new(points[i].x as f64, points[i].y as f64))
        .collect();

    // Resolve the 180-degree ambiguity: start closest to the image origin.
    let (first, last) = (ordered[0], ordered[n - 1]);
    if last.x + last.y < first.x + first.y {
        ordered.reverse();
    }
    Some(ordered)
}

/// All fully populated `rows x cols` windows in a component, in row-major
/// node order. Boards lying across the `v` axis are rotated (not mirrored)
/// into place.
fn board_windows(coords: &HashMap<(i32, i32), usize>, pattern: PatternSize) -> Vec<Vec<usize>> {
    let (mut umin, mut umax, mut vmin, mut vmax) = (i32::MAX, i32::MIN, i32::MAX, i32::MIN);
    for &(u, v) in coords.keys() {
        umin = umin.min(u);
        umax = umax.max(u);
        vmin = vmin.min(v);
        vmax = vmax.max(v);
    }
    let rows = pattern.rows as i32;
    let cols = pattern.cols as i32;

    let mut out = Vec::new();
    // (span along u, span along v, rotated)
    let mut layouts = vec![(cols, rows, false)];
    if rows != cols {
        layouts.push((rows, cols, true));
    }
    for (su, sv, rotated) in layouts {
        for u0 in umin..=(umax - su + 1) {
            for v0 in vmin..=(vmax - sv + 1) {
                let mut nodes = Vec::with_capacity(pattern.corner_count());
                'fill: for r in 0..rows {
                    for c in 0..cols {
                        let key = if rotated {
                            (u0 + (rows - 1 - r), v0 + c)
                        } else {
                            (u0 + c, v0 + r)
                        };
                        match coords.get(&key) {
                            Some(&node) => nodes.push(node),
                            None => break 'fill,
                        }
                    }
                }
                if nodes.len() == pattern.corner_count() {
                    out.push(nodes);
                }
            }
        }
    }
    out
}
