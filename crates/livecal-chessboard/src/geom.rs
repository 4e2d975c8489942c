use nalgebra::Vector2;
use std::f32::consts::{FRAC_PI_2, PI};

/// Angle between a directed vector and an undirected axis, in `[0, π/2]`.
pub fn axis_vec_diff(axis_angle: f32, vec_angle: f32) -> f32 {
    let two_pi = 2.0 * PI;
    let mut diff = (vec_angle - axis_angle).rem_euclid(two_pi);
    if diff >= PI {
        diff -= two_pi;
    }
    let diff_abs = diff.abs();
    diff_abs.min(PI - diff_abs)
}

/// Dominant grid direction, modulo `π/2`, of a set of edge vectors.
///
/// Row and column edges of a square grid are perpendicular, so each angle is
/// lifted to `4θ` where both collapse onto the same direction. Returns the
/// axis angle in `[-π/4, π/4)` or `None` without a clear consensus.
pub fn dominant_grid_axis(edges: &[Vector2<f32>]) -> Option<f32> {
    let mut sum = Vector2::<f32>::zeros();
    let mut weight = 0.0f32;
    for e in edges {
        let n = e.norm();
        if n <= f32::EPSILON {
            continue;
        }
        let four_theta = 4.0 * e.y.atan2(e.x);
        sum += Vector2::new(four_theta.cos(), four_theta.sin());
        weight += 1.0;
    }
    if weight <= 0.0 {
        return None;
    }
    let mean = sum / weight;
    if mean.norm_squared() < 0.04 {
        return None;
    }
    Some(0.25 * mean.y.atan2(mean.x))
}

/// Which of the two grid axes an edge follows and in which sense.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NeighborDirection {
    Right,
    Left,
    Up,
    Down,
}

impl NeighborDirection {
    /// Grid step `(du, dv)` taken along this direction.
    pub fn step(self) -> (i32, i32) {
        match self {
            NeighborDirection::Right => (1, 0),
            NeighborDirection::Left => (-1, 0),
            NeighborDirection::Up => (0, -1),
            NeighborDirection::Down => (0, 1),
        }
    }

    pub(crate) fn slot(self) -> usize {
        match self {
            NeighborDirection::Right => 0,
            NeighborDirection::Left => 1,
            NeighborDirection::Up => 2,
            NeighborDirection::Down => 3,
        }
    }
}

/// Classify an edge against the grid axes `u = axis`, `v = axis + π/2`.
///
/// `v` is `u` rotated clockwise on screen (image `y` points down), so the
/// `(u, v)` frame keeps the handedness of the board.
pub fn classify_edge(axis: f32, edge: &Vector2<f32>, tolerance: f32) -> Option<NeighborDirection> {
    let angle = edge.y.atan2(edge.x);
    let du = axis_vec_diff(axis, angle);
    let dv = axis_vec_diff(axis + FRAC_PI_2, angle);
    let u = Vector2::new(axis.cos(), axis.sin());
    let v = Vector2::new(-axis.sin(), axis.cos());
    if du <= tolerance && du <= dv {
        if edge.dot(&u) >= 0.0 {
            Some(NeighborDirection::Right)
        } else {
            Some(NeighborDirection::Left)
        }
    } else if dv <= tolerance {
        if edge.dot(&v) >= 0.0 {
            Some(NeighborDirection::Down)
        } else {
            Some(NeighborDirection::Up)
        }
    } else {
        None
    }
}
