//! Corner overlay for display frames.

use livecal_core::{Frame, PatternSize};
use nalgebra::{Point2, Vector2};

/// Row colors, cycled when the board has more rows than entries.
const ROW_COLORS: [[u8; 3]; 7] = [
    [255, 0, 0],
    [255, 128, 0],
    [200, 200, 0],
    [0, 255, 0],
    [0, 200, 200],
    [0, 0, 255],
    [255, 0, 255],
];

const MARKER_RADIUS: i64 = 4;

/// Whether `p` is finite and within one frame size of the image. Anything
/// further out is skipped so line rasterization stays bounded.
fn drawable(frame: &Frame, p: Point2<f64>) -> bool {
    let (w, h) = (frame.width() as f64, frame.height() as f64);
    p.x.is_finite() && p.y.is_finite() && p.x >= -w && p.x <= 2.0 * w && p.y >= -h && p.y <= 2.0 * h
}

fn draw_line(frame: &mut Frame, a: Point2<f64>, b: Point2<f64>, rgb: [u8; 3]) {
    let (mut x0, mut y0) = (a.x.round() as i64, a.y.round() as i64);
    let (x1, y1) = (b.x.round() as i64, b.y.round() as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        frame.put_pixel(x0, y0, rgb);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn draw_circle(frame: &mut Frame, c: Point2<f64>, radius: i64, rgb: [u8; 3]) {
    let (cx, cy) = (c.x.round() as i64, c.y.round() as i64);
    let (mut x, mut y) = (radius, 0i64);
    let mut err = 1 - radius;
    while x >= y {
        for (px, py) in [
            (x, y),
            (y, x),
            (-y, x),
            (-x, y),
            (-x, -y),
            (-y, -x),
            (y, -x),
            (x, -y),
        ] {
            frame.put_pixel(cx + px, cy + py, rgb);
        }
        y += 1;
        if err < 0 {
            err += 2 * y + 1;
        } else {
            x -= 1;
            err += 2 * (y - x) + 1;
        }
    }
}

fn draw_cross(frame: &mut Frame, c: Point2<f64>, half: f64, rgb: [u8; 3]) {
    let d1 = Vector2::new(half, half);
    let d2 = Vector2::new(half, -half);
    draw_line(frame, c - d1, c + d1, rgb);
    draw_line(frame, c - d2, c + d2, rgb);
}

/// Draw detected corners onto `frame`.
///
/// With `found = true` the corners are taken as the complete row-major board:
/// each row gets its own color and consecutive corners are joined by a
/// polyline. Otherwise every point is marked with a red circle.
pub fn draw_chessboard_corners(
    frame: &mut Frame,
    pattern: PatternSize,
    corners: &[Point2<f64>],
    found: bool,
) {
    let complete = found && corners.len() == pattern.corner_count() && pattern.cols > 0;
    if !complete {
        for &c in corners {
            if drawable(frame, c) {
                draw_circle(frame, c, MARKER_RADIUS, ROW_COLORS[0]);
            }
        }
        return;
    }

    let mut prev: Option<Point2<f64>> = None;
    for (row, chunk) in corners.chunks(pattern.cols).enumerate() {
        let color = ROW_COLORS[row % ROW_COLORS.len()];
        for &c in chunk {
            if !drawable(frame, c) {
                prev = None;
                continue;
            }
            if let Some(p) = prev {
                draw_line(frame, p, c, color);
            }
            draw_circle(frame, c, MARKER_RADIUS, color);
            draw_cross(frame, c, MARKER_RADIUS as f64 * 0.7, color);
            prev = Some(c);
        }
    }
}
