use livecal_chessboard::{ChessboardFinder, CornerFinder, DetectError, PatternSize};
use livecal_core::GrayImage;
use nalgebra::Point2;

const SQUARE: f64 = 40.0;
const ORIGIN: (f64, f64) = (70.0, 60.0);

/// Render a board of `(cols + 1) x (rows + 1)` squares on a white margin,
/// rotated by `angle`, with 4x4 supersampling.
fn render_board(w: usize, h: usize, pattern: PatternSize, angle: f64) -> GrayImage {
    let (s, c) = angle.sin_cos();
    let squares_x = pattern.cols as i64 + 1;
    let squares_y = pattern.rows as i64 + 1;
    let ss = 4;
    let mut data = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut dark = 0usize;
            for sy in 0..ss {
                for sx in 0..ss {
                    let px = x as f64 - 0.5 + (sx as f64 + 0.5) / ss as f64 - ORIGIN.0;
                    let py = y as f64 - 0.5 + (sy as f64 + 0.5) / ss as f64 - ORIGIN.1;
                    // Inverse rotation into board coordinates.
                    let bx = c * px + s * py;
                    let by = -s * px + c * py;
                    let (i, j) = ((bx / SQUARE).floor() as i64, (by / SQUARE).floor() as i64);
                    if (0..squares_x).contains(&i) && (0..squares_y).contains(&j) && (i + j) % 2 == 0 {
                        dark += 1;
                    }
                }
            }
            let frac = dark as f64 / (ss * ss) as f64;
            data[y * w + x] = (235.0 - 210.0 * frac).round() as u8;
        }
    }
    GrayImage {
        width: w,
        height: h,
        data,
    }
}

fn expected_corners(pattern: PatternSize, angle: f64) -> Vec<Point2<f64>> {
    let (s, c) = angle.sin_cos();
    (1..=pattern.rows)
        .flat_map(|r| (1..=pattern.cols).map(move |k| (r, k)))
        .map(|(r, k)| {
            let bx = k as f64 * SQUARE;
            let by = r as f64 * SQUARE;
            Point2::new(ORIGIN.0 + c * bx - s * by, ORIGIN.1 + s * bx + c * by)
        })
        .collect()
}

#[test]
fn finds_and_orders_rendered_board() {
    let pattern = PatternSize::new(5, 7);
    let angle = 0.08;
    let img = render_board(480, 380, pattern, angle);

    let corners = ChessboardFinder::default()
        .find_corners(&img, pattern)
        .expect("valid input")
        .expect("board found");
    assert_eq!(corners.len(), 35);

    for (got, want) in corners.iter().zip(expected_corners(pattern, angle)) {
        let err = (got - want).norm();
        assert!(err < 0.3, "corner {got:?} vs {want:?} (err {err:.3})");
    }
}

#[test]
fn malformed_buffer_is_an_error() {
    let img = GrayImage {
        width: 32,
        height: 32,
        data: vec![0; 100],
    };
    let err = ChessboardFinder::default()
        .find_corners(&img, PatternSize::new(5, 7))
        .expect_err("short buffer");
    assert_eq!(
        err,
        DetectError::InvalidGrayBuffer {
            expected: 1024,
            got: 100
        }
    );
}

#[test]
fn wrong_pattern_is_not_reported() {
    let img = render_board(480, 380, PatternSize::new(5, 7), 0.0);
    let res = ChessboardFinder::default()
        .find_corners(&img, PatternSize::new(6, 9))
        .expect("valid input");
    assert!(res.is_none());
}
