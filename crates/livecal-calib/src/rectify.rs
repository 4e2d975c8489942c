//! Undistortion lookup tables and the per-frame remap.
//!
//! Tables store, for every destination pixel, the source position in 16-bit
//! fixed point: the integer part in `map_xy` and five fractional bits per axis
//! packed into `map_frac`. The remap blends the four neighbours with integer
//! bilinear weights and writes black outside the source frame.

use std::sync::Arc;

use livecal_core::{CameraModel, CameraVariant, Frame, ImageSize, Intrinsics, ModelError};
use log::debug;
use nalgebra::{Point2, Vector2};
use rayon::prelude::*;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Fractional bits per axis.
pub const INTER_BITS: u32 = 5;
/// Sub-pixel positions per axis (`1 << INTER_BITS`).
pub const INTER_TAB_SIZE: i64 = 1 << INTER_BITS;
const WEIGHT_BITS: u32 = 2 * INTER_BITS;
/// Grid resolution used to find the valid-pixel rectangle.
const RECT_GRID: usize = 9;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RectifyError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("distortion cannot be inverted at pixel ({x:.1}, {y:.1})")]
    NotInvertible { x: f64, y: f64 },
    #[error("undistorted field of view is degenerate")]
    DegenerateView,
}

/// Remap tables derived from one [`CameraModel`] snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct RectificationTables {
    size: ImageSize,
    variant: CameraVariant,
    new_intrinsics: Intrinsics,
    map_xy: Vec<[i16; 2]>,
    map_frac: Vec<u16>,
}

impl RectificationTables {
    pub fn size(&self) -> ImageSize {
        self.size
    }

    pub fn variant(&self) -> CameraVariant {
        self.variant
    }

    /// Camera matrix of the rectified image.
    pub fn new_intrinsics(&self) -> &Intrinsics {
        &self.new_intrinsics
    }

    /// Integer source coordinates, row-major.
    pub fn map_xy(&self) -> &[[i16; 2]] {
        &self.map_xy
    }

    /// `(frac_y << INTER_BITS) | frac_x` per destination pixel.
    pub fn map_frac(&self) -> &[u16] {
        &self.map_frac
    }

    /// Source position encoded for destination pixel `(x, y)`.
    pub fn source_position(&self, x: usize, y: usize) -> Option<Point2<f64>> {
        if x >= self.size.width || y >= self.size.height {
            return None;
        }
        let i = y * self.size.width + x;
        let [ix, iy] = self.map_xy[i];
        let f = self.map_frac[i] as i64;
        let scale = INTER_TAB_SIZE as f64;
        Some(Point2::new(
            ix as f64 + (f & (INTER_TAB_SIZE - 1)) as f64 / scale,
            iy as f64 + (f >> INTER_BITS) as f64 / scale,
        ))
    }

    /// Rectify `src` into a new frame of the table size and the source format.
    ///
    /// Samples outside `src` read as black, so a frame of the wrong size
    /// produces a cropped or padded result instead of failing.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all))]
    pub fn remap(&self, src: &Frame) -> Frame {
        let (w, h) = (self.size.width, self.size.height);
        let mut dst = Frame::zeros(w, h, src.format());
        if dst.is_empty() || src.is_empty() {
            return dst;
        }
        let channels = src.channels();
        let stride = dst.stride();
        let (sw, sh) = (src.width() as i64, src.height() as i64);
        let sdata = src.data();

        dst.data_mut()
            .par_chunks_mut(stride)
            .zip(self.map_xy.par_chunks(w))
            .zip(self.map_frac.par_chunks(w))
            .for_each(|((row, xy), frac)| {
                for (x, (&[ix, iy], &f)) in xy.iter().zip(frac).enumerate() {
                    let (x0, y0) = (ix as i64, iy as i64);
                    let ax = f as i64 & (INTER_TAB_SIZE - 1);
                    let ay = f as i64 >> INTER_BITS;
                    let weights = [
                        (INTER_TAB_SIZE - ax) * (INTER_TAB_SIZE - ay),
                        ax * (INTER_TAB_SIZE - ay),
                        (INTER_TAB_SIZE - ax) * ay,
                        ax * ay,
                    ];
                    let taps = [(x0, y0), (x0 + 1, y0), (x0, y0 + 1), (x0 + 1, y0 + 1)];
                    let out = &mut row[x * channels..(x + 1) * channels];
                    for (c, px) in out.iter_mut().enumerate() {
                        let mut acc = 0i64;
                        for (&(sx, sy), &wgt) in taps.iter().zip(&weights) {
                            if wgt == 0 || sx < 0 || sy < 0 || sx >= sw || sy >= sh {
                                continue;
                            }
                            let idx = (sy as usize * sw as usize + sx as usize) * channels + c;
                            acc += wgt * sdata[idx] as i64;
                        }
                        *px = ((acc + (1 << (WEIGHT_BITS - 1))) >> WEIGHT_BITS).clamp(0, 255) as u8;
                    }
                }
            });
        dst
    }
}

/// Builds rectification tables and keeps the last successful build.
#[derive(Clone, Debug, Default)]
pub struct RectificationMapBuilder {
    current: Option<Arc<RectificationTables>>,
}

impl RectificationMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables of the last successful [`rebuild`](Self::rebuild).
    pub fn current(&self) -> Option<Arc<RectificationTables>> {
        self.current.clone()
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    /// Build tables for `model` and make them current. On failure the
    /// previous tables stay current.
    pub fn rebuild(&mut self, model: &CameraModel) -> Result<Arc<RectificationTables>, RectifyError> {
        let tables = Arc::new(Self::build(model)?);
        self.current = Some(Arc::clone(&tables));
        Ok(tables)
    }

    /// Compute the rectified camera matrix for `model.alpha()` and the remap
    /// tables for it. No rotation is applied.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(variant = ?model.variant(), alpha = model.alpha()))
    )]
    pub fn build(model: &CameraModel) -> Result<RectificationTables, RectifyError> {
        model.validate()?;
        let new_intrinsics = optimal_intrinsics(model, model.alpha())?;
        let size = model.image_size();
        let (map_xy, map_frac) = build_maps(model, &new_intrinsics);
        debug!(
            "built {}x{} {:?} rectification tables (alpha={:.2}, fx'={:.2}, fy'={:.2})",
            size.width,
            size.height,
            model.variant(),
            model.alpha(),
            new_intrinsics.fx,
            new_intrinsics.fy
        );
        Ok(RectificationTables {
            size,
            variant: model.variant(),
            new_intrinsics,
            map_xy,
            map_frac,
        })
    }
}

/// Rectified camera matrix trading cropped borders (`alpha = 0`) against the
/// full field of view (`alpha = 1`).
pub fn optimal_intrinsics(model: &CameraModel, alpha: f64) -> Result<Intrinsics, RectifyError> {
    let alpha = if alpha.is_finite() { alpha.clamp(0.0, 1.0) } else { 0.0 };
    match model.variant() {
        CameraVariant::Pinhole => pinhole_optimal_intrinsics(model, alpha),
        CameraVariant::Fisheye => fisheye_optimal_intrinsics(model, alpha),
    }
}

#[derive(Clone, Copy, Debug)]
struct Rect {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
}

impl Rect {
    fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    fn height(&self) -> f64 {
        self.y1 - self.y0
    }
}

fn unproject(model: &CameraModel, x: f64, y: f64) -> Result<Vector2<f64>, RectifyError> {
    model
        .unproject(&Point2::new(x, y))
        .filter(|p| p.x.is_finite() && p.y.is_finite())
        .ok_or(RectifyError::NotInvertible { x, y })
}

/// Inner (all valid) and outer (bounding) rectangles of the undistorted image
/// border, in normalized coordinates.
fn undistorted_rectangles(model: &CameraModel) -> Result<(Rect, Rect), RectifyError> {
    let size = model.image_size();
    let (w, h) = (size.width as f64 - 1.0, size.height as f64 - 1.0);
    let last = RECT_GRID - 1;
    let mut outer = Rect {
        x0: f64::MAX,
        y0: f64::MAX,
        x1: f64::MIN,
        y1: f64::MIN,
    };
    let mut inner = Rect {
        x0: f64::MIN,
        y0: f64::MIN,
        x1: f64::MAX,
        y1: f64::MAX,
    };
    for gy in 0..RECT_GRID {
        for gx in 0..RECT_GRID {
            let p = unproject(
                model,
                gx as f64 * w / last as f64,
                gy as f64 * h / last as f64,
            )?;
            outer.x0 = outer.x0.min(p.x);
            outer.y0 = outer.y0.min(p.y);
            outer.x1 = outer.x1.max(p.x);
            outer.y1 = outer.y1.max(p.y);
            if gx == 0 {
                inner.x0 = inner.x0.max(p.x);
            }
            if gx == last {
                inner.x1 = inner.x1.min(p.x);
            }
            if gy == 0 {
                inner.y0 = inner.y0.max(p.y);
            }
            if gy == last {
                inner.y1 = inner.y1.min(p.y);
            }
        }
    }
    Ok((inner, outer))
}

fn pinhole_optimal_intrinsics(model: &CameraModel, alpha: f64) -> Result<Intrinsics, RectifyError> {
    let size = model.image_size();
    let (w, h) = (size.width as f64 - 1.0, size.height as f64 - 1.0);
    let (inner, outer) = undistorted_rectangles(model)?;
    if inner.width() <= 0.0 || inner.height() <= 0.0 || outer.width() <= 0.0 || outer.height() <= 0.0 {
        return Err(RectifyError::DegenerateView);
    }

    let fit = |r: &Rect| {
        let fx = w / r.width();
        let fy = h / r.height();
        (fx, fy, -fx * r.x0, -fy * r.y0)
    };
    let (fx0, fy0, cx0, cy0) = fit(&inner);
    let (fx1, fy1, cx1, cy1) = fit(&outer);
    let lerp = |a: f64, b: f64| a * (1.0 - alpha) + b * alpha;

    Ok(Intrinsics {
        fx: lerp(fx0, fx1),
        fy: lerp(fy0, fy1),
        cx: lerp(cx0, cx1),
        cy: lerp(cy0, cy1),
        skew: 0.0,
    })
}

/// Fisheye rectified matrix from the undistorted edge midpoints; `alpha`
/// balances between the tightest (`0`) and widest (`1`) focal length.
fn fisheye_optimal_intrinsics(model: &CameraModel, alpha: f64) -> Result<Intrinsics, RectifyError> {
    let size = model.image_size();
    let (w, h) = (size.width as f64, size.height as f64);
    let k = model.intrinsics();
    let aspect = k.fx / k.fy;

    let mids = [(w / 2.0, 0.0), (w, h / 2.0), (w / 2.0, h), (0.0, h / 2.0)];
    let mut pts = [Vector2::zeros(); 4];
    for (dst, &(x, y)) in pts.iter_mut().zip(&mids) {
        let p = unproject(model, x, y)?;
        *dst = Vector2::new(p.x, p.y * aspect);
    }
    let cn = pts.iter().sum::<Vector2<f64>>() / 4.0;
    let (min_x, max_x) = pts.iter().fold((f64::MAX, f64::MIN), |(lo, hi), p| (lo.min(p.x), hi.max(p.x)));
    let (min_y, max_y) = pts.iter().fold((f64::MAX, f64::MIN), |(lo, hi), p| (lo.min(p.y), hi.max(p.y)));

    let spans = [cn.x - min_x, max_x - cn.x, cn.y - min_y, max_y - cn.y];
    if spans.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
        return Err(RectifyError::DegenerateView);
    }
    let f = [
        w * 0.5 / spans[0],
        w * 0.5 / spans[1],
        h * 0.5 * aspect / spans[2],
        h * 0.5 * aspect / spans[3],
    ];
    let f_min = f.iter().copied().fold(f64::MAX, f64::min);
    let f_max = f.iter().copied().fold(f64::MIN, f64::max);
    let focal = alpha * f_min + (1.0 - alpha) * f_max;

    Ok(Intrinsics {
        fx: focal,
        fy: focal / aspect,
        cx: -cn.x * focal + w * 0.5,
        cy: (-cn.y * focal + h * aspect * 0.5) / aspect,
        skew: 0.0,
    })
}

/// Fixed-point source coordinates for every destination pixel.
fn build_maps(model: &CameraModel, new_k: &Intrinsics) -> (Vec<[i16; 2]>, Vec<u16>) {
    let size = model.image_size();
    let w = size.width;
    let mut map_xy = vec![[0i16; 2]; size.pixel_count()];
    let mut map_frac = vec![0u16; size.pixel_count()];
    if w == 0 {
        return (map_xy, map_frac);
    }
    let k = model.intrinsics();
    let distortion = model.distortion();

    map_xy
        .par_chunks_mut(w)
        .zip(map_frac.par_chunks_mut(w))
        .enumerate()
        .for_each(|(v, (xy_row, frac_row))| {
            let y = (v as f64 - new_k.cy) / new_k.fy;
            for (u, (xy, frac)) in xy_row.iter_mut().zip(frac_row.iter_mut()).enumerate() {
                let x = (u as f64 - new_k.cx) / new_k.fx;
                let d = distortion.distort(Vector2::new(x, y));
                let src = k.to_pixel(d.x, d.y);
                let (iu, iv) = (to_fixed(src.x), to_fixed(src.y));
                *xy = [saturate_i16(iu >> INTER_BITS), saturate_i16(iv >> INTER_BITS)];
                *frac = (((iv & (INTER_TAB_SIZE - 1)) << INTER_BITS) | (iu & (INTER_TAB_SIZE - 1))) as u16;
            }
        });
    (map_xy, map_frac)
}

#[inline]
fn to_fixed(v: f64) -> i64 {
    // Non-finite and far-away positions land outside any i16 image.
    if !v.is_finite() {
        return (i16::MIN as i64) << INTER_BITS;
    }
    let limit = (i32::MAX >> 1) as f64;
    (v * INTER_TAB_SIZE as f64).round().clamp(-limit, limit) as i64
}

#[inline]
fn saturate_i16(v: i64) -> i16 {
    v.clamp(i16::MIN as i64, i16::MAX as i64) as i16
}
