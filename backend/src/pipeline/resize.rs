//! Area interpolation for single-channel `u8` rasters.
//!
//! Downscaling averages the source pixels covered by each output pixel.
//! Upscaling falls back to linear interpolation with area-derived fractions,
//! which degenerates to pixel replication for integral factors.

use ndarray::{Array2, ArrayView2};

const INTER_RESIZE_COEF_BITS: u32 = 11;
const INTER_RESIZE_COEF_SCALE: i32 = 1 << INTER_RESIZE_COEF_BITS;

/// Resizes `src` to `width` x `height`. Both `src` and the target must be non-empty.
pub fn resize_area(src: ArrayView2<u8>, width: usize, height: usize) -> Array2<u8> {
    let (src_h, src_w) = src.dim();
    if src_h == height && src_w == width {
        return src.to_owned();
    }

    let scale_x = 1.0 / (width as f64 / src_w as f64);
    let scale_y = 1.0 / (height as f64 / src_h as f64);

    if scale_x >= 1.0 && scale_y >= 1.0 {
        let int_x = scale_x.round();
        let int_y = scale_y.round();
        if (scale_x - int_x).abs() < f64::EPSILON && (scale_y - int_y).abs() < f64::EPSILON {
            return box_average(src, int_x as usize, int_y as usize, width, height);
        }
        return fractional_area(src, scale_x, scale_y, width, height);
    }

    area_linear(src, scale_x, scale_y, width, height)
}

/// Integral downscale: every output pixel is the mean of a `fx` x `fy` block.
fn box_average(
    src: ArrayView2<u8>,
    fx: usize,
    fy: usize,
    width: usize,
    height: usize,
) -> Array2<u8> {
    let area = fx * fy;
    let inv_area = 1.0f32 / area as f32;
    Array2::from_shape_fn((height, width), |(y, x)| {
        let mut sum = 0u32;
        for sy in y * fy..(y + 1) * fy {
            for sx in x * fx..(x + 1) * fx {
                sum += src[[sy, sx]] as u32;
            }
        }
        if area == 4 {
            // 2x2 blocks round half up, like the vectorised kernel.
            ((sum + 2) >> 2) as u8
        } else {
            saturate_u8(sum as f32 * inv_area)
        }
    })
}

#[derive(Debug, Clone, Copy)]
struct AreaWeight {
    dst: usize,
    src: usize,
    alpha: f32,
}

fn area_weights(src_len: usize, dst_len: usize, scale: f64) -> Vec<AreaWeight> {
    let mut weights = Vec::with_capacity(src_len * 2);
    for dst in 0..dst_len {
        let fs1 = dst as f64 * scale;
        let fs2 = fs1 + scale;
        let cell = scale.min(src_len as f64 - fs1);

        let mut s2 = fs2.floor() as isize;
        s2 = s2.min(src_len as isize - 1);
        let s1 = (fs1.ceil() as isize).min(s2);

        if s1 as f64 - fs1 > 1e-3 {
            weights.push(AreaWeight {
                dst,
                src: (s1 - 1) as usize,
                alpha: ((s1 as f64 - fs1) / cell) as f32,
            });
        }
        for s in s1..s2 {
            weights.push(AreaWeight {
                dst,
                src: s as usize,
                alpha: (1.0 / cell) as f32,
            });
        }
        if fs2 - s2 as f64 > 1e-3 {
            weights.push(AreaWeight {
                dst,
                src: s2 as usize,
                alpha: ((fs2 - s2 as f64).min(1.0).min(cell) / cell) as f32,
            });
        }
    }
    weights
}

/// Non-integral downscale with fractional coverage weights accumulated in `f32`.
fn fractional_area(
    src: ArrayView2<u8>,
    scale_x: f64,
    scale_y: f64,
    width: usize,
    height: usize,
) -> Array2<u8> {
    let (src_h, src_w) = src.dim();
    let x_weights = area_weights(src_w, width, scale_x);
    let y_weights = area_weights(src_h, height, scale_y);

    let mut dst = Array2::<u8>::zeros((height, width));
    let mut row_buf = vec![0.0f32; width];
    let mut sum = vec![0.0f32; width];
    let mut prev_dy = y_weights[0].dst;

    for yw in &y_weights {
        row_buf.iter_mut().for_each(|v| *v = 0.0);
        let row = src.row(yw.src);
        for xw in &x_weights {
            row_buf[xw.dst] += row[xw.src] as f32 * xw.alpha;
        }

        if yw.dst != prev_dy {
            for (x, acc) in sum.iter_mut().enumerate() {
                dst[[prev_dy, x]] = saturate_u8(*acc);
                *acc = yw.alpha * row_buf[x];
            }
            prev_dy = yw.dst;
        } else {
            for (acc, v) in sum.iter_mut().zip(&row_buf) {
                *acc += yw.alpha * v;
            }
        }
    }
    for (x, acc) in sum.iter().enumerate() {
        dst[[prev_dy, x]] = saturate_u8(*acc);
    }

    dst
}

#[derive(Debug, Clone, Copy)]
struct LinearTap {
    src: usize,
    alpha0: i32,
    alpha1: i32,
}

/// Source offsets and fixed-point coefficients along one axis. The second
/// return value is the first output index that samples only the last source
/// pixel.
fn linear_taps(src_len: usize, dst_len: usize, scale: f64) -> (Vec<LinearTap>, usize) {
    let inv_scale = dst_len as f64 / src_len as f64;
    let mut limit = dst_len;
    let mut taps = Vec::with_capacity(dst_len);

    for d in 0..dst_len {
        let mut s = (d as f64 * scale).floor() as isize;
        let mut f = ((d + 1) as f64 - (s + 1) as f64 * inv_scale) as f32;
        f = if f <= 0.0 { 0.0 } else { f - f.floor() };

        if s + 1 >= src_len as isize {
            limit = limit.min(d);
            if s >= src_len as isize - 1 {
                f = 0.0;
                s = src_len as isize - 1;
            }
        }

        taps.push(LinearTap {
            src: s.max(0) as usize,
            alpha0: fixed_coef(1.0 - f),
            alpha1: fixed_coef(f),
        });
    }

    (taps, limit)
}

fn fixed_coef(value: f32) -> i32 {
    (value * INTER_RESIZE_COEF_SCALE as f32)
        .round_ties_even()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i32
}

fn area_linear(
    src: ArrayView2<u8>,
    scale_x: f64,
    scale_y: f64,
    width: usize,
    height: usize,
) -> Array2<u8> {
    let (src_h, src_w) = src.dim();
    let (x_taps, x_limit) = linear_taps(src_w, width, scale_x);
    let (y_taps, _) = linear_taps(src_h, height, scale_y);

    let horizontal = |sy: usize| -> Vec<i32> {
        let row = src.row(sy);
        x_taps
            .iter()
            .enumerate()
            .map(|(dx, tap)| {
                if dx < x_limit {
                    row[tap.src] as i32 * tap.alpha0 + row[tap.src + 1] as i32 * tap.alpha1
                } else {
                    row[tap.src] as i32 * INTER_RESIZE_COEF_SCALE
                }
            })
            .collect()
    };

    let mut dst = Array2::<u8>::zeros((height, width));
    for (dy, tap) in y_taps.iter().enumerate() {
        let sy0 = tap.src.min(src_h - 1);
        let sy1 = (tap.src + 1).min(src_h - 1);
        let row0 = horizontal(sy0);
        let row1 = horizontal(sy1);
        for dx in 0..width {
            // Rounding follows the vectorised 32s -> 8u kernel: operands are
            // pre-shifted by 4, products by 16 and the sum by 2.
            let t0 = ((row0[dx] >> 4) * tap.alpha0) >> 16;
            let t1 = ((row1[dx] >> 4) * tap.alpha1) >> 16;
            dst[[dy, dx]] = ((t0 + t1 + 2) >> 2).clamp(0, 255) as u8;
        }
    }

    dst
}

fn saturate_u8(value: f32) -> u8 {
    value.round_ties_even().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn same_size_is_a_copy() {
        let src = array![[1u8, 2, 3], [4, 5, 6]];
        assert_eq!(resize_area(src.view(), 3, 2), src);
    }

    #[test]
    fn integral_downscale_averages_blocks() {
        let src = array![
            [10u8, 20, 100, 100],
            [30, 40, 100, 100],
            [0, 0, 255, 255],
            [0, 1, 255, 255],
        ];
        let out = resize_area(src.view(), 2, 2);
        assert_eq!(out, array![[25u8, 100], [0, 255]]);
    }

    #[test]
    fn two_by_two_blocks_round_half_up() {
        let src = array![[0u8, 1], [1, 0]];
        assert_eq!(resize_area(src.view(), 1, 1), array![[1u8]]);
    }

    #[test]
    fn integral_downscale_by_three_rounds_to_nearest() {
        let src = Array2::from_shape_fn((3, 3), |(y, x)| if y == 0 && x == 0 { 5u8 } else { 0 });
        // 5 / 9 = 0.56 rounds up.
        assert_eq!(resize_area(src.view(), 1, 1), array![[1u8]]);
    }

    #[test]
    fn fractional_downscale_preserves_flat_regions() {
        let src = Array2::from_elem((3, 3), 200u8);
        let out = resize_area(src.view(), 2, 2);
        assert!(out.iter().all(|&v| v == 200));
    }

    #[test]
    fn fractional_downscale_weights_partial_pixels() {
        let src = array![[0u8, 90, 180], [0, 90, 180], [0, 90, 180]];
        let out = resize_area(src.view(), 2, 2);
        // Left cell covers column 0 fully and half of column 1: 90 * 0.5 / 1.5 = 30.
        assert_eq!(out, array![[30u8, 150], [30, 150]]);
    }

    #[test]
    fn integral_upscale_replicates_pixels() {
        let src = array![[10u8, 20], [30, 40]];
        let out = resize_area(src.view(), 4, 4);
        assert_eq!(
            out,
            array![
                [10u8, 10, 20, 20],
                [10, 10, 20, 20],
                [30, 30, 40, 40],
                [30, 30, 40, 40],
            ]
        );
    }

    #[test]
    fn fractional_upscale_interpolates() {
        let src = array![[0u8, 100], [0, 100]];
        let out = resize_area(src.view(), 3, 3);
        for row in out.rows() {
            assert_eq!(row.to_vec(), vec![0u8, 50, 100]);
        }
    }

    #[test]
    fn flat_image_stays_flat_at_model_size() {
        let src = Array2::from_elem((100, 100), 128u8);
        let out = resize_area(src.view(), 224, 224);
        assert_eq!(out.dim(), (224, 224));
        assert!(out.iter().all(|&v| v == 128));

        let src = Array2::from_elem((500, 333), 77u8);
        let out = resize_area(src.view(), 224, 224);
        assert!(out.iter().all(|&v| v == 77));
    }
}
