//! 3x3 neighbourhood filters with reflect-101 borders (`cb|abcd|cb`).

use ndarray::{Array2, ArrayView2};

/// Sharpening kernel applied after the Gaussian pass.
pub const SHARPEN_KERNEL: [[i32; 3]; 3] = [[0, -1, 0], [-1, 5, -1], [0, -1, 0]];

/// Gaussian weights for a 3x3 window when sigma is derived from the kernel
/// size, scaled by 16.
const GAUSSIAN_3X3: [[i32; 3]; 3] = [[1, 2, 1], [2, 4, 2], [1, 2, 1]];

/// Maps an out-of-range coordinate back into `0..len` by mirroring around the
/// edge pixels without repeating them.
pub fn reflect_101(mut i: isize, len: usize) -> usize {
    let len = len as isize;
    if len == 1 {
        return 0;
    }
    loop {
        if i < 0 {
            i = -i;
        } else if i >= len {
            i = 2 * len - 2 - i;
        } else {
            return i as usize;
        }
    }
}

fn convolve_3x3(
    src: ArrayView2<u8>,
    kernel: &[[i32; 3]; 3],
    finish: impl Fn(i32) -> u8,
) -> Array2<u8> {
    let (height, width) = src.dim();
    Array2::from_shape_fn((height, width), |(y, x)| {
        let mut acc = 0i32;
        for (ky, row) in kernel.iter().enumerate() {
            let sy = reflect_101(y as isize + ky as isize - 1, height);
            for (kx, &weight) in row.iter().enumerate() {
                if weight == 0 {
                    continue;
                }
                let sx = reflect_101(x as isize + kx as isize - 1, width);
                acc += weight * src[[sy, sx]] as i32;
            }
        }
        finish(acc)
    })
}

/// 3x3 Gaussian blur. The separable `[1, 2, 1] / 4` kernel is exact in fixed
/// point, so the result is the integer sum rounded half up.
pub fn gaussian_blur_3x3(src: ArrayView2<u8>) -> Array2<u8> {
    convolve_3x3(src, &GAUSSIAN_3X3, |acc| ((acc + 8) >> 4) as u8)
}

/// Applies [`SHARPEN_KERNEL`], saturating to `u8`.
pub fn sharpen(src: ArrayView2<u8>) -> Array2<u8> {
    convolve_3x3(src, &SHARPEN_KERNEL, |acc| acc.clamp(0, 255) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn reflect_101_mirrors_without_edge_repeat() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(-2, 5), 2);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(6, 5), 2);
        assert_eq!(reflect_101(2, 5), 2);
        assert_eq!(reflect_101(-3, 1), 0);
        assert_eq!(reflect_101(9, 3), 1);
    }

    #[test]
    fn gaussian_splits_an_impulse() {
        let mut src = Array2::<u8>::zeros((5, 5));
        src[[2, 2]] = 16;
        let out = gaussian_blur_3x3(src.view());
        assert_eq!(out[[2, 2]], 4);
        assert_eq!(out[[1, 2]], 2);
        assert_eq!(out[[2, 3]], 2);
        assert_eq!(out[[1, 1]], 1);
        assert_eq!(out[[0, 0]], 0);
    }

    #[test]
    fn gaussian_uses_mirrored_border() {
        let src = array![[0u8, 160, 0], [0, 0, 0], [0, 0, 0]];
        let out = gaussian_blur_3x3(src.view());
        // Column -1 mirrors column 1, so (0, 0) sees 160 twice at weight 2.
        assert_eq!(out[[0, 0]], ((4 * 160 + 8) >> 4) as u8);
    }

    #[test]
    fn sharpen_boosts_centre_and_clamps_neighbours() {
        let mut src = Array2::<u8>::zeros((5, 5));
        src[[2, 2]] = 40;
        let out = sharpen(src.view());
        assert_eq!(out[[2, 2]], 200);
        assert_eq!(out[[1, 2]], 0);
        assert_eq!(out[[3, 3]], 0);

        src[[2, 2]] = 100;
        assert_eq!(sharpen(src.view())[[2, 2]], 255);
    }

    #[test]
    fn filters_preserve_flat_regions() {
        let src = Array2::from_elem((7, 9), 130u8);
        assert_eq!(gaussian_blur_3x3(src.view()), src);
        assert_eq!(sharpen(src.view()), src);
    }
}
