//! Contrast-limited adaptive histogram equalization on `u8` rasters.

use ndarray::{Array2, ArrayView2, s};

use super::filter::reflect_101;

const HIST_SIZE: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct Clahe {
    pub clip_limit: f64,
    pub tiles_x: usize,
    pub tiles_y: usize,
}

impl Default for Clahe {
    fn default() -> Self {
        Self {
            clip_limit: 3.0,
            tiles_x: 8,
            tiles_y: 8,
        }
    }
}

impl Clahe {
    pub fn apply(&self, src: ArrayView2<u8>) -> Array2<u8> {
        let (height, width) = src.dim();
        let padded;
        let lut_source = if width % self.tiles_x == 0 && height % self.tiles_y == 0 {
            src.view()
        } else {
            padded = pad_to_tiles(src, self.tiles_x, self.tiles_y);
            padded.view()
        };

        let tile_h = lut_source.nrows() / self.tiles_y;
        let tile_w = lut_source.ncols() / self.tiles_x;
        let luts = self.tile_luts(lut_source, tile_w, tile_h);
        interpolate(src, &luts, self.tiles_x, self.tiles_y, tile_w, tile_h)
    }

    /// One 256-entry LUT per tile, row-major over the tile grid.
    fn tile_luts(&self, src: ArrayView2<u8>, tile_w: usize, tile_h: usize) -> Vec<[u8; HIST_SIZE]> {
        let tile_area = tile_w * tile_h;
        let lut_scale = (HIST_SIZE - 1) as f32 / tile_area as f32;
        let clip = if self.clip_limit > 0.0 {
            ((self.clip_limit * tile_area as f64 / HIST_SIZE as f64) as usize).max(1)
        } else {
            0
        };

        let mut luts = Vec::with_capacity(self.tiles_x * self.tiles_y);
        for ty in 0..self.tiles_y {
            for tx in 0..self.tiles_x {
                let tile = src.slice(s![
                    ty * tile_h..(ty + 1) * tile_h,
                    tx * tile_w..(tx + 1) * tile_w
                ]);

                let mut hist = [0usize; HIST_SIZE];
                for &v in tile.iter() {
                    hist[v as usize] += 1;
                }
                if clip > 0 {
                    clip_histogram(&mut hist, clip);
                }

                let mut lut = [0u8; HIST_SIZE];
                let mut cdf = 0usize;
                for (entry, count) in lut.iter_mut().zip(hist.iter()) {
                    cdf += count;
                    *entry = saturate_u8(cdf as f32 * lut_scale);
                }
                luts.push(lut);
            }
        }
        luts
    }
}

/// Caps every bin at `clip` and spreads the excess evenly, handing the
/// remainder out one count per `HIST_SIZE / residual` bins from the bottom.
fn clip_histogram(hist: &mut [usize; HIST_SIZE], clip: usize) {
    let mut clipped = 0;
    for bin in hist.iter_mut() {
        if *bin > clip {
            clipped += *bin - clip;
            *bin = clip;
        }
    }

    let batch = clipped / HIST_SIZE;
    let mut residual = clipped - batch * HIST_SIZE;
    for bin in hist.iter_mut() {
        *bin += batch;
    }

    if residual != 0 {
        let step = (HIST_SIZE / residual).max(1);
        let mut i = 0;
        while i < HIST_SIZE && residual > 0 {
            hist[i] += 1;
            i += step;
            residual -= 1;
        }
    }
}

/// Extends the bottom and right edges by `tiles - len % tiles` on both axes,
/// so an axis that already divides evenly still gains one full tile.
fn pad_to_tiles(src: ArrayView2<u8>, tiles_x: usize, tiles_y: usize) -> Array2<u8> {
    let (height, width) = src.dim();
    let pad_h = tiles_y - height % tiles_y;
    let pad_w = tiles_x - width % tiles_x;
    Array2::from_shape_fn((height + pad_h, width + pad_w), |(y, x)| {
        src[[
            reflect_101(y as isize, height),
            reflect_101(x as isize, width),
        ]]
    })
}

fn interpolate(
    src: ArrayView2<u8>,
    luts: &[[u8; HIST_SIZE]],
    tiles_x: usize,
    tiles_y: usize,
    tile_w: usize,
    tile_h: usize,
) -> Array2<u8> {
    let (height, width) = src.dim();
    let inv_tw = 1.0f32 / tile_w as f32;
    let inv_th = 1.0f32 / tile_h as f32;

    let columns: Vec<(usize, usize, f32)> = (0..width)
        .map(|x| {
            let txf = x as f32 * inv_tw - 0.5;
            let tx1 = txf.floor() as isize;
            let xa = txf - tx1 as f32;
            let tx2 = (tx1 + 1).min(tiles_x as isize - 1) as usize;
            (tx1.max(0) as usize, tx2, xa)
        })
        .collect();

    let mut dst = Array2::<u8>::zeros((height, width));
    for y in 0..height {
        let tyf = y as f32 * inv_th - 0.5;
        let ty1 = tyf.floor() as isize;
        let ya = tyf - ty1 as f32;
        let ya1 = 1.0 - ya;
        let ty2 = (ty1 + 1).min(tiles_y as isize - 1) as usize;
        let ty1 = ty1.max(0) as usize;

        let top = &luts[ty1 * tiles_x..(ty1 + 1) * tiles_x];
        let bottom = &luts[ty2 * tiles_x..(ty2 + 1) * tiles_x];

        for (x, &(tx1, tx2, xa)) in columns.iter().enumerate() {
            let v = src[[y, x]] as usize;
            let xa1 = 1.0 - xa;
            let res = (top[tx1][v] as f32 * xa1 + top[tx2][v] as f32 * xa) * ya1
                + (bottom[tx1][v] as f32 * xa1 + bottom[tx2][v] as f32 * xa) * ya;
            dst[[y, x]] = saturate_u8(res);
        }
    }
    dst
}

fn saturate_u8(value: f32) -> u8 {
    value.round_ties_even().clamp(0.0, 255.0) as u8
}
