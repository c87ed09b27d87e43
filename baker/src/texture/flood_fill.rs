//! Nearest-label gap filling.
//!
//! An exact Euclidean feature transform (two separable passes of lower
//! envelopes of parabolas) labels every texel with the linear index of its
//! nearest covered texel. Uncovered texels then take that texel's color.

use image::{GrayImage, Rgb32FImage};
use log::info;
use rayon::prelude::*;

use crate::texture::{count_covered, UNCOVERED};

/// Nearest covered texel of one column entry: squared vertical distance and
/// row of that texel.
#[derive(Clone, Copy)]
struct ColumnFeature {
    dist2: f64,
    row: usize,
}

fn column_features(mask: &GrayImage, x: usize) -> Vec<Option<ColumnFeature>> {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let raw = mask.as_raw();
    let mut features: Vec<Option<usize>> = vec![None; h];

    let mut last = None;
    for y in 0..h {
        if raw[y * w + x] != UNCOVERED {
            last = Some(y);
        }
        features[y] = last;
    }

    let mut next = None;
    for y in (0..h).rev() {
        if raw[y * w + x] != UNCOVERED {
            next = Some(y);
        }
        features[y] = match (features[y], next) {
            (Some(a), Some(b)) if b - y < y - a => Some(b),
            (None, b) => b,
            (a, _) => a,
        };
    }

    features
        .into_iter()
        .enumerate()
        .map(|(y, f)| {
            f.map(|row| {
                let d = y as f64 - row as f64;
                ColumnFeature { dist2: d * d, row }
            })
        })
        .collect()
}

/// Per-row lower envelope over the column results. Returns, for every x,
/// the column and row of the nearest covered texel.
fn row_features(
    columns: &[Vec<Option<ColumnFeature>>],
    y: usize,
) -> Vec<(usize, usize)> {
    let w = columns.len();
    let sites: Vec<(usize, ColumnFeature)> = (0..w)
        .filter_map(|x| columns[x][y].map(|f| (x, f)))
        .collect();

    let f = |i: usize| sites[i].1.dist2 + (sites[i].0 * sites[i].0) as f64;
    let intersection = |a: usize, b: usize| {
        (f(b) - f(a)) / (2.0 * (sites[b].0 as f64 - sites[a].0 as f64))
    };

    // Envelope parabolas and the left boundaries of their ranges.
    let mut envelope: Vec<usize> = Vec::with_capacity(sites.len());
    let mut starts: Vec<f64> = Vec::with_capacity(sites.len());
    for q in 0..sites.len() {
        let mut s = f64::NEG_INFINITY;
        while let Some(&top) = envelope.last() {
            s = intersection(top, q);
            if s <= *starts.last().unwrap_or(&f64::NEG_INFINITY) {
                envelope.pop();
                starts.pop();
                s = f64::NEG_INFINITY;
            } else {
                break;
            }
        }
        envelope.push(q);
        starts.push(s);
    }

    let mut out = Vec::with_capacity(w);
    let mut k = 0;
    for x in 0..w {
        while k + 1 < envelope.len() && starts[k + 1] < x as f64 {
            k += 1;
        }
        let (sx, feature) = sites[envelope[k]];
        out.push((sx, feature.row));
    }
    out
}

/// Linear index of the nearest covered texel for every texel of `mask`, or
/// `None` when nothing is covered.
pub fn nearest_covered_labels(mask: &GrayImage) -> Option<Vec<usize>> {
    if count_covered(mask) == 0 {
        return None;
    }

    let w = mask.width() as usize;
    let columns: Vec<Vec<Option<ColumnFeature>>> =
        (0..w).into_par_iter().map(|x| column_features(mask, x)).collect();

    let mut labels = vec![0; mask.as_raw().len()];
    labels
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, row)| {
            let features = row_features(&columns, y);
            for (x, (sx, sy)) in features.into_iter().enumerate() {
                row[x] = sy * w + sx;
            }
        });

    Some(labels)
}

/// Fills every uncovered texel with the color of the nearest covered one.
/// Covered texels pass through; without covered texels the image is
/// returned unchanged.
pub fn flood_fill(image: &Rgb32FImage, mask: &GrayImage) -> Rgb32FImage {
    info!("  flood filling...");

    let mut filled = image.clone();
    let labels = match nearest_covered_labels(mask) {
        Some(labels) => labels,
        None => return filled,
    };

    let src = image.as_raw();
    let mask = mask.as_raw();
    let w = image.width() as usize;
    filled
        .par_chunks_mut(3 * w)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..w {
                let i = y * w + x;
                if mask[i] == UNCOVERED {
                    let l = labels[i];
                    row[3 * x..3 * x + 3]
                        .copy_from_slice(&src[3 * l..3 * l + 3]);
                }
            }
        });

    filled
}

#[cfg(test)]
mod test {
    use super::*;

    use image::{Luma, Rgb};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::texture::COVERED;

    fn brute_force_dist2(mask: &GrayImage, x: usize, y: usize) -> f64 {
        let w = mask.width() as usize;
        mask.as_raw()
            .iter()
            .enumerate()
            .filter(|&(_, &m)| m != UNCOVERED)
            .map(|(i, _)| {
                let dx = (i % w) as f64 - x as f64;
                let dy = (i / w) as f64 - y as f64;
                dx * dx + dy * dy
            })
            .fold(f64::INFINITY, f64::min)
    }

    #[test]
    fn test_labels_are_nearest() {
        let mut rng = StdRng::seed_from_u64(0);
        let (w, h) = (37, 23);
        let mask = GrayImage::from_fn(w, h, |_, _| {
            Luma([if rng.gen_bool(0.05) { COVERED } else { UNCOVERED }])
        });
        let labels = nearest_covered_labels(&mask).unwrap();

        for y in 0..h as usize {
            for x in 0..w as usize {
                let l = labels[y * w as usize + x];
                assert_ne!(mask.as_raw()[l], UNCOVERED);
                let lx = (l % w as usize) as f64;
                let ly = (l / w as usize) as f64;
                let d2 = (lx - x as f64).powi(2) + (ly - y as f64).powi(2);
                assert_eq!(d2, brute_force_dist2(&mask, x, y));
            }
        }
    }

    #[test]
    fn test_covered_texels_label_themselves() {
        let mut mask = GrayImage::new(4, 3);
        mask.put_pixel(1, 1, Luma([COVERED]));
        mask.put_pixel(3, 0, Luma([COVERED]));
        let labels = nearest_covered_labels(&mask).unwrap();
        assert_eq!(labels[4 + 1], 4 + 1);
        assert_eq!(labels[3], 3);
        assert_eq!(labels[2 * 4], 4 + 1);
    }

    #[test]
    fn test_flood_fill() {
        let mut image = Rgb32FImage::new(5, 1);
        let mut mask = GrayImage::new(5, 1);
        image.put_pixel(0, 0, Rgb([10.0, 0.0, 0.0]));
        image.put_pixel(4, 0, Rgb([0.0, 0.0, 20.0]));
        mask.put_pixel(0, 0, Luma([COVERED]));
        mask.put_pixel(4, 0, Luma([COVERED]));

        let filled = flood_fill(&image, &mask);
        assert_eq!(filled.get_pixel(1, 0), &Rgb([10.0, 0.0, 0.0]));
        assert_eq!(filled.get_pixel(3, 0), &Rgb([0.0, 0.0, 20.0]));
        assert_eq!(filled.get_pixel(4, 0), image.get_pixel(4, 0));

        // A second pass over the fully covered result changes nothing.
        let full = GrayImage::from_pixel(5, 1, Luma([COVERED]));
        assert_eq!(flood_fill(&filled, &full), filled);
    }

    #[test]
    fn test_flood_fill_without_coverage() {
        let image = Rgb32FImage::from_pixel(3, 3, Rgb([1.0, 2.0, 3.0]));
        let mask = GrayImage::new(3, 3);
        assert!(nearest_covered_labels(&mask).is_none());
        assert_eq!(flood_fill(&image, &mask), image);
    }
}
