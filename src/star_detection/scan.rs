/// Connected-component scan of the binarized structure map
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    /// Last column inside the rectangle
    pub fn right(&self) -> usize {
        self.x + self.width - 1
    }

    /// Last row inside the rectangle
    pub fn bottom(&self) -> usize {
        self.y + self.height - 1
    }

    pub fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.x && x <= self.right() && y >= self.y && y <= self.bottom()
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    /// Grow by `margin` on every side, clipped to the image
    pub fn expand(&self, margin: usize, image_width: usize, image_height: usize) -> Rect {
        let x = self.x.saturating_sub(margin);
        let y = self.y.saturating_sub(margin);
        let right = (self.right() + margin).min(image_width - 1);
        let bottom = (self.bottom() + margin).min(image_height - 1);
        Rect {
            x,
            y,
            width: right - x + 1,
            height: bottom - y + 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub bounds: Rect,
    pub pixels: Vec<(usize, usize)>,
}

/// Collect 8-connected foreground regions in raster order of their first
/// pixel. Each region is filled run by run in both directions, and consumed
/// pixels are cleared from `mask` so every pixel lands in exactly one
/// candidate.
pub fn find_candidates(mask: &mut [bool], width: usize, height: usize) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let mut seeds = Vec::new();

    for y_top in 0..height {
        for x_start in 0..width {
            if !mask[y_top * width + x_start] {
                continue;
            }

            let mut pixels = Vec::new();
            let (mut min_x, mut max_x) = (x_start, x_start);
            let (mut min_y, mut max_y) = (y_top, y_top);
            seeds.push((x_start, y_top));

            while let Some((sx, sy)) = seeds.pop() {
                if !mask[sy * width + sx] {
                    continue;
                }
                let (left, right) = consume_run(mask, width, sy, sx, &mut pixels);
                min_x = min_x.min(left);
                max_x = max_x.max(right);
                min_y = min_y.min(sy);
                max_y = max_y.max(sy);

                let lo = left.saturating_sub(1);
                let hi = (right + 1).min(width - 1);
                let neighbors = [sy.checked_sub(1), Some(sy + 1).filter(|&y| y < height)];
                for y in neighbors.into_iter().flatten() {
                    let mut x = lo;
                    while x <= hi {
                        if mask[y * width + x] {
                            seeds.push((x, y));
                            // One seed per run
                            while x <= hi && mask[y * width + x] {
                                x += 1;
                            }
                        } else {
                            x += 1;
                        }
                    }
                }
            }

            candidates.push(Candidate {
                bounds: Rect {
                    x: min_x,
                    y: min_y,
                    width: max_x - min_x + 1,
                    height: max_y - min_y + 1,
                },
                pixels,
            });
        }
    }

    candidates
}

/// Clear the horizontal run through `(x, y)` and return its extent
fn consume_run(
    mask: &mut [bool],
    width: usize,
    y: usize,
    x: usize,
    pixels: &mut Vec<(usize, usize)>,
) -> (usize, usize) {
    let row = y * width;
    let mut left = x;
    while left > 0 && mask[row + left - 1] {
        left -= 1;
    }
    let mut right = x;
    while right + 1 < width && mask[row + right + 1] {
        right += 1;
    }
    for px in left..=right {
        mask[row + px] = false;
        pixels.push((px, y));
    }
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(rows: &[&str]) -> (Vec<bool>, usize, usize) {
        let width = rows[0].len();
        let mask = rows
            .iter()
            .flat_map(|r| r.chars().map(|c| c == '#'))
            .collect();
        (mask, width, rows.len())
    }

    #[test]
    fn test_separate_blobs() {
        let (mut mask, w, h) = mask_from(&[
            "........",
            ".##..#..",
            ".##..##.",
            "......#.",
            "........",
        ]);
        let candidates = find_candidates(&mut mask, w, h);
        assert_eq!(candidates.len(), 2);
        assert_eq!(
            candidates[0].bounds,
            Rect {
                x: 1,
                y: 1,
                width: 2,
                height: 2
            }
        );
        assert_eq!(candidates[0].pixels.len(), 4);
        assert_eq!(
            candidates[1].bounds,
            Rect {
                x: 5,
                y: 1,
                width: 2,
                height: 3
            }
        );
        assert_eq!(candidates[1].pixels.len(), 4);
        assert!(mask.iter().all(|&m| !m));
    }

    #[test]
    fn test_diagonal_neighbors_join() {
        let (mut mask, w, h) = mask_from(&["#...", ".#..", "..#.", "...."]);
        let candidates = find_candidates(&mut mask, w, h);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].bounds.width, 3);
        assert_eq!(candidates[0].bounds.height, 3);
    }

    #[test]
    fn test_widening_row_extends_bounds() {
        let (mut mask, w, h) = mask_from(&["..#...", ".###..", "######", "......"]);
        let candidates = find_candidates(&mut mask, w, h);
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].bounds,
            Rect {
                x: 0,
                y: 0,
                width: 6,
                height: 3
            }
        );
        assert_eq!(candidates[0].pixels.len(), 10);
    }

    #[test]
    fn test_u_shape_is_one_candidate() {
        let (mut mask, w, h) = mask_from(&["......", ".#..#.", ".#..#.", ".####.", "......"]);
        let candidates = find_candidates(&mut mask, w, h);
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].bounds,
            Rect {
                x: 1,
                y: 1,
                width: 4,
                height: 3
            }
        );
        assert_eq!(candidates[0].pixels.len(), 8);
        assert!(mask.iter().all(|&m| !m));
    }

    #[test]
    fn test_tip_joined_only_from_row_below() {
        // The left tip joins the region only through the row below it
        let (mut mask, w, h) = mask_from(&[
            ".....#",
            "....#.",
            "#...#.",
            ".####.",
            "......",
        ]);
        let candidates = find_candidates(&mut mask, w, h);
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].bounds,
            Rect {
                x: 0,
                y: 0,
                width: 6,
                height: 4
            }
        );
        assert_eq!(candidates[0].pixels.len(), 8);
    }

    #[test]
    fn test_rect_expand_clips_to_image() {
        let rect = Rect {
            x: 1,
            y: 2,
            width: 3,
            height: 3,
        };
        let expanded = rect.expand(3, 8, 8);
        assert_eq!(
            expanded,
            Rect {
                x: 0,
                y: 0,
                width: 7,
                height: 8
            }
        );
        assert!(expanded.contains(6, 7));
        assert_eq!(rect.area(), 9);
    }
}
