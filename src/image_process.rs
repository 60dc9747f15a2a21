/// Plate contour extraction inside one region of interest.
///
/// The steps run in a fixed order and each one consumes the previous output:
/// blue difference mask, Otsu binarization, morphological cleanup, contour
/// tracing, convex hull + polygon approximation, largest-area selection.

use image::{ GrayImage, Luma, RgbImage };
use imageproc::contours::find_contours;
use imageproc::contrast::otsu_level;
use imageproc::geometry::{ self, oriented_contour_area };
use imageproc::morphology::{ grayscale_close, grayscale_open, Mask };
use imageproc::point::Point;

/// Closed polygon in the coordinate space of the image it was traced in
pub type Contour = Vec<Point<i32>>;

pub const PLATE_KERNEL: RectKernel = RectKernel { width: 6, height: 3 };
pub const CLEANUP_SEQUENCE: [MorphOp; 4] = [MorphOp::Close, MorphOp::Close, MorphOp::Open, MorphOp::Close];
pub const APPROX_EPSILON: f64 = 3.0;
pub const MIN_CONTOUR_POINTS: usize = 4;
// farthest point searches before a closed curve is split
const SPLIT_SEARCH_ROUNDS: usize = 3;

/// Detect the contour of the license plate in an image holding one plate.
/// An empty contour means no usable boundary was found.
pub fn detect_contour(image: &RgbImage) -> Contour {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Contour::new();
    }

    // filter the blue area of the image
    let diff = blue_difference(image);
    let mask = binarize_otsu(&diff);
    // no foreground/background split, nothing plate-like in here
    if is_uniform(&mask) {
        return Contour::new();
    }

    // connect the plate regions, then find and simplify every contour
    let mask = clean_mask(&mask);
    let candidates = find_plate_contours(&mask).iter()
        .map(|contour| approx_poly_dp(&convex_hull(contour), APPROX_EPSILON, true))
        .collect();
    select_largest(candidates).unwrap_or_default()
}

/// `max(B - G/2 - R/2, 0)` per pixel, halves rounded down.
pub fn blue_difference(image: &RgbImage) -> GrayImage {
    let mut diff = GrayImage::new(image.width(), image.height());
    diff.pixels_mut().zip(image.pixels()).for_each(|(d, p)| {
        let [r, g, b] = p.0;
        let value = b as i16 - (g >> 1) as i16 - (r >> 1) as i16;
        *d = Luma([value.clamp(0, u8::MAX as i16) as u8]);
    });
    diff
}

/// Binary 0/255 image, pixels strictly above the Otsu level become 255.
pub fn binarize_otsu(mask: &GrayImage) -> GrayImage {
    let level = otsu_level(mask);
    let mut binary = mask.clone();
    for p in binary.pixels_mut() {
        *p = if p.0[0] > level { Luma([255]) } else { Luma([0]) };
    }
    binary
}

fn is_uniform(mask: &GrayImage) -> bool {
    let mut pixels = mask.pixels();
    match pixels.next() {
        Some(first) => pixels.all(|p| p == first),
        None => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MorphOp {
    /// erosion then dilation
    Open,
    /// dilation then erosion
    Close,
}

/// Rectangular structuring element anchored at `(width/2, height/2)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectKernel {
    pub width: u8,
    pub height: u8,
}

impl RectKernel {

    /// The kernel as an imageproc mask, an even side puts the anchor past the middle
    pub fn mask(&self) -> Mask {
        let shape = GrayImage::from_pixel(self.width as u32, self.height as u32, Luma([255]));
        Mask::from_image(&shape, self.width / 2, self.height / 2)
    }

}

pub fn morphology_ex(mask: &GrayImage, op: MorphOp, kernel: &Mask) -> GrayImage {
    match op {
        MorphOp::Open => grayscale_open(mask, kernel),
        MorphOp::Close => grayscale_close(mask, kernel),
    }
}

/// Close, close, open, close with the 6x3 plate kernel
pub fn clean_mask(mask: &GrayImage) -> GrayImage {
    let kernel = PLATE_KERNEL.mask();
    CLEANUP_SEQUENCE.iter().fold(mask.clone(), |mask, op| morphology_ex(&mask, *op, &kernel))
}

/// Every border of the mask, outer and hole alike, without hierarchy,
/// compressed to the end points of its straight runs.
pub fn find_plate_contours(mask: &GrayImage) -> Vec<Contour> {
    find_contours::<i32>(mask).into_iter()
        .map(|contour| compress_chain(&contour.points))
        .collect()
}

/// Drops the points in the middle of horizontal, vertical and diagonal runs.
pub fn compress_chain(points: &[Point<i32>]) -> Contour {
    let mut points = points.to_vec();
    points.dedup();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    let len = points.len();
    if len < 3 {
        return points;
    }
    let step = |a: Point<i32>, b: Point<i32>| ((b.x - a.x).signum(), (b.y - a.y).signum());
    (0..len).filter(|&i| {
        let prev = points[(i + len - 1) % len];
        let next = points[(i + 1) % len];
        step(prev, points[i]) != step(points[i], next)
    }).map(|i| points[i]).collect()
}

fn cross(o: Point<i32>, a: Point<i32>, b: Point<i32>) -> i64 {
    (a.x - o.x) as i64 * (b.y - o.y) as i64 - (a.y - o.y) as i64 * (b.x - o.x) as i64
}

/// Convex hull of a traced contour. Fewer than three points are their own hull.
pub fn convex_hull(points: &[Point<i32>]) -> Contour {
    if points.len() < 3 {
        return points.to_vec();
    }
    geometry::convex_hull(points)
}

fn distance_to_line(p: Point<i32>, a: Point<i32>, b: Point<i32>) -> f64 {
    let (dx, dy) = ((b.x - a.x) as f64, (b.y - a.y) as f64);
    let norm = dx.hypot(dy);
    if norm == 0.0 {
        return ((p.x - a.x) as f64).hypot((p.y - a.y) as f64);
    }
    (cross(a, b, p) as f64).abs() / norm
}

// Douglas-Peucker over an open chain. Pushes the kept points except the last one.
fn simplify_chain(chain: &[Point<i32>], epsilon: f64, out: &mut Contour) {
    let (first, last) = (chain[0], chain[chain.len() - 1]);
    let farthest = chain.iter().enumerate()
        .skip(1)
        .take(chain.len().saturating_sub(2))
        .map(|(i, p)| (i, distance_to_line(*p, first, last)))
        .fold(None, |best: Option<(usize, f64)>, (i, d)| match best {
            Some((_, best_d)) if d <= best_d => best,
            _ => Some((i, d)),
        });
    match farthest {
        Some((index, d)) if d > epsilon => {
            simplify_chain(&chain[..=index], epsilon, out);
            simplify_chain(&chain[index..], epsilon, out);
        }
        _ => out.push(first),
    }
}

fn squared_distance(a: Point<i32>, b: Point<i32>) -> i64 {
    let (dx, dy) = ((b.x - a.x) as i64, (b.y - a.y) as i64);
    dx * dx + dy * dy
}

// Index of the point farthest from `curve[from]`, scanning forward around the ring.
// The first one wins a tie.
fn farthest_from(curve: &[Point<i32>], from: usize) -> (usize, i64) {
    let len = curve.len();
    (1..len).map(|k| (from + k) % len)
        .fold((from, 0), |best, i| {
            let d = squared_distance(curve[from], curve[i]);
            if d > best.1 { (i, d) } else { best }
        })
}

/// Polygon approximation keeping every dropped point within `epsilon` of the result.
/// A closed curve is first split between two nearly opposite points: starting at
/// `curve[0]`, the farthest point search is repeated from each result a few times.
/// Both halves are simplified and joined back, starting at the split point.
pub fn approx_poly_dp(curve: &[Point<i32>], epsilon: f64, closed: bool) -> Contour {
    if curve.len() < 3 {
        return curve.to_vec();
    }
    let mut out = Contour::with_capacity(curve.len());
    if !closed {
        simplify_chain(curve, epsilon, &mut out);
        out.push(curve[curve.len() - 1]);
        return out;
    }

    let len = curve.len();
    let mut start = 0;
    let (mut far, mut dist) = farthest_from(curve, start);
    for _ in 1..SPLIT_SEARCH_ROUNDS {
        start = far;
        (far, dist) = farthest_from(curve, start);
    }
    if dist as f64 <= epsilon * epsilon {
        return vec![curve[start]];
    }

    let ring: Contour = curve[start..].iter().chain(&curve[..start]).copied().collect();
    let split = (far + len - start) % len;
    simplify_chain(&ring[..=split], epsilon, &mut out);
    let mut tail = ring[split..].to_vec();
    tail.push(ring[0]);
    simplify_chain(&tail, epsilon, &mut out);
    out
}

/// The contour with the biggest area among those with at least four points.
/// The first one in scan order wins a tie.
pub fn select_largest(candidates: Vec<Contour>) -> Option<Contour> {
    let mut best: Option<(f64, Contour)> = None;
    for contour in candidates {
        if contour.len() < MIN_CONTOUR_POINTS {
            continue;
        }
        let area = oriented_contour_area(&contour).abs();
        match &best {
            Some((best_area, _)) if area <= *best_area => {}
            _ => best = Some((area, contour)),
        }
    }
    best.map(|(_, contour)| contour)
}
