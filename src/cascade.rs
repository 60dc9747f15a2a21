//! Boosted Haar cascade stored in the OpenCV `opencv-cascade-classifier` XML layout,
//! with multi-scale sliding window detection and rectangle grouping.

use image::{ GrayImage, Luma, ImageBuffer, imageops::{ self, FilterType } };
use imageproc::integral_image::{ integral_image, integral_squared_image };
use imageproc::rect::Rect;
use log::debug;
use roxmltree::{ Document, Node };
use thiserror::Error;

use std::fs;
use std::io::Error as IOError;
use std::path::Path;
use std::str::FromStr;

/// Neighbourhood used to decide that two candidate windows hit the same object
pub const GROUP_EPS: f64 = 0.2;

const CASCADE_TYPE: &str = "opencv-cascade-classifier";

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error(transparent)]
    IOError(#[from] IOError),
    #[error(transparent)]
    XmlError(#[from] roxmltree::Error),
    #[error("missing <{0}>")]
    Missing(&'static str),
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid detection parameters: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    /// ratio between two consecutive pyramid levels, must be above 1
    pub scale_factor: f64,
    /// candidates a group needs beyond this count to be kept, 0 disables grouping
    pub min_neighbors: usize,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self { scale_factor: 1.2, min_neighbors: 5 }
    }
}

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

// left/right above 0 index another node, otherwise -value indexes a leaf
#[derive(Debug, Clone, Copy)]
struct TreeNode {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<TreeNode>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    trees: Vec<Tree>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accepted,
    RejectedAt(usize),
}

struct Integrals {
    sum: ImageBuffer<Luma<u64>, Vec<u64>>,
    sqsum: ImageBuffer<Luma<u64>, Vec<u64>>,
}

impl Integrals {

    fn new(image: &GrayImage) -> Self {
        let sum = integral_image::<_, u64>(image);
        let sqsum = integral_squared_image::<_, u64>(image);
        Self { sum, sqsum }
    }

    fn rect(table: &ImageBuffer<Luma<u64>, Vec<u64>>, x: u32, y: u32, width: u32, height: u32) -> f64 {
        let at = |x: u32, y: u32| table.get_pixel(x, y).0[0] as f64;
        at(x + width, y + height) - at(x, y + height) - at(x + width, y) + at(x, y)
    }

}

#[derive(Debug, Clone)]
pub struct CascadeClassifier {
    window: (u32, u32),
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
    params: DetectParams,
}

impl CascadeClassifier {

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let xml = fs::read_to_string(path)?;
        Self::from_xml(&xml)
    }

    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let doc = Document::parse(xml)?;
        let cascade = doc.root_element().children()
            .find(|n| n.is_element() && (n.has_tag_name("cascade") || n.attribute("type_id").is_some()))
            .ok_or(CascadeError::Missing("cascade"))?;
        match cascade.attribute("type_id") {
            Some(CASCADE_TYPE) | None => {}
            Some(other) => return Err(CascadeError::Unsupported(format!("type {}", other))),
        }

        let stage_type = text(child(cascade, "stageType")?);
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {}", stage_type)));
        }
        let feature_type = text(child(cascade, "featureType")?);
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {}", feature_type)));
        }
        let width: u32 = number(cascade, "width")?;
        let height: u32 = number(cascade, "height")?;
        if width == 0 || height == 0 {
            return Err(CascadeError::Unsupported("empty window".to_string()));
        }

        let features = items(child(cascade, "features")?)
            .map(|feature| parse_feature(feature, width, height))
            .collect::<Result<Vec<_>, _>>()?;
        let stages = items(child(cascade, "stages")?)
            .map(|stage| parse_stage(stage, features.len()))
            .collect::<Result<Vec<_>, _>>()?;
        if stages.is_empty() {
            return Err(CascadeError::Missing("stages"));
        }

        debug!("cascade {}x{} with {} stages, {} features", width, height, stages.len(), features.len());
        Ok(Self { window: (width, height), stages, features, params: DetectParams::default() })
    }

    pub fn with_params(mut self, params: DetectParams) -> Result<Self, CascadeError> {
        if !(params.scale_factor > 1.0) {
            return Err(CascadeError::InvalidParams(format!("scale factor {} must be above 1", params.scale_factor)));
        }
        self.params = params;
        Ok(self)
    }

    pub fn params(&self) -> DetectParams {
        self.params
    }

    /// model window as (width, height)
    pub fn window_size(&self) -> (u32, u32) {
        self.window
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run the cascade over an image pyramid and group the raw hits.
    /// Rects are in the coordinate space of `image`.
    pub fn detect_multi_scale(&self, image: &GrayImage) -> Vec<Rect> {
        let (width, height) = image.dimensions();
        let (win_w, win_h) = self.window;
        let mut candidates = Vec::new();

        let mut factor = 1.0f64;
        loop {
            let scaled_w = (width as f64 / factor).round() as u32;
            let scaled_h = (height as f64 / factor).round() as u32;
            if scaled_w < win_w || scaled_h < win_h {
                break;
            }
            let window_w = (win_w as f64 * factor).round() as u32;
            let window_h = (win_h as f64 * factor).round() as u32;
            if window_w > width || window_h > height {
                break;
            }

            let before = candidates.len();
            if scaled_w == width && scaled_h == height {
                self.scan(image, factor, (window_w, window_h), &mut candidates);
            } else {
                let scaled = imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle);
                self.scan(&scaled, factor, (window_w, window_h), &mut candidates);
            }
            debug!("scale {:.3}: {} candidates", factor, candidates.len() - before);
            factor *= self.params.scale_factor;
        }

        group_rectangles(candidates, self.params.min_neighbors, GROUP_EPS)
    }

    fn scan(&self, image: &GrayImage, factor: f64, window: (u32, u32), out: &mut Vec<Rect>) {
        let integrals = Integrals::new(image);
        let (width, height) = image.dimensions();
        let (win_w, win_h) = self.window;
        let step = if factor > 2.0 { 1 } else { 2 };

        for y in (0..=height - win_h).step_by(step as usize) {
            let mut x = 0;
            while x <= width - win_w {
                match self.evaluate(&integrals, x, y) {
                    Verdict::Accepted => {
                        let left = (x as f64 * factor).round() as i32;
                        let top = (y as f64 * factor).round() as i32;
                        out.push(Rect::at(left, top).of_size(window.0, window.1));
                    }
                    // rejected right away, the next position is very likely a miss as well
                    Verdict::RejectedAt(0) => x += step,
                    Verdict::RejectedAt(_) => {}
                }
                x += step;
            }
        }
    }

    fn evaluate(&self, integrals: &Integrals, x: u32, y: u32) -> Verdict {
        let (win_w, win_h) = self.window;
        // variance normalisation over the window inset by one pixel
        let (nx, ny, nw, nh) = if win_w > 2 && win_h > 2 {
            (x + 1, y + 1, win_w - 2, win_h - 2)
        } else {
            (x, y, win_w, win_h)
        };
        let area = (nw * nh) as f64;
        let sum = Integrals::rect(&integrals.sum, nx, ny, nw, nh);
        let sqsum = Integrals::rect(&integrals.sqsum, nx, ny, nw, nh);
        let nf = area * sqsum - sum * sum;
        let nf = if nf > 0.0 { nf.sqrt() } else { 1.0 };

        let feature_value = |index: usize| {
            self.features[index].rects.iter()
                .map(|r| r.weight * Integrals::rect(&integrals.sum, x + r.x, y + r.y, r.width, r.height))
                .sum::<f64>() / nf
        };

        for (index, stage) in self.stages.iter().enumerate() {
            let score: f64 = stage.trees.iter().map(|tree| {
                let mut node = 0i32;
                loop {
                    let n = tree.nodes[node as usize];
                    node = if feature_value(n.feature) < n.threshold { n.left } else { n.right };
                    if node <= 0 {
                        break tree.leaves[(-node) as usize];
                    }
                }
            }).sum();
            if score < stage.threshold {
                return Verdict::RejectedAt(index);
            }
        }
        Verdict::Accepted
    }

}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &'static str) -> Result<Node<'a, 'input>, CascadeError> {
    node.children().find(|n| n.has_tag_name(name)).ok_or(CascadeError::Missing(name))
}

fn items<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.has_tag_name("_"))
}

fn text<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn number<T: FromStr>(node: Node, name: &'static str) -> Result<T, CascadeError> {
    let value = text(child(node, name)?);
    value.parse().map_err(|_| CascadeError::InvalidNumber(value.to_string()))
}

fn numbers(node: Node) -> Result<Vec<f64>, CascadeError> {
    text(node).split_whitespace()
        .map(|v| v.parse::<f64>().map_err(|_| CascadeError::InvalidNumber(v.to_string())))
        .collect()
}

fn parse_feature(feature: Node, win_w: u32, win_h: u32) -> Result<HaarFeature, CascadeError> {
    if let Ok(tilted) = child(feature, "tilted") {
        if text(tilted) != "0" {
            return Err(CascadeError::Unsupported("tilted haar features".to_string()));
        }
    }
    let rects = items(child(feature, "rects")?).map(|r| {
        let values = numbers(r)?;
        if values.len() != 5 {
            return Err(CascadeError::Unsupported(format!("feature rect {:?}", text(r))));
        }
        let outside = || CascadeError::Unsupported(format!("feature rect {:?} outside the window", text(r)));
        // anything above the window is rejected before the cast
        let coord = |v: f64, limit: u32| if v >= 0.0 && v <= limit as f64 { Ok(v as u32) } else { Err(outside()) };
        let rect = WeightedRect {
            x: coord(values[0], win_w)?,
            y: coord(values[1], win_h)?,
            width: coord(values[2], win_w)?,
            height: coord(values[3], win_h)?,
            weight: values[4],
        };
        let right = rect.x.checked_add(rect.width).ok_or_else(outside)?;
        let bottom = rect.y.checked_add(rect.height).ok_or_else(outside)?;
        if right > win_w || bottom > win_h {
            return Err(outside());
        }
        Ok(rect)
    }).collect::<Result<Vec<_>, _>>()?;
    if rects.is_empty() {
        return Err(CascadeError::Missing("rects"));
    }
    Ok(HaarFeature { rects })
}

fn parse_stage(stage: Node, feature_count: usize) -> Result<Stage, CascadeError> {
    let threshold: f64 = number(stage, "stageThreshold")?;
    let trees = items(child(stage, "weakClassifiers")?)
        .map(|classifier| parse_tree(classifier, feature_count))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage { threshold, trees })
}

fn parse_tree(classifier: Node, feature_count: usize) -> Result<Tree, CascadeError> {
    let raw = numbers(child(classifier, "internalNodes")?)?;
    let leaves = numbers(child(classifier, "leafValues")?)?;
    if raw.is_empty() || raw.len() % 4 != 0 {
        return Err(CascadeError::Unsupported(format!("{} internal node values", raw.len())));
    }
    let index = |v: f64| {
        if v.fract() == 0.0 && v.abs() <= i32::MAX as f64 {
            Ok(v as i32)
        } else {
            Err(CascadeError::Unsupported(format!("tree index {}", v)))
        }
    };
    let nodes = raw.chunks(4).map(|v| {
        let feature = index(v[2])?;
        if feature < 0 || feature as usize >= feature_count {
            return Err(CascadeError::Unsupported(format!("feature index {} out of range", feature)));
        }
        Ok(TreeNode { left: index(v[0])?, right: index(v[1])?, feature: feature as usize, threshold: v[3] })
    }).collect::<Result<Vec<_>, _>>()?;

    // children must point forward so that evaluation always terminates
    for (position, node) in nodes.iter().enumerate() {
        for next in [node.left, node.right] {
            let valid = if next > 0 {
                (next as usize) > position && (next as usize) < nodes.len()
            } else {
                next.checked_neg().map_or(false, |leaf| (leaf as usize) < leaves.len())
            };
            if !valid {
                return Err(CascadeError::Unsupported(format!("tree link {} out of range", next)));
            }
        }
    }
    Ok(Tree { nodes, leaves })
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width().min(b.width()) + a.height().min(b.height())) as f64 * 0.5;
    let close = |p: i32, q: i32| ((p - q).abs() as f64) <= delta;
    close(a.left(), b.left())
        && close(a.top(), b.top())
        && close(a.left() + a.width() as i32, b.left() + b.width() as i32)
        && close(a.top() + a.height() as i32, b.top() + b.height() as i32)
}

// union-find over the similarity relation, labels numbered in order of first appearance
fn partition(rects: &[Rect], eps: f64) -> (Vec<usize>, usize) {
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let len = rects.len();
    let mut parent: Vec<usize> = (0..len).collect();
    for i in 0..len {
        for j in i + 1..len {
            if similar(&rects[i], &rects[j], eps) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[b] = a;
                }
            }
        }
    }

    let mut root_label = vec![usize::MAX; len];
    let mut labels = vec![0; len];
    let mut count = 0;
    for i in 0..len {
        let root = find(&mut parent, i);
        if root_label[root] == usize::MAX {
            root_label[root] = count;
            count += 1;
        }
        labels[i] = root_label[root];
    }
    (labels, count)
}

/// Merge overlapping detections.
/// Clusters with `min_neighbors` members or fewer are dropped, the others are
/// averaged, and weak clusters sitting inside a stronger one are removed.
/// With `min_neighbors == 0` the input comes back untouched.
pub fn group_rectangles(rects: Vec<Rect>, min_neighbors: usize, eps: f64) -> Vec<Rect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects;
    }

    let (labels, count) = partition(&rects, eps);
    let mut sums = vec![[0i64; 4]; count];
    let mut weights = vec![0usize; count];
    for (rect, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += rect.left() as i64;
        s[1] += rect.top() as i64;
        s[2] += rect.width() as i64;
        s[3] += rect.height() as i64;
        weights[label] += 1;
    }

    let averaged: Vec<(Rect, usize)> = sums.iter().zip(&weights).filter_map(|(s, &n)| {
        let avg = |v: i64| (v as f64 / n as f64).round() as i64;
        let (width, height) = (avg(s[2]), avg(s[3]));
        if n <= min_neighbors || width <= 0 || height <= 0 {
            return None;
        }
        Some((Rect::at(avg(s[0]) as i32, avg(s[1]) as i32).of_size(width as u32, height as u32), n))
    }).collect();

    averaged.iter().enumerate().filter(|(i, (r1, n1))| {
        !averaged.iter().enumerate().any(|(j, (r2, n2))| {
            let dx = (r2.width() as f64 * eps).round() as i32;
            let dy = (r2.height() as f64 * eps).round() as i32;
            *i != j
                && r1.left() >= r2.left() - dx
                && r1.top() >= r2.top() - dy
                && r1.left() + r1.width() as i32 <= r2.left() + r2.width() as i32 + dx
                && r1.top() + r1.height() as i32 <= r2.top() + r2.height() as i32 + dy
                && (*n2 > (*n1).max(3) || *n1 < 3)
        })
    }).map(|(_, (r, _))| *r).collect()
}
