use image::{ GrayImage, Luma, RgbImage };
use imageproc::drawing::draw_antialiased_line_segment_mut;
use imageproc::pixelops::interpolate;
use imageproc::point::Point;
use imageproc::rect::Rect;

use crate::image_process::Contour;

/// Draw a closed polygon with a 2px anti-aliased stroke
pub fn draw_polygon_mut(image: &mut RgbImage, polygon: &[Point<i32>], color: image::Rgb<u8>) {
    if polygon.len() < 2 {
        return;
    }
    for (a, b) in polygon.iter().zip(polygon.iter().cycle().skip(1)) {
        // second stroke one pixel across the segment
        let (ox, oy) = if (b.x - a.x).abs() >= (b.y - a.y).abs() { (0, 1) } else { (1, 0) };
        for (dx, dy) in [(0, 0), (ox, oy)] {
            draw_antialiased_line_segment_mut(image, (a.x + dx, a.y + dy), (b.x + dx, b.y + dy), color, interpolate);
        }
    }
}

/// Gray levels with the BT.601 weights `0.299 R + 0.587 G + 0.114 B`, rounded.
/// Cascade thresholds are trained on this conversion.
pub fn grayscale_bt601(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let luma = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
        Luma([luma.round().min(u8::MAX as f64) as u8])
    })
}

/// Move a contour from region coordinates to image coordinates
pub fn translate(contour: &[Point<i32>], dx: i32, dy: i32) -> Contour {
    contour.iter().map(|p| Point::new(p.x + dx, p.y + dy)).collect()
}

/// The part of `rect` inside a `width` x `height` image, `None` if they don't overlap
pub fn clamp_rect(rect: &Rect, width: u32, height: u32) -> Option<Rect> {
    let left = rect.left().max(0);
    let top = rect.top().max(0);
    let right = (rect.left() as i64 + rect.width() as i64).min(width as i64);
    let bottom = (rect.top() as i64 + rect.height() as i64).min(height as i64);
    if right <= left as i64 || bottom <= top as i64 {
        return None;
    }
    Some(Rect::at(left, top).of_size((right - left as i64) as u32, (bottom - top as i64) as u32))
}


#[cfg(test)]
mod test {

    use image::{ Rgb, RgbImage };
    use imageproc::point::Point;
    use imageproc::rect::Rect;

    use super::{ clamp_rect, draw_polygon_mut, grayscale_bt601, translate };

    #[test]
    fn clamps_to_image() {
        let r = Rect::at(-5, 10).of_size(20, 100);
        assert_eq!(clamp_rect(&r, 50, 40), Some(Rect::at(0, 10).of_size(15, 30)));
        let inside = Rect::at(1, 2).of_size(3, 4);
        assert_eq!(clamp_rect(&inside, 50, 40), Some(inside));
        assert_eq!(clamp_rect(&Rect::at(60, 0).of_size(5, 5), 50, 40), None);
    }

    #[test]
    fn gray_uses_bt601_weights() {
        let img: RgbImage = RgbImage::from_fn(5, 1, |x, _| match x {
            0 => Rgb([0, 0, 255]),
            1 => Rgb([255, 0, 0]),
            2 => Rgb([0, 255, 0]),
            3 => Rgb([255, 255, 255]),
            _ => Rgb([40, 40, 200]),
        });
        let gray = grayscale_bt601(&img);
        let levels: Vec<u8> = gray.pixels().map(|p| p.0[0]).collect();
        assert_eq!(levels, vec![29, 76, 150, 255, 58]);
    }

    #[test]
    fn translates_points() {
        let contour = vec![Point::new(0, 0), Point::new(3, 4)];
        assert_eq!(translate(&contour, 10, 20), vec![Point::new(10, 20), Point::new(13, 24)]);
    }

    #[test]
    fn polygon_stroke_is_two_pixels() {
        let red = Rgb([255, 0, 0]);
        let mut img = RgbImage::new(30, 30);
        let square = vec![Point::new(5, 5), Point::new(20, 5), Point::new(20, 20), Point::new(5, 20)];
        draw_polygon_mut(&mut img, &square, red);
        assert_eq!(*img.get_pixel(12, 5), red);
        assert_eq!(*img.get_pixel(12, 6), red);
        assert_eq!(*img.get_pixel(20, 12), red);
        assert_eq!(*img.get_pixel(21, 12), red);
        assert_eq!(*img.get_pixel(12, 12), Rgb([0, 0, 0]));
    }

    #[test]
    fn stroke_near_border_is_clipped() {
        let mut img = RgbImage::new(10, 10);
        let edge = vec![Point::new(0, 9), Point::new(9, 9), Point::new(9, 0), Point::new(0, 0)];
        draw_polygon_mut(&mut img, &edge, Rgb([255, 0, 0]));
        assert_eq!(*img.get_pixel(5, 9), Rgb([255, 0, 0]));
    }

}
