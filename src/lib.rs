use image::{ DynamicImage, RgbImage, Rgb, imageops };
use imageproc::rect::Rect;
use log::{ debug, info, warn };

use std::path::Path;

use cascade::{ CascadeClassifier, DetectParams };
use config::Config;
use image_process::Contour;

pub mod batch;
pub mod cascade;
pub mod config;
pub mod error;
pub mod image_process;
pub mod utils;


/// Outline color of a detected plate
pub const PLATE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// One plate outline, in the coordinate space of the full image
#[derive(Debug, Clone, PartialEq)]
pub struct Plate {
    pub roi: Rect,
    pub contour: Contour,
}

/// An annotated copy of an input image together with what was drawn on it
#[derive(Debug, Clone)]
pub struct Annotated {
    pub image: RgbImage,
    pub plates: Vec<Plate>,
}

pub struct Lpr {
    detection: LpDetect,
}

impl Lpr {

    pub fn new(detection: LpDetect) -> Self {
        Lpr { detection }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(LpDetect::new(&config.cascade_path, config.detect))
    }

    pub fn detection(&self) -> &LpDetect {
        &self.detection
    }

    /// Recognize one image.
    /// Returns `None` when no region of interest was found at all, otherwise a
    /// copy of the image with every plate outline drawn on it.
    pub fn recognize(&self, img: &DynamicImage) -> Option<Annotated> {
        let source = img.to_rgb8();
        let rois = self.detection.detect_roi(&source);
        if rois.is_empty() {
            return None;
        }

        let plates = self.plates_in_regions(&source, &rois);
        let mut image = source.clone();
        for plate in &plates {
            utils::draw_polygon_mut(&mut image, &plate.contour, PLATE_COLOR);
        }
        Some(Annotated { image, plates })
    }

    /// Detect the plates of an image without drawing anything
    pub fn plates(&self, img: &RgbImage) -> Vec<Plate> {
        let rois = self.detection.detect_roi(img);
        self.plates_in_regions(img, &rois)
    }

    /// Extract one plate contour per region, skipping regions without a usable boundary
    pub fn plates_in_regions(&self, img: &RgbImage, rois: &[Rect]) -> Vec<Plate> {
        let (width, height) = img.dimensions();
        rois.iter().filter_map(|roi| {
            let roi = utils::clamp_rect(roi, width, height)?;
            let plate = imageops::crop_imm(img, roi.left() as u32, roi.top() as u32, roi.width(), roi.height()).to_image();
            let contour = image_process::detect_contour(&plate);
            if contour.is_empty() {
                debug!("no plate boundary in {:?}", roi);
                return None;
            }
            let contour = utils::translate(&contour, roi.left(), roi.top());
            Some(Plate { roi, contour })
        }).collect()
    }

}

/// Coarse plate localization.
/// Without a cascade classifier every image is a single region of interest.
pub struct LpDetect {
    classifier: Option<CascadeClassifier>,
}

impl LpDetect {

    /// Load the cascade once, falling back to whole-image regions if it can't be used
    pub fn new(cascade_file: impl AsRef<Path>, params: DetectParams) -> Self {
        let cascade_file = cascade_file.as_ref();
        match CascadeClassifier::load(cascade_file).and_then(|c| c.with_params(params)) {
            Ok(classifier) => {
                info!("loaded cascade classifier {:?}", cascade_file);
                Self::with_classifier(classifier)
            }
            Err(e) => {
                warn!("cascade classifier {:?} unavailable ({}), using whole images as regions", cascade_file, e);
                Self::whole_image()
            }
        }
    }

    pub fn with_classifier(classifier: CascadeClassifier) -> Self {
        LpDetect { classifier: Some(classifier) }
    }

    pub fn whole_image() -> Self {
        LpDetect { classifier: None }
    }

    pub fn is_available(&self) -> bool {
        self.classifier.is_some()
    }

    /// Regions of interest with one license plate each, all inside the image.
    /// A zero-sized image has none.
    pub fn detect_roi(&self, img: &RgbImage) -> Vec<Rect> {
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Vec::new();
        }
        match &self.classifier {
            None => vec![Rect::at(0, 0).of_size(width, height)],
            Some(classifier) => {
                let gray = utils::grayscale_bt601(img);
                classifier.detect_multi_scale(&gray).iter()
                    .filter_map(|r| utils::clamp_rect(r, width, height))
                    .collect()
            }
        }
    }

}


#[cfg(test)]
mod test {

    use image::{ DynamicImage, ImageBuffer, Rgb, RgbImage };
    use imageproc::rect::Rect;

    use std::error::Error;

    use super::{ Lpr, LpDetect, PLATE_COLOR };
    use super::cascade::{ CascadeClassifier, DetectParams };

    const REJECT_ALL: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>4</height>
  <width>8</width>
  <stages>
    <_>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 0.</internalNodes>
          <leafValues>
            -1. -1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 8 4 1.</_></rects></_></features></cascade>
</opencv_storage>
"#;

    fn plate_image() -> RgbImage {
        ImageBuffer::from_fn(120, 80, |x, y| {
            if (30..90).contains(&x) && (20..50).contains(&y) { Rgb([40, 40, 200]) } else { Rgb([128, 128, 128]) }
        })
    }

    #[test]
    fn whole_image_fallback() {
        let detect = LpDetect::new("/nonexistent/cascade.xml", DetectParams::default());
        assert!(!detect.is_available());
        let img = RgbImage::new(33, 17);
        assert_eq!(detect.detect_roi(&img), vec![Rect::at(0, 0).of_size(33, 17)]);
        assert!(detect.detect_roi(&RgbImage::new(0, 0)).is_empty());
    }

    #[test]
    fn cascade_may_find_nothing() -> Result<(), Box<dyn Error>> {
        let detect = LpDetect::with_classifier(CascadeClassifier::from_xml(REJECT_ALL)?);
        assert!(detect.is_available());
        assert!(detect.detect_roi(&plate_image()).is_empty());
        let lpr = Lpr::new(detect);
        assert!(lpr.recognize(&DynamicImage::ImageRgb8(plate_image())).is_none());
        Ok(())
    }

    #[test]
    fn detected_regions_stay_inside_the_image() -> Result<(), Box<dyn Error>> {
        let accept_all = REJECT_ALL.replace("-1. -1.", "1. 1.");
        let classifier = CascadeClassifier::from_xml(&accept_all)?
            .with_params(DetectParams { scale_factor: 1.2, min_neighbors: 0 })?;
        let detect = LpDetect::with_classifier(classifier);
        // odd sizes, where pyramid windows mapped back can overhang by a rounding pixel
        for (width, height) in [(51, 31), (53, 17), (9, 5)] {
            let img: RgbImage = ImageBuffer::from_pixel(width, height, Rgb([90, 90, 90]));
            let rois = detect.detect_roi(&img);
            assert!(!rois.is_empty());
            for r in rois {
                assert!(r.left() >= 0 && r.top() >= 0, "{:?}", r);
                assert!(r.left() + r.width() as i32 <= width as i32, "{:?} in {}x{}", r, width, height);
                assert!(r.top() + r.height() as i32 <= height as i32, "{:?} in {}x{}", r, width, height);
            }
        }
        Ok(())
    }

    #[test]
    fn recognize_draws_on_a_copy() {
        let lpr = Lpr::new(LpDetect::whole_image());
        let img = DynamicImage::ImageRgb8(plate_image());
        let annotated = lpr.recognize(&img).unwrap();
        assert_eq!(annotated.plates.len(), 1);
        assert_eq!(img.to_rgb8(), plate_image());
        assert!(annotated.image.pixels().any(|p| *p == PLATE_COLOR));
        assert_ne!(annotated.image, plate_image());
    }

    #[test]
    fn plate_contours_use_image_coordinates() {
        let lpr = Lpr::new(LpDetect::whole_image());
        let img = plate_image();
        let rois = [Rect::at(20, 10).of_size(90, 60)];
        let plates = lpr.plates_in_regions(&img, &rois);
        assert_eq!(plates.len(), 1);
        for p in &plates[0].contour {
            assert!(p.x >= 20 && p.x < 110 && p.y >= 10 && p.y < 70, "{:?}", p);
            assert!(p.x >= 28 && p.x <= 96 && p.y >= 18 && p.y <= 52, "{:?}", p);
        }
    }

    #[test]
    fn gray_regions_have_no_plates() {
        let lpr = Lpr::new(LpDetect::whole_image());
        let img: RgbImage = ImageBuffer::from_pixel(50, 50, Rgb([128, 128, 128]));
        assert!(lpr.plates(&img).is_empty());
        let annotated = lpr.recognize(&DynamicImage::ImageRgb8(img.clone())).unwrap();
        assert!(annotated.plates.is_empty());
        assert_eq!(annotated.image, img);
    }

}
