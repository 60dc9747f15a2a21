use std::path::PathBuf;

use crate::cascade::DetectParams;

pub const DEFAULT_INPUT_DIR: &str = "./images/";
pub const DEFAULT_OUTPUT_DIR: &str = "./results/";
pub const DEFAULT_CASCADE_FILE: &str = "./haarcascade_russian_plate_number.xml";

/// Where a batch run reads from and writes to, and how plates are localized
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub cascade_path: PathBuf,
    pub detect: DetectParams,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input_dir: PathBuf::from(DEFAULT_INPUT_DIR),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            cascade_path: PathBuf::from(DEFAULT_CASCADE_FILE),
            detect: DetectParams::default(),
        }
    }
}


#[cfg(test)]
mod test {

    use std::path::Path;

    use super::Config;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.input_dir, Path::new("./images/"));
        assert_eq!(config.output_dir, Path::new("./results/"));
        assert_eq!(config.cascade_path, Path::new("./haarcascade_russian_plate_number.xml"));
        assert_eq!(config.detect.scale_factor, 1.2);
        assert_eq!(config.detect.min_neighbors, 5);
    }

}
