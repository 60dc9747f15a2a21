use clap::Parser;

use std::error::Error;
use std::path::PathBuf;

use lpr_contour::{ batch, Lpr };
use lpr_contour::config::{ Config, DEFAULT_CASCADE_FILE, DEFAULT_INPUT_DIR, DEFAULT_OUTPUT_DIR };


/// Outline the license plates of every image in a directory
#[derive(Parser, Debug)]
#[command(name = "lpr-contour", version, author = "kingrong")]
struct Args {
    /// directory with the images to annotate
    #[arg(long, default_value = DEFAULT_INPUT_DIR)]
    input: PathBuf,
    /// directory receiving the annotated images
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    output: PathBuf,
    /// cascade classifier used to find plate regions
    #[arg(long, default_value = DEFAULT_CASCADE_FILE)]
    cascade: PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = Config {
        input_dir: args.input,
        output_dir: args.output,
        cascade_path: args.cascade,
        ..Config::default()
    };
    let lpr = Lpr::from_config(&config);
    batch::run(&lpr, &config)?;

    Ok(())
}
