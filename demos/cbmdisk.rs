#![warn(missing_docs)]
#![warn(unsafe_code)]
//! List a Commodore disk image and optionally extract one file
//! Usage: cargo run --example cbmdisk -- --input FILENAME
//!
use std::path::{Path, PathBuf};
use std::process::exit;

use clap::Parser;
use config::Config;
use log::{error, info};

use cbmfs::disk_format::image::{D81Image, FileRecord};
use cbmfs::DiskImage;

/// Command line arguments for the disk lister
#[derive(Parser, Debug)]
#[clap(about, version, author)]
struct Args {
    /// Image file to open
    #[clap(short, long)]
    input: PathBuf,
    /// Name of a file on the image to extract.
    /// On a D81 this may be a /-separated path into partitions.
    #[clap(short, long)]
    extract: Option<String>,
    /// Host file to write the extracted data to
    #[clap(short, long)]
    output: Option<PathBuf>,
}

/// List an image and extract a file from it
fn main() {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logger
    if let Err(e) = env_logger::try_init() {
        panic!("couldn't initialize logger: {:?}", e);
    }

    let settings = match load_settings("config/cbmfs") {
        Ok(settings) => {
            info!("merged in config");
            settings
        }
        Err(e) => {
            info!("no config loaded, using defaults: {:?}", e);
            Config::default()
        }
    };
    if settings.get_bool("debug").unwrap_or(false) {
        info!("debug diagnostics enabled");
    }

    cbmfs::init();

    let image = match cbmfs::load_auto(&args.input) {
        Err(e) => {
            error!("{}", e);
            exit(i32::from(e.status()));
        }
        Ok(image) => image,
    };
    println!("{}", image);

    match &image {
        DiskImage::D64(d64) => {
            for record in d64.list() {
                println!("{}", record);
            }
            println!("{}", d64.info().format_footer());
        }
        DiskImage::D71(d71) => {
            for record in d71.list() {
                println!("{}", record);
            }
            println!("{}", d71.info().format_footer());
        }
        DiskImage::D81(d81) => {
            if let Err(e) = list_d81_tree(d81, d81.list().into_iter().cloned().collect(), 0) {
                error!("{}", e);
                exit(i32::from(e.status()));
            }
            println!("{}", d81.info().format_footer());
        }
    }

    if let Some(inner) = &args.extract {
        if let Err(e) = extract(&image, inner, args.output.as_deref()) {
            error!("{}", e);
            exit(i32::from(e.status()));
        }
    }

    exit(0);
}

/// Print a D81 directory tree, descending into partitions.
fn list_d81_tree(
    image: &D81Image,
    records: Vec<FileRecord>,
    depth: usize,
) -> Result<(), cbmfs::Error> {
    for record in records {
        println!("{}{}", "  ".repeat(depth), record);
        if record.is_partition() {
            let dir_start = image.partition_directory(&record)?;
            let inside = image.dir(dir_start)?;
            list_d81_tree(image, inside, depth + 1)?;
        }
    }
    Ok(())
}

/// Extract one file from the image to the host file system (stdout
/// byte count only when no output path is given).
fn extract(image: &DiskImage, inner: &str, output: Option<&Path>) -> Result<(), cbmfs::Error> {
    let data = match image {
        DiskImage::D64(d64) => {
            let record = d64.lookup(inner)?;
            d64.read_range(record, 0, record.size)?
        }
        DiskImage::D71(d71) => {
            let record = d71.lookup(inner)?;
            d71.read_range(record, 0, record.size)?
        }
        DiskImage::D81(d81) => {
            let mut segments: Vec<&str> = inner.split('/').filter(|s| !s.is_empty()).collect();
            let name = segments.pop().ok_or_else(|| {
                cbmfs::Error::new(cbmfs::ErrorKind::BadRequest(String::from("empty path")))
            })?;

            let mut records: Vec<FileRecord> = d81.list().into_iter().cloned().collect();
            for segment in &segments {
                let key = segment.to_ascii_uppercase();
                let part = records
                    .iter()
                    .find(|r| r.is_partition() && r.name == key)
                    .ok_or_else(|| {
                        cbmfs::Error::new(cbmfs::ErrorKind::NotFound(format!(
                            "no such directory: {}",
                            key
                        )))
                    })?;
                let dir_start = d81.partition_directory(part)?;
                records = d81.dir(dir_start)?;
            }

            let key = name.to_ascii_uppercase();
            let record = records.iter().find(|r| r.name == key).ok_or_else(|| {
                cbmfs::Error::new(cbmfs::ErrorKind::NotFound(format!("no such file: {}", key)))
            })?;
            d81.read_range(record, 0, record.size)?
        }
    };

    match output {
        Some(path) => {
            cbmfs::file::atomic_write(path, &data)?;
            println!("Wrote {} bytes to {}", data.len(), path.display());
        }
        None => {
            println!("{}: {} bytes", inner, data.len());
        }
    }
    Ok(())
}

/// load settings from a config file
/// returns the config settings as a Config on success, or a ConfigError on failure
fn load_settings(config_name: &str) -> Result<Config, config::ConfigError> {
    Config::builder()
        // Add in config file
        .add_source(config::File::with_name(config_name))
        // Add in settings from the environment (with a prefix of CBMFS)
        // E.g. `CBMFS_DEBUG=1 cargo run --example cbmdisk` sets `debug`
        .add_source(config::Environment::with_prefix("CBMFS"))
        .build()
}
