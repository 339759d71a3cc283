use std::fs::File;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;

use vhd_aio::format::{self, CreateOpts};

#[derive(Parser)]
#[command(name = "vhd-aio")]
#[command(about = "VHD image lifecycle tool for the vhd-aio backend", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new image
    Create {
        /// Path of the image to create
        path: PathBuf,

        /// Virtual size in bytes (ignored with --backing)
        #[arg(short, long, default_value_t = 0)]
        size: u64,

        /// Create a sparse (dynamic) image
        #[arg(short = 'S', long)]
        sparse: bool,

        /// Parent image; creates a differencing child
        #[arg(short, long)]
        backing: Option<PathBuf>,
    },
    /// Create a differencing child of an existing image
    Snapshot {
        /// Parent image
        parent: PathBuf,

        /// Path of the child to create
        child: PathBuf,
    },
    /// Print footer/header summary and the recorded parent
    Info {
        path: PathBuf,

        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Verify that a child's recorded parent matches an image
    ValidateParent {
        child: PathBuf,
        parent: PathBuf,
    },
}

#[derive(Serialize)]
struct ImageInfo {
    path: String,
    disk_type: vhd_aio::VhdType,
    current_size: u64,
    original_size: u64,
    uuid: String,
    timestamp: u32,
    block_size: Option<u32>,
    bat_entries: Option<u32>,
    allocated_blocks: Option<u32>,
    parent: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Create { path, size, sparse, backing } => {
            format::create(&path, size, &CreateOpts { sparse, backing })?;
            println!("Created {}", path.display());
        }
        Commands::Snapshot { parent, child } => {
            format::snapshot(&parent, &child)?;
            println!("Created snapshot {} of {}", child.display(), parent.display());
        }
        Commands::Info { path, json } => {
            let info = image_info(&path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print_info(&info);
            }
        }
        Commands::ValidateParent { child, parent } => {
            format::validate_parent(&child, &parent)?;
            println!("{} is a valid parent of {}", parent.display(), child.display());
        }
    }

    Ok(())
}

fn image_info(path: &PathBuf) -> anyhow::Result<ImageInfo> {
    let file = File::open(path)?;
    let footer = format::read_footer(&file)?;

    let mut info = ImageInfo {
        path: path.display().to_string(),
        disk_type: footer.disk_type,
        current_size: footer.current_size,
        original_size: footer.original_size,
        uuid: footer.uuid.to_string(),
        timestamp: footer.timestamp,
        block_size: None,
        bat_entries: None,
        allocated_blocks: None,
        parent: None,
    };

    if footer.disk_type.is_sparse() {
        let header = format::read_header(&file, footer.data_offset)?;
        info.block_size = Some(header.block_size);
        info.bat_entries = Some(header.max_bat_size);

        use std::os::unix::fs::FileExt;
        let mut bat = vec![0u8; header.max_bat_size as usize * 4];
        file.read_exact_at(&mut bat, header.table_offset)?;
        let allocated = bat
            .chunks_exact(4)
            .filter(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]) != format::DD_BLK_UNUSED)
            .count();
        info.allocated_blocks = Some(allocated as u32);

        if footer.disk_type == vhd_aio::VhdType::Diff {
            info.parent = format::read_parent_path(&file, &header)?;
        }
    }

    Ok(info)
}

fn print_info(info: &ImageInfo) {
    println!("Image:      {}", info.path);
    println!("Type:       {:?}", info.disk_type);
    println!("Size:       {} bytes", info.current_size);
    println!("UUID:       {}", info.uuid);
    if let Some(bs) = info.block_size {
        println!("Block size: {} bytes", bs);
    }
    if let (Some(total), Some(used)) = (info.bat_entries, info.allocated_blocks) {
        println!("Blocks:     {used} allocated of {total}");
    }
    if let Some(parent) = &info.parent {
        println!("Parent:     {parent}");
    }
}
