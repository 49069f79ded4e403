use clap::Parser;
use quill_gist::error::{GistError, GistResult};
use quill_gist::index::gist::inspect::{
    pretty_format_page_headers, pretty_format_page_items, pretty_format_tree,
};
use quill_gist::storage::disk_manager::DiskManager;
use quill_gist::storage::page::{BlockNumber, BLCKSZ};
use std::path::PathBuf;

#[derive(Debug, Parser, PartialEq)]
#[clap(author, version, about = "Dump the pages of a GiST index file", long_about = None)]
struct Args {
    #[clap(help = "Path to the index relation file (<name>.gist)")]
    file: PathBuf,
    #[clap(short, long, help = "Only show this block")]
    block: Option<BlockNumber>,
    #[clap(long, help = "Also list the line pointers of each page")]
    items: bool,
    #[clap(long, help = "Walk the tree from the root, one table per level")]
    tree: bool,
}

fn read_block(disk: &DiskManager, block: BlockNumber) -> GistResult<Vec<u8>> {
    let mut data = vec![0u8; BLCKSZ];
    disk.read_block(block, &mut data)?;
    Ok(data)
}

fn run(args: Args) -> GistResult<()> {
    if !args.file.exists() {
        return Err(GistError::Storage(format!(
            "index file {:?} does not exist",
            args.file
        )));
    }
    let disk = DiskManager::try_new(&args.file)?;
    if args.tree {
        print!("{}", pretty_format_tree(|block| read_block(&disk, block))?);
        return Ok(());
    }

    let blocks: Vec<BlockNumber> = match args.block {
        Some(block) => vec![block],
        None => (0..disk.num_blocks()).collect(),
    };
    let mut pages = Vec::with_capacity(blocks.len());
    for block in blocks {
        pages.push((block, read_block(&disk, block)?));
    }
    println!("{}", pretty_format_page_headers(&pages));
    if args.items {
        for (block, data) in &pages {
            match pretty_format_page_items(*block, data) {
                Ok(table) => println!("block {}:\n{}", block, table),
                Err(e) => println!("block {}: {}", block, e),
            }
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("gist_inspect: {}", e);
        std::process::exit(1);
    }
}
