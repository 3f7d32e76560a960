use std::fs;

use clap::{Parser, ValueEnum};
use mbr_nostd::{MasterBootRecord, PartitionTable};
use pretty_hex::pretty_hex;
use sdcard::{sim::SimCard, Config, Generation, BLOCK_SIZE, SD};
use size::Size;

#[derive(ValueEnum, Copy, Clone, Debug)]
enum Kind {
    /// Version 1.x standard capacity card
    Legacy,
    Sdsc,
    Sdhc,
    Sdxc,
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Disk image backing the simulated card
    #[clap(short, long, value_parser)]
    image: String,

    /// Card generation to simulate
    #[clap(short, long, value_enum, default_value = "sdhc")]
    generation: Kind,

    /// Stay on a 1-bit data bus
    #[clap(long)]
    narrow: bool,

    /// Hex dump sectors starting from this one
    #[clap(short, long, value_parser)]
    dump: Option<u32>,

    /// Number of sectors to dump
    #[clap(short, long, value_parser, default_value_t = 1)]
    count: usize,
}

fn run() -> Result<(), String> {
    let args = Args::parse();
    let image = fs::read(&args.image).map_err(|e| format!("{}: {}", args.image, e))?;
    let sectors = (image.len() / BLOCK_SIZE) as u64;
    let mut card = match args.generation {
        Kind::Legacy => SimCard::new(Generation::SDSC, sectors).legacy(),
        Kind::Sdsc => SimCard::new(Generation::SDSC, sectors),
        Kind::Sdhc => SimCard::new(Generation::SDHC, sectors),
        Kind::Sdxc => SimCard::new(Generation::SDXC, sectors),
    };
    card.load(0, &image);

    let mut sd = SD::new(card, Config::default().wide_bus(!args.narrow));
    sd.init().map_err(|e| format!("{:?}", e))?;
    sd.reset().map_err(|e| format!("{:?}", e))?;
    let info = *sd.card_info().ok_or("No card info")?;
    println!("Card: {:?}", info);
    println!("Size {}", Size::from_bytes(info.capacity()));

    let mut buffer = [0u8; BLOCK_SIZE];
    sd.read(0, std::slice::from_mut(&mut buffer).iter_mut()).map_err(|e| format!("{:?}", e))?;
    match MasterBootRecord::from_bytes(&buffer) {
        Ok(mbr) => {
            for partition in mbr.partition_table_entries().iter() {
                println!("{:?}", partition);
            }
        }
        Err(e) => println!("No MBR: {:?}", e),
    }

    if let Some(sector) = args.dump {
        let mut buffers = vec![[0u8; BLOCK_SIZE]; args.count];
        sd.read(sector, buffers.iter_mut()).map_err(|e| format!("{:?}", e))?;
        for (i, block) in buffers.iter().enumerate() {
            println!("Sector {}", sector as usize + i);
            println!("{}", pretty_hex(block));
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    if let Err(e) = run() {
        println!("{}", e);
    }
}
