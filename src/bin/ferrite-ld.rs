//! The linker driver.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ferrite_coff::CoffObject;
use ferrite_ld::archive;
use ferrite_ld::link::final_link;
use ferrite_ld::options::{DefaultCallbacks, DiscardMode, LinkCallbacks, LinkOptions, StripMode};
use ferrite_ld::plan::build_plan;
use ferrite_ld::LinkContext;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ferrite-ld", about = "Link object files and archives")]
struct Args {
    /// Objects and archives, in link order.
    inputs: Vec<PathBuf>,

    /// Output file.
    #[arg(short, default_value = "a.out")]
    output: PathBuf,

    /// Generate relocatable output.
    #[arg(short = 'r', long)]
    relocatable: bool,

    /// Strip all symbols.
    #[arg(short = 's')]
    strip_all: bool,

    /// Strip debugging symbols.
    #[arg(short = 'S')]
    strip_debug: bool,

    /// Discard all local symbols.
    #[arg(short = 'x')]
    discard_all: bool,

    /// Discard compiler-generated local symbols.
    #[arg(short = 'X')]
    discard_locals: bool,

    /// Entry-point symbol.
    #[arg(short = 'e', long)]
    entry: Option<String>,

    /// Base address of the first output section.
    #[arg(long, value_parser = parse_address, default_value = "0")]
    image_base: u64,

    /// Keep input symbol tables in memory (faster for archives reused
    /// many times).
    #[arg(long)]
    keep_memory: bool,

    /// Match historic tools byte-for-byte: no string hashing, no stab
    /// merging.
    #[arg(long)]
    traditional_format: bool,
}

fn parse_address(s: &str) -> Result<u64, String> {
    let r = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    r.map_err(|e| format!("bad address `{s}`: {e}"))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.inputs.is_empty() {
        bail!("no input files");
    }

    let options = LinkOptions {
        relocatable: args.relocatable,
        strip: if args.strip_all {
            StripMode::All
        } else if args.strip_debug {
            StripMode::Debugger
        } else {
            StripMode::None
        },
        discard: if args.discard_all {
            DiscardMode::All
        } else if args.discard_locals {
            DiscardMode::LPrefix
        } else {
            DiscardMode::None
        },
        entry: args.entry.clone(),
        image_base: args.image_base,
        keep_memory: args.keep_memory,
        traditional_format: args.traditional_format,
        ..Default::default()
    };

    let mut ctx = LinkContext::new(options);
    let mut callbacks = DefaultCallbacks::new();

    for path in &args.inputs {
        let data = std::fs::read(path)
            .with_context(|| format!("can't open `{}` for reading", path.display()))?;
        let name = path.display().to_string();
        if archive::is_archive(&data) {
            let members = archive::parse_archive(&name, &data)?;
            archive::scan_archive(&mut ctx, &mut callbacks, &name, &members)?;
        } else {
            let object = CoffObject::parse(&name, &data)
                .map_err(|source| ferrite_ld::LinkError::Input { path: name, source })?;
            ctx.add_object(&mut callbacks, object);
        }
    }

    if let Some(entry) = ctx.options.entry.clone() {
        let missing = ctx
            .hash
            .lookup(&entry)
            .map(|i| ctx.hash.entries[i].is_undefined())
            .unwrap_or(true);
        if missing && !ctx.options.relocatable {
            callbacks.undefined_symbol(&entry, "entry point");
        }
    }

    let plan = build_plan(&mut ctx);
    let image = final_link(&mut ctx, &plan, &mut callbacks)?;

    std::fs::write(&args.output, image)
        .with_context(|| format!("writing `{}`", args.output.display()))?;
    Ok(())
}
