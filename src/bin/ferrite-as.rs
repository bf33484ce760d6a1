//! The assembler driver.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ferrite_asm::context::{AsmOptions, Assembler, Endian};
use ferrite_asm::{read, target, write};
use ferrite_coff::CoffWriter;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ferrite-as", about = "Assemble one source file into an object file")]
struct Args {
    /// Source file; `-` reads standard input.
    input: PathBuf,

    /// Output object file.
    #[arg(short, default_value = "a.out")]
    output: PathBuf,

    /// Target CPU backend.
    #[arg(long, default_value = "falcon")]
    target: String,

    /// Generate position-independent addresses.
    #[arg(short = 'K', value_name = "PIC")]
    k_flag: Option<String>,

    /// Select CPU feature flags.
    #[arg(short = 'm', value_name = "CPU")]
    cpu: Vec<String>,

    /// Add a directory to the .include search path.
    #[arg(short = 'I', value_name = "DIR")]
    include: Vec<PathBuf>,

    /// Write the output file even if errors were reported.
    #[arg(short = 'Z')]
    always_emit: bool,

    /// Assemble in MRI compatibility mode.
    #[arg(long)]
    mri: bool,

    /// Suppress warnings.
    #[arg(short = 'W', long = "no-warn")]
    no_warn: bool,

    /// Treat warnings as errors.
    #[arg(long)]
    fatal_warnings: bool,

    /// Define SYM to VALUE before reading input.
    #[arg(long, value_name = "SYM=VALUE")]
    defsym: Vec<String>,

    /// Accepted for compatibility; no effect.
    #[arg(short = 'V', hide = true)]
    version_flag: bool,
    /// Accepted for compatibility; no effect.
    #[arg(long = "Qy", hide = true)]
    qy: bool,
    /// Accepted for compatibility; no effect.
    #[arg(long = "Qn", hide = true)]
    qn: bool,
    /// Accepted for compatibility; no effect.
    #[arg(short = 's', hide = true)]
    s_flag: bool,
}

fn parse_defsym(s: &str) -> Result<(String, i64)> {
    let (name, value) = s
        .split_once('=')
        .with_context(|| format!("bad --defsym `{s}`: expected SYM=VALUE"))?;
    let value = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else {
        value.parse()
    }
    .with_context(|| format!("bad --defsym value `{value}`"))?;
    Ok((name.to_string(), value))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut opts = AsmOptions {
        pic: args.k_flag.as_deref() == Some("PIC"),
        regnames: true,
        mri: args.mri,
        always_emit: args.always_emit,
        include_paths: args.include.clone(),
        ..Default::default()
    };
    for m in &args.cpu {
        match m.as_str() {
            "little" => opts.endian = Some(Endian::Little),
            "big" => opts.endian = Some(Endian::Big),
            "regnames" => opts.regnames = true,
            "no-regnames" => opts.regnames = false,
            "relocatable" => opts.relocatable = true,
            "relocatable-lib" => opts.relocatable_lib = true,
            "emb" => opts.emb = true,
            other => {
                // Unknown -m flags select CPU feature bits.
                log::debug!("cpu flag `{other}' folded into feature mask");
                opts.cpu_flags |= 1;
            }
        }
    }
    for d in &args.defsym {
        opts.defsyms.push(parse_defsym(d)?);
    }

    let Some(target) = target::lookup(&args.target) else {
        bail!("unknown target `{}`", args.target);
    };

    let source = if args.input.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin()).context("reading standard input")?
    } else {
        std::fs::read_to_string(&args.input)
            .with_context(|| format!("can't open `{}` for reading", args.input.display()))?
    };

    let mut asm = Assembler::new(opts);
    asm.diag.no_warn = args.no_warn;
    asm.diag.fatal_warnings = args.fatal_warnings;
    asm.diag.echo = false;
    asm.sources.push_file(args.input.display().to_string(), &source);

    read::read_source(&mut asm, &*target)?;

    let mut writer = CoffWriter::new();
    write::write_object(&mut asm, &*target, &mut writer)?;

    for line in asm.diag.render(&asm.sources.map) {
        eprintln!("{line}");
    }

    if asm.diag.had_errors() && !asm.opts.always_emit {
        std::process::exit(1);
    }
    writer
        .write_to(&args.output)
        .with_context(|| format!("writing `{}`", args.output.display()))?;
    if asm.diag.had_errors() {
        std::process::exit(1);
    }
    Ok(())
}
