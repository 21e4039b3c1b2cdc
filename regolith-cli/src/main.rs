//! Load driver for the regolith memory core.
//!
//! Builds a simulated physical memory, populates it from ELF and/or HEX
//! files, resolves the well-known symbols the run loop cares about
//! (`_start`, `tohost`, `_finish`), and optionally drops into a small
//! interactive inspector. Exits with status 1 on any configuration or load
//! failure.

use clap::Parser;
use clap_num::maybe_hex;
use log::{error, info, LevelFilter};
use regolith_core::{Config, Memory};
use std::error::Error;
use std::fs::File;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "regolith", version, about = "Load a RISC-V program into simulated memory", long_about = None)]
struct Args {
    /// ELF file to load into simulator memory.
    target: Option<PathBuf>,

    /// HEX file to load into simulator memory.
    #[arg(short = 'x', long)]
    hex: Option<PathBuf>,

    /// Program entry point, overriding the ELF entry and `_start`.
    #[arg(short, long, value_parser = maybe_hex::<u64>)]
    startpc: Option<u64>,

    /// Stop program counter, overriding the ELF `_finish` symbol.
    #[arg(short, long, value_parser = maybe_hex::<u64>)]
    endpc: Option<u64>,

    /// Memory address whose write ends the simulation, overriding `tohost`.
    #[arg(long, value_parser = maybe_hex::<u64>)]
    tohost: Option<u64>,

    /// Register width of the target (32 or 64).
    #[arg(long, default_value_t = 32)]
    xlen: u32,

    /// Memory size in bytes.
    #[arg(long, default_value_t = 1 << 32, value_parser = maybe_hex::<u64>)]
    memory_size: u64,

    /// Initial register values for the hart, e.g. --setreg x1=4 x2=0xff.
    #[arg(long = "setreg", value_name = "REG=VALUE", num_args = 1..)]
    reg_inits: Vec<String>,

    /// File the instruction trace is written to once a hart runs.
    #[arg(short = 'f', long)]
    logfile: Option<PathBuf>,

    /// Enter the interactive memory inspector after loading.
    #[arg(short, long)]
    interactive: bool,

    /// Be verbose.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = simple_logger::SimpleLogger::new().with_level(level).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    if args.target.is_none() && args.hex.is_none() && !args.interactive {
        return Err("no program file specified".into());
    }

    let mut memory = Memory::new(Config {
        size: args.memory_size,
        ..Config::default()
    })?;
    memory.finish_ccm_config(false);

    let mut start_pc = None;
    let mut stop_pc = None;
    let mut tohost = None;

    if let Some(path) = &args.target {
        info!("loading ELF file {}", path.display());
        let image = memory.load_elf_file(path, args.xlen)?;
        start_pc = Some(image.entry);
        if let Some(symbol) = memory.symbols().find("_start") {
            start_pc = Some(symbol.address);
        }
        stop_pc = ["_finish", "finish_"]
            .iter()
            .find_map(|name| memory.symbols().find(name))
            .map(|symbol| symbol.address);
        tohost = memory.symbols().find("tohost").map(|symbol| symbol.address);
    }

    if let Some(path) = &args.hex {
        info!("loading HEX file {}", path.display());
        memory.load_hex_file(path)?;
    }

    // Command line values override whatever the ELF provided.
    start_pc = args.startpc.or(start_pc);
    stop_pc = args.endpc.or(stop_pc);
    tohost = args.tohost.or(tohost);

    let reg_inits = parse_reg_inits(&args.reg_inits)?;
    if !reg_inits.is_empty() {
        // Kept for the run loop; no hart is attached in the load driver.
        info!("parsed {} register initializer(s)", reg_inits.len());
    }

    if let Some(path) = &args.logfile {
        File::create(path)
            .map_err(|err| format!("failed to open trace file {}: {err}", path.display()))?;
    }

    if let Some(pc) = start_pc {
        info!("start pc {pc:#x}");
    }
    if let Some(pc) = stop_pc {
        info!("stop pc {pc:#x}");
    }
    if let Some(address) = tohost {
        info!("tohost address {address:#x}");
    }
    info!(
        "memory ready: {:#x} bytes, {} symbols",
        memory.size(),
        memory.symbols().len()
    );

    if args.interactive {
        interact(&mut memory, args.xlen)?;
    }
    Ok(())
}

/// Parse `name=value` register initializers. Values accept an optional `0x`
/// prefix.
fn parse_reg_inits(inits: &[String]) -> Result<Vec<(String, u64)>, String> {
    inits
        .iter()
        .map(|init| {
            let (name, value) = init
                .split_once('=')
                .ok_or_else(|| format!("invalid register initialization `{init}`"))?;
            if name.is_empty() {
                return Err(format!("invalid register initialization `{init}`"));
            }
            let value = parse_number(value)
                .ok_or_else(|| format!("invalid register value in `{init}`"))?;
            Ok((name.to_owned(), value))
        })
        .collect()
}

fn parse_number(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

/// Interactive memory inspector: peek/poke memory and load further files.
fn interact(memory: &mut Memory, xlen: u32) -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "regolith> ")?;
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            continue;
        };

        match command {
            "peek" => peek_command(memory, xlen, &tokens),
            "poke" => poke_command(memory, xlen, &tokens),
            "elf" => elf_command(memory, xlen, &tokens),
            "hex" => hex_command(memory, &tokens),
            "symbols" => {
                if let Err(err) = memory.symbols().write_to(&mut stdout) {
                    eprintln!("{err}");
                }
            }
            "help" => {
                println!("help             print this message");
                println!("peek <addr>      print memory at address");
                println!("poke <addr> <v>  set memory at address");
                println!("elf <file>       load an ELF file");
                println!("hex <file>       load a HEX file");
                println!("symbols          list the known ELF symbols");
                println!("quit             exit");
            }
            "quit" | "q" => return Ok(()),
            other => eprintln!("unknown command `{other}`, try help"),
        }
    }
}

fn peek_command(memory: &Memory, xlen: u32, tokens: &[&str]) {
    let Some(address) = tokens.get(1).copied().and_then(parse_number) else {
        eprintln!("expecting: peek <address>");
        return;
    };
    let value = if xlen == 64 {
        memory.read_doubleword(address).map(|value| format!("{value:#018x}"))
    } else {
        memory.read_word(address).map(|value| format!("{value:#010x}"))
    };
    match value {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("{err}"),
    }
}

fn poke_command(memory: &Memory, xlen: u32, tokens: &[&str]) {
    let (Some(address), Some(value)) = (
        tokens.get(1).copied().and_then(parse_number),
        tokens.get(2).copied().and_then(parse_number),
    ) else {
        eprintln!("expecting: poke <address> <value>");
        return;
    };
    let result = if xlen == 64 {
        memory.poke_doubleword(address, value)
    } else {
        memory.poke_word(address, value as u32)
    };
    if let Err(err) = result {
        eprintln!("{err}");
    }
}

fn elf_command(memory: &mut Memory, xlen: u32, tokens: &[&str]) {
    let Some(path) = tokens.get(1) else {
        eprintln!("expecting: elf <file>");
        return;
    };
    match memory.load_elf_file(Path::new(path), xlen) {
        Ok(image) => println!("entry {:#x}, end {:#x}", image.entry, image.end),
        Err(err) => eprintln!("{err}"),
    }
}

fn hex_command(memory: &mut Memory, tokens: &[&str]) {
    let Some(path) = tokens.get(1) else {
        eprintln!("expecting: hex <file>");
        return;
    };
    if let Err(err) = memory.load_hex_file(Path::new(path)) {
        eprintln!("{err}");
    }
}
