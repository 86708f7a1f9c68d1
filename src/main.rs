//! `l32`: the presentation-free CLI runner. Assembles a `.s32` source
//! file, wires it to a bus (a `--config` TOML description if given,
//! otherwise a default ROM+RAM+computer-info layout), ticks the core a
//! fixed number of times or until PC stops advancing, and prints
//! register/flag state.
//!
//! Grounded on the teacher's `main.rs` shape (load image, build the
//! executor, run it, print state each iteration) with the window/rendering
//! loop dropped — that shell is out of scope (spec.md Non-goals).

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use little32::asm::{Assembler, Region};
use little32::config::MachineConfig;
use little32::core::{Core, Machine};
use little32::devices::{ComputerInfo, Ram, Rom};
use little32::isa::{self, PC, SP};
use little32::membus::{Bus, DeviceKind, Mapping};

const DEFAULT_ROM_BASE: u32 = 0x0000_0000;
const DEFAULT_ROM_SIZE: u32 = 0x0001_0000;
const DEFAULT_RAM_BASE: u32 = 0x0001_0000;
const DEFAULT_RAM_SIZE: u32 = 0x0001_0000;
const DEFAULT_INFO_BASE: u32 = 0x0002_0000;

struct Args {
    source: PathBuf,
    config: Option<PathBuf>,
    steps: u32,
}

fn parse_args() -> Result<Args, String> {
    let mut raw = std::env::args().skip(1);
    let source = raw.next().ok_or("usage: l32 <source.s32> [--config machine.toml] [--steps N]")?;
    let mut config = None;
    let mut steps = 10_000u32;
    while let Some(flag) = raw.next() {
        match flag.as_str() {
            "--config" => {
                let path = raw.next().ok_or("--config requires a path")?;
                config = Some(PathBuf::from(path));
            }
            "--steps" => {
                let n = raw.next().ok_or("--steps requires a number")?;
                steps = n.parse().map_err(|_| "--steps must be an integer".to_string())?;
            }
            other => return Err(format!("unrecognized argument `{other}`")),
        }
    }
    Ok(Args { source: PathBuf::from(source), config, steps })
}

/// Builds the default machine layout: a ROM bank holding the assembled
/// program, a RAM bank for the stack and scratch data, and a trailing
/// computer-info device enumerating both (spec §6).
fn default_machine(program: Vec<u8>) -> Machine {
    let mut bus = Bus::new();
    bus.register(Mapping::new(DEFAULT_ROM_BASE, DEFAULT_ROM_SIZE), Box::new(Rom::new(program)));
    bus.register(Mapping::new(DEFAULT_RAM_BASE, DEFAULT_RAM_SIZE), Box::new(Ram::new(DEFAULT_RAM_SIZE as usize)));
    let info = ComputerInfo::new(&[
        (DeviceKind::Rom, DEFAULT_ROM_BASE, DEFAULT_ROM_SIZE),
        (DeviceKind::Ram, DEFAULT_RAM_BASE, DEFAULT_RAM_SIZE),
    ]);
    let info_range = info.byte_len() as u32;
    bus.register(Mapping::new(DEFAULT_INFO_BASE, info_range), Box::new(info));

    let core = Core::new(DEFAULT_ROM_BASE, DEFAULT_RAM_BASE + DEFAULT_RAM_SIZE);
    Machine::new(bus, core)
}

fn assemble_program(path: &Path) -> Result<Vec<u8>, String> {
    let source = std::fs::read_to_string(path).map_err(|e| format!("cannot read `{}`: {e}", path.display()))?;
    let mut asm = Assembler::new(Some(Region::new(DEFAULT_ROM_BASE, DEFAULT_ROM_SIZE)), None);
    let mut bus = Bus::new();
    bus.register(Mapping::new(DEFAULT_ROM_BASE, DEFAULT_ROM_SIZE), Box::new(Ram::new(DEFAULT_ROM_SIZE as usize)));
    asm.assemble(&mut bus, path, &source).map_err(|e| e.to_string())?;

    let mut image = vec![0u8; DEFAULT_ROM_SIZE as usize];
    for (i, byte) in image.iter_mut().enumerate() {
        *byte = bus.read_byte(i as u32);
    }
    Ok(image)
}

fn run() -> Result<(), String> {
    env_logger::init();
    let args = parse_args()?;

    let mut machine = if let Some(config_path) = &args.config {
        let cfg = MachineConfig::load(config_path).map_err(|e| e.to_string())?;
        let mut bus = Bus::new();
        cfg.build_bus(&mut bus, DEFAULT_INFO_BASE).map_err(|e| e.to_string())?;
        let core = Core::new(cfg.entry_point, cfg.stack_pointer);
        Machine::new(bus, core)
    } else {
        let program = assemble_program(&args.source)?;
        default_machine(program)
    };

    log::info!("starting at pc={:#010x}", machine.core.pc());
    let mut last_pc = None;
    for step in 0..args.steps {
        machine.tick();
        let pc = machine.core.pc();
        if last_pc == Some(pc) {
            log::info!("pc stopped advancing after {step} step(s); halting");
            break;
        }
        last_pc = Some(pc);
    }

    let snap = machine.snapshot();
    println!("pc  = {:#010x}", snap.regs[PC as usize]);
    println!("sp  = {:#010x}", snap.regs[SP as usize]);
    for (i, name) in isa::REGISTER_NAMES.iter().enumerate().take(13) {
        println!("{name:<3} = {:#010x}", snap.regs[i]);
    }
    println!(
        "flags: n={} z={} c={} v={}",
        snap.flags.n as u8, snap.flags.z as u8, snap.flags.c as u8, snap.flags.v as u8
    );
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("l32: {e}");
            ExitCode::FAILURE
        }
    }
}
