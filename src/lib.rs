#![doc = r#"
little32: a virtual 32-bit RISC-style machine.

This crate exposes a multi-pass assembler and an instruction
decoder/executor driven over a memory-mapped device bus.

Modules:
- isa: instruction word layout, opcode/condition tables, barrel rotate
- core: register file, flags, fetch-decode-execute loop, interrupt entry
- membus: the device bus (OR-reduction reads, fan-out writes, ticking)
- devices: RAM, ROM, null, computer-info, character display, keyboard
- asm: the four-pass assembler (tokenize, parse, macro-expand, encode)
- config: a minimal machine description (`serde` + `toml`) the CLI wires
  into a running `Machine`

"#]

pub mod asm;
pub mod config;
pub mod core;
pub mod devices;
pub mod isa;
pub mod membus;

pub use core::{Core, Machine};
pub use membus::Bus;
