//! `boot86`: load a boot image at 0x7C00 and step it until it halts, leaves
//! the image, or hits something the emulator cannot decode.
//!
//! The image file doubles as the ATA drive behind ports 0x1F0-0x1F7, which
//! is how an xv6-style boot block pulls the rest of its kernel in. Serial
//! output (COM1) goes to stdout, serial input comes from stdin.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use boot86_machine::{Machine, MachineConfig, RunExit, StepExit, IMAGE_BASE};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "boot86", about = "i386 subset emulator for xv6-class boot images")]
struct Args {
    /// Binary image to load at linear 0x7C00 (also served as the ATA disk).
    #[arg(short = 'f', long = "image")]
    image: PathBuf,

    /// Suppress the per-step register dump.
    #[arg(long)]
    silent: bool,

    /// Start with protection enabled and 32-bit decoding committed.
    #[arg(long)]
    protected: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("boot86: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<u8> {
    let image = fs::read(&args.image)
        .with_context(|| format!("reading image {}", args.image.display()))?;
    let disk = fs::File::open(&args.image)
        .with_context(|| format!("opening disk image {}", args.image.display()))?;

    let config = MachineConfig {
        protected: args.protected,
        ..MachineConfig::default()
    };
    let mut machine = Machine::new(
        config,
        &image,
        Box::new(disk),
        Box::new(io::stdin()),
        Box::new(io::stdout()),
    );

    let exit = drive(&mut machine, args.silent);
    if !args.silent {
        dump(&machine);
    }
    match exit {
        Ok(reason) => {
            eprintln!(
                "boot86: {} after {} instructions",
                match reason {
                    RunExit::Halted => "halted",
                    RunExit::Stopped => "left the image",
                },
                machine.retired()
            );
            Ok(0)
        }
        Err(err) => {
            eprintln!("boot86: {err:#}");
            Ok(1)
        }
    }
}

fn drive(machine: &mut Machine, silent: bool) -> Result<RunExit> {
    loop {
        if !silent {
            dump(machine);
        }
        if machine.step()? == StepExit::Halted {
            return Ok(RunExit::Halted);
        }
        let eip = machine.cpu().eip;
        if eip == 0 || eip == IMAGE_BASE {
            return Ok(RunExit::Stopped);
        }
    }
}

fn dump(machine: &Machine) {
    let s = machine.snapshot();
    println!(
        "eip={:08x} eax={:08x} ecx={:08x} edx={:08x} ebx={:08x} \
         esp={:08x} ebp={:08x} esi={:08x} edi={:08x}",
        s.eip, s.gpr[0], s.gpr[1], s.gpr[2], s.gpr[3], s.gpr[4], s.gpr[5], s.gpr[6], s.gpr[7]
    );
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn flags_parse_like_the_reference_driver() {
        let args = Args::try_parse_from(["boot86", "-f", "guest.bin", "--silent"]).unwrap();
        assert_eq!(args.image, PathBuf::from("guest.bin"));
        assert!(args.silent);
        assert!(!args.protected);
    }

    #[test]
    fn image_flag_is_required() {
        assert!(Args::try_parse_from(["boot86", "--silent"]).is_err());
    }

    #[test]
    fn halting_image_exits_cleanly() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // xor edx, edx; hlt
        file.write_all(&[0x31, 0xD2, 0xF4]).unwrap();

        let code = run(Args {
            image: file.path().to_path_buf(),
            silent: true,
            protected: true,
        })
        .unwrap();

        assert_eq!(code, 0);
    }

    #[test]
    fn undecodable_image_exits_with_failure() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xD7]).unwrap(); // xlat: not modelled

        let code = run(Args {
            image: file.path().to_path_buf(),
            silent: true,
            protected: true,
        })
        .unwrap();

        assert_eq!(code, 1);
    }
}
