//! Goblin-based executable sniffing, used to pick a decoder mode.

use std::fs;
use std::path::Path;

use goblin::mach::{constants::cputype, Mach};
use goblin::{elf, pe, Object};
use log::debug;

use crate::Architecture;

/// Detect the architecture of an ELF, PE or Mach-O image.
pub fn detect_architecture(data: &[u8]) -> Architecture {
    match Object::parse(data) {
        Ok(Object::Elf(elf)) => match elf.header.e_machine {
            elf::header::EM_386 => Architecture::X86_32,
            elf::header::EM_X86_64 => Architecture::X86_64,
            _ => Architecture::Unknown,
        },
        Ok(Object::PE(pe)) => match pe.header.coff_header.machine {
            pe::header::COFF_MACHINE_X86 => Architecture::X86_32,
            pe::header::COFF_MACHINE_X86_64 => Architecture::X86_64,
            _ => Architecture::Unknown,
        },
        Ok(Object::Mach(Mach::Binary(macho))) => match macho.header.cputype {
            cputype::CPU_TYPE_I386 => Architecture::X86_32,
            cputype::CPU_TYPE_X86_64 => Architecture::X86_64,
            _ => Architecture::Unknown,
        },
        Ok(_) => Architecture::Unknown,
        Err(e) => {
            debug!("Not a recognized executable: {e}");
            Architecture::Unknown
        }
    }
}

/// Detect the architecture of the executable at `path`.
///
/// Unreadable or unrecognized files give [`Architecture::Unknown`].
pub fn architecture_of(path: &Path) -> Architecture {
    match fs::read(path) {
        Ok(data) => detect_architecture(&data),
        Err(e) => {
            debug!("Cannot read {} for architecture detection: {e}", path.display());
            Architecture::Unknown
        }
    }
}
