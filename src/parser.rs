//! Goblin-based multi-format binary parser.

use std::fmt;
use std::path::Path;

use goblin::mach::{constants::cputype, Mach, MachO};
use goblin::{elf, pe, Object};

use crate::{Address, Architecture, AuditError, BinaryMetadata, BinaryParser, FunctionSeed, Section};

/// VM_PROT_EXECUTE
const MACHO_PROT_EXECUTE: u32 = 0x4;

/// A parser that handles ELF, PE, and Mach-O via Goblin.
#[derive(Debug, Default)]
pub struct GoblinParser;

impl GoblinParser {
    /// Construct a new GoblinParser.
    pub fn new() -> Self {
        GoblinParser
    }

    /// Parse an ELF image.
    fn parse_elf(&self, elf: elf::Elf) -> Result<BinaryMetadata, AuditError> {
        let arch = match elf.header.e_machine {
            elf::header::EM_386 => Architecture::X86_32,
            elf::header::EM_X86_64 => Architecture::X86_64,
            elf::header::EM_ARM => Architecture::Arm,
            elf::header::EM_AARCH64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };

        let mut sections = Vec::new();
        for sh in &elf.section_headers {
            // .bss and friends have no bytes in the file
            if sh.sh_type == elf::section_header::SHT_NOBITS {
                continue;
            }
            if let Some(name) = elf.shdr_strtab.get_at(sh.sh_name) {
                sections.push(Section::new(
                    name.to_string(),
                    sh.sh_addr,
                    sh.sh_offset as usize,
                    sh.sh_size as usize,
                    sh.is_executable(),
                ));
            }
        }

        let mut symbols = Vec::new();
        let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
        for (syms, strtab) in tables {
            for sym in syms.iter() {
                if sym.st_type() != elf::sym::STT_FUNC || sym.st_value == 0 {
                    continue;
                }
                let name = strtab.get_at(sym.st_name).unwrap_or("");
                symbols.push(FunctionSeed::new(sym.st_value, name));
            }
        }

        Ok(BinaryMetadata {
            architecture: arch,
            entry_point: Some(elf.entry).filter(|&e| e != 0),
            sections,
            symbols,
        })
    }

    /// Parse a PE image. Addresses are rebased on the preferred image base.
    fn parse_pe(&self, pe: pe::PE<'_>) -> Result<BinaryMetadata, AuditError> {
        let arch = match pe.header.coff_header.machine {
            pe::header::COFF_MACHINE_X86 => Architecture::X86_32,
            pe::header::COFF_MACHINE_X86_64 => Architecture::X86_64,
            pe::header::COFF_MACHINE_ARM => Architecture::Arm,
            pe::header::COFF_MACHINE_ARM64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };
        let base = pe.image_base as Address;

        let mut sections = Vec::new();
        for sect in &pe.sections {
            let name = sect.name().unwrap_or("").to_string();
            let executable = (sect.characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE) != 0;
            let size = match sect.virtual_size {
                0 => sect.size_of_raw_data,
                v => v.min(sect.size_of_raw_data),
            };
            sections.push(Section::new(
                name,
                base + sect.virtual_address as Address,
                sect.pointer_to_raw_data as usize,
                size as usize,
                executable,
            ));
        }

        let symbols = pe
            .exports
            .iter()
            .filter(|e| e.rva != 0)
            .map(|e| FunctionSeed::new(base + e.rva as Address, e.name.unwrap_or("")))
            .collect();

        let entry = pe.entry as Address;
        Ok(BinaryMetadata {
            architecture: arch,
            entry_point: (entry != 0).then_some(base + entry),
            sections,
            symbols,
        })
    }

    /// Parse a Mach-O binary, one section per segment.
    fn parse_macho(&self, macho: &MachO) -> Result<BinaryMetadata, AuditError> {
        let arch = match macho.header.cputype {
            cputype::CPU_TYPE_I386 => Architecture::X86_32,
            cputype::CPU_TYPE_X86_64 => Architecture::X86_64,
            cputype::CPU_TYPE_ARM => Architecture::Arm,
            cputype::CPU_TYPE_ARM64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };

        let sections = macho
            .segments
            .iter()
            .map(|segment| {
                Section::new(
                    segment.name().unwrap_or("").to_string(),
                    segment.vmaddr as Address,
                    segment.fileoff as usize,
                    segment.filesize as usize,
                    (segment.initprot & MACHO_PROT_EXECUTE) != 0,
                )
            })
            .collect();

        Ok(BinaryMetadata {
            architecture: arch,
            entry_point: Some(macho.entry).filter(|&e| e != 0),
            sections,
            symbols: Vec::new(),
        })
    }

    /// Parse a Mach-O image.
    fn parse_mach(&self, m: Mach<'_>) -> Result<BinaryMetadata, AuditError> {
        match m {
            Mach::Binary(binary) => self.parse_macho(&binary),
            Mach::Fat(_) => Err(AuditError::ParsingError(
                "fat Mach-O archives are not supported".into(),
            )),
        }
    }
}

impl fmt::Display for GoblinParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GoblinParser")
    }
}

impl BinaryParser for GoblinParser {
    fn parse(&self, data: &[u8]) -> Result<BinaryMetadata, AuditError> {
        match Object::parse(data) {
            Ok(Object::Elf(elf)) => self.parse_elf(elf),
            Ok(Object::PE(pe)) => self.parse_pe(pe),
            Ok(Object::Mach(m)) => self.parse_mach(m),
            Ok(_) => Err(AuditError::ParsingError("Unsupported file format".into())),
            Err(e) => Err(AuditError::ParsingError(e.to_string())),
        }
    }
}

/// Read `path` and parse it. The bytes are returned since sections borrow from them.
pub fn parse_file(path: impl AsRef<Path>) -> Result<(Vec<u8>, BinaryMetadata), AuditError> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;
    log::debug!("read {} bytes from {}", data.len(), path.display());

    let metadata = GoblinParser::new().parse(&data)?;
    Ok((data, metadata))
}
