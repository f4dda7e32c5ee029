//! Device-binary symbol relocation
//!
//! A cubin is an ELF image containing GPU code. The vendor identifies a
//! kernel inside a cubin by *function index* (the ordinal of its symbol in
//! the symbol table) and reports instruction addresses as offsets from the
//! function entry. To attribute those to a load module we need the absolute
//! file offset of every function entry: `st_value + sh_offset` of the
//! symbol's defining section.
//!
//! Failure modes are deliberately silent. A cubin with no symbol table, an
//! unreadable header or a zero section-entry size produces an empty vector;
//! downstream lookups then resolve to the null ip and the affected
//! activities are counted but not attributed.

use object::elf;
use object::read::elf::{FileHeader, SectionHeader, Sym};
use object::read::SymbolIndex;
use object::Endianness;

/// ELF machine number NVIDIA assigns to device binaries
const EM_CUDA: u16 = 190;

type CubinElf = elf::FileHeader64<Endianness>;

/// Dense function-index → absolute-pc vector for one cubin.
///
/// Entries for symbols that are undefined, non-function, or unparseable are
/// zero. Shared immutably after construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolVector {
    symbols: Vec<u64>,
}

impl SymbolVector {
    /// Fixture constructor: a vector with the given entries.
    #[cfg(test)]
    pub(crate) fn for_tests(symbols: Vec<u64>) -> Self {
        SymbolVector { symbols }
    }

    /// Absolute pc of the function with the given index, or 0 when unknown.
    ///
    /// The vendor validates function indices before reporting them, so an
    /// out-of-range index means the cubin parse failed and the lookup
    /// degrades to the null pc.
    pub fn pc(&self, function_index: u32) -> u64 {
        self.symbols
            .get(function_index as usize)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Compute the function-entry offsets of every `STT_FUNC` symbol in an
/// in-memory cubin.
///
/// Extended section numbering (`SHN_XINDEX` with a `SHT_SYMTAB_SHNDX`
/// section) is resolved while reading the symbol's section; ordinary
/// cubins never need it but fat multi-section images do.
pub fn compute_function_offsets(data: &[u8]) -> SymbolVector {
    match parse_symbols(data) {
        Some(symbols) => SymbolVector { symbols },
        None => SymbolVector::default(),
    }
}

fn parse_symbols(data: &[u8]) -> Option<Vec<u64>> {
    let header = CubinElf::parse(data).ok()?;
    let endian = header.endian().ok()?;
    if header.e_machine(endian) != EM_CUDA {
        tracing::debug!(
            machine = header.e_machine(endian),
            "not a device binary, skipping symbol relocation"
        );
        return None;
    }

    let sections = header.sections(endian, data).ok()?;
    // SymbolTable resolves the extended-index section internally; a missing
    // .symtab yields an empty table
    let symtab = sections.symbols(endian, data, elf::SHT_SYMTAB).ok()?;
    if symtab.is_empty() {
        return None;
    }

    let mut symbols = vec![0u64; symtab.len()];
    for (i, sym) in symtab.iter().enumerate() {
        if sym.st_shndx(endian) == elf::SHN_UNDEF {
            continue;
        }
        if sym.st_type() != elf::STT_FUNC {
            continue;
        }
        // applies extended numbering when st_shndx == SHN_XINDEX
        let section_index = match symtab.symbol_section(endian, sym, SymbolIndex(i)) {
            Ok(Some(index)) => index,
            _ => continue,
        };
        let Ok(section) = sections.section(section_index) else {
            continue;
        };
        symbols[i] = sym.st_value(endian).wrapping_add(section.sh_offset(endian));
    }

    tracing::trace!(count = symbols.len(), "relocated cubin symbols");
    Some(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EHDR_SIZE: usize = 64;
    const SHDR_SIZE: usize = 64;
    const SYM_SIZE: usize = 24;

    struct TestSym {
        value: u64,
        info: u8,
        shndx: u16,
    }

    fn func(value: u64, shndx: u16) -> TestSym {
        TestSym {
            value,
            info: elf::STT_FUNC,
            shndx,
        }
    }

    /// Hand-assemble a minimal ELF64 cubin: null section, one .text-like
    /// progbits section at `text_offset`, a symtab, and a strtab.
    fn build_cubin(machine: u16, text_offset: u64, syms: &[TestSym]) -> Vec<u8> {
        let symtab_offset = 0x400usize;
        let symtab_size = SYM_SIZE * (syms.len() + 1); // null symbol first
        let shoff = symtab_offset + symtab_size;
        let mut image = vec![0u8; shoff + SHDR_SIZE * 4];

        // e_ident
        image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // ELFDATA2LSB
        image[6] = 1; // EV_CURRENT
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // e_type = EXEC
        image[18..20].copy_from_slice(&machine.to_le_bytes());
        image[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
        image[40..48].copy_from_slice(&(shoff as u64).to_le_bytes()); // e_shoff
        image[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
        image[58..60].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes()); // e_shentsize
        image[60..62].copy_from_slice(&4u16.to_le_bytes()); // e_shnum
        image[62..64].copy_from_slice(&3u16.to_le_bytes()); // e_shstrndx

        // symbols: index 0 is the null symbol
        for (i, sym) in syms.iter().enumerate() {
            let base = symtab_offset + SYM_SIZE * (i + 1);
            image[base + 4] = sym.info;
            image[base + 6..base + 8].copy_from_slice(&sym.shndx.to_le_bytes());
            image[base + 8..base + 16].copy_from_slice(&sym.value.to_le_bytes());
        }

        let mut shdr = |index: usize,
                        sh_type: u32,
                        offset: u64,
                        size: u64,
                        link: u32,
                        entsize: u64| {
            let base = shoff + SHDR_SIZE * index;
            image[base + 4..base + 8].copy_from_slice(&sh_type.to_le_bytes());
            image[base + 24..base + 32].copy_from_slice(&offset.to_le_bytes());
            image[base + 32..base + 40].copy_from_slice(&size.to_le_bytes());
            image[base + 40..base + 44].copy_from_slice(&link.to_le_bytes());
            image[base + 56..base + 64].copy_from_slice(&entsize.to_le_bytes());
        };

        shdr(0, elf::SHT_NULL, 0, 0, 0, 0);
        shdr(1, elf::SHT_PROGBITS, text_offset, 0x100, 0, 0);
        shdr(
            2,
            elf::SHT_SYMTAB,
            symtab_offset as u64,
            symtab_size as u64,
            3,
            SYM_SIZE as u64,
        );
        shdr(3, elf::SHT_STRTAB, 0, 0, 0, 0);

        image
    }

    #[test]
    fn test_two_symbol_cubin() {
        // functions at st_value 0x100 and 0x400 inside a section at file
        // offset 0; absolute pcs equal the symbol values
        let image = build_cubin(EM_CUDA, 0, &[func(0x100, 1), func(0x400, 1)]);
        let vector = compute_function_offsets(&image);
        assert_eq!(vector.len(), 3); // null symbol + 2 functions
        assert_eq!(vector.pc(1), 0x100);
        assert_eq!(vector.pc(2), 0x400);
    }

    #[test]
    fn test_section_offset_is_added() {
        let image = build_cubin(EM_CUDA, 0x1000, &[func(0x40, 1)]);
        let vector = compute_function_offsets(&image);
        assert_eq!(vector.pc(1), 0x1040);
    }

    #[test]
    fn test_undef_symbol_is_zero() {
        let image = build_cubin(EM_CUDA, 0, &[func(0x100, elf::SHN_UNDEF)]);
        let vector = compute_function_offsets(&image);
        assert_eq!(vector.pc(1), 0);
    }

    #[test]
    fn test_non_function_symbol_is_zero() {
        let image = build_cubin(
            EM_CUDA,
            0,
            &[TestSym {
                value: 0x100,
                info: elf::STT_OBJECT,
                shndx: 1,
            }],
        );
        let vector = compute_function_offsets(&image);
        assert_eq!(vector.pc(1), 0);
    }

    #[test]
    fn test_non_cuda_machine_yields_empty() {
        let image = build_cubin(elf::EM_X86_64, 0, &[func(0x100, 1)]);
        let vector = compute_function_offsets(&image);
        assert!(vector.is_empty());
    }

    #[test]
    fn test_garbage_yields_empty() {
        assert!(compute_function_offsets(&[0u8; 16]).is_empty());
        assert!(compute_function_offsets(b"not an elf at all").is_empty());
    }

    #[test]
    fn test_out_of_range_index_is_zero() {
        let image = build_cubin(EM_CUDA, 0, &[func(0x100, 1)]);
        let vector = compute_function_offsets(&image);
        assert_eq!(vector.pc(999), 0);
    }
}
