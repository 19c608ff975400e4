// String formatting intentionally uses format! for clarity
#![allow(clippy::format_push_string)]

use addr2line::Context;
use gimli::{EndianRcSlice, RunTimeEndian};
use object::{
    elf, Architecture, Object, ObjectSection, ObjectSymbol, ObjectSymbolTable, RelocationFlags,
    RelocationTarget, SymbolKind,
};
use rustc_demangle::demangle;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Symbolizer for resolving link-time addresses of one object file to source locations
///
/// DWARF is used when present; the ELF symbol tables (`.symtab`, then
/// `.dynsym`) provide function names for objects without debug info.
///
/// Includes a cache to avoid re-resolving the same addresses repeatedly,
/// which matters when every single instruction is symbolized.
pub struct Symbolizer {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
    /// Function symbols sorted by address
    symbols: Vec<SymbolEntry>,
    has_debug_info: bool,
    /// Cache of resolved frames by address
    cache: RefCell<HashMap<u64, ResolvedFrame>>,
}

#[derive(Debug, Clone)]
struct SymbolEntry {
    address: u64,
    size: u64,
    name: String,
}

impl Symbolizer {
    /// Create a symbolizer from a parsed object file
    ///
    /// # Errors
    /// Returns an error if the DWARF sections are malformed
    pub fn from_object(obj_file: &object::File<'_>) -> Result<Self, gimli::Error> {
        // Load DWARF debug info
        let endian =
            if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj_file
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section)?;
        let ctx = Context::from_dwarf(dwarf)?;

        let has_debug_info = obj_file.section_by_name(".debug_info").is_some_and(|s| s.size() > 0);

        Ok(Self {
            ctx,
            symbols: collect_function_symbols(obj_file),
            has_debug_info,
            cache: RefCell::new(HashMap::new()),
        })
    }

    /// Whether the object carries DWARF debug info (source files and lines)
    #[must_use]
    pub fn has_debug_info(&self) -> bool {
        self.has_debug_info
    }

    /// Resolve a link-time address to source location information
    ///
    /// Uses a cache to avoid re-resolving the same address multiple times.
    pub fn resolve(&self, addr: u64) -> ResolvedFrame {
        // Check cache first
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }

        // Cache miss - perform actual resolution
        let mut result = Vec::new();

        if let Ok(mut frame_iter) = self.ctx.find_frames(addr).skip_all_loads() {
            while let Ok(Some(frame)) = frame_iter.next() {
                let function = frame.function.and_then(|f| f.demangle().ok().map(|s| s.to_string()));

                let location = frame.location.map(|loc| SourceLocation {
                    file: loc.file.map(std::string::ToString::to_string),
                    line: loc.line,
                    column: loc.column,
                });

                result.push(InlinedFrame { function, location });
            }
        }

        let resolved = ResolvedFrame {
            addr,
            frames: result,
            symbol: self.symbol_for(addr).map(Self::demangle_symbol),
        };

        // Store in cache
        self.cache.borrow_mut().insert(addr, resolved.clone());

        resolved
    }

    /// Link-time address of a function symbol, matched on its raw or demangled name
    #[must_use]
    pub fn find_symbol(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|s| s.name == name || Self::demangle_symbol(&s.name) == name)
            .map(|s| s.address)
    }

    fn symbol_for(&self, addr: u64) -> Option<&str> {
        let idx = self.symbols.partition_point(|s| s.address <= addr);
        let candidate = &self.symbols[idx.checked_sub(1)?];
        // Zero-sized symbols (hand-written assembly) cover everything up to the next one
        if candidate.size == 0 || addr < candidate.address + candidate.size {
            Some(&candidate.name)
        } else {
            None
        }
    }

    /// Demangle a Rust symbol name
    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        format!("{:#}", demangle(symbol))
    }
}

fn collect_function_symbols(obj_file: &object::File<'_>) -> Vec<SymbolEntry> {
    let mut symbols: Vec<SymbolEntry> = obj_file
        .symbols()
        .chain(obj_file.dynamic_symbols())
        .filter(|s| s.kind() == SymbolKind::Text && s.is_definition() && s.address() != 0)
        .filter_map(|s| {
            let name = s.name().ok()?;
            (!name.is_empty()).then(|| SymbolEntry { address: s.address(), size: s.size(), name: name.to_string() })
        })
        .collect();
    symbols.extend(collect_plt_symbols(obj_file));

    symbols.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| b.size.cmp(&a.size)));
    symbols.dedup_by_key(|s| s.address);
    symbols
}

/// Size of one x86_64 PLT stub
const PLT_ENTRY_SIZE: u64 = 16;

/// Synthesize `name@plt` symbols for the PLT stubs of an x86_64 object.
///
/// Stubs have no symbol table entries. Their order follows the
/// `R_X86_64_JUMP_SLOT` relocations, one stub per relocation.
fn collect_plt_symbols(obj_file: &object::File<'_>) -> Vec<SymbolEntry> {
    if obj_file.architecture() != Architecture::X86_64 {
        return Vec::new();
    }
    let (Some(relocations), Some(dynsym)) = (obj_file.dynamic_relocations(), obj_file.dynamic_symbol_table())
    else {
        return Vec::new();
    };

    // .plt.sec (IBT) holds one stub per slot; a classic .plt starts with the resolver stub
    let (plt, first_slot) = match obj_file.section_by_name(".plt.sec") {
        Some(section) => (section, 0),
        None => match obj_file.section_by_name(".plt") {
            Some(section) => (section, 1),
            None => return Vec::new(),
        },
    };

    relocations
        .filter(|(_, reloc)| {
            matches!(reloc.flags(), RelocationFlags::Elf { r_type } if r_type == elf::R_X86_64_JUMP_SLOT)
        })
        .enumerate()
        .filter_map(|(slot, (_, reloc))| {
            let RelocationTarget::Symbol(index) = reloc.target() else {
                return None;
            };
            let symbol = dynsym.symbol_by_index(index).ok()?;
            let name = Symbolizer::demangle_symbol(symbol.name().ok()?);
            Some(SymbolEntry {
                address: plt.address() + (slot as u64 + first_slot) * PLT_ENTRY_SIZE,
                size: PLT_ENTRY_SIZE,
                name: format!("{name}@plt"),
            })
        })
        .collect()
}

/// A resolved stack frame (may contain multiple inlined frames)
#[derive(Debug, Clone)]
pub struct ResolvedFrame {
    pub addr: u64,
    /// DWARF frames, innermost inlined frame first
    pub frames: Vec<InlinedFrame>,
    /// Enclosing symbol table entry, if any
    pub symbol: Option<String>,
}

/// An inlined frame within a resolved frame
#[derive(Debug, Clone)]
pub struct InlinedFrame {
    pub function: Option<String>,
    pub location: Option<SourceLocation>,
}

/// Source code location
#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl ResolvedFrame {
    /// Physical function containing the address.
    ///
    /// That is the outermost DWARF frame (inlined callees are folded into the
    /// function they were inlined into), or the symbol table entry when DWARF
    /// names nothing.
    #[must_use]
    pub fn function(&self) -> Option<&str> {
        self.frames
            .iter()
            .rev()
            .find_map(|f| f.function.as_deref())
            .or(self.symbol.as_deref())
    }

    /// Innermost source file and line
    #[must_use]
    pub fn source_line(&self) -> Option<(&str, u32)> {
        self.frames.iter().find_map(|f| {
            let loc = f.location.as_ref()?;
            Some((loc.file.as_deref()?, loc.line.unwrap_or(0)))
        })
    }

    /// Format the frame for display
    #[must_use]
    pub fn format(&self, frame_num: usize) -> String {
        let mut output = format!("#{frame_num:<2} 0x{:016x} {}", self.addr, self.function().unwrap_or("<unknown>"));

        if let Some((file, line)) = self.source_line() {
            output.push_str(&format!("\n                      at {file}:{line}"));
        }

        output
    }
}
