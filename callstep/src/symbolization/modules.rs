//! Loaded object files of the traced process
//!
//! Every executable mapping belongs to an object file (the main executable or
//! a shared library). A [`LoadedModule`] bundles what is needed to turn a
//! runtime address inside it into a [`FrameSnapshot`] and to unwind past it.
//! Modules are loaded lazily, the first time an instruction inside them is seen.

use log::{debug, warn};
use object::{Object, ObjectSegment};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::rc::Rc;

use super::cfi::CfiTable;
use super::memory_maps::{load_bias, read_memory_maps, Mapping};
use super::symbolizer::Symbolizer;
use crate::domain::{Address, FunctionName, LineNumber, ObjectFileId, Pid, SourceFileId, TargetError};
use crate::model::FrameSnapshot;

const PAGE_MASK: u64 = !0xfff;

/// One object file mapped into the traced process
pub struct LoadedModule {
    path: ObjectFileId,
    /// `runtime address - link-time address`
    bias: u64,
    symbolizer: Symbolizer,
    cfi: Option<CfiTable>,
}

impl LoadedModule {
    /// Read and parse the object at `path`, relocated according to `mappings`
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not an object file
    pub fn load(path: &str, mappings: &[Mapping]) -> Result<Self, TargetError> {
        let failed = |reason: String| TargetError::SymbolizationFailed { path: path.to_string(), reason };

        let data = fs::read(path).map_err(|e| failed(e.to_string()))?;
        let obj = object::File::parse(&*data).map_err(|e| failed(e.to_string()))?;

        let min_segment = obj.segments().map(|s| s.address()).min().unwrap_or(0) & PAGE_MASK;
        let bias = load_bias(mappings, path, min_segment)
            .ok_or_else(|| failed("object is not mapped".to_string()))?;

        let symbolizer = Symbolizer::from_object(&obj).map_err(|e| failed(e.to_string()))?;
        let cfi = CfiTable::from_object(&obj);

        if !symbolizer.has_debug_info() {
            warn!("{path}: no DWARF debug info, source locations unavailable");
        }
        if cfi.is_none() {
            warn!("{path}: no .eh_frame, call stacks will stop here");
        }
        debug!("Loaded {path} with bias 0x{bias:x}");

        Ok(Self { path: ObjectFileId::new(path), bias, symbolizer, cfi })
    }

    #[must_use]
    pub fn path(&self) -> &ObjectFileId {
        &self.path
    }

    /// Translate a runtime address to the object's link-time address space
    #[must_use]
    pub fn to_link_time(&self, runtime: u64) -> u64 {
        runtime.wrapping_sub(self.bias)
    }

    /// Translate a link-time address to where it is loaded in the process
    #[must_use]
    pub fn to_runtime(&self, link_time: u64) -> u64 {
        link_time.wrapping_add(self.bias)
    }

    #[must_use]
    pub fn symbolizer(&self) -> &Symbolizer {
        &self.symbolizer
    }

    #[must_use]
    pub fn cfi(&self) -> Option<&CfiTable> {
        self.cfi.as_ref()
    }

    /// Symbolize a frame.
    ///
    /// `reported` is the runtime address recorded for the frame (the pc, or the
    /// return address for callers) and `lookup` the runtime address whose
    /// function and line describe it (the call instruction for callers).
    /// Returns `None` if no function contains `lookup`.
    #[must_use]
    pub fn snapshot(&self, reported: u64, lookup: u64) -> Option<FrameSnapshot> {
        let resolved = self.symbolizer.resolve(self.to_link_time(lookup));
        let function = resolved.function().filter(|name| !name.is_empty())?;
        let (file, line) = match resolved.source_line() {
            Some((file, line)) => (SourceFileId::new(file), LineNumber(line)),
            None => (SourceFileId::unknown(), LineNumber(0)),
        };

        Some(FrameSnapshot {
            address: Address(self.to_link_time(reported)),
            line,
            function: FunctionName::new(function),
            object_file: self.path.clone(),
            source_file: file,
        })
    }
}

/// Lazily loaded modules of one process, indexed by executable mapping
pub struct ModuleMap {
    pid: Pid,
    mappings: Vec<Mapping>,
    /// `None` caches a failed load so it is reported once
    modules: HashMap<String, Option<Rc<LoadedModule>>>,
    /// Pages still unmapped after the last refresh
    missed_pages: HashSet<u64>,
}

impl ModuleMap {
    /// Snapshot the current mappings of `pid`
    ///
    /// # Errors
    /// Returns an error if /proc/pid/maps cannot be read
    pub fn new(pid: Pid) -> Result<Self, TargetError> {
        Ok(Self { pid, mappings: read_memory_maps(pid)?, modules: HashMap::new(), missed_pages: HashSet::new() })
    }

    /// Module containing the runtime address `addr`, if any.
    ///
    /// An address outside all known executable mappings triggers one re-read of
    /// /proc/pid/maps per page, so objects loaded with `dlopen` are picked up.
    pub fn lookup(&mut self, addr: u64) -> Option<Rc<LoadedModule>> {
        let path = match self.executable_mapping(addr) {
            Some(mapping) => mapping.path.clone(),
            None => {
                let page = addr & PAGE_MASK;
                if self.missed_pages.contains(&page) {
                    return None;
                }
                self.refresh();
                let Some(mapping) = self.executable_mapping(addr) else {
                    self.missed_pages.insert(page);
                    return None;
                };
                mapping.path.clone()
            }
        };

        if let Some(cached) = self.modules.get(&path) {
            return cached.clone();
        }

        let loaded = match LoadedModule::load(&path, &self.mappings) {
            Ok(module) => Some(Rc::new(module)),
            Err(e) => {
                warn!("{e}");
                None
            }
        };
        self.modules.insert(path, loaded.clone());
        loaded
    }

    /// The main executable of the process (`/proc/<pid>/exe`)
    pub fn executable(&mut self) -> Option<Rc<LoadedModule>> {
        let exe = fs::read_link(format!("/proc/{}/exe", self.pid.0)).ok()?;
        self.by_path(&exe.to_string_lossy())
    }

    /// Runtime address of the function symbol `name`.
    ///
    /// The main executable is searched first, then the other objects in the
    /// order they are mapped.
    pub fn find_symbol(&mut self, name: &str) -> Option<u64> {
        if let Some(exe) = self.executable() {
            if let Some(addr) = exe.symbolizer().find_symbol(name) {
                return Some(exe.to_runtime(addr));
            }
        }

        let mut paths: Vec<String> =
            self.mappings.iter().filter(|m| m.executable).map(|m| m.path.clone()).collect();
        paths.dedup();
        paths.into_iter().find_map(|path| {
            let module = self.by_path(&path)?;
            module.symbolizer().find_symbol(name).map(|addr| module.to_runtime(addr))
        })
    }

    fn by_path(&mut self, path: &str) -> Option<Rc<LoadedModule>> {
        let start = self.mappings.iter().find(|m| m.path == path && m.executable)?.range.start;
        self.lookup(start)
    }

    fn executable_mapping(&self, addr: u64) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.executable && m.range.contains(addr))
    }

    fn refresh(&mut self) {
        match read_memory_maps(self.pid) {
            Ok(mappings) => {
                debug!("Refreshed memory maps of {}: {} mappings", self.pid, mappings.len());
                self.mappings = mappings;
                self.missed_pages.clear();
            }
            Err(e) => warn!("{e}"),
        }
    }
}
