use callstep::symbolization::{CfiTable, Symbolizer};

fn load_binary() -> Vec<u8> {
    let binary_path = env!("CARGO_BIN_EXE_callstep");
    println!("Testing symbolization on: {}", binary_path);
    std::fs::read(binary_path).expect("Failed to read binary")
}

#[test]
fn test_symbolizer_creation() {
    let data = load_binary();
    let obj = object::File::parse(&*data).expect("Failed to parse binary");

    let symbolizer = Symbolizer::from_object(&obj);
    assert!(symbolizer.is_ok(), "Failed to create symbolizer: {:?}", symbolizer.err());

    println!("✅ Symbolizer created successfully");
}

#[test]
fn test_symbolizer_resolves_entry_point() {
    let data = load_binary();
    let obj = object::File::parse(&*data).unwrap();
    let symbolizer = Symbolizer::from_object(&obj).unwrap();

    let main = symbolizer.find_symbol("main").expect("binary has a main symbol");
    let resolved = symbolizer.resolve(main);
    println!("{}", resolved.format(0));

    assert_eq!(resolved.addr, main);
    assert!(resolved.function().is_some(), "main should resolve to a function name");
}

#[test]
fn test_symbolizer_resolves_rust_function() {
    let data = load_binary();
    let obj = object::File::parse(&*data).unwrap();
    let symbolizer = Symbolizer::from_object(&obj).unwrap();

    let addr = symbolizer
        .find_symbol("callstep::main")
        .expect("demangled lookup should find callstep::main");
    let resolved = symbolizer.resolve(addr);
    println!("{}", resolved.format(0));

    let function = resolved.function().unwrap();
    assert!(function.contains("callstep::main"), "got {function}");

    // Repeated lookups are served from the cache with identical results
    let again = symbolizer.resolve(addr);
    assert_eq!(again.function(), resolved.function());
}

#[test]
fn test_binary_has_unwind_info() {
    let data = load_binary();
    let obj = object::File::parse(&*data).unwrap();
    let symbolizer = Symbolizer::from_object(&obj).unwrap();
    let cfi = CfiTable::from_object(&obj).expect("binary should have .eh_frame");

    let addr = symbolizer.find_symbol("callstep::main").unwrap();
    assert!(cfi.frame_rule(addr).is_some(), "callstep::main should have an FDE");

    println!("✅ Unwind rule found for callstep::main");
}

#[test]
#[ignore] // Only run if you want to verify full debug info is available
fn test_dwarf_debug_info_available() {
    // It's ignored by default because it depends on build configuration
    let data = load_binary();
    let obj = object::File::parse(&*data).unwrap();
    let symbolizer = Symbolizer::from_object(&obj).unwrap();
    assert!(symbolizer.has_debug_info());

    let addr = symbolizer.find_symbol("callstep::main").unwrap();
    let resolved = symbolizer.resolve(addr);
    let (file, line) = resolved.source_line().expect("No source location found - DWARF debug info not available");

    println!("✅ Found debug info: {} at {}:{}", resolved.function().unwrap_or("?"), file, line);
    assert!(file.ends_with("main.rs"));
    assert!(line > 0);
}
