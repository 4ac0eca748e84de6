//! Loadable library that does not export a plugin factory

#[unsafe(no_mangle)]
pub extern "C" fn portico_test_answer() -> u32 {
    42
}
