//! Marker functions the debugger puts breakpoints on. Each trace dispatch
//! ends in exactly one of them, after the state has been updated.
//!
//! The bodies differ so that identical-code folding cannot give two markers
//! the same address.

use std::hint::black_box;

#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn ubeacon_trace_call() {
    black_box(0u8);
}

#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn ubeacon_trace_line() {
    black_box(1u8);
}

#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn ubeacon_trace_ret() {
    black_box(2u8);
}

#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn ubeacon_trace_exception() {
    black_box(3u8);
}

#[repr(C)]
pub struct HookTable {
    pub call: extern "C" fn(),
    pub line: extern "C" fn(),
    pub ret: extern "C" fn(),
    pub exception: extern "C" fn(),
}

/// Lets the debugger resolve all four markers from one symbol.
#[unsafe(no_mangle)]
#[used]
pub static UBEACON_HOOKS: HookTable = HookTable {
    call: ubeacon_trace_call,
    line: ubeacon_trace_line,
    ret: ubeacon_trace_ret,
    exception: ubeacon_trace_exception,
};
