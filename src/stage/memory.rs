// src/stage/memory.rs

//! Peak memory readings taken around a work function.

use std::fs;

/// Peak resident set size of this process in bytes.
///
/// Reads the `VmHWM` high-water mark from `/proc/self/status`; returns 0 on
/// platforms where that is not available.
pub fn peak_memory() -> u64 {
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_status_kib(&status, "VmHWM"))
        .map_or(0, |kib| kib * 1024)
}

/// Value of a `Field:   1234 kB` line from a proc status file.
fn parse_status_kib(status: &str, field: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let rest = line.strip_prefix(field)?.strip_prefix(':')?;
        rest.trim().trim_end_matches("kB").trim().parse().ok()
    })
}
