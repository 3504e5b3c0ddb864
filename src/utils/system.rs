// src/utils/system.rs: System functions

use anyhow::{anyhow, Result};
use log::{debug, warn};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::config::defs::RunConfig;

const GIB: u64 = 1_073_741_824;


/// Number of physical cores, falling back to logical cores, then 1.
pub fn detect_cores() -> usize {
    System::physical_core_count()
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1)
}


/// Finds the amount of total and available RAM
///
/// # Returns
///
/// Result<u64, u64> total ram, available ram in bytes
pub fn detect_ram() -> Result<(u64, u64)> {
    let refresh_kind = RefreshKind::nothing().with_memory(MemoryRefreshKind::everything());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_memory_specifics(MemoryRefreshKind::everything());
    let total_ram = system.total_memory();
    let available_ram = system.available_memory();

    if total_ram == 0 {
        return Err(anyhow!("Failed to detect valid RAM values"));
    }
    Ok((total_ram, available_ram))
}


/// Compares the requested CPU and memory against the host. The flags are passed straight
/// through to the tools, so an oversized request only warns.
///
/// # Returns
///
/// Warning messages, also logged.
pub fn check_resources(config: &RunConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    let cores = detect_cores();
    debug!("Detected {} cores", cores);
    if config.args.cpu > cores {
        warnings.push(format!(
            "--cpu {} exceeds the {} cores detected on this host",
            config.args.cpu, cores
        ));
    }

    match detect_ram() {
        Ok((total_ram, available_ram)) => {
            debug!("Total RAM: {} bytes (~{} GiB)", total_ram, total_ram / GIB);
            debug!("Available RAM: {} bytes (~{} GiB)", available_ram, available_ram / GIB);
            if config.args.gb_alloc.saturating_mul(GIB) > total_ram {
                warnings.push(format!(
                    "--gb-alloc {} exceeds total RAM (~{} GiB); Picard may fail to start",
                    config.args.gb_alloc,
                    total_ram / GIB
                ));
            }
        }
        Err(e) => warnings.push(format!("Could not detect RAM: {}", e)),
    }

    for w in &warnings {
        warn!("{}", w);
    }
    warnings
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use crate::cli::Arguments;

    fn config_with(cpu: usize, gb_alloc: u64) -> RunConfig {
        RunConfig {
            work_dir: PathBuf::from("/"),
            tmp_dir: PathBuf::from("/"),
            fq1: PathBuf::from("/r1.fq"),
            fq2: PathBuf::from("/r2.fq"),
            reference: PathBuf::from("/ref.fa"),
            known_sites: vec![],
            inputs_gzipped: true,
            tool_dir: None,
            picard_mem_gb: gb_alloc.saturating_sub(2),
            args: Arguments { cpu, gb_alloc, ..Default::default() },
        }
    }

    #[test]
    fn test_detect_cores_positive() {
        assert!(detect_cores() >= 1);
    }

    #[test]
    fn test_check_resources_flags_oversized_request() {
        let warnings = check_resources(&config_with(1_000_000, 1_000_000));
        assert!(warnings.iter().any(|w| w.contains("--cpu")));
    }

    #[test]
    fn test_check_resources_huge_memory_request_warns() {
        let warnings = check_resources(&config_with(1, 20_000_000_000));
        assert!(warnings
            .iter()
            .any(|w| w.contains("--gb-alloc 20000000000") || w.starts_with("Could not detect RAM")));
    }

    #[test]
    fn test_check_resources_small_request_is_quiet() {
        let warnings = check_resources(&config_with(1, 3));
        assert!(!warnings.iter().any(|w| w.contains("--cpu")));
    }
}
