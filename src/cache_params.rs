//! Cache-aware blocking parameters for the matmul engine.
//!
//! Detects L1D / L2 / L3 sizes via CPUID (x86) or sysfs (Linux/ARM) and
//! derives the row-chunk granularity used by the work-stealing matmul so a
//! chunk's source-panel working set stays resident in L2.

/// Detected cache sizes and derived matmul blocking.
#[derive(Debug, Clone, Copy)]
pub struct CacheParams {
    pub l1d: usize,
    pub l2: usize,
    pub l3: usize,
    /// Target rows of src0 per work-stealing chunk (dim 0).
    pub chunk_rows0: usize,
    /// Target columns of dst per work-stealing chunk (dim 1).
    pub chunk_rows1: usize,
}

/// Inner tile edge for the blocked matmul loops. A 16x16 output tile reuses
/// every loaded src0 row 16 times before eviction.
pub const MATMUL_TILE: usize = 16;

impl CacheParams {
    pub fn detect() -> Self {
        let (l1d, l2, l3) = detect_cache_sizes();
        // A chunk processes chunk_rows0 rows of src0 against chunk_rows1
        // columns of src1; keep the src0 panel within half of L2 assuming
        // 4-byte elements and rows of ~4K elements as the sizing model.
        let row_bytes_model = 4096 * 4;
        let chunk_rows0 = (l2 / 2 / row_bytes_model).clamp(MATMUL_TILE, 256);
        Self {
            l1d,
            l2,
            l3,
            chunk_rows0: round_up(chunk_rows0, MATMUL_TILE),
            chunk_rows1: 64,
        }
    }
}

fn round_up(v: usize, to: usize) -> usize {
    (v + to - 1) / to * to
}

fn detect_cache_sizes() -> (usize, usize, usize) {
    #[cfg(target_arch = "x86_64")]
    {
        if let Some(sizes) = detect_x86_cache() {
            return sizes;
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Some(sizes) = detect_sysfs_cache() {
            return sizes;
        }
    }
    // Conservative fallback: 32 KB L1D, 512 KB L2, 8 MB L3.
    (32 * 1024, 512 * 1024, 8 * 1024 * 1024)
}

#[cfg(target_arch = "x86_64")]
fn detect_x86_cache() -> Option<(usize, usize, usize)> {
    // CPUID leaf 4: deterministic cache parameters (Intel and AMD Zen+).
    let mut l1d = None;
    let mut l2 = None;
    let mut l3 = None;
    for sub in 0..16u32 {
        let info = unsafe { std::arch::x86_64::__cpuid_count(4, sub) };
        let cache_type = info.eax & 0x1f;
        if cache_type == 0 {
            break;
        }
        let level = (info.eax >> 5) & 0x7;
        let line_size = (info.ebx & 0xfff) as usize + 1;
        let partitions = ((info.ebx >> 12) & 0x3ff) as usize + 1;
        let ways = ((info.ebx >> 22) & 0x3ff) as usize + 1;
        let sets = info.ecx as usize + 1;
        let size = line_size * partitions * ways * sets;
        match (level, cache_type) {
            (1, 1) => l1d = Some(size),
            (2, 2) | (2, 3) => l2 = Some(size),
            (3, 2) | (3, 3) => l3 = Some(size),
            _ => {}
        }
    }
    Some((l1d?, l2?, l3.unwrap_or(0)))
}

#[cfg(target_os = "linux")]
fn detect_sysfs_cache() -> Option<(usize, usize, usize)> {
    fn read_size(path: &str) -> Option<usize> {
        let s = std::fs::read_to_string(path).ok()?;
        let s = s.trim();
        if let Some(kb) = s.strip_suffix('K') {
            kb.parse::<usize>().ok().map(|v| v * 1024)
        } else if let Some(mb) = s.strip_suffix('M') {
            mb.parse::<usize>().ok().map(|v| v * 1024 * 1024)
        } else {
            s.parse::<usize>().ok()
        }
    }
    let base = "/sys/devices/system/cpu/cpu0/cache";
    let mut l1d = None;
    let mut l2 = None;
    let mut l3 = None;
    for idx in 0..8 {
        let level = std::fs::read_to_string(format!("{base}/index{idx}/level")).ok();
        let ctype = std::fs::read_to_string(format!("{base}/index{idx}/type")).ok();
        let (Some(level), Some(ctype)) = (level, ctype) else {
            break;
        };
        let size = read_size(&format!("{base}/index{idx}/size"));
        match (level.trim(), ctype.trim()) {
            ("1", "Data") => l1d = size,
            ("2", "Unified" | "Data") => l2 = size,
            ("3", "Unified" | "Data") => l3 = size,
            _ => {}
        }
    }
    Some((l1d?, l2?, l3.unwrap_or(0)))
}
