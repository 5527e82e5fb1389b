//! Image math: CRC32, chunk counts, delta lists, version extraction.

use crc::Crc;

/// CRC-32/ISO-HDLC — the IEEE 802.3 polynomial, matching the device's
/// `crc32_ieee` and every zlib-compatible implementation.
const CRC32_IEEE: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

pub fn crc32_ieee(data: &[u8]) -> u32 {
    CRC32_IEEE.checksum(data)
}

/// Number of chunks an image of `size` bytes needs at `chunk_size`.
pub fn chunk_count(size: usize, chunk_size: usize) -> usize {
    size.div_ceil(chunk_size)
}

/// Compare firmware to baseline chunk-by-chunk and return the sorted
/// absolute indices of chunks that differ. Where the baseline is shorter,
/// it is treated as 0xFF-padded (erased flash), so appended regions only
/// count as changed where they carry real data.
pub fn compute_delta_chunks(baseline: &[u8], firmware: &[u8], chunk_size: usize) -> Vec<u16> {
    let mut changed = Vec::new();
    for i in 0..chunk_count(firmware.len(), chunk_size) {
        let offset = i * chunk_size;
        let new_chunk = &firmware[offset..(offset + chunk_size).min(firmware.len())];
        let old_chunk = if offset < baseline.len() {
            &baseline[offset..(offset + chunk_size).min(baseline.len())]
        } else {
            &[]
        };

        // compare the overlap directly; past the baseline's end the chunk
        // only differs where it carries non-0xFF bytes
        let overlap = old_chunk.len().min(new_chunk.len());
        let differs = new_chunk[..overlap] != old_chunk[..overlap]
            || new_chunk[overlap..].iter().any(|&b| b != 0xFF);

        if differs {
            changed.push(i as u16);
        }
    }
    changed
}

/// Extract the build version from keys like `firmware/app-v3.bin` → 3.
/// Unversioned keys are build 0 (dev).
pub fn version_from_key(key: &str) -> u32 {
    let Some((_, tail)) = key.rsplit_once("-v") else {
        return 0;
    };
    tail.split('.')
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
