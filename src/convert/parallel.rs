use std::sync::OnceLock;

use rayon::prelude::*;

/// Frames below this pixel count are converted on the calling thread;
/// the pool hand-off costs more than it saves.
const PARALLEL_MIN_PIXELS: usize = 262_144;
const PARALLEL_MAX_WORKERS: usize = 8;

/// Pre-initialize the conversion thread pool so the first capture doesn't
/// pay the pool-creation cost.
pub(crate) fn warmup_pool() {
    install_conversion_pool(|| {});
}

#[inline]
pub(crate) fn conversion_workers() -> usize {
    static WORKERS: OnceLock<usize> = OnceLock::new();
    *WORKERS.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(PARALLEL_MAX_WORKERS)
    })
}

#[inline]
pub(crate) fn should_parallelize(width: usize, height: usize) -> bool {
    conversion_workers() > 1 && height > 1 && width.saturating_mul(height) >= PARALLEL_MIN_PIXELS
}

pub(crate) fn install_conversion_pool<F>(job: F)
where
    F: FnOnce() + Send,
{
    static POOL: OnceLock<Option<rayon::ThreadPool>> = OnceLock::new();
    let pool = POOL.get_or_init(|| {
        let workers = conversion_workers();
        if workers <= 1 {
            return None;
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("tonemap-convert-{idx}"))
            .build()
            .map_err(|err| tracing::warn!("conversion pool unavailable, converting inline: {err}"))
            .ok()
    });
    match pool {
        Some(pool) => pool.install(job),
        None => job(),
    }
}

/// Row geometry for a single conversion pass.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RowLayout {
    /// Byte distance between source rows.
    pub(crate) src_pitch: usize,
    pub(crate) src_row_bytes: usize,
    /// Byte distance between destination rows.
    pub(crate) dst_stride: usize,
    pub(crate) dst_row_bytes: usize,
    pub(crate) height: usize,
}

/// Runs `kernel(src_row, dst_row)` for each row, splitting rows across the
/// conversion pool for large frames.
pub(crate) fn for_each_row<K>(src: &[u8], dst: &mut [u8], layout: RowLayout, kernel: K)
where
    K: Fn(&[u8], &mut [u8]) + Sync,
{
    let RowLayout {
        src_pitch,
        src_row_bytes,
        dst_stride,
        dst_row_bytes,
        height,
    } = layout;
    let convert_row = |y: usize, dst_row: &mut [u8]| {
        let start = y * src_pitch;
        kernel(
            &src[start..start + src_row_bytes],
            &mut dst_row[..dst_row_bytes],
        );
    };

    if !should_parallelize(dst_row_bytes / 4, height) {
        for (y, dst_row) in dst.chunks_mut(dst_stride).take(height).enumerate() {
            convert_row(y, dst_row);
        }
        return;
    }

    install_conversion_pool(|| {
        dst.par_chunks_mut(dst_stride)
            .take(height)
            .enumerate()
            .for_each(|(y, dst_row)| convert_row(y, dst_row));
    });
}
