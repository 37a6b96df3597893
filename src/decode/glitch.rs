//! Glitch filter: fold sub-symbol spurious intervals forward

/// Intervals shorter than this are analog noise, not symbols. The
/// shortest legitimate interval is one FSK tone period (~256 ticks).
pub const GLITCH_TICKS: u32 = 200;

/// Fold every sub-threshold interval into its successor and zero it in
/// place, so total elapsed time is preserved for classification. Zero
/// entries are skipped by the symbol classifiers. Idempotent: folded
/// entries become zero and zeros are left alone.
pub fn clean(ticks: &mut [u32]) {
    for i in 0..ticks.len() {
        let t = ticks[i];
        if t == 0 || t >= GLITCH_TICKS {
            continue;
        }
        if i + 1 < ticks.len() {
            ticks[i + 1] = ticks[i + 1].saturating_add(t);
        }
        ticks[i] = 0;
    }
}
