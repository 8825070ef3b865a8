use core_affinity::{CoreId, get_core_ids, set_for_current};

/// Pin the calling thread to `core_id`. Used by dedicated spin threads.
pub fn try_pin_core(core_id: usize) -> anyhow::Result<usize> {
    let available = get_core_ids().unwrap_or_default();
    if !available.iter().any(|c| c.id == core_id) {
        anyhow::bail!(
            "core {core_id} is not available ({} cores reported)",
            available.len()
        );
    }
    if !set_for_current(CoreId { id: core_id }) {
        anyhow::bail!("failed to pin current thread to core {core_id}");
    }
    Ok(core_id)
}
