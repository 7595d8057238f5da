//! Linear-to-physical address translation for the 4 MiB superpage model.
//!
//! Only PSE (page-size-extension) superpages are modelled: when CR0.PG and
//! CR4.PSE are both set, a linear address is resolved through a single
//! page-directory lookup; otherwise addresses are identity-mapped. 4 KiB
//! two-level paging is deliberately not implemented. Keeping the whole
//! policy behind [`translate`] means finer-grained paging can be added
//! later without touching callers.

/// Paging enable bit of CR0.
pub const CR0_PG: u32 = 1 << 31;
/// Page-size-extension bit of CR4 (4 MiB superpages).
pub const CR4_PSE: u32 = 1 << 4;

/// Byte offset covered by one 4 MiB superpage.
pub const SUPERPAGE_OFFSET_MASK: u32 = 0x3F_FFFF;
/// Shift from a linear address to its page-directory index.
pub const SUPERPAGE_SHIFT: u32 = 22;

/// Snapshot of the control-register state the translator depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingConfig {
    /// CR0.PG and CR4.PSE both set.
    pub enabled: bool,
    /// Raw CR3 value at the time of the snapshot.
    pub cr3: u32,
}

impl PagingConfig {
    /// Derive the active translation policy from CR0/CR3/CR4.
    pub fn from_control(cr0: u32, cr3: u32, cr4: u32) -> Self {
        PagingConfig {
            enabled: (cr0 & CR0_PG) != 0 && (cr4 & CR4_PSE) != 0,
            cr3,
        }
    }

    /// Physical address of the page-directory entry covering `vaddr`.
    #[inline]
    pub fn pde_addr(&self, vaddr: u32) -> u32 {
        (self.cr3 >> SUPERPAGE_SHIFT).wrapping_add(4 * (vaddr >> SUPERPAGE_SHIFT))
    }

    /// Combine a fetched page-directory entry with the superpage offset.
    #[inline]
    pub fn apply(&self, entry: u32, vaddr: u32) -> u32 {
        entry.wrapping_add(vaddr & SUPERPAGE_OFFSET_MASK)
    }
}

/// Translate a linear address to a physical address.
///
/// `read_pde` loads the 32-bit page-directory entry from guest memory; it is
/// only invoked when paging is active. The superpage offset is added to the
/// raw entry value, matching the reference trace bit-for-bit.
#[inline]
pub fn translate(cfg: &PagingConfig, vaddr: u32, read_pde: impl FnOnce(u32) -> u32) -> u32 {
    if !cfg.enabled {
        return vaddr;
    }
    let entry = read_pde(cfg.pde_addr(vaddr));
    cfg.apply(entry, vaddr)
}
