//! "Change prices" flag resolution across listing, product and backend.

use crate::types::PriceFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Enabled,
    Disabled,
}

/// Resolve the three-level override chain.
///
/// The most specific explicit flag wins (listing, then product, then
/// backend). With no explicit flag anywhere, pricing is enabled.
pub fn resolve_flag(listing: PriceFlag, product: PriceFlag, backend: PriceFlag) -> Permission {
    [listing, product, backend]
        .into_iter()
        .find_map(|flag| match flag {
            PriceFlag::Enabled => Some(Permission::Enabled),
            PriceFlag::Disabled => Some(Permission::Disabled),
            PriceFlag::Inherit => None,
        })
        .unwrap_or(Permission::Enabled)
}
