/// Minimum urban share for a record to be persisted. Computed on the
/// NaN-as-zero mean; the boundary value itself is kept.
pub const URBAN_SHARE_MIN: f32 = 0.1;

pub fn keep(urban_share: f32) -> bool {
    urban_share >= URBAN_SHARE_MIN
}
