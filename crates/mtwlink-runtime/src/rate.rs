//! Update-rate selection.
//!
//! A wireless network only runs at a handful of discrete rates, which depend
//! on how many sensors are attached.  [`find_closest_update_rate`] picks the
//! supported rate nearest to the one the operator asked for.
//!
//! ```rust
//! use mtwlink_runtime::rate::find_closest_update_rate;
//!
//! assert_eq!(find_closest_update_rate(&[40, 60, 120], 75), Some(60));
//! assert_eq!(find_closest_update_rate(&[], 75), None);
//! ```

/// Return the supported rate with the smallest absolute distance to
/// `desired`.
///
/// Ties go to the rate listed first.  A single supported rate is returned
/// whatever `desired` is; an empty list yields `None`.
pub fn find_closest_update_rate(supported: &[u32], desired: u32) -> Option<u32> {
    supported
        .iter()
        .copied()
        .min_by_key(|rate| rate.abs_diff(desired))
}
