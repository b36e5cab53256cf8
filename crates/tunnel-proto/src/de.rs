//! Deserialization helpers for payloads whose producers write `null` where a
//! field has nothing to say.

use serde::{Deserialize, Deserializer};

/// Treats an explicit `null` like a missing field. Pair it with
/// `#[serde(default)]` so absent fields take the same path.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
