//! Decimal-string encoded integers.

use serde::{Deserialize, Deserializer, Serializer};

/// Write `value` as a decimal string.
pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

/// Parse a decimal string.
pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    text.parse::<u64>().map_err(serde::de::Error::custom)
}

/// Lists of decimal-string indices, as used by `"keyslots": ["0", "3"]`.
pub mod index_list {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Write each index as a decimal string.
    pub fn serialize<S>(values: &[usize], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(values.iter().map(|v| v.to_string()))
    }

    /// Parse a list of decimal strings.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<usize>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let texts = Vec::<String>::deserialize(deserializer)?;
        texts
            .iter()
            .map(|t| t.parse::<usize>().map_err(serde::de::Error::custom))
            .collect()
    }
}
