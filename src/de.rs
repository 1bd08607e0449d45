// src/de.rs
// Weakly typed field decoding. Interpolated values arrive as strings, so numeric
// and boolean fields also accept their textual form. An empty string is unset.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::fmt::Display;
use std::str::FromStr;

#[derive(Deserialize)]
#[serde(untagged)]
enum Weak<T> {
    Native(T),
    Text(String),
}

pub fn weak<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr + Default,
    T::Err: Display,
{
    match Weak::<T>::deserialize(deserializer)? {
        Weak::Native(value) => Ok(value),
        Weak::Text(text) if text.trim().is_empty() => Ok(T::default()),
        Weak::Text(text) => text
            .trim()
            .parse::<T>()
            .map_err(|e| de::Error::custom(format!("cannot parse '{}': {}", text, e))),
    }
}

pub fn weak_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Weak::<bool>::deserialize(deserializer)? {
        Weak::Native(value) => Ok(value),
        Weak::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "f" | "false" => Ok(false),
            "1" | "t" | "true" => Ok(true),
            _ => Err(de::Error::custom(format!("cannot parse '{}' as a boolean", text))),
        },
    }
}
