use crate::Error;
use std::{collections::BTreeMap, str::FromStr};

/// Immutable string-keyed configuration handed to transports at construction.
///
/// Transports copy what they need out of [Settings] into a typed `Config`
/// when they are created. Later changes to the caller's settings have no
/// effect on an existing transport.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Raw value stored under `key`, or [Error::MissingSetting].
    pub fn require(&self, key: &'static str) -> Result<&str, Error> {
        self.get(key).ok_or(Error::MissingSetting(key))
    }

    /// Parse the value stored under `key`.
    ///
    /// Returns `Ok(None)` if `key` is absent and [Error::InvalidSetting] if
    /// the value does not parse as `T`.
    pub fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, Error> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidSetting {
                key,
                value: value.to_owned(),
            })
    }

    /// Parse the value stored under `key`, which must be present.
    pub fn parse_required<T: FromStr>(&self, key: &'static str) -> Result<T, Error> {
        self.parse(key)?.ok_or(Error::MissingSetting(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Settings {
    fn from(entries: [(K, V); N]) -> Self {
        entries.into_iter().collect()
    }
}
