// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::path::{Path, PathBuf};
use tower::BoxError;

/// Parse a single key-value pair
pub(crate) fn parse_key_val<T, U>(s: &str) -> Result<(T, U), BoxError>
where
    T: std::str::FromStr,
    T::Err: Error + Send + Sync + 'static,
    U: std::str::FromStr,
    U::Err: Error + Send + Sync + 'static,
{
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{s}`"))?;
    Ok((s[..pos].parse()?, s[pos + 1..].parse()?))
}

/// Parse a source definition of the form NAME=PATH
pub(crate) fn parse_source(s: &str) -> Result<(String, PathBuf), BoxError> {
    let (name, path) = parse_key_val::<String, PathBuf>(s.trim())?;
    if name.trim().is_empty() {
        return Err(format!("source name must not be empty in `{s}`").into());
    }
    if path.as_os_str().is_empty() {
        return Err(format!("source path must not be empty in `{s}`").into());
    }
    Ok((name.trim().to_string(), path))
}

/// Resolve a relative path against the data directory
pub fn resolve_data_path(data_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_path.join(path)
    }
}
