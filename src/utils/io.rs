//! IO Utilities

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::{fs, path::Path};

/// Save data as JSON, creating parent directories as needed.
pub fn save_json<T: Serialize>(data: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(data)?;
    fs::write(path, json)?;
    Ok(())
}

/// Load data from JSON
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Blob {
        name: String,
        values: Vec<f64>,
    }

    #[test]
    fn test_json_round_trip_creates_directories() {
        let dir = std::env::temp_dir()
            .join("equivariant_nbody_io_test")
            .join("nested");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("blob.json");

        let blob = Blob {
            name: "run".to_string(),
            values: vec![1.0, -2.5],
        };
        save_json(&blob, &path).unwrap();
        let back: Blob = load_json(&path).unwrap();
        assert_eq!(back, blob);
    }
}
