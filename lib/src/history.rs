// Copyright 2025 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

use crate::color::ColorState;
use std::io;
use std::path::Path;

/// Overwrites the history file with `"<temperature> <brightness>\n"`.
///
/// # Errors
///
/// Returns error if the file could not be written.
pub async fn write(path: &Path, color: ColorState) -> io::Result<()> {
    tokio::fs::write(path, format!("{color}\n")).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rewrites_the_whole_file() {
        let path = std::env::temp_dir().join(format!(
            "gammarelay-{}-history-rewrite",
            std::process::id()
        ));

        write(&path, ColorState::default()).await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(&path).await.unwrap(),
            "6500 1.00\n"
        );

        let color = ColorState {
            temperature: 4200,
            brightness: 0.5,
        };
        write(&path, color).await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(&path).await.unwrap(),
            "4200 0.50\n"
        );

        let _ = tokio::fs::remove_file(&path).await;
    }
}
