// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Progress indicators for long-running operations.

use indicatif::{ProgressBar, ProgressStyle};

/// Create the progress bar shown during the parallel tool check.
///
/// Hidden when stderr is not a terminal so batch logs stay clean.
pub fn create_check_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len}")
            .expect("Invalid progress bar template")
            .progress_chars("█▓░"),
    );
    pb.set_message("tool check");
    pb
}
