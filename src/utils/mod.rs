// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Small shared helpers: natural sorting, human-readable formatting,
//! progress indicators.

mod fmt;
mod natsort;
mod progress;

pub use fmt::{bytes_to_str, duration_to_str};
pub use natsort::{natsort, natural_cmp};
pub use progress::create_check_bar;
