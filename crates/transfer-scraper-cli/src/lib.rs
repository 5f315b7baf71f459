//! Library half of the `transfer-scraper` binary: config resolution and output.

pub mod config;
pub mod output;
