// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod coalescing;
pub mod http;
pub mod offline;
pub mod utils;

pub use utils::*;
