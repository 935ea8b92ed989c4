//! Test fixtures

mod mesh;

pub use mesh::{Mesh, TEST_NETWORK_KEY, read_all, wait_until};
