pub mod fixtures;
pub mod memory;

#[allow(unused_imports)]
pub use fixtures::{collect_nodes, seeded_bytes};
#[allow(unused_imports)]
pub use memory::{FIRST_MESSAGE_ID, MemoryTransport};
