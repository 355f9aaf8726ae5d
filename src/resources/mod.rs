mod swift_storage;

pub use swift_storage::*;
