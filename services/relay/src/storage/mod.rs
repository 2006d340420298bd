pub mod store;

pub use store::{BufferClearFilter, NewRule, Store, StoreError};
