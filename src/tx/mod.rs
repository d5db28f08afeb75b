pub(crate) mod snapshot;
pub mod transaction;
