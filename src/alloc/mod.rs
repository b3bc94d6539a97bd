pub mod global;
pub mod internal;
pub mod record;
pub mod registry;
