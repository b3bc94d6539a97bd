pub mod serde_address;
