mod keys;

pub use keys::RelayKeys;
