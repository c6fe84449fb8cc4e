mod engine;

pub use engine::{generate_state_nonce, hash_state_nonce, CryptoEngine};
