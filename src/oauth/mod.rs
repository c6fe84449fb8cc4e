mod manager;

pub use manager::{TokenManager, PROVIDER_TIMEOUT, REFRESH_MARGIN, RETRY_BACKOFF, STATE_TTL};
