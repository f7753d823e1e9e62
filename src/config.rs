use std::time::Duration;

/// What to do when a signature carries neither a trusted timestamp nor a
/// usable claimed signing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeFallback {
    /// Validate at the date supplied by the caller, and mark the verdict as
    /// time-unverified. Replaying the validation later may then give a
    /// different answer.
    #[default]
    CallerSupplied,
    /// Refuse to pick a date: the verdict is indeterminate.
    Reject,
}

/// Options of a validation run.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Consult OCSP responses (embedded or fetched).
    pub allow_ocsp: bool,
    /// Consult CRLs (embedded or fetched).
    pub allow_crl: bool,
    /// Allow network fetches at all. When off, only certificates and
    /// revocation data already at hand are used.
    pub allow_fetch: bool,
    /// Maximum number of certificates in a chain, trust anchor included.
    pub max_chain_depth: usize,
    /// Timeout of every single network fetch.
    pub fetch_timeout: Duration,
    /// Without a trusted timestamp the verdict is at best indeterminate.
    pub require_trusted_timestamp: bool,
    /// Use the signer's claimed signing time when there is no timestamp.
    pub use_claimed_time: bool,
    pub time_fallback: TimeFallback,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allow_ocsp: true,
            allow_crl: true,
            allow_fetch: true,
            max_chain_depth: 32,
            fetch_timeout: Duration::from_secs(10),
            require_trusted_timestamp: false,
            use_claimed_time: true,
            time_fallback: TimeFallback::CallerSupplied,
        }
    }
}

impl ValidationConfig {
    pub fn with_ocsp(mut self, allow: bool) -> Self {
        self.allow_ocsp = allow;
        self
    }

    pub fn with_crl(mut self, allow: bool) -> Self {
        self.allow_crl = allow;
        self
    }

    pub fn with_fetch(mut self, allow: bool) -> Self {
        self.allow_fetch = allow;
        self
    }

    pub fn with_max_chain_depth(mut self, depth: usize) -> Self {
        self.max_chain_depth = depth;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_required_timestamp(mut self, require: bool) -> Self {
        self.require_trusted_timestamp = require;
        self
    }

    pub fn with_claimed_time(mut self, use_it: bool) -> Self {
        self.use_claimed_time = use_it;
        self
    }

    pub fn with_time_fallback(mut self, fallback: TimeFallback) -> Self {
        self.time_fallback = fallback;
        self
    }
}
