//! Runtime configuration for a [`HazardPointers`](super::HazardPointers)
//! registry.

include!(concat!(env!("OUT_DIR"), "/build_constants.rs"));

const DEFAULT_MAX_THREADS: usize = 128;
const DEFAULT_MAX_HPS_PER_THREAD: usize = 5;

/// The compiled-in cap on hazard pointer slots a single thread may reserve in
/// one registry. Mirrors the reference implementation's fixed `HP_MAX_HPS`,
/// kept as a hard upper bound so that each per-thread row can be a plain
/// fixed-size array instead of a heap allocation.
pub(crate) const MAX_HPS_CAP: usize = 8;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Runtime parameters for a hazard pointer registry.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    max_threads: usize,
    max_hps_per_thread: usize,
    scan_threshold: u32,
}

/********** impl Default **************************************************************************/

impl Default for Config {
    #[inline]
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/********** impl inherent *************************************************************************/

impl Config {
    /// Creates a new [`Config`] with the given parameters.
    ///
    /// # Panics
    ///
    /// Panics if `max_threads` or `max_hps_per_thread` is 0, or if
    /// `max_hps_per_thread` exceeds the compiled-in cap ([`MAX_HPS_CAP`]).
    #[inline]
    pub fn with_params(max_threads: usize, max_hps_per_thread: usize, scan_threshold: u32) -> Self {
        assert!(max_threads > 0, "max_threads must be greater than 0");
        assert!(max_hps_per_thread > 0, "max_hps_per_thread must be greater than 0");
        assert!(
            max_hps_per_thread <= MAX_HPS_CAP,
            "max_hps_per_thread ({}) exceeds the compiled-in cap ({})",
            max_hps_per_thread,
            MAX_HPS_CAP
        );

        Self { max_threads, max_hps_per_thread, scan_threshold }
    }

    /// Returns the maximum number of distinct threads this registry can
    /// service. Registering a thread beyond this limit is a contract
    /// violation and panics.
    #[inline]
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Returns the number of hazard pointer slots reserved per thread.
    #[inline]
    pub fn max_hps_per_thread(&self) -> usize {
        self.max_hps_per_thread
    }

    /// Returns the scan threshold (the paper's `R`): the minimum number of
    /// pending retired pointers before a `retire` call attempts a
    /// reclamation scan. `0` scans on every retire.
    #[inline]
    pub fn scan_threshold(&self) -> u32 {
        self.scan_threshold
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConfigBuilder
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A builder type for gradually initializing a [`Config`].
#[derive(Copy, Clone, Debug, Default)]
pub struct ConfigBuilder {
    max_threads: Option<usize>,
    max_hps_per_thread: Option<usize>,
    scan_threshold: Option<u32>,
}

impl ConfigBuilder {
    /// Creates a new [`ConfigBuilder`] with default values.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of distinct threads.
    #[inline]
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = Some(max_threads);
        self
    }

    /// Sets the number of hazard pointer slots reserved per thread.
    #[inline]
    pub fn max_hps_per_thread(mut self, max_hps_per_thread: usize) -> Self {
        self.max_hps_per_thread = Some(max_hps_per_thread);
        self
    }

    /// Sets the scan threshold.
    #[inline]
    pub fn scan_threshold(mut self, scan_threshold: u32) -> Self {
        self.scan_threshold = Some(scan_threshold);
        self
    }

    /// Consumes the [`ConfigBuilder`] and returns an initialized [`Config`].
    ///
    /// Unspecified parameters fall back to their default values, the last of
    /// which (`scan_threshold`) may have been overridden at build time via
    /// the `HP_SCAN_THRESHOLD` environment variable.
    #[inline]
    pub fn build(self) -> Config {
        Config::with_params(
            self.max_threads.unwrap_or(DEFAULT_MAX_THREADS),
            self.max_hps_per_thread.unwrap_or(DEFAULT_MAX_HPS_PER_THREAD),
            self.scan_threshold.unwrap_or(DEFAULT_SCAN_THRESHOLD),
        )
    }
}
