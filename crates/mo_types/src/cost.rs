/// Production cost accounting for a cached result.
///
/// Each resource tracks three totals: `self` (this operator alone), `all`
/// (including every child operator) and `uncached` (the share that would
/// still have to be paid if the request were issued again right now, i.e.
/// `all` minus whatever was answered from caches).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CostProfile {
    pub self_cpu: f64,
    pub all_cpu: f64,
    pub uncached_cpu: f64,

    pub self_gpu: f64,
    pub all_gpu: f64,
    pub uncached_gpu: f64,

    pub self_io: u64,
    pub all_io: u64,
    pub uncached_io: u64,
}

impl CostProfile {
    /// I/O bytes are folded into cost seconds at this assumed throughput.
    const IO_BYTES_PER_SECOND: f64 = 10e6;

    /// Folds a child's profile into this one (`self_*` stays ours).
    pub fn add_all(&mut self, child: &Self) {
        self.all_cpu += child.all_cpu;
        self.uncached_cpu += child.uncached_cpu;
        self.all_gpu += child.all_gpu;
        self.uncached_gpu += child.uncached_gpu;
        self.all_io += child.all_io;
        self.uncached_io += child.uncached_io;
    }

    /// Marks `hit`'s worth of work as answered from cache: its uncached share
    /// no longer needs to be recomputed.
    pub fn subtract_cached(&mut self, hit: &Self) {
        self.uncached_cpu = (self.uncached_cpu - hit.uncached_cpu).max(0.0);
        self.uncached_gpu = (self.uncached_gpu - hit.uncached_gpu).max(0.0);
        self.uncached_io = self.uncached_io.saturating_sub(hit.uncached_io);
    }

    /// Scalar cost of recomputing this entry from scratch, in seconds.
    ///
    /// This is what the cost-weighted relevance function orders by.
    pub fn uncached_cost(&self) -> f64 {
        self.uncached_cpu + self.uncached_gpu + self.uncached_io as f64 / Self::IO_BYTES_PER_SECOND
    }
}

impl std::fmt::Display for CostProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu[{:.3},{:.3},{:.3}] gpu[{:.3},{:.3},{:.3}] io[{},{},{}]",
            self.self_cpu,
            self.all_cpu,
            self.uncached_cpu,
            self.self_gpu,
            self.all_gpu,
            self.uncached_gpu,
            self.self_io,
            self.all_io,
            self.uncached_io,
        )
    }
}
