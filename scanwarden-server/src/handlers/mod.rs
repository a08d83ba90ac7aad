pub mod findings;
pub mod scans;
pub mod stats;
