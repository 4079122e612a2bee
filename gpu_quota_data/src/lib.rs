//! GPU usage and quota reporting on top of SLURM accounting.
//!
//! The pipeline is: [`access::resolve`] decides what may be queried, [`report::generate`] runs the
//! `sacct` query, aggregates it with [`usage::UsageAggregator`] and looks up the fair-share limits
//! of every account that showed up ([`limits::LimitTable::lookup`]), and [`render`] turns the
//! result into tables.
pub mod access;
pub mod limits;
pub mod render;
pub mod report;
pub mod slurm;
pub mod usage;

pub mod misc {
    pub mod parsing;
}

/// QOS labels GPU jobs are submitted under.
pub const DEFAULT_QOS: [&str; 2] = ["normal_qos", "large_qos"];
pub const DEFAULT_SUPERUSER: &str = "root";
/// How far past the end date to query, for jobs not yet in the accounting database.
pub const DEFAULT_ACCOUNTING_LAG: &str = "15m";
pub const DEFAULT_COST_PER_GPU_MINUTE: [(&str, f64); 3] = [("normal", 0.2), ("large", 0.2), ("buildlam", 0.2)];
