//! Aggregation of `sacct` job records into GPU time and cost per user or account.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use derive_more::derive::{Add, AddAssign, Deref, Display, From, Into};
use itertools::Itertools as _;
use serde::ser::SerializeStruct as _;
use serde::{Deserialize, Serialize, Serializer};
use tracing::debug;

use crate::misc::parsing::tres::{self, TresList};
use crate::report::ReportMode;

/// Cost of one GPU-minute, per partition. Partitions missing here are not billed.
///
/// Partition names are matched ignoring ASCII case, since configuration keys arrive lowercased.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, Into)]
#[serde(from = "HashMap<String, f64>", into = "HashMap<String, f64>")]
pub struct CostTable(HashMap<String, f64>);

impl CostTable {
    pub fn rate(&self, partition: &str) -> Option<f64> {
        self.0.get(&partition.to_ascii_lowercase()).copied()
    }
}

impl<K: AsRef<str>> FromIterator<(K, f64)> for CostTable {
    fn from_iter<T: IntoIterator<Item = (K, f64)>>(iter: T) -> Self {
        CostTable(
            iter.into_iter()
                .map(|(partition, rate)| (partition.as_ref().to_ascii_lowercase(), rate))
                .collect(),
        )
    }
}

impl From<HashMap<String, f64>> for CostTable {
    fn from(rates: HashMap<String, f64>) -> Self {
        rates.into_iter().collect()
    }
}

/// `elapsed * gpus`, kept in whole seconds so that sums don't depend on the order of the jobs.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Display, Deref, From, Into, Add, AddAssign, Serialize,
)]
pub struct GpuSeconds(pub u64);

impl GpuSeconds {
    pub fn minutes(self) -> f64 {
        self.0 as f64 / 60.0
    }

    pub fn hours(self) -> f64 {
        self.0 as f64 / 3600.0
    }
}

/// One row of `sacct -P --format=JobID,User,ElapsedRaw,AllocTRES,Partition,Account`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord<'a> {
    pub job_id: &'a str,
    pub user: &'a str,
    pub elapsed_seconds: u64,
    pub allocated: TresList,
    pub partition: &'a str,
    pub account: &'a str,
}

impl<'a> JobRecord<'a> {
    /// `None` for empty lines, lines with fewer than six fields and non-numeric elapsed times.
    pub fn parse(line: &'a str) -> Option<Self> {
        let fields = line.split('|').collect_vec();
        let &[job_id, user, elapsed, alloc_tres, partition, account, ..] = fields.as_slice() else {
            return None;
        };
        Some(JobRecord {
            job_id,
            user,
            elapsed_seconds: elapsed.trim().parse().ok()?,
            allocated: TresList::parse(alloc_tres),
            partition,
            account,
        })
    }

    /// Allocated GPUs, 0 if the job had none (or an unreadable count).
    pub fn gpus(&self) -> u64 {
        self.allocated.count(tres::GPU).unwrap_or(0)
    }

    pub fn gpu_seconds(&self) -> GpuSeconds {
        GpuSeconds(self.elapsed_seconds.saturating_mul(self.gpus()))
    }
}

/// GPU time spent in one partition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartitionUsage {
    pub gpu_seconds: GpuSeconds,
    /// Rate the time is billed at, `None` when the report doesn't bill.
    pub cost_per_gpu_minute: Option<f64>,
}

impl PartitionUsage {
    pub fn gpu_minutes(&self) -> f64 {
        self.gpu_seconds.minutes()
    }

    pub fn gpu_hours(&self) -> f64 {
        self.gpu_seconds.hours()
    }

    pub fn cost(&self) -> Option<f64> {
        self.cost_per_gpu_minute.map(|rate| self.gpu_minutes() * rate)
    }
}

/// Usage of one user (cost mode) or account (hours mode).
#[derive(Debug, Clone, PartialEq)]
pub struct UsageAggregate {
    pub mode: ReportMode,
    pub partitions: BTreeMap<String, PartitionUsage>,
    pub accounts: BTreeSet<String>,
}

impl UsageAggregate {
    fn new(mode: ReportMode) -> Self {
        UsageAggregate {
            mode,
            partitions: BTreeMap::new(),
            accounts: BTreeSet::new(),
        }
    }

    /// The partition's contribution to [`UsageAggregate::total`].
    pub fn subtotal(&self, usage: &PartitionUsage) -> f64 {
        match self.mode {
            ReportMode::UserCost => usage.cost().unwrap_or(0.0),
            ReportMode::AccountHours => usage.gpu_hours(),
        }
    }

    /// Total cost (cost mode) or GPU hours (hours mode); always the sum of the partition subtotals.
    pub fn total(&self) -> f64 {
        self.partitions.values().map(|usage| self.subtotal(usage)).sum()
    }

    pub fn gpu_seconds(&self) -> GpuSeconds {
        self.partitions.values().fold(GpuSeconds::default(), |acc, usage| acc + usage.gpu_seconds)
    }
}

/// Aggregation result: one [`UsageAggregate`] per user or account, plus every account seen.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport {
    pub mode: ReportMode,
    pub entities: BTreeMap<String, UsageAggregate>,
    pub accounts: BTreeSet<String>,
}

impl UsageReport {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.entities.values().map(UsageAggregate::total).sum()
    }
}

// Serialized together with the derived figures.

impl Serialize for PartitionUsage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut usage = serializer.serialize_struct("PartitionUsage", 5)?;
        usage.serialize_field("gpu_seconds", &self.gpu_seconds)?;
        usage.serialize_field("gpu_minutes", &self.gpu_minutes())?;
        usage.serialize_field("gpu_hours", &self.gpu_hours())?;
        usage.serialize_field("cost_per_gpu_minute", &self.cost_per_gpu_minute)?;
        usage.serialize_field("cost", &self.cost())?;
        usage.end()
    }
}

impl Serialize for UsageAggregate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut aggregate = serializer.serialize_struct("UsageAggregate", 3)?;
        aggregate.serialize_field("accounts", &self.accounts)?;
        aggregate.serialize_field("partitions", &self.partitions)?;
        aggregate.serialize_field("total", &self.total())?;
        aggregate.end()
    }
}

impl Serialize for UsageReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut report = serializer.serialize_struct("UsageReport", 3)?;
        report.serialize_field("entities", &self.entities)?;
        report.serialize_field("accounts", &self.accounts)?;
        report.serialize_field("total", &self.total())?;
        report.end()
    }
}

pub struct UsageAggregator<'c> {
    mode: ReportMode,
    costs: &'c CostTable,
}

impl<'c> UsageAggregator<'c> {
    pub fn new(mode: ReportMode, costs: &'c CostTable) -> Self {
        UsageAggregator { mode, costs }
    }

    /// The key a record is aggregated under and the rate it's billed at, or `None` if the record
    /// doesn't count towards this report.
    fn classify<'r>(&self, record: &JobRecord<'r>) -> Option<(&'r str, Option<f64>)> {
        if record.partition.is_empty() {
            return None;
        }
        match self.mode {
            ReportMode::UserCost => {
                let rate = self.costs.rate(record.partition)?;
                (!record.user.is_empty()).then_some((record.user, Some(rate)))
            }
            ReportMode::AccountHours => (!record.account.is_empty()).then_some((record.account, None)),
        }
    }

    pub fn aggregate<'l>(&self, lines: impl IntoIterator<Item = &'l str>) -> UsageReport {
        let mut entities = BTreeMap::<String, UsageAggregate>::new();
        let mut accounts = BTreeSet::new();

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let Some(record) = JobRecord::parse(line) else {
                debug!(line, "skipping malformed sacct row");
                continue;
            };
            let Some((key, rate)) = self.classify(&record) else {
                continue;
            };
            if record.gpus() == 0 {
                continue;
            }

            let entity = entities.entry(key.to_owned()).or_insert_with(|| UsageAggregate::new(self.mode));
            entity
                .partitions
                .entry(record.partition.to_owned())
                .or_insert(PartitionUsage {
                    gpu_seconds: GpuSeconds::default(),
                    cost_per_gpu_minute: rate,
                })
                .gpu_seconds += record.gpu_seconds();
            entity.accounts.insert(record.account.to_owned());
            accounts.insert(record.account.to_owned());
        }

        UsageReport {
            mode: self.mode,
            entities,
            accounts,
        }
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    const EPSILON: f64 = 1e-9;

    fn costs() -> CostTable {
        [("normal", 0.2), ("large", 0.5)].into_iter().collect()
    }

    #[test]
    fn JobRecord__parse() {
        let record = JobRecord::parse("J1|alice|3600|billing=2,cpu=2,gres/gpu=2,node=1|normal|acctA").unwrap();
        assert_eq!(record.job_id, "J1");
        assert_eq!(record.gpus(), 2);
        assert_eq!(record.gpu_seconds(), GpuSeconds(7200));

        assert_eq!(JobRecord::parse("J1|alice|3600|gres/gpu=2"), None);
        assert_eq!(JobRecord::parse(""), None);
        assert_eq!(JobRecord::parse("J1|alice|Unknown|gres/gpu=2|normal|acctA"), None);
        assert_eq!(JobRecord::parse("J1|alice|60||normal|acctA").map(|r| r.gpus()), Some(0));
    }

    #[test]
    fn CostTable__rate__ignores_case() {
        let costs: CostTable = [("A100", 1.25), ("normal", 0.2)].into_iter().collect();
        assert_eq!(costs.rate("A100"), Some(1.25));
        assert_eq!(costs.rate("a100"), Some(1.25));
        assert_eq!(costs.rate("Normal"), Some(0.2));
        assert_eq!(costs.rate("h100"), None);

        let from_config = CostTable::from(HashMap::from([("a100".to_owned(), 1.25)]));
        assert_eq!(from_config.rate("A100"), Some(1.25));
    }

    #[test]
    fn UsageAggregator__aggregate__mixed_case_partition_is_billed() {
        let costs: CostTable = [("a100", 1.0)].into_iter().collect();
        let report = UsageAggregator::new(ReportMode::UserCost, &costs).aggregate(["J1|alice|600|gres/gpu=1|A100|acctA"]);
        let alice = &report.entities["alice"];
        assert_eq!(alice.partitions.keys().collect_vec(), ["A100"]);
        assert!((alice.total() - 10.0).abs() < EPSILON);
    }

    #[test]
    fn UsageAggregator__aggregate__cost_example() {
        let costs = costs();
        let report = UsageAggregator::new(ReportMode::UserCost, &costs).aggregate(["J1|alice|3600|gres/gpu=2|normal|acctA"]);

        let alice = &report.entities["alice"];
        let normal = &alice.partitions["normal"];
        assert!((normal.gpu_minutes() - 120.0).abs() < EPSILON);
        assert!((normal.cost().unwrap() - 24.0).abs() < EPSILON);
        assert!((alice.total() - 24.0).abs() < EPSILON);
        assert_eq!(alice.accounts, BTreeSet::from(["acctA".to_owned()]));
        assert_eq!(report.accounts, BTreeSet::from(["acctA".to_owned()]));
    }

    #[test]
    fn UsageAggregator__aggregate__skips_unbillable_and_malformed() {
        let costs = costs();
        let lines = [
            "J1|alice|600|gres/gpu=1|normal|acctA",
            "J2|alice|600|cpu=4|normal|acctA",
            "J3|alice|600|gres/gpu=1|debug|acctB",
            "J4|alice|600|gres/gpu=1",
            "",
            "J5||600|gres/gpu=1|normal|acctC",
            "J6|bob|600|gres/gpu=1||acctD",
            "J7|bob|600|gres/gpu=4|large|acctA",
        ];
        let report = UsageAggregator::new(ReportMode::UserCost, &costs).aggregate(lines);

        assert_eq!(report.entities.keys().collect_vec(), ["alice", "bob"]);
        let alice = &report.entities["alice"];
        assert_eq!(alice.partitions.keys().collect_vec(), ["normal"]);
        assert_eq!(alice.gpu_seconds(), GpuSeconds(600));
        assert!((alice.total() - 2.0).abs() < EPSILON);
        assert!((report.entities["bob"].total() - 20.0).abs() < EPSILON);
        assert_eq!(report.accounts, BTreeSet::from(["acctA".to_owned()]));
    }

    #[test]
    fn UsageAggregator__aggregate__hours_by_account_ignores_cost_table() {
        let costs = costs();
        let lines = [
            "J1|alice|3600|gres/gpu=1|normal|acctA",
            "J2|bob|1800|gres/gpu=4|debug|acctA",
            "J3|carol|3600|gres/gpu=1|normal|",
            "J4||7200|gres/gpu=1|normal|acctB",
        ];
        let report = UsageAggregator::new(ReportMode::AccountHours, &costs).aggregate(lines);

        assert_eq!(report.entities.keys().collect_vec(), ["acctA", "acctB"]);
        let acct_a = &report.entities["acctA"];
        assert!((acct_a.partitions["debug"].gpu_hours() - 2.0).abs() < EPSILON);
        assert_eq!(acct_a.partitions["normal"].cost(), None);
        assert!((acct_a.total() - 3.0).abs() < EPSILON);
        assert!((report.entities["acctB"].total() - 2.0).abs() < EPSILON);
    }

    #[test]
    fn UsageAggregator__aggregate__nothing_billable() {
        let costs = CostTable::default();
        let report = UsageAggregator::new(ReportMode::UserCost, &costs).aggregate(["J1|alice|3600|gres/gpu=2|normal|acctA"]);
        assert!(report.is_empty());
        assert!(report.accounts.is_empty());
    }

    fn job_line() -> impl Strategy<Value = String> {
        (
            prop::sample::select(vec!["alice", "bob", "carol", ""]),
            0u64..200_000,
            prop::option::of(0u64..9),
            prop::sample::select(vec!["normal", "large", "debug", ""]),
            prop::sample::select(vec!["acctA", "acctB"]),
        )
            .prop_map(|(user, elapsed, gpus, partition, account)| {
                let tres = gpus.map(|n| format!("cpu=4,gres/gpu={n}")).unwrap_or_else(|| "cpu=4".to_owned());
                format!("1|{user}|{elapsed}|{tres}|{partition}|{account}")
            })
    }

    proptest! {
        #[test]
        fn UsageAggregator__aggregate__permutation_invariant(
            (lines, shuffled) in prop::collection::vec(job_line(), 0..40)
                .prop_flat_map(|lines| (Just(lines.clone()), Just(lines).prop_shuffle()))
        ) {
            let costs = costs();
            for mode in [ReportMode::UserCost, ReportMode::AccountHours] {
                let aggregator = UsageAggregator::new(mode, &costs);
                let a = aggregator.aggregate(lines.iter().map(String::as_str));
                let b = aggregator.aggregate(shuffled.iter().map(String::as_str));
                prop_assert_eq!(a, b);
            }
        }

        #[test]
        fn UsageAggregator__aggregate__total_is_sum_of_partitions(lines in prop::collection::vec(job_line(), 0..40)) {
            let costs = costs();
            for mode in [ReportMode::UserCost, ReportMode::AccountHours] {
                let report = UsageAggregator::new(mode, &costs).aggregate(lines.iter().map(String::as_str));
                for aggregate in report.entities.values() {
                    prop_assert!(!aggregate.partitions.is_empty());
                    let sum: f64 = aggregate.partitions.values().map(|usage| aggregate.subtotal(usage)).sum();
                    prop_assert!((aggregate.total() - sum).abs() < EPSILON);
                }
            }
        }

        #[test]
        fn UsageAggregator__aggregate__zero_gpu_jobs_contribute_nothing(
            lines in prop::collection::vec(job_line(), 0..20),
            elapsed in 0u64..1_000_000,
            partition in prop::sample::select(vec!["normal", "large", "debug"]),
        ) {
            let costs = costs();
            let zero_gpu = format!("Z|alice|{elapsed}|gres/gpu=0|{partition}|acctZ");
            let no_gpu = format!("Z|alice|{elapsed}|cpu=8|{partition}|acctZ");
            for mode in [ReportMode::UserCost, ReportMode::AccountHours] {
                let aggregator = UsageAggregator::new(mode, &costs);
                let base = aggregator.aggregate(lines.iter().map(String::as_str));
                let with_idle = aggregator.aggregate(
                    lines.iter().map(String::as_str).chain([zero_gpu.as_str(), no_gpu.as_str()]),
                );
                prop_assert_eq!(base, with_idle);
            }
        }
    }
}
