pub mod duration {
    use std::ops::Deref;

    use chrono::Duration;
    use color_eyre::{
        eyre::{bail, eyre, Context as _},
        Result,
    };
    use itertools::Itertools as _;
    use serde::Deserialize;

    /// Human readable duration from the configuration, e.g. `15m` or `90s`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
    #[serde(try_from = "String")]
    pub struct DurationWrapper(pub Duration);

    impl TryFrom<String> for DurationWrapper {
        type Error = color_eyre::Report;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Self::try_from(value.as_str())
        }
    }

    impl TryFrom<&str> for DurationWrapper {
        type Error = color_eyre::Report;

        fn try_from(value: &str) -> Result<Self, Self::Error> {
            let chars = value.trim().chars().collect_vec();
            let (time, time_str, parse_fn): (&[char], &str, fn(i64) -> Option<Duration>) = match chars.as_slice() {
                [milliseconds @ .., 'm', 's'] => (milliseconds, "milliseconds", Duration::try_milliseconds),
                [seconds @ .., 's'] => (seconds, "seconds", Duration::try_seconds),
                [minutes @ .., 'm'] => (minutes, "minutes", Duration::try_minutes),
                [hours @ .., 'h'] => (hours, "hours", Duration::try_hours),
                x => bail!(
                    "parsing duration: {x}: invalid suffix (only h, m, s, ms)",
                    x = x.iter().collect::<String>()
                ),
            };
            let time = time.iter().collect::<String>();
            Ok(DurationWrapper(time.parse::<i64>().context("parsing duration from string").and_then(
                |dur| parse_fn(dur).ok_or_else(|| eyre!("Could not parse {} as {}", time, time_str)),
            )?))
        }
    }

    impl Deref for DurationWrapper {
        type Target = Duration;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }
}

pub mod tres {
    use std::collections::BTreeMap;

    /// TRES name under which SLURM reports allocated GPUs.
    pub const GPU: &str = "gres/gpu";

    /// A SLURM trackable-resources list, e.g. `cpu=4,mem=16G,node=1,gres/gpu=2`.
    ///
    /// Values are kept verbatim since not every resource is a plain number (`mem=16G`); callers pick
    /// the quantity they need with [`TresList::count`] or [`TresList::amount`]. If a name occurs
    /// twice, the first occurrence wins.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct TresList(BTreeMap<String, String>);

    impl TresList {
        pub fn parse(input: &str) -> Self {
            let mut entries = BTreeMap::new();
            for (name, value) in input.split(',').filter_map(|item| item.split_once('=')) {
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                entries.entry(name.to_owned()).or_insert_with(|| value.trim().to_owned());
            }
            TresList(entries)
        }

        pub fn get(&self, name: &str) -> Option<&str> {
            self.0.get(name).map(String::as_str)
        }

        /// Integral quantity, e.g. a GPU count. `None` if absent or not an unsigned integer.
        pub fn count(&self, name: &str) -> Option<u64> {
            self.get(name)?.parse().ok()
        }

        /// Numeric quantity, e.g. GPU-minutes. `None` if absent or not a finite number.
        pub fn amount(&self, name: &str) -> Option<f64> {
            self.get(name)?.parse::<f64>().ok().filter(|x| x.is_finite())
        }
    }
}

pub use duration::DurationWrapper as Duration;
pub use tres::TresList;
