//! Post-write verification and bounded retry.
//!
//! After a region is written, the auditor reads it back and compares, cell by cell, which values
//! are present against the source. Storage backends that drop or lose writes show up as missing
//! cells. The retry controller reruns the whole write when that happens, waiting a little longer
//! before each new attempt.
//!
use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveHandle;
use crate::dataset::Dataset;
use crate::errors::{Error, Result};
use crate::region::ArchiveRegion;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Which variables to audit after a write.
///
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CheckRepr", into = "CheckRepr")]
pub enum MissingCheck {
    #[default]
    All,
    None,
    Only(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum CheckRepr {
    Keyword(String),
    Names(Vec<String>),
}

impl TryFrom<CheckRepr> for MissingCheck {
    type Error = Error;

    fn try_from(repr: CheckRepr) -> Result<Self> {
        match repr {
            CheckRepr::Keyword(keyword) => keyword.parse(),
            CheckRepr::Names(names) => Ok(MissingCheck::Only(names)),
        }
    }
}

impl From<MissingCheck> for CheckRepr {
    fn from(check: MissingCheck) -> Self {
        match check {
            MissingCheck::All => CheckRepr::Keyword("all".to_string()),
            MissingCheck::None => CheckRepr::Keyword("none".to_string()),
            MissingCheck::Only(names) => CheckRepr::Names(names),
        }
    }
}

impl FromStr for MissingCheck {
    type Err = Error;

    /// Parse `all`, `none` or a comma separated list of variable names
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "all" => Ok(MissingCheck::All),
            "none" => Ok(MissingCheck::None),
            "" => Err(Error::configuration(
                "missing data check must be all, none or a list of variables",
            )),
            names => Ok(MissingCheck::Only(
                names
                    .split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect(),
            )),
        }
    }
}

impl MissingCheck {
    /// Names of the variables of `source` to audit
    pub fn variables(&self, source: &Dataset) -> Result<Vec<String>> {
        match self {
            MissingCheck::All => Ok(source
                .variables()
                .iter()
                .map(|variable| variable.name.clone())
                .collect()),
            MissingCheck::None => Ok(vec![]),
            MissingCheck::Only(names) => {
                for name in names {
                    source.variable(name)?;
                }
                Ok(names.clone())
            }
        }
    }
}

/// Disagreement between the source and what was read back, for one variable.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MissingReport {
    pub variable: String,

    /// Cells with a value in the source but none in the archive
    pub missing: usize,

    /// Cells with a value in the archive but none in the source
    pub unexpected: usize,
}

impl fmt::Display for MissingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} missing", self.variable, self.missing)?;
        if self.unexpected > 0 {
            write!(f, ", {} unexpected", self.unexpected)?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuditOutcome {
    Complete,
    Missing(Vec<MissingReport>),
}

impl AuditOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, AuditOutcome::Complete)
    }

    /// One line summary, for logs and errors
    pub fn describe(&self) -> String {
        match self {
            AuditOutcome::Complete => "complete".to_string(),
            AuditOutcome::Missing(reports) => {
                let reports: Vec<String> =
                    reports.iter().map(|report| report.to_string()).collect();
                format!("missing data after write ({})", reports.join("; "))
            }
        }
    }
}

/// Read back `region` of the archive and compare it against `source`.
///
/// Only the presence of values is compared. Values themselves may differ because of packing.
///
pub fn audit(
    handle: &ArchiveHandle,
    region: &ArchiveRegion,
    source: &Dataset,
    check: &MissingCheck,
) -> Result<AuditOutcome> {
    let mut reports = vec![];
    for name in check.variables(source)? {
        let expected = source.variable(&name)?;
        let stored = handle.read_variable(&name, region)?;
        if stored.shape() != expected.data.shape() {
            return Err(Error::region(format!(
                "region {region} of {name} has shape {:?}, source has {:?}",
                stored.shape(),
                expected.data.shape()
            )));
        }

        let mut missing = 0;
        let mut unexpected = 0;
        for (stored, expected) in stored.iter().zip(expected.data.iter()) {
            match (stored.is_nan(), expected.is_nan()) {
                (true, false) => missing += 1,
                (false, true) => unexpected += 1,
                _ => {}
            }
        }

        if missing + unexpected > 0 {
            reports.push(MissingReport {
                variable: name,
                missing,
                unexpected,
            });
        }
    }

    if reports.is_empty() {
        Ok(AuditOutcome::Complete)
    } else {
        Ok(AuditOutcome::Missing(reports))
    }
}

/// Bounded retries with linear backoff.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt. Zero makes the first failure fatal.
    pub max_retries: u32,

    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Wait before retry number `retry`, counting from 1
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay * retry
    }
}

/// Result of one attempt at an operation.
///
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),

    /// Failed in a way that another attempt may fix
    Retryable(String),

    /// Failed for good
    Fatal(Error),
}

/// A successful result and what it took to get there.
///
#[derive(Clone, Debug, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
    pub waited: Duration,
}

/// Run `attempt` until it succeeds, fails fatally, or the retry budget of `policy` is spent.
///
/// `attempt` receives the number of retries so far, 0 for the first attempt.
///
pub fn with_retry<T, F>(policy: &RetryPolicy, attempt: F) -> Result<Retried<T>>
where
    F: FnMut(u32) -> Attempt<T>,
{
    with_retry_sleeping(policy, thread::sleep, attempt)
}

pub(crate) fn with_retry_sleeping<T, F, S>(
    policy: &RetryPolicy,
    mut sleep: S,
    mut attempt: F,
) -> Result<Retried<T>>
where
    F: FnMut(u32) -> Attempt<T>,
    S: FnMut(Duration),
{
    let mut retries = 0;
    let mut waited = Duration::ZERO;

    loop {
        match attempt(retries) {
            Attempt::Success(value) => {
                return Ok(Retried {
                    value,
                    retries,
                    waited,
                })
            }
            Attempt::Fatal(err) => return Err(err),
            Attempt::Retryable(reason) => {
                if retries >= policy.max_retries {
                    return Err(Error::RetryLimitExceeded { retries, reason });
                }

                retries += 1;
                let delay = policy.delay(retries);
                log::warn!(
                    "{reason}; retry {retries} of {} in {delay:?}",
                    policy.max_retries
                );
                sleep(delay);
                waited += delay;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::chunk::Compression;
    use crate::mapper::MemoryMapper;
    use crate::testing;

    fn no_sleep(_: Duration) {}

    /// Fails with a retryable error `failures` times, then succeeds
    fn flaky(failures: u32) -> impl FnMut(u32) -> Attempt<&'static str> {
        move |retries| {
            if retries < failures {
                Attempt::Retryable(format!("attempt {retries} found missing data"))
            } else {
                Attempt::Success("done")
            }
        }
    }

    #[test]
    fn test_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(300));
        assert_eq!(RetryPolicy::default().max_retries, 0);
    }

    #[test]
    fn test_success_after_retries() -> Result<()> {
        let policy = RetryPolicy::new(2, Duration::from_millis(100));
        let outcome = with_retry_sleeping(&policy, no_sleep, flaky(2))?;
        assert_eq!(outcome.value, "done");
        assert_eq!(outcome.retries, 2);
        assert_eq!(outcome.waited, Duration::from_millis(300));

        Ok(())
    }

    #[test]
    fn test_retry_limit_exceeded() {
        let policy = RetryPolicy::new(1, Duration::from_millis(100));
        let result = with_retry_sleeping(&policy, no_sleep, flaky(2));
        assert!(matches!(
            result,
            Err(Error::RetryLimitExceeded { retries: 1, .. })
        ));
    }

    #[test]
    fn test_no_retries() {
        let policy = RetryPolicy::new(0, Duration::from_millis(100));
        let result = with_retry_sleeping(&policy, no_sleep, flaky(1));
        assert!(matches!(
            result,
            Err(Error::RetryLimitExceeded { retries: 0, .. })
        ));
    }

    #[test]
    fn test_fatal_stops_retrying() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        let mut attempts = 0;
        let result: Result<Retried<()>> = with_retry_sleeping(&policy, no_sleep, |_| {
            attempts += 1;
            Attempt::Fatal(Error::packing("value out of range"))
        });
        assert!(matches!(result, Err(Error::Packing(_))));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_real_sleep() -> Result<()> {
        let policy = RetryPolicy::new(1, Duration::from_millis(1));
        let outcome = with_retry(&policy, flaky(1))?;
        assert_eq!(outcome.retries, 1);
        assert_eq!(outcome.waited, Duration::from_millis(1));

        Ok(())
    }

    #[test]
    fn test_parse_check() -> Result<()> {
        assert_eq!("all".parse::<MissingCheck>()?, MissingCheck::All);
        assert_eq!("none".parse::<MissingCheck>()?, MissingCheck::None);
        assert_eq!(
            "t2m, sst".parse::<MissingCheck>()?,
            MissingCheck::Only(vec!["t2m".to_string(), "sst".to_string()])
        );

        let check: MissingCheck = serde_json::from_str("[\"t2m\"]")?;
        assert_eq!(check, MissingCheck::Only(vec!["t2m".to_string()]));
        let check: MissingCheck = serde_json::from_str("\"none\"")?;
        assert_eq!(check, MissingCheck::None);
        assert_eq!(serde_json::to_string(&MissingCheck::All)?, "\"all\"");

        Ok(())
    }

    #[test]
    fn test_audit() -> Result<()> {
        let mapper = Arc::new(MemoryMapper::new());
        let handle = ArchiveHandle::create(
            mapper.clone(),
            testing::metadata(10, 4, 6, Compression::None),
        )?;
        let source = testing::dataset(&handle.metadata().time[4..8], 4, 6);
        let mut region = handle.metadata().full_region();
        region.insert("time", 4..8);

        // Nothing written yet
        let outcome = audit(&handle, &region, &source, &MissingCheck::All)?;
        let present = source.variable("t2m")?.count_present();
        assert_eq!(
            outcome,
            AuditOutcome::Missing(vec![MissingReport {
                variable: "t2m".to_string(),
                missing: present,
                unexpected: 0,
            }])
        );
        assert!(outcome.describe().contains("t2m"));
        assert!(audit(&handle, &region, &source, &MissingCheck::None)?.is_complete());

        let data = source.variable("t2m")?.data.view();
        handle.write_variable("t2m", &region, data)?;
        assert!(audit(&handle, &region, &source, &MissingCheck::All)?.is_complete());

        // Lose one chunk
        mapper.remove("t2m/1.0.0");
        let outcome = audit(&handle, &region, &source, &MissingCheck::All)?;
        assert!(!outcome.is_complete());

        let check = MissingCheck::Only(vec!["sst".to_string()]);
        assert!(matches!(
            audit(&handle, &region, &source, &check),
            Err(Error::BadName(_))
        ));

        Ok(())
    }
}
