//! Time partitioning of object keys.
//!
//! A journal's objects are grouped under a directory derived from the wall
//! clock in UTC, e.g. `2024/01/15`. [`DirectoryFormat`] owns the format
//! pattern, produces the directory for a given instant, and reverse-parses a
//! directory back to an instant for the expiration sweeper.
use crate::error::{Error, Result};

use chrono::format::{Item, Parsed, StrftimeItems};
use chrono::{DateTime, NaiveTime, TimeZone as _, Utc};

/// Source of the current UTC time.
///
/// The journal reads time through this trait so tests can pin or advance the
/// clock; production uses [`SystemClock`].
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_utc(&self) -> DateTime<Utc> {
        (**self).now_utc()
    }
}

/// [`Clock`] reading the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A parsed `s3_directory_format`.
///
/// The accepted grammar is `'<literal>'/<pattern>` or bare `<pattern>`, where
/// `<pattern>` is an `strftime`-style format string. A leading single-quoted
/// segment is not interpreted as a time pattern; it becomes a fixed key
/// prefix under which every directory of this journal lives (and therefore
/// the prefix recovery lists open uploads by).
#[derive(Debug, Clone)]
pub struct DirectoryFormat {
    prefix: Option<String>,
    items: Vec<Item<'static>>,
}

impl DirectoryFormat {
    /// The default day-partitioned layout.
    pub const DEFAULT_PATTERN: &'static str = "%Y/%m/%d";

    pub fn parse(fmt: &str) -> Result<Self> {
        let (prefix, pattern) = match fmt.strip_prefix('\'') {
            Some(rest) => {
                let end = rest
                    .find('\'')
                    .ok_or_else(|| Error::config(format!("unterminated literal prefix in {fmt:?}")))?;
                let tail = rest[end + 1..].strip_prefix('/').ok_or_else(|| {
                    Error::config(format!("expected '/' after literal prefix in {fmt:?}"))
                })?;
                (Some(rest[..end].to_string()), tail)
            }
            None => (None, fmt),
        };
        if pattern.is_empty() {
            return Err(Error::config("empty directory format pattern"));
        }
        let items = StrftimeItems::new(pattern)
            .parse_to_owned()
            .map_err(|e| Error::config(format!("bad directory format {pattern:?}: {e}")))?;
        Ok(Self { prefix, items })
    }

    /// The fixed key prefix, when the format declares one.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// The directory for the instant `at`.
    pub fn directory(&self, at: DateTime<Utc>) -> String {
        let formatted = at.format_with_items(self.items.iter()).to_string();
        match &self.prefix {
            Some(p) => format!("{p}/{formatted}"),
            None => formatted,
        }
    }

    /// Reverse-parse a directory produced by [`directory`](Self::directory).
    ///
    /// Patterns without a time-of-day component parse to midnight. Returns
    /// `None` for directories that do not match the format, such as keys
    /// written by peers with a different layout.
    pub fn parse_directory(&self, dir: &str) -> Option<DateTime<Utc>> {
        let timepart = match &self.prefix {
            Some(p) => dir.strip_prefix(p.as_str())?.strip_prefix('/')?,
            None => dir,
        };
        let mut parsed = Parsed::new();
        chrono::format::parse(&mut parsed, timepart, self.items.iter()).ok()?;
        if let Ok(dt) = parsed.to_datetime_with_timezone(&Utc) {
            return Some(dt);
        }
        let date = parsed.to_naive_date().ok()?;
        let time = parsed.to_naive_time().unwrap_or(NaiveTime::MIN);
        Some(Utc.from_utc_datetime(&date.and_time(time)))
    }

    /// The same format nested under a shard id.
    pub(crate) fn with_shard_prefix(&self, shard: char) -> Self {
        let prefix = match &self.prefix {
            Some(p) => format!("{shard}/{p}"),
            None => shard.to_string(),
        };
        Self {
            prefix: Some(prefix),
            items: self.items.clone(),
        }
    }
}
