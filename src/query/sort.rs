//! Sort keys and row ordering.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::{Collection, QueryError, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Key,
    Name,
    Status,
    Loss,
    AvgMs,
    RtoPct,
    UptimePct,
    Streak,
    DownSeconds,
    LastCheckAt,
    Reason,
    Rx,
    Tx,
    AddedAt,
    Level,
}

impl SortKey {
    const COMMON: [(&'static str, SortKey); 13] = [
        ("key", SortKey::Key),
        ("name", SortKey::Name),
        ("status", SortKey::Status),
        ("loss", SortKey::Loss),
        ("avg_ms", SortKey::AvgMs),
        ("rto_pct", SortKey::RtoPct),
        ("uptime_pct", SortKey::UptimePct),
        ("streak", SortKey::Streak),
        ("down_seconds", SortKey::DownSeconds),
        ("last_check_at", SortKey::LastCheckAt),
        ("reason", SortKey::Reason),
        ("rx", SortKey::Rx),
        ("tx", SortKey::Tx),
    ];

    const WATCH: [(&'static str, SortKey); 2] = [("added_at", SortKey::AddedAt), ("level", SortKey::Level)];

    /// Resolve a sort key against the allow-list of `collection`.
    pub fn parse(s: &str, collection: Collection) -> Result<Self, QueryError> {
        let wanted = s.trim().to_ascii_lowercase();
        let watch: &[(&str, SortKey)] = if collection.is_watch_list() { &Self::WATCH } else { &[] };
        Self::COMMON
            .iter()
            .chain(watch)
            .find(|(name, _)| *name == wanted)
            .map(|(_, key)| *key)
            .ok_or(QueryError::InvalidSortKey(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDir {
    Asc,
    #[default]
    Desc,
}

impl SortDir {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Some(SortDir::Asc),
            "desc" => Some(SortDir::Desc),
            _ => None,
        }
    }
}

/// Compare present values in `dir`; missing values always sort last.
fn cmp_present<T: PartialOrd>(a: Option<T>, b: Option<T>, dir: SortDir) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => {
            let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
            match dir {
                SortDir::Asc => ord,
                SortDir::Desc => ord.reverse(),
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Row ordering for `key`/`dir`, tie-broken by entity key ascending.
pub fn compare_rows(a: &Row, b: &Row, key: SortKey, dir: SortDir) -> Ordering {
    let primary = match key {
        SortKey::Key => cmp_present(Some(a.key.as_str()), Some(b.key.as_str()), dir),
        SortKey::Name => cmp_present(
            Some(a.name.to_lowercase()),
            Some(b.name.to_lowercase()),
            dir,
        ),
        SortKey::Status => cmp_present(Some(a.status.rank()), Some(b.status.rank()), dir),
        SortKey::Loss => cmp_present(a.stats.loss_avg, b.stats.loss_avg, dir),
        SortKey::AvgMs => cmp_present(a.stats.avg_ms, b.stats.avg_ms, dir),
        SortKey::RtoPct => cmp_present(a.stats.rto_pct, b.stats.rto_pct, dir),
        SortKey::UptimePct => cmp_present(a.stats.uptime_pct, b.stats.uptime_pct, dir),
        SortKey::Streak => cmp_present(Some(a.streak), Some(b.streak), dir),
        SortKey::DownSeconds => cmp_present(Some(a.stats.down_seconds), Some(b.stats.down_seconds), dir),
        SortKey::LastCheckAt => cmp_present(a.stats.last_check_at, b.stats.last_check_at, dir),
        SortKey::Reason => cmp_present(a.reason, b.reason, dir),
        SortKey::Rx => cmp_present(a.stats.rx_dbm, b.stats.rx_dbm, dir),
        SortKey::Tx => cmp_present(a.stats.tx_dbm, b.stats.tx_dbm, dir),
        SortKey::AddedAt => cmp_present(
            a.watch.as_ref().map(|w| w.added_at),
            b.watch.as_ref().map(|w| w.added_at),
            dir,
        ),
        SortKey::Level => cmp_present(
            a.watch.as_ref().map(|w| w.level),
            b.watch.as_ref().map(|w| w.level),
            dir,
        ),
    };
    primary.then_with(|| a.key.cmp(&b.key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_key_allow_lists() {
        assert_eq!(SortKey::parse(" Avg_Ms ", Collection::Issues).unwrap(), SortKey::AvgMs);
        assert_eq!(SortKey::parse("level", Collection::Level2).unwrap(), SortKey::Level);
        assert!(matches!(
            SortKey::parse("level", Collection::Stable),
            Err(QueryError::InvalidSortKey(k)) if k == "level"
        ));
        assert!(SortKey::parse("", Collection::All).is_err());
    }

    #[test]
    fn test_sort_dir() {
        assert_eq!(SortDir::parse("ASC"), Some(SortDir::Asc));
        assert_eq!(SortDir::parse("sideways"), None);
        assert_eq!(SortDir::default(), SortDir::Desc);
    }

    #[test]
    fn test_missing_last_in_both_directions() {
        assert_eq!(cmp_present(Some(1.0), None, SortDir::Asc), Ordering::Less);
        assert_eq!(cmp_present(Some(1.0), None, SortDir::Desc), Ordering::Less);
        assert_eq!(cmp_present(Some(1.0), Some(2.0), SortDir::Desc), Ordering::Greater);
    }
}
