//! Filtered, sorted, paginated views over classified entities.

mod page;
mod sort;

pub use page::*;
pub use sort::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::classify::{Classifier, MetricScope, OpticalFlags, Reason, Status, WindowStats};
use crate::surveillance::{AddedMode, Level, SurveillanceManager, WatchEntry};
use crate::telemetry::{EntityInfo, EntityKey, EntityKind, EntityRegistry, Horizon, RollupStore, WindowError};
use crate::trend::{Spark, TrendMetric, TrendSummarizer};

const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("invalid sort key: {0}")]
    InvalidSortKey(String),
    #[error(transparent)]
    InvalidWindow(#[from] WindowError),
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    All,
    Issues,
    Monitor,
    Stable,
    Pending,
    Up,
    Down,
    /// Level 1 watch-list entries.
    Surveillance,
    Level2,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::All => "all",
            Collection::Issues => "issues",
            Collection::Monitor => "monitor",
            Collection::Stable => "stable",
            Collection::Pending => "pending",
            Collection::Up => "up",
            Collection::Down => "down",
            Collection::Surveillance => "surveillance",
            Collection::Level2 => "level2",
        }
    }

    pub fn is_watch_list(self) -> bool {
        matches!(self, Collection::Surveillance | Collection::Level2)
    }

    fn admits(self, status: Status, watch: Option<&WatchInfo>) -> bool {
        match self {
            Collection::All => true,
            Collection::Issues => status == Status::Issue,
            Collection::Monitor => status == Status::Monitor,
            Collection::Stable => status == Status::Stable,
            Collection::Pending => status == Status::Pending,
            Collection::Up => status == Status::Up,
            Collection::Down => status == Status::Down,
            Collection::Surveillance => watch.is_some_and(|w| w.level == Level::Under),
            Collection::Level2 => watch.is_some_and(|w| w.level == Level::Level2),
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Collection::All),
            "issues" | "issue" => Ok(Collection::Issues),
            "monitor" => Ok(Collection::Monitor),
            "stable" => Ok(Collection::Stable),
            "pending" => Ok(Collection::Pending),
            "up" => Ok(Collection::Up),
            "down" => Ok(Collection::Down),
            "surveillance" | "under" | "level1" => Ok(Collection::Surveillance),
            "level2" => Ok(Collection::Level2),
            _ => Err(QueryError::UnknownCollection(s.to_string())),
        }
    }
}

/// Raw query-string parameters, as sent by the presentation layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryParams {
    pub window: Option<String>,
    pub q: Option<String>,
    pub sort: Option<String>,
    pub dir: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub collection: Collection,
    pub window: Horizon,
    pub filter: String,
    pub sort: SortKey,
    pub dir: SortDir,
    pub page: usize,
    pub page_size: usize,
}

impl QueryRequest {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            window: Horizon::default(),
            filter: String::new(),
            sort: SortKey::Status,
            dir: SortDir::default(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Validate raw parameters. An unknown `dir` falls back to the default.
    pub fn parse(collection: &str, params: &QueryParams) -> Result<Self, QueryError> {
        let collection: Collection = collection.parse()?;
        let mut req = Self::new(collection);

        if let Some(window) = params.window.as_deref().filter(|w| !w.trim().is_empty()) {
            req.window = window.parse()?;
        }
        if let Some(q) = &params.q {
            req.filter = q.trim().to_string();
        }
        if let Some(sort) = params.sort.as_deref().filter(|s| !s.trim().is_empty()) {
            req.sort = SortKey::parse(sort, collection)?;
        }
        if let Some(dir) = params.dir.as_deref().and_then(SortDir::parse) {
            req.dir = dir;
        }
        if let Some(page) = params.page {
            req.page = page;
        }
        if let Some(page_size) = params.page_size {
            req.page_size = page_size;
        }
        Ok(req)
    }
}

/// Watch-list membership shown alongside a row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchInfo {
    pub added_mode: AddedMode,
    pub added_at: DateTime<Utc>,
    pub level: Level,
    pub level2_at: Option<DateTime<Utc>>,
}

impl From<&WatchEntry> for WatchInfo {
    fn from(e: &WatchEntry) -> Self {
        Self {
            added_mode: e.added_mode,
            added_at: e.added_at,
            level: e.level,
            level2_at: e.level2_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub key: EntityKey,
    pub name: String,
    pub kind: EntityKind,
    pub ip: Option<String>,
    pub status: Status,
    /// Label of the primary reason.
    pub reason: Option<&'static str>,
    pub reasons: Vec<Reason>,
    pub streak: u32,
    pub since: Option<DateTime<Utc>>,
    pub stats: WindowStats,
    pub flags: OpticalFlags,
    pub watch: Option<WatchInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spark: Option<Spark>,
}

impl Row {
    fn matches(&self, needle: &str, info: &EntityInfo) -> bool {
        if needle.is_empty() {
            return true;
        }
        let fields = [
            Some(self.key.as_str()),
            Some(self.name.as_str()),
            self.ip.as_deref(),
            Some(self.kind.as_str()),
            info.device_class.as_deref(),
        ];
        fields
            .into_iter()
            .flatten()
            .any(|field| field.to_lowercase().contains(needle))
    }
}

/// Per-status counts for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub window: Horizon,
    pub total: usize,
    pub by_status: BTreeMap<Status, usize>,
    pub surveillance: usize,
    pub level2: usize,
}

pub struct QueryEngine {
    registry: Arc<EntityRegistry>,
    rollups: Arc<RollupStore>,
    classifier: Arc<Classifier>,
    surveillance: Arc<SurveillanceManager>,
    trend: Arc<TrendSummarizer>,
}

impl QueryEngine {
    pub fn new(
        registry: Arc<EntityRegistry>,
        rollups: Arc<RollupStore>,
        classifier: Arc<Classifier>,
        surveillance: Arc<SurveillanceManager>,
        trend: Arc<TrendSummarizer>,
    ) -> Self {
        Self {
            registry,
            rollups,
            classifier,
            surveillance,
            trend,
        }
    }

    /// Every entity the core knows about, registered or not.
    fn known_entities(&self) -> Vec<EntityInfo> {
        let mut known: HashMap<EntityKey, EntityInfo> = self
            .registry
            .all()
            .into_iter()
            .map(|info| (info.key.clone(), info))
            .collect();

        let stray = self
            .rollups
            .keys()
            .into_iter()
            .chain(self.surveillance.entries().into_iter().map(|e| e.key));
        for key in stray {
            if !known.contains_key(&key) {
                let kind = self
                    .rollups
                    .latest(&key)
                    .map(|s| EntityKind::infer(&s))
                    .unwrap_or(EntityKind::AccountPing);
                known.insert(key.clone(), EntityInfo::new(key, kind));
            }
        }
        known.into_values().collect()
    }

    fn row(&self, info: &EntityInfo, window: Horizon, watch: Option<WatchInfo>, now: DateTime<Utc>) -> Row {
        let record = self.classifier.classify_at(&info.key, window, MetricScope::All, now);
        Row {
            key: info.key.clone(),
            name: info.display_name().to_string(),
            kind: info.kind,
            ip: info.ip.clone(),
            status: record.status,
            reason: record.primary_reason().map(Reason::label),
            streak: record.streak,
            since: record.since,
            stats: record.stats,
            flags: record.flags,
            reasons: record.reasons,
            watch,
            spark: None,
        }
    }

    pub fn query(&self, req: &QueryRequest) -> Page<Row> {
        self.query_at(req, Utc::now())
    }

    pub fn query_at(&self, req: &QueryRequest, now: DateTime<Utc>) -> Page<Row> {
        let watched: HashMap<EntityKey, WatchInfo> = self
            .surveillance
            .entries()
            .iter()
            .map(|e| (e.key.clone(), WatchInfo::from(e)))
            .collect();
        let needle = req.filter.to_lowercase();

        let mut rows: Vec<Row> = self
            .known_entities()
            .into_iter()
            .filter(|info| !req.collection.is_watch_list() || watched.contains_key(&info.key))
            .filter_map(|info| {
                let watch = watched.get(&info.key).cloned();
                let row = self.row(&info, req.window, watch, now);
                (req.collection.admits(row.status, row.watch.as_ref()) && row.matches(&needle, &info))
                    .then_some(row)
            })
            .collect();

        rows.sort_by(|a, b| compare_rows(a, b, req.sort, req.dir));

        let mut page = paginate(rows, req.page, req.page_size);
        for row in &mut page.rows {
            let metric = TrendMetric::default_for(row.kind);
            let spark = self.trend.spark_at(&row.key, req.window, metric, None, now);
            row.spark = Some(spark.points_only());
        }
        page
    }

    pub fn summary(&self, window: Horizon) -> Summary {
        self.summary_at(window, Utc::now())
    }

    pub fn summary_at(&self, window: Horizon, now: DateTime<Utc>) -> Summary {
        let mut by_status = BTreeMap::new();
        let entities = self.known_entities();
        for info in &entities {
            let record = self.classifier.classify_at(&info.key, window, MetricScope::All, now);
            *by_status.entry(record.status).or_insert(0) += 1;
        }
        let entries = self.surveillance.entries();
        let level2 = entries.iter().filter(|e| e.level == Level::Level2).count();

        Summary {
            window,
            total: entities.len(),
            by_status,
            surveillance: entries.len() - level2,
            level2,
        }
    }
}
