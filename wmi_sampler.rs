//! # WMI Sampler - Performance Counter Sampling
//!
//! A lightweight sampler for WMI-style instrumentation providers. It queries a
//! provider class, keeps the previous and current raw snapshots, and turns raw
//! performance counters into rates and percentages.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              WMI SAMPLER                                     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  FILTERS → QUERY ENGINE → CONNECTION POOL → PROVIDER → SAMPLES → FORMATTING │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Raw & Formatted classes**: `Win32_PerfRawData_*` classes are sampled twice
//!   and formatted from the previous/current pair
//! - **Counter type discovery**: each property's `CounterType` qualifier is read
//!   once and cached for the lifetime of the sampler
//! - **Shared connections**: provider connections are pooled per
//!   (host, namespace, username) and reused across samplers
//! - **Cheap queries**: forward-only, return-immediately enumeration
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// All external crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::ops::{BitOr, BitOrAssign, Deref};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::time::{interval, sleep, timeout};

// ----------------------------------------------------------------------------
// Concurrency Primitives - Crossbeam & Parking Lot
// ----------------------------------------------------------------------------
use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Lock-Free Data Structures
// ----------------------------------------------------------------------------
use arc_swap::ArcSwap;
use dashmap::DashMap;
use once_cell::sync::OnceCell;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::RandomState as AHashRandomState;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Async Traits & Futures
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use futures::future::join_all;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Sampler version - follows semantic versioning
pub const SAMPLER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SAMPLER_NAME: &str = "wmi-sampler";
pub const SAMPLER_FULL_NAME: &str = "WMI Performance Counter Sampler";

// ----------------------------------------------------------------------------
// Connection Defaults
// ----------------------------------------------------------------------------

/// Default provider host
pub const DEFAULT_HOST: &str = "localhost";

/// Default provider namespace
pub const DEFAULT_NAMESPACE: &str = "root\\cimv2";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default query timeout (seconds)
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 10;

/// Minimum allowed query timeout (milliseconds)
pub const MIN_QUERY_TIMEOUT_MS: u64 = 100;

/// Maximum allowed query timeout (seconds)
pub const MAX_QUERY_TIMEOUT_SECS: u64 = 600;

/// Default interval between two samples (milliseconds)
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 15_000;

/// Minimum allowed interval between two samples (milliseconds)
pub const MIN_SAMPLE_INTERVAL_MS: u64 = 100;

/// Queries slower than this are logged at warn level (milliseconds)
pub const SLOW_QUERY_THRESHOLD_MS: u64 = 1_000;

// ----------------------------------------------------------------------------
// Provider Conventions
// ----------------------------------------------------------------------------

/// Class name marker of raw performance counter classes (upper case)
pub const RAW_PERF_CLASS_MARKER: &str = "_PERFRAWDATA_";

/// System timestamp in 100ns units, required by time based calculators
pub const TIMESTAMP_SYS100NS: &str = "Timestamp_Sys100NS";

/// Frequency of `Timestamp_Sys100NS`
pub const FREQUENCY_SYS100NS: &str = "Frequency_Sys100NS";

/// Qualifier carrying the counter type of a raw property
pub const COUNTER_TYPE_QUALIFIER: &str = "CounterType";

/// Suffix of the companion base property used by fraction counters
pub const BASE_PROPERTY_SUFFIX: &str = "_Base";

/// Wildcard marker switching a filter to `LIKE`
pub const FILTER_WILDCARD: char = '%';

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The data types every sampled record flows through:
// - PropertyValue: one scalar reported by the provider
// - PropertyBag: a case-insensitive row of properties
// - Sample: one query's full result set
// - CounterType / CounterTypeMap: provider counter type tags
// ============================================================================

/// Hasher used for small lookup tables
pub type FastMap<K, V> = HashMap<K, V, AHashRandomState>;

// ----------------------------------------------------------------------------
// 3.1 Property Values
// ----------------------------------------------------------------------------

/// A scalar property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Integer(i64),
    Unsigned(u64),
    Number(f64),
    Text(String),
}

impl PropertyValue {
    /// Numeric view of the value, if it has one.
    ///
    /// Booleans count as `1.0`/`0.0` and numeric text is parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Null => None,
            PropertyValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            PropertyValue::Integer(i) => Some(*i as f64),
            PropertyValue::Unsigned(u) => Some(*u as f64),
            PropertyValue::Number(n) => Some(*n),
            PropertyValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Coerce to `Number` when possible, otherwise keep the original value.
    pub fn coerce_numeric(self) -> PropertyValue {
        match self.as_f64() {
            Some(n) => PropertyValue::Number(n),
            None => self,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }
}

impl Default for PropertyValue {
    fn default() -> Self {
        PropertyValue::Null
    }
}

impl Display for PropertyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "null"),
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Integer(i) => write!(f, "{}", i),
            PropertyValue::Unsigned(u) => write!(f, "{}", u),
            PropertyValue::Number(n) => write!(f, "{}", n),
            PropertyValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Integer(v as i64)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Integer(v)
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        PropertyValue::Unsigned(v as u64)
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::Unsigned(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Number(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(PropertyValue::Null)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Case-Insensitive Property Bag
// ----------------------------------------------------------------------------

/// A row of properties keyed case-insensitively.
///
/// Keys are stored lowercased, so `"FreeMegabytes"` and `"freemegabytes"`
/// address the same entry and two bags built with different casings compare
/// equal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyBag {
    entries: BTreeMap<CompactString, PropertyValue>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bag with every given property present and set to `Null`.
    pub fn with_properties<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|name| (name, PropertyValue::Null))
            .collect()
    }

    fn canonical_key(key: &str) -> CompactString {
        CompactString::from(key.to_lowercase())
    }

    /// Insert a value, returning the previous one for that key.
    pub fn insert(&mut self, key: &str, value: impl Into<PropertyValue>) -> Option<PropertyValue> {
        self.entries.insert(Self::canonical_key(key), value.into())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.get(Self::canonical_key(key).as_str())
    }

    /// Numeric view of a property.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(PropertyValue::as_f64)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(Self::canonical_key(key).as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.entries.remove(Self::canonical_key(key).as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over (lowercased name, value) pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }
}

impl<K, V> FromIterator<(K, V)> for PropertyBag
where
    K: AsRef<str>,
    V: Into<PropertyValue>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut bag = PropertyBag::new();
        for (key, value) in iter {
            bag.insert(key.as_ref(), value);
        }
        bag
    }
}

impl Display for PropertyBag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", key, value)?;
        }
        write!(f, "}}")
    }
}

impl Serialize for PropertyBag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PropertyBag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, PropertyValue>::deserialize(deserializer)?;
        Ok(raw.into_iter().collect())
    }
}

// ----------------------------------------------------------------------------
// 3.3 Samples
// ----------------------------------------------------------------------------

/// One query's result set, in provider enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sample {
    rows: Vec<PropertyBag>,
}

impl Sample {
    pub fn new(rows: Vec<PropertyBag>) -> Self {
        Self { rows }
    }

    pub fn into_rows(self) -> Vec<PropertyBag> {
        self.rows
    }
}

impl Deref for Sample {
    type Target = [PropertyBag];

    fn deref(&self) -> &Self::Target {
        &self.rows
    }
}

impl FromIterator<PropertyBag> for Sample {
    fn from_iter<T: IntoIterator<Item = PropertyBag>>(iter: T) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Sample {
    type Item = &'a PropertyBag;
    type IntoIter = std::slice::Iter<'a, PropertyBag>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", row)?;
        }
        write!(f, "]")
    }
}

// ----------------------------------------------------------------------------
// 3.4 Counter Types
// ----------------------------------------------------------------------------

/// Provider counter type tag (the `CounterType` qualifier of a raw property).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CounterType(u32);

impl CounterType {
    pub const PERF_COUNTER_RAWCOUNT: Self = Self(65536);
    pub const PERF_COUNTER_LARGE_RAWCOUNT: Self = Self(65792);
    pub const PERF_COUNTER_COUNTER: Self = Self(272696320);
    pub const PERF_COUNTER_BULK_COUNT: Self = Self(272696576);
    pub const PERF_RAW_FRACTION: Self = Self(537003008);
    pub const PERF_100NSEC_TIMER: Self = Self(542180608);
    pub const PERF_PRECISION_100NS_TIMER: Self = Self(542573824);
    pub const PERF_100NSEC_TIMER_INV: Self = Self(558957824);
    pub const PERF_AVERAGE_BULK: Self = Self(1073874176);

    pub const fn new(tag: u32) -> Self {
        Self(tag)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Well-known name of the counter type.
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::PERF_COUNTER_RAWCOUNT => Some("PERF_COUNTER_RAWCOUNT"),
            Self::PERF_COUNTER_LARGE_RAWCOUNT => Some("PERF_COUNTER_LARGE_RAWCOUNT"),
            Self::PERF_COUNTER_COUNTER => Some("PERF_COUNTER_COUNTER"),
            Self::PERF_COUNTER_BULK_COUNT => Some("PERF_COUNTER_BULK_COUNT"),
            Self::PERF_RAW_FRACTION => Some("PERF_RAW_FRACTION"),
            Self::PERF_100NSEC_TIMER => Some("PERF_100NSEC_TIMER"),
            Self::PERF_PRECISION_100NS_TIMER => Some("PERF_PRECISION_100NS_TIMER"),
            Self::PERF_100NSEC_TIMER_INV => Some("PERF_100NSEC_TIMER_INV"),
            Self::PERF_AVERAGE_BULK => Some("PERF_AVERAGE_BULK"),
            _ => None,
        }
    }

    /// Read a counter type from a qualifier value.
    pub fn from_qualifier(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Integer(i) => u32::try_from(*i).ok().map(Self),
            PropertyValue::Unsigned(u) => u32::try_from(*u).ok().map(Self),
            PropertyValue::Number(n) if n.fract() == 0.0 && *n >= 0.0 && *n <= u32::MAX as f64 => {
                Some(Self(*n as u32))
            }
            PropertyValue::Text(s) => s.trim().parse::<u32>().ok().map(Self),
            _ => None,
        }
    }
}

impl Display for CounterType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<u32> for CounterType {
    fn from(tag: u32) -> Self {
        Self(tag)
    }
}

/// Property name → counter type, keyed case-insensitively.
///
/// A property without an entry is reported as-is (raw passthrough).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterTypeMap {
    types: FastMap<CompactString, CounterType>,
}

impl CounterTypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, property: &str) -> Option<CounterType> {
        self.types
            .get(PropertyBag::canonical_key(property).as_str())
            .copied()
    }

    pub fn contains(&self, property: &str) -> bool {
        self.types
            .contains_key(PropertyBag::canonical_key(property).as_str())
    }

    /// Record a counter type. An already cached property keeps its type.
    pub fn insert(&mut self, property: &str, counter_type: CounterType) -> bool {
        let key = PropertyBag::canonical_key(property);
        if self.types.contains_key(key.as_str()) {
            return false;
        }
        self.types.insert(key, counter_type);
        true
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, CounterType)> {
        self.types.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Whether `class_name` names a raw performance counter class.
pub fn is_raw_perf_class(class_name: &str) -> bool {
    class_name
        .to_ascii_uppercase()
        .contains(RAW_PERF_CLASS_MARKER)
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every layer of the sampler:
// - Connection errors are surfaced to the caller
// - Provider faults degrade to an empty sample
// - Timeouts and state violations are always propagated
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Recovery Hints
// ----------------------------------------------------------------------------

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Reconnect to the provider
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
}

// ----------------------------------------------------------------------------
// 4.2 Connection Errors
// ----------------------------------------------------------------------------

/// Errors establishing a provider connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection to {key} failed: {message}")]
    ConnectFailed { key: ConnectionKey, message: String },

    #[error("Access denied for {key}: {message}")]
    AccessDenied { key: ConnectionKey, message: String },

    #[error("Invalid namespace '{namespace}' on host '{host}'")]
    InvalidNamespace { host: String, namespace: String },
}

impl ConnectionError {
    pub fn connect_failed(key: ConnectionKey, message: impl Into<String>) -> Self {
        ConnectionError::ConnectFailed {
            key,
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConnectionError::ConnectFailed { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.3 Provider Faults
// ----------------------------------------------------------------------------

/// A query failed at the provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Provider fault 0x{code:08X}: {message}")]
pub struct ProviderFault {
    pub code: u32,
    pub message: String,
}

impl ProviderFault {
    /// Generic failure
    pub const WBEM_E_FAILED: u32 = 0x8004_1001;
    /// Class does not exist
    pub const WBEM_E_INVALID_CLASS: u32 = 0x8004_1010;
    /// Malformed query text
    pub const WBEM_E_INVALID_QUERY: u32 = 0x8004_1017;

    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(Self::WBEM_E_FAILED, message)
    }
}

// ----------------------------------------------------------------------------
// 4.4 Query Errors
// ----------------------------------------------------------------------------

/// Errors from the query engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderFault),

    #[error("Query against '{class_name}' timed out after {timeout_ms}ms")]
    Timeout { class_name: String, timeout_ms: u64 },
}

// ----------------------------------------------------------------------------
// 4.5 Sampler Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by a sampler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SamplerError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderFault),

    #[error("Query against '{class_name}' timed out after {timeout_ms}ms")]
    QueryTimeout { class_name: String, timeout_ms: u64 },

    #[error("Cannot {operation} while a sample is in flight")]
    InvalidState { operation: &'static str },

    #[error("Index {index} is out of range (sample holds {len} objects)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<QueryError> for SamplerError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Connection(e) => SamplerError::Connection(e),
            QueryError::Provider(e) => SamplerError::Provider(e),
            QueryError::Timeout {
                class_name,
                timeout_ms,
            } => SamplerError::QueryTimeout {
                class_name,
                timeout_ms,
            },
        }
    }
}

impl SamplerError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            SamplerError::Connection(e) => e.is_recoverable(),
            SamplerError::Provider(_) => true,
            SamplerError::QueryTimeout { .. } => true,
            SamplerError::InvalidState { .. } => false,
            SamplerError::IndexOutOfRange { .. } => true,
            SamplerError::Config(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            SamplerError::Connection(_) => "connection",
            SamplerError::Provider(_) => "provider",
            SamplerError::QueryTimeout { .. } => "timeout",
            SamplerError::InvalidState { .. } => "state",
            SamplerError::IndexOutOfRange { .. } => "index",
            SamplerError::Config(_) => "config",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            SamplerError::Connection(_) => RecoveryHint::Reconnect,
            SamplerError::Provider(_) => RecoveryHint::RetryWithBackoff,
            SamplerError::QueryTimeout { .. } => RecoveryHint::RetryWithBackoff,
            SamplerError::InvalidState { .. } => RecoveryHint::None,
            SamplerError::IndexOutOfRange { .. } => RecoveryHint::Skip,
            SamplerError::Config(_) => RecoveryHint::FixConfiguration,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Calculator Errors
// ----------------------------------------------------------------------------

/// No calculator is registered for a counter type.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Undefined calculator for counter type {counter_type}")]
pub struct UndefinedCalculator {
    pub counter_type: CounterType,
}

// ----------------------------------------------------------------------------
// 4.7 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.8 Application Errors
// ----------------------------------------------------------------------------

/// Top-level error type of the command line application.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config",
            AppError::Sampler(e) => e.category(),
            AppError::Io(_) => "io",
            AppError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.9 Result Type Aliases
// ----------------------------------------------------------------------------

/// Result type for sampler operations
pub type SamplerResult<T> = Result<T, SamplerError>;

/// Result type for query engine operations
pub type QueryResult<T> = Result<T, QueryError>;

/// Result type for the application layer
pub type AppResult<T> = Result<T, AppError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// - TOML file parsing
// - Environment variable overrides (WMI_SAMPLER_ prefix, `__` nesting)
// - Validation
// - Sensible defaults
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration of the sampler application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Replay provider settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplayConfig>,

    /// Sampler definitions
    #[serde(default)]
    pub samplers: Vec<SamplerConfig>,
}

impl AppConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("WMI_SAMPLER_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.interval < Duration::from_millis(MIN_SAMPLE_INTERVAL_MS) {
            return Err(ConfigError::invalid_value(
                "general.interval",
                format!("Sample interval must be at least {}ms", MIN_SAMPLE_INTERVAL_MS),
            ));
        }

        for (i, sampler) in self.samplers.iter().enumerate() {
            sampler.validate().map_err(|e| match e {
                ConfigError::InvalidValue { field, message } => {
                    ConfigError::invalid_value(format!("samplers[{}].{}", i, field), message)
                }
                ConfigError::MissingField { field } => {
                    ConfigError::missing_field(format!("samplers[{}].{}", i, field))
                }
                other => other,
            })?;
        }

        Ok(())
    }

    /// A configuration with one processor sampler, used for generated files
    pub fn example() -> Self {
        Self {
            samplers: vec![SamplerConfig::new("Win32_PerfRawData_PerfOS_Processor")
                .with_name("processor")
                .with_properties(["Name", "PercentProcessorTime", "PercentUserTime"])
                .with_filters(FilterSpec::new().or(FilterGroup::new().with("Name", "_Total")))],
            ..Self::default()
        }
    }

    /// Render the example configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Configuration
// ----------------------------------------------------------------------------

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Instance name (for identification in logs)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Interval between two samples
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            interval: default_sample_interval(),
        }
    }
}

fn default_instance_name() -> String {
    SAMPLER_NAME.into()
}

fn default_sample_interval() -> Duration {
    Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS)
}

// ----------------------------------------------------------------------------
// 5.3 Sampler Configuration
// ----------------------------------------------------------------------------

/// Construction-time settings of one sampler
#[derive(Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Display name (defaults to the class name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Provider class to query
    pub class_name: String,

    /// Properties to select
    #[serde(default)]
    pub properties: Vec<String>,

    /// Host of the provider
    #[serde(default = "default_host")]
    pub host: String,

    /// Provider namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: String,

    /// Properties whose list filters are AND-joined instead of OR-joined
    #[serde(default)]
    pub and_props: Vec<String>,

    /// Deadline of one provider query
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Query filters
    #[serde(default)]
    pub filters: FilterSpec,
}

impl SamplerConfig {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            name: None,
            class_name: class_name.into(),
            properties: Vec::new(),
            host: default_host(),
            namespace: default_namespace(),
            username: String::new(),
            password: String::new(),
            and_props: Vec::new(),
            timeout: default_query_timeout(),
            filters: FilterSpec::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = properties.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_filters(mut self, filters: FilterSpec) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_and_props<I, S>(mut self, and_props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.and_props = and_props.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name used in logs and CLI output
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.class_name)
    }

    pub fn is_raw_perf_class(&self) -> bool {
        is_raw_perf_class(&self.class_name)
    }

    /// Pool key of this sampler's connection
    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey::new(&self.host, &self.namespace, &self.username)
    }

    /// Validate the sampler settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.class_name.is_empty() {
            return Err(ConfigError::missing_field("class_name"));
        }
        if !is_identifier(&self.class_name) {
            return Err(ConfigError::invalid_value(
                "class_name",
                format!("'{}' is not a valid class name", self.class_name),
            ));
        }

        if self.properties.is_empty() {
            return Err(ConfigError::missing_field("properties"));
        }
        let wildcard = self.properties.len() == 1 && self.properties[0] == "*";
        if !wildcard {
            if let Some(bad) = self.properties.iter().find(|p| !is_identifier(p)) {
                return Err(ConfigError::invalid_value(
                    "properties",
                    format!("'{}' is not a valid property name", bad),
                ));
            }
        }

        if self.timeout < Duration::from_millis(MIN_QUERY_TIMEOUT_MS)
            || self.timeout > Duration::from_secs(MAX_QUERY_TIMEOUT_SECS)
        {
            return Err(ConfigError::invalid_value(
                "timeout",
                format!(
                    "Query timeout must be between {}ms and {}s",
                    MIN_QUERY_TIMEOUT_MS, MAX_QUERY_TIMEOUT_SECS
                ),
            ));
        }

        Ok(())
    }
}

impl Debug for SamplerConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplerConfig")
            .field("name", &self.name)
            .field("class_name", &self.class_name)
            .field("properties", &self.properties)
            .field("host", &self.host)
            .field("namespace", &self.namespace)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("and_props", &self.and_props)
            .field("timeout", &self.timeout)
            .field("filters", &self.filters)
            .finish()
    }
}

fn default_host() -> String {
    DEFAULT_HOST.into()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.into()
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS)
}

/// Class and property names are plain identifiers
fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ----------------------------------------------------------------------------
// 5.4 Replay Configuration
// ----------------------------------------------------------------------------

/// Recorded provider data served by the replay provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// JSON recording: class name → list of snapshots
    pub path: PathBuf,
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging with tracing:
// - Level filtering with RUST_LOG overrides
// - Pretty, compact or JSON output
// - Slow query detection
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> AppResult<()> {
    // Unknown level names fall back to INFO.
    let level_filter = config
        .level
        .trim()
        .parse::<tracing::level_filters::LevelFilter>()
        .unwrap_or(tracing::level_filters::LevelFilter::INFO);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| AppError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| AppError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| AppError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "wmi_sampler::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Performance Timer
// ----------------------------------------------------------------------------

/// A simple timer for measuring operation duration
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    /// Start a new timer
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
        }
    }

    /// Start a timer with a warning threshold
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: Some(threshold_ms),
        }
    }

    /// Get elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "wmi_sampler::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(
            target: "wmi_sampler::perf",
            operation = self.name,
            elapsed_ms = elapsed,
            "Operation completed"
        );

        elapsed
    }
}

// ============================================================================
// SECTION 7: FILTER COMPILER
// ============================================================================
// Structured filters compile to a WQL WHERE clause:
// - groups are OR-joined in declaration order
// - properties inside a group are AND-joined
// - list values are OR-joined, or AND-joined for `and_props` properties
// - a group with no clause matches everything and drops the WHERE clause
// The compiler is a pure fold and never consumes its input.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Comparison Operators
// ----------------------------------------------------------------------------

/// WQL comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ComparisonOp {
    Eq,
    Ne,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    Is,
    IsNot,
    Isa,
}

impl ComparisonOp {
    pub const ALL: [ComparisonOp; 12] = [
        ComparisonOp::Eq,
        ComparisonOp::Ne,
        ComparisonOp::NotEq,
        ComparisonOp::Lt,
        ComparisonOp::Le,
        ComparisonOp::Gt,
        ComparisonOp::Ge,
        ComparisonOp::Like,
        ComparisonOp::NotLike,
        ComparisonOp::Is,
        ComparisonOp::IsNot,
        ComparisonOp::Isa,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "<>",
            ComparisonOp::NotEq => "!=",
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Ge => ">=",
            ComparisonOp::Like => "LIKE",
            ComparisonOp::NotLike => "NOT LIKE",
            ComparisonOp::Is => "IS",
            ComparisonOp::IsNot => "IS NOT",
            ComparisonOp::Isa => "ISA",
        }
    }

    /// LIKE and NOT LIKE already treat `%` as a wildcard
    pub fn is_pattern(self) -> bool {
        matches!(self, ComparisonOp::Like | ComparisonOp::NotLike)
    }
}

impl Display for ComparisonOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComparisonOp {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();

        ComparisonOp::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == normalized)
            .ok_or_else(|| ConfigError::invalid_value("filters", format!("unknown operator '{}'", s)))
    }
}

impl TryFrom<String> for ComparisonOp {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ComparisonOp> for String {
    fn from(op: ComparisonOp) -> Self {
        op.as_str().to_string()
    }
}

// ----------------------------------------------------------------------------
// 7.2 Filter Values
// ----------------------------------------------------------------------------

/// A literal compared against a property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterLiteral {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl FilterLiteral {
    /// Textual literals containing `%` match with LIKE
    pub fn implicit_op(&self) -> ComparisonOp {
        match self {
            FilterLiteral::Text(s) if s.contains(FILTER_WILDCARD) => ComparisonOp::Like,
            _ => ComparisonOp::Eq,
        }
    }

    /// Single-quoted WQL rendering
    pub fn quoted(&self) -> String {
        let raw = match self {
            FilterLiteral::Bool(true) => "TRUE".to_string(),
            FilterLiteral::Bool(false) => "FALSE".to_string(),
            FilterLiteral::Integer(i) => i.to_string(),
            FilterLiteral::Number(n) => n.to_string(),
            FilterLiteral::Text(s) => s.clone(),
        };

        let mut out = String::with_capacity(raw.len() + 2);
        out.push('\'');
        for c in raw.chars() {
            if c == '\\' || c == '\'' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('\'');
        out
    }
}

/// An explicit operator applied to a literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterComparison {
    pub op: ComparisonOp,
    pub value: FilterLiteral,
}

impl FilterComparison {
    pub fn new(op: ComparisonOp, value: impl Into<FilterLiteral>) -> Self {
        Self {
            op,
            value: value.into(),
        }
    }
}

/// An explicit operator applied to each literal of a list.
///
/// Textual literals containing `%` switch to LIKE unless the operator is
/// already a pattern match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterListComparison {
    pub op: ComparisonOp,
    #[serde(rename = "value")]
    pub values: Vec<FilterLiteral>,
}

impl FilterListComparison {
    pub fn new<I, T>(op: ComparisonOp, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<FilterLiteral>,
    {
        Self {
            op,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn render(&self, property: &str) -> SmallVec<[String; 4]> {
        self.values
            .iter()
            .map(|lit| {
                let op = if !self.op.is_pattern() && lit.implicit_op() == ComparisonOp::Like {
                    ComparisonOp::Like
                } else {
                    self.op
                };
                format!("{} {} {}", property, op, lit.quoted())
            })
            .collect()
    }
}

/// One element of a list value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterItem {
    Compare(FilterComparison),
    Literal(FilterLiteral),
}

impl FilterItem {
    pub fn compare(op: ComparisonOp, value: impl Into<FilterLiteral>) -> Self {
        FilterItem::Compare(FilterComparison::new(op, value))
    }

    fn render(&self, property: &str) -> String {
        match self {
            FilterItem::Compare(cmp) => format!("{} {} {}", property, cmp.op, cmp.value.quoted()),
            FilterItem::Literal(lit) => format!("{} {} {}", property, lit.implicit_op(), lit.quoted()),
        }
    }
}

/// The value a property is filtered by
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Compare(FilterComparison),
    CompareEach(FilterListComparison),
    List(Vec<FilterItem>),
    Literal(FilterLiteral),
}

impl FilterValue {
    pub fn compare(op: ComparisonOp, value: impl Into<FilterLiteral>) -> Self {
        FilterValue::Compare(FilterComparison::new(op, value))
    }

    pub fn compare_each<I, T>(op: ComparisonOp, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<FilterLiteral>,
    {
        FilterValue::CompareEach(FilterListComparison::new(op, values))
    }

    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<FilterItem>,
    {
        FilterValue::List(items.into_iter().map(Into::into).collect())
    }
}

macro_rules! impl_filter_literal_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for FilterLiteral {
                fn from(v: $ty) -> Self {
                    FilterLiteral::$variant(v.into())
                }
            }

            impl From<$ty> for FilterItem {
                fn from(v: $ty) -> Self {
                    FilterItem::Literal(v.into())
                }
            }

            impl From<$ty> for FilterValue {
                fn from(v: $ty) -> Self {
                    FilterValue::Literal(v.into())
                }
            }
        )*
    };
}

impl_filter_literal_from! {
    bool => Bool,
    i32 => Integer,
    i64 => Integer,
    u32 => Integer,
    f64 => Number,
    &str => Text,
    String => Text,
}

impl From<FilterLiteral> for FilterItem {
    fn from(v: FilterLiteral) -> Self {
        FilterItem::Literal(v)
    }
}

impl From<FilterLiteral> for FilterValue {
    fn from(v: FilterLiteral) -> Self {
        FilterValue::Literal(v)
    }
}

impl From<FilterComparison> for FilterItem {
    fn from(v: FilterComparison) -> Self {
        FilterItem::Compare(v)
    }
}

impl From<FilterComparison> for FilterValue {
    fn from(v: FilterComparison) -> Self {
        FilterValue::Compare(v)
    }
}

impl From<FilterListComparison> for FilterValue {
    fn from(v: FilterListComparison) -> Self {
        FilterValue::CompareEach(v)
    }
}

impl From<Vec<FilterItem>> for FilterValue {
    fn from(v: Vec<FilterItem>) -> Self {
        FilterValue::List(v)
    }
}

// ----------------------------------------------------------------------------
// 7.3 Filter Groups & Specs
// ----------------------------------------------------------------------------

/// Ordered property → value mapping; its clauses are AND-joined
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterGroup {
    entries: Vec<(String, FilterValue)>,
}

impl FilterGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, property: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.entries.push((property.into(), value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for FilterGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.entries.iter().map(|(k, v)| (k, v)))
    }
}

struct FilterGroupVisitor;

impl<'de> Visitor<'de> for FilterGroupVisitor {
    type Value = FilterGroup;

    fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("a map of property names to filter values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, value)) = map.next_entry::<String, FilterValue>()? {
            entries.push((key, value));
        }
        Ok(FilterGroup { entries })
    }
}

impl<'de> Deserialize<'de> for FilterGroup {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(FilterGroupVisitor)
    }
}

/// Ordered sequence of OR-joined filter groups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSpec {
    groups: Vec<FilterGroup>,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_groups(groups: Vec<FilterGroup>) -> Self {
        Self { groups }
    }

    /// Builder-style append of another OR alternative
    pub fn or(mut self, group: FilterGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn groups(&self) -> &[FilterGroup] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 7.4 Compilation
// ----------------------------------------------------------------------------

/// Compile a filter spec into a ` WHERE ...` clause, or `""` when nothing
/// constrains the query.
///
/// A group without any clause matches every instance, so it makes the whole
/// OR chain unconstrained.
pub fn compile_filters<S: AsRef<str>>(spec: &FilterSpec, and_props: &[S]) -> String {
    let groups: Option<SmallVec<[String; 4]>> = spec
        .groups()
        .iter()
        .map(|group| compile_group(group, and_props))
        .collect();

    match groups {
        Some(groups) if !groups.is_empty() => format!(" WHERE {}", groups.join(" OR ")),
        _ => String::new(),
    }
}

fn compile_group<S: AsRef<str>>(group: &FilterGroup, and_props: &[S]) -> Option<String> {
    let clauses: SmallVec<[String; 4]> = group
        .iter()
        .filter_map(|(property, value)| compile_property(property, value, and_props))
        .collect();

    if clauses.is_empty() {
        None
    } else {
        Some(format!("( {} )", clauses.join(" AND ")))
    }
}

fn compile_property<S: AsRef<str>>(property: &str, value: &FilterValue, and_props: &[S]) -> Option<String> {
    match value {
        FilterValue::Literal(lit) => Some(format!("{} {} {}", property, lit.implicit_op(), lit.quoted())),
        FilterValue::Compare(cmp) => Some(format!("{} {} {}", property, cmp.op, cmp.value.quoted())),
        FilterValue::CompareEach(cmp) => join_list(property, cmp.render(property), and_props),
        FilterValue::List(items) => {
            let parts = items.iter().map(|item| item.render(property)).collect();
            join_list(property, parts, and_props)
        }
    }
}

fn join_list<S: AsRef<str>>(property: &str, parts: SmallVec<[String; 4]>, and_props: &[S]) -> Option<String> {
    if parts.is_empty() {
        None
    } else if is_and_property(property, and_props) {
        Some(parts.join(" AND "))
    } else {
        Some(format!("( {} )", parts.join(" OR ")))
    }
}

/// Whether list values of `property` are AND-joined. An empty entry is
/// contained in every name.
fn is_and_property<S: AsRef<str>>(property: &str, and_props: &[S]) -> bool {
    let property = property.to_lowercase();
    and_props
        .iter()
        .any(|p| property.contains(&p.as_ref().to_lowercase()))
}

// ============================================================================
// SECTION 8: PROVIDER INTERFACES
// ============================================================================
// The transport to the instrumentation provider is external. The sampler only
// needs to open connections and run queries through them.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Query Flags
// ----------------------------------------------------------------------------

/// Enumeration flags passed along with a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryFlags(u32);

impl QueryFlags {
    pub const NONE: Self = Self(0);
    /// Return immediately and enumerate semi-synchronously
    pub const RETURN_IMMEDIATELY: Self = Self(0x10);
    /// Forward-only enumerator, no rewinding
    pub const FORWARD_ONLY: Self = Self(0x20);
    /// Include amended (localized) qualifiers such as `CounterType`
    pub const USE_AMENDED_QUALIFIERS: Self = Self(0x20000);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Flags every sampling query runs with
    pub fn sampling_default() -> Self {
        Self::RETURN_IMMEDIATELY | Self::FORWARD_ONLY
    }

    pub fn with_qualifiers(self, include: bool) -> Self {
        if include {
            self | Self::USE_AMENDED_QUALIFIERS
        } else {
            self
        }
    }
}

impl BitOr for QueryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for QueryFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Display for QueryFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

// ----------------------------------------------------------------------------
// 8.2 Provider Rows
// ----------------------------------------------------------------------------

/// One property of a returned object, with its qualifiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderField {
    pub name: String,
    pub value: PropertyValue,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub qualifiers: BTreeMap<String, PropertyValue>,
}

impl ProviderField {
    pub fn new(name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            qualifiers: BTreeMap::new(),
        }
    }

    pub fn with_qualifier(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.qualifiers.insert(name.into(), value.into());
        self
    }

    pub fn with_counter_type(self, counter_type: CounterType) -> Self {
        self.with_qualifier(COUNTER_TYPE_QUALIFIER, counter_type.value())
    }

    /// The `CounterType` qualifier, if reported
    pub fn counter_type(&self) -> Option<CounterType> {
        self.qualifiers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(COUNTER_TYPE_QUALIFIER))
            .and_then(|(_, value)| CounterType::from_qualifier(value))
    }
}

/// One object returned by the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderRow {
    fields: Vec<ProviderField>,
}

impl ProviderRow {
    pub fn new(fields: Vec<ProviderField>) -> Self {
        Self { fields }
    }

    pub fn with_field(mut self, field: ProviderField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(&self) -> &[ProviderField] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<ProviderField> {
        self.fields
    }

    pub fn strip_qualifiers(&mut self) {
        for field in &mut self.fields {
            field.qualifiers.clear();
        }
    }
}

impl FromIterator<ProviderField> for ProviderRow {
    fn from_iter<T: IntoIterator<Item = ProviderField>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

// ----------------------------------------------------------------------------
// 8.3 Connection Traits
// ----------------------------------------------------------------------------

/// A live connection to the provider.
#[async_trait]
pub trait Connection: Send + Sync + Debug {
    /// Run a query and return the matching objects
    async fn execute(&self, query: &str, flags: QueryFlags) -> Result<Vec<ProviderRow>, ProviderFault>;
}

/// Opens provider connections.
#[async_trait]
pub trait ConnectionProvider: Send + Sync + Debug {
    async fn connect(
        &self,
        host: &str,
        namespace: &str,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn Connection>, ConnectionError>;
}

// ============================================================================
// SECTION 9: CONNECTION POOL
// ============================================================================
// Connections are cached per (host, namespace, username) in lock-free
// free-lists. A borrowed connection goes back to its free-list when the
// `PooledConnection` guard is dropped, on every exit path. Connections are
// never closed during normal operation, so callers rotating credentials grow
// the pool by one key per credential set.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Connection Keys
// ----------------------------------------------------------------------------

/// Identity of a pooled connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub host: CompactString,
    pub namespace: CompactString,
    pub username: CompactString,
}

impl ConnectionKey {
    pub fn new(host: &str, namespace: &str, username: &str) -> Self {
        Self {
            host: host.into(),
            namespace: namespace.into(),
            username: username.into(),
        }
    }
}

impl Display for ConnectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.namespace, self.username)
    }
}

// ----------------------------------------------------------------------------
// 9.2 Pool
// ----------------------------------------------------------------------------

type FreeList = Arc<SegQueue<Box<dyn Connection>>>;

/// Process-wide cache of provider connections
pub struct ConnectionPool {
    provider: Arc<dyn ConnectionProvider>,
    idle: DashMap<ConnectionKey, FreeList>,
    created: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
}

impl ConnectionPool {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            idle: DashMap::new(),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    pub fn shared(provider: Arc<dyn ConnectionProvider>) -> Arc<Self> {
        Arc::new(Self::new(provider))
    }

    fn free_list(&self, key: &ConnectionKey) -> FreeList {
        if let Some(list) = self.idle.get(key) {
            return Arc::clone(list.value());
        }
        Arc::clone(
            self.idle
                .entry(key.clone())
                .or_insert_with(|| Arc::new(SegQueue::new()))
                .value(),
        )
    }

    /// Borrow a connection for `key`, opening a new one when none is idle.
    pub async fn acquire(
        self: &Arc<Self>,
        key: &ConnectionKey,
        password: &str,
    ) -> Result<PooledConnection, ConnectionError> {
        if let Some(connection) = self.free_list(key).pop() {
            self.reused.fetch_add(1, AtomicOrdering::Relaxed);
            trace!(target: "wmi_sampler::pool", key = %key, "Reusing pooled connection");
            return Ok(PooledConnection::new(Arc::clone(self), key.clone(), connection));
        }

        let connection = self
            .provider
            .connect(&key.host, &key.namespace, &key.username, password)
            .await?;
        let created = self.created.fetch_add(1, AtomicOrdering::Relaxed) + 1;

        debug!(
            target: "wmi_sampler::pool",
            key = %key,
            total_created = created,
            "Opened provider connection"
        );

        Ok(PooledConnection::new(Arc::clone(self), key.clone(), connection))
    }

    /// Return a connection to the free-list of `key`.
    pub fn release(&self, key: &ConnectionKey, connection: Box<dyn Connection>) {
        self.free_list(key).push(connection);
        self.released.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(target: "wmi_sampler::pool", key = %key, "Connection returned to pool");
    }

    /// Connections currently idle under `key`
    pub fn idle_count(&self, key: &ConnectionKey) -> usize {
        self.idle.get(key).map(|list| list.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            keys: self.idle.len(),
            idle: self.idle.iter().map(|entry| entry.value().len()).sum(),
            created: self.created.load(AtomicOrdering::Relaxed),
            reused: self.reused.load(AtomicOrdering::Relaxed),
            released: self.released.load(AtomicOrdering::Relaxed),
        }
    }
}

impl Debug for ConnectionPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("provider", &self.provider)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub keys: usize,
    pub idle: usize,
    pub created: u64,
    pub reused: u64,
    pub released: u64,
}

// ----------------------------------------------------------------------------
// 9.3 Scoped Borrow
// ----------------------------------------------------------------------------

/// A borrowed connection, returned to its pool on drop
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    key: ConnectionKey,
    connection: Option<Box<dyn Connection>>,
}

impl PooledConnection {
    fn new(pool: Arc<ConnectionPool>, key: ConnectionKey, connection: Box<dyn Connection>) -> Self {
        Self {
            pool,
            key,
            connection: Some(connection),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub async fn execute(&self, query: &str, flags: QueryFlags) -> Result<Vec<ProviderRow>, ProviderFault> {
        match &self.connection {
            Some(connection) => connection.execute(query, flags).await,
            None => Err(ProviderFault::failed("connection already returned to the pool")),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(&self.key, connection);
        }
    }
}

impl Debug for PooledConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.key)
            .field("connection", &self.connection)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 9.4 Global Pool
// ----------------------------------------------------------------------------

/// Process-wide pool, installed once at start-up
static GLOBAL_POOL: OnceCell<Arc<ConnectionPool>> = OnceCell::new();

/// Install the process-wide pool. Returns the rejected pool when one is
/// already installed.
pub fn install_global_pool(pool: Arc<ConnectionPool>) -> Result<(), Arc<ConnectionPool>> {
    GLOBAL_POOL.set(pool)
}

/// The process-wide pool, if installed
pub fn global_pool() -> Option<Arc<ConnectionPool>> {
    GLOBAL_POOL.get().cloned()
}

/// The installed process-wide pool, or a new one over `provider` installed
/// in its place.
pub fn global_pool_or_install(provider: Arc<dyn ConnectionProvider>) -> Arc<ConnectionPool> {
    if let Some(pool) = global_pool() {
        return pool;
    }

    let pool = ConnectionPool::shared(provider);
    match install_global_pool(Arc::clone(&pool)) {
        Ok(()) => pool,
        Err(rejected) => {
            debug!(
                target: "wmi_sampler::pool",
                "Global pool installed concurrently, discarding the new one"
            );
            global_pool().unwrap_or(rejected)
        }
    }
}

// ============================================================================
// SECTION 10: COUNTER TYPE CACHE & QUERY ENGINE
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Counter Type Cache
// ----------------------------------------------------------------------------

/// Per-sampler cache of discovered counter types.
///
/// Readers get a consistent snapshot without locking. Entries are never
/// invalidated.
#[derive(Debug, Default)]
pub struct CounterTypeCache {
    types: ArcSwap<CounterTypeMap>,
    discovered: AtomicBool,
}

impl CounterTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a qualifier query has already populated the cache
    pub fn is_discovered(&self) -> bool {
        self.discovered.load(AtomicOrdering::Acquire)
    }

    fn mark_discovered(&self) {
        self.discovered.store(true, AtomicOrdering::Release);
    }

    pub fn get(&self, property: &str) -> Option<CounterType> {
        self.types.load().get(property)
    }

    pub fn contains(&self, property: &str) -> bool {
        self.types.load().contains(property)
    }

    pub fn snapshot(&self) -> Arc<CounterTypeMap> {
        self.types.load_full()
    }

    pub fn len(&self) -> usize {
        self.types.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.load().is_empty()
    }

    /// Merge newly discovered types; existing entries are kept.
    fn record_all<'a, I>(&self, discovered: I)
    where
        I: IntoIterator<Item = &'a (CompactString, CounterType)> + Clone,
    {
        self.types.rcu(|current| {
            let mut next = CounterTypeMap::clone(current);
            for (property, counter_type) in discovered.clone() {
                next.insert(property, *counter_type);
            }
            next
        });
    }
}

// ----------------------------------------------------------------------------
// 10.2 Query Statements
// ----------------------------------------------------------------------------

/// A `SELECT` statement against one provider class
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WqlQuery {
    pub class_name: String,
    /// Selected properties; empty selects every property
    pub properties: Vec<String>,
    /// Compiled ` WHERE ...` clause or `""`
    pub filter_clause: String,
}

impl WqlQuery {
    pub fn new(class_name: impl Into<String>, properties: Vec<String>, filter_clause: impl Into<String>) -> Self {
        let properties = if properties.len() == 1 && properties[0] == "*" {
            Vec::new()
        } else {
            properties
        };
        Self {
            class_name: class_name.into(),
            properties,
            filter_clause: filter_clause.into(),
        }
    }

    /// Statement of a sampler. Raw classes also select the system timestamp
    /// and its frequency.
    pub fn for_sampler(config: &SamplerConfig) -> Self {
        let mut properties = config.properties.clone();
        let wildcard = properties.len() == 1 && properties[0] == "*";
        if config.is_raw_perf_class() && !wildcard {
            for required in [TIMESTAMP_SYS100NS, FREQUENCY_SYS100NS] {
                if !properties.iter().any(|p| p.eq_ignore_ascii_case(required)) {
                    properties.push(required.to_string());
                }
            }
        }

        let filter_clause = compile_filters(&config.filters, &config.and_props);
        Self::new(config.class_name.clone(), properties, filter_clause)
    }

    pub fn statement(&self) -> String {
        let selected = if self.properties.is_empty() {
            "*".to_string()
        } else {
            self.properties.join(",")
        };
        format!("SELECT {} FROM {}{}", selected, self.class_name, self.filter_clause)
    }
}

impl Display for WqlQuery {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.statement())
    }
}

// ----------------------------------------------------------------------------
// 10.3 Query Engine
// ----------------------------------------------------------------------------

/// Query counters
#[derive(Debug, Default)]
struct QueryCounters {
    queries: AtomicU64,
    discovery_passes: AtomicU64,
    provider_faults: AtomicU64,
    timeouts: AtomicU64,
}

/// Runs one sampler's statement through the pool and parses the rows.
pub struct QueryEngine {
    pool: Arc<ConnectionPool>,
    key: ConnectionKey,
    password: String,
    timeout: Duration,
    query: WqlQuery,
    statement: String,
    is_raw: bool,
    counter_types: CounterTypeCache,
    counters: QueryCounters,
}

impl QueryEngine {
    pub fn new(pool: Arc<ConnectionPool>, config: &SamplerConfig, query: WqlQuery) -> Self {
        let statement = query.statement();
        Self {
            pool,
            key: config.connection_key(),
            password: config.password.clone(),
            timeout: config.timeout,
            is_raw: is_raw_perf_class(&query.class_name),
            query,
            statement,
            counter_types: CounterTypeCache::new(),
            counters: QueryCounters::default(),
        }
    }

    pub fn query_text(&self) -> &str {
        &self.statement
    }

    pub fn wql(&self) -> &WqlQuery {
        &self.query
    }

    pub fn counter_types(&self) -> &CounterTypeCache {
        &self.counter_types
    }

    /// Qualifiers are only fetched until the first raw query succeeds
    pub fn include_qualifiers(&self) -> bool {
        self.is_raw && !self.counter_types.is_discovered()
    }

    /// Query and degrade provider faults to an empty sample.
    pub async fn query(&self) -> QueryResult<Sample> {
        match self.try_query().await {
            Err(QueryError::Provider(fault)) => {
                warn!(
                    target: "wmi_sampler::query",
                    class = %self.query.class_name,
                    code = %format!("0x{:08X}", fault.code),
                    error = %fault,
                    "Provider fault, returning an empty sample"
                );
                Ok(Sample::default())
            }
            other => other,
        }
    }

    /// Query and surface every failure.
    pub async fn try_query(&self) -> QueryResult<Sample> {
        let include = self.include_qualifiers();
        let flags = QueryFlags::sampling_default().with_qualifiers(include);

        self.counters.queries.fetch_add(1, AtomicOrdering::Relaxed);
        if include {
            self.counters.discovery_passes.fetch_add(1, AtomicOrdering::Relaxed);
        }

        trace!(
            target: "wmi_sampler::query",
            statement = %self.statement,
            flags = %flags,
            "Executing query"
        );

        let timer = PerfTimer::with_threshold("provider_query", SLOW_QUERY_THRESHOLD_MS);
        let rows = match timeout(self.timeout, self.execute(flags)).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) => {
                if matches!(err, QueryError::Provider(_)) {
                    self.counters.provider_faults.fetch_add(1, AtomicOrdering::Relaxed);
                }
                return Err(err);
            }
            Err(_) => {
                self.counters.timeouts.fetch_add(1, AtomicOrdering::Relaxed);
                return Err(QueryError::Timeout {
                    class_name: self.query.class_name.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };
        timer.stop();

        Ok(self.parse_results(rows, include))
    }

    async fn execute(&self, flags: QueryFlags) -> QueryResult<Vec<ProviderRow>> {
        let connection = self.pool.acquire(&self.key, &self.password).await?;
        let rows = connection.execute(&self.statement, flags).await?;
        Ok(rows)
    }

    fn parse_results(&self, rows: Vec<ProviderRow>, include_qualifiers: bool) -> Sample {
        let mut discovered: SmallVec<[(CompactString, CounterType); 8]> = SmallVec::new();

        let sample: Sample = rows
            .into_iter()
            .map(|row| {
                let mut bag = PropertyBag::with_properties(&self.query.properties);
                for field in row.into_fields() {
                    if include_qualifiers {
                        self.discover_counter_type(&field, &mut discovered);
                    }
                    bag.insert(&field.name, field.value.coerce_numeric());
                }
                bag
            })
            .collect();

        if include_qualifiers && !sample.is_empty() {
            self.counter_types.record_all(discovered.iter());
            self.counter_types.mark_discovered();
            debug!(
                target: "wmi_sampler::query",
                class = %self.query.class_name,
                counter_types = self.counter_types.len(),
                "Counter types discovered"
            );
        }

        sample
    }

    fn discover_counter_type(
        &self,
        field: &ProviderField,
        discovered: &mut SmallVec<[(CompactString, CounterType); 8]>,
    ) {
        if self.counter_types.contains(&field.name)
            || discovered
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case(&field.name))
        {
            return;
        }

        match field.counter_type() {
            Some(counter_type) => {
                debug!(
                    target: "wmi_sampler::query",
                    property = %field.name,
                    counter_type = %counter_type,
                    "Discovered counter type"
                );
                discovered.push((CompactString::from(field.name.as_str()), counter_type));
            }
            None => {
                debug!(
                    target: "wmi_sampler::query",
                    property = %field.name,
                    "No counter type reported, value passes through"
                );
            }
        }
    }

    pub fn queries_issued(&self) -> u64 {
        self.counters.queries.load(AtomicOrdering::Relaxed)
    }

    pub fn discovery_passes(&self) -> u64 {
        self.counters.discovery_passes.load(AtomicOrdering::Relaxed)
    }

    pub fn provider_faults(&self) -> u64 {
        self.counters.provider_faults.load(AtomicOrdering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.counters.timeouts.load(AtomicOrdering::Relaxed)
    }
}

impl Debug for QueryEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEngine")
            .field("key", &self.key)
            .field("statement", &self.statement)
            .field("timeout", &self.timeout)
            .field("is_raw", &self.is_raw)
            .field("counter_types", &self.counter_types)
            .finish()
    }
}

// ============================================================================
// SECTION 11: COUNTER CALCULATORS & FORMATTING
// ============================================================================
// Raw counters become meaningful values by combining two consecutive
// snapshots. Each counter type maps to a calculator; a property without a
// counter type passes through unchanged.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Calculator Registry
// ----------------------------------------------------------------------------

/// Computes a formatted value from the previous and current raw rows.
pub type Calculator = fn(&PropertyBag, &PropertyBag, &str) -> PropertyValue;

/// Resolves calculators by counter type.
pub trait CalculatorRegistry: Send + Sync + Debug {
    fn resolve(&self, counter_type: CounterType) -> Result<Calculator, UndefinedCalculator>;
}

/// Registry of calculators keyed by counter type
#[derive(Clone, Default)]
pub struct CounterTypeRegistry {
    calculators: FastMap<CounterType, Calculator>,
}

impl CounterTypeRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry covering the common Windows performance counter types
    pub fn with_builtins() -> Self {
        Self::new()
            .with(CounterType::PERF_COUNTER_RAWCOUNT, raw_count)
            .with(CounterType::PERF_COUNTER_LARGE_RAWCOUNT, raw_count)
            .with(CounterType::PERF_COUNTER_COUNTER, counter_rate)
            .with(CounterType::PERF_COUNTER_BULK_COUNT, counter_rate)
            .with(CounterType::PERF_100NSEC_TIMER, timer_100ns)
            .with(CounterType::PERF_100NSEC_TIMER_INV, timer_100ns_inverse)
            .with(CounterType::PERF_AVERAGE_BULK, average_bulk)
            .with(CounterType::PERF_RAW_FRACTION, raw_fraction)
            .with(CounterType::PERF_PRECISION_100NS_TIMER, precision_timer_100ns)
    }

    pub fn with(mut self, counter_type: CounterType, calculator: Calculator) -> Self {
        self.register(counter_type, calculator);
        self
    }

    /// Register a calculator, replacing any previous one for the type
    pub fn register(&mut self, counter_type: CounterType, calculator: Calculator) {
        self.calculators.insert(counter_type, calculator);
    }

    /// Registered counter types in ascending order
    pub fn counter_types(&self) -> Vec<CounterType> {
        let mut types: Vec<CounterType> = self.calculators.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.calculators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calculators.is_empty()
    }
}

impl CalculatorRegistry for CounterTypeRegistry {
    fn resolve(&self, counter_type: CounterType) -> Result<Calculator, UndefinedCalculator> {
        self.calculators
            .get(&counter_type)
            .copied()
            .ok_or(UndefinedCalculator { counter_type })
    }
}

impl Debug for CounterTypeRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterTypeRegistry")
            .field("counter_types", &self.counter_types())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 11.2 Built-in Calculators
// ----------------------------------------------------------------------------

/// Current raw value, unchanged
pub fn raw_passthrough(_previous: &PropertyBag, current: &PropertyBag, property: &str) -> PropertyValue {
    current.get(property).cloned().unwrap_or_default()
}

fn number(value: Option<f64>) -> PropertyValue {
    value.map(PropertyValue::Number).unwrap_or_default()
}

/// `num / den`, or 0 when the denominator is zero
fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

fn delta(previous: &PropertyBag, current: &PropertyBag, property: &str) -> Option<f64> {
    Some(current.get_f64(property)? - previous.get_f64(property)?)
}

fn base_property(property: &str) -> String {
    format!("{}{}", property, BASE_PROPERTY_SUFFIX)
}

/// PERF_COUNTER_RAWCOUNT / PERF_COUNTER_LARGE_RAWCOUNT: `n1`
pub fn raw_count(_previous: &PropertyBag, current: &PropertyBag, property: &str) -> PropertyValue {
    number(current.get_f64(property))
}

/// PERF_COUNTER_COUNTER / PERF_COUNTER_BULK_COUNT: events per second
pub fn counter_rate(previous: &PropertyBag, current: &PropertyBag, property: &str) -> PropertyValue {
    number((|| {
        let events = delta(previous, current, property)?;
        let ticks = delta(previous, current, TIMESTAMP_SYS100NS)?;
        let frequency = current.get_f64(FREQUENCY_SYS100NS)?;
        Some(ratio(events, ratio(ticks, frequency)))
    })())
}

/// PERF_100NSEC_TIMER: percentage of elapsed time the counter was active
pub fn timer_100ns(previous: &PropertyBag, current: &PropertyBag, property: &str) -> PropertyValue {
    number((|| {
        let active = delta(previous, current, property)?;
        let elapsed = delta(previous, current, TIMESTAMP_SYS100NS)?;
        Some(100.0 * ratio(active, elapsed))
    })())
}

/// PERF_100NSEC_TIMER_INV: percentage of elapsed time the counter was idle
pub fn timer_100ns_inverse(previous: &PropertyBag, current: &PropertyBag, property: &str) -> PropertyValue {
    number((|| {
        let idle = delta(previous, current, property)?;
        let elapsed = delta(previous, current, TIMESTAMP_SYS100NS)?;
        if elapsed == 0.0 {
            return Some(0.0);
        }
        Some(100.0 * (1.0 - idle / elapsed))
    })())
}

/// PERF_AVERAGE_BULK: average per operation, `(n1-n0)/(b1-b0)`
pub fn average_bulk(previous: &PropertyBag, current: &PropertyBag, property: &str) -> PropertyValue {
    number((|| {
        let total = delta(previous, current, property)?;
        let operations = delta(previous, current, &base_property(property))?;
        Some(ratio(total, operations))
    })())
}

/// PERF_RAW_FRACTION: `100 * n1/b1`
pub fn raw_fraction(_previous: &PropertyBag, current: &PropertyBag, property: &str) -> PropertyValue {
    number((|| {
        let part = current.get_f64(property)?;
        let whole = current.get_f64(&base_property(property))?;
        Some(100.0 * ratio(part, whole))
    })())
}

/// PERF_PRECISION_100NS_TIMER: `100 * (n1-n0)/(b1-b0)`
pub fn precision_timer_100ns(previous: &PropertyBag, current: &PropertyBag, property: &str) -> PropertyValue {
    number((|| {
        let active = delta(previous, current, property)?;
        let elapsed = delta(previous, current, &base_property(property))?;
        Some(100.0 * ratio(active, elapsed))
    })())
}

// ----------------------------------------------------------------------------
// 11.3 Formatting Dispatch
// ----------------------------------------------------------------------------

/// Calculator for `counter_type`, falling back to raw passthrough
pub fn resolve_calculator(registry: &dyn CalculatorRegistry, counter_type: CounterType) -> Calculator {
    match registry.resolve(counter_type) {
        Ok(calculator) => calculator,
        Err(err) => {
            warn!(
                target: "wmi_sampler::format",
                counter_type = %counter_type,
                "{}, passing the raw value through",
                err
            );
            raw_passthrough as Calculator
        }
    }
}

/// Format one current row against its previous row. Inputs are not modified.
pub fn format_property_values(
    previous: &PropertyBag,
    current: &PropertyBag,
    counter_types: &CounterTypeMap,
    registry: &dyn CalculatorRegistry,
) -> PropertyBag {
    current
        .iter()
        .map(|(property, value)| {
            let formatted = match counter_types.get(property) {
                Some(counter_type) => resolve_calculator(registry, counter_type)(previous, current, property),
                None => value.clone(),
            };
            (property, formatted)
        })
        .collect()
}

// ============================================================================
// SECTION 12: SAMPLER
// ============================================================================
// The sampler keeps the two latest raw samples of one class. Raw
// performance classes are formatted from the (previous, current) pair; other
// classes are reported as queried.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Sampling State
// ----------------------------------------------------------------------------

/// Whether a sample is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingState {
    Idle,
    Sampling,
}

impl Display for SamplingState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SamplingState::Idle => write!(f, "idle"),
            SamplingState::Sampling => write!(f, "sampling"),
        }
    }
}

/// Holds the sampling flag for the duration of one `sample()` call.
///
/// Dropping the guard, including when the `sample()` future is cancelled,
/// resets the state to idle.
struct SamplingGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SamplingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for SamplingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, AtomicOrdering::Release);
    }
}

#[derive(Debug, Default)]
struct SampleBuffers {
    previous: Option<Arc<Sample>>,
    current: Option<Arc<Sample>>,
}

// ----------------------------------------------------------------------------
// 12.2 Sampler
// ----------------------------------------------------------------------------

/// Samples one provider class.
///
/// Raw performance classes (`*_PerfRawData_*`) are warmed up with a bootstrap
/// query, then each formatted row pairs `previous[i]` with `current[i]` by
/// position. The provider is assumed to enumerate instances in a stable
/// order; if the order changes between two samples, rows are silently
/// mis-paired.
///
/// A sampler is single-writer: a second `sample()` while one is in flight
/// fails with [`SamplerError::InvalidState`], as do reads.
pub struct Sampler {
    name: String,
    is_raw: bool,
    engine: QueryEngine,
    calculators: Arc<dyn CalculatorRegistry>,
    buffers: RwLock<SampleBuffers>,
    sampling: AtomicBool,
    samples_completed: AtomicU64,
    last_sampled: Mutex<Option<DateTime<Utc>>>,
}

impl Sampler {
    /// Build a sampler. The filter clause is compiled once here.
    pub fn new(
        config: &SamplerConfig,
        pool: Arc<ConnectionPool>,
        calculators: Arc<dyn CalculatorRegistry>,
    ) -> SamplerResult<Self> {
        config.validate()?;

        let is_raw = config.is_raw_perf_class();
        let engine = QueryEngine::new(pool, config, WqlQuery::for_sampler(config));

        debug!(
            target: "wmi_sampler::sampler",
            sampler = config.display_name(),
            statement = engine.query_text(),
            raw = is_raw,
            "Sampler created"
        );

        Ok(Self {
            name: config.display_name().to_string(),
            is_raw,
            engine,
            calculators,
            buffers: RwLock::new(SampleBuffers::default()),
            sampling: AtomicBool::new(false),
            samples_completed: AtomicU64::new(0),
            last_sampled: Mutex::new(None),
        })
    }

    /// Build a sampler on the process-wide pool.
    pub fn with_global_pool(config: &SamplerConfig, calculators: Arc<dyn CalculatorRegistry>) -> SamplerResult<Self> {
        let pool = global_pool()
            .ok_or_else(|| ConfigError::invalid_value("pool", "no global connection pool is installed"))?;
        Self::new(config, pool, calculators)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_name(&self) -> &str {
        &self.engine.wql().class_name
    }

    pub fn is_raw_perf_class(&self) -> bool {
        self.is_raw
    }

    pub fn query_text(&self) -> &str {
        self.engine.query_text()
    }

    pub fn counter_types(&self) -> Arc<CounterTypeMap> {
        self.engine.counter_types().snapshot()
    }

    pub fn state(&self) -> SamplingState {
        if self.sampling.load(AtomicOrdering::Acquire) {
            SamplingState::Sampling
        } else {
            SamplingState::Idle
        }
    }

    fn ensure_idle(&self, operation: &'static str) -> SamplerResult<()> {
        match self.state() {
            SamplingState::Idle => Ok(()),
            SamplingState::Sampling => Err(SamplerError::InvalidState { operation }),
        }
    }

    /// Take a new sample.
    ///
    /// Raw classes without a usable previous sample run a bootstrap query
    /// first; a provider fault during the bootstrap is returned. Buffers are
    /// only updated when every query succeeded.
    pub async fn sample(&self) -> SamplerResult<()> {
        let _guard = SamplingGuard::acquire(&self.sampling).ok_or(SamplerError::InvalidState {
            operation: "sample",
        })?;

        let needs_bootstrap = self.is_raw
            && self
                .buffers
                .read()
                .previous
                .as_ref()
                .map_or(true, |previous| previous.is_empty());

        let bootstrap = if needs_bootstrap {
            debug!(
                target: "wmi_sampler::sampler",
                sampler = %self.name,
                "No previous raw sample, bootstrapping"
            );
            match self.engine.try_query().await {
                Ok(sample) => Some(Arc::new(sample)),
                Err(err) => return Err(self.sample_failed(err)),
            }
        } else {
            None
        };

        let current = match self.engine.query().await {
            Ok(sample) => Arc::new(sample),
            Err(err) => return Err(self.sample_failed(err)),
        };

        let rows = current.len();
        {
            let mut buffers = self.buffers.write();
            let previous = match bootstrap {
                Some(sample) => Some(sample),
                None => buffers.current.take(),
            };
            buffers.previous = previous;
            buffers.current = Some(current);
        }
        *self.last_sampled.lock() = Some(Utc::now());
        self.samples_completed.fetch_add(1, AtomicOrdering::Relaxed);

        debug!(
            target: "wmi_sampler::sampler",
            sampler = %self.name,
            rows,
            "Sample completed"
        );

        Ok(())
    }

    fn sample_failed(&self, err: QueryError) -> SamplerError {
        match &err {
            QueryError::Timeout { timeout_ms, .. } => warn!(
                target: "wmi_sampler::sampler",
                sampler = %self.name,
                timeout_ms = *timeout_ms,
                "Sample timed out"
            ),
            other => warn!(
                target: "wmi_sampler::sampler",
                sampler = %self.name,
                error = %other,
                "Sample failed"
            ),
        }
        err.into()
    }

    /// Number of objects in the current sample
    pub fn len(&self) -> SamplerResult<usize> {
        self.ensure_idle("read the sample length")?;
        Ok(self.buffers.read().current.as_ref().map_or(0, |current| current.len()))
    }

    pub fn is_empty(&self) -> SamplerResult<bool> {
        self.len().map(|len| len == 0)
    }

    /// Iterate over the formatted rows of the latest sample.
    ///
    /// The iterator works on a snapshot of the buffers; each call starts
    /// over.
    pub fn iter(&self) -> SamplerResult<FormattedIter> {
        self.ensure_idle("iterate the sample")?;
        let buffers = self.buffers.read();
        Ok(FormattedIter {
            previous: if self.is_raw { buffers.previous.clone() } else { None },
            current: buffers.current.clone(),
            paired: self.is_raw,
            counter_types: self.engine.counter_types().snapshot(),
            calculators: Arc::clone(&self.calculators),
            index: 0,
        })
    }

    /// Formatted row at `index`
    pub fn get(&self, index: usize) -> SamplerResult<PropertyBag> {
        self.ensure_idle("index the sample")?;
        let buffers = self.buffers.read();
        let current = buffers.current.as_deref().map(|s| &s[..]).unwrap_or(&[]);
        let out_of_range = SamplerError::IndexOutOfRange {
            index,
            len: current.len(),
        };

        let row = current.get(index).ok_or_else(|| out_of_range.clone())?;
        if !self.is_raw {
            return Ok(row.clone());
        }

        let previous = buffers
            .previous
            .as_deref()
            .and_then(|s| s.get(index))
            .ok_or(out_of_range)?;
        let counter_types = self.engine.counter_types().snapshot();
        Ok(format_property_values(
            previous,
            row,
            &counter_types,
            self.calculators.as_ref(),
        ))
    }

    /// The latest raw sample
    pub fn current_sample(&self) -> SamplerResult<Option<Arc<Sample>>> {
        self.ensure_idle("read the current sample")?;
        Ok(self.buffers.read().current.clone())
    }

    /// The raw sample before the latest one
    pub fn previous_sample(&self) -> SamplerResult<Option<Arc<Sample>>> {
        self.ensure_idle("read the previous sample")?;
        Ok(self.buffers.read().previous.clone())
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            name: self.name.clone(),
            class_name: self.class_name().to_string(),
            state: self.state(),
            queries: self.engine.queries_issued(),
            discovery_passes: self.engine.discovery_passes(),
            provider_faults: self.engine.provider_faults(),
            timeouts: self.engine.timeouts(),
            samples_completed: self.samples_completed.load(AtomicOrdering::Relaxed),
            counter_types: self.engine.counter_types().len(),
            last_sampled: *self.last_sampled.lock(),
        }
    }
}

impl PartialEq<Sample> for Sampler {
    fn eq(&self, other: &Sample) -> bool {
        self == &other[..]
    }
}

impl PartialEq<[PropertyBag]> for Sampler {
    fn eq(&self, other: &[PropertyBag]) -> bool {
        match self.buffers.read().current.as_deref() {
            Some(current) => &current[..] == other,
            None => other.is_empty(),
        }
    }
}

impl Display for Sampler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.buffers.read().current.as_deref() {
            Some(current) => write!(f, "{}", current),
            None => write!(f, "[]"),
        }
    }
}

impl Debug for Sampler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sampler")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("engine", &self.engine)
            .field("calculators", &self.calculators)
            .finish()
    }
}

/// Sampler counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplerStats {
    pub name: String,
    pub class_name: String,
    pub state: SamplingState,
    pub queries: u64,
    pub discovery_passes: u64,
    pub provider_faults: u64,
    pub timeouts: u64,
    pub samples_completed: u64,
    pub counter_types: usize,
    pub last_sampled: Option<DateTime<Utc>>,
}

// ----------------------------------------------------------------------------
// 12.3 Formatted Iteration
// ----------------------------------------------------------------------------

/// Lazily formats the rows of one sampler snapshot
pub struct FormattedIter {
    previous: Option<Arc<Sample>>,
    current: Option<Arc<Sample>>,
    paired: bool,
    counter_types: Arc<CounterTypeMap>,
    calculators: Arc<dyn CalculatorRegistry>,
    index: usize,
}

impl FormattedIter {
    fn total(&self) -> usize {
        let current = self.current.as_ref().map_or(0, |s| s.len());
        if self.paired {
            current.min(self.previous.as_ref().map_or(0, |s| s.len()))
        } else {
            current
        }
    }
}

impl Iterator for FormattedIter {
    type Item = PropertyBag;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.total() {
            return None;
        }
        let index = self.index;
        self.index += 1;

        let current = self.current.as_ref()?.get(index)?;
        if !self.paired {
            return Some(current.clone());
        }
        let previous = self.previous.as_ref()?.get(index)?;
        Some(format_property_values(
            previous,
            current,
            &self.counter_types,
            self.calculators.as_ref(),
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total().saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FormattedIter {}

impl Debug for FormattedIter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormattedIter")
            .field("paired", &self.paired)
            .field("index", &self.index)
            .field("total", &self.total())
            .finish()
    }
}

// ============================================================================
// SECTION 13: REPLAY PROVIDER
// ============================================================================
// Serves recorded provider rows instead of talking to a live provider. Used by
// the CLI and the test suites.
//
// Recording format (JSON):
//   { "<ClassName>": [ <snapshot>, ... ] }
//   snapshot = [ <row>, ... ], row = [ { "name", "value", "qualifiers" }, ... ]
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Recordings
// ----------------------------------------------------------------------------

/// Recorded snapshots per provider class
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplayRecording {
    classes: BTreeMap<String, Vec<Vec<ProviderRow>>>,
}

impl ReplayRecording {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(mut self, class_name: &str, rows: Vec<ProviderRow>) -> Self {
        self.push_snapshot(class_name, rows);
        self
    }

    pub fn push_snapshot(&mut self, class_name: &str, rows: Vec<ProviderRow>) {
        self.classes.entry(class_name.to_string()).or_default().push(rows);
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::parse(format!("invalid replay recording: {}", e)))
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let json = fs::read_to_string(path).map_err(|e| ConfigError::parse(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

/// A statement the replay provider received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedQuery {
    pub statement: String,
    pub flags: QueryFlags,
}

#[derive(Debug, Default)]
struct ClassReplay {
    snapshots: Vec<Vec<ProviderRow>>,
    cursor: usize,
}

impl ClassReplay {
    /// Next snapshot; the last one repeats
    fn next_snapshot(&mut self) -> Vec<ProviderRow> {
        let index = self.cursor.min(self.snapshots.len().saturating_sub(1));
        self.cursor = self.cursor.saturating_add(1);
        self.snapshots.get(index).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct ReplayState {
    classes: RwLock<FastMap<CompactString, ClassReplay>>,
    executed: Mutex<Vec<ExecutedQuery>>,
    pending_faults: Mutex<VecDeque<ProviderFault>>,
    latency: Mutex<Option<Duration>>,
    refuse_connections: AtomicBool,
    connections_opened: AtomicU64,
}

fn replay_key(class_name: &str) -> CompactString {
    CompactString::from(class_name.to_ascii_uppercase())
}

// ----------------------------------------------------------------------------
// 13.2 Provider
// ----------------------------------------------------------------------------

/// Connection provider backed by recorded rows. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ReplayProvider {
    state: Arc<ReplayState>,
}

impl ReplayProvider {
    pub fn new(recording: ReplayRecording) -> Self {
        let provider = Self::default();
        for (class_name, snapshots) in recording.classes {
            for rows in snapshots {
                provider.push_snapshot(&class_name, rows);
            }
        }
        provider
    }

    /// Append a snapshot for `class_name`
    pub fn push_snapshot(&self, class_name: &str, rows: Vec<ProviderRow>) {
        self.state
            .classes
            .write()
            .entry(replay_key(class_name))
            .or_default()
            .snapshots
            .push(rows);
    }

    /// Fail the next executed query with `fault`
    pub fn fail_next(&self, fault: ProviderFault) {
        self.state.pending_faults.lock().push_back(fault);
    }

    /// Delay every query by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.state.latency.lock() = latency;
    }

    /// Make `connect` fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, AtomicOrdering::Relaxed);
    }

    /// Every statement received so far
    pub fn executed(&self) -> Vec<ExecutedQuery> {
        self.state.executed.lock().clone()
    }

    pub fn connections_opened(&self) -> u64 {
        self.state.connections_opened.load(AtomicOrdering::Relaxed)
    }
}

#[async_trait]
impl ConnectionProvider for ReplayProvider {
    async fn connect(
        &self,
        host: &str,
        namespace: &str,
        username: &str,
        _password: &str,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        if self.state.refuse_connections.load(AtomicOrdering::Relaxed) {
            return Err(ConnectionError::connect_failed(
                ConnectionKey::new(host, namespace, username),
                "replay provider refuses connections",
            ));
        }

        let id = self.state.connections_opened.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(Box::new(ReplayConnection {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Class name following `FROM` in a statement
fn statement_class(statement: &str) -> Option<&str> {
    let upper = statement.to_ascii_uppercase();
    let start = upper.find(" FROM ")? + " FROM ".len();
    statement[start..].split_whitespace().next()
}

#[derive(Debug)]
struct ReplayConnection {
    id: u64,
    state: Arc<ReplayState>,
}

#[async_trait]
impl Connection for ReplayConnection {
    async fn execute(&self, query: &str, flags: QueryFlags) -> Result<Vec<ProviderRow>, ProviderFault> {
        self.state.executed.lock().push(ExecutedQuery {
            statement: query.to_string(),
            flags,
        });

        let latency = *self.state.latency.lock();
        if let Some(latency) = latency {
            sleep(latency).await;
        }

        let fault = self.state.pending_faults.lock().pop_front();
        if let Some(fault) = fault {
            return Err(fault);
        }

        let class_name = statement_class(query).ok_or_else(|| {
            ProviderFault::new(ProviderFault::WBEM_E_INVALID_QUERY, format!("cannot parse '{}'", query))
        })?;

        let mut rows = {
            let mut classes = self.state.classes.write();
            let replay = classes.get_mut(replay_key(class_name).as_str()).ok_or_else(|| {
                ProviderFault::new(
                    ProviderFault::WBEM_E_INVALID_CLASS,
                    format!("no recording for class '{}'", class_name),
                )
            })?;
            replay.next_snapshot()
        };

        if !flags.contains(QueryFlags::USE_AMENDED_QUALIFIERS) {
            rows.iter_mut().for_each(ProviderRow::strip_qualifiers);
        }

        trace!(
            target: "wmi_sampler::replay",
            connection = self.id,
            class = class_name,
            rows = rows.len(),
            "Replayed snapshot"
        );

        Ok(rows)
    }
}

// ============================================================================
// SECTION 14: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// WMI Sampler CLI
#[derive(Parser, Debug)]
#[command(
    name = "wmi-sampler",
    author = "AIOps Team",
    version,
    about = "Performance counter sampler for WMI-style providers",
    long_about = "Samples provider classes on an interval and turns raw performance \
                  counters into rates and percentages."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "wmi-sampler.toml", env = "WMI_SAMPLER_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "WMI_SAMPLER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "WMI_SAMPLER_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sample every configured class on the configured interval
    Run {
        /// Stop after this many sampling rounds
        #[arg(short, long)]
        iterations: Option<u64>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the statement each sampler runs
    Query,

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 14.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> AppResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match AppConfig::load(config_path) {
        Ok(config) => {
            println!("Configuration is valid");

            if verbose {
                println!("\nParsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\nSummary:");
            println!("  instance name:   {}", config.general.instance_name);
            println!("  interval:        {}", humantime::format_duration(config.general.interval));
            println!("  samplers:        {}", config.samplers.len());
            for sampler in &config.samplers {
                let kind = if sampler.is_raw_perf_class() { "raw" } else { "formatted" };
                println!("    - {} ({}, {})", sampler.display_name(), sampler.class_name, kind);
            }
            if let Some(replay) = &config.replay {
                println!("  replay data:     {}", replay.path.display());
            }

            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed");
            println!("Error: {}", e);
            Err(AppError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> AppResult<()> {
    let config_str = AppConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the query subcommand
fn handle_query(config: &AppConfig) {
    for sampler in &config.samplers {
        println!("{}: {}", sampler.display_name(), WqlQuery::for_sampler(sampler));
    }
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} v{}", SAMPLER_FULL_NAME, SAMPLER_VERSION);
    println!();
    println!("Build Information:");
    println!("  Target: {}", std::env::consts::ARCH);
    println!("  OS:     {}", std::env::consts::OS);
    println!();
    println!("Built-in counter types:");
    for counter_type in CounterTypeRegistry::with_builtins().counter_types() {
        println!("  {}", counter_type);
    }
}

// ----------------------------------------------------------------------------
// 14.3 Sampling Loop
// ----------------------------------------------------------------------------

/// Build the replay-backed pool and samplers, then sample until the
/// iteration budget is spent or Ctrl-C is received.
async fn run_samplers(config: AppConfig, iterations: Option<u64>) -> AnyhowResult<()> {
    let replay = config
        .replay
        .as_ref()
        .ok_or_else(|| ConfigError::missing_field("replay.path"))?;
    let recording = ReplayRecording::from_json_file(&replay.path)
        .with_context(|| format!("Failed to load replay data from {}", replay.path.display()))?;

    let provider: Arc<dyn ConnectionProvider> = Arc::new(ReplayProvider::new(recording));
    let pool = global_pool_or_install(provider);
    let calculators: Arc<dyn CalculatorRegistry> = Arc::new(CounterTypeRegistry::with_builtins());

    let samplers = config
        .samplers
        .iter()
        .map(|sampler| Sampler::new(sampler, Arc::clone(&pool), Arc::clone(&calculators)))
        .collect::<SamplerResult<Vec<_>>>()?;

    info!(
        target: "wmi_sampler::sampler",
        samplers = samplers.len(),
        interval = %humantime::format_duration(config.general.interval),
        "Sampling started"
    );

    let mut ticker = interval(config.general.interval);
    let mut round = 0u64;
    loop {
        if iterations.map_or(false, |limit| round >= limit) {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            _ = signal::ctrl_c() => {
                info!(target: "wmi_sampler::sampler", "Interrupted, stopping");
                break;
            }
        }
        round += 1;

        let results = join_all(samplers.iter().map(|sampler| sampler.sample())).await;
        for (sampler, result) in samplers.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    target: "wmi_sampler::sampler",
                    sampler = sampler.name(),
                    category = e.category(),
                    recoverable = e.is_recoverable(),
                    error = %e,
                    "Sampling round failed"
                );
                continue;
            }

            let timestamp = Utc::now();
            for row in sampler.iter()? {
                let line = json!({
                    "instance": config.general.instance_name,
                    "sampler": sampler.name(),
                    "round": round,
                    "timestamp": timestamp.to_rfc3339(),
                    "values": row,
                });
                println!("{}", line);
            }
        }
    }

    for sampler in &samplers {
        debug!(target: "wmi_sampler::sampler", stats = ?sampler.stats(), "Sampler stats");
    }
    debug!(target: "wmi_sampler::pool", stats = ?pool.stats(), "Pool stats");

    Ok(())
}

// ============================================================================
// SECTION 15: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the sampler
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need logging or a config
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    info!("{} v{}", SAMPLER_FULL_NAME, SAMPLER_VERSION);

    match cli.command {
        Some(Commands::Query) => handle_query(&config),
        Some(Commands::Run { iterations }) => run_samplers(config, iterations).await?,
        None => run_samplers(config, None).await?,
        Some(Commands::Version)
        | Some(Commands::GenerateConfig { .. })
        | Some(Commands::Validate { .. }) => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 16: TESTS
// ============================================================================


// ============================================================================
// SECTION 17: FILTER COMPILER TESTS
// ============================================================================


// ============================================================================
// SECTION 18: CONNECTION POOL TESTS
// ============================================================================

#[cfg(test)]
mod pool_tests {
    use super::*;

    fn local_key() -> ConnectionKey {
        ConnectionKey::new(DEFAULT_HOST, DEFAULT_NAMESPACE, "")
    }

    fn harness() -> (ReplayProvider, Arc<ConnectionPool>) {
        let replay = ReplayProvider::default();
        let pool = ConnectionPool::shared(Arc::new(replay.clone()));
        (replay, pool)
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let (replay, pool) = harness();
        let key = local_key();

        let connection = pool.acquire(&key, "").await.unwrap();
        assert_eq!(connection.key(), &key);
        assert_eq!(pool.idle_count(&key), 0);
        drop(connection);
        assert_eq!(pool.idle_count(&key), 1);

        let _again = pool.acquire(&key, "").await.unwrap();
        assert_eq!(replay.connections_opened(), 1);
        assert_eq!(pool.idle_count(&key), 0);

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.released, 1);
    }

    #[tokio::test]
    async fn test_key_holds_several_connections() {
        let (replay, pool) = harness();
        let key = local_key();

        let first = pool.acquire(&key, "").await.unwrap();
        let second = pool.acquire(&key, "").await.unwrap();
        assert_eq!(replay.connections_opened(), 2);

        drop(first);
        drop(second);
        assert_eq!(pool.idle_count(&key), 2);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let (replay, pool) = harness();
        let local = local_key();
        let remote = ConnectionKey::new("db-01", DEFAULT_NAMESPACE, "monitor");

        drop(pool.acquire(&local, "").await.unwrap());
        drop(pool.acquire(&remote, "secret").await.unwrap());

        assert_eq!(replay.connections_opened(), 2);
        assert_eq!(pool.idle_count(&local), 1);
        assert_eq!(pool.idle_count(&remote), 1);
        assert_eq!(pool.stats().keys, 2);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces() {
        let (replay, pool) = harness();
        replay.refuse_connections(true);

        let err = pool.acquire(&local_key(), "").await.unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectFailed { .. }));
        assert!(err.is_recoverable());
        assert_eq!(pool.idle_count(&local_key()), 0);
        assert_eq!(pool.stats().created, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_release_keeps_every_connection() {
        let (replay, pool) = harness();
        let key = local_key();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let key = key.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let connection = pool.acquire(&key, "").await.unwrap();
                        tokio::task::yield_now().await;
                        drop(connection);
                    }
                })
            })
            .collect();

        for result in join_all(tasks).await {
            result.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.created, replay.connections_opened());
        assert_eq!(stats.idle as u64, stats.created);
        assert_eq!(stats.reused + stats.created, 32 * 50);
        assert_eq!(stats.released, 32 * 50);
        assert!(stats.created <= 32);
    }

    #[tokio::test]
    async fn test_global_pool_installs_once() {
        let (_replay, pool) = harness();

        assert!(install_global_pool(Arc::clone(&pool)).is_ok());
        assert!(install_global_pool(Arc::clone(&pool)).is_err());
        assert!(global_pool().map_or(false, |global| Arc::ptr_eq(&global, &pool)));

        let other: Arc<dyn ConnectionProvider> = Arc::new(ReplayProvider::default());
        let resolved = global_pool_or_install(other);
        assert!(Arc::ptr_eq(&resolved, &pool));

        let config = SamplerConfig::new("Win32_OperatingSystem").with_properties(["Caption"]);
        let sampler = Sampler::with_global_pool(&config, Arc::new(CounterTypeRegistry::with_builtins())).unwrap();
        assert_eq!(sampler.class_name(), "Win32_OperatingSystem");
    }
}

// ============================================================================
// SECTION 19: SAMPLER TESTS
// ============================================================================

#[cfg(test)]
mod sampler_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RAW_CLASS: &str = "Win32_PerfRawData_PerfOS_Memory";
    const OS_CLASS: &str = "Win32_OperatingSystem";
    const DIFFERENCE: CounterType = CounterType::new(1);

    fn difference(previous: &PropertyBag, current: &PropertyBag, property: &str) -> PropertyValue {
        match (previous.get_f64(property), current.get_f64(property)) {
            (Some(p), Some(c)) => PropertyValue::Number(c - p),
            _ => PropertyValue::Null,
        }
    }

    fn difference_registry() -> Arc<dyn CalculatorRegistry> {
        Arc::new(CounterTypeRegistry::new().with(DIFFERENCE, difference))
    }

    fn harness() -> (ReplayProvider, Arc<ConnectionPool>) {
        let replay = ReplayProvider::default();
        let pool = ConnectionPool::shared(Arc::new(replay.clone()));
        (replay, pool)
    }

    fn raw_row(x: u64, timestamp: u64) -> ProviderRow {
        ProviderRow::default()
            .with_field(ProviderField::new("x", x).with_counter_type(DIFFERENCE))
            .with_field(ProviderField::new(TIMESTAMP_SYS100NS, timestamp))
            .with_field(ProviderField::new(FREQUENCY_SYS100NS, 10_000_000u64))
    }

    fn raw_config() -> SamplerConfig {
        SamplerConfig::new(RAW_CLASS).with_properties(["x"])
    }

    fn os_row() -> ProviderRow {
        ProviderRow::default()
            .with_field(ProviderField::new("FreePhysicalMemory", "2048"))
            .with_field(ProviderField::new("Caption", "Windows"))
    }

    fn os_config() -> SamplerConfig {
        SamplerConfig::new(OS_CLASS).with_properties(["FreePhysicalMemory", "Caption", "Version"])
    }

    async fn wait_for_sampling(sampler: &Sampler) {
        for _ in 0..10_000 {
            if sampler.state() == SamplingState::Sampling {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("sampler never entered the sampling state");
    }

    #[test]
    fn test_raw_sampler_selects_timestamps() {
        let (_replay, pool) = harness();
        let config = raw_config().with_filters(FilterSpec::new().or(FilterGroup::new().with("Name", "_Total")));
        let sampler = Sampler::new(&config, pool, difference_registry()).unwrap();

        assert!(sampler.is_raw_perf_class());
        assert_eq!(
            sampler.query_text(),
            "SELECT x,Timestamp_Sys100NS,Frequency_Sys100NS FROM Win32_PerfRawData_PerfOS_Memory WHERE ( Name = '_Total' )"
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (_replay, pool) = harness();
        let err = Sampler::new(&SamplerConfig::new(OS_CLASS), pool, difference_registry()).unwrap_err();
        assert_eq!(err, SamplerError::Config(ConfigError::missing_field("properties")));
    }

    #[tokio::test]
    async fn test_raw_warm_up_issues_bootstrap_query() {
        let (replay, pool) = harness();
        replay.push_snapshot(RAW_CLASS, vec![raw_row(100, 0)]);
        replay.push_snapshot(RAW_CLASS, vec![raw_row(160, 10_000_000)]);

        let sampler = Sampler::new(&raw_config(), pool, difference_registry()).unwrap();
        sampler.sample().await.unwrap();

        assert_eq!(replay.executed().len(), 2);
        let previous = sampler.previous_sample().unwrap().unwrap();
        let current = sampler.current_sample().unwrap().unwrap();
        assert_eq!(previous[0].get_f64("x"), Some(100.0));
        assert_eq!(current[0].get_f64("X"), Some(160.0));

        let formatted: Vec<PropertyBag> = sampler.iter().unwrap().collect();
        assert_eq!(formatted.len(), 1);
        assert_eq!(formatted[0].get("x"), Some(&PropertyValue::Number(60.0)));
        assert_eq!(
            formatted[0].get("timestamp_sys100ns"),
            Some(&PropertyValue::Number(10_000_000.0))
        );
        assert_eq!(sampler.get(0).unwrap(), formatted[0]);
        assert_eq!(sampler.stats().samples_completed, 1);
    }

    #[tokio::test]
    async fn test_qualifiers_requested_only_once() {
        let (replay, pool) = harness();
        replay.push_snapshot(RAW_CLASS, vec![raw_row(100, 0)]);
        replay.push_snapshot(RAW_CLASS, vec![raw_row(160, 10_000_000)]);
        replay.push_snapshot(RAW_CLASS, vec![raw_row(250, 20_000_000)]);

        let sampler = Sampler::new(&raw_config(), pool, difference_registry()).unwrap();
        sampler.sample().await.unwrap();
        sampler.sample().await.unwrap();

        let executed = replay.executed();
        assert_eq!(executed.len(), 3);
        assert!(executed[0].flags.contains(QueryFlags::USE_AMENDED_QUALIFIERS));
        assert!(!executed[1].flags.contains(QueryFlags::USE_AMENDED_QUALIFIERS));
        assert!(!executed[2].flags.contains(QueryFlags::USE_AMENDED_QUALIFIERS));
        for query in &executed {
            assert!(query.flags.contains(QueryFlags::sampling_default()));
        }

        assert_eq!(sampler.counter_types().get("X"), Some(DIFFERENCE));
        assert_eq!(sampler.stats().discovery_passes, 1);

        let formatted = sampler.get(0).unwrap();
        assert_eq!(formatted.get("x"), Some(&PropertyValue::Number(90.0)));
    }

    #[tokio::test]
    async fn test_empty_bootstrap_keeps_discovery_open() {
        let (replay, pool) = harness();
        replay.push_snapshot(RAW_CLASS, Vec::new());
        replay.push_snapshot(RAW_CLASS, vec![raw_row(100, 0)]);
        replay.push_snapshot(RAW_CLASS, vec![raw_row(130, 10_000_000)]);
        replay.push_snapshot(RAW_CLASS, vec![raw_row(170, 20_000_000)]);

        let sampler = Sampler::new(&raw_config(), pool, difference_registry()).unwrap();

        sampler.sample().await.unwrap();
        let executed = replay.executed();
        assert_eq!(executed.len(), 2);
        assert!(executed[1].flags.contains(QueryFlags::USE_AMENDED_QUALIFIERS));
        assert_eq!(sampler.iter().unwrap().count(), 0);

        // previous is still empty, so the next sample bootstraps again
        sampler.sample().await.unwrap();
        assert_eq!(replay.executed().len(), 4);
        assert_eq!(sampler.get(0).unwrap().get("x"), Some(&PropertyValue::Number(40.0)));
    }

    #[tokio::test]
    async fn test_formatted_class_passes_rows_through() {
        let (replay, pool) = harness();
        replay.push_snapshot(OS_CLASS, vec![os_row()]);

        let sampler = Sampler::new(&os_config(), pool, difference_registry()).unwrap();
        assert_eq!(sampler.len().unwrap(), 0);
        assert_eq!(sampler.iter().unwrap().count(), 0);

        sampler.sample().await.unwrap();

        let executed = replay.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(
            executed[0].statement,
            "SELECT FreePhysicalMemory,Caption,Version FROM Win32_OperatingSystem"
        );
        assert!(!executed[0].flags.contains(QueryFlags::USE_AMENDED_QUALIFIERS));

        let row = sampler.get(0).unwrap();
        assert_eq!(row.get("freephysicalmemory"), Some(&PropertyValue::Number(2048.0)));
        assert_eq!(row.get("CAPTION"), Some(&PropertyValue::Text("Windows".into())));
        assert_eq!(row.get("Version"), Some(&PropertyValue::Null));

        assert_eq!(
            sampler.get(1).unwrap_err(),
            SamplerError::IndexOutOfRange { index: 1, len: 1 }
        );
        assert_eq!(sampler.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sampler_equality_and_display_use_current_sample() {
        let (replay, pool) = harness();
        replay.push_snapshot(OS_CLASS, vec![os_row()]);

        let sampler = Sampler::new(&os_config(), pool, difference_registry()).unwrap();
        assert!(sampler == Sample::default());

        sampler.sample().await.unwrap();
        let expected = Sample::new(vec![PropertyBag::new()
            .with("FreePhysicalMemory", 2048.0)
            .with("Caption", "Windows")
            .with("Version", PropertyValue::Null)]);

        assert!(sampler == expected);
        assert_eq!(sampler.to_string(), expected.to_string());
    }

    #[tokio::test]
    async fn test_provider_fault_degrades_to_empty_sample() {
        let (replay, pool) = harness();
        replay.push_snapshot(OS_CLASS, vec![os_row()]);
        replay.fail_next(ProviderFault::failed("provider hiccup"));

        let sampler = Sampler::new(&os_config(), pool, difference_registry()).unwrap();
        sampler.sample().await.unwrap();

        assert_eq!(sampler.len().unwrap(), 0);
        assert_eq!(sampler.stats().provider_faults, 1);
        assert_eq!(sampler.state(), SamplingState::Idle);

        sampler.sample().await.unwrap();
        assert_eq!(sampler.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_class_degrades_to_empty_sample() {
        let (_replay, pool) = harness();
        let sampler = Sampler::new(&os_config(), pool, difference_registry()).unwrap();

        sampler.sample().await.unwrap();
        assert_eq!(sampler.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_fault_propagates() {
        let (replay, pool) = harness();
        replay.push_snapshot(RAW_CLASS, vec![raw_row(100, 0)]);
        replay.fail_next(ProviderFault::failed("bootstrap failed"));

        let sampler = Sampler::new(&raw_config(), pool, difference_registry()).unwrap();
        let err = sampler.sample().await.unwrap_err();

        assert!(matches!(
            err,
            SamplerError::Provider(ProviderFault { code: ProviderFault::WBEM_E_FAILED, .. })
        ));
        assert_eq!(sampler.state(), SamplingState::Idle);
        assert_eq!(sampler.previous_sample().unwrap(), None);
        assert_eq!(sampler.current_sample().unwrap(), None);
        assert!(!sampler.engine.counter_types().is_discovered());
    }

    #[tokio::test]
    async fn test_connection_failure_propagates() {
        let (replay, pool) = harness();
        replay.refuse_connections(true);

        let sampler = Sampler::new(&os_config(), pool, difference_registry()).unwrap();
        let err = sampler.sample().await.unwrap_err();
        assert!(matches!(err, SamplerError::Connection(_)));
        assert_eq!(err.recovery_hint(), RecoveryHint::Reconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_and_returns_connection() {
        let (replay, pool) = harness();
        replay.push_snapshot(OS_CLASS, vec![os_row()]);
        replay.set_latency(Some(Duration::from_secs(5)));

        let config = os_config().with_timeout(Duration::from_millis(500));
        let sampler = Sampler::new(&config, Arc::clone(&pool), difference_registry()).unwrap();

        let err = sampler.sample().await.unwrap_err();
        assert_eq!(
            err,
            SamplerError::QueryTimeout {
                class_name: OS_CLASS.into(),
                timeout_ms: 500
            }
        );
        assert_eq!(sampler.state(), SamplingState::Idle);
        assert_eq!(pool.idle_count(&config.connection_key()), 1);
        assert_eq!(sampler.stats().timeouts, 1);
        assert_eq!(sampler.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reads_rejected_while_sampling() {
        let (replay, pool) = harness();
        replay.push_snapshot(OS_CLASS, vec![os_row()]);
        replay.set_latency(Some(Duration::from_millis(200)));

        let sampler = Arc::new(Sampler::new(&os_config(), pool, difference_registry()).unwrap());
        let task = {
            let sampler = Arc::clone(&sampler);
            tokio::spawn(async move { sampler.sample().await })
        };

        wait_for_sampling(&sampler).await;
        assert!(matches!(sampler.len(), Err(SamplerError::InvalidState { .. })));
        assert!(matches!(sampler.iter(), Err(SamplerError::InvalidState { .. })));
        assert!(matches!(sampler.get(0), Err(SamplerError::InvalidState { .. })));
        assert!(matches!(
            sampler.sample().await,
            Err(SamplerError::InvalidState { operation: "sample" })
        ));

        task.await.unwrap().unwrap();
        assert_eq!(sampler.state(), SamplingState::Idle);
        assert_eq!(sampler.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_sample_resets_state() {
        let (replay, pool) = harness();
        replay.push_snapshot(OS_CLASS, vec![os_row()]);
        replay.set_latency(Some(Duration::from_secs(30)));

        let config = os_config();
        let sampler = Arc::new(Sampler::new(&config, Arc::clone(&pool), difference_registry()).unwrap());
        let task = {
            let sampler = Arc::clone(&sampler);
            tokio::spawn(async move { sampler.sample().await })
        };

        wait_for_sampling(&sampler).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(sampler.state(), SamplingState::Idle);
        assert_eq!(pool.idle_count(&config.connection_key()), 1);
        assert_eq!(sampler.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_samplers_share_pooled_connections() {
        let (replay, pool) = harness();
        replay.push_snapshot(OS_CLASS, vec![os_row()]);
        replay.push_snapshot(RAW_CLASS, vec![raw_row(1, 0)]);

        let os = Sampler::new(&os_config(), Arc::clone(&pool), difference_registry()).unwrap();
        let memory = Sampler::new(&raw_config(), Arc::clone(&pool), difference_registry()).unwrap();

        os.sample().await.unwrap();
        memory.sample().await.unwrap();
        os.sample().await.unwrap();

        assert_eq!(replay.connections_opened(), 1);
        assert_eq!(pool.stats().reused, 3);
    }
}

// ============================================================================
// SECTION 20: CALCULATOR & REPLAY TESTS
// ============================================================================


#[cfg(test)]
mod replay_tests {
    use super::*;

    const RECORDING: &str = r#"{
        "Win32_PerfRawData_PerfOS_Processor": [
            [[{"name": "Name", "value": "_Total"},
              {"name": "PercentProcessorTime", "value": 100, "qualifiers": {"CounterType": 542180608}}]],
            [[{"name": "Name", "value": "_Total"},
              {"name": "PercentProcessorTime", "value": 300, "qualifiers": {"CounterType": 542180608}}]]
        ]
    }"#;

    const SELECT_PROCESSOR: &str = "SELECT Name,PercentProcessorTime FROM Win32_PerfRawData_PerfOS_Processor";

    async fn connect(provider: &ReplayProvider) -> Box<dyn Connection> {
        provider.connect(DEFAULT_HOST, DEFAULT_NAMESPACE, "", "").await.unwrap()
    }

    #[test]
    fn test_statement_class() {
        assert_eq!(statement_class("SELECT * FROM Win32_Process WHERE ( Name = 'x' )"), Some("Win32_Process"));
        assert_eq!(statement_class("select a from Win32_Process"), Some("Win32_Process"));
        assert_eq!(statement_class("SELECT *"), None);
    }

    #[tokio::test]
    async fn test_snapshots_replay_in_order_and_last_repeats() {
        let provider = ReplayProvider::new(ReplayRecording::from_json_str(RECORDING).unwrap());
        let connection = connect(&provider).await;
        let flags = QueryFlags::sampling_default();

        let values: Vec<PropertyValue> = {
            let mut values = Vec::new();
            for _ in 0..3 {
                let rows = connection.execute(SELECT_PROCESSOR, flags).await.unwrap();
                values.push(rows[0].fields()[1].value.clone());
            }
            values
        };
        assert_eq!(
            values,
            vec![
                PropertyValue::Integer(100),
                PropertyValue::Integer(300),
                PropertyValue::Integer(300)
            ]
        );
        assert_eq!(provider.executed().len(), 3);
    }

    #[tokio::test]
    async fn test_qualifiers_only_with_amended_flag() {
        let provider = ReplayProvider::new(ReplayRecording::from_json_str(RECORDING).unwrap());
        let connection = connect(&provider).await;

        let plain = connection
            .execute(SELECT_PROCESSOR, QueryFlags::sampling_default())
            .await
            .unwrap();
        assert_eq!(plain[0].fields()[1].counter_type(), None);

        let amended = connection
            .execute(SELECT_PROCESSOR, QueryFlags::sampling_default().with_qualifiers(true))
            .await
            .unwrap();
        assert_eq!(amended[0].fields()[1].counter_type(), Some(CounterType::PERF_100NSEC_TIMER));
    }

    #[tokio::test]
    async fn test_unknown_class_is_a_provider_fault() {
        let provider = ReplayProvider::default();
        let connection = connect(&provider).await;

        let fault = connection
            .execute("SELECT * FROM Win32_Nothing", QueryFlags::NONE)
            .await
            .unwrap_err();
        assert_eq!(fault.code, ProviderFault::WBEM_E_INVALID_CLASS);

        let fault = connection.execute("garbage", QueryFlags::NONE).await.unwrap_err();
        assert_eq!(fault.code, ProviderFault::WBEM_E_INVALID_QUERY);
    }

    #[test]
    fn test_recording_file_errors() {
        assert!(matches!(
            ReplayRecording::from_json_file("/nonexistent/replay.json"),
            Err(ConfigError::FileNotFound { .. })
        ));
        assert!(matches!(
            ReplayRecording::from_json_str("{not json"),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[tokio::test]
    async fn test_sampler_over_recording_uses_builtin_calculators() {
        let provider = ReplayProvider::new(
            ReplayRecording::from_json_str(RECORDING)
                .unwrap()
                .with_snapshot("Win32_OperatingSystem", Vec::new()),
        );
        let pool = ConnectionPool::shared(Arc::new(provider.clone()));
        let config = SamplerConfig::new("Win32_PerfRawData_PerfOS_Processor")
            .with_properties(["Name", "PercentProcessorTime"]);
        let sampler = Sampler::new(&config, pool, Arc::new(CounterTypeRegistry::with_builtins())).unwrap();

        sampler.sample().await.unwrap();

        // Timestamp_Sys100NS is absent from the recording, so the timer has no elapsed time
        let row = sampler.get(0).unwrap();
        assert_eq!(row.get("PercentProcessorTime"), Some(&PropertyValue::Null));
        assert_eq!(row.get("Name"), Some(&PropertyValue::Text("_Total".into())));
        assert_eq!(
            sampler.counter_types().get("percentprocessortime"),
            Some(CounterType::PERF_100NSEC_TIMER)
        );
    }
}
