//! TOML configuration.
//!
//! Keys are kebab-case and every option has a default, so an empty file is
//! a valid configuration. [`load_config`] reads the file, applies the
//! `DOCSYNC_*` environment overrides, resolves derived settings (cluster and
//! worker naming), and validates once. Any error here is fatal at startup.
//!
//! ```toml
//! source-url = "sqlite:./data/source.sqlite"
//! elasticsearch-urls = ["http://localhost:9200"]
//! direct-read-namespaces = ["shop.orders"]
//! resume = true
//!
//! [[mapping]]
//! namespace = "shop.orders"
//! index = "orders"
//!
//! [[relate]]
//! namespace = "shop.customers"
//! with-namespace = "shop.orders"
//! src-field = "_id"
//! match-field = "customer_id"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use docsync_core::meta::IndexMapping;
use docsync_core::relation::{MatchFieldType, Relation};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::migrate::AdminTables;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub source_url: String,
    #[serde(alias = "config-database-name")]
    pub admin_namespace: String,

    pub elasticsearch_urls: Vec<String>,
    pub elasticsearch_user: Option<String>,
    pub elasticsearch_password: Option<String>,
    pub elasticsearch_pem_file: Option<PathBuf>,
    pub elasticsearch_validate_pem_file: bool,
    /// Seconds; 0 means no timeout.
    pub elasticsearch_client_timeout: u64,
    pub elasticsearch_retry: bool,
    pub elasticsearch_max_conns: usize,
    /// -1 means no document-count threshold.
    pub elasticsearch_max_docs: i64,
    pub elasticsearch_max_bytes: usize,
    pub elasticsearch_max_seconds: Option<u64>,

    pub direct_read_namespaces: Vec<String>,
    pub direct_read_split_max: i32,
    pub direct_read_concur: usize,
    pub direct_read_bounded: bool,
    pub direct_read_stateful: bool,
    pub direct_read_dynamic_include_regex: Option<String>,
    pub direct_read_dynamic_exclude_regex: Option<String>,
    pub exit_after_direct_reads: bool,

    pub change_stream_namespaces: Vec<String>,
    pub disable_change_events: bool,
    pub replay: bool,
    pub resume: bool,
    pub resume_name: String,
    pub resume_strategy: u8,
    pub resume_from_timestamp: i64,
    pub resume_write_unsafe: bool,

    pub namespace_regex: Option<String>,
    pub namespace_exclude_regex: Option<String>,
    pub namespace_drop_regex: Option<String>,
    pub namespace_drop_exclude_regex: Option<String>,

    pub cluster_name: Option<String>,
    pub worker: Option<String>,
    pub workers: Vec<String>,

    pub delete_strategy: u8,
    pub delete_index_pattern: String,
    pub routing_namespaces: Vec<String>,
    pub dropped_databases: bool,
    pub dropped_collections: bool,

    pub index_as_update: bool,
    pub index_oplog_time: bool,
    pub oplog_ts_field_name: String,
    pub oplog_date_field_name: String,
    pub oplog_date_field_format: String,

    pub index_files: bool,
    pub file_namespaces: Vec<String>,
    /// Bytes; 0 means unlimited.
    pub max_file_size: u64,
    pub disable_file_pipeline_put: bool,

    pub time_machine_namespaces: Vec<String>,
    pub time_machine_index_prefix: String,
    pub time_machine_index_suffix: String,
    pub time_machine_direct_reads: bool,

    pub index_workers: usize,
    pub relate_threads: usize,
    pub relate_buffer: usize,
    pub file_downloaders: usize,
    pub post_processors: usize,
    pub channel_size: usize,

    pub fail_fast: bool,
    pub verbose: bool,
    pub log_format: String,

    pub enable_http_server: bool,
    pub http_server_addr: String,
    pub stats: bool,
    pub stats_duration: u64,

    pub graceful_shutdown_timeout: u64,
    pub heartbeat_interval: u64,
    pub checkpoint_interval: u64,
    pub lease_ttl: u64,
    pub shard_discovery_interval: u64,

    #[serde(rename = "mapping")]
    pub mappings: Vec<IndexMapping>,
    #[serde(rename = "relate")]
    pub relates: Vec<RelateConfig>,
    #[serde(rename = "script")]
    pub scripts: Vec<ScriptConfig>,
    #[serde(rename = "filter")]
    pub filters: Vec<ScriptConfig>,
    #[serde(rename = "pipeline")]
    pub pipelines: Vec<ScriptConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_url: "sqlite:./data/source.sqlite".to_string(),
            admin_namespace: "docsync".to_string(),
            elasticsearch_urls: vec!["http://localhost:9200".to_string()],
            elasticsearch_user: None,
            elasticsearch_password: None,
            elasticsearch_pem_file: None,
            elasticsearch_validate_pem_file: true,
            elasticsearch_client_timeout: 0,
            elasticsearch_retry: false,
            elasticsearch_max_conns: 4,
            elasticsearch_max_docs: -1,
            elasticsearch_max_bytes: 8 * 1024 * 1024,
            elasticsearch_max_seconds: None,
            direct_read_namespaces: Vec::new(),
            direct_read_split_max: 9,
            direct_read_concur: 4,
            direct_read_bounded: false,
            direct_read_stateful: false,
            direct_read_dynamic_include_regex: None,
            direct_read_dynamic_exclude_regex: None,
            exit_after_direct_reads: false,
            change_stream_namespaces: vec![String::new()],
            disable_change_events: false,
            replay: false,
            resume: false,
            resume_name: "default".to_string(),
            resume_strategy: 0,
            resume_from_timestamp: 0,
            resume_write_unsafe: false,
            namespace_regex: None,
            namespace_exclude_regex: None,
            namespace_drop_regex: None,
            namespace_drop_exclude_regex: None,
            cluster_name: None,
            worker: None,
            workers: Vec::new(),
            delete_strategy: 0,
            delete_index_pattern: "*".to_string(),
            routing_namespaces: Vec::new(),
            dropped_databases: true,
            dropped_collections: true,
            index_as_update: false,
            index_oplog_time: false,
            oplog_ts_field_name: "oplog_ts".to_string(),
            oplog_date_field_name: "oplog_date".to_string(),
            oplog_date_field_format: "%Y/%m/%d %H:%M:%S".to_string(),
            index_files: false,
            file_namespaces: Vec::new(),
            max_file_size: 0,
            disable_file_pipeline_put: false,
            time_machine_namespaces: Vec::new(),
            time_machine_index_prefix: "log".to_string(),
            time_machine_index_suffix: "%Y-%m-%d".to_string(),
            time_machine_direct_reads: false,
            index_workers: 5,
            relate_threads: 10,
            relate_buffer: 1000,
            file_downloaders: 10,
            post_processors: 10,
            channel_size: 512,
            fail_fast: false,
            verbose: false,
            log_format: "text".to_string(),
            enable_http_server: false,
            http_server_addr: "127.0.0.1:8080".to_string(),
            stats: false,
            stats_duration: 30,
            graceful_shutdown_timeout: 10,
            heartbeat_interval: 10,
            checkpoint_interval: 10,
            lease_ttl: 30,
            shard_discovery_interval: 30,
            mappings: Vec::new(),
            relates: Vec::new(),
            scripts: Vec::new(),
            filters: Vec::new(),
            pipelines: Vec::new(),
        }
    }
}

/// `[[relate]]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelateConfig {
    pub namespace: String,
    pub with_namespace: String,
    #[serde(default)]
    pub src_field: Option<String>,
    #[serde(default)]
    pub match_field: Option<String>,
    #[serde(default)]
    pub match_field_type: Option<String>,
    #[serde(default)]
    pub keep_src: bool,
    #[serde(default)]
    pub max_depth: i32,
    #[serde(default)]
    pub dot_notation: bool,
}

impl RelateConfig {
    pub fn to_relation(&self) -> Result<Relation> {
        let mut relation = Relation::new(&self.namespace, &self.with_namespace)
            .fields(
                self.src_field.as_deref().unwrap_or(""),
                self.match_field.as_deref().unwrap_or(""),
            )
            .keep_src(self.keep_src)
            .max_depth(self.max_depth)
            .dot_notation(self.dot_notation);
        if let Some(ty) = &self.match_field_type {
            match MatchFieldType::parse(ty) {
                Some(t) => relation = relation.match_type(t),
                None => bail!(
                    "relate {} -> {}: unknown match-field-type '{}'. Must be objectId, string, int, long, or decimal.",
                    self.namespace,
                    self.with_namespace,
                    ty
                ),
            }
        }
        Ok(relation)
    }
}

/// `[[script]]`, `[[filter]]` and `[[pipeline]]` tables.
///
/// Keys other than `namespace`, `path`, `script` and `timeout` are exposed
/// to the script as the global `config` table, with `${VAR}` expanded.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptConfig {
    /// Omitted for a global plugin.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub script: Option<String>,
    /// Seconds a single call may run.
    #[serde(default = "default_script_timeout")]
    pub timeout: u64,
    #[serde(flatten)]
    pub extra: toml::Table,
}

fn default_script_timeout() -> u64 {
    5
}

impl ScriptConfig {
    /// Script source, read from `path` or taken inline.
    pub fn source(&self) -> Result<String> {
        match (&self.path, &self.script) {
            (Some(path), _) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read script: {}", path.display())),
            (None, Some(src)) => Ok(src.clone()),
            (None, None) => bail!("script entry needs either 'path' or 'script'"),
        }
    }

    /// Name used in logs.
    pub fn label(&self) -> String {
        match (&self.path, &self.namespace) {
            (Some(p), _) => p.display().to_string(),
            (None, Some(ns)) => format!("inline:{}", ns),
            (None, None) => "inline:global".to_string(),
        }
    }
}

/// How deletes locate the indexed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStrategy {
    Stateless,
    Stateful,
    Ignore,
}

/// What a resume position is recorded as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStrategy {
    Timestamp,
    Token,
}

impl Config {
    pub fn delete_strategy(&self) -> DeleteStrategy {
        match self.delete_strategy {
            1 => DeleteStrategy::Stateful,
            2 => DeleteStrategy::Ignore,
            _ => DeleteStrategy::Stateless,
        }
    }

    pub fn resume_strategy(&self) -> ResumeStrategy {
        match self.resume_strategy {
            1 => ResumeStrategy::Token,
            _ => ResumeStrategy::Timestamp,
        }
    }

    pub fn has_direct_reads(&self) -> bool {
        !self.direct_read_namespaces.is_empty()
    }

    /// Direct reads configured as `[""]` discover namespaces at startup.
    pub fn direct_reads_dynamic(&self) -> bool {
        self.direct_read_namespaces.len() == 1 && self.direct_read_namespaces[0].is_empty()
    }

    /// Flush interval: configured, or 1s (5s when direct reads run).
    pub fn max_seconds(&self) -> u64 {
        self.elasticsearch_max_seconds
            .unwrap_or(if self.has_direct_reads() { 5 } else { 1 })
    }

    pub fn max_docs(&self) -> Option<usize> {
        (self.elasticsearch_max_docs > 0).then_some(self.elasticsearch_max_docs as usize)
    }

    pub fn json_logs(&self) -> bool {
        self.log_format == "json"
    }

    /// Starting timestamp from `resume-from-timestamp`. Values that fit in
    /// 32 bits are seconds; larger ones are already `seconds << 32 | ordinal`.
    pub fn resume_from(&self) -> Option<docsync_core::models::OpTimestamp> {
        use docsync_core::models::OpTimestamp;
        match self.resume_from_timestamp {
            0 => None,
            ts if ts > 0 && ts <= u32::MAX as i64 => Some(OpTimestamp::new(ts as u32, 0)),
            ts => Some(OpTimestamp::from_version(ts)),
        }
    }

    pub fn relations(&self) -> Result<Vec<Relation>> {
        self.relates.iter().map(|r| r.to_relation()).collect()
    }

    /// Copy with credentials masked, for display.
    pub fn redacted(&self) -> Config {
        let mut copy = self.clone();
        if copy.elasticsearch_password.is_some() {
            copy.elasticsearch_password = Some("********".to_string());
        }
        copy.elasticsearch_urls = copy
            .elasticsearch_urls
            .iter()
            .map(|u| redact_url(u))
            .collect();
        copy.source_url = redact_url(&copy.source_url);
        copy
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DOCSYNC_SOURCE_URL") {
            self.source_url = v;
        }
        if let Ok(v) = std::env::var("DOCSYNC_ELASTICSEARCH_URLS") {
            self.elasticsearch_urls = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("DOCSYNC_ELASTICSEARCH_USER") {
            self.elasticsearch_user = Some(v);
        }
        if let Ok(v) = std::env::var("DOCSYNC_ELASTICSEARCH_PASSWORD") {
            self.elasticsearch_password = Some(v);
        }
        if let Ok(v) = std::env::var("DOCSYNC_CLUSTER_NAME") {
            self.cluster_name = Some(v);
        }
        if let Ok(v) = std::env::var("DOCSYNC_WORKER") {
            self.worker = Some(v);
        }
    }

    /// Derive the resume name from cluster and worker names.
    fn resolve(&mut self) {
        match (&self.cluster_name, &self.worker) {
            (Some(cluster), Some(worker)) => {
                self.resume_name = format!("{}:{}", cluster, worker);
                self.resume = true;
            }
            (Some(cluster), None) => {
                self.resume_name = cluster.clone();
                self.resume = true;
            }
            (None, Some(worker)) => self.resume_name = worker.clone(),
            (None, None) => {}
        }
    }

    /// Check every rule that would otherwise fail later at runtime.
    pub fn validate(&self) -> Result<()> {
        for (name, re) in [
            ("namespace-regex", &self.namespace_regex),
            ("namespace-exclude-regex", &self.namespace_exclude_regex),
            ("namespace-drop-regex", &self.namespace_drop_regex),
            ("namespace-drop-exclude-regex", &self.namespace_drop_exclude_regex),
            (
                "direct-read-dynamic-include-regex",
                &self.direct_read_dynamic_include_regex,
            ),
            (
                "direct-read-dynamic-exclude-regex",
                &self.direct_read_dynamic_exclude_regex,
            ),
        ] {
            compile_regex(name, re)?;
        }

        if self.elasticsearch_urls.is_empty() {
            bail!("elasticsearch-urls must not be empty");
        }
        AdminTables::new(&self.admin_namespace)?;
        if self.delete_strategy > 2 {
            bail!(
                "delete-strategy must be 0 (stateless), 1 (stateful) or 2 (ignore), got {}",
                self.delete_strategy
            );
        }
        if self.resume_strategy > 1 {
            bail!(
                "resume-strategy must be 0 (timestamp) or 1 (token), got {}",
                self.resume_strategy
            );
        }
        if !self.workers.is_empty() {
            match &self.worker {
                None => bail!("workers is set but worker is not"),
                Some(w) if !self.workers.contains(w) => {
                    bail!("worker '{}' is not listed in workers", w)
                }
                _ => {}
            }
        }
        if self.index_files && self.file_namespaces.is_empty() {
            bail!("index-files requires file-namespaces");
        }
        if self.relate_buffer == 0 || self.channel_size == 0 {
            bail!("relate-buffer and channel-size must be > 0");
        }
        if self.index_workers == 0 {
            bail!("index-workers must be > 0");
        }
        match self.log_format.as_str() {
            "text" | "json" => {}
            other => bail!("Unknown log-format: '{}'. Must be text or json.", other),
        }

        for r in &self.relates {
            for ns in [&r.namespace, &r.with_namespace] {
                if !is_collection_namespace(ns) {
                    bail!("relate namespace '{}' must be of the form db.collection", ns);
                }
            }
            r.to_relation()?;
        }
        for m in &self.mappings {
            if !is_collection_namespace(&m.namespace) {
                bail!("mapping namespace '{}' must be of the form db.collection", m.namespace);
            }
        }

        if let Some(pem) = &self.elasticsearch_pem_file {
            if self.elasticsearch_validate_pem_file {
                std::fs::read(pem).with_context(|| {
                    format!("elasticsearch-pem-file is not readable: {}", pem.display())
                })?;
            }
        }

        for s in self.scripts.iter().chain(&self.filters).chain(&self.pipelines) {
            s.source()?;
        }
        Ok(())
    }

    pub fn namespace_regex(&self) -> Result<Option<Regex>> {
        compile_regex("namespace-regex", &self.namespace_regex)
    }

    pub fn namespace_exclude_regex(&self) -> Result<Option<Regex>> {
        compile_regex("namespace-exclude-regex", &self.namespace_exclude_regex)
    }

    pub fn namespace_drop_regex(&self) -> Result<Option<Regex>> {
        compile_regex("namespace-drop-regex", &self.namespace_drop_regex)
    }

    pub fn namespace_drop_exclude_regex(&self) -> Result<Option<Regex>> {
        compile_regex(
            "namespace-drop-exclude-regex",
            &self.namespace_drop_exclude_regex,
        )
    }

    /// Parse a configuration document, as [`load_config`] does for files.
    pub fn from_toml_str(content: &str) -> Result<Config> {
        let mut config: Config =
            toml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.apply_env_overrides();
        config.resolve();
        config.validate()?;
        Ok(config)
    }
}

pub fn compile_regex(name: &str, pattern: &Option<String>) -> Result<Option<Regex>> {
    pattern
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| Regex::new(p).with_context(|| format!("{} is not a valid regex: {}", name, p)))
        .transpose()
}

fn is_collection_namespace(ns: &str) -> bool {
    matches!(ns.split_once('.'), Some((db, col)) if !db.is_empty() && !col.is_empty())
}

pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://****@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_toml_str(&content)
}
