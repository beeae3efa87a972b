#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use sb_core::ExecutionMode;
use sb_serialize::{DecodeMode, Summary};
use tracing::debug;

/// Collection that legacy summary nodes join when no other is requested.
pub const SUMMARIES_COLLECTION: &str = "summaries";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Policy,
    Construction,
    Execution,
    Emission,
    Import,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        let summary = summary.into();
        debug!(?kind, %summary, "evidence recorded");
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary,
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn of_kind(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }
}

/// Decides, per step, whether a deferred summary write is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingPolicy {
    #[default]
    Always,
    Never,
    EveryNSteps(u64),
}

impl RecordingPolicy {
    #[must_use]
    pub fn should_record(self, step: i64) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::EveryNSteps(0) => false,
            Self::EveryNSteps(n) => i64::try_from(n).is_ok_and(|n| step.rem_euclid(n) == 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    pub mode: ExecutionMode,
    pub initial_step: Option<i64>,
    pub recording: RecordingPolicy,
}

/// A summary emitted by a deferred write, stamped with the step it was
/// recorded at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: i64,
    pub summary: Summary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    InvalidName { name: String },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName { name } => write!(f, "'{name}' is not a valid node name"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Ambient state shared by graph construction and execution: global step,
/// naming scopes, collections, recording policy and the emitted-record
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    ledger: EvidenceLedger,
    global_step: Option<i64>,
    recording: RecordingPolicy,
    scopes: Vec<String>,
    used_names: BTreeMap<String, usize>,
    collections: BTreeMap<String, Vec<String>>,
    emitted: Vec<StepRecord>,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self::with_config(RuntimeConfig {
            mode,
            ..RuntimeConfig::default()
        })
    }

    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!(
                "mode initialized to {:?} recording={:?} initial_step={:?}",
                config.mode, config.recording, config.initial_step
            ),
        );
        Self {
            mode: config.mode,
            ledger,
            global_step: config.initial_step,
            recording: config.recording,
            scopes: Vec::new(),
            used_names: BTreeMap::new(),
            collections: BTreeMap::new(),
            emitted: Vec::new(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.ledger
            .record(EvidenceKind::Policy, format!("mode switched to {mode:?}"));
    }

    #[must_use]
    pub fn decode_mode(&self) -> DecodeMode {
        match self.mode {
            ExecutionMode::Strict => DecodeMode::Strict,
            ExecutionMode::Hardened => DecodeMode::Hardened,
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    #[must_use]
    pub fn global_step(&self) -> Option<i64> {
        self.global_step
    }

    pub fn set_global_step(&mut self, step: i64) {
        self.global_step = Some(step);
    }

    /// The global step, created at 0 if absent.
    pub fn get_or_create_global_step(&mut self) -> i64 {
        *self.global_step.get_or_insert(0)
    }

    /// Advances the global step, creating it at 0 first if absent.
    pub fn increment_global_step(&mut self) -> i64 {
        let next = self.global_step.unwrap_or(0).saturating_add(1);
        self.global_step = Some(next);
        next
    }

    #[must_use]
    pub fn recording(&self) -> RecordingPolicy {
        self.recording
    }

    pub fn set_recording(&mut self, recording: RecordingPolicy) {
        self.recording = recording;
        self.ledger.record(
            EvidenceKind::Policy,
            format!("recording policy switched to {recording:?}"),
        );
    }

    /// The active scope prefix, e.g. `"train/eval"`, or empty at the root.
    #[must_use]
    pub fn current_scope(&self) -> &str {
        self.scopes.last().map_or("", String::as_str)
    }

    /// Reserves a graph-unique name under the active scope. Repeated names
    /// get `_1`, `_2`, ... suffixes.
    pub fn unique_name(&mut self, name: &str) -> Result<String, RuntimeError> {
        validate_name(name)?;
        let base = match self.current_scope() {
            "" => name.to_string(),
            scope => format!("{scope}/{name}"),
        };

        let mut candidate = base.clone();
        let mut suffix = self.used_names.get(&base).copied().unwrap_or(0);
        while self.used_names.contains_key(&candidate) {
            suffix += 1;
            candidate = format!("{base}_{suffix}");
        }
        self.used_names.insert(base, suffix);
        self.used_names.entry(candidate.clone()).or_insert(0);
        Ok(candidate)
    }

    /// Runs `build` inside a fresh unique scope named after `name`, passing
    /// the scope's full name. The scope is closed even if `build` fails.
    pub fn with_scope<T, E>(
        &mut self,
        name: &str,
        build: impl FnOnce(&mut Self, &str) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<RuntimeError>,
    {
        let scope = self.unique_name(name)?;
        self.scopes.push(scope.clone());
        let result = build(self, scope.as_str());
        self.scopes.pop();
        result
    }

    pub fn add_to_collection(&mut self, key: &str, node_name: impl Into<String>) {
        self.collections
            .entry(key.to_string())
            .or_default()
            .push(node_name.into());
    }

    #[must_use]
    pub fn collection(&self, key: &str) -> &[String] {
        self.collections.get(key).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn collection_keys(&self) -> Vec<&str> {
        self.collections.keys().map(String::as_str).collect()
    }

    pub fn emit(&mut self, step: i64, summary: Summary) {
        self.ledger.record(
            EvidenceKind::Emission,
            format!(
                "emitted step={step} tags={:?}",
                summary
                    .value
                    .iter()
                    .map(|value| value.tag.as_str())
                    .collect::<Vec<_>>()
            ),
        );
        self.emitted.push(StepRecord { step, summary });
    }

    #[must_use]
    pub fn records(&self) -> &[StepRecord] {
        &self.emitted
    }

    pub fn drain_records(&mut self) -> Vec<StepRecord> {
        std::mem::take(&mut self.emitted)
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::with_config(RuntimeConfig::default())
    }
}

/// Names are `/`-separated components; each starts with an ASCII
/// alphanumeric, `.` or `_` and continues with those or `-`.
fn validate_name(name: &str) -> Result<(), RuntimeError> {
    let valid = name.split('/').all(|component| {
        let mut chars = component.chars();
        let valid_first = chars
            .next()
            .is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == '.' || ch == '_');
        valid_first && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-'))
    });
    if valid {
        Ok(())
    } else {
        Err(RuntimeError::InvalidName {
            name: name.to_string(),
        })
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use sb_core::ExecutionMode;
    use sb_serialize::{DecodeMode, Summary};

    use super::{
        EvidenceKind, RecordingPolicy, RuntimeConfig, RuntimeContext, RuntimeError,
        SUMMARIES_COLLECTION,
    };

    #[test]
    fn ledger_records_policy_and_custom_events() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.ledger_mut()
            .record(EvidenceKind::Construction, "built node");

        assert_eq!(ctx.ledger().len(), 2);
        assert_eq!(ctx.ledger().entries()[1].kind, EvidenceKind::Construction);
        assert_eq!(ctx.ledger().of_kind(EvidenceKind::Policy).count(), 1);
    }

    #[test]
    fn mode_switch_records_event_and_changes_decode_mode() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        assert_eq!(ctx.decode_mode(), DecodeMode::Strict);
        ctx.set_mode(ExecutionMode::Hardened);

        assert_eq!(ctx.mode(), ExecutionMode::Hardened);
        assert_eq!(ctx.decode_mode(), DecodeMode::Hardened);
        assert_eq!(ctx.ledger().len(), 2);
    }

    #[test]
    fn global_step_is_created_on_first_increment() {
        let mut ctx = RuntimeContext::default();
        assert_eq!(ctx.global_step(), None);
        assert_eq!(ctx.increment_global_step(), 1);

        let mut fresh = RuntimeContext::default();
        assert_eq!(fresh.get_or_create_global_step(), 0);
        assert_eq!(fresh.global_step(), Some(0));
        ctx.set_global_step(41);
        assert_eq!(ctx.increment_global_step(), 42);
        assert_eq!(ctx.global_step(), Some(42));
    }

    #[test]
    fn config_seeds_step_and_recording() {
        let ctx = RuntimeContext::with_config(RuntimeConfig {
            mode: ExecutionMode::Hardened,
            initial_step: Some(10),
            recording: RecordingPolicy::Never,
        });
        assert_eq!(ctx.global_step(), Some(10));
        assert_eq!(ctx.recording(), RecordingPolicy::Never);
        assert_eq!(ctx.mode(), ExecutionMode::Hardened);
    }

    #[test]
    fn recording_policy_every_n_steps() {
        let policy = RecordingPolicy::EveryNSteps(5);
        assert!(policy.should_record(0));
        assert!(!policy.should_record(3));
        assert!(policy.should_record(10));
        assert!(!RecordingPolicy::EveryNSteps(0).should_record(0));
        assert!(!RecordingPolicy::Never.should_record(0));
        assert!(RecordingPolicy::Always.should_record(-7));
    }

    #[test]
    fn unique_names_get_numeric_suffixes() {
        let mut ctx = RuntimeContext::default();
        assert_eq!(ctx.unique_name("loss").expect("valid"), "loss");
        assert_eq!(ctx.unique_name("loss").expect("valid"), "loss_1");
        assert_eq!(ctx.unique_name("loss").expect("valid"), "loss_2");
        assert_eq!(ctx.unique_name("loss_1_x").expect("valid"), "loss_1_x");
    }

    #[test]
    fn slash_separated_names_nest_like_scopes() {
        let mut ctx = RuntimeContext::default();
        assert_eq!(ctx.unique_name("train/loss").expect("valid"), "train/loss");
        assert_eq!(ctx.unique_name("train/loss").expect("valid"), "train/loss_1");
        let inner = ctx
            .with_scope("eval/top-1", |ctx, _| ctx.unique_name("acc"))
            .expect("nested name opens a scope");
        assert_eq!(inner, "eval/top-1/acc");
    }

    #[test]
    fn scopes_nest_and_close_after_error() {
        let mut ctx = RuntimeContext::default();
        let inner = ctx
            .with_scope("train", |ctx, scope| {
                assert_eq!(scope, "train");
                ctx.with_scope("loss", |ctx, scope| {
                    assert_eq!(ctx.current_scope(), "train/loss");
                    Ok::<_, RuntimeError>(scope.to_string())
                })
            })
            .expect("scopes build");
        assert_eq!(inner, "train/loss");
        assert_eq!(ctx.current_scope(), "");

        let failed: Result<(), RuntimeError> =
            ctx.with_scope("broken", |ctx, _| ctx.unique_name("bad name").map(|_| ()));
        assert!(failed.is_err());
        assert_eq!(ctx.current_scope(), "");
    }

    #[test]
    fn invalid_names_are_rejected() {
        let mut ctx = RuntimeContext::default();
        for name in ["", "/abs", "has space", "-dash", "trailing/", "a//b"] {
            let err = ctx.unique_name(name).expect_err("invalid name must fail");
            assert_eq!(
                err,
                RuntimeError::InvalidName {
                    name: name.to_string()
                }
            );
        }
    }

    #[test]
    fn collections_keep_registration_order() {
        let mut ctx = RuntimeContext::default();
        ctx.add_to_collection(SUMMARIES_COLLECTION, "b/scalar_summary");
        ctx.add_to_collection(SUMMARIES_COLLECTION, "a/scalar_summary");
        assert_eq!(
            ctx.collection(SUMMARIES_COLLECTION),
            &["b/scalar_summary".to_string(), "a/scalar_summary".to_string()]
        );
        assert!(ctx.collection("missing").is_empty());
        assert_eq!(ctx.collection_keys(), vec![SUMMARIES_COLLECTION]);
    }

    #[test]
    fn emitted_records_drain_once() {
        let mut ctx = RuntimeContext::default();
        ctx.emit(3, Summary::new());
        assert_eq!(ctx.records().len(), 1);
        assert_eq!(ctx.ledger().of_kind(EvidenceKind::Emission).count(), 1);

        let drained = ctx.drain_records();
        assert_eq!(drained[0].step, 3);
        assert!(ctx.records().is_empty());
    }
}
