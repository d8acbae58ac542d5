//! Script runtime: the interpreted-language side of a session.
//!
//! Owns one rhai [`Engine`] plus the global [`Scope`] that user cells read and
//! write. Every scope binding holding a [`Frame`] whose name does not start
//! with `_` is a table for synchronization purposes.
//!
//! # Lifecycle
//!
//! ```text
//! idle ──bootstrap()──► loading ──┬──► ready
//!  ▲                              └──► error ──reset()──► idle
//! ```
//!
//! Bootstrap is single-flight: callers arriving while an attempt is in
//! progress wait for it and share its outcome. A failed bootstrap is not
//! retried automatically.
//!
//! # Cell evaluation
//!
//! A cell is compiled and run once as a whole. Its value is the value of its
//! last statement, so a trailing expression (even one spanning several
//! lines) becomes the cell result, while a trailing `let`, loop or function
//! definition produces no value. Errors carry the cell-relative line.
//!
//! Top-level `let` bindings persist between cells. Re-declaring a name
//! replaces the earlier binding.

pub mod capture;
pub mod frame;
pub mod plot;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use rhai::{AST, Dynamic, Engine, EvalAltResult, ParseError, Scope};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;

pub use capture::OutputSink;
pub use frame::Frame;
pub use plot::Figure;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::model::{Record, Table, TableSet};
use crate::output::{EngineState, EngineStatus, NO_VALUE_MESSAGE, TablePreview, Theme};
use crate::store::ReplaceOutcome;

/// Row cap applied to tabular cell values at the runtime boundary.
pub const ADAPTER_PREVIEW_ROWS: usize = 100;

/// Value of a cell, classified once at the runtime boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// Textual form of a non-tabular value.
    Scalar(String),
    /// A `DataFrame` value, capped to [`ADAPTER_PREVIEW_ROWS`].
    Tabular(TablePreview),
    /// Rendered figure as a PNG data URI.
    Image(String),
    /// The cell ran as statements and produced no value.
    Void,
}

impl ScriptValue {
    /// Text shown for non-tabular, non-image values.
    pub fn text(&self) -> Option<&str> {
        match self {
            ScriptValue::Scalar(s) => Some(s),
            ScriptValue::Void => Some(NO_VALUE_MESSAGE),
            _ => None,
        }
    }
}

/// Everything one successful cell execution produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutcome {
    pub value: ScriptValue,
    /// Text printed during execution.
    pub logs: Option<String>,
    /// Tables changed by this execution, capped for mirroring.
    pub changed: TableSet,
}

/// Settings the runtime reads from the session configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub prelude: Option<String>,
    pub bootstrap_timeout: Duration,
}

impl From<&SessionConfig> for RuntimeConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            prelude: config.prelude.clone(),
            bootstrap_timeout: config.bootstrap_timeout,
        }
    }
}

struct RuntimeState {
    engine: Engine,
    scope: Scope<'static>,
    sink: OutputSink,
    figure: plot::SharedFigure,
    plot_loaded: bool,
    /// Functions defined by the prelude and earlier cells.
    library: AST,
    /// Fingerprint of each table as last exchanged with the SQL store.
    synced: FxHashMap<String, u64>,
}

/// Non-underscore `DataFrame` bindings, by name. Expects a compacted scope.
fn visible_frames<'a>(scope: &'a Scope<'static>) -> IndexMap<&'a str, &'a Dynamic> {
    let mut frames: IndexMap<&str, &Dynamic> = scope
        .iter_raw()
        .filter(|(name, _, value)| !name.starts_with('_') && value.is::<Frame>())
        .map(|(name, _, value)| (name, value))
        .collect();
    frames.sort_keys();
    frames
}

/// Drop shadowed bindings so each name is bound once, to its latest value.
fn compact_scope(scope: &mut Scope<'static>) {
    let mut names = FxHashSet::default();
    if scope.iter_raw().all(|(name, _, _)| names.insert(name.to_string())) {
        return;
    }

    let entries: Vec<(String, Dynamic)> = std::mem::take(scope)
        .into_iter()
        .map(|(name, value, _)| (name, value))
        .collect();
    let mut latest: FxHashMap<&str, usize> = FxHashMap::default();
    for (idx, (name, _)) in entries.iter().enumerate() {
        latest.insert(name.as_str(), idx);
    }
    let keep: Vec<bool> = entries
        .iter()
        .enumerate()
        .map(|(idx, (name, _))| latest.get(name.as_str()) == Some(&idx))
        .collect();
    for ((name, value), keep) in entries.into_iter().zip(keep) {
        if keep {
            // constness travels with the value
            scope.push_dynamic(name, value);
        }
    }
}

fn parse_failure(err: ParseError) -> Error {
    Error::Script {
        message: err.err_type().to_string(),
        line: err.position().line(),
    }
}

fn eval_failure(mut err: Box<EvalAltResult>) -> Error {
    let position = err.take_position();
    Error::Script {
        message: err.to_string(),
        line: position.line(),
    }
}

/// Run a cell and return the value of its last statement.
///
/// Functions in `library` are callable from the cell. On success the cell's
/// own function definitions are added to it.
fn evaluate(
    engine: &Engine,
    scope: &mut Scope<'static>,
    library: &mut AST,
    code: &str,
) -> Result<Dynamic> {
    let ast = engine.compile(code).map_err(parse_failure)?;
    let ast = library.merge(&ast);
    let value = engine
        .eval_ast_with_scope::<Dynamic>(scope, &ast)
        .map_err(eval_failure)?;
    *library = ast.clone_functions_only();
    Ok(value)
}

fn classify(value: Dynamic) -> ScriptValue {
    if value.is_unit() {
        return ScriptValue::Void;
    }
    if let Some(frame) = value.read_lock::<Frame>() {
        return ScriptValue::Tabular(TablePreview {
            columns: frame.columns().to_vec(),
            rows: frame.to_records(ADAPTER_PREVIEW_ROWS),
            total_rows: frame.len(),
        });
    }
    if value.is_array() || value.is_map() {
        if let Ok(json) = rhai::serde::from_dynamic::<serde_json::Value>(&value) {
            if let Ok(text) = serde_json::to_string_pretty(&json) {
                return ScriptValue::Scalar(text);
            }
        }
    }
    ScriptValue::Scalar(value.to_string())
}

impl RuntimeState {
    fn new() -> Self {
        let sink = OutputSink::new();
        let mut engine = Engine::new();
        let print_sink = sink.clone();
        engine.on_print(move |s| print_sink.write_line(s));
        let debug_sink = sink.clone();
        engine.on_debug(move |s, _, _| debug_sink.write_line(s));
        frame::register(&mut engine);

        Self {
            engine,
            scope: Scope::new(),
            sink,
            figure: Arc::new(Mutex::new(Figure::default())),
            plot_loaded: false,
            library: AST::empty(),
            synced: FxHashMap::default(),
        }
    }

    /// Drop all bindings and re-run the prelude.
    fn reset_bindings(&mut self, prelude: Option<&str>) -> Result<()> {
        self.scope.clear();
        self.synced.clear();
        self.library = AST::empty();
        if let Some(prelude) = prelude {
            let ast = self
                .engine
                .compile(prelude)
                .map_err(|e| Error::Bootstrap(format!("prelude failed: {}", e)))?;
            self.engine
                .run_ast_with_scope(&mut self.scope, &ast)
                .map_err(|e| Error::Bootstrap(format!("prelude failed: {}", e)))?;
            compact_scope(&mut self.scope);
            self.library = ast.clone_functions_only();
        }
        Ok(())
    }

    fn load_plotting(&mut self) {
        let module = plot::module(self.figure.clone());
        self.engine
            .register_static_module(plot::PLOT_NAMESPACE, module.into());
        self.plot_loaded = true;
        tracing::info!("Loaded plotting module");
    }

    fn take_figure(&self) -> Figure {
        match self.figure.lock() {
            Ok(mut figure) => std::mem::take(&mut *figure),
            Err(_) => Figure::default(),
        }
    }

    fn bind_table(&mut self, name: &str, rows: &[Record]) -> ReplaceOutcome {
        if rows.is_empty() {
            return ReplaceOutcome::Skipped;
        }
        if self.scope.is_constant(name) == Some(true) {
            let message = format!("'{}' is bound to a constant", name);
            tracing::warn!("Failed to bind table {} in script runtime: {}", name, message);
            return ReplaceOutcome::Failed(message);
        }
        let frame = Frame::from_records(rows);
        self.synced.insert(name.to_string(), frame.fingerprint());
        let count = frame.len();
        self.scope.set_value(name.to_string(), frame);
        tracing::debug!("Bound table {} ({} rows)", name, count);
        ReplaceOutcome::Replaced(count)
    }

    fn run_cell(&mut self, code: &str, theme: Theme, sync_cap: usize) -> Result<ScriptOutcome> {
        let code = code.trim_end();
        if code.trim().is_empty() {
            return Ok(ScriptOutcome {
                value: ScriptValue::Scalar(String::new()),
                logs: None,
                changed: TableSet::new(),
            });
        }
        if !self.plot_loaded && plot::mentions_plotting(code) {
            self.load_plotting();
        }
        // a figure left by a failed cell must not leak into this one
        self.take_figure();

        let sink = self.sink.clone();
        let capture = sink.capture();
        let evaluated = evaluate(&self.engine, &mut self.scope, &mut self.library, code);
        let logs = capture.finish();
        // bindings made before a failure stay, like the statements that made them
        compact_scope(&mut self.scope);
        let value = evaluated?;

        let mut value = classify(value);

        let figure = self.take_figure();
        if figure.has_axes() {
            value = ScriptValue::Image(plot::render_data_uri(&figure, theme)?);
        }

        let changed = self.collect_changed(sync_cap);

        Ok(ScriptOutcome {
            value,
            logs: Some(logs).filter(|l| !l.is_empty()),
            changed,
        })
    }

    /// Frames whose contents changed since they were last exchanged, capped
    /// to `cap` rows. Marks them as exchanged.
    fn collect_changed(&mut self, cap: usize) -> TableSet {
        let mut changed = TableSet::new();
        for (name, value) in visible_frames(&self.scope) {
            let Some(frame) = value.read_lock::<Frame>() else {
                continue;
            };
            let print = frame.fingerprint();
            if self.synced.get(name) == Some(&print) {
                continue;
            }
            self.synced.insert(name.to_string(), print);
            changed.insert(name.to_string(), frame.to_records(cap));
        }
        changed
    }

    fn introspect(&self) -> IndexMap<String, Vec<String>> {
        visible_frames(&self.scope)
            .into_iter()
            .filter_map(|(name, value)| {
                let frame = value.read_lock::<Frame>()?;
                Some((name.to_string(), frame.columns().to_vec()))
            })
            .collect()
    }
}

/// The script runtime adapter.
pub struct ScriptRuntime {
    config: RuntimeConfig,
    status: watch::Sender<EngineStatus>,
    boot: tokio::sync::Mutex<()>,
    state: tokio::sync::Mutex<Option<RuntimeState>>,
}

impl ScriptRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let (status, _) = watch::channel(EngineStatus::default());
        Self {
            config,
            status,
            boot: tokio::sync::Mutex::new(()),
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Current status.
    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    /// Observe status changes.
    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, status: EngineStatus) {
        self.status.send_replace(status);
    }

    /// Load the runtime and bind `seed` tables.
    ///
    /// On an already-ready runtime this refreshes the bindings instead:
    /// the scope is cleared, the prelude re-run and `seed` bound again,
    /// without rebuilding the engine. On a failed runtime this returns the
    /// recorded failure; call [`reset`](Self::reset) first to retry.
    pub async fn bootstrap(&self, seed: &[Table]) -> Result<()> {
        let _flight = match self.boot.try_lock() {
            Ok(flight) => flight,
            Err(_) => {
                // an attempt is in progress; wait for it and share its outcome
                let _joined = self.boot.lock().await;
                let current = self.status();
                return match current.status {
                    EngineState::Ready => Ok(()),
                    state => Err(Error::unavailable(state, current.error)),
                };
            }
        };

        let current = self.status();
        match current.status {
            EngineState::Ready => return self.refresh(seed).await,
            EngineState::Error => {
                return Err(Error::unavailable(EngineState::Error, current.error));
            }
            EngineState::Idle | EngineState::Loading => {}
        }

        self.set_status(EngineStatus::new(EngineState::Loading));
        tracing::info!("Loading script runtime ({} seed tables)", seed.len());
        let started = Instant::now();

        let timeout = self.config.bootstrap_timeout;
        let result = match tokio::time::timeout(timeout, self.boot_state(seed)).await {
            Ok(result) => result,
            Err(_) => Err(Error::BootstrapTimeout(timeout)),
        };

        match result {
            Ok(state) => {
                *self.state.lock().await = Some(state);
                self.set_status(EngineStatus::new(EngineState::Ready));
                tracing::info!(
                    "Script runtime ready in {:.2}s",
                    started.elapsed().as_secs_f64()
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("Script runtime failed to load: {}", e);
                self.set_status(EngineStatus::failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn boot_state(&self, seed: &[Table]) -> Result<RuntimeState> {
        let mut state = RuntimeState::new();
        state.reset_bindings(self.config.prelude.as_deref())?;
        for table in seed {
            tokio::task::yield_now().await;
            state.bind_table(&table.name, &table.data);
        }
        Ok(state)
    }

    /// Replace the bindings of a loaded runtime with `seed`.
    ///
    /// Waits for an in-flight bootstrap first. Errors unless the runtime
    /// ends up ready.
    pub async fn rebind(&self, seed: &[Table]) -> Result<()> {
        let _flight = self.boot.lock().await;
        let current = self.status();
        match current.status {
            EngineState::Ready | EngineState::Loading => self.refresh(seed).await,
            state => Err(Error::unavailable(state, current.error)),
        }
    }

    /// Mark a ready runtime as `loading` until the next rebind completes.
    ///
    /// Cells are refused in the meantime, so none runs against bindings
    /// that are about to be replaced. Returns whether the status changed.
    pub fn begin_reload(&self) -> bool {
        self.status.send_if_modified(|status| {
            if status.is_ready() {
                *status = EngineStatus::new(EngineState::Loading);
                true
            } else {
                false
            }
        })
    }

    /// Undo [`begin_reload`](Self::begin_reload) when no rebind will follow.
    pub async fn abandon_reload(&self) {
        let loaded = self.state.lock().await.is_some();
        self.status.send_if_modified(|status| {
            if loaded && status.status == EngineState::Loading {
                *status = EngineStatus::new(EngineState::Ready);
                true
            } else {
                false
            }
        });
    }

    async fn refresh(&self, seed: &[Table]) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard
            .as_mut()
            .ok_or_else(|| Error::unavailable(EngineState::Idle, None))?;
        self.set_status(EngineStatus::new(EngineState::Loading));
        if let Err(e) = state.reset_bindings(self.config.prelude.as_deref()) {
            tracing::error!("Script runtime failed to rebind: {}", e);
            self.set_status(EngineStatus::failed(e.to_string()));
            return Err(e);
        }
        for table in seed {
            tokio::task::yield_now().await;
            state.bind_table(&table.name, &table.data);
        }
        self.set_status(EngineStatus::new(EngineState::Ready));
        tracing::info!("Refreshed script runtime bindings ({} tables)", seed.len());
        Ok(())
    }

    /// Return to `idle`, discarding the engine and all bindings.
    pub async fn reset(&self) {
        let _flight = self.boot.lock().await;
        *self.state.lock().await = None;
        self.set_status(EngineStatus::default());
        tracing::info!("Script runtime reset");
    }

    /// Wait up to `wait` for the runtime to become ready or fail.
    ///
    /// A zero `wait` checks the current status without waiting. Errors
    /// unless the runtime ends up ready.
    pub async fn await_ready(&self, wait: Duration) -> Result<()> {
        let mut rx = self.status.subscribe();
        let settled = tokio::time::timeout(wait, async {
            rx.wait_for(|s| matches!(s.status, EngineState::Ready | EngineState::Error))
                .await
                .map(|s| (*s).clone())
        })
        .await;

        let status = match settled {
            Ok(Ok(status)) => status,
            _ => self.status(),
        };
        if status.is_ready() {
            Ok(())
        } else {
            Err(Error::unavailable(status.status, status.error))
        }
    }

    /// Bind `rows` to the global `name`. Empty `rows` is a no-op.
    pub async fn load_table(&self, name: &str, rows: &[Record]) -> ReplaceOutcome {
        if rows.is_empty() {
            return ReplaceOutcome::Skipped;
        }
        let mut guard = self.state.lock().await;
        match guard.as_mut() {
            Some(state) => state.bind_table(name, rows),
            None => {
                tracing::warn!("Cannot bind table {}: script runtime is not loaded", name);
                ReplaceOutcome::Failed("script runtime is not loaded".to_string())
            }
        }
    }

    /// Run one cell. Fails fast when the runtime is not ready.
    ///
    /// Executions are serialized; a call made while another is running
    /// waits for it.
    pub async fn execute(&self, code: &str, theme: Theme, sync_cap: usize) -> Result<ScriptOutcome> {
        let status = self.status();
        if !status.is_ready() {
            return Err(Error::unavailable(status.status, status.error));
        }
        let mut guard = self.state.lock().await;
        let state = guard
            .as_mut()
            .ok_or_else(|| Error::unavailable(EngineState::Idle, None))?;
        state.run_cell(code, theme, sync_cap)
    }

    /// Columns of every bound `DataFrame`. Empty when not ready.
    pub async fn introspect(&self) -> IndexMap<String, Vec<String>> {
        match self.state.lock().await.as_ref() {
            Some(state) => state.introspect(),
            None => IndexMap::new(),
        }
    }
}
