//! Hook Engine
//!
//! Drives refresh passes: snapshot the mapping list, pick the images that are new, were
//! reloaded, or were last evaluated under an older rule set, parse each one inside the
//! fault guard, and patch every slot the rules select. At most one pass runs at a time;
//! a synchronous caller that finds a pass in flight waits for it instead of starting
//! another.

use crate::elf::{ElfMetadata, Relocation};
use crate::fault::FaultGuard;
use crate::maps::{MapsReader, ProcMaps};
use crate::patch;
use crate::protect::ProtectionController;
use crate::rules::{Decision, HookRegistration, HookRule, OriginalSink, RuleRegistry, RuleSet};
use crate::traits::{ForeignMemory, MapSource};
use gothook_common::{
    Address, Error, HookConfig, ImageIdentity, ImageRecord, PatchRecord, RefreshMode,
    RefreshReport, Result, RuleId,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

const WORD: usize = std::mem::size_of::<usize>();

/// An image as loaded at one base address
type ImageKey = (ImageIdentity, Address);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshState {
    Idle,
    Refreshing,
}

struct RefreshControl {
    state: RefreshState,
    /// Number of the most recently started pass
    started: u64,
    /// Number of the most recently finished pass
    finished: u64,
    last: Option<std::result::Result<RefreshReport, String>>,
}

/// Images already evaluated, with the rule epoch they were evaluated under
#[derive(Default)]
struct ProcessedSet {
    entries: HashMap<ImageKey, u64>,
}

impl ProcessedSet {
    fn needs_evaluation(&self, key: &ImageKey, epoch: u64) -> bool {
        self.entries.get(key).map_or(true, |&seen| seen < epoch)
    }

    fn mark(&mut self, key: ImageKey, epoch: u64) {
        self.entries.insert(key, epoch);
    }

    /// Forget images that are no longer mapped; returns how many were dropped
    fn retain_present(&mut self, present: &HashSet<ImageKey>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| present.contains(key));
        before - self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

struct LedgerEntry {
    seq: u64,
    image: ImageKey,
    record: PatchRecord,
}

/// First-time patches, one per (rule, slot)
///
/// Also tracks which (rule, image, symbol) pairings already had their original value
/// published; a symbol reached through several slots publishes only once.
#[derive(Default)]
struct PatchLedger {
    entries: HashMap<(RuleId, Address), LedgerEntry>,
    published: HashSet<(RuleId, ImageKey, String)>,
    next_seq: u64,
}

impl PatchLedger {
    fn contains(&self, rule: RuleId, slot: Address) -> bool {
        self.entries.contains_key(&(rule, slot))
    }

    /// Record a patch; true when it is the first for its (rule, image, symbol)
    fn insert(&mut self, image: ImageKey, record: PatchRecord) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;
        let first = self
            .published
            .insert((record.rule, image.clone(), record.symbol.clone()));
        self.entries
            .insert((record.rule, record.slot), LedgerEntry { seq, image, record });
        first
    }

    fn retain_present(&mut self, present: &HashSet<ImageKey>) {
        self.entries.retain(|_, entry| present.contains(&entry.image));
        self.published.retain(|(_, image, _)| present.contains(image));
    }

    fn records(&self) -> Vec<PatchRecord> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.record.clone()).collect()
    }
}

struct EngineInner {
    config: HookConfig,
    rules: RwLock<RuleRegistry>,
    processed: Mutex<ProcessedSet>,
    ledger: Mutex<PatchLedger>,
    maps: MapsReader,
    guard: FaultGuard,
    debug: AtomicBool,
    control: Mutex<RefreshControl>,
    idle: Condvar,
}

/// Marks a pass finished when dropped, whatever way the pass ended
struct PassTicket {
    inner: Arc<EngineInner>,
    pass: u64,
    outcome: Option<std::result::Result<RefreshReport, String>>,
}

impl PassTicket {
    fn finish(&mut self, result: &Result<RefreshReport>) {
        self.outcome = Some(match result {
            Ok(report) => Ok(report.clone()),
            Err(e) => Err(e.to_string()),
        });
    }
}

impl Drop for PassTicket {
    fn drop(&mut self) {
        let mut control = self.inner.control.lock();
        control.state = RefreshState::Idle;
        control.finished = control.finished.max(self.pass);
        control.last = Some(
            self.outcome
                .take()
                .unwrap_or_else(|| Err(format!("refresh pass {} aborted", self.pass))),
        );
        self.inner.idle.notify_all();
    }
}

/// Counters for one image, folded into the pass report
#[derive(Default)]
struct ImageTally {
    patched: usize,
    ignored: usize,
    protection_failures: usize,
}

/// Process-wide PLT/GOT hook engine
#[derive(Clone)]
pub struct HookEngine {
    inner: Arc<EngineInner>,
}

impl Default for HookEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HookEngine {
    /// Engine with default configuration over `/proc/self/maps`
    pub fn new() -> Self {
        Self::with_config(HookConfig::default())
    }

    pub fn with_config(config: HookConfig) -> Self {
        let source = Box::new(ProcMaps::new(&config.maps_path));
        Self::with_source(config, source)
    }

    /// Engine reading the mapping list from `source`
    pub fn with_source(config: HookConfig, source: Box<dyn MapSource>) -> Self {
        if config.debug {
            gothook_common::init_logging(&config.logging);
        }
        let inner = EngineInner {
            rules: RwLock::new(RuleRegistry::new(config.max_rules)),
            processed: Mutex::new(ProcessedSet::default()),
            ledger: Mutex::new(PatchLedger::default()),
            maps: MapsReader::new(source),
            guard: FaultGuard::new(config.fault_protection),
            debug: AtomicBool::new(config.debug),
            control: Mutex::new(RefreshControl {
                state: RefreshState::Idle,
                started: 0,
                finished: 0,
                last: None,
            }),
            idle: Condvar::new(),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &HookConfig {
        &self.inner.config
    }

    /// Hook `symbol` in every image whose path matches `pattern`
    ///
    /// Takes effect on the next refresh.
    pub fn register(
        &self,
        pattern: &str,
        symbol: &str,
        replacement: Address,
    ) -> Result<HookRegistration> {
        self.register_rule(pattern, Some(symbol), replacement, None)
    }

    /// Register a hook rule; `symbol == None` hooks every symbol of matching images and
    /// `sink` hears about each first-time original value
    pub fn register_rule(
        &self,
        pattern: &str,
        symbol: Option<&str>,
        replacement: Address,
        sink: Option<OriginalSink>,
    ) -> Result<HookRegistration> {
        self.inner
            .rules
            .write()
            .register(pattern, symbol, replacement, sink)
    }

    /// Exclude matching slots from future patching; already patched slots keep their
    /// value
    pub fn ignore(&self, pattern: &str, symbol: Option<&str>) -> Result<()> {
        self.inner.rules.write().ignore(pattern, symbol)
    }

    pub fn rule_count(&self) -> usize {
        self.inner.rules.read().len()
    }

    /// Run a refresh pass, either on this thread or detached
    pub fn refresh(&self, mode: RefreshMode) -> Result<()> {
        match mode {
            RefreshMode::Sync => self.refresh_now().map(|_| ()),
            RefreshMode::Async => self.refresh_detached(),
        }
    }

    /// Run a pass on this thread, or wait for the one in flight, and return its report
    pub fn refresh_now(&self) -> Result<RefreshReport> {
        let mut control = self.inner.control.lock();
        if control.state == RefreshState::Refreshing {
            let joined = control.started;
            debug!(target: "gothook::engine", pass = joined, "joining refresh pass in flight");
            while control.finished < joined {
                self.inner.idle.wait(&mut control);
            }
            return match &control.last {
                Some(Ok(report)) => Ok(report.clone()),
                Some(Err(message)) => Err(Error::Maps(message.clone())),
                None => Err(Error::Internal("joined pass left no outcome".into())),
            };
        }

        control.state = RefreshState::Refreshing;
        control.started += 1;
        let pass = control.started;
        drop(control);

        let mut ticket = PassTicket {
            inner: self.inner.clone(),
            pass,
            outcome: None,
        };
        let result = self.inner.run_pass(pass);
        ticket.finish(&result);
        result
    }

    fn refresh_detached(&self) -> Result<()> {
        let mut control = self.inner.control.lock();
        if control.state == RefreshState::Refreshing {
            trace!(target: "gothook::engine", "refresh pass already in flight");
            return Ok(());
        }
        control.state = RefreshState::Refreshing;
        control.started += 1;
        let pass = control.started;
        drop(control);

        let mut ticket = PassTicket {
            inner: self.inner.clone(),
            pass,
            outcome: None,
        };
        let inner = self.inner.clone();
        std::thread::Builder::new()
            .name(self.inner.config.async_thread_name.clone())
            .spawn(move || {
                let result = inner.run_pass(pass);
                if let Err(e) = &result {
                    warn!(target: "gothook::engine", pass, "detached refresh failed: {}", e);
                }
                ticket.finish(&result);
            })
            .map(|_| ())
            .map_err(|e| {
                warn!(target: "gothook::engine", "failed to spawn refresh thread: {}", e);
                Error::Io(e)
            })
    }

    /// Block until no pass is in flight
    pub fn wait_idle(&self) {
        let mut control = self.inner.control.lock();
        while control.state == RefreshState::Refreshing {
            self.inner.idle.wait(&mut control);
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.control.lock().state == RefreshState::Refreshing
    }

    pub fn passes_completed(&self) -> u64 {
        self.inner.control.lock().finished
    }

    /// Report of the most recent successful pass
    pub fn last_report(&self) -> Option<RefreshReport> {
        match &self.inner.control.lock().last {
            Some(Ok(report)) => Some(report.clone()),
            _ => None,
        }
    }

    /// Forget which images were processed so the next pass evaluates all of them
    ///
    /// Applied patches stay in place and are not repeated.
    pub fn clear(&self) {
        self.inner.processed.lock().clear();
        self.inner.maps.invalidate();
        info!(target: "gothook::engine", "processed images cleared");
    }

    pub fn set_debug(&self, enabled: bool) {
        if enabled {
            gothook_common::enable_debug_output();
        }
        self.inner.debug.store(enabled, Ordering::SeqCst);
    }

    pub fn debug_enabled(&self) -> bool {
        self.inner.debug.load(Ordering::SeqCst)
    }

    pub fn set_fault_protection(&self, enabled: bool) {
        self.inner.guard.set_enabled(enabled);
        debug!(target: "gothook::engine", enabled, "fault protection toggled");
    }

    pub fn fault_protection_enabled(&self) -> bool {
        self.inner.guard.is_enabled()
    }

    /// Every first-time patch still in effect, oldest first
    pub fn patches(&self) -> Vec<PatchRecord> {
        self.inner.ledger.lock().records()
    }

    /// Mapping reader shared with protection lookups
    pub fn maps(&self) -> &MapsReader {
        &self.inner.maps
    }
}

impl std::fmt::Debug for HookEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookEngine")
            .field("rules", &self.rule_count())
            .field("refreshing", &self.is_refreshing())
            .field("passes", &self.passes_completed())
            .finish()
    }
}

impl EngineInner {
    fn run_pass(&self, pass: u64) -> Result<RefreshReport> {
        let snapshot = self.maps.snapshot()?;
        let mut report = RefreshReport {
            pass,
            images_seen: snapshot.images().len(),
            ..Default::default()
        };
        let mut present = HashSet::with_capacity(snapshot.images().len());

        for image in snapshot.images() {
            let key: ImageKey = (image.identity.clone(), image.base);
            present.insert(key.clone());

            let rules = self.rules.read().snapshot();
            if !self
                .processed
                .lock()
                .needs_evaluation(&key, rules.epoch())
            {
                continue;
            }
            report.images_evaluated += 1;
            self.evaluate_image(image, &key, &rules, &mut report);
            self.processed.lock().mark(key, rules.epoch());
        }

        let unloaded = self.processed.lock().retain_present(&present);
        self.ledger.lock().retain_present(&present);
        if unloaded > 0 {
            debug!(target: "gothook::engine", unloaded, "forgot unloaded images");
        }

        info!(
            target: "gothook::engine",
            pass,
            seen = report.images_seen,
            evaluated = report.images_evaluated,
            patched = report.slots_patched,
            ignored = report.slots_ignored,
            failures = report.image_failures + report.faulted_images,
            "refresh pass complete"
        );
        Ok(report)
    }

    fn evaluate_image(
        &self,
        image: &ImageRecord,
        key: &ImageKey,
        rules: &RuleSet,
        report: &mut RefreshReport,
    ) {
        let path = image.path();
        if !rules.image_wanted(path) {
            trace!(target: "gothook::engine", path, "no rule for image");
            return;
        }
        report.images_parsed += 1;

        let controller = ProtectionController::new(&self.maps);
        let mut tally = ImageTally::default();
        let result = self.guard.protect(path, |mem| {
            let meta = ElfMetadata::parse(mem, image.base, path)?;
            self.apply_rules(mem, &meta, key, rules, &controller, &mut tally)
        });

        report.slots_patched += tally.patched;
        report.slots_ignored += tally.ignored;
        report.protection_failures += tally.protection_failures;

        if let Err(e) = result {
            if e.is_fault() {
                report.faulted_images += 1;
                warn!(target: "gothook::engine", path, "image aborted by memory fault: {}", e);
            } else {
                report.image_failures += 1;
                warn!(target: "gothook::engine", path, "image skipped: {}", e);
            }
        }
    }

    fn apply_rules(
        &self,
        mem: &dyn ForeignMemory,
        meta: &ElfMetadata,
        key: &ImageKey,
        rules: &RuleSet,
        controller: &ProtectionController<'_>,
        tally: &mut ImageTally,
    ) -> Result<()> {
        for (symbol, relocs) in meta.relocations() {
            match rules.resolve(meta.path(), symbol) {
                Decision::NoRule => {}
                Decision::Ignored => {
                    tally.ignored += relocs.len();
                    if self.debug.load(Ordering::Relaxed) {
                        debug!(target: "gothook::engine", path = meta.path(), symbol, "ignored");
                    }
                }
                Decision::Apply(hooks) => {
                    for reloc in relocs {
                        for hook in &hooks {
                            self.patch_slot(mem, meta, key, symbol, reloc, hook, controller, tally)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn patch_slot(
        &self,
        mem: &dyn ForeignMemory,
        meta: &ElfMetadata,
        key: &ImageKey,
        symbol: &str,
        reloc: &Relocation,
        hook: &HookRule,
        controller: &ProtectionController<'_>,
        tally: &mut ImageTally,
    ) -> Result<()> {
        if self.ledger.lock().contains(hook.id, reloc.slot) {
            return Ok(());
        }

        let outcome = match controller.with_writable(reloc.slot, WORD, meta.path(), || {
            patch::apply(mem, reloc.slot, hook.replacement)
        }) {
            Ok(outcome) => outcome,
            Err(e @ Error::Protection { .. }) => {
                tally.protection_failures += 1;
                warn!(
                    target: "gothook::engine",
                    path = meta.path(),
                    symbol,
                    slot = %reloc.slot,
                    "slot skipped: {}",
                    e
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !outcome.changed {
            return Ok(());
        }

        let original = patch::forward_target(meta, reloc, symbol, outcome.previous);
        tally.patched += 1;
        let first_for_symbol = self.ledger.lock().insert(
            key.clone(),
            PatchRecord {
                rule: hook.id,
                image_path: meta.path().to_string(),
                symbol: symbol.to_string(),
                slot: reloc.slot,
                kind: reloc.kind,
                original,
                replacement: hook.replacement,
            },
        );
        if first_for_symbol {
            hook.original.publish(original);
        }

        if self.debug.load(Ordering::Relaxed) {
            debug!(
                target: "gothook::engine",
                path = meta.path(),
                symbol,
                kind = %reloc.kind,
                slot = %reloc.slot,
                original = %original,
                replacement = %hook.replacement,
                rule = %hook.id,
                "slot patched"
            );
        } else {
            trace!(target: "gothook::engine", symbol, slot = %reloc.slot, "slot patched");
        }
        Ok(())
    }
}
