//! Rule Registry
//!
//! Hook rules and ignore rules, both keyed by a pathname pattern and an optional symbol.
//! Pathnames are matched with POSIX basic regular expressions through the C library's
//! `regcomp`/`regexec`, so `\(`, `\)` and back-references behave as on the command line
//! and `+`, `?` and `|` are ordinary characters.

use crate::traits::PatternMatcher;
use gothook_common::{Address, Error, Result, RuleId};
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// POSIX basic regular expression compiled by the C library
pub struct PathMatcher {
    pattern: String,
    regex: Box<libc::regex_t>,
}

// SAFETY: a compiled regex_t is only read by regexec, which is thread-safe.
unsafe impl Send for PathMatcher {}
unsafe impl Sync for PathMatcher {}

impl PathMatcher {
    pub fn new(pattern: &str) -> Result<Self> {
        let c_pattern = CString::new(pattern).map_err(|_| Error::Pattern {
            pattern: pattern.to_string(),
            message: "pattern contains a NUL byte".into(),
        })?;
        // SAFETY: regex_t is plain data; regcomp initializes it.
        let mut regex: Box<libc::regex_t> = Box::new(unsafe { std::mem::zeroed() });
        // SAFETY: both pointers are valid for the duration of the call.
        let rc = unsafe { libc::regcomp(&mut *regex, c_pattern.as_ptr(), libc::REG_NOSUB) };
        if rc != 0 {
            // A failed compile owns no resources, so regfree must not run.
            let message = regex_error(rc, &regex);
            return Err(Error::Pattern {
                pattern: pattern.to_string(),
                message,
            });
        }
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }
}

fn regex_error(code: libc::c_int, regex: &libc::regex_t) -> String {
    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: the buffer length is passed along with the buffer.
    unsafe { libc::regerror(code, regex, buf.as_mut_ptr(), buf.len()) };
    // SAFETY: regerror always NUL-terminates within the given length.
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

impl PatternMatcher for PathMatcher {
    fn pattern(&self) -> &str {
        &self.pattern
    }

    fn is_match(&self, text: &str) -> bool {
        let Ok(text) = CString::new(text) else {
            return false;
        };
        // SAFETY: compiled with REG_NOSUB, so no match array is needed.
        unsafe { libc::regexec(&*self.regex, text.as_ptr(), 0, std::ptr::null_mut(), 0) == 0 }
    }
}

impl Drop for PathMatcher {
    fn drop(&mut self) {
        // SAFETY: compiled successfully in `new` and freed exactly once.
        unsafe { libc::regfree(&mut *self.regex) };
    }
}

impl std::fmt::Debug for PathMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PathMatcher").field(&self.pattern).finish()
    }
}

/// Callback told about each first-time original value of a registration
pub type OriginalSink = Box<dyn Fn(Address) + Send + Sync>;

/// Where the original value of a registration is published
#[derive(Default)]
pub struct OriginalSlot {
    value: AtomicUsize,
    sink: Option<OriginalSink>,
}

impl OriginalSlot {
    pub fn new(sink: Option<OriginalSink>) -> Self {
        Self {
            value: AtomicUsize::new(0),
            sink,
        }
    }

    pub fn publish(&self, original: Address) {
        self.value.store(original.get(), Ordering::SeqCst);
        if let Some(sink) = &self.sink {
            sink(original);
        }
    }

    pub fn get(&self) -> Option<Address> {
        match self.value.load(Ordering::SeqCst) {
            0 => None,
            v => Some(Address::new(v)),
        }
    }
}

/// Handle returned to a registrant
#[derive(Clone)]
pub struct HookRegistration {
    id: RuleId,
    original: Arc<OriginalSlot>,
}

impl HookRegistration {
    pub fn id(&self) -> RuleId {
        self.id
    }

    /// Value the most recent first-time patch of this rule replaced
    pub fn original(&self) -> Option<Address> {
        self.original.get()
    }
}

impl std::fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistration")
            .field("id", &self.id)
            .field("original", &self.original())
            .finish()
    }
}

pub struct HookRule {
    pub id: RuleId,
    pub matcher: Box<dyn PatternMatcher>,
    /// `None` hooks every symbol of matching images
    pub symbol: Option<String>,
    pub replacement: Address,
    pub original: Arc<OriginalSlot>,
}

impl HookRule {
    fn matches(&self, path: &str, symbol: &str) -> bool {
        self.symbol.as_deref().map_or(true, |s| s == symbol) && self.matcher.is_match(path)
    }
}

pub struct IgnoreRule {
    pub matcher: Box<dyn PatternMatcher>,
    /// `None` ignores the whole image
    pub symbol: Option<String>,
}

impl IgnoreRule {
    fn matches(&self, path: &str, symbol: &str) -> bool {
        self.symbol.as_deref().map_or(true, |s| s == symbol) && self.matcher.is_match(path)
    }
}

/// Outcome of resolving one (image, symbol) pair
pub enum Decision {
    /// Matching hook rules in registration order
    Apply(Vec<Arc<HookRule>>),
    Ignored,
    NoRule,
}

impl std::fmt::Debug for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Apply(rules) => f
                .debug_tuple("Apply")
                .field(&rules.iter().map(|r| r.id).collect::<Vec<_>>())
                .finish(),
            Decision::Ignored => write!(f, "Ignored"),
            Decision::NoRule => write!(f, "NoRule"),
        }
    }
}

/// Immutable view of the registered rules
///
/// Cheap to clone; a refresh pass takes one per image so registration never waits on
/// patching.
#[derive(Clone, Default)]
pub struct RuleSet {
    hooks: Vec<Arc<HookRule>>,
    ignores: Vec<Arc<IgnoreRule>>,
    epoch: u64,
}

impl RuleSet {
    /// Ignore rules first, then every matching hook rule
    pub fn resolve(&self, path: &str, symbol: &str) -> Decision {
        if self.ignores.iter().any(|r| r.matches(path, symbol)) {
            return Decision::Ignored;
        }
        let hooks: Vec<_> = self
            .hooks
            .iter()
            .filter(|r| r.matches(path, symbol))
            .cloned()
            .collect();
        if hooks.is_empty() {
            Decision::NoRule
        } else {
            Decision::Apply(hooks)
        }
    }

    /// Whether an image at `path` needs its metadata parsed at all
    pub fn image_wanted(&self, path: &str) -> bool {
        !self.image_ignored(path) && self.hooks.iter().any(|r| r.matcher.is_match(path))
    }

    /// Whether a symbol-less ignore rule covers the whole image
    pub fn image_ignored(&self, path: &str) -> bool {
        self.ignores
            .iter()
            .any(|r| r.symbol.is_none() && r.matcher.is_match(path))
    }

    /// Advances every time a hook rule is added
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn ignore_count(&self) -> usize {
        self.ignores.len()
    }
}

/// Insertion-ordered hook and ignore rules
pub struct RuleRegistry {
    rules: RuleSet,
    max_rules: usize,
    next_id: u32,
}

impl RuleRegistry {
    pub fn new(max_rules: usize) -> Self {
        Self {
            rules: RuleSet::default(),
            max_rules,
            next_id: 1,
        }
    }

    fn check_capacity(&self) -> Result<()> {
        if self.len() >= self.max_rules {
            return Err(Error::RegistryFull(self.max_rules));
        }
        Ok(())
    }

    fn check_symbol(symbol: Option<&str>) -> Result<()> {
        if symbol.is_some_and(str::is_empty) {
            return Err(Error::InvalidArgument("symbol must not be empty".into()));
        }
        Ok(())
    }

    fn compile(pattern: &str) -> Result<Box<dyn PatternMatcher>> {
        if pattern.is_empty() {
            return Err(Error::InvalidArgument("pathname pattern must not be empty".into()));
        }
        Ok(Box::new(PathMatcher::new(pattern)?))
    }

    /// Add a hook rule; nothing is installed on error
    pub fn register(
        &mut self,
        pattern: &str,
        symbol: Option<&str>,
        replacement: Address,
        sink: Option<OriginalSink>,
    ) -> Result<HookRegistration> {
        if replacement.is_null() {
            return Err(Error::InvalidArgument("replacement must not be null".into()));
        }
        Self::check_symbol(symbol)?;
        self.check_capacity()?;
        let matcher = Self::compile(pattern)?;

        let id = RuleId(self.next_id);
        self.next_id += 1;
        let original = Arc::new(OriginalSlot::new(sink));
        self.rules.hooks.push(Arc::new(HookRule {
            id,
            matcher,
            symbol: symbol.map(str::to_string),
            replacement,
            original: original.clone(),
        }));
        self.rules.epoch += 1;

        debug!(
            target: "gothook::rules",
            %id,
            pattern,
            symbol = symbol.unwrap_or("*"),
            replacement = %replacement,
            "hook rule registered"
        );
        Ok(HookRegistration { id, original })
    }

    /// Add an ignore rule; `symbol == None` ignores whole images
    pub fn ignore(&mut self, pattern: &str, symbol: Option<&str>) -> Result<()> {
        Self::check_symbol(symbol)?;
        self.check_capacity()?;
        let matcher = Self::compile(pattern)?;
        self.rules.ignores.push(Arc::new(IgnoreRule {
            matcher,
            symbol: symbol.map(str::to_string),
        }));
        debug!(
            target: "gothook::rules",
            pattern,
            symbol = symbol.unwrap_or("*"),
            "ignore rule registered"
        );
        Ok(())
    }

    pub fn snapshot(&self) -> RuleSet {
        self.rules.clone()
    }

    pub fn resolve(&self, path: &str, symbol: &str) -> Decision {
        self.rules.resolve(path, symbol)
    }

    pub fn len(&self) -> usize {
        self.rules.hooks.len() + self.rules.ignores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
