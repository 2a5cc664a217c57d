//! Reconciler: merges local surface edits and remote deltas while keeping
//! the user's caret where they left it.
//!
//! ```text
//!   surface text ──diff vs shown──► TextEdit ──► DocumentStore (local op)
//!        ▲                                           │   notification with
//!        │                                           │   local-edit flag up:
//!        │                                           │   suppressed (echo)
//!        │                                           ▼
//!        │                                      Delta ──► Outbox ──► transport
//!        │
//!   set_text + mapped caret ◄── remote notification ◄── apply_remote_delta
//! ```
//!
//! `shown` is the text last rendered onto (or read from) the surface; it
//! always equals the document's materialized text between calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::document::{Delta, DocumentError, DocumentStore};
use crate::presence::{PresenceFields, PresenceRegistry, PresenceUpdate};
use crate::rewrite;
use crate::storage::TextCache;
use crate::subscription::Subscription;

/// Default quiet period before the typing indicator is cleared.
pub const DEFAULT_TYPING_DEBOUNCE: Duration = Duration::from_secs(1);

/// The editable surface, addressed in plain-text (char) offsets.
pub trait Surface: Send {
    fn text(&self) -> String;

    /// Replace the whole text. With `preserve_cursor` the caller restores
    /// the caret itself right after.
    fn set_text(&mut self, text: &str, preserve_cursor: bool);

    fn caret(&self) -> usize;

    fn set_caret(&mut self, offset: usize);
}

/// In-memory surface. Counts full-text rewrites so flicker can be observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextSurface {
    text: String,
    caret: usize,
    rewrites: usize,
}

impl TextSurface {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            caret: text.chars().count(),
            rewrites: 0,
        }
    }

    /// Number of `set_text` calls so far.
    pub fn rewrites(&self) -> usize {
        self.rewrites
    }

    /// User typing: insert at `pos` and leave the caret after it.
    pub fn type_at(&mut self, pos: usize, text: &str) {
        let at = byte_index(&self.text, pos);
        self.text.insert_str(at, text);
        self.caret = pos.min(self.len()) + text.chars().count();
        self.caret = self.caret.min(self.len());
    }

    /// User typing at the end.
    pub fn append(&mut self, text: &str) {
        let end = self.len();
        self.type_at(end, text);
    }

    /// User deleting `len` chars at `pos`.
    pub fn delete(&mut self, pos: usize, len: usize) {
        let start = byte_index(&self.text, pos);
        let end = byte_index(&self.text, pos.saturating_add(len));
        self.text.replace_range(start..end, "");
        self.caret = pos.min(self.len());
    }

    fn len(&self) -> usize {
        self.text.chars().count()
    }
}

impl Surface for TextSurface {
    fn text(&self) -> String {
        self.text.clone()
    }

    fn set_text(&mut self, text: &str, preserve_cursor: bool) {
        self.text = text.to_string();
        self.rewrites += 1;
        if !preserve_cursor {
            self.caret = self.len();
        }
        self.caret = self.caret.min(self.len());
    }

    fn caret(&self) -> usize {
        self.caret
    }

    fn set_caret(&mut self, offset: usize) {
        self.caret = offset.min(self.len());
    }
}

fn byte_index(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}

// ─── Diff and caret mapping ────────────────────────────────────────

/// A single replace: `removed` chars at `start` become `inserted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub start: usize,
    pub removed: usize,
    pub inserted: String,
}

impl TextEdit {
    pub fn inserted_len(&self) -> usize {
        self.inserted.chars().count()
    }
}

/// Minimal edit turning `old` into `new` (common prefix and suffix, chars).
pub fn diff(old: &str, new: &str) -> Option<TextEdit> {
    if old == new {
        return None;
    }
    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();

    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    Some(TextEdit {
        start: prefix,
        removed: old.len() - prefix - suffix,
        inserted: new[prefix..new.len() - suffix].iter().collect(),
    })
}

/// Where `caret` lands after `edit`: unchanged before the edit, shifted by
/// the length difference after it, at the end of the insertion inside it.
pub fn map_caret(caret: usize, edit: &TextEdit) -> usize {
    if caret <= edit.start {
        caret
    } else if caret >= edit.start + edit.removed {
        caret - edit.removed + edit.inserted_len()
    } else {
        edit.start + edit.inserted_len()
    }
}

// ─── Typing indicator ──────────────────────────────────────────────

/// Coalesces bursts of edits into one typing on/off pair.
#[derive(Debug, Clone)]
pub struct TypingDebounce {
    delay: Duration,
    deadline: Option<Instant>,
}

impl TypingDebounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    /// Record an edit. True when typing just started.
    pub fn on_edit(&mut self, now: Instant) -> bool {
        let started = self.deadline.is_none();
        self.deadline = Some(now + self.delay);
        started
    }

    /// True when the quiet period ended at or before `now`.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_typing(&self) -> bool {
        self.deadline.is_some()
    }
}

// ─── Reconciler ────────────────────────────────────────────────────

/// Messages to broadcast after a reconciler step.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Outbox {
    pub deltas: Vec<Delta>,
    pub presence: Vec<PresenceUpdate>,
}

impl Outbox {
    /// Queue a delta for broadcast. Empty deltas carry nothing and are dropped.
    pub fn push_delta(&mut self, delta: Delta) {
        if !delta.is_empty() {
            self.deltas.push(delta);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.presence.is_empty()
    }

    pub fn extend(&mut self, other: Outbox) {
        self.deltas.extend(other.deltas);
        self.presence.extend(other.presence);
    }
}

/// A remote delta the document refused. `pending` still holds the local
/// commit made before the delta was tried; it has to be broadcast anyway.
#[derive(Debug, Error)]
#[error("remote delta rejected: {source}")]
pub struct RejectedDelta {
    pub pending: Outbox,
    #[source]
    pub source: DocumentError,
}

/// Reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Local cache key, `"<app-namespace>-<tag>"`
    pub cache_key: String,
    /// Starter text that must never be seeded
    pub placeholder: String,
    pub typing_debounce: Duration,
}

pub struct Reconciler {
    document: DocumentStore,
    cache: Box<dyn TextCache>,
    config: ReconcilerConfig,
    shown: String,
    local_edit: Arc<AtomicBool>,
    remote_changes: Arc<Mutex<VecDeque<String>>>,
    suppressed: Arc<AtomicUsize>,
    _document_events: Subscription,
    typing: TypingDebounce,
    presence: Option<PresenceRegistry>,
    seeded: bool,
    warning: Option<String>,
}

impl Reconciler {
    pub fn new(
        document: DocumentStore,
        cache: Box<dyn TextCache>,
        presence: Option<PresenceRegistry>,
        config: ReconcilerConfig,
    ) -> Self {
        let local_edit = Arc::new(AtomicBool::new(false));
        let remote_changes = Arc::new(Mutex::new(VecDeque::new()));
        let suppressed = Arc::new(AtomicUsize::new(0));

        let subscription = {
            let local_edit = local_edit.clone();
            let remote_changes = remote_changes.clone();
            let suppressed = suppressed.clone();
            document.subscribe(move |change| {
                if local_edit.load(Ordering::SeqCst) {
                    suppressed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                remote_changes
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push_back(change.text.clone());
            })
        };

        Self {
            shown: document.materialize(),
            document,
            cache,
            typing: TypingDebounce::new(config.typing_debounce),
            config,
            local_edit,
            remote_changes,
            suppressed,
            _document_events: subscription,
            presence,
            seeded: false,
            warning: None,
        }
    }

    pub fn document(&self) -> &DocumentStore {
        &self.document
    }

    pub fn cache(&self) -> &dyn TextCache {
        self.cache.as_ref()
    }

    pub fn presence(&self) -> Option<&PresenceRegistry> {
        self.presence.as_ref()
    }

    pub fn presence_mut(&mut self) -> Option<&mut PresenceRegistry> {
        self.presence.as_mut()
    }

    /// Self-originated change notifications that did not touch the surface.
    pub fn suppressed_echoes(&self) -> usize {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    pub fn set_warning(&mut self, warning: impl Into<String>) {
        self.warning = Some(warning.into());
    }

    pub fn dismiss_warning(&mut self) {
        self.warning = None;
    }

    pub fn typing_deadline(&self) -> Option<Instant> {
        self.typing.deadline()
    }

    /// The surface changed locally: commit it to the document.
    pub fn handle_local_edit(&mut self, surface: &mut dyn Surface, now: Instant) -> Outbox {
        let mut outbox = Outbox {
            deltas: self.commit(surface),
            presence: Vec::new(),
        };
        if outbox.deltas.is_empty() {
            return outbox;
        }

        let caret = surface.caret();
        if let Some(presence) = self.presence.as_mut() {
            let fields = if self.typing.on_edit(now) {
                PresenceFields::default().typing(true).cursor(Some(caret))
            } else {
                PresenceFields::default().cursor(Some(caret))
            };
            outbox.presence.push(presence.set_local(fields));
        } else {
            self.typing.on_edit(now);
        }
        outbox
    }

    /// Integrate a delta from a peer. Uncommitted surface text is committed
    /// first; the returned outbox carries that commit, if any. On rejection
    /// the commit travels in [`RejectedDelta::pending`].
    pub fn handle_remote_delta(
        &mut self,
        surface: &mut dyn Surface,
        delta: &Delta,
        now: Instant,
    ) -> Result<Outbox, RejectedDelta> {
        let outbox = self.handle_local_edit(surface, now);

        if let Err(source) = self.document.apply_remote_delta(delta) {
            log::warn!("Reconciler: dropping delta ({} bytes): {source}", delta.len());
            return Err(RejectedDelta {
                pending: outbox,
                source,
            });
        }
        self.render_remote(surface);
        Ok(outbox)
    }

    /// Clear the typing indicator once the debounce has elapsed.
    pub fn poll_typing(&mut self, now: Instant) -> Outbox {
        let mut outbox = Outbox::default();
        if self.typing.poll(now) {
            if let Some(presence) = self.presence.as_mut() {
                outbox
                    .presence
                    .push(presence.set_local(PresenceFields::default().typing(false)));
            }
        }
        outbox
    }

    /// Seed an empty document from the local cache, once. Skipped when the
    /// document has content, the cache is empty or unreadable, or the
    /// cached text is the placeholder.
    pub fn seed_from_cache(&mut self, surface: &mut dyn Surface) -> Outbox {
        let mut outbox = Outbox::default();
        if self.seeded {
            return outbox;
        }
        self.seeded = true;

        // Anything typed before seeding wins over the cache.
        outbox.deltas = self.commit(surface);

        if !self.document.is_empty() {
            log::debug!("Reconciler: document has content, cache not seeded");
            return outbox;
        }
        let cached = match self.cache.load(&self.config.cache_key) {
            Ok(Some(entry)) => entry.text,
            Ok(None) => return outbox,
            Err(e) => {
                log::warn!("Reconciler: cache unreadable, starting fresh: {e}");
                return outbox;
            }
        };
        if cached.trim().is_empty() || cached == self.config.placeholder {
            return outbox;
        }

        log::info!("Reconciler: seeding document from cache ({} chars)", cached.chars().count());
        surface.set_text(&cached, false);
        outbox.deltas.extend(self.commit(surface));
        outbox
    }

    /// Replace every `/rewrite` line on the surface with `rewritten`.
    pub fn apply_rewrite(&mut self, surface: &mut dyn Surface, rewritten: &str, now: Instant) -> Outbox {
        let text = rewrite::apply_rewrite(&surface.text(), rewritten);
        surface.set_text(&text, false);
        self.handle_local_edit(surface, now)
    }

    /// Apply a peer's presence update.
    pub fn handle_remote_presence(&mut self, update: &PresenceUpdate) -> bool {
        self.presence
            .as_mut()
            .is_some_and(|presence| presence.apply_remote(update))
    }

    /// Forget every remote presence entry (teardown).
    pub fn clear_presence(&mut self) {
        if let Some(presence) = self.presence.as_mut() {
            presence.clear();
        }
    }

    /// Diff the surface against `shown` and apply it to the document.
    fn commit(&mut self, surface: &dyn Surface) -> Vec<Delta> {
        let text = surface.text();
        let Some(edit) = diff(&self.shown, &text) else {
            return Vec::new();
        };

        let mut deltas = Vec::with_capacity(2);
        self.local_edit.store(true, Ordering::SeqCst);
        if edit.removed > 0 {
            deltas.push(self.document.apply_local_delete(edit.start, edit.removed));
        }
        if !edit.inserted.is_empty() {
            deltas.push(self.document.apply_local_insert(edit.start, &edit.inserted));
        }
        deltas.retain(|delta| !delta.is_empty());
        self.local_edit.store(false, Ordering::SeqCst);

        self.shown = self.document.materialize();
        self.persist();
        deltas
    }

    /// Render the latest remote-originated text, mapping the caret.
    fn render_remote(&mut self, surface: &mut dyn Surface) {
        let latest = {
            let mut queue = self
                .remote_changes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queue.drain(..).last()
        };
        let Some(text) = latest else {
            return;
        };
        let Some(edit) = diff(&self.shown, &text) else {
            return;
        };

        let caret = map_caret(surface.caret(), &edit).min(text.chars().count());
        surface.set_text(&text, true);
        surface.set_caret(caret);
        self.shown = text;
        self.persist();
    }

    fn persist(&mut self) {
        if let Err(e) = self.cache.store(&self.config.cache_key, &self.shown) {
            log::warn!("Reconciler: cache write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::Color;
    use crate::storage::{MemoryCache, StoreError, CacheEntry};

    const KEY: &str = "editor-happy";

    fn config() -> ReconcilerConfig {
        ReconcilerConfig {
            cache_key: KEY.to_string(),
            placeholder: "Start here".to_string(),
            typing_debounce: DEFAULT_TYPING_DEBOUNCE,
        }
    }

    fn reconciler(id: u64, cache: MemoryCache) -> Reconciler {
        let presence = PresenceRegistry::new(id, format!("User{id}"), Color::default());
        Reconciler::new(DocumentStore::new(id), Box::new(cache), Some(presence), config())
    }

    #[test]
    fn test_diff() {
        assert_eq!(diff("same", "same"), None);
        assert_eq!(
            diff("hello world", "XXhello world"),
            Some(TextEdit { start: 0, removed: 0, inserted: "XX".into() })
        );
        assert_eq!(
            diff("hello world", "hello there"),
            Some(TextEdit { start: 6, removed: 5, inserted: "there".into() })
        );
        assert_eq!(
            diff("aaa", "aa"),
            Some(TextEdit { start: 2, removed: 1, inserted: String::new() })
        );
        assert_eq!(
            diff("née", "nèe"),
            Some(TextEdit { start: 1, removed: 1, inserted: "è".into() })
        );
    }

    #[test]
    fn test_outbox_drops_empty_deltas() {
        let mut outbox = Outbox::default();
        outbox.push_delta(Delta::from_bytes(Vec::new()));
        assert!(outbox.is_empty());

        let mut doc = DocumentStore::new(1);
        outbox.push_delta(doc.apply_local_insert(0, "x"));
        assert_eq!(outbox.deltas.len(), 1);
    }

    #[test]
    fn test_map_caret() {
        let insert_front = TextEdit { start: 0, removed: 0, inserted: "XX".into() };
        assert_eq!(map_caret(6, &insert_front), 8);
        assert_eq!(map_caret(0, &insert_front), 0);

        let replace = TextEdit { start: 2, removed: 4, inserted: "z".into() };
        assert_eq!(map_caret(1, &replace), 1);
        assert_eq!(map_caret(4, &replace), 3, "inside the replaced region");
        assert_eq!(map_caret(9, &replace), 6);
    }

    #[test]
    fn test_cursor_preserved_across_remote_insert() {
        let now = Instant::now();
        let mut local = reconciler(1, MemoryCache::new());
        let mut surface = TextSurface::new("");
        surface.append("hello world");
        let sent = local.handle_local_edit(&mut surface, now);

        let mut remote = DocumentStore::new(2);
        for delta in &sent.deltas {
            remote.apply_remote_delta(delta).unwrap();
        }
        let insert = remote.apply_local_insert(0, "XX");

        surface.set_caret(6);
        local.handle_remote_delta(&mut surface, &insert, now).unwrap();

        assert_eq!(surface.text(), "XXhello world");
        assert_eq!(surface.caret(), 8);
        assert_eq!(local.cache().load(KEY).unwrap().unwrap().text, "XXhello world");
    }

    #[test]
    fn test_own_edit_does_not_rewrite_surface() {
        let now = Instant::now();
        let mut local = reconciler(1, MemoryCache::new());
        let mut surface = TextSurface::new("");
        surface.append("hi");
        local.handle_local_edit(&mut surface, now);
        surface.append("!");
        let outbox = local.handle_local_edit(&mut surface, now);

        assert_eq!(outbox.deltas.len(), 1);
        assert_eq!(surface.rewrites(), 0);
        assert_eq!(local.suppressed_echoes(), 2);
        assert_eq!(local.document().materialize(), "hi!");
    }

    #[test]
    fn test_remote_delta_commits_pending_text_first() {
        let now = Instant::now();
        let mut local = reconciler(1, MemoryCache::new());
        let mut remote = DocumentStore::new(2);
        let mut surface = TextSurface::new("");

        surface.append("abc");
        let from_remote = remote.apply_local_insert(0, "xyz");
        let outbox = local.handle_remote_delta(&mut surface, &from_remote, now).unwrap();

        assert!(!outbox.deltas.is_empty(), "pending text was committed and broadcast");
        for delta in &outbox.deltas {
            remote.apply_remote_delta(delta).unwrap();
        }
        assert_eq!(surface.text(), local.document().materialize());
        assert_eq!(remote.materialize(), local.document().materialize());
        assert!(surface.text().contains("abc") && surface.text().contains("xyz"));
    }

    #[test]
    fn test_malformed_remote_delta_leaves_surface_alone() {
        let now = Instant::now();
        let mut local = reconciler(1, MemoryCache::new());
        let mut surface = TextSurface::new("");
        surface.append("keep");
        local.handle_local_edit(&mut surface, now);

        let garbage = Delta::from_bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(local.handle_remote_delta(&mut surface, &garbage, now).is_err());
        assert_eq!(surface.text(), "keep");
        assert_eq!(local.document().materialize(), "keep");
    }

    #[test]
    fn test_rejected_delta_keeps_pending_commit() {
        let now = Instant::now();
        let mut local = reconciler(1, MemoryCache::new());
        let mut peer = DocumentStore::new(2);
        let mut surface = TextSurface::new("");

        surface.append("abc");
        let garbage = Delta::from_bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        let rejected = local
            .handle_remote_delta(&mut surface, &garbage, now)
            .unwrap_err();
        assert_eq!(local.document().materialize(), "abc");
        assert!(!rejected.pending.deltas.is_empty());

        surface.append("d");
        let mut outbox = rejected.pending;
        outbox.extend(local.handle_local_edit(&mut surface, now));
        for delta in &outbox.deltas {
            peer.apply_remote_delta(delta).unwrap();
        }
        assert_eq!(peer.materialize(), "abcd");
    }

    #[test]
    fn test_typing_indicator_coalesces_bursts() {
        let start = Instant::now();
        let mut local = reconciler(1, MemoryCache::new());
        let mut surface = TextSurface::new("");

        let typing = |u: &PresenceUpdate| u.fields.get("typing") == Some(&serde_json::Value::Bool(true));
        let mut last = false;
        let mut toggles = 0;
        for (i, ms) in [0u64, 300, 600].into_iter().enumerate() {
            surface.append(&i.to_string());
            let outbox = local.handle_local_edit(&mut surface, start + Duration::from_millis(ms));
            for update in &outbox.presence {
                if typing(update) != last {
                    toggles += 1;
                    last = typing(update);
                }
            }
        }
        assert_eq!(toggles, 1);
        assert!(last);
        assert_eq!(local.typing_deadline(), Some(start + Duration::from_millis(1600)));

        assert!(local.poll_typing(start + Duration::from_millis(1500)).is_empty());
        let off = local.poll_typing(start + Duration::from_millis(1600));
        assert_eq!(off.presence.len(), 1);
        assert_eq!(off.presence[0].fields.get("typing"), Some(&serde_json::Value::Bool(false)));
        assert!(local.poll_typing(start + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_seed_from_cache_once() {
        let mut local = reconciler(1, MemoryCache::with_entry(KEY, "draft"));
        let mut surface = TextSurface::new("");

        let outbox = local.seed_from_cache(&mut surface);
        assert_eq!(outbox.deltas.len(), 1);
        assert_eq!(surface.text(), "draft");
        assert_eq!(local.document().materialize(), "draft");

        assert!(local.seed_from_cache(&mut surface).is_empty());
        assert_eq!(local.document().materialize(), "draft");
    }

    #[test]
    fn test_seed_skipped_when_document_has_content() {
        let now = Instant::now();
        let mut local = reconciler(1, MemoryCache::with_entry(KEY, "stale draft"));
        let mut remote = DocumentStore::new(2);
        let mut surface = TextSurface::new("");
        let existing = remote.apply_local_insert(0, "shared text");
        local.handle_remote_delta(&mut surface, &existing, now).unwrap();

        assert!(local.seed_from_cache(&mut surface).is_empty());
        assert_eq!(surface.text(), "shared text");
    }

    #[test]
    fn test_seed_skips_placeholder_and_blank() {
        for cached in ["Start here", "   "] {
            let mut local = reconciler(1, MemoryCache::with_entry(KEY, cached));
            let mut surface = TextSurface::new("");
            assert!(local.seed_from_cache(&mut surface).is_empty());
            assert!(local.document().is_empty());
        }
    }

    struct BrokenCache;

    impl TextCache for BrokenCache {
        fn load(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
            Err(StoreError::read(key, "corrupt"))
        }

        fn store(&mut self, _key: &str, _text: &str) -> Result<(), StoreError> {
            Err(StoreError::Write("read-only".into()))
        }

        fn remove(&mut self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_unreadable_cache_is_treated_as_empty() {
        let mut local = Reconciler::new(DocumentStore::new(1), Box::new(BrokenCache), None, config());
        let mut surface = TextSurface::new("");
        assert!(local.seed_from_cache(&mut surface).is_empty());

        surface.append("still works");
        let outbox = local.handle_local_edit(&mut surface, Instant::now());
        assert_eq!(outbox.deltas.len(), 1);
        assert!(outbox.presence.is_empty(), "solo sessions publish no presence");
    }

    #[test]
    fn test_apply_rewrite_replaces_command_line() {
        let now = Instant::now();
        let mut local = reconciler(1, MemoryCache::new());
        let mut surface = TextSurface::new("");
        surface.append("intro\n/rewrite this is fine");
        local.handle_local_edit(&mut surface, now);

        local.apply_rewrite(&mut surface, "this is fantastic!", now);
        assert_eq!(local.document().materialize(), "intro\nthis is fantastic!");
        assert_eq!(surface.text(), "intro\nthis is fantastic!");
    }

    #[test]
    fn test_text_surface_editing() {
        let mut surface = TextSurface::new("héllo");
        surface.type_at(1, "XY");
        assert_eq!(surface.text(), "hXYéllo");
        assert_eq!(surface.caret(), 3);
        surface.delete(0, 3);
        assert_eq!(surface.text(), "éllo");
        assert_eq!(surface.caret(), 0);
    }
}
