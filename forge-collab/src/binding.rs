//! Binds a visible text surface to a [`DocumentStore`].
//!
//! Local surface edits become `apply_local` calls; document changes from
//! anyone else become range edits on the surface. Every edit the binding
//! writes into the surface carries the binding's [`OriginTag`], and every
//! local document change carries it too, so both directions can drop the
//! binding's own echoes without comparing text.
//!
//! The surface and the store are expected to be driven from one logical
//! thread, as an editor UI loop would.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::document::{ChangeOrigin, DocumentError, DocumentStore, OriginTag, Subscription, TextEdit};

pub type SurfaceSubscriptionId = u64;

/// An edit observed on a surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceEdit {
    pub edit: TextEdit,
    /// `None` for user input; `Some` for edits applied programmatically.
    pub origin: Option<OriginTag>,
}

pub type EditHandler = Arc<dyn Fn(&SurfaceEdit) + Send + Sync>;

/// A text editing surface (the visible editor).
pub trait EditorSurface: Send + Sync {
    fn text(&self) -> String;

    /// Apply an edit programmatically. Edit handlers see it tagged with
    /// `origin`.
    fn apply_edit(&self, edit: &TextEdit, origin: Option<OriginTag>) -> Result<(), DocumentError>;

    fn subscribe_edits(&self, handler: EditHandler) -> SurfaceSubscriptionId;

    fn unsubscribe_edits(&self, id: SurfaceSubscriptionId);
}

pub struct EditorBinding;

impl EditorBinding {
    /// Bind `surface` to `document`. The surface is first brought in line
    /// with the document's current text.
    pub fn attach(surface: Arc<dyn EditorSurface>, document: Arc<DocumentStore>) -> Binding {
        let source = OriginTag::fresh_source();
        let seq = Arc::new(AtomicU64::new(0));

        let next_tag = {
            let seq = seq.clone();
            move || OriginTag::new(source, seq.fetch_add(1, Ordering::Relaxed) + 1)
        };

        resync_surface(surface.as_ref(), &document, next_tag());

        // Surface → document.
        let surface_sub = {
            let document = document.clone();
            let next_tag = next_tag.clone();
            surface.subscribe_edits(Arc::new(move |ev: &SurfaceEdit| {
                if ev.origin.is_some_and(|o| o.source == source) {
                    return;
                }
                if let Err(e) = document.apply_local(ev.edit.clone(), next_tag()) {
                    log::warn!("binding {source}: local edit not recorded: {e}");
                }
            }))
        };

        // Document → surface.
        let doc_sub = {
            let surface = surface.clone();
            let weak_doc = Arc::downgrade(&document);
            document.subscribe(move |change| {
                if let ChangeOrigin::Local { tag, .. } = &change.origin {
                    if tag.source == source {
                        return;
                    }
                }
                if let Err(e) = surface.apply_edit(&change.edit, Some(next_tag())) {
                    log::warn!("binding {source}: surface out of step ({e}), resyncing");
                    if let Some(document) = weak_doc.upgrade() {
                        resync_surface(surface.as_ref(), &document, next_tag());
                    }
                }
            })
        };

        log::debug!("binding {source} attached to doc {}", document.doc_id());
        Binding {
            source,
            surface,
            surface_sub: Mutex::new(Some(surface_sub)),
            doc_sub: Mutex::new(Some(doc_sub)),
        }
    }
}

/// Replace whatever differs between the surface and the document.
fn resync_surface(surface: &dyn EditorSurface, document: &DocumentStore, tag: OriginTag) {
    if let Some(edit) = TextEdit::between(&surface.text(), &document.snapshot()) {
        if let Err(e) = surface.apply_edit(&edit, Some(tag)) {
            log::warn!("surface resync failed: {e}");
        }
    }
}

/// Live binding. Detaches on drop.
pub struct Binding {
    source: u64,
    surface: Arc<dyn EditorSurface>,
    surface_sub: Mutex<Option<SurfaceSubscriptionId>>,
    doc_sub: Mutex<Option<Subscription>>,
}

impl Binding {
    /// Writer id carried by this binding's edits.
    pub fn source(&self) -> u64 {
        self.source
    }

    pub fn is_attached(&self) -> bool {
        self.doc_sub.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Release both subscriptions. Safe to call more than once.
    pub fn detach(&self) {
        if let Ok(mut sub) = self.surface_sub.lock() {
            if let Some(id) = sub.take() {
                self.surface.unsubscribe_edits(id);
            }
        }
        if let Ok(mut sub) = self.doc_sub.lock() {
            if sub.take().is_some() {
                log::debug!("binding {} detached", self.source);
            }
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.detach();
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory surface
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct BufferInner {
    text: String,
    handlers: Vec<(SurfaceSubscriptionId, EditHandler)>,
    next_id: SurfaceSubscriptionId,
    history: Vec<TextEdit>,
}

/// Plain string surface for headless sessions and tests. Keeps every
/// applied edit so callers can inspect (or undo) them.
#[derive(Default)]
pub struct BufferSurface {
    inner: Mutex<BufferInner>,
}

impl BufferSurface {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                text: text.into(),
                ..Default::default()
            }),
        }
    }

    /// A user edit (no origin), as if typed.
    pub fn type_edit(&self, edit: TextEdit) -> Result<(), DocumentError> {
        self.apply_edit(&edit, None)
    }

    /// Edits applied so far, oldest first.
    pub fn history(&self) -> Vec<TextEdit> {
        self.inner.lock().map(|i| i.history.clone()).unwrap_or_default()
    }

    pub fn handler_count(&self) -> usize {
        self.inner.lock().map(|i| i.handlers.len()).unwrap_or(0)
    }
}

impl EditorSurface for BufferSurface {
    fn text(&self) -> String {
        self.inner.lock().map(|i| i.text.clone()).unwrap_or_default()
    }

    fn apply_edit(&self, edit: &TextEdit, origin: Option<OriginTag>) -> Result<(), DocumentError> {
        let handlers: Vec<EditHandler> = {
            let mut inner = self.inner.lock().map_err(|_| DocumentError::Poisoned)?;
            edit.validate(&inner.text)?;
            edit.apply_to(&mut inner.text);
            inner.history.push(edit.clone());
            inner.handlers.iter().map(|(_, h)| h.clone()).collect()
        };

        let event = SurfaceEdit {
            edit: edit.clone(),
            origin,
        };
        for handler in handlers {
            handler(&event);
        }
        Ok(())
    }

    fn subscribe_edits(&self, handler: EditHandler) -> SurfaceSubscriptionId {
        match self.inner.lock() {
            Ok(mut inner) => {
                inner.next_id += 1;
                let id = inner.next_id;
                inner.handlers.push((id, handler));
                id
            }
            Err(_) => 0,
        }
    }

    fn unsubscribe_edits(&self, id: SurfaceSubscriptionId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.handlers.retain(|(h, _)| *h != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn doc() -> Arc<DocumentStore> {
        Arc::new(DocumentStore::new(Uuid::new_v4()))
    }

    #[test]
    fn test_attach_loads_document_text() {
        let document = doc();
        document
            .apply_local(TextEdit::insert(0, "let x = 1;"), OriginTag::anonymous())
            .unwrap();
        let surface = Arc::new(BufferSurface::new(""));
        let _binding = EditorBinding::attach(surface.clone(), document.clone());
        assert_eq!(surface.text(), "let x = 1;");
    }

    #[test]
    fn test_typing_reaches_document_once() {
        let document = doc();
        let surface = Arc::new(BufferSurface::new(""));
        let _binding = EditorBinding::attach(surface.clone(), document.clone());

        surface.type_edit(TextEdit::insert(0, "hello")).unwrap();
        surface.type_edit(TextEdit::insert(5, " world")).unwrap();

        assert_eq!(document.snapshot(), "hello world");
        assert_eq!(surface.text(), "hello world");
        // Exactly one document update per keystroke batch: no echo loop.
        assert_eq!(document.pending_updates().len(), 2);
        assert_eq!(surface.history().len(), 2);
    }

    #[test]
    fn test_remote_change_written_as_range_edit() {
        let document = doc();
        let peer = doc();
        let base = peer
            .apply_local(TextEdit::insert(0, "fn main() {}"), OriginTag::anonymous())
            .unwrap();
        document.apply_remote(&base.update).unwrap();

        let surface = Arc::new(BufferSurface::new(""));
        let _binding = EditorBinding::attach(surface.clone(), document.clone());

        let edit = peer
            .apply_local(TextEdit::insert(11, "run();"), OriginTag::anonymous())
            .unwrap();
        document.apply_remote(&edit.update).unwrap();

        assert_eq!(surface.text(), "fn main() {run();}");
        assert_eq!(surface.history().last(), Some(&TextEdit::insert(11, "run();")));
        // The remote edit did not bounce back as a local update.
        assert!(document.pending_updates().is_empty());
    }

    #[test]
    fn test_two_bindings_share_document() {
        let document = doc();
        let left = Arc::new(BufferSurface::new(""));
        let right = Arc::new(BufferSurface::new(""));
        let _a = EditorBinding::attach(left.clone(), document.clone());
        let _b = EditorBinding::attach(right.clone(), document.clone());

        left.type_edit(TextEdit::insert(0, "abc")).unwrap();
        right.type_edit(TextEdit::delete(1, 1)).unwrap();

        assert_eq!(document.snapshot(), "ac");
        assert_eq!(left.text(), "ac");
        assert_eq!(right.text(), "ac");
    }

    #[test]
    fn test_detach_is_idempotent_and_releases() {
        let document = doc();
        let surface = Arc::new(BufferSurface::new(""));
        let binding = EditorBinding::attach(surface.clone(), document.clone());
        assert_eq!(document.listener_count(), 1);
        assert_eq!(surface.handler_count(), 1);

        binding.detach();
        binding.detach();
        assert!(!binding.is_attached());
        assert_eq!(document.listener_count(), 0);
        assert_eq!(surface.handler_count(), 0);

        surface.type_edit(TextEdit::insert(0, "detached")).unwrap();
        assert_eq!(document.snapshot(), "");
    }

    #[test]
    fn test_drop_detaches() {
        let document = doc();
        let surface = Arc::new(BufferSurface::new(""));
        {
            let _binding = EditorBinding::attach(surface.clone(), document.clone());
        }
        assert_eq!(document.listener_count(), 0);
        assert_eq!(surface.handler_count(), 0);
    }
}
