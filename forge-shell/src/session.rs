//! One editing session: the shared document and its editor surface, the
//! relay connection, the assistant chat, panels and the terminal pane.
//!
//! `Session` is the single owner of user-visible state. The current model
//! lives in the orchestrator's rotation, so a fallback during one prompt is
//! what the next prompt starts from.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use forge_collab::{
    room_doc_id, Binding, BufferSurface, ConnectionState, CursorPosition, DocumentError,
    DocumentStore, EditorBinding, EditorSurface, PeerInfo, RelayTransport, TextEdit,
    TransportHandle,
};
use forge_core::{
    DocMatch, DocsIndex, FallbackNotice, GenerationContext, GenerationRequest, GenerationResponse,
    ModelId, Participant, ParticipantRole, PersistenceError, RecordStore, SessionPatch,
};
use forge_gen::{AuditScope, ModelBackend, Orchestrator, OrchestratorConfig};
use uuid::Uuid;

use crate::chat::{references_note, ChatMessage, ChatTranscript, Speaker, ERROR_REPLY};
use crate::config::ShellConfig;
use crate::error::ShellError;
use crate::projects::ProjectManager;
use crate::terminal::TerminalPane;

/// Side panels. Both start hidden.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Panels {
    pub terminal: bool,
    pub projects: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromptOutcome {
    /// Blank input, or a request was already in flight.
    Ignored,
    Answered(GenerationResponse),
    Failed,
}

pub struct Session {
    config: ShellConfig,
    user: PeerInfo,
    store: Arc<dyn RecordStore>,
    record_id: Uuid,
    document: Arc<DocumentStore>,
    surface: Arc<BufferSurface>,
    binding: Binding,
    transport: Mutex<Option<TransportHandle>>,
    orchestrator: Orchestrator,
    docs: DocsIndex,
    chat: Mutex<ChatTranscript>,
    panels: Mutex<Panels>,
    terminal: Mutex<TerminalPane>,
    notices: Mutex<Vec<FallbackNotice>>,
    processing: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Holds the session's in-flight flag; released on drop, so a prompt whose
/// future is dropped mid-generation does not block the next one.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then(|| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Session {
    /// Open an offline session and file its session record.
    pub async fn open(
        config: ShellConfig,
        store: Arc<dyn RecordStore>,
        backend: Arc<dyn ModelBackend>,
    ) -> Result<Self, ShellError> {
        let user = PeerInfo::new(config.user_name.clone());
        let document = Arc::new(DocumentStore::new(room_doc_id(&config.room)));
        let surface = Arc::new(BufferSurface::new(""));
        let binding = EditorBinding::attach(surface.clone(), document.clone());

        let orchestrator = Orchestrator::new(
            backend,
            OrchestratorConfig {
                deadline: config.deadline(),
                ..Default::default()
            },
        )
        .with_audit(
            store.clone(),
            AuditScope {
                project_id: None,
                user_id: Some(user.peer_id),
            },
        );
        if !orchestrator.select_model(config.default_model) {
            log::warn!("{} is not in the rotation, keeping {}", config.default_model, orchestrator.current_model());
        }

        let record = store.create_session(None).await?;
        log::info!("Session {} opened for {} in room '{}'", record.id, user.name, config.room);

        let session = Self {
            config,
            user,
            store,
            record_id: record.id,
            document,
            surface,
            binding,
            transport: Mutex::new(None),
            orchestrator,
            docs: DocsIndex::stub(),
            chat: Mutex::new(ChatTranscript::new()),
            panels: Mutex::new(Panels::default()),
            terminal: Mutex::new(TerminalPane::new()),
            notices: Mutex::new(Vec::new()),
            processing: AtomicBool::new(false),
        };
        session.sync_record().await?;
        Ok(session)
    }

    /// Replace the documentation index prompts are searched against.
    pub fn with_docs(mut self, docs: DocsIndex) -> Self {
        self.docs = docs;
        self
    }

    /// Join the room on the configured relay. Does nothing if already
    /// connected or connecting.
    pub fn connect(&self) {
        let mut transport = lock(&self.transport);
        if transport.is_some() {
            return;
        }
        let config = forge_collab::TransportConfig {
            role: ParticipantRole::Owner,
            ..self.config.transport()
        };
        *transport = Some(RelayTransport::connect(
            config,
            self.config.relay_url.clone(),
            &self.config.room,
            self.user.clone(),
            self.document.clone(),
        ));
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.transport)
            .as_ref()
            .map(|t| t.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Hand a prompt to the assistant. Matching documentation is noted in
    /// the chat and sent along as context. On success the generated code
    /// replaces the editor contents.
    pub async fn submit_prompt(&self, prompt: &str) -> PromptOutcome {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return PromptOutcome::Ignored;
        }
        let Some(in_flight) = InFlight::claim(&self.processing) else {
            log::debug!("prompt ignored while a request is in flight");
            return PromptOutcome::Ignored;
        };

        lock(&self.chat).push(Speaker::User, prompt);
        let mut context = GenerationContext::single_file(&self.config.context_path, self.document.snapshot())
            .with_language(&self.config.language);
        let references = self.docs.search_default(prompt);
        if !references.is_empty() {
            log::debug!("{} docs match the prompt", references.len());
            let note = references_note(references.iter().map(|doc| doc.title.as_str()));
            lock(&self.chat).push(Speaker::Assistant, note);
            for doc in references {
                context = context.with_file(format!("docs/{}", doc.title), doc.content);
            }
        }
        let request = GenerationRequest::new(prompt, self.orchestrator.current_model()).with_context(context);

        let outcome = match self.orchestrator.generate(request).await {
            Ok(response) => {
                for notice in &response.fallbacks {
                    log::info!("Switched to {} after {} missed its deadline", notice.to, notice.from);
                }
                lock(&self.notices).extend(response.fallbacks.iter().copied());
                lock(&self.chat).push(Speaker::Assistant, response.transcript_text());
                if let Err(e) = self.write_code(&response.code) {
                    log::warn!("Generated code not written to the editor: {e}");
                }
                PromptOutcome::Answered(response)
            }
            Err(e) => {
                log::warn!("Generation failed: {e}");
                lock(&self.chat).push(Speaker::Assistant, ERROR_REPLY);
                PromptOutcome::Failed
            }
        };
        drop(in_flight);

        if let Err(e) = self.sync_record().await {
            log::warn!("Session record {} not updated: {e}", self.record_id);
        }
        outcome
    }

    /// Replace the editor contents with `code` as one range edit.
    pub fn write_code(&self, code: &str) -> Result<(), DocumentError> {
        match TextEdit::between(&self.surface.text(), code) {
            Some(edit) => self.surface.type_edit(edit),
            None => Ok(()),
        }
    }

    /// User typing into the editor.
    pub fn edit(&self, edit: TextEdit) -> Result<(), DocumentError> {
        self.surface.type_edit(edit)
    }

    /// Move the local caret to a byte offset in the editor text.
    pub fn move_cursor(&self, offset: usize) {
        let position = CursorPosition::from_offset(&self.surface.text(), offset);
        if let Some(transport) = lock(&self.transport).as_ref() {
            if let Err(e) = transport.update_cursor(position) {
                log::debug!("cursor not shared: {e}");
            }
        }
    }

    pub fn editor_text(&self) -> String {
        self.surface.text()
    }

    pub fn document(&self) -> &Arc<DocumentStore> {
        &self.document
    }

    pub fn user(&self) -> &PeerInfo {
        &self.user
    }

    pub fn record_id(&self) -> Uuid {
        self.record_id
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    pub fn chat(&self) -> Vec<ChatMessage> {
        lock(&self.chat).messages().to_vec()
    }

    pub fn current_model(&self) -> ModelId {
        self.orchestrator.current_model()
    }

    pub fn select_model(&self, model: ModelId) -> bool {
        self.orchestrator.select_model(model)
    }

    /// Model switches caused by missed deadlines, oldest first.
    pub fn model_notices(&self) -> Vec<FallbackNotice> {
        lock(&self.notices).clone()
    }

    pub fn panels(&self) -> Panels {
        *lock(&self.panels)
    }

    /// Returns whether the terminal panel is now visible.
    pub fn toggle_terminal(&self) -> bool {
        let mut panels = lock(&self.panels);
        panels.terminal = !panels.terminal;
        panels.terminal
    }

    pub fn toggle_projects(&self) -> bool {
        let mut panels = lock(&self.panels);
        panels.projects = !panels.projects;
        panels.projects
    }

    pub fn terminal_input(&self, bytes: &[u8]) -> String {
        lock(&self.terminal).input(bytes)
    }

    pub fn terminal_screen(&self) -> String {
        lock(&self.terminal).screen().to_string()
    }

    pub fn projects(&self) -> ProjectManager {
        ProjectManager::new(self.store.clone(), self.user.peer_id)
    }

    pub fn search_docs(&self, query: &str) -> Vec<DocMatch> {
        self.docs.search_default(query)
    }

    /// Everyone in the room, this user first.
    pub fn participants(&self) -> Vec<Participant> {
        let mut participants = vec![Participant {
            id: self.user.peer_id,
            name: self.user.name.clone(),
            role: ParticipantRole::Owner,
            cursor: None,
        }];
        if let Some(transport) = lock(&self.transport).as_ref() {
            participants.extend(transport.peers().into_iter().map(|p| Participant {
                id: p.user_id,
                name: p.user_name,
                role: p.role,
                cursor: p.cursor.map(Into::into),
            }));
        }
        participants
    }

    /// Write participants, active file and chat to the session record.
    pub async fn sync_record(&self) -> Result<(), PersistenceError> {
        let patch = SessionPatch {
            participants: Some(self.participants()),
            active_file: Some(Some(self.config.context_path.clone())),
            chat: Some(lock(&self.chat).to_entries(self.user.peer_id)),
            ended_at: None,
        };
        self.store.update_session(self.record_id, patch).await?;
        Ok(())
    }

    /// Leave the room, release the editor binding and close the record.
    pub async fn close(self) -> Result<(), ShellError> {
        let transport = lock(&self.transport).take();
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
        self.binding.detach();

        let patch = SessionPatch {
            ended_at: Some(Utc::now()),
            ..Default::default()
        };
        self.store.update_session(self.record_id, patch).await?;
        log::info!("Session {} closed", self.record_id);
        Ok(())
    }
}
